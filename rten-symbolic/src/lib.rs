//! Symbolic integer expressions used to describe dynamic dimension sizes.
//!
//! [`SymExpr`] represents a dimension size which may be a known value, a named
//! [`Symbol`] or an arithmetic combination of these. [`ValueRange`] describes
//! the inclusive range of values a symbol or expression may take.

mod sym_expr;
mod sym_gen;
mod value_range;

pub use sym_expr::{div_floor, EvalError, SymExpr, Symbol, SymbolMap};
pub use sym_gen::SymbolGen;
pub use value_range::{ValueRange, INT_OO, NEG_INT_OO};
