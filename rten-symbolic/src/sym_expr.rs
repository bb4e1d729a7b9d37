//! Symbolic expressions representing dimension sizes.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Rem, Sub};
use std::sync::Arc;

use crate::value_range::ValueRange;

/// A named variable.
///
/// The variable may carry assumptions about its value, such as being >= 0.
///
/// Two symbols are equal if they have the same name.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Symbol {
    pub name: String,

    // True if this value is assumed to be >= 0.
    pub positive: bool,
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Symbol) -> bool {
        self.name == other.name
    }
}

impl Eq for Symbol {}

/// Symbolic expression representing an integer value.
///
/// Expressions can be known integer values, named symbols or composite
/// expressions.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SymExpr {
    /// Element with a known integer value.
    Value(i64),
    /// Symbolic value
    Var(Arc<Symbol>),
    /// Addition of two symbolic values
    Add(Arc<SymExpr>, Arc<SymExpr>),
    /// Subtraction of two symbolic values
    Sub(Arc<SymExpr>, Arc<SymExpr>),
    /// Multiplication of two symbolic values
    Mul(Arc<SymExpr>, Arc<SymExpr>),
    /// Flooring division of first expression by second.
    Div(Arc<SymExpr>, Arc<SymExpr>),
    /// Remainder of flooring division.
    Mod(Arc<SymExpr>, Arc<SymExpr>),
    /// Maximum of two symbolic values
    Max(Arc<SymExpr>, Arc<SymExpr>),
    /// Minimum of two symbolic values
    Min(Arc<SymExpr>, Arc<SymExpr>),
    /// Negation of a value
    Neg(Arc<SymExpr>),
}

/// Errors when evaluating an expression with [`SymExpr::eval`].
#[derive(Clone, Debug, PartialEq)]
pub enum EvalError {
    /// The expression references a symbol with no bound value.
    UnboundSymbol(String),
    /// The expression divides by zero.
    DivisionByZero,
    /// The result does not fit in an `i64`.
    Overflow,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnboundSymbol(name) => write!(f, "symbol \"{}\" has no value", name),
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::Overflow => write!(f, "integer overflow"),
        }
    }
}

impl std::error::Error for EvalError {}

/// Lookup of values for symbols when evaluating an expression.
pub trait SymbolMap {
    fn get_value(&self, name: &str) -> Option<i64>;
}

impl<F: Fn(&str) -> Option<i64>> SymbolMap for F {
    fn get_value(&self, name: &str) -> Option<i64> {
        self(name)
    }
}

impl<S: std::hash::BuildHasher> SymbolMap for std::collections::HashMap<String, i64, S> {
    fn get_value(&self, name: &str) -> Option<i64> {
        self.get(name).copied()
    }
}

impl SymExpr {
    /// Return true if the value of this expression is known to be >= 0.
    pub fn is_positive(&self) -> bool {
        match self {
            Self::Value(x) => *x >= 0,
            Self::Var(sym) => sym.positive,
            Self::Neg(_expr) => false,
            Self::Add(lhs, rhs) => lhs.is_positive() && rhs.is_positive(),
            Self::Sub(_lhs, _rhs) => false,
            Self::Mul(lhs, rhs) => lhs.is_positive() && rhs.is_positive(),
            Self::Div(lhs, rhs) | Self::Mod(lhs, rhs) => lhs.is_positive() && rhs.is_positive(),
            Self::Max(lhs, rhs) => lhs.is_positive() || rhs.is_positive(),
            Self::Min(lhs, rhs) => lhs.is_positive() && rhs.is_positive(),
        }
    }

    /// Return the range of values this expression may take, given the ranges
    /// of its symbols.
    pub fn bounds(&self, var_range: &impl Fn(&Symbol) -> ValueRange) -> ValueRange {
        match self {
            Self::Value(x) => ValueRange::exact(*x),
            Self::Var(sym) => var_range(sym),
            Self::Neg(x) => x.bounds(var_range).neg(),
            Self::Add(lhs, rhs) => lhs.bounds(var_range).add(&rhs.bounds(var_range)),
            Self::Sub(lhs, rhs) => lhs.bounds(var_range).add(&rhs.bounds(var_range).neg()),
            Self::Mul(lhs, rhs) => lhs.bounds(var_range).mul(&rhs.bounds(var_range)),
            Self::Div(lhs, rhs) => lhs.bounds(var_range).floor_div(&rhs.bounds(var_range)),
            Self::Mod(_, rhs) => {
                let rhs = rhs.bounds(var_range);
                if rhs.lower > 0 {
                    ValueRange::new(0, rhs.upper.saturating_sub(1))
                } else {
                    ValueRange::unbounded()
                }
            }
            Self::Max(lhs, rhs) => {
                let (lhs, rhs) = (lhs.bounds(var_range), rhs.bounds(var_range));
                ValueRange::new(lhs.lower.max(rhs.lower), lhs.upper.max(rhs.upper))
            }
            Self::Min(lhs, rhs) => {
                let (lhs, rhs) = (lhs.bounds(var_range), rhs.bounds(var_range));
                ValueRange::new(lhs.lower.min(rhs.lower), lhs.upper.min(rhs.upper))
            }
        }
    }

    /// Return the maximum of `self` and `other`.
    pub fn max(&self, other: &SymExpr) -> SymExpr {
        Self::Max(self.clone().into(), other.clone().into())
    }

    /// Return the minimum of `self` and `other`.
    pub fn min(&self, other: &SymExpr) -> SymExpr {
        Self::Min(self.clone().into(), other.clone().into())
    }

    fn is_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    /// Return the value of this expression if it is a constant.
    pub fn as_value(&self) -> Option<i64> {
        match self {
            Self::Value(x) => Some(*x),
            _ => None,
        }
    }

    /// Return the symbol if this expression is a single variable.
    pub fn as_symbol(&self) -> Option<&Arc<Symbol>> {
        match self {
            Self::Var(sym) => Some(sym),
            _ => None,
        }
    }

    /// Return the symbols referenced by this expression, in order of first
    /// appearance.
    pub fn free_symbols(&self) -> Vec<Arc<Symbol>> {
        fn visit(expr: &SymExpr, syms: &mut Vec<Arc<Symbol>>) {
            match expr {
                SymExpr::Value(_) => {}
                SymExpr::Var(sym) => {
                    if !syms.iter().any(|s| s.name == sym.name) {
                        syms.push(sym.clone());
                    }
                }
                SymExpr::Neg(x) => visit(x, syms),
                SymExpr::Add(lhs, rhs)
                | SymExpr::Sub(lhs, rhs)
                | SymExpr::Mul(lhs, rhs)
                | SymExpr::Div(lhs, rhs)
                | SymExpr::Mod(lhs, rhs)
                | SymExpr::Max(lhs, rhs)
                | SymExpr::Min(lhs, rhs) => {
                    visit(lhs, syms);
                    visit(rhs, syms);
                }
            }
        }
        let mut syms = Vec::new();
        visit(self, &mut syms);
        syms
    }

    /// Replace symbols for which `replace` returns `Some`.
    ///
    /// The result is not simplified.
    pub fn subst(&self, replace: &impl Fn(&Symbol) -> Option<SymExpr>) -> SymExpr {
        let binop = |lhs: &SymExpr, rhs: &SymExpr| -> (Arc<SymExpr>, Arc<SymExpr>) {
            (lhs.subst(replace).into(), rhs.subst(replace).into())
        };
        match self {
            Self::Value(_) => self.clone(),
            Self::Var(sym) => replace(sym).unwrap_or_else(|| self.clone()),
            Self::Neg(x) => Self::Neg(x.subst(replace).into()),
            Self::Add(lhs, rhs) => {
                let (l, r) = binop(lhs, rhs);
                Self::Add(l, r)
            }
            Self::Sub(lhs, rhs) => {
                let (l, r) = binop(lhs, rhs);
                Self::Sub(l, r)
            }
            Self::Mul(lhs, rhs) => {
                let (l, r) = binop(lhs, rhs);
                Self::Mul(l, r)
            }
            Self::Div(lhs, rhs) => {
                let (l, r) = binop(lhs, rhs);
                Self::Div(l, r)
            }
            Self::Mod(lhs, rhs) => {
                let (l, r) = binop(lhs, rhs);
                Self::Mod(l, r)
            }
            Self::Max(lhs, rhs) => {
                let (l, r) = binop(lhs, rhs);
                Self::Max(l, r)
            }
            Self::Min(lhs, rhs) => {
                let (l, r) = binop(lhs, rhs);
                Self::Min(l, r)
            }
        }
    }

    /// Evaluate the expression using values for symbols from `symbols`.
    pub fn eval(&self, symbols: &impl SymbolMap) -> Result<i64, EvalError> {
        let eval_pair = |lhs: &SymExpr, rhs: &SymExpr| -> Result<(i64, i64), EvalError> {
            Ok((lhs.eval(symbols)?, rhs.eval(symbols)?))
        };
        match self {
            Self::Value(x) => Ok(*x),
            Self::Var(sym) => symbols
                .get_value(&sym.name)
                .ok_or_else(|| EvalError::UnboundSymbol(sym.name.clone())),
            Self::Neg(x) => x.eval(symbols)?.checked_neg().ok_or(EvalError::Overflow),
            Self::Add(lhs, rhs) => {
                let (l, r) = eval_pair(lhs, rhs)?;
                l.checked_add(r).ok_or(EvalError::Overflow)
            }
            Self::Sub(lhs, rhs) => {
                let (l, r) = eval_pair(lhs, rhs)?;
                l.checked_sub(r).ok_or(EvalError::Overflow)
            }
            Self::Mul(lhs, rhs) => {
                let (l, r) = eval_pair(lhs, rhs)?;
                l.checked_mul(r).ok_or(EvalError::Overflow)
            }
            Self::Div(lhs, rhs) => {
                let (l, r) = eval_pair(lhs, rhs)?;
                if r == 0 {
                    return Err(EvalError::DivisionByZero);
                }
                Ok(div_floor(l, r))
            }
            Self::Mod(lhs, rhs) => {
                let (l, r) = eval_pair(lhs, rhs)?;
                if r == 0 {
                    return Err(EvalError::DivisionByZero);
                }
                Ok(l - div_floor(l, r) * r)
            }
            Self::Max(lhs, rhs) => {
                let (l, r) = eval_pair(lhs, rhs)?;
                Ok(l.max(r))
            }
            Self::Min(lhs, rhs) => {
                let (l, r) = eval_pair(lhs, rhs)?;
                Ok(l.min(r))
            }
        }
    }

    // Re-order and re-associate operands of commutative and associative
    // operations so that constants are on the left or "canonical order".
    //
    // For example `Mul(Mul(a, 2), Mul(b, 3))` becomes
    // `Mul(Mul(2, 3), Mul(a, b))`.
    fn canonicalize(&self) -> SymExpr {
        fn collect_terms(
            terms: &mut Vec<SymExpr>,
            term: &SymExpr,
            extract_lhs_rhs: &impl Fn(&SymExpr) -> Option<(&Arc<SymExpr>, &Arc<SymExpr>)>,
        ) {
            if let Some((lhs, rhs)) = extract_lhs_rhs(term) {
                collect_terms(terms, lhs, extract_lhs_rhs);
                collect_terms(terms, rhs, extract_lhs_rhs);
            } else {
                terms.push(term.canonicalize());
            }
        }

        // Collect the terms of a nested associative expression, sort them,
        // drop redundant terms and fold the rest back into one expression.
        fn reassociate_terms(
            term: &SymExpr,
            extract_terms: &impl Fn(&SymExpr) -> Option<(&Arc<SymExpr>, &Arc<SymExpr>)>,
            simplify: impl Fn(Vec<SymExpr>) -> Vec<SymExpr>,
            default: SymExpr,
            reduce: impl Fn(SymExpr, SymExpr) -> SymExpr,
        ) -> SymExpr {
            let mut terms = Vec::new();
            collect_terms(&mut terms, term, extract_terms);
            terms.sort_by(cmp_values_first);
            let terms = simplify(terms);
            terms.into_iter().reduce(reduce).unwrap_or(default)
        }

        // max(x, max(x, y)) => max(x, y)
        let remove_adjacent_equal_terms = |mut terms: Vec<SymExpr>| {
            let mut idx = 0;
            while idx < terms.len().saturating_sub(1) {
                if terms[idx] == terms[idx + 1] {
                    terms.remove(idx);
                } else {
                    idx += 1;
                }
            }
            terms
        };

        match self {
            Self::Value(_) | Self::Var(_) => self.clone(),
            Self::Neg(expr) => Self::Neg(expr.canonicalize().into()),
            Self::Mul(..) => reassociate_terms(
                self,
                &|term| match term {
                    Self::Mul(lhs, rhs) => Some((lhs, rhs)),
                    _ => None,
                },
                |terms| terms,
                SymExpr::Value(1),
                |prod, x| prod * x,
            ),
            Self::Add(..) => {
                let remove_opposite_terms = |mut terms: Vec<SymExpr>| {
                    let mut i = 0;
                    while i < terms.len() {
                        let opposite = (i + 1..terms.len())
                            .find(|&j| terms[i].is_negation_of(&terms[j]));
                        if let Some(j) = opposite {
                            terms.remove(j);
                            terms.remove(i);
                        } else {
                            i += 1;
                        }
                    }
                    terms
                };

                reassociate_terms(
                    self,
                    &|term| match term {
                        Self::Add(lhs, rhs) => Some((lhs, rhs)),
                        _ => None,
                    },
                    remove_opposite_terms,
                    SymExpr::Value(0),
                    |sum, x| sum + x,
                )
            }
            Self::Max(..) => reassociate_terms(
                self,
                &|term| match term {
                    Self::Max(lhs, rhs) => Some((lhs, rhs)),
                    _ => None,
                },
                remove_adjacent_equal_terms,
                SymExpr::Value(i64::MIN),
                |max, x| max.max(&x),
            ),
            Self::Min(..) => reassociate_terms(
                self,
                &|term| match term {
                    Self::Min(lhs, rhs) => Some((lhs, rhs)),
                    _ => None,
                },
                remove_adjacent_equal_terms,
                SymExpr::Value(i64::MAX),
                |min, x| min.min(&x),
            ),
            Self::Sub(lhs, rhs) => {
                // `x - y` => `x + (-y)`, so opposite terms can cancel.
                let lhs = lhs.canonicalize();
                let rhs = rhs.canonicalize();
                Self::Add(lhs.into(), (-rhs).into()).canonicalize()
            }
            Self::Div(lhs, rhs) => Self::Div(lhs.canonicalize().into(), rhs.canonicalize().into()),
            Self::Mod(lhs, rhs) => Self::Mod(lhs.canonicalize().into(), rhs.canonicalize().into()),
        }
    }

    /// Simplify an expression.
    ///
    /// This folds constants and removes identities (eg. `x + 0` becomes `x`).
    pub fn simplify(&self) -> SymExpr {
        self.canonicalize().simplify_canonical()
    }

    fn simplify_canonical(self) -> SymExpr {
        match self {
            Self::Value(_) | Self::Var(_) => self,
            Self::Neg(expr) => match Arc::unwrap_or_clone(expr).simplify_canonical() {
                SymExpr::Value(x) => SymExpr::Value(-x),
                SymExpr::Neg(x) => Arc::unwrap_or_clone(x),
                expr => Self::Neg(expr.into()),
            },
            Self::Add(lhs, rhs) => {
                let lhs = Arc::unwrap_or_clone(lhs).simplify_canonical();
                let rhs = Arc::unwrap_or_clone(rhs).simplify_canonical();

                match (lhs, rhs) {
                    (SymExpr::Value(0), rhs) => rhs,
                    (lhs, SymExpr::Value(0)) => lhs,
                    (SymExpr::Value(x), SymExpr::Value(y)) => SymExpr::Value(x + y),
                    // (c1 + x) + c2 => (c1 + c2) + x
                    (SymExpr::Add(a, b), SymExpr::Value(y)) if a.is_value() => {
                        let x = a.as_value().unwrap_or(0);
                        (SymExpr::Value(x + y) + Arc::unwrap_or_clone(b)).simplify_canonical()
                    }
                    (lhs, SymExpr::Neg(rhs)) if lhs == *rhs => SymExpr::Value(0),
                    (lhs, rhs) => lhs + rhs,
                }
            }
            Self::Sub(lhs, rhs) => {
                let lhs = Arc::unwrap_or_clone(lhs).simplify_canonical();
                let rhs = Arc::unwrap_or_clone(rhs).simplify_canonical();

                match (lhs, rhs) {
                    (lhs, SymExpr::Value(0)) => lhs,
                    (SymExpr::Value(x), SymExpr::Value(y)) => SymExpr::Value(x - y),
                    (lhs, rhs) if lhs == rhs => SymExpr::Value(0),
                    (lhs, rhs) => lhs - rhs,
                }
            }
            Self::Mul(lhs, rhs) => {
                let lhs = Arc::unwrap_or_clone(lhs).simplify_canonical();
                let rhs = Arc::unwrap_or_clone(rhs).simplify_canonical();

                match (lhs, rhs) {
                    (SymExpr::Value(0), _) | (_, SymExpr::Value(0)) => SymExpr::Value(0),
                    (SymExpr::Value(1), rhs) => rhs,
                    (lhs, SymExpr::Value(1)) => lhs,
                    (SymExpr::Value(x), SymExpr::Value(y)) => SymExpr::Value(x * y),
                    (lhs, rhs) => lhs * rhs,
                }
            }
            Self::Div(lhs, rhs) => {
                let lhs = Arc::unwrap_or_clone(lhs).simplify_canonical();
                let rhs = Arc::unwrap_or_clone(rhs).simplify_canonical();
                let (lhs, rhs) = remove_common_factors(lhs, rhs);

                match (lhs, rhs) {
                    (lhs, SymExpr::Value(1)) => lhs,
                    (SymExpr::Value(x), SymExpr::Value(y)) if y != 0 => {
                        SymExpr::Value(div_floor(x, y))
                    }
                    // x / b / c => x / (b * c)
                    (SymExpr::Div(lhs, c1), c2) => match (&*c1, c2) {
                        (SymExpr::Value(c1), SymExpr::Value(c2)) if *c1 > 0 && c2 > 0 => {
                            (*lhs).clone() / SymExpr::Value(c1 * c2)
                        }
                        (c1, c2) => (*lhs).clone() / (c1.clone() * c2),
                    },
                    (lhs, rhs) => lhs / rhs,
                }
            }
            Self::Mod(lhs, rhs) => {
                let lhs = Arc::unwrap_or_clone(lhs).simplify_canonical();
                let rhs = Arc::unwrap_or_clone(rhs).simplify_canonical();

                match (lhs, rhs) {
                    (_, SymExpr::Value(1)) => SymExpr::Value(0),
                    (SymExpr::Value(x), SymExpr::Value(y)) if y != 0 => {
                        SymExpr::Value(x - div_floor(x, y) * y)
                    }
                    (lhs, rhs) if lhs == rhs => SymExpr::Value(0),
                    (lhs, rhs) => lhs % rhs,
                }
            }
            Self::Max(lhs, rhs) => {
                let lhs = Arc::unwrap_or_clone(lhs).simplify_canonical();
                let rhs = Arc::unwrap_or_clone(rhs).simplify_canonical();

                if lhs == rhs {
                    lhs
                } else {
                    match (lhs, rhs) {
                        (SymExpr::Value(x), SymExpr::Value(y)) => SymExpr::Value(x.max(y)),
                        (lhs, rhs) => Self::Max(lhs.into(), rhs.into()),
                    }
                }
            }
            Self::Min(lhs, rhs) => {
                let lhs = Arc::unwrap_or_clone(lhs).simplify_canonical();
                let rhs = Arc::unwrap_or_clone(rhs).simplify_canonical();

                if lhs == rhs {
                    lhs
                } else {
                    match (lhs, rhs) {
                        (SymExpr::Value(x), SymExpr::Value(y)) => SymExpr::Value(x.min(y)),
                        (lhs, rhs) => Self::Min(lhs.into(), rhs.into()),
                    }
                }
            }
        }
    }

    /// Return the precedence of the operator.
    ///
    /// This is used to add parentheses when formatting an expression tree.
    fn precedence(&self) -> u8 {
        match self {
            Self::Value(_) | Self::Var(_) | Self::Max(..) | Self::Min(..) => 4,
            Self::Div(..) | Self::Mod(..) => 3,
            Self::Mul(..) => 2,
            Self::Add(..) => 1,
            Self::Sub(..) | Self::Neg(_) => 0,
        }
    }

    /// Create a named symbol, with no assumptions about the value.
    pub fn var(name: &str) -> Self {
        SymExpr::Var(
            Symbol {
                name: name.to_string(),
                positive: false,
            }
            .into(),
        )
    }

    /// Create a named symbol representing a positive value (ie. `>= 0`).
    pub fn pos_var(name: &str) -> Self {
        SymExpr::Var(
            Symbol {
                name: name.to_string(),
                positive: true,
            }
            .into(),
        )
    }

    /// Return the name of the symbol in a unary expression.
    ///
    /// Returns `None` if the expression is not unary or has a fixed value.
    fn name(&self) -> Option<&str> {
        match self {
            SymExpr::Var(sym) => Some(&sym.name),
            SymExpr::Neg(x) => x.name(),
            _ => None,
        }
    }

    /// Return true if `self` and `other` are negations of each other, meaning
    /// that adding the two terms together will produce zero.
    fn is_negation_of(&self, other: &SymExpr) -> bool {
        match (self, other) {
            (SymExpr::Value(x), SymExpr::Value(y)) => *x == -*y && *x != 0,
            (x, SymExpr::Neg(y)) if *x == **y => true,
            (SymExpr::Neg(x), y) if **x == *y => true,
            _ => false,
        }
    }
}

/// Sort terms in an order that makes simplification easier, by making terms
/// which can be combined or eliminated adjacent.
fn cmp_values_first(a: &SymExpr, b: &SymExpr) -> Ordering {
    match (a.is_value(), b.is_value()) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => match (a.name(), b.name()) {
            (Some(a_name), Some(b_name)) => a_name.cmp(b_name),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            _ => Ordering::Equal,
        },
    }
}

/// Remove common factors from `lhs` and `rhs`.
fn remove_common_factors(lhs: SymExpr, rhs: SymExpr) -> (SymExpr, SymExpr) {
    fn collect_terms(terms: &mut Vec<SymExpr>, term: &SymExpr) {
        if let SymExpr::Mul(lhs, rhs) = term {
            collect_terms(terms, lhs);
            collect_terms(terms, rhs);
        } else {
            terms.push(term.clone());
        }
    }

    let mut lhs_terms = Vec::new();
    collect_terms(&mut lhs_terms, &lhs);

    let mut rhs_terms = Vec::new();
    collect_terms(&mut rhs_terms, &rhs);

    let mut i = 0;
    while i < lhs_terms.len() {
        // Constant factors are folded instead, so zero divisors survive.
        let k = if lhs_terms[i].is_value() {
            None
        } else {
            rhs_terms.iter().position(|t| lhs_terms[i] == *t)
        };
        if let Some(k) = k {
            lhs_terms.remove(i);
            rhs_terms.remove(k);
        } else {
            i += 1;
        }
    }

    let lhs = lhs_terms
        .into_iter()
        .reduce(|prod, x| prod * x)
        .unwrap_or(SymExpr::Value(1));
    let rhs = rhs_terms
        .into_iter()
        .reduce(|prod, x| prod * x)
        .unwrap_or(SymExpr::Value(1));
    (lhs, rhs)
}

impl PartialEq<SymExpr> for SymExpr {
    fn eq(&self, other: &SymExpr) -> bool {
        let commutative_eq = |self_lhs, self_rhs, other_lhs, other_rhs| {
            (self_lhs == other_lhs && self_rhs == other_rhs)
                || (self_lhs == other_rhs && self_rhs == other_lhs)
        };

        match (self, other) {
            (Self::Value(x), Self::Value(y)) => x == y,
            (Self::Var(x), Self::Var(y)) => x.name == y.name,
            (Self::Neg(x), Self::Neg(y)) => x == y,
            (Self::Add(a, b), Self::Add(c, d))
            | (Self::Mul(a, b), Self::Mul(c, d))
            | (Self::Max(a, b), Self::Max(c, d))
            | (Self::Min(a, b), Self::Min(c, d)) => commutative_eq(a, b, c, d),
            (Self::Sub(a, b), Self::Sub(c, d))
            | (Self::Div(a, b), Self::Div(c, d))
            | (Self::Mod(a, b), Self::Mod(c, d)) => a == c && b == d,
            _ => false,
        }
    }
}

impl Add<SymExpr> for SymExpr {
    type Output = SymExpr;

    fn add(self, rhs: SymExpr) -> Self {
        Self::Add(self.into(), rhs.into())
    }
}

impl Sub<SymExpr> for SymExpr {
    type Output = SymExpr;

    fn sub(self, rhs: SymExpr) -> Self {
        Self::Sub(self.into(), rhs.into())
    }
}

impl Mul<SymExpr> for SymExpr {
    type Output = SymExpr;

    fn mul(self, rhs: SymExpr) -> Self {
        Self::Mul(self.into(), rhs.into())
    }
}

impl Div<SymExpr> for SymExpr {
    type Output = SymExpr;

    fn div(self, rhs: SymExpr) -> Self {
        Self::Div(self.into(), rhs.into())
    }
}

impl Rem<SymExpr> for SymExpr {
    type Output = SymExpr;

    fn rem(self, rhs: SymExpr) -> Self {
        Self::Mod(self.into(), rhs.into())
    }
}

impl Neg for SymExpr {
    type Output = SymExpr;

    fn neg(self) -> Self {
        Self::Neg(self.into())
    }
}

impl From<Symbol> for SymExpr {
    fn from(val: Symbol) -> Self {
        Self::Var(val.into())
    }
}

/// Create a symbol with a given name and an assumption that the value is
/// positive (`>= 0`), as dimension sizes are.
impl<'a> From<&'a str> for SymExpr {
    fn from(name: &'a str) -> Self {
        SymExpr::pos_var(name)
    }
}

impl From<i64> for SymExpr {
    fn from(val: i64) -> Self {
        SymExpr::Value(val)
    }
}

impl From<usize> for SymExpr {
    fn from(val: usize) -> Self {
        SymExpr::Value(val as i64)
    }
}

impl fmt::Debug for SymExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Var(sym) => write!(
                f,
                "\"{}\"{}",
                sym.name,
                if sym.positive { 'u' } else { 'i' }
            ),
            _ => self.fmt_with(f, &|f, expr| write!(f, "{:?}", expr)),
        }
    }
}

impl fmt::Display for SymExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Var(sym) => write!(f, "{}", sym.name),
            _ => self.fmt_with(f, &|f, expr| write!(f, "{}", expr)),
        }
    }
}

impl SymExpr {
    fn fmt_with(
        &self,
        f: &mut fmt::Formatter<'_>,
        fmt_child: &dyn Fn(&mut fmt::Formatter<'_>, &SymExpr) -> fmt::Result,
    ) -> fmt::Result {
        let add_parens = |f: &mut fmt::Formatter<'_>, expr: &SymExpr| {
            if expr.precedence() < self.precedence() {
                write!(f, "(")?;
                fmt_child(f, expr)?;
                write!(f, ")")
            } else {
                fmt_child(f, expr)
            }
        };
        let write_binop = |f: &mut fmt::Formatter<'_>, op: &str, lhs, rhs| {
            add_parens(f, lhs)?;
            write!(f, " {op} ")?;
            add_parens(f, rhs)
        };
        let write_fn = |f: &mut fmt::Formatter<'_>, name: &str, lhs, rhs| {
            write!(f, "{}(", name)?;
            fmt_child(f, lhs)?;
            write!(f, ", ")?;
            fmt_child(f, rhs)?;
            write!(f, ")")
        };
        match self {
            Self::Value(val) => write!(f, "{}", val),
            Self::Var(sym) => write!(f, "{}", sym.name),
            // nb. No space between "-" and expression to make formatting
            // distinct from subtraction.
            Self::Neg(expr) if expr.precedence() < 4 => {
                write!(f, "-(")?;
                fmt_child(f, expr)?;
                write!(f, ")")
            }
            Self::Neg(expr) => {
                write!(f, "-")?;
                fmt_child(f, expr)
            }
            Self::Add(lhs, rhs) => write_binop(f, "+", lhs, rhs),
            Self::Sub(lhs, rhs) => write_binop(f, "-", lhs, rhs),
            Self::Mul(lhs, rhs) => write_binop(f, "*", lhs, rhs),
            Self::Div(lhs, rhs) => write_binop(f, "//", lhs, rhs),
            Self::Mod(lhs, rhs) => write_binop(f, "%", lhs, rhs),
            Self::Max(lhs, rhs) => write_fn(f, "max", lhs, rhs),
            Self::Min(lhs, rhs) => write_fn(f, "min", lhs, rhs),
        }
    }
}

/// Floor division, rounding towards negative infinity.
pub const fn div_floor(lhs: i64, rhs: i64) -> i64 {
    let d = lhs / rhs;
    let r = lhs % rhs;
    if r != 0 && ((r < 0) != (rhs < 0)) {
        d - 1
    } else {
        d
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{div_floor, EvalError, SymExpr};
    use crate::value_range::{ValueRange, INT_OO};

    #[test]
    fn test_simplify_add() {
        let x = SymExpr::pos_var("x");
        let zero = SymExpr::from(0i64);
        let one = SymExpr::from(1i64);

        let expr = x.clone() + zero.clone();
        assert_eq!(expr, SymExpr::Add(x.clone().into(), zero.into()));
        assert_eq!(expr.simplify(), x);

        let expr = x.clone() + one.clone();
        assert_eq!(expr.simplify(), SymExpr::Add(one.into(), x.into()));
    }

    #[test]
    fn test_simplify_add_reassociate() {
        let x = SymExpr::from("x");

        // C + X + D => S + X
        let expr = (x.clone() + SymExpr::from(3i64)) + SymExpr::from(4i64);
        assert_eq!(expr.simplify(), SymExpr::from(7i64) + x.clone());

        // C + X - C => X
        let expr = (SymExpr::from(3i64) + x.clone()) - SymExpr::from(3i64);
        assert_eq!(expr.simplify(), x);
    }

    #[test]
    fn test_simplify_sub() {
        let x = SymExpr::pos_var("x");
        let y = SymExpr::pos_var("y");

        assert_eq!((x.clone() - x.clone()).simplify(), SymExpr::Value(0));
        assert_eq!((x.clone() + y.clone() - x.clone()).simplify(), y);
        assert_eq!(
            ((x.clone() + y.clone()) - (x.clone() + y.clone())).simplify(),
            SymExpr::Value(0)
        );
        assert_eq!((-(-x.clone())).simplify(), x);
    }

    #[test]
    fn test_simplify_mul_div() {
        let x = SymExpr::pos_var("x");
        let y = SymExpr::pos_var("y");

        assert_eq!((x.clone() * SymExpr::from(1i64)).simplify(), x);
        assert_eq!((x.clone() * SymExpr::from(0i64)).simplify(), SymExpr::Value(0));
        assert_eq!((x.clone() / x.clone()).simplify(), SymExpr::Value(1));
        assert_eq!(((x.clone() * y.clone()) / x.clone()).simplify(), y);
        assert_eq!(
            (x.clone() / SymExpr::from(2i64) / SymExpr::from(2i64)).simplify(),
            x.clone() / SymExpr::from(4i64)
        );
        assert_eq!(
            (SymExpr::from(-7i64) / SymExpr::from(2i64)).simplify(),
            SymExpr::Value(-4)
        );
        assert_eq!((x.clone() % x).simplify(), SymExpr::Value(0));
    }

    #[test]
    fn test_simplify_max_min() {
        let expr = SymExpr::from(10i64)
            .max(&SymExpr::from(5i64).max(&SymExpr::from(11i64)))
            .simplify();
        assert_eq!(expr, SymExpr::from(11i64));

        let expr = SymExpr::from(10i64)
            .min(&SymExpr::from(5i64).min(&SymExpr::from(3i64)))
            .simplify();
        assert_eq!(expr, SymExpr::from(3i64));
    }

    #[test]
    fn test_eval() {
        let expr = (SymExpr::from("s0") + SymExpr::from(2i64)) * SymExpr::from("s1");
        let mut bindings = HashMap::new();
        bindings.insert("s0".to_string(), 3);
        assert_eq!(
            expr.eval(&bindings),
            Err(EvalError::UnboundSymbol("s1".into()))
        );
        bindings.insert("s1".to_string(), 4);
        assert_eq!(expr.eval(&bindings), Ok(20));

        let div = SymExpr::from("s0") / SymExpr::from(0i64);
        assert_eq!(div.eval(&bindings), Err(EvalError::DivisionByZero));
        assert_eq!(div_floor(-7, 2), -4);
    }

    #[test]
    fn test_subst_and_free_symbols() {
        let expr = SymExpr::from("s1") + SymExpr::from("s0") * SymExpr::from("s1");
        let names: Vec<_> = expr.free_symbols().iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, ["s1", "s0"]);

        let replaced = expr.subst(&|sym| (sym.name == "s1").then(|| SymExpr::from("s0")));
        let names: Vec<_> = replaced
            .free_symbols()
            .iter()
            .map(|s| s.name.clone())
            .collect();
        assert_eq!(names, ["s0"]);
    }

    #[test]
    fn test_bounds() {
        let expr = SymExpr::from("s0") * SymExpr::from(2i64) + SymExpr::from(1i64);
        let range = expr.bounds(&|_| ValueRange::new(2, 10));
        assert_eq!(range, ValueRange::new(5, 21));

        let unbounded = SymExpr::from("s0").bounds(&|_| ValueRange::at_least(2));
        assert_eq!(unbounded.upper, INT_OO);
    }

    #[test]
    fn test_display() {
        let expr = (SymExpr::from(1i64) + SymExpr::pos_var("foo")) * SymExpr::from(3i64)
            + SymExpr::from(4i64)
            - SymExpr::from(5i64);
        assert_eq!(expr.to_string(), "(1 + foo) * 3 + 4 - 5");
        assert_eq!(
            (SymExpr::from("s0") / SymExpr::from(2i64)).to_string(),
            "s0 // 2"
        );
    }

    #[test]
    fn test_debug() {
        let expr = SymExpr::pos_var("foo") * SymExpr::from(3i64) + SymExpr::var("bar");
        assert_eq!(format!("{:?}", expr), "\"foo\"u * 3 + \"bar\"i");
    }
}
