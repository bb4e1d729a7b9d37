//! Symbol name generator.

use std::borrow::Cow;

use crate::sym_expr::Symbol;

/// Generates named symbols for dynamic dimensions.
///
/// Symbols are named `{prefix}{id}` with IDs counting up from zero, so the
/// default generator produces `s0`, `s1`, ...
pub struct SymbolGen {
    prefix: Cow<'static, str>,
    next_symbol_id: u32,
}

impl Default for SymbolGen {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolGen {
    pub fn new() -> Self {
        Self::with_prefix("s".into())
    }

    pub fn with_prefix(prefix: Cow<'static, str>) -> Self {
        Self {
            prefix,
            next_symbol_id: 0,
        }
    }

    fn gen_name(&mut self) -> String {
        let name = format!("{}{}", self.prefix, self.next_symbol_id);
        self.next_symbol_id += 1;
        name
    }

    /// Generate a new symbol which is assumed to be positive.
    pub fn gen_positive(&mut self) -> Symbol {
        Symbol {
            name: self.gen_name(),
            positive: true,
        }
    }

    /// Return the number of symbols generated so far.
    pub fn count(&self) -> u32 {
        self.next_symbol_id
    }
}
