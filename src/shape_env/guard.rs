use std::fmt;
use std::sync::Arc;

use rten_symbolic::{EvalError, SymExpr, Symbol, SymbolMap, ValueRange, INT_OO, NEG_INT_OO};

/// Comparison operator in a [`Guard`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Relation {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Relation {
    /// Return the relation with operands swapped, eg. `a < b` => `b > a`.
    pub fn flip(self) -> Relation {
        match self {
            Relation::Eq => Relation::Eq,
            Relation::Ne => Relation::Ne,
            Relation::Lt => Relation::Gt,
            Relation::Le => Relation::Ge,
            Relation::Gt => Relation::Lt,
            Relation::Ge => Relation::Le,
        }
    }

    fn compare(self, lhs: i64, rhs: i64) -> bool {
        match self {
            Relation::Eq => lhs == rhs,
            Relation::Ne => lhs != rhs,
            Relation::Lt => lhs < rhs,
            Relation::Le => lhs <= rhs,
            Relation::Gt => lhs > rhs,
            Relation::Ge => lhs >= rhs,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Relation::Eq => "==",
            Relation::Ne => "!=",
            Relation::Lt => "<",
            Relation::Le => "<=",
            Relation::Gt => ">",
            Relation::Ge => ">=",
        }
    }
}

/// A condition over dimension sizes which must hold for a traced graph to be
/// valid.
#[derive(Clone, Debug, PartialEq)]
pub struct Guard {
    pub lhs: SymExpr,
    pub rel: Relation,
    pub rhs: SymExpr,
}

impl Guard {
    pub fn new(lhs: SymExpr, rel: Relation, rhs: SymExpr) -> Guard {
        Guard { lhs, rel, rhs }
    }

    /// Evaluate the guard using concrete values for its symbols.
    pub fn holds_for(&self, values: &impl SymbolMap) -> Result<bool, EvalError> {
        let lhs = self.lhs.eval(values)?;
        let rhs = self.rhs.eval(values)?;
        Ok(self.rel.compare(lhs, rhs))
    }

    /// Return a copy of the guard with `f` applied to both sides.
    pub fn map(&self, f: impl Fn(&SymExpr) -> SymExpr) -> Guard {
        Guard {
            lhs: f(&self.lhs),
            rel: self.rel,
            rhs: f(&self.rhs),
        }
    }

    /// Return the truth value if neither side references a symbol.
    pub fn as_constant(&self) -> Option<bool> {
        let lhs = self.lhs.as_value()?;
        let rhs = self.rhs.as_value()?;
        Some(self.rel.compare(lhs, rhs))
    }

    /// If this guard compares a single symbol with a constant, return the
    /// symbol and the range of values that satisfy the guard.
    pub fn as_symbol_bound(&self) -> Option<(Arc<Symbol>, ValueRange)> {
        let (sym, rel, value) = match (&self.lhs, &self.rhs) {
            (SymExpr::Var(sym), SymExpr::Value(value)) => (sym, self.rel, *value),
            (SymExpr::Value(value), SymExpr::Var(sym)) => (sym, self.rel.flip(), *value),
            _ => return None,
        };
        let range = match rel {
            Relation::Eq => ValueRange::exact(value),
            Relation::Ne => return None,
            Relation::Lt => ValueRange::new(NEG_INT_OO, value.saturating_sub(1)),
            Relation::Le => ValueRange::new(NEG_INT_OO, value),
            Relation::Gt => ValueRange::new(value.saturating_add(1), INT_OO),
            Relation::Ge => ValueRange::new(value, INT_OO),
        };
        Some((sym.clone(), range))
    }

    /// Return true if the guard holds for every assignment of symbols within
    /// the ranges given by `var_range`.
    pub fn implied_by(&self, var_range: &impl Fn(&Symbol) -> ValueRange) -> bool {
        if let Some((sym, bound)) = self.as_symbol_bound() {
            return var_range(&sym).is_subset_of(&bound);
        }
        let diff = (self.lhs.clone() - self.rhs.clone()).simplify();
        let range = diff.bounds(var_range);
        match self.rel {
            Relation::Eq => range.as_singleton() == Some(0),
            Relation::Ne => !range.contains(0),
            Relation::Lt => range.upper < 0,
            Relation::Le => range.upper <= 0,
            Relation::Gt => range.lower > 0,
            Relation::Ge => range.lower >= 0,
        }
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.lhs, self.rel.symbol(), self.rhs)
    }
}

#[cfg(test)]
mod tests {
    use rten_symbolic::{SymExpr, Symbol, ValueRange, INT_OO};
    use rten_testing::TestCases;

    use super::{Guard, Relation};

    #[test]
    fn test_as_symbol_bound() {
        #[derive(Debug)]
        struct Case {
            guard: Guard,
            expected: Option<ValueRange>,
        }

        let s0 = || SymExpr::pos_var("s0");
        let cases = [
            Case {
                guard: Guard::new(s0(), Relation::Ge, SymExpr::Value(5)),
                expected: Some(ValueRange::new(5, INT_OO)),
            },
            Case {
                guard: Guard::new(SymExpr::Value(5), Relation::Gt, s0()),
                expected: Some(ValueRange::new(i64::MIN, 4)),
            },
            Case {
                guard: Guard::new(s0(), Relation::Eq, SymExpr::Value(3)),
                expected: Some(ValueRange::exact(3)),
            },
            Case {
                guard: Guard::new(s0(), Relation::Ne, SymExpr::Value(3)),
                expected: None,
            },
            Case {
                guard: Guard::new(s0(), Relation::Eq, SymExpr::pos_var("s1")),
                expected: None,
            },
        ];

        cases.test_each(|case| {
            let bound = case.guard.as_symbol_bound().map(|(_, range)| range);
            assert_eq!(bound, case.expected);
        })
    }

    #[test]
    fn test_implied_by() {
        let ranges = |sym: &Symbol| match sym.name.as_str() {
            "s0" => ValueRange::new(2, 1024),
            _ => ValueRange::new(8, 16),
        };
        let s0 = SymExpr::pos_var("s0");
        let s1 = SymExpr::pos_var("s1");

        assert!(Guard::new(s0.clone(), Relation::Ge, SymExpr::Value(2)).implied_by(&ranges));
        assert!(!Guard::new(s0.clone(), Relation::Ge, SymExpr::Value(5)).implied_by(&ranges));
        assert!(Guard::new(s1.clone(), Relation::Le, SymExpr::Value(16)).implied_by(&ranges));
        assert!(Guard::new(s1.clone() + SymExpr::Value(1), Relation::Gt, SymExpr::Value(8))
            .implied_by(&ranges));
        assert!(!Guard::new(s0, Relation::Lt, s1).implied_by(&ranges));
    }

    #[test]
    fn test_holds_for() {
        let guard = Guard::new(SymExpr::pos_var("s0"), Relation::Ge, SymExpr::Value(5));
        assert_eq!(guard.holds_for(&|_: &str| Some(7)), Ok(true));
        assert_eq!(guard.holds_for(&|_: &str| Some(3)), Ok(false));
        assert!(guard.holds_for(&|_: &str| None).is_err());
        assert_eq!(guard.to_string(), "s0 >= 5");
    }
}
