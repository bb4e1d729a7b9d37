//! Solver for the dimension constraints implied by recorded guards.

use std::sync::Arc;

use rten_symbolic::{SymExpr, Symbol, ValueRange};

use super::{Guard, ShapeEnv};
use crate::env::LOG_GUARDS_VAR;

/// Solver state for one dynamic dimension.
#[derive(Clone, Debug)]
struct DimInfo {
    symbol: Arc<Symbol>,

    /// User-visible name, eg. the name of the `Dim`.
    name: String,

    /// Name of the dimension's source, eg. `x.size()[0]`.
    source: String,

    /// Range before solving.
    initial: ValueRange,
}

/// Per-symbol bounds, equalities and specializations derived from the guards
/// of a frozen [`ShapeEnv`].
#[derive(Clone, Debug)]
pub struct DimConstraints {
    dims: Vec<DimInfo>,
    guards: Vec<Guard>,

    /// Pairs of (replaced dim, root dim) names.
    equalities: Vec<(String, String)>,

    /// Specialized dims as `(index in dims, value)`.
    specializations: Vec<(usize, i64)>,

    /// Solved bounds as `(index in dims, range)`.
    bounds: Vec<(usize, ValueRange)>,

    /// Guards which could not be reduced to per-symbol bounds.
    residual: Vec<String>,
}

impl DimConstraints {
    /// Gather the constraints of a frozen shape environment.
    ///
    /// `guards` are the resolved guards returned by
    /// [`ShapeEnv::produce_guards`], or the environment's raw guards if guard
    /// production was skipped.
    pub fn new(env: &ShapeEnv, guards: &[Guard], param_names: &[String]) -> DimConstraints {
        let mut dims = Vec::new();
        let mut equalities = Vec::new();
        let mut specializations = Vec::new();

        for (sym, replacement) in env.symbols() {
            let name = env.debug_name(sym, param_names);
            match replacement {
                Some(SymExpr::Var(root)) => {
                    equalities.push((name.clone(), env.debug_name(root, param_names)));
                }
                Some(SymExpr::Value(value)) => specializations.push((dims.len(), *value)),
                _ => {}
            }
            dims.push(DimInfo {
                symbol: sym.clone(),
                name,
                source: env.source_pretty_name(sym, param_names),
                initial: env.var_range(sym),
            });
        }

        DimConstraints {
            dims,
            guards: guards.to_vec(),
            equalities,
            specializations,
            bounds: Vec::new(),
            residual: Vec::new(),
        }
    }

    fn dim_index(&self, sym: &Symbol) -> Option<usize> {
        self.dims.iter().position(|d| d.symbol.name == sym.name)
    }

    /// Reduce guards to a range per symbol.
    ///
    /// Symbols whose range narrows to a single value are moved to the
    /// specializations.
    pub fn solve(&mut self) {
        let mut bounds: Vec<Option<ValueRange>> = self
            .dims
            .iter()
            .enumerate()
            .map(|(i, dim)| {
                let specialized = self.specializations.iter().any(|(idx, _)| *idx == i);
                let replaced = self.equalities.iter().any(|(name, _)| *name == dim.name);
                (!specialized && !replaced).then_some(dim.initial)
            })
            .collect();

        for guard in &self.guards {
            let Some((sym, range)) = guard.as_symbol_bound() else {
                self.residual.push(guard.to_string());
                continue;
            };
            let Some(idx) = self.dim_index(&sym) else {
                self.residual.push(guard.to_string());
                continue;
            };
            if let Some(bound) = bounds[idx].as_mut() {
                // An empty intersection has already been reported as a
                // violation. Keep the tighter of the two bounds.
                *bound = bound.intersect(&range).unwrap_or(range);
            }
        }

        for (idx, bound) in bounds.into_iter().enumerate() {
            let Some(bound) = bound else {
                continue;
            };
            match bound.as_singleton() {
                Some(value) => self.specializations.push((idx, value)),
                None => self.bounds.push((idx, bound)),
            }
        }
        self.specializations.sort_by_key(|(idx, _)| *idx);
    }

    /// Drop solved bounds which say no more than the range the dimension
    /// started with.
    pub fn remove_redundant_dynamic_results(&mut self) {
        let dims = &self.dims;
        self.bounds.retain(|(idx, range)| *range != dims[*idx].initial);
    }

    /// Return the `(name, value)` of every dimension declared dynamic which
    /// the solver found can only take one value.
    pub fn forced_specializations(&self) -> Vec<(String, i64)> {
        self.specializations
            .iter()
            .map(|(idx, value)| (self.dims[*idx].name.clone(), *value))
            .collect()
    }

    /// Return the solved bound for the dimension named `name`, if it is
    /// tighter than its initial range.
    pub fn bound(&self, name: &str) -> Option<ValueRange> {
        self.bounds
            .iter()
            .find(|(idx, _)| self.dims[*idx].name == name)
            .map(|(_, range)| *range)
    }

    /// Guards which could not be expressed as per-dimension ranges.
    pub fn residual_guards(&self) -> &[String] {
        &self.residual
    }

    /// Render forced specializations and suggested fixes for `Dim`
    /// declarations.
    ///
    /// Returns an empty string if there is nothing to report.
    pub fn prettify_results(&self, has_violation: bool) -> String {
        let mut out = String::new();
        let forced = self.forced_specializations();

        if !forced.is_empty() {
            let names: Vec<&str> = forced.iter().map(|(name, _)| name.as_str()).collect();
            out.push_str(&format!(
                "Specializations unexpectedly required ({})! For more information, run with {}=1.",
                names.join(", "),
                LOG_GUARDS_VAR
            ));
            for (idx, value) in &self.specializations {
                out.push_str(&format!(
                    "\n  - solving the guards generated for {} resulted in a specialized value of {}.",
                    self.dims[*idx].source, value
                ));
            }
        }

        if !has_violation && forced.is_empty() {
            return out;
        }

        let mut fixes = Vec::new();
        for (idx, range) in &self.bounds {
            let name = &self.dims[*idx].name;
            let fix = if range.is_upper_unbounded() {
                format!("{} = Dim('{}', min={})", name, name, range.lower)
            } else {
                format!(
                    "{} = Dim('{}', min={}, max={})",
                    name, name, range.lower, range.upper
                )
            };
            fixes.push(fix);
        }
        for (name, value) in &forced {
            fixes.push(format!("{} = None  # {}", name, value));
        }
        for (name, root) in self.equalities.iter().filter(|(name, root)| name != root) {
            fixes.push(format!("{} = {}", name, root));
        }

        if !fixes.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("\nSuggested fixes:");
            for fix in fixes {
                out.push_str("\n  ");
                out.push_str(&fix);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use rten_symbolic::{SymExpr, ValueRange, INT_OO};

    use super::DimConstraints;
    use crate::fake::DimDynamic;
    use crate::shape_env::{Guard, Relation, ShapeEnv};
    use crate::source::Source;
    use crate::tree::KeyEntry;

    fn input_size(input: usize, dim: usize) -> Source {
        Source::local("args")
            .item(KeyEntry::Index(0))
            .item(KeyEntry::Index(input))
            .size(dim)
    }

    fn params() -> Vec<String> {
        vec!["x".into(), "y".into()]
    }

    #[test]
    fn test_solve_bounds() {
        let mut env = ShapeEnv::new();
        let s0 = env
            .create_symbolic_size(
                10,
                input_size(0, 0),
                DimDynamic::Dynamic,
                Some(ValueRange::new(1, 1024)),
            )
            .unwrap();
        env.set_debug_name(&input_size(0, 0), "batch").unwrap();
        env.evaluate_guard(Guard::new(s0, Relation::Ge, SymExpr::Value(5)))
            .unwrap();

        let report = env.produce_guards(&[], &params()).unwrap();
        env.freeze();

        let mut dims = DimConstraints::new(&env, &report.guards, &params());
        dims.solve();
        dims.remove_redundant_dynamic_results();
        assert_eq!(dims.bound("batch"), Some(ValueRange::new(5, 1024)));
        assert!(dims.forced_specializations().is_empty());
        assert_eq!(
            dims.prettify_results(true),
            "\nSuggested fixes:\n  batch = Dim('batch', min=5, max=1024)"
        );
        assert_eq!(dims.prettify_results(false), "");
    }

    #[test]
    fn test_remove_redundant_results() {
        let mut env = ShapeEnv::new();
        let s0 = env
            .create_symbolic_size(10, input_size(0, 0), DimDynamic::Dynamic, None)
            .unwrap();
        env.evaluate_guard(Guard::new(s0, Relation::Ge, SymExpr::Value(2)))
            .unwrap();
        env.freeze();

        let mut dims = DimConstraints::new(&env, env.guards(), &params());
        dims.solve();
        assert_eq!(dims.bound("dim0_x"), Some(ValueRange::new(2, INT_OO)));
        dims.remove_redundant_dynamic_results();
        assert_eq!(dims.bound("dim0_x"), None);
        assert_eq!(env.bound_expr(&SymExpr::pos_var("s0")), ValueRange::new(2, INT_OO));
    }

    #[test]
    fn test_forced_specializations() {
        let mut env = ShapeEnv::new();
        let s0 = env
            .create_symbolic_size(
                4,
                input_size(0, 1),
                DimDynamic::Dynamic,
                Some(ValueRange::new(2, 64)),
            )
            .unwrap();
        env.set_debug_name(&input_size(0, 1), "feat").unwrap();
        env.evaluate_guard(Guard::new(s0, Relation::Eq, SymExpr::Value(4)))
            .unwrap();
        env.freeze();

        let mut dims = DimConstraints::new(&env, env.guards(), &params());
        dims.solve();
        dims.remove_redundant_dynamic_results();
        assert_eq!(dims.forced_specializations(), [("feat".to_string(), 4)]);
        assert_eq!(
            dims.prettify_results(false),
            "Specializations unexpectedly required (feat)! For more information, run with RTEN_EXPORT_LOG_GUARDS=1.
  - solving the guards generated for x.size()[1] resulted in a specialized value of 4.

Suggested fixes:
  feat = None  # 4"
        );
    }

    #[test]
    fn test_singleton_range_is_specialization() {
        let mut env = ShapeEnv::new();
        env.create_symbolic_size(
            8,
            input_size(1, 0),
            DimDynamic::Dynamic,
            Some(ValueRange::exact(8)),
        )
        .unwrap();
        env.freeze();

        let mut dims = DimConstraints::new(&env, &[], &params());
        dims.solve();
        assert_eq!(dims.forced_specializations(), [("dim0_y".to_string(), 8)]);
    }
}
