//! Symbolic shape environment for one export call.
//!
//! The [`ShapeEnv`] owns the symbols created for dynamic dimensions, the
//! example value ("hint") of each symbol, their ranges and the guards recorded
//! while tracing. After constraint solving it is frozen and can only be
//! queried.

use std::sync::Arc;

use rten_symbolic::{SymExpr, Symbol, SymbolGen, ValueRange, INT_OO};
use rustc_hash::FxHashMap;

mod guard;
mod solver;

pub use guard::{Guard, Relation};
pub use solver::DimConstraints;

use crate::env::{env_flag, LOG_GUARDS_VAR};
use crate::error::ExportError;
use crate::fake::{DimDynamic, FakeTensor, SymbolicContext};
use crate::source::{sanitize_name, Source, TensorProperty};

/// A traced input tensor together with its provenance.
#[derive(Clone, Debug)]
pub struct TrackedFake {
    pub fake: FakeTensor,
    pub source: Source,
    pub symbolic_context: SymbolicContext,
}

/// Category of a [`ConstraintViolation`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ViolationKind {
    /// Declared ranges or equalities conflict with the traced program.
    Conflict,
    /// A dimension declared dynamic can only take a single value.
    ForcedSpecialization,
}

/// Consolidated report of dynamic shape constraints that cannot be satisfied.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ConstraintViolation {
    pub kind: ViolationKind,
    pub message: String,
}

impl ConstraintViolation {
    /// Create a conflict report from individual violations.
    pub fn from_violations(violations: &[Violation]) -> ConstraintViolation {
        let mut names: Vec<&str> = Vec::new();
        for v in violations {
            if !names.contains(&v.name.as_str()) {
                names.push(&v.name);
            }
        }
        let mut message = format!(
            "Constraints violated ({})! For more information, run with {}=1.",
            names.join(", "),
            LOG_GUARDS_VAR
        );
        for v in violations {
            message.push_str("\n  - ");
            message.push_str(&v.message);
        }
        ConstraintViolation {
            kind: ViolationKind::Conflict,
            message,
        }
    }

    /// Append a summary of solver results to the message.
    pub fn with_summary(mut self, summary: &str) -> ConstraintViolation {
        if !summary.is_empty() {
            self.message.push('\n');
            self.message.push_str(summary);
        }
        self
    }
}

/// A single problem found by [`ShapeEnv::produce_guards`].
#[derive(Clone, Debug, PartialEq)]
pub struct Violation {
    /// Name of the dimension involved, used in the report header.
    pub name: String,
    pub message: String,
}

/// Result of [`ShapeEnv::produce_guards`].
#[derive(Clone, Debug, Default)]
pub struct GuardReport {
    /// Guards which remain after unification, with resolved symbols.
    pub guards: Vec<Guard>,
    pub violations: Vec<Violation>,
}

/// Per-symbol state.
#[derive(Clone, Debug)]
struct SymbolInfo {
    symbol: Arc<Symbol>,

    /// Example value, used to decide branches while tracing.
    hint: i64,

    /// Range given by the user.
    declared: ValueRange,

    /// Sources of dimensions with this symbol. The first is canonical.
    sources: Vec<Source>,
}

/// A dimension declared dynamic whose example size forced it to be static.
#[derive(Clone, Debug)]
struct HintSpecialization {
    source: Source,
    value: i64,
}

/// Two symbols the program requires to be equal, but whose ranges are
/// disjoint.
#[derive(Clone, Debug)]
struct RangeConflict {
    kept: Arc<Symbol>,
    kept_range: ValueRange,
    replaced: Arc<Symbol>,
    replaced_range: ValueRange,
}

/// Symbolic shape state for one export call.
pub struct ShapeEnv {
    tracked_fakes: Vec<TrackedFake>,

    /// Symbols in creation order.
    symbols: Vec<SymbolInfo>,

    /// Current range of each root symbol, keyed by name.
    var_to_range: FxHashMap<String, ValueRange>,

    /// Symbol or constant for each dimension source, keyed by source name.
    source_to_expr: FxHashMap<String, SymExpr>,

    /// User-visible dimension names, keyed by source name.
    source_to_debug_name: FxHashMap<String, String>,

    /// Symbols which have been unified with another symbol or specialized to
    /// a constant. Values only reference root symbols.
    replacements: FxHashMap<String, SymExpr>,

    /// Guards which are not simple equalities.
    guards: Vec<Guard>,

    /// Symbols specialized by equality guards, in order.
    specialized: Vec<(Arc<Symbol>, i64)>,

    hint_specializations: Vec<HintSpecialization>,
    range_conflicts: Vec<RangeConflict>,
    sym_gen: SymbolGen,
    log_guards: bool,
    frozen: bool,
}

impl Default for ShapeEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl ShapeEnv {
    pub fn new() -> ShapeEnv {
        ShapeEnv {
            tracked_fakes: Vec::new(),
            symbols: Vec::new(),
            var_to_range: FxHashMap::default(),
            source_to_expr: FxHashMap::default(),
            source_to_debug_name: FxHashMap::default(),
            replacements: FxHashMap::default(),
            guards: Vec::new(),
            specialized: Vec::new(),
            hint_specializations: Vec::new(),
            range_conflicts: Vec::new(),
            sym_gen: SymbolGen::new(),
            log_guards: env_flag(LOG_GUARDS_VAR, false),
            frozen: false,
        }
    }

    fn check_not_frozen(&self) -> Result<(), ExportError> {
        if self.frozen {
            Err(ExportError::ShapeEnvFrozen)
        } else {
            Ok(())
        }
    }

    /// Prevent any further modification of the environment.
    ///
    /// This cannot be undone.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Return the size of a dimension, creating a new symbol if the dimension
    /// is dynamic.
    ///
    /// Dynamic dimensions whose example size is 0 or 1 are specialized to
    /// that size, and reported as a violation by [`produce_guards`](Self::produce_guards).
    pub fn create_symbolic_size(
        &mut self,
        hint: usize,
        source: Source,
        dynamic: DimDynamic,
        declared: Option<ValueRange>,
    ) -> Result<SymExpr, ExportError> {
        self.check_not_frozen()?;
        let hint = hint as i64;

        let expr = match dynamic {
            DimDynamic::Static => SymExpr::Value(hint),
            DimDynamic::Dynamic if hint < 2 => {
                tracing::debug!(source = %source, value = hint, "specializing size 0/1 dimension");
                self.hint_specializations.push(HintSpecialization {
                    source: source.clone(),
                    value: hint,
                });
                SymExpr::Value(hint)
            }
            DimDynamic::Dynamic => {
                let declared = declared.unwrap_or(ValueRange::new(0, INT_OO));
                let range = declared
                    .intersect(&ValueRange::at_least(2))
                    .unwrap_or(declared);
                let symbol = Arc::new(self.sym_gen.gen_positive());

                tracing::debug!(
                    symbol = %symbol.name,
                    source = %source,
                    hint,
                    range = %range,
                    "created symbol"
                );

                self.var_to_range.insert(symbol.name.clone(), range);
                self.symbols.push(SymbolInfo {
                    symbol: symbol.clone(),
                    hint,
                    declared,
                    sources: vec![source.clone()],
                });
                SymExpr::Var(symbol)
            }
        };

        self.source_to_expr.insert(source.name(), expr.clone());
        Ok(expr)
    }

    /// Record a traced input.
    pub fn add_tracked_fake(&mut self, fake: TrackedFake) -> Result<(), ExportError> {
        self.check_not_frozen()?;
        self.tracked_fakes.push(fake);
        Ok(())
    }

    pub fn tracked_fakes(&self) -> &[TrackedFake] {
        &self.tracked_fakes
    }

    /// Associate a user-visible name with the dimension at `source`.
    pub fn set_debug_name(&mut self, source: &Source, name: &str) -> Result<(), ExportError> {
        self.check_not_frozen()?;
        self.source_to_debug_name
            .insert(source.name(), name.to_string());
        Ok(())
    }

    /// Return the resolved size expression of the dimension at `source`.
    pub fn expr_for_source(&self, source: &Source) -> Option<SymExpr> {
        self.source_to_expr
            .get(&source.name())
            .map(|expr| self.resolve(expr))
    }

    /// Apply symbol unifications and specializations to `expr`.
    pub fn resolve(&self, expr: &SymExpr) -> SymExpr {
        if self.replacements.is_empty() {
            return expr.clone();
        }
        expr.subst(&|sym| self.replacements.get(&sym.name).cloned())
            .simplify()
    }

    fn symbol_info(&self, name: &str) -> Option<&SymbolInfo> {
        self.symbols.iter().find(|s| s.symbol.name == name)
    }

    fn symbol_index(&self, name: &str) -> usize {
        self.symbols
            .iter()
            .position(|s| s.symbol.name == name)
            .unwrap_or(usize::MAX)
    }

    /// Return the example value of a symbol.
    pub fn hint(&self, sym: &Symbol) -> Option<i64> {
        self.symbol_info(&sym.name).map(|info| info.hint)
    }

    /// Evaluate `expr` using the example values of its symbols.
    pub fn size_hint(&self, expr: &SymExpr) -> Result<i64, ExportError> {
        self.resolve(expr)
            .eval(&|name: &str| self.symbol_info(name).map(|info| info.hint))
            .map_err(|err| ExportError::Trace(format!("cannot evaluate size {}: {}", expr, err)))
    }

    /// Return the current range of a symbol, after unification.
    pub fn var_range(&self, sym: &Symbol) -> ValueRange {
        let root = self.resolve(&SymExpr::Var(Arc::new(sym.clone())));
        match root {
            SymExpr::Var(root) => self
                .var_to_range
                .get(&root.name)
                .copied()
                .unwrap_or(ValueRange::at_least(0)),
            other => other.bounds(&|s| self.var_to_range.get(&s.name).copied().unwrap_or_default()),
        }
    }

    /// Return the range of values `expr` may take.
    pub fn bound_expr(&self, expr: &SymExpr) -> ValueRange {
        self.resolve(expr).bounds(&|sym| self.var_range(sym))
    }

    /// Return the root symbols, which have not been replaced, in creation order.
    pub fn root_symbols(&self) -> impl Iterator<Item = &Arc<Symbol>> {
        self.symbols
            .iter()
            .map(|info| &info.symbol)
            .filter(|sym| !self.replacements.contains_key(&sym.name))
    }

    /// Return all symbols and their replacement, if any, in creation order.
    pub fn symbols(&self) -> impl Iterator<Item = (&Arc<Symbol>, Option<&SymExpr>)> {
        self.symbols
            .iter()
            .map(|info| (&info.symbol, self.replacements.get(&info.symbol.name)))
    }

    /// Return symbols specialized to constants by guards recorded while tracing.
    pub fn specialized(&self) -> &[(Arc<Symbol>, i64)] {
        &self.specialized
    }

    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    /// Return the canonical source of a symbol.
    pub fn symbol_source(&self, sym: &Symbol) -> Option<&Source> {
        self.symbol_info(&sym.name).and_then(|info| info.sources.first())
    }

    /// Return the user-visible name of a symbol.
    ///
    /// This is the name of the `Dim` the symbol was created for, or a name
    /// derived from its source if the dimension was declared without one.
    pub fn debug_name(&self, sym: &Symbol, param_names: &[String]) -> String {
        let Some(source) = self.symbol_source(sym) else {
            return sym.name.clone();
        };
        self.source_debug_name(source, param_names)
    }

    fn source_debug_name(&self, source: &Source, param_names: &[String]) -> String {
        if let Some(name) = self.source_to_debug_name.get(&source.name()) {
            return name.clone();
        }
        match source {
            Source::TensorProperty {
                base,
                prop: TensorProperty::Size,
                idx,
            } => format!("dim{}_{}", idx, sanitize_name(&base.pretty_name(param_names))),
            _ => sanitize_name(&source.pretty_name(param_names)),
        }
    }

    /// Return the name of a symbol's canonical source, using the program's
    /// parameter names.
    pub fn source_pretty_name(&self, sym: &Symbol, param_names: &[String]) -> String {
        self.symbol_source(sym)
            .map(|s| s.pretty_name(param_names))
            .unwrap_or_else(|| sym.name.clone())
    }

    /// Record a guard the traced program depends on.
    ///
    /// The guard must hold for the example inputs. Equalities between two
    /// symbols unify them, and equalities between a symbol and a constant
    /// specialize the symbol.
    pub fn evaluate_guard(&mut self, guard: Guard) -> Result<(), ExportError> {
        self.check_not_frozen()?;
        let guard = guard.map(|e| self.resolve(e));

        if let Some(holds) = guard.as_constant() {
            return if holds {
                Ok(())
            } else {
                Err(ExportError::Trace(format!(
                    "traced program requires {}, which is false",
                    guard
                )))
            };
        }

        let holds = guard
            .holds_for(&|name: &str| self.symbol_info(name).map(|info| info.hint))
            .map_err(|err| {
                ExportError::Trace(format!("cannot evaluate guard {}: {}", guard, err))
            })?;
        if !holds {
            return Err(ExportError::Trace(format!(
                "traced program requires {}, which does not hold for the example inputs",
                guard
            )));
        }

        if self.log_guards {
            tracing::debug!(guard = %guard, "recorded guard");
        }

        if guard.rel == Relation::Eq {
            match (&guard.lhs, &guard.rhs) {
                (SymExpr::Var(a), SymExpr::Var(b)) => {
                    let (a, b) = (a.clone(), b.clone());
                    self.unify(&a, &b);
                    return Ok(());
                }
                (SymExpr::Var(sym), SymExpr::Value(value))
                | (SymExpr::Value(value), SymExpr::Var(sym)) => {
                    let (sym, value) = (sym.clone(), *value);
                    self.specialize(&sym, value);
                    return Ok(());
                }
                _ => {}
            }
        }
        self.guards.push(guard);
        Ok(())
    }

    /// Make the later-created of two root symbols an alias of the earlier.
    fn unify(&mut self, a: &Arc<Symbol>, b: &Arc<Symbol>) {
        if a.name == b.name {
            return;
        }
        let (kept, replaced) = if self.symbol_index(&a.name) <= self.symbol_index(&b.name) {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        };

        let kept_range = self.var_range(&kept);
        let replaced_range = self.var_range(&replaced);
        match kept_range.intersect(&replaced_range) {
            Some(range) => {
                self.var_to_range.insert(kept.name.clone(), range);
            }
            None => self.range_conflicts.push(RangeConflict {
                kept: kept.clone(),
                kept_range,
                replaced: replaced.clone(),
                replaced_range,
            }),
        }

        tracing::debug!(replaced = %replaced.name, kept = %kept.name, "unified symbols");
        self.replace(&replaced, SymExpr::Var(kept.clone()));

        let moved_sources = self
            .symbols
            .iter_mut()
            .find(|s| s.symbol.name == replaced.name)
            .map(|s| s.sources.clone())
            .unwrap_or_default();
        if let Some(info) = self.symbols.iter_mut().find(|s| s.symbol.name == kept.name) {
            info.sources.extend(moved_sources);
        }
    }

    fn specialize(&mut self, sym: &Arc<Symbol>, value: i64) {
        tracing::debug!(symbol = %sym.name, value, "specialized symbol");
        self.specialized.push((sym.clone(), value));
        self.replace(sym, SymExpr::Value(value));
    }

    fn replace(&mut self, sym: &Symbol, expr: SymExpr) {
        self.var_to_range.remove(&sym.name);
        self.replacements.insert(sym.name.clone(), expr.clone());

        // Keep replacements pointing at root symbols.
        for value in self.replacements.values_mut() {
            let updated = value.subst(&|s| (s.name == sym.name).then(|| expr.clone()));
            *value = updated.simplify();
        }
    }

    /// Unify dimensions declared equal and check the declared constraints
    /// against everything recorded while tracing.
    ///
    /// `equalities` are pairs of dimension sources declared to be equal.
    /// `param_names` are the program's parameter names, used to name
    /// dimensions in messages. Problems are returned as violations rather
    /// than errors, so they can be reported together.
    pub fn produce_guards(
        &mut self,
        equalities: &[(Source, Source)],
        param_names: &[String],
    ) -> Result<GuardReport, ExportError> {
        self.check_not_frozen()?;
        let mut violations = Vec::new();

        for (primary, other) in equalities {
            let (Some(a), Some(b)) = (self.expr_for_source(primary), self.expr_for_source(other))
            else {
                return Err(ExportError::InvalidDynamicShapes(format!(
                    "no dimension recorded for {} or {}",
                    primary, other
                )));
            };
            let hint_a = self.size_hint(&a)?;
            let hint_b = self.size_hint(&b)?;
            if hint_a != hint_b {
                violations.push(Violation {
                    name: self.source_debug_name(other, param_names),
                    message: format!(
                        "The values of {} = {} and {} = {} must always be equal.",
                        other.pretty_name(param_names),
                        hint_b,
                        primary.pretty_name(param_names),
                        hint_a
                    ),
                });
                continue;
            }
            if let (SymExpr::Var(a), SymExpr::Var(b)) = (&a, &b) {
                let (a, b) = (a.clone(), b.clone());
                self.unify(&a, &b);
            }
        }

        for spec in &self.hint_specializations {
            violations.push(Violation {
                name: self.source_debug_name(&spec.source, param_names),
                message: format!(
                    "{} was declared dynamic, but its example size {} is always specialized. \
                     Use an example size of at least 2.",
                    spec.source.pretty_name(param_names),
                    spec.value
                ),
            });
        }

        for info in &self.symbols {
            if !info.declared.contains(info.hint) {
                violations.push(Violation {
                    name: self.debug_name(&info.symbol, param_names),
                    message: format!(
                        "{} = {} is outside of its declared range {}.",
                        self.source_pretty_name(&info.symbol, param_names),
                        info.hint,
                        info.declared
                    ),
                });
            }
        }

        for conflict in &self.range_conflicts {
            violations.push(Violation {
                name: self.debug_name(&conflict.replaced, param_names),
                message: format!(
                    "The traced program requires {} == {}, but their ranges {} and {} do not overlap.",
                    self.source_pretty_name(&conflict.replaced, param_names),
                    self.source_pretty_name(&conflict.kept, param_names),
                    conflict.replaced_range,
                    conflict.kept_range
                ),
            });
        }

        let mut guards = Vec::new();
        for guard in &self.guards {
            let guard = guard.map(|e| self.resolve(e));
            match guard.as_constant() {
                Some(true) => continue,
                Some(false) => {
                    violations.push(Violation {
                        name: guard.to_string(),
                        message: format!("The guard {} can never be satisfied.", guard),
                    });
                    continue;
                }
                None => {}
            }

            if !guard.implied_by(&|sym| self.var_range(sym)) {
                let syms = guard.lhs.free_symbols();
                let syms: Vec<_> = syms
                    .into_iter()
                    .chain(guard.rhs.free_symbols())
                    .collect();
                let name = syms
                    .first()
                    .map(|s| self.debug_name(s, param_names))
                    .unwrap_or_default();
                let ranges: Vec<String> = syms
                    .iter()
                    .map(|s| {
                        format!(
                            "{} in {}",
                            self.source_pretty_name(s, param_names),
                            self.var_range(s)
                        )
                    })
                    .collect();
                violations.push(Violation {
                    name,
                    message: format!(
                        "Not all values of {} satisfy the generated guard {}.",
                        ranges.join(", "),
                        self.pretty_guard(&guard, param_names)
                    ),
                });
            }
            guards.push(guard);
        }

        Ok(GuardReport { guards, violations })
    }

    /// Format a guard with symbols replaced by their source names.
    pub fn pretty_guard(&self, guard: &Guard, param_names: &[String]) -> Guard {
        guard.map(|e| {
            e.subst(&|sym| Some(SymExpr::var(&self.source_pretty_name(sym, param_names))))
        })
    }
}

#[cfg(test)]
mod tests {
    use rten_symbolic::{SymExpr, ValueRange, INT_OO};

    use super::{ConstraintViolation, Guard, Relation, ShapeEnv, ViolationKind};
    use crate::error::ExportError;
    use crate::fake::DimDynamic;
    use crate::source::Source;

    fn param_names() -> Vec<String> {
        vec!["x".to_string(), "y".to_string()]
    }

    fn x_size(dim: usize) -> Source {
        Source::local("args")
            .item(crate::tree::KeyEntry::Index(0))
            .item(crate::tree::KeyEntry::Index(0))
            .size(dim)
    }

    fn y_size(dim: usize) -> Source {
        Source::local("args")
            .item(crate::tree::KeyEntry::Index(0))
            .item(crate::tree::KeyEntry::Index(1))
            .size(dim)
    }

    #[test]
    fn test_create_symbolic_size() {
        let mut env = ShapeEnv::new();

        let s0 = env
            .create_symbolic_size(8, x_size(0), DimDynamic::Dynamic, Some(ValueRange::new(1, 64)))
            .unwrap();
        assert_eq!(s0, SymExpr::pos_var("s0"));
        assert_eq!(env.bound_expr(&s0), ValueRange::new(2, 64));
        assert_eq!(env.size_hint(&s0).unwrap(), 8);

        let fixed = env
            .create_symbolic_size(4, x_size(1), DimDynamic::Static, None)
            .unwrap();
        assert_eq!(fixed, SymExpr::Value(4));

        let specialized = env
            .create_symbolic_size(1, y_size(0), DimDynamic::Dynamic, None)
            .unwrap();
        assert_eq!(specialized, SymExpr::Value(1));

        let report = env.produce_guards(&[], &param_names()).unwrap();
        assert_eq!(report.violations.len(), 1);
        assert!(report.violations[0].message.contains("y.size()[0]"));
    }

    #[test]
    fn test_unify_and_specialize() {
        let mut env = ShapeEnv::new();
        let s0 = env
            .create_symbolic_size(8, x_size(0), DimDynamic::Dynamic, Some(ValueRange::new(0, 64)))
            .unwrap();
        let s1 = env
            .create_symbolic_size(8, y_size(0), DimDynamic::Dynamic, Some(ValueRange::new(4, 128)))
            .unwrap();

        env.evaluate_guard(Guard::new(s1.clone(), Relation::Eq, s0.clone()))
            .unwrap();
        assert_eq!(env.resolve(&s1), s0);
        assert_eq!(env.bound_expr(&s0), ValueRange::new(4, 64));
        assert_eq!(env.root_symbols().count(), 1);

        env.evaluate_guard(Guard::new(s1.clone(), Relation::Eq, SymExpr::Value(8)))
            .unwrap();
        assert_eq!(env.resolve(&s0), SymExpr::Value(8));
        assert_eq!(env.resolve(&s1), SymExpr::Value(8));
        assert_eq!(env.specialized().len(), 1);
    }

    #[test]
    fn test_guard_must_hold_for_hints() {
        let mut env = ShapeEnv::new();
        let s0 = env
            .create_symbolic_size(3, x_size(0), DimDynamic::Dynamic, None)
            .unwrap();
        let err = env
            .evaluate_guard(Guard::new(s0, Relation::Ge, SymExpr::Value(5)))
            .unwrap_err();
        assert!(matches!(err, ExportError::Trace(_)));
    }

    #[test]
    fn test_produce_guards_reports_unimplied_guard() {
        let mut env = ShapeEnv::new();
        let s0 = env
            .create_symbolic_size(
                10,
                x_size(0),
                DimDynamic::Dynamic,
                Some(ValueRange::new(1, 1024)),
            )
            .unwrap();
        env.set_debug_name(&x_size(0), "batch").unwrap();
        env.evaluate_guard(Guard::new(s0, Relation::Ge, SymExpr::Value(5)))
            .unwrap();

        let report = env.produce_guards(&[], &param_names()).unwrap();
        assert_eq!(report.guards.len(), 1);
        assert_eq!(report.violations.len(), 1);

        let violation = ConstraintViolation::from_violations(&report.violations);
        assert_eq!(violation.kind, ViolationKind::Conflict);
        assert_eq!(
            violation.message,
            "Constraints violated (batch)! For more information, run with RTEN_EXPORT_LOG_GUARDS=1.
  - Not all values of x.size()[0] in [2, 1024] satisfy the generated guard x.size()[0] >= 5."
        );
    }

    #[test]
    fn test_produce_guards_declared_equalities() {
        let mut env = ShapeEnv::new();
        env.create_symbolic_size(5, x_size(0), DimDynamic::Dynamic, None)
            .unwrap();
        env.create_symbolic_size(5, y_size(0), DimDynamic::Dynamic, None)
            .unwrap();
        let report = env
            .produce_guards(&[(x_size(0), y_size(0))], &param_names())
            .unwrap();
        assert!(report.violations.is_empty());
        assert_eq!(env.expr_for_source(&y_size(0)), Some(SymExpr::pos_var("s0")));
        assert_eq!(env.bound_expr(&SymExpr::pos_var("s1")), ValueRange::new(2, INT_OO));

        let mut env = ShapeEnv::new();
        env.create_symbolic_size(5, x_size(0), DimDynamic::Dynamic, None)
            .unwrap();
        env.create_symbolic_size(7, y_size(0), DimDynamic::Dynamic, None)
            .unwrap();
        let report = env
            .produce_guards(&[(x_size(0), y_size(0))], &param_names())
            .unwrap();
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].name, "dim0_y");
    }

    #[test]
    fn test_frozen_env_rejects_changes() {
        let mut env = ShapeEnv::new();
        env.freeze();
        assert!(env.is_frozen());
        assert!(matches!(
            env.create_symbolic_size(4, x_size(0), DimDynamic::Dynamic, None),
            Err(ExportError::ShapeEnvFrozen)
        ));
        assert!(matches!(
            env.evaluate_guard(Guard::new(SymExpr::Value(1), Relation::Eq, SymExpr::Value(1))),
            Err(ExportError::ShapeEnvFrozen)
        ));
        assert!(matches!(
            env.produce_guards(&[], &[]),
            Err(ExportError::ShapeEnvFrozen)
        ));
    }
}
