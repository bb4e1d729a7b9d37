//! Export of programs into frozen, lifted graphs.

use std::collections::BTreeMap;

use crate::dynamic_shapes::{process_dynamic_shapes, Constraint, DynamicShapes};
use crate::env::{env_flag, DISABLE_SOLVER_VAR};
use crate::error::ExportError;
use crate::program::ExportedProgram;
use crate::signature::CallSpec;
use crate::trace::{trace, Module};
use crate::tree::Tree;
use crate::value::Value;

mod constraints;
mod fakify;

pub use constraints::{make_constraints, InputConstraints};
pub use fakify::{fakify, make_fake_inputs, make_fake_params_buffers, FakeInputs};

/// Options for [`export`].
#[derive(Clone, Debug)]
pub struct ExportOptions {
    /// Which input dimensions are dynamic.
    pub dynamic_shapes: Option<DynamicShapes>,

    /// Dynamic dimensions declared with [`Constraint::dynamic_dim`].
    ///
    /// This is deprecated in favor of `dynamic_shapes`.
    pub constraints: Option<Vec<Constraint>>,

    /// Skip checking guards against the declared constraints.
    ///
    /// Defaults to the value of the `RTEN_EXPORT_DISABLE_SOLVER` environment
    /// variable.
    pub disable_constraint_solver: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportOptions {
            dynamic_shapes: None,
            constraints: None,
            disable_constraint_solver: env_flag(DISABLE_SOLVER_VAR, false),
        }
    }
}

impl ExportOptions {
    pub fn with_dynamic_shapes(mut self, dynamic_shapes: DynamicShapes) -> Self {
        self.dynamic_shapes = Some(dynamic_shapes);
        self
    }
}

/// Trace `module` with example inputs and return the frozen program.
///
/// Dimensions not declared dynamic in `options` are specialized to the sizes
/// of the example inputs. Fails with [`ExportError::ConstraintViolation`] if
/// the traced program does not work for every size allowed by the declared
/// dynamic dimensions.
pub fn export(
    module: &dyn Module,
    args: Vec<Tree<Value>>,
    kwargs: Vec<(String, Tree<Value>)>,
    options: &ExportOptions,
) -> Result<ExportedProgram, ExportError> {
    let _span = tracing::info_span!("export").entered();

    let param_names = module.param_names();
    let mut constraints = process_dynamic_shapes(
        &param_names,
        &args,
        &kwargs,
        options.dynamic_shapes.as_ref(),
    )?;
    if let Some(legacy) = &options.constraints {
        tracing::warn!(
            "the `constraints` export option is deprecated, use `dynamic_shapes` instead"
        );
        constraints.extend(legacy.iter().cloned());
    }

    let FakeInputs {
        mut fake_mode,
        fake_args,
        source_equalities,
        original_signature,
        in_spec,
    } = make_fake_inputs(module, args, kwargs, &constraints)?;
    let fake_state = make_fake_params_buffers(&fake_mode, module);

    let traced = trace(
        module,
        &mut fake_mode.shape_env,
        fake_args,
        &fake_state,
        &original_signature,
    )?;

    let InputConstraints {
        range_constraints,
        equality_constraints,
    } = make_constraints(
        &mut fake_mode,
        &source_equalities,
        &original_signature,
        &traced.graph,
        &traced.signature,
        options.disable_constraint_solver,
    )?;

    let mut graph = traced.graph;
    let env = &fake_mode.shape_env;
    graph.map_meta(|meta| meta.map_shape(|d| env.resolve(d)));

    let mut state_dict = BTreeMap::new();
    state_dict.extend(module.named_parameters());
    state_dict.extend(module.named_buffers());
    let constants: BTreeMap<_, _> = module.named_constants().into_iter().collect();

    let program = ExportedProgram::new(
        graph,
        traced.signature,
        state_dict,
        constants,
        range_constraints,
        equality_constraints,
        CallSpec {
            in_spec,
            out_spec: traced.out_spec,
        },
    )?;

    tracing::debug!(
        nodes = program.graph().nodes().len(),
        ranges = program.range_constraints().len(),
        "exported program"
    );

    Ok(program)
}

#[cfg(test)]
mod tests {
    use rten_symbolic::ValueRange;
    use rten_tensor::Tensor;

    use super::{export, ExportOptions};
    use crate::dynamic_shapes::{Constraint, Dim, DynamicShapes, ShapeSpec};
    use crate::error::ExportError;
    use crate::shape_env::ViolationKind;
    use crate::trace::{leaf_arg, Module, Traced, Tracer};
    use crate::tree::Tree;
    use crate::value::Value;

    /// Takes the first 4 rows of `x`.
    struct Head;

    impl Module for Head {
        fn param_names(&self) -> Vec<String> {
            vec!["x".into()]
        }

        fn forward(
            &self,
            tx: &mut Tracer,
            inputs: Tree<Traced>,
        ) -> Result<Tree<Traced>, ExportError> {
            let x = leaf_arg(&inputs, 0)?;
            Ok(Tree::Leaf(tx.narrow(x, 0, 0, 4)?))
        }
    }

    /// Multiplies `x` with a fixed-size weight.
    struct Linear;

    impl Module for Linear {
        fn param_names(&self) -> Vec<String> {
            vec!["x".into()]
        }

        fn named_parameters(&self) -> Vec<(String, Tensor<f32>)> {
            vec![("weight".into(), Tensor::zeros(&[4, 2]))]
        }

        fn forward(
            &self,
            tx: &mut Tracer,
            inputs: Tree<Traced>,
        ) -> Result<Tree<Traced>, ExportError> {
            let x = leaf_arg(&inputs, 0)?;
            let w = tx.param("weight")?;
            Ok(Tree::Leaf(tx.matmul(x, w)?))
        }
    }

    fn x_arg(shape: &[usize]) -> Vec<Tree<Value>> {
        vec![Tree::Leaf(Value::Tensor(Tensor::zeros(shape)))]
    }

    fn options(dims: Vec<(usize, Dim)>) -> ExportOptions {
        ExportOptions {
            disable_constraint_solver: false,
            ..Default::default()
        }
        .with_dynamic_shapes(DynamicShapes::ByName(vec![(
            "x".into(),
            ShapeSpec::Dims(dims),
        )]))
    }

    #[test]
    fn test_guard_tighter_than_declared_range() {
        let batch = Dim::new("batch").with_min(1).with_max(64);
        let err = export(&Head, x_arg(&[8, 3]), vec![], &options(vec![(0, batch)])).unwrap_err();
        let ExportError::ConstraintViolation(violation) = err else {
            panic!("expected constraint violation");
        };
        assert_eq!(violation.kind, ViolationKind::Conflict);
        assert!(violation.message.starts_with("Constraints violated (batch)!"));
        assert!(violation
            .message
            .contains("batch = Dim('batch', min=4, max=64)"));

        // A declared range that implies the guard succeeds.
        let batch = Dim::new("batch").with_min(4).with_max(64);
        let program = export(&Head, x_arg(&[8, 3]), vec![], &options(vec![(0, batch)])).unwrap();
        assert_eq!(program.range_constraints()[0].range, ValueRange::new(4, 64));
    }

    #[test]
    fn test_forced_specialization() {
        let feat = Dim::new("feat");
        let err = export(&Linear, x_arg(&[3, 4]), vec![], &options(vec![(1, feat)])).unwrap_err();
        let ExportError::ConstraintViolation(violation) = err else {
            panic!("expected constraint violation");
        };
        assert_eq!(violation.kind, ViolationKind::ForcedSpecialization);
        assert!(violation.message.contains("feat = None  # 4"));
    }

    #[test]
    fn test_disable_constraint_solver() {
        let batch = Dim::new("batch").with_min(1).with_max(64);
        let mut opts = options(vec![(0, batch)]);
        opts.disable_constraint_solver = true;
        let program = export(&Head, x_arg(&[8, 3]), vec![], &opts).unwrap();
        assert_eq!(program.range_constraints()[0].range, ValueRange::new(2, 64));
    }

    #[test]
    fn test_legacy_constraints() {
        let opts = ExportOptions {
            constraints: Some(vec![Constraint::dynamic_dim(0, 0).with_range(2, 16)]),
            disable_constraint_solver: false,
            ..Default::default()
        };
        let program = export(&Linear, x_arg(&[3, 4]), vec![], &opts).unwrap();
        assert_eq!(program.range_constraints().len(), 1);
        assert_eq!(program.range_constraints()[0].range, ValueRange::new(2, 16));
        assert_eq!(program.graph_signature().parameters(), ["weight"]);
    }
}
