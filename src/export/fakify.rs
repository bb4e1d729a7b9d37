//! Creation of fake inputs for tracing.

use rten_tensor::prelude::*;
use rustc_hash::FxHashMap;

use crate::dynamic_shapes::{Constraint, DimRef, TensorId};
use crate::error::ExportError;
use crate::fake::{FakeTensorMode, FakeValue, SymbolicContext};
use crate::shape_env::ShapeEnv;
use crate::source::{key_path_to_source, Source};
use crate::trace::{FakeState, Module};
use crate::tree::{KeyEntry, Tree, TreeSpec};
use crate::value::{Constant, Value};

/// Fake counterparts of a program's example inputs.
pub struct FakeInputs {
    pub fake_mode: FakeTensorMode,
    pub fake_args: Tree<FakeValue>,

    /// Pairs of dimension sources declared equal.
    pub source_equalities: Vec<(Source, Source)>,

    /// Names of the program's positional parameters.
    pub original_signature: Vec<String>,

    /// Structure of the `(args, kwargs)` call tree.
    pub in_spec: TreeSpec,
}

/// Create the fake value of input leaf `t_id` at `path`.
///
/// Dimensions named in `t_constraints` are given symbols, and their sources
/// recorded in `sources`.
pub fn fakify(
    mode: &mut FakeTensorMode,
    path: &[KeyEntry],
    value: Value,
    t_constraints: &FxHashMap<TensorId, Vec<&Constraint>>,
    t_id: TensorId,
    sources: &mut FxHashMap<DimRef, Source>,
    param_names: &[String],
) -> Result<FakeValue, ExportError> {
    let source = key_path_to_source(path);
    let tensor = match value {
        Value::Tensor(tensor) => tensor,
        Value::Opaque(handle) => return Ok(FakeValue::Opaque(handle)),
        other => {
            return Err(ExportError::InvalidInputKind {
                path: source.pretty_name(param_names),
                kind: other.kind_name(),
            })
        }
    };

    let shape = tensor.shape().to_vec();
    let mut context = SymbolicContext::all_static(shape.len());
    for constraint in t_constraints.get(&t_id).into_iter().flatten() {
        let dim = constraint.target.dim;
        if dim >= shape.len() {
            return Err(ExportError::InvalidDynamicShapes(format!(
                "dim {} of {} is out of range for a tensor with {} dims",
                dim,
                source.pretty_name(param_names),
                shape.len()
            )));
        }
        context.set_dynamic(dim, constraint.range);
        let dim_source = source.size(dim);
        if let Some(name) = &constraint.debug_name {
            mode.shape_env.set_debug_name(&dim_source, name)?;
        }
        sources.insert(constraint.target, dim_source);
    }

    let fake = mode.from_tensor(&tensor, source, context)?;
    Ok(FakeValue::Tensor(fake))
}

/// Create fake values for the example inputs of a program.
///
/// Leaves are visited in flattening order, which is also the order in which
/// tracing creates user input placeholders.
pub fn make_fake_inputs(
    module: &dyn Module,
    args: Vec<Tree<Value>>,
    kwargs: Vec<(String, Tree<Value>)>,
    constraints: &[Constraint],
) -> Result<FakeInputs, ExportError> {
    let _span = tracing::debug_span!("make_fake_inputs").entered();

    let original_signature = module.param_names();
    let mut fake_mode = FakeTensorMode::new(ShapeEnv::new());

    let mut t_constraints: FxHashMap<TensorId, Vec<&Constraint>> = FxHashMap::default();
    for constraint in constraints {
        t_constraints
            .entry(constraint.target.t_id)
            .or_default()
            .push(constraint);
    }

    let inputs = Tree::call_args(args, kwargs);
    let in_spec = inputs.spec();
    let num_leaves = in_spec.num_leaves();
    if let Some(c) = constraints.iter().find(|c| c.target.t_id >= num_leaves) {
        return Err(ExportError::InvalidDynamicShapes(format!(
            "constraint refers to input {} but there are only {} inputs",
            c.target.t_id, num_leaves
        )));
    }

    let mut sources = FxHashMap::default();
    let mut t_id = 0;
    let fake_args = inputs.try_map_with_path(&mut |path, value| {
        let fake = fakify(
            &mut fake_mode,
            path,
            value,
            &t_constraints,
            t_id,
            &mut sources,
            &original_signature,
        );
        t_id += 1;
        fake
    })?;

    let mut source_equalities = Vec::new();
    for constraint in constraints {
        let Some(shared) = constraint.shared else {
            continue;
        };
        let (Some(primary), Some(other)) = (sources.get(&shared), sources.get(&constraint.target))
        else {
            return Err(ExportError::InvalidDynamicShapes(format!(
                "shared dimension {:?} is not declared dynamic",
                shared
            )));
        };
        source_equalities.push((primary.clone(), other.clone()));
    }

    Ok(FakeInputs {
        fake_mode,
        fake_args,
        source_equalities,
        original_signature,
        in_spec,
    })
}

/// Create static fake values for a module's parameters, buffers and
/// constants.
pub fn make_fake_params_buffers(fake_mode: &FakeTensorMode, module: &dyn Module) -> FakeState {
    let parameters = module
        .named_parameters()
        .into_iter()
        .map(|(name, t)| (name, fake_mode.from_tensor_static(&t)))
        .collect();
    let buffers = module
        .named_buffers()
        .into_iter()
        .map(|(name, t)| (name, fake_mode.from_tensor_static(&t)))
        .collect();
    let constants = module
        .named_constants()
        .into_iter()
        .map(|(name, c)| {
            let fake = match &c {
                Constant::Tensor(t) => Some(fake_mode.from_tensor_static(t)),
                Constant::Object(_) => None,
            };
            (name, fake)
        })
        .collect();
    FakeState {
        parameters,
        buffers,
        constants,
    }
}

#[cfg(test)]
mod tests {
    use rten_symbolic::{SymExpr, ValueRange};
    use rten_tensor::Tensor;

    use super::{make_fake_inputs, make_fake_params_buffers};
    use crate::dynamic_shapes::Constraint;
    use crate::error::ExportError;
    use crate::fake::{FakeTensor, FakeValue};
    use crate::trace::{Module, Traced, Tracer};
    use crate::tree::Tree;
    use crate::value::{OpaqueHandle, Value};

    struct Identity;

    impl Module for Identity {
        fn param_names(&self) -> Vec<String> {
            vec!["a".into(), "b".into()]
        }

        fn named_parameters(&self) -> Vec<(String, Tensor<f32>)> {
            vec![("w".into(), Tensor::zeros(&[3, 3]))]
        }

        fn forward(
            &self,
            _tx: &mut Tracer,
            inputs: Tree<Traced>,
        ) -> Result<Tree<Traced>, ExportError> {
            Ok(inputs)
        }
    }

    fn tensor(shape: &[usize]) -> Tree<Value> {
        Tree::Leaf(Value::Tensor(Tensor::zeros(shape)))
    }

    #[test]
    fn test_make_fake_inputs() {
        let a = Constraint::dynamic_dim(0, 0).with_range(1, 100);
        let b = Constraint::dynamic_dim(1, 0).equal_to(&a);
        let inputs = make_fake_inputs(
            &Identity,
            vec![tensor(&[5, 2]), tensor(&[5])],
            vec![(
                "tok".into(),
                Tree::Leaf(Value::Opaque(OpaqueHandle::new("Tokenizer", 0))),
            )],
            &[a, b],
        )
        .unwrap();

        let leaves = inputs.fake_args.leaves();
        assert_eq!(
            leaves[0],
            &FakeValue::Tensor(FakeTensor::new(vec![SymExpr::pos_var("s0"), SymExpr::Value(2)]))
        );
        assert_eq!(
            leaves[1],
            &FakeValue::Tensor(FakeTensor::new(vec![SymExpr::pos_var("s1")]))
        );
        assert!(matches!(leaves[2], FakeValue::Opaque(_)));

        assert_eq!(inputs.source_equalities.len(), 1);
        let (primary, other) = &inputs.source_equalities[0];
        assert_eq!(primary.name(), "args[0][0].size()[0]");
        assert_eq!(other.name(), "args[0][1].size()[0]");
        assert_eq!(inputs.original_signature, ["a", "b"]);
        assert_eq!(inputs.fake_mode.shape_env.tracked_fakes().len(), 2);
        assert_eq!(
            inputs
                .fake_mode
                .shape_env
                .var_range(SymExpr::pos_var("s0").as_symbol().unwrap()),
            ValueRange::new(2, 100)
        );

        let state = make_fake_params_buffers(&inputs.fake_mode, &Identity);
        assert_eq!(state.parameters[0].1, FakeTensor::from_shape(&[3, 3]));
        assert!(state.buffers.is_empty());
    }

    #[test]
    fn test_invalid_inputs() {
        let err = make_fake_inputs(&Identity, vec![Tree::Leaf(Value::Int(3))], vec![], &[])
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "unsupported input at a: only tensors and opaque objects are allowed, got int"
        );

        let err = make_fake_inputs(
            &Identity,
            vec![tensor(&[4])],
            vec![],
            &[Constraint::dynamic_dim(0, 1)],
        )
        .err()
        .unwrap();
        assert!(matches!(err, ExportError::InvalidDynamicShapes(_)));
    }
}
