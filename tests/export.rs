use std::collections::BTreeMap;

use rten_export::aot::{aot_compile, aot_load, AotOptions, ArchiveBackend, Device};
use rten_export::archive::{load, save};
use rten_export::dynamic_shapes::{Dim, DynamicShapes, ShapeSpec};
use rten_export::graph_module::CallError;
use rten_export::program::InputDim;
use rten_export::trace::{leaf_arg, leaf_kwarg, Module, Traced, Tracer};
use rten_export::{export, ExportError, ExportOptions, InputKind, Tree, Value, ViolationKind};
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

fn tensor(shape: &[usize]) -> Tree<Value> {
    Tree::Leaf(Value::Tensor(Tensor::zeros(shape)))
}

fn tensor_from(shape: &[usize], data: Vec<f32>) -> Tree<Value> {
    Tree::Leaf(Value::Tensor(Tensor::from_data(shape, data)))
}

fn output_tensor(tree: &Tree<Value>) -> &Tensor<f32> {
    tree.as_leaf()
        .and_then(Value::as_tensor)
        .expect("output should be a tensor")
}

fn options(dynamic_shapes: DynamicShapes) -> ExportOptions {
    ExportOptions {
        disable_constraint_solver: false,
        ..Default::default()
    }
    .with_dynamic_shapes(dynamic_shapes)
}

/// `relu(x)`
struct Relu;

impl Module for Relu {
    fn param_names(&self) -> Vec<String> {
        vec!["x".into()]
    }

    fn forward(&self, tx: &mut Tracer, inputs: Tree<Traced>) -> Result<Tree<Traced>, ExportError> {
        let x = leaf_arg(&inputs, 0)?;
        Ok(Tree::Leaf(tx.relu(x)?))
    }
}

#[test]
fn test_dynamic_batch_with_static_features() {
    let batch = Dim::new("batch").with_min(1).with_max(1024);
    let program = export(
        &Relu,
        vec![tensor(&[8, 4])],
        vec![],
        &options(DynamicShapes::ByName(vec![(
            "x".into(),
            ShapeSpec::Dims(vec![(0, batch)]),
        )])),
    )
    .unwrap();

    let ranges = program.range_constraints();
    assert_eq!(ranges.len(), 1);
    let range = ranges[0].range;
    assert!(range.lower >= 1 && range.upper <= 1024);
    assert_eq!(range.upper, 1024);
    assert!(program.equality_constraints().is_empty());

    let mut module = program.module().unwrap();

    let x = Tensor::from_data(&[1024, 4], vec![-1.; 1024 * 4]);
    let output = module
        .call(vec![Tree::Leaf(Value::Tensor(x))], vec![])
        .unwrap();
    assert_eq!(output_tensor(&output).shape(), &[1024, 4]);
    assert!(output_tensor(&output).iter().all(|&x| x == 0.));

    // Sizes 0 and 1 are within the declared range, although the example
    // must be at least 2.
    let output = module.call(vec![tensor(&[1, 4])], vec![]).unwrap();
    assert_eq!(output_tensor(&output).shape(), &[1, 4]);

    let err = module.call(vec![tensor(&[2000, 4])], vec![]).unwrap_err();
    assert!(matches!(
        err,
        CallError::RangeViolation {
            ref input,
            dim: 0,
            actual: 2000,
            ..
        } if input == "x"
    ));

    let err = module.call(vec![tensor(&[10, 5])], vec![]).unwrap_err();
    assert_eq!(
        err,
        CallError::StaticDimMismatch {
            input: "x".into(),
            dim: 1,
            expected: 4,
            actual: 5,
        }
    );
}

/// `(relu(a), relu(b))`
struct Pair;

impl Module for Pair {
    fn param_names(&self) -> Vec<String> {
        vec!["a".into(), "b".into()]
    }

    fn forward(&self, tx: &mut Tracer, inputs: Tree<Traced>) -> Result<Tree<Traced>, ExportError> {
        let a = leaf_arg(&inputs, 0)?;
        let b = leaf_arg(&inputs, 1)?;
        Ok(Tree::Tuple(vec![
            Tree::Leaf(tx.relu(a)?),
            Tree::Leaf(tx.relu(b)?),
        ]))
    }
}

#[test]
fn test_shared_dynamic_dim() {
    let len = Dim::new("len").with_max(100);
    let shapes = DynamicShapes::ByName(vec![
        ("a".into(), ShapeSpec::Dims(vec![(0, len.clone())])),
        ("b".into(), ShapeSpec::Dims(vec![(0, len)])),
    ]);
    let program = export(
        &Pair,
        vec![tensor(&[6]), tensor(&[6])],
        vec![],
        &options(shapes),
    )
    .unwrap();

    assert_eq!(
        program.equality_constraints(),
        [(
            InputDim {
                input_name: "a".into(),
                dim: 0
            },
            InputDim {
                input_name: "b".into(),
                dim: 0
            }
        )]
    );
    assert_eq!(program.range_constraints().len(), 1);

    let mut module = program.module().unwrap();
    let output = module
        .call(vec![tensor(&[7]), tensor(&[7])], vec![])
        .unwrap();
    assert!(matches!(output, Tree::Tuple(ref items) if items.len() == 2));

    let err = module
        .call(vec![tensor(&[5]), tensor(&[7])], vec![])
        .unwrap_err();
    assert!(matches!(
        err,
        CallError::SymbolMismatch {
            actual: 7,
            expected: 5,
            ..
        }
    ));

    // The lifted program performs the same checks.
    let err = program
        .run(vec![tensor(&[5]), tensor(&[7])], vec![])
        .unwrap_err();
    assert!(matches!(err, CallError::SymbolMismatch { .. }));
}

/// `a + b`
struct Sum;

impl Module for Sum {
    fn param_names(&self) -> Vec<String> {
        vec!["a".into(), "b".into()]
    }

    fn forward(&self, tx: &mut Tracer, inputs: Tree<Traced>) -> Result<Tree<Traced>, ExportError> {
        let a = leaf_arg(&inputs, 0)?;
        let b = leaf_arg(&inputs, 1)?;
        Ok(Tree::Leaf(tx.add(a, b)?))
    }
}

#[test]
fn test_equality_implied_by_broadcast() {
    // `a` and `b` use different dims, but adding them requires equal sizes.
    let shapes = DynamicShapes::ByName(vec![
        ("a".into(), ShapeSpec::Dims(vec![(0, Dim::new("n"))])),
        ("b".into(), ShapeSpec::Dims(vec![(0, Dim::new("m"))])),
    ]);
    let program = export(
        &Sum,
        vec![tensor(&[3]), tensor(&[3])],
        vec![],
        &options(shapes),
    )
    .unwrap();

    assert_eq!(
        program.equality_constraints(),
        [(
            InputDim {
                input_name: "a".into(),
                dim: 0
            },
            InputDim {
                input_name: "b".into(),
                dim: 0
            }
        )]
    );
    assert_eq!(program.range_constraints().len(), 1);
}

#[test]
fn test_example_outside_declared_range() {
    let batch = Dim::new("batch").with_min(16).with_max(32);
    let err = export(
        &Relu,
        vec![tensor(&[8, 4])],
        vec![],
        &options(DynamicShapes::ByName(vec![(
            "x".into(),
            ShapeSpec::Dims(vec![(0, batch)]),
        )])),
    )
    .unwrap_err();
    let ExportError::ConstraintViolation(violation) = err else {
        panic!("expected a constraint violation");
    };
    assert!(violation.message.contains("outside of its declared range"));
}

#[test]
fn test_single_value_range_is_forced_specialization() {
    let batch = Dim::new("batch").with_min(8).with_max(8);
    let err = export(
        &Relu,
        vec![tensor(&[8, 4])],
        vec![],
        &options(DynamicShapes::ByName(vec![(
            "x".into(),
            ShapeSpec::Dims(vec![(0, batch)]),
        )])),
    )
    .unwrap_err();
    let ExportError::ConstraintViolation(violation) = err else {
        panic!("expected a constraint violation");
    };
    assert_eq!(violation.kind, ViolationKind::ForcedSpecialization);
    assert!(violation.message.contains("(batch)"));
}

/// Linear layer with a counter that doubles on every call.
///
/// `forward(x) = x @ weight + bias`
struct Linear {
    weight: Tensor<f32>,
    bias: Tensor<f32>,
}

impl Linear {
    fn new() -> Linear {
        Linear {
            weight: Tensor::from_data(&[3, 2], vec![1., 0., 0., 1., 1., 1.]),
            bias: Tensor::from_data(&[2], vec![0.5, -0.5]),
        }
    }
}

impl Module for Linear {
    fn param_names(&self) -> Vec<String> {
        vec!["x".into()]
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<f32>)> {
        vec![
            ("fc.weight".into(), self.weight.clone()),
            ("fc.bias".into(), self.bias.clone()),
        ]
    }

    fn named_buffers(&self) -> Vec<(String, Tensor<f32>)> {
        vec![("calls".into(), Tensor::from_data(&[1], vec![1.]))]
    }

    fn forward(&self, tx: &mut Tracer, inputs: Tree<Traced>) -> Result<Tree<Traced>, ExportError> {
        let x = leaf_arg(&inputs, 0)?;
        let weight = tx.param("fc.weight")?;
        let bias = tx.param("fc.bias")?;
        let calls = tx.buffer("calls")?;

        let doubled = tx.add(calls, calls)?;
        tx.copy_(calls, doubled)?;

        let xw = tx.matmul(x, weight)?;
        Ok(Tree::Leaf(tx.add(xw, bias)?))
    }
}

fn batch_shapes() -> DynamicShapes {
    DynamicShapes::ByName(vec![(
        "x".into(),
        ShapeSpec::Dims(vec![(0, Dim::new("batch").with_max(64))]),
    )])
}

#[test]
fn test_lift_unlift_round_trip() {
    let program = export(
        &Linear::new(),
        vec![tensor(&[4, 3])],
        vec![],
        &options(batch_shapes()),
    )
    .unwrap();

    let kinds: Vec<InputKind> = program
        .graph_signature()
        .input_specs
        .iter()
        .map(|spec| spec.kind)
        .collect();
    assert_eq!(
        kinds,
        [
            InputKind::Parameter,
            InputKind::Parameter,
            InputKind::Buffer,
            InputKind::UserInput
        ]
    );

    let module = program.module().unwrap();
    assert!(module.graph().placeholders().count() == 1);

    let lifted = module.lift().unwrap();
    assert_eq!(
        lifted.graph_signature().input_specs,
        program.graph_signature().input_specs
    );
    assert_eq!(lifted.state_dict(), program.state_dict());
    assert_eq!(lifted.range_constraints(), program.range_constraints());

    let x = || tensor_from(&[2, 3], vec![1., 2., 3., 4., 5., 6.]);
    let expected = program.run(vec![x()], vec![]).unwrap();
    let actual = lifted.run(vec![x()], vec![]).unwrap();
    assert_eq!(actual, expected);
    assert_eq!(
        output_tensor(&expected),
        &Tensor::from_data(&[2, 2], vec![4.5, 4.5, 10.5, 10.5])
    );
}

#[test]
fn test_buffer_mutation() {
    let program = export(
        &Linear::new(),
        vec![tensor(&[4, 3])],
        vec![],
        &options(batch_shapes()),
    )
    .unwrap();

    let mutated: Vec<_> = program
        .graph_signature()
        .mutated_outputs()
        .map(|spec| spec.target.clone())
        .collect();
    assert_eq!(mutated, [Some("calls".to_string())]);

    let mut module = program.module().unwrap();
    let x = || tensor_from(&[1, 3], vec![1., 1., 1.]);
    module.call(vec![x()], vec![]).unwrap();
    module.call(vec![x()], vec![]).unwrap();
    assert_eq!(module.buffer("calls").map(|t| t.to_vec()), Some(vec![4.]));

    // The exported program's state is not modified by running it.
    program.run(vec![x()], vec![]).unwrap();
    assert_eq!(program.state_dict()["calls"].to_vec(), [1.]);
}

#[test]
fn test_save_and_load_preserve_behavior() {
    let program = export(
        &Linear::new(),
        vec![tensor(&[4, 3])],
        vec![],
        &options(batch_shapes()),
    )
    .unwrap();

    let mut buf = Vec::new();
    let mut extra = BTreeMap::new();
    extra.insert("README".to_string(), "linear layer".to_string());
    save(&program, &mut buf, &extra).unwrap();
    let loaded = load(&buf).unwrap();

    assert_eq!(loaded.range_constraints(), program.range_constraints());
    let x = || tensor_from(&[2, 3], vec![1., 0., 0., 0., 1., 0.]);
    assert_eq!(
        loaded.run(vec![x()], vec![]).unwrap(),
        program.run(vec![x()], vec![]).unwrap()
    );

    let err = loaded.run(vec![tensor(&[65, 3])], vec![]).unwrap_err();
    assert!(matches!(err, CallError::RangeViolation { .. }));
}

/// Returns `{"scaled": x * scale, "shifted": x + shift}`, taking `scale` and
/// `shift` as keyword arguments.
struct ScaleShift;

impl Module for ScaleShift {
    fn param_names(&self) -> Vec<String> {
        vec!["x".into()]
    }

    fn forward(&self, tx: &mut Tracer, inputs: Tree<Traced>) -> Result<Tree<Traced>, ExportError> {
        let x = leaf_arg(&inputs, 0)?;
        let scale = leaf_kwarg(&inputs, "scale")?;
        let shift = leaf_kwarg(&inputs, "shift")?;
        Ok(Tree::Dict(vec![
            ("scaled".into(), Tree::Leaf(tx.mul(x, scale)?)),
            ("shifted".into(), Tree::Leaf(tx.add(x, shift)?)),
        ]))
    }
}

#[test]
fn test_aot_compile_and_load() {
    let dir = std::env::temp_dir().join(format!("rten-export-aot-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let aot_options = AotOptions {
        output_path: Some(dir.join("scale_shift.rtxa")),
        ..Default::default()
    };

    let path = aot_compile(
        &ScaleShift,
        vec![tensor(&[2])],
        vec![
            ("scale".into(), tensor(&[1])),
            ("shift".into(), tensor(&[1])),
        ],
        &ExportOptions::default(),
        &ArchiveBackend,
        &aot_options,
    )
    .unwrap();
    assert_eq!(Some(&path), aot_options.output_path.as_ref());

    let err = aot_load(&path, "tpu", &ArchiveBackend).err().unwrap();
    assert!(matches!(err, ExportError::UnsupportedDevice(_)));

    let mut module = aot_load(&path, "cpu", &ArchiveBackend).unwrap();
    assert_eq!(module.device(), Device::Cpu);

    // Keyword arguments are passed in a different order than at export time.
    let output = module
        .call(
            vec![tensor_from(&[2], vec![1., 2.])],
            vec![
                ("shift".into(), tensor_from(&[1], vec![10.])),
                ("scale".into(), tensor_from(&[1], vec![3.])),
            ],
        )
        .unwrap();

    let Tree::Dict(items) = output else {
        panic!("expected a dict output");
    };
    let keys: Vec<&str> = items.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, ["scaled", "shifted"]);
    assert_eq!(
        output_tensor(&items[0].1),
        &Tensor::from_data(&[2], vec![3., 6.])
    );
    assert_eq!(
        output_tensor(&items[1].1),
        &Tensor::from_data(&[2], vec![11., 12.])
    );

    std::fs::remove_dir_all(&dir).unwrap();
}
