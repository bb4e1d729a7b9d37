//! Tracing of programs into lifted graphs.
//!
//! A program implements [`Module`]. Its `forward` method is called once with
//! [`Traced`] handles in place of real tensors and builds the graph by
//! calling operator methods on the [`Tracer`]. Shapes are propagated
//! symbolically, and every decision that depends on the value of a symbolic
//! size is recorded as a guard in the [`ShapeEnv`].

use rten_symbolic::SymExpr;
use rten_tensor::Tensor;
use rustc_hash::FxHashMap;

use crate::error::ExportError;
use crate::fake::{FakeTensor, FakeValue};
use crate::graph::{Graph, GraphForm, NodeId, OpKind};
use crate::shape_env::{Guard, Relation, ShapeEnv};
use crate::signature::{GraphSignature, InputKind, InputSpec, OutputKind, OutputSpec};
use crate::source::{key_path_to_source, sanitize_name};
use crate::tree::{Tree, TreeSpec};
use crate::value::Constant;

/// A program which can be exported.
pub trait Module {
    /// Names of the positional parameters of [`forward`](Module::forward).
    fn param_names(&self) -> Vec<String>;

    /// Trainable weights, by fully qualified name (eg. `fc.weight`).
    fn named_parameters(&self) -> Vec<(String, Tensor<f32>)> {
        Vec::new()
    }

    /// Non-trainable state, which the program may modify with
    /// [`Tracer::copy_`].
    fn named_buffers(&self) -> Vec<(String, Tensor<f32>)> {
        Vec::new()
    }

    /// Constant tensors and opaque objects used by the program.
    fn named_constants(&self) -> Vec<(String, Constant)> {
        Vec::new()
    }

    /// Compute the program's outputs from an `(args, kwargs)` tree of inputs.
    fn forward(&self, tx: &mut Tracer, inputs: Tree<Traced>) -> Result<Tree<Traced>, ExportError>;
}

/// Handle to a value in the graph being traced.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Traced(NodeId);

impl Traced {
    pub fn node_id(self) -> NodeId {
        self.0
    }
}

/// Return positional argument `index` of an `(args, kwargs)` input tree,
/// which must be a single value.
pub fn leaf_arg(inputs: &Tree<Traced>, index: usize) -> Result<Traced, ExportError> {
    inputs
        .arg(index)
        .and_then(Tree::as_leaf)
        .copied()
        .ok_or_else(|| ExportError::Trace(format!("missing positional argument {}", index)))
}

/// Return keyword argument `key` of an `(args, kwargs)` input tree, which
/// must be a single value.
pub fn leaf_kwarg(inputs: &Tree<Traced>, key: &str) -> Result<Traced, ExportError> {
    inputs
        .kwarg(key)
        .and_then(Tree::as_leaf)
        .copied()
        .ok_or_else(|| ExportError::Trace(format!("missing keyword argument \"{}\"", key)))
}

/// Abstract values of the state owned by a module.
#[derive(Clone, Debug, Default)]
pub struct FakeState {
    pub parameters: Vec<(String, FakeTensor)>,
    pub buffers: Vec<(String, FakeTensor)>,

    /// Constants, with `None` for opaque objects.
    pub constants: Vec<(String, Option<FakeTensor>)>,
}

/// Result of tracing a program.
#[derive(Clone, Debug)]
pub struct TraceOutput {
    pub graph: Graph,
    pub signature: GraphSignature,

    /// Structure of the value returned by the program.
    pub out_spec: TreeSpec,
}

/// Records operations performed by a [`Module`] into a graph.
pub struct Tracer<'a> {
    graph: Graph,
    env: &'a mut ShapeEnv,
    input_specs: Vec<InputSpec>,

    /// Placeholder for each piece of state, by kind and fully qualified name.
    state: FxHashMap<(InputKind, String), NodeId>,

    /// Kind of each placeholder.
    placeholder_kinds: FxHashMap<NodeId, InputKind>,

    /// Latest value of placeholders which have been modified in place.
    current: FxHashMap<NodeId, NodeId>,
}

impl<'a> Tracer<'a> {
    fn new(env: &'a mut ShapeEnv) -> Tracer<'a> {
        Tracer {
            graph: Graph::new(GraphForm::Lifted),
            env,
            input_specs: Vec::new(),
            state: FxHashMap::default(),
            placeholder_kinds: FxHashMap::default(),
            current: FxHashMap::default(),
        }
    }

    fn add_input(
        &mut self,
        kind: InputKind,
        name: &str,
        target: Option<&str>,
        meta: Option<FakeTensor>,
    ) -> NodeId {
        let hint = format!("{}{}", kind.name_prefix(), sanitize_name(name));
        let id = self.graph.add_placeholder(&hint, meta);
        self.input_specs.push(InputSpec {
            kind,
            name: self.graph.node_name(id).to_string(),
            target: target.map(|t| t.to_string()),
        });
        self.placeholder_kinds.insert(id, kind);
        if let Some(target) = target {
            self.state.insert((kind, target.to_string()), id);
        }
        id
    }

    fn lookup_state(&self, kind: InputKind, name: &str) -> Result<Traced, ExportError> {
        self.state
            .get(&(kind, name.to_string()))
            .map(|id| Traced(*id))
            .ok_or_else(|| {
                ExportError::Trace(format!("module has no {:?} named \"{}\"", kind, name))
            })
    }

    /// Return the parameter with fully qualified name `name`.
    pub fn param(&self, name: &str) -> Result<Traced, ExportError> {
        self.lookup_state(InputKind::Parameter, name)
    }

    pub fn buffer(&self, name: &str) -> Result<Traced, ExportError> {
        self.lookup_state(InputKind::Buffer, name)
    }

    pub fn constant(&self, name: &str) -> Result<Traced, ExportError> {
        self.lookup_state(InputKind::ConstantTensor, name)
    }

    pub fn custom_object(&self, name: &str) -> Result<Traced, ExportError> {
        self.lookup_state(InputKind::CustomObject, name)
    }

    /// Return the node holding the latest value of `value`.
    fn read(&self, value: Traced) -> NodeId {
        self.current.get(&value.0).copied().unwrap_or(value.0)
    }

    fn meta(&self, value: Traced) -> Result<FakeTensor, ExportError> {
        let id = self.read(value);
        let node = self
            .graph
            .node(id)
            .ok_or_else(|| ExportError::Trace(format!("unknown value {}", id)))?;
        node.meta()
            .map(|m| m.map_shape(|d| self.env.resolve(d)))
            .ok_or_else(|| ExportError::Trace(format!("\"{}\" is not a tensor", node.name())))
    }

    /// Return the shape of a traced tensor.
    pub fn shape(&self, value: Traced) -> Result<Vec<SymExpr>, ExportError> {
        Ok(self.meta(value)?.shape().to_vec())
    }

    /// Return the example value of a size.
    pub fn size_hint(&self, size: &SymExpr) -> Result<i64, ExportError> {
        self.env.size_hint(size)
    }

    fn require_equal(&mut self, a: &SymExpr, b: &SymExpr) -> Result<SymExpr, ExportError> {
        if a != b {
            self.env
                .evaluate_guard(Guard::new(a.clone(), Relation::Eq, b.clone()))?;
        }
        Ok(self.env.resolve(a))
    }

    /// Compute the shape resulting from broadcasting two shapes together.
    fn broadcast_shapes(
        &mut self,
        a: &[SymExpr],
        b: &[SymExpr],
    ) -> Result<Vec<SymExpr>, ExportError> {
        let ndim = a.len().max(b.len());
        let one = SymExpr::Value(1);
        let a_iter = std::iter::repeat(&one).take(ndim - a.len()).chain(a);
        let b_iter = std::iter::repeat(&one).take(ndim - b.len()).chain(b);

        let mut out_shape = Vec::with_capacity(ndim);
        for (a_dim, b_dim) in a_iter.zip(b_iter) {
            let dim = match (a_dim, b_dim) {
                (a, b) if a == b => a.clone(),
                (SymExpr::Value(1), b) => b.clone(),
                (a, SymExpr::Value(1)) => a.clone(),
                (a, b) => {
                    // Sizes of 0 or 1 are never symbolic, so the sizes must
                    // be equal for broadcasting to succeed.
                    if self.env.size_hint(a)? != self.env.size_hint(b)? {
                        return Err(ExportError::Trace(format!(
                            "sizes {} and {} cannot be broadcast together",
                            a, b
                        )));
                    }
                    self.require_equal(a, b)?
                }
            };
            out_shape.push(dim);
        }
        Ok(out_shape)
    }

    fn add_op(
        &mut self,
        op: OpKind,
        inputs: &[Traced],
        shape: Vec<SymExpr>,
    ) -> Traced {
        let inputs = inputs.iter().map(|t| self.read(*t)).collect();
        Traced(self.graph.add_call(op, inputs, Some(FakeTensor::new(shape))))
    }

    fn binary_op(&mut self, op: OpKind, a: Traced, b: Traced) -> Result<Traced, ExportError> {
        let a_meta = self.meta(a)?;
        let b_meta = self.meta(b)?;
        let shape = self.broadcast_shapes(a_meta.shape(), b_meta.shape())?;
        Ok(self.add_op(op, &[a, b], shape))
    }

    /// Elementwise addition with broadcasting.
    pub fn add(&mut self, a: Traced, b: Traced) -> Result<Traced, ExportError> {
        self.binary_op(OpKind::Add, a, b)
    }

    pub fn sub(&mut self, a: Traced, b: Traced) -> Result<Traced, ExportError> {
        self.binary_op(OpKind::Sub, a, b)
    }

    pub fn mul(&mut self, a: Traced, b: Traced) -> Result<Traced, ExportError> {
        self.binary_op(OpKind::Mul, a, b)
    }

    /// Matrix product of two 2D tensors.
    pub fn matmul(&mut self, a: Traced, b: Traced) -> Result<Traced, ExportError> {
        let a_meta = self.meta(a)?;
        let b_meta = self.meta(b)?;
        let ([m, k_a], [k_b, n]) = (a_meta.shape(), b_meta.shape()) else {
            return Err(ExportError::Trace(format!(
                "matmul expects 2D inputs but got shapes {} and {}",
                a_meta, b_meta
            )));
        };
        self.require_equal(k_a, k_b)?;
        let shape = vec![self.env.resolve(m), self.env.resolve(n)];
        Ok(self.add_op(OpKind::MatMul, &[a, b], shape))
    }

    pub fn relu(&mut self, x: Traced) -> Result<Traced, ExportError> {
        let shape = self.shape(x)?;
        Ok(self.add_op(OpKind::Relu, &[x], shape))
    }

    pub fn neg(&mut self, x: Traced) -> Result<Traced, ExportError> {
        let shape = self.shape(x)?;
        Ok(self.add_op(OpKind::Neg, &[x], shape))
    }

    /// Slice `len` entries starting at `start` along dimension `dim`.
    pub fn narrow(
        &mut self,
        x: Traced,
        dim: usize,
        start: usize,
        len: usize,
    ) -> Result<Traced, ExportError> {
        let mut shape = self.shape(x)?;
        let Some(size) = shape.get(dim) else {
            return Err(ExportError::Trace(format!(
                "narrow dim {} is out of range for a tensor with {} dims",
                dim,
                shape.len()
            )));
        };
        let end = SymExpr::from(start + len);
        self.env
            .evaluate_guard(Guard::new(size.clone(), Relation::Ge, end))?;
        shape[dim] = SymExpr::from(len);
        Ok(self.add_op(OpKind::Narrow { dim, start, len }, &[x], shape))
    }

    /// Copy `src` into `dst` in place.
    ///
    /// `dst` must be a buffer or user input. The graph stays functional: later
    /// reads of `dst` see `src`, and the new value is returned from the graph
    /// as a mutation output.
    pub fn copy_(&mut self, dst: Traced, src: Traced) -> Result<Traced, ExportError> {
        let root = if self.placeholder_kinds.contains_key(&dst.0) {
            dst.0
        } else {
            self.current
                .iter()
                .find(|(_, value)| **value == dst.0)
                .map(|(root, _)| *root)
                .ok_or_else(|| {
                    ExportError::Trace(
                        "copy_ destination must be a buffer or user input".to_string(),
                    )
                })?
        };

        match self.placeholder_kinds.get(&root) {
            Some(InputKind::Buffer) | Some(InputKind::UserInput) => {}
            Some(kind) => {
                return Err(ExportError::Trace(format!(
                    "cannot modify \"{}\" in place because it is a {:?}",
                    self.graph.node_name(root),
                    kind
                )))
            }
            None => {
                return Err(ExportError::Trace(
                    "copy_ destination must be a buffer or user input".to_string(),
                ))
            }
        }

        let dst_meta = self.meta(dst)?;
        let src_meta = self.meta(src)?;
        if dst_meta.ndim() != src_meta.ndim() {
            return Err(ExportError::Trace(format!(
                "copy_ source shape {} does not match destination shape {}",
                src_meta, dst_meta
            )));
        }
        for (d, s) in dst_meta.shape().iter().zip(src_meta.shape()) {
            self.require_equal(d, s)?;
        }

        let value = self.read(src);
        self.current.insert(root, value);
        Ok(Traced(root))
    }
}

/// Trace `module` with abstract inputs.
///
/// Placeholders are created for parameters, buffers and constants, followed
/// by user inputs in flattening order. Outputs are buffer and user input
/// mutations, in input order, followed by the values returned by the
/// program.
pub fn trace(
    module: &dyn Module,
    env: &mut ShapeEnv,
    fake_args: Tree<FakeValue>,
    state: &FakeState,
    param_names: &[String],
) -> Result<TraceOutput, ExportError> {
    let _span = tracing::info_span!("trace").entered();
    let mut tx = Tracer::new(env);

    for (name, fake) in &state.parameters {
        tx.add_input(InputKind::Parameter, name, Some(name), Some(fake.clone()));
    }
    for (name, fake) in &state.buffers {
        tx.add_input(InputKind::Buffer, name, Some(name), Some(fake.clone()));
    }
    for (name, fake) in &state.constants {
        let kind = if fake.is_some() {
            InputKind::ConstantTensor
        } else {
            InputKind::CustomObject
        };
        tx.add_input(kind, name, Some(name), fake.clone());
    }

    let inputs = fake_args.try_map_with_path(&mut |path, value| -> Result<Traced, ExportError> {
        let name = key_path_to_source(path).pretty_name(param_names);
        let meta = match value {
            FakeValue::Tensor(t) => Some(t),
            FakeValue::Opaque(_) => None,
        };
        Ok(Traced(tx.add_input(InputKind::UserInput, &name, None, meta)))
    })?;

    let outputs = module.forward(&mut tx, inputs)?;

    let mut output_values = Vec::new();
    let mut output_specs = Vec::new();
    for spec in &tx.input_specs {
        let Some(placeholder) = tx
            .graph
            .placeholders()
            .find(|n| n.name() == spec.name)
            .map(|n| n.id())
        else {
            continue;
        };
        let Some(value) = tx.current.get(&placeholder).copied() else {
            continue;
        };
        if value == placeholder {
            continue;
        }
        let (kind, target) = match spec.kind {
            InputKind::Buffer => (OutputKind::BufferMutation, spec.target.clone()),
            _ => (OutputKind::UserInputMutation, Some(spec.name.clone())),
        };
        output_values.push(value);
        output_specs.push(OutputSpec {
            kind,
            name: tx.graph.node_name(value).to_string(),
            target,
        });
    }

    let out_spec = outputs.spec();
    let (user_outputs, _) = outputs.flatten();
    for value in user_outputs {
        let id = tx.read(value);
        output_values.push(id);
        output_specs.push(OutputSpec {
            kind: OutputKind::UserOutput,
            name: tx.graph.node_name(id).to_string(),
            target: None,
        });
    }

    let Tracer {
        mut graph,
        input_specs,
        ..
    } = tx;
    graph.set_output(output_values);
    graph.lint()?;

    tracing::debug!(
        nodes = graph.nodes().len(),
        inputs = input_specs.len(),
        outputs = output_specs.len(),
        "traced graph"
    );

    Ok(TraceOutput {
        graph,
        signature: GraphSignature {
            input_specs,
            output_specs,
        },
        out_spec,
    })
}
