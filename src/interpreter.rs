//! Reference interpreter for exported graphs.

use std::iter::repeat;

use rten_tensor::prelude::*;
use rten_tensor::Tensor;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::graph::{Graph, NodeId, NodeOp, OpKind};
use crate::value::Value;

/// Errors that occur when executing a graph.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RunError {
    #[error("graph expects {expected} inputs but {actual} were provided")]
    InputCountMismatch { expected: usize, actual: usize },

    #[error("graph module has no attribute \"{0}\"")]
    MissingAttr(String),

    #[error("operator \"{node}\" expected a tensor input but got {kind}")]
    ExpectedTensor { node: String, kind: &'static str },

    #[error("operator \"{node}\" received incompatible shapes {a:?} and {b:?}")]
    IncompatibleShapes {
        node: String,
        a: Vec<usize>,
        b: Vec<usize>,
    },

    #[error("operator \"{node}\" is invalid: {reason}")]
    InvalidOp { node: String, reason: String },

    #[error("graph is malformed: {0}")]
    InvalidGraph(String),
}

/// Destination of an in-place copy made while running a graph.
#[derive(Clone, Debug, PartialEq)]
pub enum CopyTarget {
    /// An attribute of the graph module, by name.
    Attr(String),
    /// A graph input, by position.
    Input(usize),
}

#[derive(Clone, Debug)]
pub struct CopyEffect {
    pub target: CopyTarget,
    pub value: Value,
}

/// Values returned by [`ExecutionPlan::run`].
#[derive(Clone, Debug, Default)]
pub struct RunOutput {
    pub outputs: Vec<Value>,

    /// In-place copies, in the order they were made.
    pub copies: Vec<CopyEffect>,
}

#[derive(Clone, Debug)]
enum StepKind {
    Input(usize),
    Attr(String),
    Op(OpKind, Vec<NodeId>),
}

#[derive(Clone, Debug)]
struct Step {
    node: NodeId,
    name: String,
    kind: StepKind,
}

/// Sequence of steps that computes a graph's outputs from its inputs.
#[derive(Clone, Debug)]
pub struct ExecutionPlan {
    steps: Vec<Step>,
    num_inputs: usize,
    outputs: Vec<NodeId>,
}

impl ExecutionPlan {
    /// Create a plan for `graph`, which must be in execution order.
    pub fn compile(graph: &Graph) -> Result<ExecutionPlan, RunError> {
        let mut steps = Vec::with_capacity(graph.nodes().len());
        let mut num_inputs = 0;
        let mut outputs = None;

        for node in graph.nodes() {
            let kind = match node.op() {
                NodeOp::Placeholder => {
                    num_inputs += 1;
                    StepKind::Input(num_inputs - 1)
                }
                NodeOp::GetAttr { target } => StepKind::Attr(target.clone()),
                NodeOp::Call(op) => {
                    if node.inputs().len() != op.num_inputs() {
                        return Err(RunError::InvalidGraph(format!(
                            "\"{}\" has {} inputs but {} expects {}",
                            node.name(),
                            node.inputs().len(),
                            op.name(),
                            op.num_inputs()
                        )));
                    }
                    StepKind::Op(op.clone(), node.inputs().to_vec())
                }
                NodeOp::Output => {
                    outputs = Some(node.inputs().to_vec());
                    continue;
                }
            };
            steps.push(Step {
                node: node.id(),
                name: node.name().to_string(),
                kind,
            });
        }

        let outputs =
            outputs.ok_or_else(|| RunError::InvalidGraph("graph has no output node".into()))?;
        Ok(ExecutionPlan {
            steps,
            num_inputs,
            outputs,
        })
    }

    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    /// Execute the plan.
    ///
    /// `attrs` resolves attribute names read by `GetAttr` nodes.
    pub fn run(
        &self,
        inputs: Vec<Value>,
        attrs: &dyn Fn(&str) -> Option<Value>,
    ) -> Result<RunOutput, RunError> {
        if inputs.len() != self.num_inputs {
            return Err(RunError::InputCountMismatch {
                expected: self.num_inputs,
                actual: inputs.len(),
            });
        }

        let mut inputs: Vec<Option<Value>> = inputs.into_iter().map(Some).collect();
        let mut values: FxHashMap<NodeId, Value> = FxHashMap::default();
        let mut copies = Vec::new();

        // Where the value of each input or attribute node came from, used to
        // resolve the target of copies.
        let mut origins: FxHashMap<NodeId, CopyTarget> = FxHashMap::default();

        for step in &self.steps {
            let value = match &step.kind {
                StepKind::Input(idx) => {
                    origins.insert(step.node, CopyTarget::Input(*idx));
                    inputs[*idx].take().ok_or_else(|| {
                        RunError::InvalidGraph(format!("input {} read twice", idx))
                    })?
                }
                StepKind::Attr(target) => {
                    origins.insert(step.node, CopyTarget::Attr(target.clone()));
                    attrs(target).ok_or_else(|| RunError::MissingAttr(target.clone()))?
                }
                StepKind::Op(OpKind::Copy, op_inputs) => {
                    let (dst, src) = (op_inputs[0], op_inputs[1]);
                    let src_val = lookup(&values, src)?;
                    let dst_val = lookup(&values, dst)?;
                    let src_t = expect_tensor(&step.name, src_val)?;
                    let dst_t = expect_tensor(&step.name, dst_val)?;
                    if src_t.shape() != dst_t.shape() {
                        return Err(RunError::IncompatibleShapes {
                            node: step.name.clone(),
                            a: dst_t.shape().to_vec(),
                            b: src_t.shape().to_vec(),
                        });
                    }
                    let target = origins.get(&dst).cloned().ok_or_else(|| RunError::InvalidOp {
                        node: step.name.clone(),
                        reason: "copy destination is not an input or attribute".into(),
                    })?;
                    let new_value = src_val.clone();
                    copies.push(CopyEffect {
                        target,
                        value: new_value.clone(),
                    });
                    values.insert(dst, new_value.clone());
                    new_value
                }
                StepKind::Op(op, op_inputs) => {
                    let args = op_inputs
                        .iter()
                        .map(|id| lookup(&values, *id).and_then(|v| expect_tensor(&step.name, v)))
                        .collect::<Result<SmallVec<[&Tensor<f32>; 2]>, _>>()?;
                    Value::Tensor(run_op(&step.name, op, &args)?)
                }
            };
            values.insert(step.node, value);
        }

        let outputs = self
            .outputs
            .iter()
            .map(|id| lookup(&values, *id).cloned())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RunOutput { outputs, copies })
    }
}

fn lookup(values: &FxHashMap<NodeId, Value>, id: NodeId) -> Result<&Value, RunError> {
    values
        .get(&id)
        .ok_or_else(|| RunError::InvalidGraph(format!("value {} used before it was computed", id)))
}

fn expect_tensor<'a>(node: &str, value: &'a Value) -> Result<&'a Tensor<f32>, RunError> {
    value.as_tensor().ok_or_else(|| RunError::ExpectedTensor {
        node: node.to_string(),
        kind: value.kind_name(),
    })
}

/// Return the shape resulting from broadcasting shapes `a` and `b` together,
/// or `None` if they are not compatible.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<SmallVec<[usize; 4]>> {
    let a_pad = b.len().saturating_sub(a.len());
    let b_pad = a.len().saturating_sub(b.len());

    let a_iter = a.iter().copied().rev().chain(repeat(1).take(a_pad));
    let b_iter = b.iter().copied().rev().chain(repeat(1).take(b_pad));

    let mut result = SmallVec::with_capacity(a.len().max(b.len()));
    for (a, b) in a_iter.zip(b_iter) {
        match (a, b) {
            (a, b) if a == b => result.push(a),
            (1, b) => result.push(b),
            (a, 1) => result.push(a),
            _ => return None,
        }
    }
    result.reverse();
    Some(result)
}

fn binary_op(
    node: &str,
    a: &Tensor<f32>,
    b: &Tensor<f32>,
    op: impl Fn(f32, f32) -> f32,
) -> Result<Tensor<f32>, RunError> {
    let Some(out_shape) = broadcast_shapes(a.shape(), b.shape()) else {
        return Err(RunError::IncompatibleShapes {
            node: node.to_string(),
            a: a.shape().to_vec(),
            b: b.shape().to_vec(),
        });
    };
    let a_view = a.broadcast(out_shape.as_slice());
    let b_view = b.broadcast(out_shape.as_slice());
    let data: Vec<f32> = a_view
        .iter()
        .zip(b_view.iter())
        .map(|(x, y)| op(*x, *y))
        .collect();
    Ok(Tensor::from_data(out_shape.as_slice(), data))
}

fn matmul(node: &str, a: &Tensor<f32>, b: &Tensor<f32>) -> Result<Tensor<f32>, RunError> {
    let (&[m, k], &[k_b, n]) = (a.shape(), b.shape()) else {
        return Err(RunError::InvalidOp {
            node: node.to_string(),
            reason: "matmul inputs must be 2D".into(),
        });
    };
    if k != k_b {
        return Err(RunError::IncompatibleShapes {
            node: node.to_string(),
            a: a.shape().to_vec(),
            b: b.shape().to_vec(),
        });
    }

    let a_data = a.to_vec();
    let b_data = b.to_vec();
    let mut out = vec![0.; m * n];
    for row in 0..m {
        for depth in 0..k {
            let a_val = a_data[row * k + depth];
            let b_row = &b_data[depth * n..(depth + 1) * n];
            for (out_el, b_el) in out[row * n..(row + 1) * n].iter_mut().zip(b_row) {
                *out_el += a_val * b_el;
            }
        }
    }
    Ok(Tensor::from_data(&[m, n], out))
}

fn narrow(
    node: &str,
    x: &Tensor<f32>,
    dim: usize,
    start: usize,
    len: usize,
) -> Result<Tensor<f32>, RunError> {
    let size = x.shape().get(dim).copied();
    match size {
        Some(size) if start + len <= size => {}
        _ => {
            return Err(RunError::InvalidOp {
                node: node.to_string(),
                reason: format!(
                    "cannot take {} entries from {} along dim {} of shape {:?}",
                    len,
                    start,
                    dim,
                    x.shape()
                ),
            })
        }
    }
    let slice = x.slice_axis(dim, start..start + len);
    Ok(Tensor::from_data(slice.shape(), slice.to_vec()))
}

fn unary_op(x: &Tensor<f32>, op: impl Fn(f32) -> f32) -> Tensor<f32> {
    let data: Vec<f32> = x.iter().map(|v| op(*v)).collect();
    Tensor::from_data(x.shape(), data)
}

fn run_op(node: &str, op: &OpKind, inputs: &[&Tensor<f32>]) -> Result<Tensor<f32>, RunError> {
    match (op, inputs) {
        (OpKind::Add, [a, b]) => binary_op(node, a, b, |x, y| x + y),
        (OpKind::Sub, [a, b]) => binary_op(node, a, b, |x, y| x - y),
        (OpKind::Mul, [a, b]) => binary_op(node, a, b, |x, y| x * y),
        (OpKind::MatMul, [a, b]) => matmul(node, a, b),
        (OpKind::Relu, [x]) => Ok(unary_op(x, |v| v.max(0.))),
        (OpKind::Neg, [x]) => Ok(unary_op(x, |v| -v)),
        (OpKind::Narrow { dim, start, len }, [x]) => narrow(node, x, *dim, *start, *len),
        _ => Err(RunError::InvalidOp {
            node: node.to_string(),
            reason: format!("{} received {} inputs", op.name(), inputs.len()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::prelude::*;
    use rten_tensor::Tensor;
    use rten_testing::TestCases;

    use super::{broadcast_shapes, CopyTarget, ExecutionPlan, RunError};
    use crate::graph::{Graph, GraphForm, NodeOp, OpKind};
    use crate::value::Value;

    #[test]
    fn test_broadcast_shapes() {
        #[derive(Debug)]
        struct Case {
            a: Vec<usize>,
            b: Vec<usize>,
            expected: Option<Vec<usize>>,
        }

        let cases = [
            Case {
                a: vec![2, 3],
                b: vec![2, 3],
                expected: Some(vec![2, 3]),
            },
            Case {
                a: vec![2, 3],
                b: vec![3],
                expected: Some(vec![2, 3]),
            },
            Case {
                a: vec![1, 5],
                b: vec![2, 1, 1],
                expected: Some(vec![2, 1, 5]),
            },
            Case {
                a: vec![2, 3],
                b: vec![4],
                expected: None,
            },
        ];

        cases.test_each(|case| {
            let result = broadcast_shapes(&case.a, &case.b).map(|s| s.to_vec());
            assert_eq!(result, case.expected);
        })
    }

    fn tensor(shape: &[usize], data: &[f32]) -> Value {
        Value::Tensor(Tensor::from_data(shape, data.to_vec()))
    }

    #[test]
    fn test_run_ops() {
        let mut g = Graph::new(GraphForm::Lifted);
        let x = g.add_placeholder("x", None);
        let w = g.add_placeholder("w", None);
        let mm = g.add_call(OpKind::MatMul, vec![x, w], None);
        let neg = g.add_call(OpKind::Neg, vec![mm], None);
        let relu = g.add_call(OpKind::Relu, vec![neg], None);
        let sum = g.add_call(OpKind::Add, vec![mm, relu], None);
        let sliced = g.add_call(
            OpKind::Narrow {
                dim: 1,
                start: 1,
                len: 1,
            },
            vec![sum],
            None,
        );
        g.set_output(vec![mm, sliced]);

        let plan = ExecutionPlan::compile(&g).unwrap();
        assert_eq!(plan.num_inputs(), 2);

        let out = plan
            .run(
                vec![
                    tensor(&[2, 2], &[1., 2., 3., 4.]),
                    tensor(&[2, 2], &[1., 0., 0., -1.]),
                ],
                &|_| None,
            )
            .unwrap();
        let mm = out.outputs[0].as_tensor().unwrap();
        assert_eq!(mm.to_vec(), [1., -2., 3., -4.]);

        let sliced = out.outputs[1].as_tensor().unwrap();
        assert_eq!(sliced.shape(), &[2, 1]);
        assert_eq!(sliced.to_vec(), [0., 0.]);
        assert!(out.copies.is_empty());
    }

    #[test]
    fn test_run_copies() {
        let mut g = Graph::new(GraphForm::Unlifted);
        let x = g.add_placeholder("x", None);
        let count = g.add_call(OpKind::Neg, vec![x], None);
        let buf = g
            .insert_before(
                count,
                "count",
                NodeOp::GetAttr {
                    target: "count".into(),
                },
                vec![],
                None,
            )
            .unwrap();
        let next = g.add_call(OpKind::Add, vec![buf, x], None);
        g.add_call(OpKind::Copy, vec![buf, next], None);
        g.add_call(OpKind::Copy, vec![x, count], None);
        g.set_output(vec![next]);

        let plan = ExecutionPlan::compile(&g).unwrap();
        let out = plan
            .run(vec![tensor(&[1], &[2.])], &|name| {
                (name == "count").then(|| tensor(&[1], &[5.]))
            })
            .unwrap();

        assert_eq!(out.copies.len(), 2);
        assert_eq!(out.copies[0].target, CopyTarget::Attr("count".into()));
        assert_eq!(out.copies[0].value, tensor(&[1], &[7.]));
        assert_eq!(out.copies[1].target, CopyTarget::Input(0));
        assert_eq!(out.copies[1].value, tensor(&[1], &[-2.]));
        assert_eq!(out.outputs, [tensor(&[1], &[7.])]);
    }

    #[test]
    fn test_run_errors() {
        let mut g = Graph::new(GraphForm::Lifted);
        let a = g.add_placeholder("a", None);
        let b = g.add_placeholder("b", None);
        let sum = g.add_call(OpKind::Add, vec![a, b], None);
        g.set_output(vec![sum]);
        let plan = ExecutionPlan::compile(&g).unwrap();

        let err = plan.run(vec![tensor(&[1], &[1.])], &|_| None).unwrap_err();
        assert_eq!(
            err,
            RunError::InputCountMismatch {
                expected: 2,
                actual: 1
            }
        );

        let err = plan
            .run(
                vec![tensor(&[2], &[1., 2.]), tensor(&[3], &[1., 2., 3.])],
                &|_| None,
            )
            .unwrap_err();
        assert!(matches!(err, RunError::IncompatibleShapes { .. }));
    }
}
