use std::fmt;

use serde::{Deserialize, Serialize};

use super::NodeId;
use crate::fake::FakeTensor;

/// Operators which can appear in [`NodeOp::Call`] nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Elementwise addition with broadcasting.
    Add,
    /// Elementwise subtraction with broadcasting.
    Sub,
    /// Elementwise multiplication with broadcasting.
    Mul,
    /// Matrix product of two 2D tensors.
    MatMul,
    Relu,
    Neg,
    /// Slice `len` entries starting at `start` along `dim`.
    Narrow { dim: usize, start: usize, len: usize },
    /// Copy the second input into the first, in place.
    ///
    /// Only appears in unlifted graphs, where it writes back mutations of
    /// buffers and user inputs.
    Copy,
}

impl OpKind {
    /// Name used when printing graphs and naming nodes.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::MatMul => "matmul",
            OpKind::Relu => "relu",
            OpKind::Neg => "neg",
            OpKind::Narrow { .. } => "narrow",
            OpKind::Copy => "copy_",
        }
    }

    /// Number of inputs the operator takes.
    pub fn num_inputs(&self) -> usize {
        match self {
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::MatMul | OpKind::Copy => 2,
            OpKind::Relu | OpKind::Neg | OpKind::Narrow { .. } => 1,
        }
    }

    /// Return true if the operator modifies its inputs and so must not be
    /// removed even if its output is unused.
    pub fn has_side_effects(&self) -> bool {
        matches!(self, OpKind::Copy)
    }
}

/// The kind of a graph node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeOp {
    /// An input of the graph.
    Placeholder,
    /// Read of an attribute owned by the graph module.
    GetAttr { target: String },
    /// Application of an operator to the node's inputs.
    Call(OpKind),
    /// The values returned from the graph.
    Output,
}

/// A node in a [`Graph`](super::Graph).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub(super) id: NodeId,
    pub(super) name: String,
    pub(super) op: NodeOp,
    pub(super) inputs: Vec<NodeId>,

    /// Abstract value of the node's output, if it is a tensor.
    pub(super) meta: Option<FakeTensor>,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Unique name of the node within its graph.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> &NodeOp {
        &self.op
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn meta(&self) -> Option<&FakeTensor> {
        self.meta.as_ref()
    }

    pub fn set_meta(&mut self, meta: Option<FakeTensor>) {
        self.meta = meta;
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.op, NodeOp::Placeholder)
    }

    /// Return the attribute name if this is a `GetAttr` node.
    pub fn attr_target(&self) -> Option<&str> {
        match &self.op {
            NodeOp::GetAttr { target } => Some(target),
            _ => None,
        }
    }

    pub fn is_impure(&self) -> bool {
        match &self.op {
            NodeOp::Placeholder | NodeOp::GetAttr { .. } | NodeOp::Output => true,
            NodeOp::Call(op) => op.has_side_effects(),
        }
    }
}

impl fmt::Display for NodeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeOp::Placeholder => write!(f, "placeholder"),
            NodeOp::GetAttr { target } => write!(f, "get_attr[target={}]", target),
            NodeOp::Call(OpKind::Narrow { dim, start, len }) => {
                write!(f, "narrow[dim={}, start={}, len={}]", dim, start, len)
            }
            NodeOp::Call(op) => write!(f, "{}", op.name()),
            NodeOp::Output => write!(f, "output"),
        }
    }
}
