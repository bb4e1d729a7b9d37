//! Graph IR for traced programs.
//!
//! A [`Graph`] is an ordered list of nodes. Placeholders come first, followed
//! by attribute reads and operator calls in topological order, and a single
//! output node at the end.

use std::fmt;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

mod node;
mod node_id;

pub use node::{Node, NodeOp, OpKind};
pub use node_id::NodeId;

use crate::fake::FakeTensor;

/// Whether program state is passed to the graph as inputs or read from
/// attributes of the graph module.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphForm {
    /// Parameters, buffers and constants are placeholders and mutations are
    /// extra outputs.
    Lifted,
    /// Parameters, buffers and constants are `GetAttr` nodes and mutations
    /// are written back with in-place copies.
    Unlifted,
}

/// Errors when modifying or validating a [`Graph`].
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("node {0} does not exist")]
    InvalidNodeId(NodeId),

    #[error("cannot erase node \"{name}\" which still has {users} users")]
    NodeInUse { name: String, users: usize },

    #[error("graph has no output node")]
    MissingOutput,

    #[error("output node must be the last node in the graph")]
    MisplacedOutput,

    #[error("node name \"{0}\" is used more than once")]
    DuplicateName(String),

    #[error("node \"{node}\" uses \"{input}\" before it is defined")]
    UseBeforeDefinition { node: String, input: String },

    #[error("node \"{name}\" expects {expected} inputs but has {actual}")]
    InvalidArity {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("node \"{0}\" is invalid: {1}")]
    InvalidNode(String, &'static str),
}

/// Graph of operations recorded by tracing a program.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    nodes: Vec<Node>,
    next_id: u32,
    form: GraphForm,
}

impl Graph {
    pub fn new(form: GraphForm) -> Graph {
        Graph {
            nodes: Vec::new(),
            next_id: 0,
            form,
        }
    }

    pub fn form(&self) -> GraphForm {
        self.form
    }

    pub fn set_form(&mut self, form: GraphForm) {
        self.form = form;
    }

    /// Return the nodes in execution order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    fn position(&self, id: NodeId) -> Result<usize, GraphError> {
        self.nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or(GraphError::InvalidNodeId(id))
    }

    /// Return the name of node `id`, or a placeholder text if it does not exist.
    pub fn node_name(&self, id: NodeId) -> &str {
        self.node(id).map(|n| n.name()).unwrap_or("<invalid>")
    }

    /// Return the placeholder nodes, in order.
    pub fn placeholders(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_placeholder())
    }

    pub fn output_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| matches!(n.op, NodeOp::Output))
    }

    /// Return the IDs of the values returned by the graph.
    pub fn outputs(&self) -> &[NodeId] {
        self.output_node().map(|n| n.inputs()).unwrap_or(&[])
    }

    /// Return a name based on `hint` that is not used by any node.
    fn unique_name(&self, hint: &str) -> String {
        let taken: FxHashSet<&str> = self.nodes.iter().map(|n| n.name.as_str()).collect();
        if !taken.contains(hint) {
            return hint.to_string();
        }
        (1..)
            .map(|i| format!("{}_{}", hint, i))
            .find(|name| !taken.contains(name.as_str()))
            .unwrap_or_else(|| hint.to_string())
    }

    fn make_node(
        &mut self,
        name_hint: &str,
        op: NodeOp,
        inputs: Vec<NodeId>,
        meta: Option<FakeTensor>,
    ) -> Node {
        let id = NodeId::from_u32(self.next_id);
        self.next_id += 1;
        Node {
            id,
            name: self.unique_name(name_hint),
            op,
            inputs,
            meta,
        }
    }

    /// Append a node before the output node, if there is one.
    fn push(&mut self, node: Node) -> NodeId {
        let id = node.id;
        match self.nodes.last() {
            Some(last) if matches!(last.op, NodeOp::Output) => {
                let pos = self.nodes.len() - 1;
                self.nodes.insert(pos, node)
            }
            _ => self.nodes.push(node),
        }
        id
    }

    pub fn add_placeholder(&mut self, name: &str, meta: Option<FakeTensor>) -> NodeId {
        let node = self.make_node(name, NodeOp::Placeholder, Vec::new(), meta);
        self.push(node)
    }

    pub fn add_call(
        &mut self,
        op: OpKind,
        inputs: Vec<NodeId>,
        meta: Option<FakeTensor>,
    ) -> NodeId {
        let node = self.make_node(op.name(), NodeOp::Call(op), inputs, meta);
        self.push(node)
    }

    /// Set the values returned by the graph, replacing any existing output node.
    pub fn set_output(&mut self, values: Vec<NodeId>) -> NodeId {
        self.nodes.retain(|n| !matches!(n.op, NodeOp::Output));
        let node = self.make_node("output", NodeOp::Output, values, None);
        let id = node.id;
        self.nodes.push(node);
        id
    }

    /// Insert a new node immediately before `anchor`.
    pub fn insert_before(
        &mut self,
        anchor: NodeId,
        name_hint: &str,
        op: NodeOp,
        inputs: Vec<NodeId>,
        meta: Option<FakeTensor>,
    ) -> Result<NodeId, GraphError> {
        let pos = self.position(anchor)?;
        let node = self.make_node(name_hint, op, inputs, meta);
        let id = node.id;
        self.nodes.insert(pos, node);
        Ok(id)
    }

    /// Insert a new node immediately after `anchor`.
    pub fn insert_after(
        &mut self,
        anchor: NodeId,
        name_hint: &str,
        op: NodeOp,
        inputs: Vec<NodeId>,
        meta: Option<FakeTensor>,
    ) -> Result<NodeId, GraphError> {
        let pos = self.position(anchor)?;
        let node = self.make_node(name_hint, op, inputs, meta);
        let id = node.id;
        self.nodes.insert(pos + 1, node);
        Ok(id)
    }

    /// Return the IDs of nodes which use `id` as an input.
    pub fn users(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.inputs.contains(&id))
            .map(|n| n.id)
            .collect()
    }

    /// Replace every use of `old` with `new`. Returns the number of nodes
    /// changed.
    pub fn replace_all_uses_with(&mut self, old: NodeId, new: NodeId) -> usize {
        let mut changed = 0;
        for node in self.nodes.iter_mut() {
            if node.inputs.contains(&old) {
                for input in node.inputs.iter_mut().filter(|i| **i == old) {
                    *input = new;
                }
                changed += 1;
            }
        }
        changed
    }

    /// Remove a node which has no users.
    pub fn erase_node(&mut self, id: NodeId) -> Result<Node, GraphError> {
        let pos = self.position(id)?;
        let users = self.users(id).len();
        if users > 0 {
            return Err(GraphError::NodeInUse {
                name: self.nodes[pos].name.clone(),
                users,
            });
        }
        Ok(self.nodes.remove(pos))
    }

    /// Rename node `id`. Fails if the name is taken by another node.
    pub fn rename(&mut self, id: NodeId, name: &str) -> Result<(), GraphError> {
        if self.nodes.iter().any(|n| n.name == name && n.id != id) {
            return Err(GraphError::DuplicateName(name.to_string()));
        }
        let pos = self.position(id)?;
        self.nodes[pos].name = name.to_string();
        Ok(())
    }

    /// Check structural invariants of the graph.
    pub fn lint(&self) -> Result<(), GraphError> {
        let mut defined = FxHashSet::default();
        let mut names = FxHashSet::default();

        let Some(last) = self.nodes.last() else {
            return Err(GraphError::MissingOutput);
        };
        if !matches!(last.op, NodeOp::Output) {
            return Err(match self.output_node() {
                Some(_) => GraphError::MisplacedOutput,
                None => GraphError::MissingOutput,
            });
        }

        for (i, node) in self.nodes.iter().enumerate() {
            if !names.insert(node.name.as_str()) {
                return Err(GraphError::DuplicateName(node.name.clone()));
            }
            match &node.op {
                NodeOp::Placeholder | NodeOp::GetAttr { .. } if !node.inputs.is_empty() => {
                    return Err(GraphError::InvalidNode(
                        node.name.clone(),
                        "inputs and attributes take no arguments",
                    ));
                }
                NodeOp::GetAttr { target } if target.is_empty() => {
                    return Err(GraphError::InvalidNode(
                        node.name.clone(),
                        "attribute target is empty",
                    ));
                }
                NodeOp::Call(op) if op.num_inputs() != node.inputs.len() => {
                    return Err(GraphError::InvalidArity {
                        name: node.name.clone(),
                        expected: op.num_inputs(),
                        actual: node.inputs.len(),
                    });
                }
                NodeOp::Output if i != self.nodes.len() - 1 => {
                    return Err(GraphError::MisplacedOutput);
                }
                _ => {}
            }
            for input in &node.inputs {
                if !defined.contains(input) {
                    return Err(GraphError::UseBeforeDefinition {
                        node: node.name.clone(),
                        input: self.node_name(*input).to_string(),
                    });
                }
            }
            defined.insert(node.id);
        }
        Ok(())
    }

    /// Remove operator calls whose results are unused and which have no side
    /// effects. Returns true if the graph changed.
    pub fn eliminate_dead_code(&mut self) -> bool {
        let mut used: FxHashSet<NodeId> = FxHashSet::default();
        let mut dead = FxHashSet::default();

        // Visit in reverse so users are seen before the values they use.
        for node in self.nodes.iter().rev() {
            if node.is_impure() || used.contains(&node.id) {
                used.extend(node.inputs.iter().copied());
            } else {
                dead.insert(node.id);
            }
        }

        let before = self.nodes.len();
        self.nodes.retain(|n| !dead.contains(&n.id));
        self.nodes.len() != before
    }

    /// Replace the abstract value of every node using `f`.
    pub fn map_meta(&mut self, mut f: impl FnMut(&FakeTensor) -> FakeTensor) {
        for node in self.nodes.iter_mut() {
            if let Some(meta) = &node.meta {
                node.meta = Some(f(meta));
            }
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph():")?;
        for node in &self.nodes {
            if matches!(node.op, NodeOp::Output) {
                let outputs: Vec<_> = node
                    .inputs
                    .iter()
                    .map(|id| format!("%{}", self.node_name(*id)))
                    .collect();
                writeln!(f, "    return ({})", outputs.join(", "))?;
                continue;
            }

            write!(f, "    %{}", node.name)?;
            if let Some(meta) = &node.meta {
                write!(f, ": f32{}", meta)?;
            }
            write!(f, " = {}", node.op)?;
            let inputs: Vec<_> = node
                .inputs
                .iter()
                .map(|id| format!("%{}", self.node_name(*id)))
                .collect();
            writeln!(f, "({})", inputs.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Graph, GraphError, GraphForm, NodeOp, OpKind};
    use crate::fake::FakeTensor;

    fn make_graph() -> (Graph, [super::NodeId; 4]) {
        let mut g = Graph::new(GraphForm::Lifted);
        let x = g.add_placeholder("x", Some(FakeTensor::from_shape(&[2, 3])));
        let w = g.add_placeholder("w", Some(FakeTensor::from_shape(&[2, 3])));
        let add = g.add_call(OpKind::Add, vec![x, w], Some(FakeTensor::from_shape(&[2, 3])));
        let relu = g.add_call(OpKind::Relu, vec![add], Some(FakeTensor::from_shape(&[2, 3])));
        g.set_output(vec![add]);
        (g, [x, w, add, relu])
    }

    #[test]
    fn test_unique_names() {
        let mut g = Graph::new(GraphForm::Lifted);
        let x = g.add_placeholder("x", None);
        let a = g.add_call(OpKind::Neg, vec![x], None);
        let b = g.add_call(OpKind::Neg, vec![a], None);
        assert_eq!(g.node_name(a), "neg");
        assert_eq!(g.node_name(b), "neg_1");
    }

    #[test]
    fn test_lint() {
        let (g, _) = make_graph();
        assert_eq!(g.lint(), Ok(()));

        let mut no_output = Graph::new(GraphForm::Lifted);
        no_output.add_placeholder("x", None);
        assert_eq!(no_output.lint(), Err(GraphError::MissingOutput));

        let mut bad_arity = Graph::new(GraphForm::Lifted);
        let x = bad_arity.add_placeholder("x", None);
        bad_arity.add_call(OpKind::Add, vec![x], None);
        bad_arity.set_output(vec![x]);
        assert!(matches!(
            bad_arity.lint(),
            Err(GraphError::InvalidArity { expected: 2, .. })
        ));
    }

    #[test]
    fn test_eliminate_dead_code() {
        let (mut g, [_, _, add, relu]) = make_graph();
        assert!(g.eliminate_dead_code());
        assert!(g.node(relu).is_none());
        assert!(g.node(add).is_some());
        assert!(!g.eliminate_dead_code());
    }

    #[test]
    fn test_erase_and_replace() {
        let (mut g, [x, w, add, _]) = make_graph();
        assert!(matches!(
            g.erase_node(x),
            Err(GraphError::NodeInUse { users: 1, .. })
        ));

        let attr = g
            .insert_after(
                x,
                "w_attr",
                NodeOp::GetAttr {
                    target: "w".into(),
                },
                vec![],
                None,
            )
            .unwrap();
        assert_eq!(g.replace_all_uses_with(w, attr), 1);
        assert!(g.erase_node(w).is_ok());
        assert_eq!(g.node(add).unwrap().inputs(), &[x, attr]);
        assert_eq!(g.lint(), Ok(()));
    }

    #[test]
    fn test_display() {
        let (mut g, _) = make_graph();
        g.eliminate_dead_code();
        let text = g.to_string();
        let expected = "graph():
    %x: f32[2, 3] = placeholder()
    %w: f32[2, 3] = placeholder()
    %add: f32[2, 3] = add(%x, %w)
    return (%add)
";
        assert_eq!(text, expected);
    }
}
