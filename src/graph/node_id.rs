use std::num::NonZero;

/// ID of a node in a [`Graph`](crate::graph::Graph).
///
/// IDs are assigned in creation order and are never reused within a graph,
/// so they stay valid as other nodes are inserted or erased.
#[derive(Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
#[serde(into = "u32", from = "u32")]
pub struct NodeId(NonZero<u32>);

impl NodeId {
    /// Return the underlying u32 value of the ID.
    pub fn as_u32(self) -> u32 {
        self.0.get() - 1
    }

    /// Construct a node ID from a u32 value.
    ///
    /// Values are stored offset by one so that `Option<NodeId>` is the same
    /// size as `NodeId`. `u32::MAX` saturates to `u32::MAX - 1`.
    pub fn from_u32(value: u32) -> NodeId {
        NodeId(NonZero::<u32>::MIN.saturating_add(value))
    }
}

impl From<NodeId> for u32 {
    fn from(id: NodeId) -> u32 {
        id.as_u32()
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> NodeId {
        NodeId::from_u32(value)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_u32().fmt(f)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.as_u32())
    }
}
