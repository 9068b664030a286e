//! Graph mutation events dispatched to rules.

use crate::model::{Edge, Node};

/// Discriminant of a [`GraphEvent`], used by rules to declare interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NodeCreated,
    NodeUpdated,
    NodeDeleted,
    EdgeCreated,
    EdgeUpdated,
    EdgeDeleted,
}

/// A mutation that happened inside a graph transaction, carrying the
/// partition, the new entity state and (for updates) the previous state.
#[derive(Debug, Clone)]
pub enum GraphEvent {
    NodeCreated { partition: String, node: Node },
    NodeUpdated { partition: String, node: Node, old: Node },
    NodeDeleted { partition: String, node: Node },
    EdgeCreated { partition: String, edge: Edge },
    EdgeUpdated { partition: String, edge: Edge, old: Edge },
    EdgeDeleted { partition: String, edge: Edge },
}

impl GraphEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            GraphEvent::NodeCreated { .. } => EventKind::NodeCreated,
            GraphEvent::NodeUpdated { .. } => EventKind::NodeUpdated,
            GraphEvent::NodeDeleted { .. } => EventKind::NodeDeleted,
            GraphEvent::EdgeCreated { .. } => EventKind::EdgeCreated,
            GraphEvent::EdgeUpdated { .. } => EventKind::EdgeUpdated,
            GraphEvent::EdgeDeleted { .. } => EventKind::EdgeDeleted,
        }
    }

    pub fn partition(&self) -> &str {
        match self {
            GraphEvent::NodeCreated { partition, .. }
            | GraphEvent::NodeUpdated { partition, .. }
            | GraphEvent::NodeDeleted { partition, .. }
            | GraphEvent::EdgeCreated { partition, .. }
            | GraphEvent::EdgeUpdated { partition, .. }
            | GraphEvent::EdgeDeleted { partition, .. } => partition,
        }
    }

    /// The affected entity viewed as a node (edges are nodes too).
    pub fn entity(&self) -> &Node {
        match self {
            GraphEvent::NodeCreated { node, .. }
            | GraphEvent::NodeUpdated { node, .. }
            | GraphEvent::NodeDeleted { node, .. } => node,
            GraphEvent::EdgeCreated { edge, .. }
            | GraphEvent::EdgeUpdated { edge, .. }
            | GraphEvent::EdgeDeleted { edge, .. } => edge.as_node(),
        }
    }
}
