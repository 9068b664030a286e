//! Transactional batches of graph operations.
//!
//! A transaction accumulates staged ops; on commit they are applied in order
//! against the storage managers and the main DB. There is no op-level undo:
//! the first failing op stops the transaction and already-applied ops
//! remain. A rolling transaction commits automatically every N staged ops.

use crate::error::Result;
use crate::graph::GraphManager;
use crate::model::{validate_name, Edge, Node};

/// One staged graph mutation.
#[derive(Debug, Clone)]
pub enum TransOp {
    StoreNode { partition: String, node: Node },
    UpdateNode { partition: String, node: Node },
    RemoveNode {
        partition: String,
        key: String,
        kind: String,
    },
    StoreEdge { partition: String, edge: Edge },
    RemoveEdge {
        partition: String,
        key: String,
        kind: String,
    },
}

/// Op counts staged on a transaction since its creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransCounts {
    pub nodes_stored: u64,
    pub nodes_removed: u64,
    pub edges_stored: u64,
    pub edges_removed: u64,
}

/// A batch of graph operations committed as one unit.
pub struct Trans<'a> {
    manager: &'a GraphManager,
    ops: Vec<TransOp>,
    rolling: Option<usize>,
    counts: TransCounts,
}

impl<'a> Trans<'a> {
    pub(crate) fn new(manager: &'a GraphManager, rolling: Option<usize>) -> Self {
        Self {
            manager,
            ops: Vec::new(),
            rolling: rolling.map(|n| n.max(1)),
            counts: TransCounts::default(),
        }
    }

    /// Stages a node store (replace semantics).
    pub fn store_node(&mut self, partition: &str, node: Node) -> Result<()> {
        validate_name("partition", partition)?;
        node.validate()?;
        self.counts.nodes_stored += 1;
        self.push(TransOp::StoreNode {
            partition: partition.to_string(),
            node,
        })
    }

    /// Stages a node update (merge semantics).
    pub fn update_node(&mut self, partition: &str, node: Node) -> Result<()> {
        validate_name("partition", partition)?;
        node.validate()?;
        self.counts.nodes_stored += 1;
        self.push(TransOp::UpdateNode {
            partition: partition.to_string(),
            node,
        })
    }

    pub fn remove_node(&mut self, partition: &str, key: &str, kind: &str) -> Result<()> {
        validate_name("partition", partition)?;
        validate_name("kind", kind)?;
        self.counts.nodes_removed += 1;
        self.push(TransOp::RemoveNode {
            partition: partition.to_string(),
            key: key.to_string(),
            kind: kind.to_string(),
        })
    }

    pub fn store_edge(&mut self, partition: &str, edge: Edge) -> Result<()> {
        validate_name("partition", partition)?;
        edge.validate()?;
        self.counts.edges_stored += 1;
        self.push(TransOp::StoreEdge {
            partition: partition.to_string(),
            edge,
        })
    }

    pub fn remove_edge(&mut self, partition: &str, key: &str, kind: &str) -> Result<()> {
        validate_name("partition", partition)?;
        validate_name("kind", kind)?;
        self.counts.edges_removed += 1;
        self.push(TransOp::RemoveEdge {
            partition: partition.to_string(),
            key: key.to_string(),
            kind: kind.to_string(),
        })
    }

    /// Counts of the ops staged since this transaction was created.
    pub fn counts(&self) -> TransCounts {
        self.counts
    }

    /// Number of ops currently staged and not yet committed.
    pub fn pending(&self) -> usize {
        self.ops.len()
    }

    /// Applies all staged ops.
    pub fn commit(mut self) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        self.manager.execute(std::mem::take(&mut self.ops))
    }

    fn push(&mut self, op: TransOp) -> Result<()> {
        self.ops.push(op);
        if let Some(threshold) = self.rolling {
            if self.ops.len() >= threshold {
                return self.manager.execute(std::mem::take(&mut self.ops));
            }
        }
        Ok(())
    }
}
