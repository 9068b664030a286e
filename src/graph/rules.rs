//! Graph rules: synchronous hooks invoked after each primary op.
//!
//! Rules run in registration order, after the op's storage writes and before
//! the transaction's flush, and may stage further ops on the same transaction
//! queue. They receive the storage-facing core, never the public manager, so
//! a rule cannot re-enter `store_node`/`store_edge` directly.

use std::collections::{BTreeSet, VecDeque};

use tracing::debug;

use crate::error::Result;
use crate::graph::core::GraphCore;
use crate::graph::events::{EventKind, GraphEvent};
use crate::graph::storage::{main_db_count_add, main_db_list_add};
use crate::graph::trans::TransOp;
use crate::model::{Edge, End, Node};

/// A named hook on graph mutation events.
pub trait GraphRule: Send + Sync {
    /// Unique rule name.
    fn name(&self) -> &str;

    /// Event kinds this rule wants to see.
    fn handles(&self) -> &'static [EventKind];

    /// Reacts to `event`; may stage follow-on ops on `queue`.
    fn handle(
        &self,
        core: &mut GraphCore,
        queue: &mut VecDeque<TransOp>,
        event: &GraphEvent,
    ) -> Result<()>;
}

/// `system.updatenodestats` - maintains kinds, partitions, per-kind
/// attribute lists, per-kind edge specs and per-kind counts in the main DB.
pub struct NodeStatsRule;

const ALL_EVENTS: &[EventKind] = &[
    EventKind::NodeCreated,
    EventKind::NodeUpdated,
    EventKind::NodeDeleted,
    EventKind::EdgeCreated,
    EventKind::EdgeUpdated,
    EventKind::EdgeDeleted,
];

fn record_attrs(core: &mut GraphCore, list_key: &str, node: &Node) {
    for attr in node.attrs().keys() {
        main_db_list_add(core.main_db(), list_key, attr);
    }
}

impl GraphRule for NodeStatsRule {
    fn name(&self) -> &str {
        "system.updatenodestats"
    }

    fn handles(&self) -> &'static [EventKind] {
        ALL_EVENTS
    }

    fn handle(
        &self,
        core: &mut GraphCore,
        _queue: &mut VecDeque<TransOp>,
        event: &GraphEvent,
    ) -> Result<()> {
        match event {
            GraphEvent::NodeCreated { partition, node } => {
                main_db_list_add(core.main_db(), "parts", partition);
                main_db_list_add(core.main_db(), "nodekinds", node.kind());
                record_attrs(core, &format!("nodeattrs.{}", node.kind()), node);
                main_db_count_add(core.main_db(), &format!("nodecount.{}", node.kind()), 1);
            }
            GraphEvent::NodeUpdated { node, .. } => {
                record_attrs(core, &format!("nodeattrs.{}", node.kind()), node);
            }
            GraphEvent::NodeDeleted { node, .. } => {
                main_db_count_add(core.main_db(), &format!("nodecount.{}", node.kind()), -1);
            }
            GraphEvent::EdgeCreated { partition, edge } => {
                main_db_list_add(core.main_db(), "parts", partition);
                main_db_list_add(core.main_db(), "edgekinds", edge.kind());
                record_attrs(core, &format!("edgeattrs.{}", edge.kind()), edge.as_node());
                main_db_count_add(core.main_db(), &format!("edgecount.{}", edge.kind()), 1);
                for end in [End::First, End::Second] {
                    main_db_list_add(
                        core.main_db(),
                        &format!("nodeedges.{}", edge.end_kind(end)),
                        &edge.spec_from(end),
                    );
                }
            }
            GraphEvent::EdgeUpdated { edge, .. } => {
                record_attrs(core, &format!("edgeattrs.{}", edge.kind()), edge.as_node());
            }
            GraphEvent::EdgeDeleted { edge, .. } => {
                main_db_count_add(core.main_db(), &format!("edgecount.{}", edge.kind()), -1);
            }
        }
        Ok(())
    }
}

/// `system.deletenodeedges` - on node deletion removes every incident edge
/// and follows cascading flags to the opposite endpoints.
pub struct DeleteNodeEdgesRule;

impl GraphRule for DeleteNodeEdgesRule {
    fn name(&self) -> &str {
        "system.deletenodeedges"
    }

    fn handles(&self) -> &'static [EventKind] {
        &[EventKind::NodeDeleted]
    }

    fn handle(
        &self,
        core: &mut GraphCore,
        queue: &mut VecDeque<TransOp>,
        event: &GraphEvent,
    ) -> Result<()> {
        let GraphEvent::NodeDeleted { partition, node } = event else {
            return Ok(());
        };

        let (_, edges) = core.traverse(partition, node.key(), node.kind(), ":::", true)?;
        debug!(
            key = node.key(),
            kind = node.kind(),
            edges = edges.len(),
            "removing edges of deleted node"
        );

        for edge in &edges {
            queue.push_back(TransOp::RemoveEdge {
                partition: partition.clone(),
                key: edge.key().to_string(),
                kind: edge.kind().to_string(),
            });
        }

        let mut staged: BTreeSet<(String, String)> = BTreeSet::new();
        for edge in &edges {
            let Some(this_end) = edge.end_of(node.key(), node.kind()) else {
                continue;
            };
            let far = this_end.other();
            let (other_key, other_kind) = (edge.end_key(far), edge.end_kind(far));
            if other_key == node.key() && other_kind == node.kind() {
                continue; // self loop
            }
            if !edge.end_cascading(this_end) {
                continue;
            }
            if staged.contains(&(other_key.to_string(), other_kind.to_string())) {
                continue;
            }

            // The cascade is held back while another cascading edge into the
            // target exists, unless this edge insists via cascading-last.
            let held = !edge.end_cascading_last(this_end)
                && has_protecting_cascade(
                    core,
                    partition,
                    other_key,
                    other_kind,
                    edge,
                    (node.key(), node.kind()),
                )?;
            if !held {
                staged.insert((other_key.to_string(), other_kind.to_string()));
                queue.push_back(TransOp::RemoveNode {
                    partition: partition.clone(),
                    key: other_key.to_string(),
                    kind: other_kind.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// True if `(m_key, m_kind)` has an incident edge, other than `through` or
/// any edge leading back to `origin`, whose far-end cascading flag points at
/// it.
fn has_protecting_cascade(
    core: &mut GraphCore,
    partition: &str,
    m_key: &str,
    m_kind: &str,
    through: &Edge,
    origin: (&str, &str),
) -> Result<bool> {
    let (_, edges) = core.traverse(partition, m_key, m_kind, ":::", true)?;
    for edge in edges {
        if edge.key() == through.key() && edge.kind() == through.kind() {
            continue;
        }
        let Some(m_end) = edge.end_of(m_key, m_kind) else {
            continue;
        };
        let far = m_end.other();
        if edge.end_key(far) == origin.0 && edge.end_kind(far) == origin.1 {
            continue;
        }
        if edge.end_cascading(far) {
            return Ok(true);
        }
    }
    Ok(false)
}
