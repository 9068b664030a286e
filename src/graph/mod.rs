//! The graph manager: typed nodes and edges over storage managers, with
//! indexes, traversals, rules, events and transactional batches.

pub mod core;
pub mod events;
pub mod rules;
pub mod storage;
pub mod trans;

use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::Config;
use crate::error::{acquire_lock, Result};
use crate::graph::core::GraphCore;
use crate::graph::rules::{DeleteNodeEdgesRule, GraphRule, NodeStatsRule};
use crate::graph::storage::{
    main_db_count, main_db_list, DiskGraphStorage, GraphStorage, MemoryGraphStorage,
};
use crate::graph::trans::{Trans, TransOp};
use crate::model::{Edge, Node};
use crate::search::{self, IndexQuery, IndexUpdateRule};

pub use crate::graph::events::{EventKind, GraphEvent};
pub use crate::graph::trans::TransCounts;

/// Thread-safe handle to one graph.
///
/// Every externally visible mutation runs under the manager lock; the
/// storage managers below are single-writer and serialised by it. A reader
/// that acquires the lock after a committer's release sees all of that
/// committer's effects.
pub struct GraphManager {
    core: Mutex<GraphCore>,
}

impl GraphManager {
    /// Opens a graph according to `config` (disk or memory-only storage) and
    /// registers the built-in rules.
    pub fn open(config: &Config) -> Result<Self> {
        let gs: Box<dyn GraphStorage> = if config.memory_only {
            Box::new(MemoryGraphStorage::new("memory"))
        } else {
            Box::new(DiskGraphStorage::open(config)?)
        };
        Self::with_storage(gs)
    }

    /// Opens a graph over a caller-provided storage backend.
    pub fn with_storage(gs: Box<dyn GraphStorage>) -> Result<Self> {
        let mut core = GraphCore::new(gs);
        core.add_rule(Arc::new(NodeStatsRule));
        core.add_rule(Arc::new(DeleteNodeEdgesRule));
        core.add_rule(Arc::new(IndexUpdateRule));
        Ok(Self {
            core: Mutex::new(core),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, GraphCore>> {
        acquire_lock(&self.core)
    }

    pub(crate) fn with_core<R>(
        &self,
        f: impl FnOnce(&mut GraphCore) -> Result<R>,
    ) -> Result<R> {
        let mut core = self.lock()?;
        f(&mut core)
    }

    pub(crate) fn execute(&self, ops: Vec<TransOp>) -> Result<()> {
        self.lock()?.execute(ops)
    }

    // ---- transactions ---------------------------------------------------

    /// A fresh transaction; ops apply on commit.
    pub fn new_trans(&self) -> Trans<'_> {
        Trans::new(self, None)
    }

    /// A transaction that auto-commits every `threshold` staged ops.
    pub fn new_rolling_trans(&self, threshold: usize) -> Trans<'_> {
        Trans::new(self, Some(threshold))
    }

    // ---- mutations ------------------------------------------------------

    /// Stores a node (replace semantics).
    pub fn store_node(&self, partition: &str, node: Node) -> Result<()> {
        let mut trans = self.new_trans();
        trans.store_node(partition, node)?;
        trans.commit()
    }

    /// Updates a node (merge semantics).
    pub fn update_node(&self, partition: &str, node: Node) -> Result<()> {
        let mut trans = self.new_trans();
        trans.update_node(partition, node)?;
        trans.commit()
    }

    /// Removes a node, returning it. Incident edges and cascading endpoints
    /// are removed by the `system.deletenodeedges` rule within the same
    /// transaction.
    pub fn remove_node(&self, partition: &str, key: &str, kind: &str) -> Result<Option<Node>> {
        let mut core = self.lock()?;
        let removed = core.fetch_node(partition, key, kind)?;
        if removed.is_some() {
            core.execute(vec![TransOp::RemoveNode {
                partition: partition.to_string(),
                key: key.to_string(),
                kind: kind.to_string(),
            }])?;
        }
        Ok(removed)
    }

    /// Stores an edge; both endpoints must exist.
    pub fn store_edge(&self, partition: &str, edge: Edge) -> Result<()> {
        let mut trans = self.new_trans();
        trans.store_edge(partition, edge)?;
        trans.commit()
    }

    /// Removes an edge, returning it.
    pub fn remove_edge(&self, partition: &str, key: &str, kind: &str) -> Result<Option<Edge>> {
        let mut core = self.lock()?;
        let removed = core.fetch_edge(partition, key, kind)?;
        if removed.is_some() {
            core.execute(vec![TransOp::RemoveEdge {
                partition: partition.to_string(),
                key: key.to_string(),
                kind: kind.to_string(),
            }])?;
        }
        Ok(removed)
    }

    // ---- reads ----------------------------------------------------------

    pub fn fetch_node(&self, partition: &str, key: &str, kind: &str) -> Result<Option<Node>> {
        self.lock()?.fetch_node(partition, key, kind)
    }

    /// Fetches a subset of a node's attributes; `key` and `kind` are always
    /// included.
    pub fn fetch_node_part(
        &self,
        partition: &str,
        key: &str,
        kind: &str,
        attrs: &[&str],
    ) -> Result<Option<Node>> {
        self.lock()?.fetch_node_part(partition, key, kind, attrs)
    }

    pub fn fetch_edge(&self, partition: &str, key: &str, kind: &str) -> Result<Option<Edge>> {
        self.lock()?.fetch_edge(partition, key, kind)
    }

    /// Follows edges from `(key, kind)` matching the traversal `spec`
    /// (`ownRole:edgeKind:otherRole:otherKind`, empty components are
    /// wildcards). Returns the opposite endpoints and the edges; with
    /// `all_data` unset only key/kind shells.
    pub fn traverse_multi(
        &self,
        partition: &str,
        key: &str,
        kind: &str,
        spec: &str,
        all_data: bool,
    ) -> Result<(Vec<Node>, Vec<Edge>)> {
        self.lock()?.traverse(partition, key, kind, spec, all_data)
    }

    /// All node keys of a kind in a partition, in key order.
    pub fn node_keys(&self, partition: &str, kind: &str) -> Result<Vec<String>> {
        self.lock()?.node_keys(partition, kind)
    }

    /// All edge keys of a kind in a partition, in key order.
    pub fn edge_keys(&self, partition: &str, kind: &str) -> Result<Vec<String>> {
        self.lock()?.edge_keys(partition, kind)
    }

    // ---- meta information -----------------------------------------------

    pub fn node_kinds(&self) -> Result<Vec<String>> {
        self.with_core(|core| Ok(main_db_list(core.main_db(), "nodekinds")))
    }

    pub fn edge_kinds(&self) -> Result<Vec<String>> {
        self.with_core(|core| Ok(main_db_list(core.main_db(), "edgekinds")))
    }

    pub fn partitions(&self) -> Result<Vec<String>> {
        self.with_core(|core| Ok(main_db_list(core.main_db(), "parts")))
    }

    /// Attribute names ever stored on nodes of `kind`.
    pub fn node_attrs(&self, kind: &str) -> Result<Vec<String>> {
        self.with_core(|core| Ok(main_db_list(core.main_db(), &format!("nodeattrs.{kind}"))))
    }

    /// Attribute names ever stored on edges of `kind`.
    pub fn edge_attrs(&self, kind: &str) -> Result<Vec<String>> {
        self.with_core(|core| Ok(main_db_list(core.main_db(), &format!("edgeattrs.{kind}"))))
    }

    /// Edge specs observed on nodes of `kind`.
    pub fn node_edges(&self, kind: &str) -> Result<Vec<String>> {
        self.with_core(|core| Ok(main_db_list(core.main_db(), &format!("nodeedges.{kind}"))))
    }

    pub fn node_count(&self, kind: &str) -> Result<u64> {
        self.with_core(|core| Ok(main_db_count(core.main_db(), &format!("nodecount.{kind}"))))
    }

    pub fn edge_count(&self, kind: &str) -> Result<u64> {
        self.with_core(|core| Ok(main_db_count(core.main_db(), &format!("edgecount.{kind}"))))
    }

    // ---- rules and indexes ----------------------------------------------

    /// Registers a custom rule behind the built-in ones.
    pub fn set_graph_rule(&self, rule: Arc<dyn GraphRule>) -> Result<()> {
        self.with_core(|core| {
            core.add_rule(rule);
            Ok(())
        })
    }

    /// Names of all registered rules in invocation order.
    pub fn graph_rules(&self) -> Result<Vec<String>> {
        self.with_core(|core| Ok(core.rule_names()))
    }

    /// Query handle into the word/phrase/value index of a node kind.
    pub fn node_index_query(&self, partition: &str, kind: &str) -> Result<IndexQuery<'_>> {
        Ok(IndexQuery::new(
            self,
            search::search_sm(partition, kind, false),
        ))
    }

    /// Query handle into the word/phrase/value index of an edge kind.
    pub fn edge_index_query(&self, partition: &str, kind: &str) -> Result<IndexQuery<'_>> {
        Ok(IndexQuery::new(
            self,
            search::search_sm(partition, kind, true),
        ))
    }

    // ---- lifecycle ------------------------------------------------------

    /// Flushes all storage managers and the main DB.
    pub fn flush(&self) -> Result<()> {
        self.lock()?.flush()
    }

    /// Flushes and settles the graph storage.
    pub fn close(&self) -> Result<()> {
        self.lock()?.close()
    }
}
