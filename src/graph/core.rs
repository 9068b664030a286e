//! Storage-facing half of the graph manager.
//!
//! `GraphCore` maps the typed node/edge model onto storage managers. For a
//! partition `P` and kind `K` the node payloads live in `PK.nodes` and the
//! hash index `PK.nodeidx` maps index keys to payload locations (edges use
//! `PK.edges`/`PK.edgeidx`). Three index-key namespaces exist per node:
//!
//! - `[PREFIX_ATTRS] key`          -> attribute map location
//! - `[PREFIX_SPECS] key`          -> set of edge specs present on the node
//! - `[PREFIX_EDGE] key 0x00 spec` -> list of `(edge key, other node key)`
//!
//! The dual edge representation allows spec-filtered traversal without
//! scanning all edges.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{GraphError, Result};
use crate::graph::events::GraphEvent;
use crate::graph::rules::GraphRule;
use crate::graph::storage::GraphStorage;
use crate::graph::trans::TransOp;
use crate::model::{spec_matches, validate_name, AttrValue, Edge, End, Node};
use crate::storage::manager::StorageManager;
use crate::storage::HashTree;

/// Index-key and payload namespace tags.
pub(crate) const PREFIX_ATTRS: u8 = 0x01;
pub(crate) const PREFIX_SPECS: u8 = 0x02;
pub(crate) const PREFIX_EDGE: u8 = 0x03;

pub(crate) fn nodes_sm(partition: &str, kind: &str) -> String {
    format!("{partition}{kind}.nodes")
}

pub(crate) fn nodeidx_sm(partition: &str, kind: &str) -> String {
    format!("{partition}{kind}.nodeidx")
}

pub(crate) fn edges_sm(partition: &str, kind: &str) -> String {
    format!("{partition}{kind}.edges")
}

pub(crate) fn edgeidx_sm(partition: &str, kind: &str) -> String {
    format!("{partition}{kind}.edgeidx")
}

pub(crate) fn attrs_key(key: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + key.len());
    k.push(PREFIX_ATTRS);
    k.extend_from_slice(key.as_bytes());
    k
}

fn specs_key(key: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + key.len());
    k.push(PREFIX_SPECS);
    k.extend_from_slice(key.as_bytes());
    k
}

fn edge_list_key(key: &str, spec: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(2 + key.len() + spec.len());
    k.push(PREFIX_EDGE);
    k.extend_from_slice(key.as_bytes());
    k.push(0);
    k.extend_from_slice(spec.as_bytes());
    k
}

fn encode_tagged<T: Serialize>(tag: u8, value: &T) -> Result<Vec<u8>> {
    let mut payload = vec![tag];
    serde_json::to_writer(&mut payload, value)
        .map_err(|e| GraphError::Corruption(format!("could not encode graph object: {e}")))?;
    Ok(payload)
}

fn decode_tagged<T: DeserializeOwned>(tag: u8, bytes: &[u8]) -> Result<T> {
    match bytes.split_first() {
        Some((&t, rest)) if t == tag => serde_json::from_slice(rest)
            .map_err(|e| GraphError::Corruption(format!("could not decode graph object: {e}"))),
        _ => Err(GraphError::Corruption(
            "graph object has an unexpected namespace tag".into(),
        )),
    }
}

pub struct GraphCore {
    gs: Box<dyn GraphStorage>,
    rules: Vec<Arc<dyn GraphRule>>,
}

impl GraphCore {
    pub(crate) fn new(gs: Box<dyn GraphStorage>) -> Self {
        Self {
            gs,
            rules: Vec::new(),
        }
    }

    pub(crate) fn add_rule(&mut self, rule: Arc<dyn GraphRule>) {
        self.rules.push(rule);
    }

    pub(crate) fn rule_names(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.name().to_string()).collect()
    }

    pub fn main_db(&mut self) -> &mut BTreeMap<String, String> {
        self.gs.main_db()
    }

    pub(crate) fn storage_name(&self) -> &str {
        self.gs.name()
    }

    /// Runs `f` against the storage manager `name`, wrapping storage-layer
    /// failures as component errors.
    pub(crate) fn with_sm<R>(
        &mut self,
        name: &str,
        create: bool,
        action: &'static str,
        f: impl FnOnce(&mut dyn StorageManager) -> Result<R>,
    ) -> Result<Option<R>> {
        let manager = self
            .gs
            .storage_manager(name, create)
            .map_err(|e| GraphError::storage("access", e))?;
        match manager {
            Some(sm) => f(sm).map(Some).map_err(|e| GraphError::storage(action, e)),
            None => Ok(None),
        }
    }

    fn read_object(&mut self, data: &str, idx: &str, hkey: &[u8]) -> Result<Option<Vec<u8>>> {
        let loc = self
            .with_sm(idx, false, "read", |sm| {
                let tree = HashTree::load(sm)?;
                Ok(tree.get(sm, hkey)?.map(|(v, _)| v))
            })?
            .flatten();
        match loc {
            Some(loc) => self.with_sm(data, false, "read", |sm| sm.fetch(loc)),
            None => Ok(None),
        }
    }

    fn write_object(&mut self, data: &str, idx: &str, hkey: &[u8], payload: &[u8]) -> Result<()> {
        let existing = self
            .with_sm(idx, true, "write", |sm| {
                let tree = HashTree::load(sm)?;
                Ok(tree.get(sm, hkey)?.map(|(v, _)| v))
            })?
            .expect("index manager created");

        match existing {
            Some(loc) => {
                let new_loc = self
                    .with_sm(data, true, "write", |sm| sm.update(loc, payload))?
                    .expect("data manager created");
                if new_loc != loc {
                    self.with_sm(idx, true, "write", |sm| {
                        let mut tree = HashTree::load(sm)?;
                        tree.put(sm, hkey, new_loc)?;
                        Ok(())
                    })?;
                }
            }
            None => {
                let loc = self
                    .with_sm(data, true, "write", |sm| sm.insert(payload))?
                    .expect("data manager created");
                self.with_sm(idx, true, "write", |sm| {
                    let mut tree = HashTree::load(sm)?;
                    tree.put(sm, hkey, loc)?;
                    Ok(())
                })?;
            }
        }
        Ok(())
    }

    fn remove_object(&mut self, data: &str, idx: &str, hkey: &[u8]) -> Result<Option<Vec<u8>>> {
        let loc = self
            .with_sm(idx, false, "write", |sm| {
                let mut tree = HashTree::load(sm)?;
                tree.remove(sm, hkey)
            })?
            .flatten();
        match loc {
            Some(loc) => self.with_sm(data, false, "write", |sm| {
                let bytes = sm.fetch(loc)?;
                sm.free(loc)?;
                Ok(bytes)
            }),
            None => Ok(None),
        }
    }

    // ---- reads ----------------------------------------------------------

    pub fn fetch_node(
        &mut self,
        partition: &str,
        key: &str,
        kind: &str,
    ) -> Result<Option<Node>> {
        validate_name("partition", partition)?;
        validate_name("kind", kind)?;
        let bytes = self.read_object(
            &nodes_sm(partition, kind),
            &nodeidx_sm(partition, kind),
            &attrs_key(key),
        )?;
        bytes
            .map(|b| decode_tagged::<BTreeMap<String, AttrValue>>(PREFIX_ATTRS, &b))
            .transpose()
            .map(|attrs| attrs.map(Node::from_attrs))
    }

    /// Fetches only the requested attributes of a node; `key` and `kind` are
    /// always included.
    pub fn fetch_node_part(
        &mut self,
        partition: &str,
        key: &str,
        kind: &str,
        attrs: &[&str],
    ) -> Result<Option<Node>> {
        Ok(self.fetch_node(partition, key, kind)?.map(|node| {
            let mut subset = Node::new(node.key(), node.kind());
            for attr in attrs {
                if let Some(value) = node.attr(attr) {
                    subset.set_attr(*attr, value.clone());
                }
            }
            subset
        }))
    }

    pub fn fetch_edge(
        &mut self,
        partition: &str,
        key: &str,
        kind: &str,
    ) -> Result<Option<Edge>> {
        validate_name("partition", partition)?;
        validate_name("kind", kind)?;
        let bytes = self.read_object(
            &edges_sm(partition, kind),
            &edgeidx_sm(partition, kind),
            &attrs_key(key),
        )?;
        bytes
            .map(|b| decode_tagged::<BTreeMap<String, AttrValue>>(PREFIX_ATTRS, &b))
            .transpose()
            .map(|attrs| attrs.map(|a| Edge::from_node(Node::from_attrs(a))))
    }

    /// All node keys of a kind, in key order.
    pub fn node_keys(&mut self, partition: &str, kind: &str) -> Result<Vec<String>> {
        self.entity_keys(&nodeidx_sm(partition, kind))
    }

    /// All edge keys of a kind, in key order.
    pub fn edge_keys(&mut self, partition: &str, kind: &str) -> Result<Vec<String>> {
        self.entity_keys(&edgeidx_sm(partition, kind))
    }

    fn entity_keys(&mut self, idx: &str) -> Result<Vec<String>> {
        let keys = self.with_sm(idx, false, "read", |sm| {
            let tree = HashTree::load(sm)?;
            let mut keys = Vec::new();
            for entry in tree.prefix_iter(sm, &[PREFIX_ATTRS]) {
                let (hkey, _) = entry?;
                keys.push(String::from_utf8_lossy(&hkey[1..]).into_owned());
            }
            Ok(keys)
        })?;
        Ok(keys.unwrap_or_default())
    }

    /// Walks the per-node spec set, filters against `spec`, and loads each
    /// matching edge with its opposite endpoint. With `all_data` unset only
    /// key and kind shells are returned.
    pub fn traverse(
        &mut self,
        partition: &str,
        key: &str,
        kind: &str,
        spec: &str,
        all_data: bool,
    ) -> Result<(Vec<Node>, Vec<Edge>)> {
        validate_name("partition", partition)?;
        validate_name("kind", kind)?;
        if spec.split(':').count() != 4 {
            return Err(GraphError::InvalidData(format!(
                "Invalid traversal spec '{spec}'"
            )));
        }

        let specs: BTreeSet<String> = self
            .read_object(
                &nodes_sm(partition, kind),
                &nodeidx_sm(partition, kind),
                &specs_key(key),
            )?
            .map(|b| decode_tagged(PREFIX_SPECS, &b))
            .transpose()?
            .unwrap_or_default();

        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let mut seen_edges = BTreeSet::new();
        let mut seen_nodes = BTreeSet::new();

        for stored_spec in specs {
            if !spec_matches(spec, &stored_spec) {
                continue;
            }
            let parts: Vec<&str> = stored_spec.split(':').collect();
            let (edge_kind, other_kind) = (parts[1], parts[3]);

            let list: Vec<(String, String)> = self
                .read_object(
                    &nodes_sm(partition, kind),
                    &nodeidx_sm(partition, kind),
                    &edge_list_key(key, &stored_spec),
                )?
                .map(|b| decode_tagged(PREFIX_EDGE, &b))
                .transpose()?
                .unwrap_or_default();

            for (edge_key, other_key) in list {
                if !seen_edges.insert((edge_kind.to_string(), edge_key.clone())) {
                    continue;
                }
                if all_data {
                    if let Some(edge) = self.fetch_edge(partition, &edge_key, edge_kind)? {
                        edges.push(edge);
                    }
                    if seen_nodes.insert((other_kind.to_string(), other_key.clone())) {
                        if let Some(node) = self.fetch_node(partition, &other_key, other_kind)? {
                            nodes.push(node);
                        }
                    }
                } else {
                    edges.push(Edge::from_node(Node::new(&edge_key, edge_kind)));
                    if seen_nodes.insert((other_kind.to_string(), other_key.clone())) {
                        nodes.push(Node::new(&other_key, other_kind));
                    }
                }
            }
        }
        Ok((nodes, edges))
    }

    // ---- writes ---------------------------------------------------------

    fn apply_store_node(
        &mut self,
        partition: &str,
        node: &Node,
        merge: bool,
    ) -> Result<GraphEvent> {
        validate_name("partition", partition)?;
        node.validate()?;

        let old = self.fetch_node(partition, node.key(), node.kind())?;
        let stored = match (&old, merge) {
            (Some(existing), true) => {
                let mut merged = existing.clone();
                merged.merge(node);
                merged
            }
            _ => node.clone(),
        };

        let payload = encode_tagged(PREFIX_ATTRS, stored.attrs())?;
        self.write_object(
            &nodes_sm(partition, node.kind()),
            &nodeidx_sm(partition, node.kind()),
            &attrs_key(node.key()),
            &payload,
        )?;

        Ok(match old {
            None => GraphEvent::NodeCreated {
                partition: partition.to_string(),
                node: stored,
            },
            Some(old) => GraphEvent::NodeUpdated {
                partition: partition.to_string(),
                node: stored,
                old,
            },
        })
    }

    fn apply_remove_node(
        &mut self,
        partition: &str,
        key: &str,
        kind: &str,
    ) -> Result<Option<GraphEvent>> {
        validate_name("partition", partition)?;
        validate_name("kind", kind)?;

        let removed = self
            .remove_object(
                &nodes_sm(partition, kind),
                &nodeidx_sm(partition, kind),
                &attrs_key(key),
            )?
            .map(|b| decode_tagged::<BTreeMap<String, AttrValue>>(PREFIX_ATTRS, &b))
            .transpose()?
            .map(Node::from_attrs);

        Ok(removed.map(|node| GraphEvent::NodeDeleted {
            partition: partition.to_string(),
            node,
        }))
    }

    fn apply_store_edge(&mut self, partition: &str, edge: &Edge) -> Result<GraphEvent> {
        validate_name("partition", partition)?;
        edge.validate()?;

        for end in [End::First, End::Second] {
            let exists = self
                .fetch_node(partition, edge.end_key(end), edge.end_kind(end))?
                .is_some();
            if !exists {
                return Err(GraphError::InvalidData(format!(
                    "Can't find edge endpoint: {} ({})",
                    edge.end_key(end),
                    edge.end_kind(end)
                )));
            }
        }

        let old = self.fetch_edge(partition, edge.key(), edge.kind())?;
        if let Some(old_edge) = &old {
            for end in [End::First, End::Second] {
                self.remove_endpoint_ref(partition, old_edge, end)?;
            }
        }

        let payload = encode_tagged(PREFIX_ATTRS, edge.as_node().attrs())?;
        self.write_object(
            &edges_sm(partition, edge.kind()),
            &edgeidx_sm(partition, edge.kind()),
            &attrs_key(edge.key()),
            &payload,
        )?;

        for end in [End::First, End::Second] {
            self.add_endpoint_ref(partition, edge, end)?;
        }

        Ok(match old {
            None => GraphEvent::EdgeCreated {
                partition: partition.to_string(),
                edge: edge.clone(),
            },
            Some(old) => GraphEvent::EdgeUpdated {
                partition: partition.to_string(),
                edge: edge.clone(),
                old,
            },
        })
    }

    fn apply_remove_edge(
        &mut self,
        partition: &str,
        key: &str,
        kind: &str,
    ) -> Result<Option<GraphEvent>> {
        validate_name("partition", partition)?;
        validate_name("kind", kind)?;

        let removed = self
            .remove_object(
                &edges_sm(partition, kind),
                &edgeidx_sm(partition, kind),
                &attrs_key(key),
            )?
            .map(|b| decode_tagged::<BTreeMap<String, AttrValue>>(PREFIX_ATTRS, &b))
            .transpose()?
            .map(|a| Edge::from_node(Node::from_attrs(a)));

        let Some(edge) = removed else {
            return Ok(None);
        };
        for end in [End::First, End::Second] {
            self.remove_endpoint_ref(partition, &edge, end)?;
        }

        Ok(Some(GraphEvent::EdgeDeleted {
            partition: partition.to_string(),
            edge,
        }))
    }

    /// Registers `edge` in the spec set and edge list of the endpoint at
    /// `end`.
    fn add_endpoint_ref(&mut self, partition: &str, edge: &Edge, end: End) -> Result<()> {
        let node_key = edge.end_key(end);
        let node_kind = edge.end_kind(end);
        let spec = edge.spec_from(end);
        let data = nodes_sm(partition, node_kind);
        let idx = nodeidx_sm(partition, node_kind);

        let mut specs: BTreeSet<String> = self
            .read_object(&data, &idx, &specs_key(node_key))?
            .map(|b| decode_tagged(PREFIX_SPECS, &b))
            .transpose()?
            .unwrap_or_default();
        if specs.insert(spec.clone()) {
            let payload = encode_tagged(PREFIX_SPECS, &specs)?;
            self.write_object(&data, &idx, &specs_key(node_key), &payload)?;
        }

        let list_key = edge_list_key(node_key, &spec);
        let mut list: Vec<(String, String)> = self
            .read_object(&data, &idx, &list_key)?
            .map(|b| decode_tagged(PREFIX_EDGE, &b))
            .transpose()?
            .unwrap_or_default();
        let other_key = edge.end_key(end.other()).to_string();
        match list.iter_mut().find(|(ek, _)| ek == edge.key()) {
            Some(entry) => entry.1 = other_key,
            None => list.push((edge.key().to_string(), other_key)),
        }
        let payload = encode_tagged(PREFIX_EDGE, &list)?;
        self.write_object(&data, &idx, &list_key, &payload)
    }

    /// Removes `edge` from the endpoint structures at `end`, dropping the
    /// edge list and the spec entry when they become empty.
    fn remove_endpoint_ref(&mut self, partition: &str, edge: &Edge, end: End) -> Result<()> {
        let node_key = edge.end_key(end);
        let node_kind = edge.end_kind(end);
        let spec = edge.spec_from(end);
        let data = nodes_sm(partition, node_kind);
        let idx = nodeidx_sm(partition, node_kind);

        let list_key = edge_list_key(node_key, &spec);
        let Some(bytes) = self.read_object(&data, &idx, &list_key)? else {
            return Ok(());
        };
        let mut list: Vec<(String, String)> = decode_tagged(PREFIX_EDGE, &bytes)?;
        list.retain(|(ek, _)| ek != edge.key());

        if !list.is_empty() {
            let payload = encode_tagged(PREFIX_EDGE, &list)?;
            return self.write_object(&data, &idx, &list_key, &payload);
        }

        self.remove_object(&data, &idx, &list_key)?;
        let mut specs: BTreeSet<String> = self
            .read_object(&data, &idx, &specs_key(node_key))?
            .map(|b| decode_tagged(PREFIX_SPECS, &b))
            .transpose()?
            .unwrap_or_default();
        if specs.remove(&spec) {
            if specs.is_empty() {
                self.remove_object(&data, &idx, &specs_key(node_key))?;
            } else {
                let payload = encode_tagged(PREFIX_SPECS, &specs)?;
                self.write_object(&data, &idx, &specs_key(node_key), &payload)?;
            }
        }
        Ok(())
    }

    // ---- transaction execution ------------------------------------------

    /// Applies the staged ops in order. After each primary op the interested
    /// rules run synchronously and may stage further ops on the same queue;
    /// all touched storage managers and the main DB flush at the end.
    ///
    /// There is no op-level undo: the first failing op stops the transaction
    /// and everything applied before it remains applied. The flush happens
    /// even on failure, so the preceding ops become durable and the error is
    /// still reported.
    pub(crate) fn execute(&mut self, ops: Vec<TransOp>) -> Result<()> {
        let mut queue: VecDeque<TransOp> = ops.into();

        let applied: Result<()> = (|| {
            while let Some(op) = queue.pop_front() {
                let event = self.apply_op(&op)?;
                if let Some(event) = event {
                    let rules = self.rules.clone();
                    for rule in rules {
                        if rule.handles().contains(&event.kind()) {
                            rule.handle(self, &mut queue, &event)?;
                        }
                    }
                }
            }
            Ok(())
        })();

        let flushed = self.flush();
        applied.and(flushed)
    }

    fn apply_op(&mut self, op: &TransOp) -> Result<Option<GraphEvent>> {
        debug!(?op, "applying graph op");
        match op {
            TransOp::StoreNode { partition, node } => {
                self.apply_store_node(partition, node, false).map(Some)
            }
            TransOp::UpdateNode { partition, node } => {
                self.apply_store_node(partition, node, true).map(Some)
            }
            TransOp::RemoveNode {
                partition,
                key,
                kind,
            } => self.apply_remove_node(partition, key, kind),
            TransOp::StoreEdge { partition, edge } => {
                self.apply_store_edge(partition, edge).map(Some)
            }
            TransOp::RemoveEdge {
                partition,
                key,
                kind,
            } => self.apply_remove_edge(partition, key, kind),
        }
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.gs
            .flush_all()
            .map_err(|e| GraphError::storage("flush", e))
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        self.gs.close().map_err(|e| GraphError::storage("close", e))
    }
}
