//! Subscription runtime: wires query definitions to graph events.
//!
//! A subscription runs its query once for the initial delivery, then a
//! registered graph rule re-runs it whenever an event touches one of the
//! query's kinds in the subscribed partition. Consecutive equal deliveries
//! are de-duplicated. Delivery happens synchronously inside the event
//! pipeline, so a slow callback stalls upstream writers (deliberate
//! backpressure); callbacks must not mutate the graph.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::graph::core::GraphCore;
use crate::graph::events::{EventKind, GraphEvent};
use crate::graph::rules::GraphRule;
use crate::graph::trans::TransOp;
use crate::graph::GraphManager;
use crate::model::AttrValue;
use crate::query::{self, Query};

/// Row delta callback; returning `false` reports the subscription finished.
pub type SubscriptionCallback = Box<dyn FnMut(&[Vec<AttrValue>]) -> bool + Send>;

struct Subscription {
    partition: String,
    query: Query,
    kinds: HashSet<String>,
    all_kinds: bool,
    last: Option<Vec<Vec<AttrValue>>>,
    callback: SubscriptionCallback,
}

#[derive(Default)]
struct SubState {
    subs: HashMap<u64, Subscription>,
    kind_refs: HashMap<String, usize>,
    all_kind_refs: usize,
    next_id: u64,
}

impl SubState {
    fn add_refs(&mut self, sub: &Subscription) {
        if sub.all_kinds {
            self.all_kind_refs += 1;
        }
        for kind in &sub.kinds {
            *self.kind_refs.entry(kind.clone()).or_insert(0) += 1;
        }
    }

    fn drop_refs(&mut self, sub: &Subscription) {
        if sub.all_kinds {
            self.all_kind_refs = self.all_kind_refs.saturating_sub(1);
        }
        for kind in &sub.kinds {
            if let Some(count) = self.kind_refs.get_mut(kind) {
                *count -= 1;
                if *count == 0 {
                    // Last subscription on this kind: tear the bookkeeping
                    // down.
                    self.kind_refs.remove(kind);
                }
            }
        }
    }

    fn watches_kind(&self, kind: &str) -> bool {
        self.all_kind_refs > 0 || self.kind_refs.contains_key(kind)
    }
}

/// Engine owning all subscriptions of one process.
pub struct SubscriptionEngine {
    state: Arc<Mutex<SubState>>,
}

impl SubscriptionEngine {
    /// Creates the engine and registers its event rule on the manager.
    pub fn new(gm: &GraphManager) -> Result<Self> {
        let state = Arc::new(Mutex::new(SubState::default()));
        gm.set_graph_rule(Arc::new(SubscriptionRule {
            state: Arc::clone(&state),
        }))?;
        Ok(Self { state })
    }

    /// Runs `text` once, delivers the initial result to `callback` and
    /// registers the subscription for delta delivery.
    pub fn subscribe(
        &self,
        gm: &GraphManager,
        partition: &str,
        text: &str,
        mut callback: SubscriptionCallback,
    ) -> Result<u64> {
        let parsed = query::parse(text)?;
        let result = gm.with_core(|core| query::run(core, partition, &parsed))?;
        let rows = result.rows().to_vec();
        let keep = callback(&rows);

        let (kinds, all_kinds) = affected_kinds(&parsed);
        let subscription = Subscription {
            partition: partition.to_string(),
            query: parsed,
            kinds,
            all_kinds,
            last: Some(rows),
            callback,
        };

        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        if keep {
            state.add_refs(&subscription);
            state.subs.insert(id, subscription);
        }
        Ok(id)
    }

    /// Removes a subscription and its kind bookkeeping.
    pub fn unsubscribe(&self, id: u64) {
        let mut state = self.state.lock();
        if let Some(sub) = state.subs.remove(&id) {
            state.drop_refs(&sub);
        }
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.state.lock().subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Kinds whose events can mutate data within the query's projection: the
/// starting kind plus every kind named in a traversal spec. Wildcard specs
/// make the subscription react to every kind.
fn affected_kinds(query: &Query) -> (HashSet<String>, bool) {
    let mut kinds = HashSet::new();
    kinds.insert(query.kind.clone());
    let mut all = false;
    for step in &query.traversals {
        let parts: Vec<&str> = step.spec.split(':').collect();
        for component in [parts[1], parts[3]] {
            if component.is_empty() {
                all = true;
            } else {
                kinds.insert(component.to_string());
            }
        }
    }
    (kinds, all)
}

struct SubscriptionRule {
    state: Arc<Mutex<SubState>>,
}

const ALL_EVENTS: &[EventKind] = &[
    EventKind::NodeCreated,
    EventKind::NodeUpdated,
    EventKind::NodeDeleted,
    EventKind::EdgeCreated,
    EventKind::EdgeUpdated,
    EventKind::EdgeDeleted,
];

impl GraphRule for SubscriptionRule {
    fn name(&self) -> &str {
        "system.subscriptions"
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
        let entity_kind = event.entity().kind().to_string();
        let partition = event.partition().to_string();

        let mut state = self.state.lock();
        if !state.watches_kind(&entity_kind) {
            return Ok(());
        }

        let mut finished = Vec::new();
        for (&id, sub) in state.subs.iter_mut() {
            if sub.partition != partition {
                continue;
            }
            if !sub.all_kinds && !sub.kinds.contains(&entity_kind) {
                continue;
            }

            let result = query::run(core, &partition, &sub.query)?;
            let rows = result.rows().to_vec();
            if sub.last.as_ref() == Some(&rows) {
                continue; // unchanged projection, de-duplicated
            }
            sub.last = Some(rows.clone());
            debug!(subscription = id, rows = rows.len(), "delivering delta");
            if !(sub.callback)(&rows) {
                finished.push(id);
            }
        }

        for id in finished {
            if let Some(sub) = state.subs.remove(&id) {
                state.drop_refs(&sub);
            }
        }
        Ok(())
    }
}
