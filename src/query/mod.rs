//! Declarative query layer: parser, runtime and the result cache.
//!
//! Queries are compiled against the graph model and materialised once; the
//! resulting [`SearchResult`] is cached under an opaque result id so later
//! requests can page, select, group and export without re-running the query.

pub mod ast;
pub mod parser;
pub mod result;
mod runtime;

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{GraphError, Result};
use crate::graph::GraphManager;
use crate::model::{Edge, Node};

pub use crate::query::ast::Query;
pub use crate::query::parser::parse;
pub use crate::query::result::{ResultHeader, SearchResult, Selection};

pub(crate) use crate::query::runtime::run;

/// Node kind used for grouping containers.
pub const GROUP_NODE_KIND: &str = "group";

/// Edge kind of group membership edges.
pub const GROUP_EDGE_KIND: &str = "Containment";

/// Query engine handle owning the result cache.
///
/// The cache and its result objects are process state owned by this handle;
/// selection bitmaps are mutated under the per-result lock.
pub struct QueryEngine {
    cache: Mutex<LruCache<u64, Arc<Mutex<SearchResult>>>>,
    next_rid: AtomicU64,
}

impl QueryEngine {
    pub fn new(config: &Config) -> Self {
        let entries =
            NonZeroUsize::new(config.result_cache_entries.max(1)).expect("entries >= 1");
        Self {
            cache: Mutex::new(LruCache::new(entries)),
            next_rid: AtomicU64::new(1),
        }
    }

    /// Parses and runs `text` against `partition`, materialises the result
    /// and caches it. Returns the result id and the result itself.
    pub fn run_query(
        &self,
        gm: &GraphManager,
        partition: &str,
        text: &str,
    ) -> Result<(u64, Arc<Mutex<SearchResult>>)> {
        let query = parse(text)?;
        let result = gm.with_core(|core| run(core, partition, &query))?;
        let rid = self.next_rid.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Mutex::new(result));
        self.cache.lock().put(rid, Arc::clone(&shared));
        Ok((rid, shared))
    }

    /// Looks a cached result up by its id.
    pub fn result(&self, rid: u64) -> Option<Arc<Mutex<SearchResult>>> {
        self.cache.lock().get(&rid).cloned()
    }

    /// Materialises the selected rows of a cached result into group
    /// membership: a `group` node with `group_key` plus one containment edge
    /// per selected primary entity.
    pub fn group_selected(&self, gm: &GraphManager, rid: u64, group_key: &str) -> Result<()> {
        let shared = self.result(rid).ok_or_else(|| GraphError::QueryRuntime {
            detail: format!("unknown result id {rid}"),
            line: 0,
            column: 0,
        })?;

        let (partition, members) = {
            let result = shared.lock();
            let primary = result.header().primary_kind.clone();
            let mut members: Vec<(String, String)> = Vec::new();
            for sources in result.selected_sources() {
                let member = sources.iter().find_map(|source| {
                    let mut parts = source.splitn(3, ':');
                    match (parts.next(), parts.next(), parts.next()) {
                        (Some("n"), Some(kind), Some(key)) if kind == primary => {
                            Some((kind.to_string(), key.to_string()))
                        }
                        _ => None,
                    }
                });
                if let Some(member) = member {
                    if !members.contains(&member) {
                        members.push(member);
                    }
                }
            }
            (result.header().partition.clone(), members)
        };

        let mut trans = gm.new_trans();
        trans.store_node(&partition, Node::new(group_key, GROUP_NODE_KIND))?;
        for (kind, key) in members {
            let edge = Edge::new(
                format!("{group_key}:{kind}:{key}"),
                GROUP_EDGE_KIND,
                (group_key, GROUP_NODE_KIND, "group"),
                (&key, &kind, "member"),
            );
            trans.store_edge(&partition, edge)?;
        }
        trans.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttrValue;

    fn sample_graph() -> GraphManager {
        let gm = GraphManager::open(&Config::memory()).expect("open graph");
        for (key, name, rating) in [
            ("s1", "Aria1", 8i64),
            ("s2", "Aria2", 2),
            ("s3", "DeadSong2", 5),
        ] {
            let mut node = Node::new(key, "Song");
            node.set_attr("name", AttrValue::Str(name.into()));
            node.set_attr("rating", AttrValue::Int(rating));
            gm.store_node("main", node).expect("store");
        }
        gm.store_node("main", Node::new("a1", "Author")).expect("store author");
        for song in ["s1", "s2"] {
            let edge = Edge::new(
                format!("w-{song}"),
                "wrote",
                ("a1", "Author", "author"),
                (song, "Song", "song"),
            );
            gm.store_edge("main", edge).expect("store edge");
        }
        gm
    }

    #[test]
    fn filtered_and_ordered_query() {
        let gm = sample_graph();
        let engine = QueryEngine::new(&Config::memory());

        let (_, result) = engine
            .run_query(
                &gm,
                "main",
                "get Song where rating > 3 with ordering(descending rating) show key, rating",
            )
            .expect("run");
        let result = result.lock();
        assert_eq!(result.header().labels, vec!["key", "rating"]);
        assert_eq!(
            result.rows(),
            &[
                vec![AttrValue::Str("s1".into()), AttrValue::Int(8)],
                vec![AttrValue::Str("s3".into()), AttrValue::Int(5)],
            ]
        );
        assert_eq!(result.sources()[0][0], "n:Song:s1");
    }

    #[test]
    fn key_lookup_is_pushed_down() {
        let gm = sample_graph();
        let engine = QueryEngine::new(&Config::memory());
        let (_, result) = engine
            .run_query(&gm, "main", "get Song where key = 's2' show name")
            .expect("run");
        let result = result.lock();
        assert_eq!(result.rows(), &[vec![AttrValue::Str("Aria2".into())]]);
    }

    #[test]
    fn traversal_chain_projection() {
        let gm = sample_graph();
        let engine = QueryEngine::new(&Config::memory());
        let (_, result) = engine
            .run_query(
                &gm,
                "main",
                "get Author traverse author:wrote:song:Song end \
                 with ordering(ascending 2:key) show key, 2:name",
            )
            .expect("run");
        let result = result.lock();
        assert_eq!(result.row_count(), 2);
        let names: Vec<String> = result.rows().iter().map(|r| r[1].to_string()).collect();
        assert_eq!(names, vec!["Aria1", "Aria2"]);
        assert_eq!(result.sources()[0], vec!["n:Author:a1", "n:Song:s1"]);
    }

    #[test]
    fn string_operators() {
        let gm = sample_graph();
        let engine = QueryEngine::new(&Config::memory());
        for (query, expected) in [
            ("get Song where name beginswith 'Aria' show key", 2),
            ("get Song where name contains 'Song' show key", 1),
            ("get Song where name endswith '2' show key", 2),
            ("get Song where name like '*Song?' show key", 1),
            ("get Song where not name beginswith 'Aria' show key", 1),
        ] {
            let (_, result) = engine.run_query(&gm, "main", query).expect("run");
            assert_eq!(result.lock().row_count(), expected, "query: {query}");
        }
    }

    #[test]
    fn result_cache_lookup() {
        let gm = sample_graph();
        let engine = QueryEngine::new(&Config::memory());
        let (rid, _) = engine
            .run_query(&gm, "main", "get Song show key")
            .expect("run");
        assert!(engine.result(rid).is_some());
        assert!(engine.result(rid + 100).is_none());
    }

    #[test]
    fn group_selected_creates_membership_edges() {
        let gm = sample_graph();
        let engine = QueryEngine::new(&Config::memory());
        let (rid, result) = engine
            .run_query(
                &gm,
                "main",
                "get Song with ordering(ascending key) show key",
            )
            .expect("run");
        {
            let mut result = result.lock();
            result.select(Selection::None);
            result.select(Selection::Row(0));
            result.select(Selection::Row(2));
        }
        engine.group_selected(&gm, rid, "favourites").expect("group");

        assert!(gm
            .fetch_node("main", "favourites", GROUP_NODE_KIND)
            .expect("fetch group")
            .is_some());
        let (nodes, edges) = gm
            .traverse_multi("main", "favourites", GROUP_NODE_KIND, ":::", true)
            .expect("traverse");
        let mut member_keys: Vec<&str> = nodes.iter().map(|n| n.key()).collect();
        member_keys.sort_unstable();
        assert_eq!(member_keys, vec!["s1", "s3"]);
        assert_eq!(edges.len(), 2);
    }
}
