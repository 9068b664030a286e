//! # Strata - Embedded Transactional Graph Database
//!
//! Strata is a persistent, page-structured record store under a typed graph
//! model of nodes and edges, accessed through a transactional API with a
//! declarative query and subscription layer on top.
//!
//! ## Quick Start
//!
//! ```rust
//! use strata::{Config, GraphManager, Node};
//!
//! let gm = GraphManager::open(&Config::memory())?;
//! gm.store_node("main", Node::new("fox", "Animal"))?;
//!
//! let fetched = gm.fetch_node("main", "fox", "Animal")?;
//! assert!(fetched.is_some());
//! assert_eq!(gm.node_count("Animal")?, 1);
//! # Ok::<(), strata::GraphError>(())
//! ```
//!
//! ## Architecture
//!
//! The engine is layered bottom-up:
//!
//! - **Record storage**: fixed-size records in multi-file paged stores with
//!   a rolling transaction log for crash-safe commits
//! - **Storage managers**: variable-length objects with free-slot recycling
//!   and an extensible hash index, behind disk, memory and cached backends
//! - **Graph manager**: the node/edge model with traversals, rules, events
//!   and transactional batches
//! - **Query and subscriptions**: a declarative query language with cached
//!   results and event-driven delta delivery

pub mod config;
pub mod error;
pub mod graph;
pub mod logging;
pub mod model;
pub mod query;
pub mod search;
pub mod storage;
pub mod subscription;
pub mod util;

// Re-export the main public API.
pub use crate::config::Config;
pub use crate::error::{GraphError, Result};
pub use crate::graph::rules::GraphRule;
pub use crate::graph::{EventKind, GraphEvent, GraphManager, TransCounts};
pub use crate::model::{AttrValue, Edge, End, Node};
pub use crate::query::{QueryEngine, SearchResult, Selection};
pub use crate::search::IndexQuery;
pub use crate::subscription::{SubscriptionCallback, SubscriptionEngine};
