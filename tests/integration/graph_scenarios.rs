//! End-to-end graph scenarios against disk-backed storage.

use strata::{AttrValue, Config, Edge, End, GraphManager, Node};
use tempfile::tempdir;

fn disk_config(dir: &std::path::Path) -> Config {
    Config {
        record_size: 512,
        max_file_size: 64 * 1024,
        trans_log_threshold: 3,
        ..Config::disk(dir)
    }
}

#[test]
fn store_and_fetch() {
    let dir = tempdir().expect("tmpdir");
    let gm = GraphManager::open(&disk_config(dir.path())).expect("open graph");

    gm.store_node("main", Node::new("foo", "bar")).expect("store");

    let fetched = gm
        .fetch_node("main", "foo", "bar")
        .expect("fetch")
        .expect("node exists");
    assert_eq!(fetched.key(), "foo");
    assert_eq!(fetched.kind(), "bar");
    assert_eq!(gm.node_count("bar").expect("count"), 1);
}

#[test]
fn data_survives_reopen() {
    let dir = tempdir().expect("tmpdir");
    let config = disk_config(dir.path());

    {
        let gm = GraphManager::open(&config).expect("open graph");
        let mut node = Node::new("fox", "Animal");
        node.set_attr("name", AttrValue::Str("quick brown fox".into()));
        node.set_attr("legs", AttrValue::Int(4));
        gm.store_node("main", node).expect("store node");
        gm.store_node("main", Node::new("hole", "Place")).expect("store place");
        let edge = Edge::new(
            "f2h",
            "lives_in",
            ("fox", "Animal", "dweller"),
            ("hole", "Place", "home"),
        );
        gm.store_edge("main", edge).expect("store edge");
        gm.close().expect("close");
    }

    let gm = GraphManager::open(&config).expect("reopen graph");
    let node = gm
        .fetch_node("main", "fox", "Animal")
        .expect("fetch")
        .expect("node persisted");
    assert_eq!(node.attr("legs"), Some(&AttrValue::Int(4)));

    let (nodes, edges) = gm
        .traverse_multi("main", "fox", "Animal", "dweller:lives_in:home:Place", true)
        .expect("traverse");
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].key(), "hole");
    assert_eq!(edges.len(), 1);

    assert_eq!(gm.node_count("Animal").expect("count"), 1);
    assert_eq!(gm.edge_count("lives_in").expect("count"), 1);
    assert!(gm.partitions().expect("parts").contains(&"main".to_string()));

    // The word index is persistent too.
    let index = gm.node_index_query("main", "Animal").expect("index");
    let hits = index.lookup_word("name", "fox").expect("lookup");
    assert_eq!(hits.get("fox"), Some(&vec![3]));
}

#[test]
fn cascading_delete() {
    let dir = tempdir().expect("tmpdir");
    let gm = GraphManager::open(&disk_config(dir.path())).expect("open graph");

    gm.store_node("main", Node::new("a", "K")).expect("store a");
    gm.store_node("main", Node::new("b", "K")).expect("store b");
    let mut edge = Edge::new("e", "R", ("a", "K", "src"), ("b", "K", "dst"));
    edge.set_cascading(End::First, true, false);
    gm.store_edge("main", edge).expect("store edge");

    gm.remove_node("main", "a", "K").expect("remove a");

    assert_eq!(gm.fetch_node("main", "b", "K").expect("fetch b"), None);
    assert_eq!(gm.fetch_edge("main", "e", "R").expect("fetch e"), None);
    assert_eq!(gm.node_count("K").expect("count"), 0);
    assert_eq!(gm.edge_count("R").expect("count"), 0);
}

#[test]
fn store_twice_emits_update_semantics() {
    let dir = tempdir().expect("tmpdir");
    let gm = GraphManager::open(&disk_config(dir.path())).expect("open graph");

    let mut node = Node::new("n", "Item");
    node.set_attr("v", AttrValue::Int(1));
    gm.store_node("main", node.clone()).expect("first store");
    assert_eq!(gm.node_count("Item").expect("count"), 1);

    node.set_attr("v", AttrValue::Int(2));
    gm.store_node("main", node).expect("second store");
    // A replace of an existing node must not bump the count.
    assert_eq!(gm.node_count("Item").expect("count"), 1);
    let stored = gm
        .fetch_node("main", "n", "Item")
        .expect("fetch")
        .expect("node");
    assert_eq!(stored.attr("v"), Some(&AttrValue::Int(2)));
}

#[test]
fn wildcard_traversal_sees_each_edge_once() {
    let dir = tempdir().expect("tmpdir");
    let gm = GraphManager::open(&disk_config(dir.path())).expect("open graph");

    gm.store_node("main", Node::new("hub", "Hub")).expect("store hub");
    for i in 0..5 {
        let key = format!("leaf{i}");
        gm.store_node("main", Node::new(&key, "Leaf")).expect("store leaf");
        let edge = Edge::new(
            format!("spoke{i}"),
            "connects",
            ("hub", "Hub", "hub"),
            (&key, "Leaf", "leaf"),
        );
        gm.store_edge("main", edge).expect("store edge");
    }

    let (nodes, edges) = gm
        .traverse_multi("main", "hub", "Hub", ":::", true)
        .expect("traverse");
    assert_eq!(nodes.len(), 5);
    assert_eq!(edges.len(), 5);

    let mut edge_keys: Vec<&str> = edges.iter().map(|e| e.key()).collect();
    edge_keys.sort_unstable();
    edge_keys.dedup();
    assert_eq!(edge_keys.len(), 5, "every incident edge exactly once");
}

#[test]
fn failing_op_keeps_earlier_ops_durable() {
    let dir = tempdir().expect("tmpdir");
    let config = disk_config(dir.path());

    {
        let gm = GraphManager::open(&config).expect("open graph");
        let mut trans = gm.new_trans();
        trans
            .store_node("main", Node::new("kept", "Item"))
            .expect("stage node");
        // Passes stage-time validation, fails at apply time.
        let edge = Edge::new(
            "e",
            "R",
            ("kept", "Item", "src"),
            ("missing", "Item", "dst"),
        );
        trans.store_edge("main", edge).expect("stage edge");

        let err = trans.commit().expect_err("commit reports the failing op");
        assert!(err.to_string().contains("Can't find edge endpoint"));
        // Dropped without close: durability of the first op must come from
        // the commit's own flush.
    }

    let gm = GraphManager::open(&config).expect("reopen");
    let node = gm
        .fetch_node("main", "kept", "Item")
        .expect("fetch")
        .expect("op before the failure was flushed");
    assert_eq!(node.key(), "kept");
    assert_eq!(gm.node_count("Item").expect("count"), 1);
    assert_eq!(gm.fetch_edge("main", "e", "R").expect("fetch edge"), None);
}

#[test]
fn bulk_load_with_rolling_trans() {
    let dir = tempdir().expect("tmpdir");
    let config = disk_config(dir.path());
    {
        let gm = GraphManager::open(&config).expect("open graph");
        let mut trans = gm.new_rolling_trans(10);
        for i in 0..100 {
            let mut node = Node::new(format!("n{i:03}"), "Bulk");
            node.set_attr("ordinal", AttrValue::Int(i));
            trans.store_node("main", node).expect("stage");
        }
        trans.commit().expect("commit");
        assert_eq!(gm.node_count("Bulk").expect("count"), 100);
        gm.close().expect("close");
    }

    let gm = GraphManager::open(&config).expect("reopen");
    assert_eq!(gm.node_keys("main", "Bulk").expect("keys").len(), 100);
    let node = gm
        .fetch_node("main", "n042", "Bulk")
        .expect("fetch")
        .expect("node");
    assert_eq!(node.attr("ordinal"), Some(&AttrValue::Int(42)));
}
