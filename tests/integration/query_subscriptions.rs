//! Query pagination, result post-operations and subscription deltas.

use std::sync::Arc;

use parking_lot::Mutex;
use strata::{
    AttrValue, Config, GraphManager, Node, QueryEngine, Selection, SubscriptionCallback,
    SubscriptionEngine,
};
use tempfile::tempdir;

const SONGS: [&str; 9] = [
    "Aria1",
    "Aria2",
    "Aria3",
    "Aria4",
    "DeadSong2",
    "FightSong4",
    "LoveSong3",
    "MyOnlySong3",
    "StrangeSong1",
];

fn song_graph() -> GraphManager {
    let gm = GraphManager::open(&Config::memory()).expect("open graph");
    // Insert out of order; ordering must come from the query.
    for (i, key) in SONGS.iter().rev().enumerate() {
        let mut node = Node::new(*key, "Song");
        node.set_attr("name", AttrValue::Str((*key).into()));
        node.set_attr("ranking", AttrValue::Int(i as i64 % 4));
        gm.store_node("main", node).expect("store song");
    }
    gm
}

#[test]
fn ordering_and_pagination() {
    let gm = song_graph();
    let engine = QueryEngine::new(&Config::memory());

    let (_, result) = engine
        .run_query(&gm, "main", "get Song with ordering(ascending key) show key")
        .expect("run");
    let result = result.lock();

    assert_eq!(result.row_count(), 9);
    let page: Vec<String> = result
        .rows_page(2, 3)
        .iter()
        .map(|row| row[0].to_string())
        .collect();
    assert_eq!(page, vec!["Aria3", "Aria4", "DeadSong2"]);

    // Pagination equals plain slicing of the unpaged rows.
    assert_eq!(result.rows_page(2, 3), &result.rows()[2..5]);
    assert_eq!(result.rows_page(8, 5).len(), 1);
}

#[test]
fn result_post_operations() {
    let gm = song_graph();
    let engine = QueryEngine::new(&Config::memory());
    let (rid, result) = engine
        .run_query(
            &gm,
            "main",
            "get Song with ordering(ascending key) show key, ranking",
        )
        .expect("run");

    {
        let mut result = result.lock();
        assert_eq!(result.total_selections(), 9);
        result.select(Selection::None);
        result.select(Selection::Row(0));
        result.select(Selection::Row(1));
        assert_eq!(result.total_selections(), 2);
        result.select(Selection::Invert);
        assert_eq!(result.total_selections(), 7);
        result.select(Selection::Invert);
        assert_eq!(result.total_selections(), 2);

        let csv = result.csv();
        assert!(csv.starts_with("key,ranking\n"));
        assert_eq!(csv.lines().count(), 10);

        let histogram = result.quickfilter(1, 2);
        assert_eq!(histogram.len(), 2);
        assert!(histogram[0].1 >= histogram[1].1);
    }

    engine.group_selected(&gm, rid, "picked").expect("group");
    let (members, _) = gm
        .traverse_multi("main", "picked", "group", ":::", true)
        .expect("traverse group");
    let mut keys: Vec<&str> = members.iter().map(|n| n.key()).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["Aria1", "Aria2"]);
}

#[test]
fn subscription_delta_scenario() {
    let dir = tempdir().expect("tmpdir");
    let gm = GraphManager::open(&Config {
        record_size: 512,
        max_file_size: 64 * 1024,
        ..Config::disk(dir.path())
    })
    .expect("open graph");

    let mut song = Node::new("s1", "Song");
    song.set_attr("name", AttrValue::Str("s1".into()));
    gm.store_node("main", song).expect("store");

    let subs = SubscriptionEngine::new(&gm).expect("engine");
    let log: Arc<Mutex<Vec<Vec<Vec<AttrValue>>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let callback: SubscriptionCallback = Box::new(move |rows| {
        sink.lock().push(rows.to_vec());
        true
    });
    subs.subscribe(&gm, "main", "get Song where key = 's1' show name", callback)
        .expect("subscribe");

    // Initial delivery.
    assert_eq!(
        log.lock().as_slice(),
        &[vec![vec![AttrValue::Str("s1".into())]]]
    );

    // Update within the projection.
    let mut song = Node::new("s1", "Song");
    song.set_attr("name", AttrValue::Str("foo".into()));
    gm.store_node("main", song).expect("update");
    assert_eq!(
        log.lock().last().expect("delta"),
        &vec![vec![AttrValue::Str("foo".into())]]
    );

    // A store under a different kind leaves the projection untouched.
    let mut other = Node::new("s1", "NewSong");
    other.set_attr("name", AttrValue::Str("other".into()));
    gm.store_node("main", other).expect("store other kind");
    assert_eq!(log.lock().len(), 2);

    // Back to the subscribed kind.
    let mut song = Node::new("s1", "Song");
    song.set_attr("name", AttrValue::Str("bar".into()));
    gm.store_node("main", song).expect("update again");
    assert_eq!(log.lock().len(), 3);
    assert_eq!(
        log.lock().last().expect("delta"),
        &vec![vec![AttrValue::Str("bar".into())]]
    );
}

#[test]
fn queries_work_against_disk_storage() {
    let dir = tempdir().expect("tmpdir");
    let config = Config {
        record_size: 512,
        max_file_size: 64 * 1024,
        ..Config::disk(dir.path())
    };
    {
        let gm = GraphManager::open(&config).expect("open graph");
        for key in SONGS {
            let mut node = Node::new(key, "Song");
            node.set_attr("name", AttrValue::Str(key.into()));
            gm.store_node("main", node).expect("store");
        }
        gm.close().expect("close");
    }

    let gm = GraphManager::open(&config).expect("reopen");
    let engine = QueryEngine::new(&config);
    let (_, result) = engine
        .run_query(
            &gm,
            "main",
            "get Song where name beginswith 'Aria' with ordering(descending key) show key",
        )
        .expect("run");
    let keys: Vec<String> = result
        .lock()
        .rows()
        .iter()
        .map(|row| row[0].to_string())
        .collect();
    assert_eq!(keys, vec!["Aria4", "Aria3", "Aria2", "Aria1"]);
}
