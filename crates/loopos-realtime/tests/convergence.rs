//! 两个客户端通过进程内 hub 收敛到同一实体状态

use std::sync::Arc;
use std::time::Duration;

use loopos_realtime::{
    ChangeSource, EntityCache, EntityChange, MemoryHub, Node, NodeSync, RealtimeConfig, RowOp, Scene, SceneSync,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::sleep;
use tokio_test::assert_ok;

struct Client {
    sync: NodeSync,
    cache: Arc<Mutex<EntityCache<Node>>>,
    log: Arc<Mutex<Vec<EntityChange>>>,
}

async fn client(hub: &Arc<MemoryHub>, actor: &str) -> Client {
    let config = assert_ok!(RealtimeConfig::builder().workspace_id("ws1").actor_id(actor).build());
    let sync = assert_ok!(NodeSync::subscribe(&config, hub.clone(), hub.clone()).await);

    let cache = Arc::new(Mutex::new(EntityCache::new()));
    cache.lock().insert(Node::new("n1", "ws1"));
    let log = Arc::new(Mutex::new(Vec::new()));

    let (sink, changes) = (cache.clone(), log.clone());
    sync.on_change(move |change| {
        changes.lock().push(change.clone());
        let _ = sink.lock().apply(change);
    });
    Client { sync, cache, log }
}

fn position(client: &Client) -> (f64, f64, u64) {
    let cache = client.cache.lock();
    let node = cache.get("n1").expect("n1 cached");
    (node.x, node.y, node.version)
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn move_is_applied_by_peer_then_confirmed_by_feed() {
    let hub = MemoryHub::new();
    let x = client(&hub, "user-x").await;
    let y = client(&hub, "user-y").await;

    // X 的乐观本地写入
    if let Some(node) = x.cache.lock().get_mut("n1") {
        node.x = 10.0;
        node.y = 20.0;
    }
    assert_ok!(x.sync.broadcast_move("n1", 10.0, 20.0, None));
    sleep(Duration::from_millis(200)).await;
    settle().await;

    assert_eq!(position(&y), (10.0, 20.0, 1));
    assert!(x.log.lock().is_empty());

    // 持久化写入完成，变更流推送给双方（包括发起者）
    hub.commit(
        RowOp::Update,
        "loopos_nodes",
        json!({"id": "n1", "workspace_id": "ws1", "version": 7, "x": 10.0, "y": 20.0, "updated_by": "user-x"}),
    );
    settle().await;

    assert_eq!(position(&x), (10.0, 20.0, 7));
    assert_eq!(position(&y), (10.0, 20.0, 7));
    assert_eq!(x.sync.known_version("n1"), Some(7));
    assert_eq!(y.sync.known_version("n1"), Some(7));
    assert_eq!(x.log.lock()[0].source, ChangeSource::Feed);
}

#[tokio::test(start_paused = true)]
async fn concurrent_moves_snap_back_to_persisted_row() {
    let hub = MemoryHub::new();
    let x = client(&hub, "user-x").await;
    let y = client(&hub, "user-y").await;

    assert_ok!(x.sync.broadcast_move("n1", 1.0, 1.0, None));
    assert_ok!(y.sync.broadcast_move("n1", 2.0, 2.0, None));
    sleep(Duration::from_millis(200)).await;
    settle().await;

    // 临时通道上没有确定的胜者：各自看到对方的位置
    assert_eq!(position(&x).0, 2.0);
    assert_eq!(position(&y).0, 1.0);

    hub.commit(
        RowOp::Update,
        "loopos_nodes",
        json!({"id": "n1", "workspace_id": "ws1", "version": 8, "x": 2.0, "y": 2.0, "updated_by": "user-y"}),
    );
    settle().await;

    assert_eq!(position(&x), position(&y));
    assert_eq!(position(&x), (2.0, 2.0, 8));
}

#[tokio::test]
async fn stale_broadcast_after_feed_is_ignored() {
    let hub = MemoryHub::new();
    let x = client(&hub, "user-x").await;
    let y = client(&hub, "user-y").await;

    hub.commit(
        RowOp::Update,
        "loopos_nodes",
        json!({"id": "n1", "workspace_id": "ws1", "version": 5, "title": "Release", "updated_by": "user-x"}),
    );
    settle().await;

    // 迟到的旧版本广播
    assert_ok!(x.sync.broadcast_update("n1", json!({"title": "Draft"}), Some(4)).await);
    settle().await;

    assert_eq!(y.cache.lock().get("n1").map(|n| n.title.clone()), Some("Release".to_string()));
    assert_eq!(y.sync.stats().stale, 1);
}

#[tokio::test]
async fn delete_then_create_round_trip() {
    let hub = MemoryHub::new();
    let x = client(&hub, "user-x").await;
    let y = client(&hub, "user-y").await;

    assert_ok!(x.sync.broadcast_delete("n1").await);
    settle().await;
    assert!(y.cache.lock().is_empty());

    let node = Node::new("n2", "ws1").at(3.0, 4.0);
    assert_ok!(x.sync.broadcast_create(&node).await);
    settle().await;

    let cache = y.cache.lock();
    let created = cache.get("n2").expect("n2 created on peer");
    assert_eq!((created.x, created.y), (3.0, 4.0));
}

#[tokio::test]
async fn feed_delete_removes_entity_from_every_peer() {
    let hub = MemoryHub::new();
    let x = client(&hub, "user-x").await;
    let y = client(&hub, "user-y").await;
    let row = json!({"id": "n1", "workspace_id": "ws1", "version": 5, "x": 9.0, "updated_by": "user-x"});

    hub.commit(RowOp::Insert, "loopos_nodes", row.clone());
    settle().await;
    assert_eq!(position(&y), (9.0, 0.0, 5));
    assert_eq!(y.sync.known_version("n1"), Some(5));

    // 只有变更流上的 delete，旧行携带相同的版本
    hub.commit(RowOp::Delete, "loopos_nodes", row);
    settle().await;

    assert!(x.cache.lock().is_empty());
    assert!(y.cache.lock().is_empty());
    assert_eq!(y.sync.known_version("n1"), None);
}

#[tokio::test]
async fn feed_delete_after_local_delete_is_silent_for_originator() {
    let hub = MemoryHub::new();
    let x = client(&hub, "user-x").await;
    let y = client(&hub, "user-y").await;

    hub.commit(
        RowOp::Update,
        "loopos_nodes",
        json!({"id": "n1", "workspace_id": "ws1", "version": 3, "updated_by": "user-y"}),
    );
    settle().await;
    x.log.lock().clear();

    // X 先在本地删除，再广播
    x.cache.lock().remove("n1");
    assert_ok!(x.sync.broadcast_delete("n1").await);
    settle().await;
    assert!(y.cache.lock().is_empty());

    hub.commit(
        RowOp::Delete,
        "loopos_nodes",
        json!({"id": "n1", "workspace_id": "ws1", "version": 3, "updated_by": "user-x"}),
    );
    settle().await;

    assert!(x.log.lock().is_empty());
    assert!(x.cache.lock().is_empty());
    assert!(y.cache.lock().is_empty());
    assert_eq!(x.sync.known_version("n1"), None);
}

#[tokio::test]
async fn scene_activation_is_exclusive_on_peers() {
    let hub = MemoryHub::new();
    let config = |actor: &str| RealtimeConfig::builder().workspace_id("ws1").actor_id(actor).build();
    let x = assert_ok!(SceneSync::subscribe(&assert_ok!(config("user-x")), hub.clone(), hub.clone()).await);
    let y = assert_ok!(SceneSync::subscribe(&assert_ok!(config("user-y")), hub.clone(), hub.clone()).await);

    let cache = Arc::new(Mutex::new(EntityCache::<Scene>::new()));
    let mut intro = Scene::new("s1", "ws1", "Intro");
    intro.is_active = true;
    cache.lock().insert(intro);
    cache.lock().insert(Scene::new("s2", "ws1", "Chorus"));

    let sink = cache.clone();
    y.on_change(move |change| {
        let _ = sink.lock().apply(change);
    });

    assert_ok!(x.broadcast_activate("s2", Some(2)).await);
    settle().await;

    let cache = cache.lock();
    assert!(!cache.get("s1").map(|s| s.is_active).unwrap_or(true));
    assert!(cache.get("s2").map(|s| s.is_active).unwrap_or(false));
}
