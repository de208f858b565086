//! 两个客户端协作演示
//!
//! 在同一个进程内用 MemoryHub 模拟传输层：X 拖动节点，Y 立即看到，
//! 持久化写入完成后双方收敛到同一个版本。

use std::sync::Arc;
use std::time::Duration;

use loopos_realtime::{
    EntityCache, MemoryHub, Node, PresenceLocation, RealtimeConfig, RealtimeSession, RowOp, Transports,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::sleep;

async fn connect(hub: &Arc<MemoryHub>, actor: &str) -> Result<(RealtimeSession, Arc<Mutex<EntityCache<Node>>>), Box<dyn std::error::Error>> {
    let config = RealtimeConfig::builder()
        .workspace_id("demo-workspace")
        .actor_id(actor)
        .build()?;
    let session = RealtimeSession::connect(config, Transports::memory(hub), PresenceLocation::Designer).await?;
    session.presence().wait_until_tracking().await?;

    let cache = Arc::new(Mutex::new(EntityCache::new()));
    cache.lock().insert(Node::new("n1", "demo-workspace"));
    let sink = cache.clone();
    let label = actor.to_string();
    session.nodes().on_change(move |change| {
        println!("  [{}] {:?} {} v{:?} via {:?}", label, change.kind, change.id, change.version, change.source);
        let _ = sink.lock().apply(change);
    });
    Ok((session, cache))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\n🚀 实体同步演示\n");
    println!("====================================\n");

    let hub = MemoryHub::new();
    let (x, x_cache) = connect(&hub, "user-x").await?;
    let (y, y_cache) = connect(&hub, "user-y").await?;

    println!("👥 X 看到的在线成员: {:?}", x.presence().participants().iter().map(|p| &p.user_id).collect::<Vec<_>>());

    println!("\n🖱️ X 拖动 n1 ...");
    for step in 1..=10 {
        let (px, py) = (step as f64 * 10.0, step as f64 * 5.0);
        if let Some(node) = x_cache.lock().get_mut("n1") {
            node.x = px;
            node.y = py;
        }
        x.nodes().broadcast_move("n1", px, py, None)?;
        x.cursors().move_cursor(px, py).await?;
        sleep(Duration::from_millis(16)).await;
    }
    sleep(Duration::from_millis(200)).await;
    println!("📊 X 发送统计: {:?}", x.nodes().stats());

    println!("\n🗄️ 持久化写入完成，变更流推送 version=7 ...");
    hub.commit(
        RowOp::Update,
        "loopos_nodes",
        json!({"id": "n1", "workspace_id": "demo-workspace", "version": 7, "x": 100.0, "y": 50.0, "updated_by": "user-x"}),
    );
    sleep(Duration::from_millis(50)).await;

    for (name, cache) in [("X", &x_cache), ("Y", &y_cache)] {
        if let Some(node) = cache.lock().get("n1") {
            println!("  {} 的 n1: ({}, {}) version={}", name, node.x, node.y, node.version);
        }
    }
    println!("🖱️ Y 看到的光标: {:?}", y.cursors().cursors());

    x.shutdown().await;
    y.shutdown().await;
    println!("\n✅ 演示结束");
    Ok(())
}
