//! LoopOS Realtime - 协作工作区的实时实体同步核心
//!
//! 本 crate 让多个客户端对同一个工作区里的实体（流程图节点、设计器场景）
//! 保持最终一致，同时提供在线状态与光标共享：
//! - 📡 临时广播通道：低延迟传播本地修改（可能乱序、重复、丢失）
//! - 🗄️ 持久化变更流：权威状态，用于纠正乐观写入的偏差
//! - 🔢 版本门 + 回声抑制：判定幂等、与到达顺序无关
//! - ⏱️ 防抖合并：拖拽等连续修改每个实体每个窗口最多发送一次
//! - 👥 在线状态：sync / join / leave 一律整体重读
//! - 🖱️ 光标：固定速率节流 + 过期回收
//!
//! 核心不实现重连与退避，也不持久化任何状态；只依赖三个传输接口
//! （`PubSub`、`PresenceChannel`、`ChangeFeed`），`transport::MemoryHub` 为进程内实现。
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use loopos_realtime::{
//!     EntityCache, MemoryHub, Node, PresenceLocation, RealtimeConfig, RealtimeSession, Transports,
//! };
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RealtimeConfig::builder()
//!         .workspace_id("ws1")
//!         .actor_id("user-a")
//!         .build()?;
//!
//!     let hub = MemoryHub::new();
//!     let session = RealtimeSession::connect(config, Transports::memory(&hub), PresenceLocation::Designer).await?;
//!
//!     // 消费端缓存
//!     let cache = Arc::new(Mutex::new(EntityCache::<Node>::new()));
//!     let sink = cache.clone();
//!     session.nodes().on_change(move |change| {
//!         let _ = sink.lock().apply(change);
//!     });
//!
//!     // 本地乐观写入后广播
//!     let node = Node::new("n1", "ws1").at(10.0, 20.0);
//!     cache.lock().insert(node.clone());
//!     session.nodes().broadcast_create(&node).await?;
//!     session.nodes().broadcast_move("n1", 12.0, 24.0, None)?;
//!
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection_state;
pub mod cursor;
pub mod error;
pub mod presence;
pub mod session;
pub mod sync;
pub mod transport;
pub mod version;

pub use config::{RealtimeConfig, RealtimeConfigBuilder};
pub use connection_state::{ConnectionStateManager, ConnectionStatus};
pub use cursor::{CursorBroadcaster, CursorPosition, CursorStats};
pub use error::{RealtimeError, Result};
pub use presence::{
    colour_for_user, is_participant_idle, location_counts, PresenceLocation, PresenceParticipant,
    PresencePhase, PresenceTracker, PresenceUpdate,
};
pub use session::{RealtimeSession, Transports};
pub use sync::{
    should_apply, Admission, ChangeEvent, ChangeKind, ChangeSource, DebounceCoalescer, EntityCache,
    EntityChange, EntityKind, EntitySync, EntitySyncStats, Node, NodeSync, PayloadError, Scene,
    SceneSync, SyncEntity, VersionLedger,
};
pub use transport::{
    BroadcastMessage, ChangeFeed, MemoryHub, PresenceChannel, PresenceSignal, PresenceState, PubSub,
    RowChange, RowOp,
};
pub use version::{BUILD_TIME, PROTOCOL_NAME, SDK_VERSION};
