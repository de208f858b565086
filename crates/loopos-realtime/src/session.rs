//! 实时会话 - 一个工作区的全部实时组件
//!
//! 把节点同步、场景同步、在线状态、光标四个实例绑在一起，
//! 统一建立、统一关闭。每个 (工作区, 实体种类) 只有一个广播订阅和一个变更流订阅。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::config::RealtimeConfig;
use crate::cursor::CursorBroadcaster;
use crate::error::Result;
use crate::presence::{PresenceLocation, PresenceTracker};
use crate::sync::{NodeSync, SceneSync};
use crate::transport::{ChangeFeed, MemoryHub, PresenceChannel, PubSub};
use crate::version::{PROTOCOL_NAME, SDK_VERSION};

/// 会话使用的三个传输接口
#[derive(Clone)]
pub struct Transports {
    pub pubsub: Arc<dyn PubSub>,
    pub presence: Arc<dyn PresenceChannel>,
    pub feed: Arc<dyn ChangeFeed>,
}

impl Transports {
    pub fn new(
        pubsub: Arc<dyn PubSub>,
        presence: Arc<dyn PresenceChannel>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Self {
        Self { pubsub, presence, feed }
    }

    /// 三个接口都由同一个进程内 hub 提供
    pub fn memory(hub: &Arc<MemoryHub>) -> Self {
        Self {
            pubsub: hub.clone(),
            presence: hub.clone(),
            feed: hub.clone(),
        }
    }
}

/// 实时会话
///
/// 应当显式调用 `shutdown()`。直接 drop 时各组件只在当前 tokio 运行时上尽力
/// 撤销在线状态并广播 `cursor_leave`，没有运行时则只停止接收。
pub struct RealtimeSession {
    config: RealtimeConfig,
    nodes: NodeSync,
    scenes: SceneSync,
    presence: PresenceTracker,
    cursors: CursorBroadcaster,
    closed: AtomicBool,
}

impl RealtimeSession {
    /// 建立会话：打开全部订阅，在线状态在确认后自动推送
    pub async fn connect(
        config: RealtimeConfig,
        transports: Transports,
        location: PresenceLocation,
    ) -> Result<Self> {
        info!(
            "🚀 realtime session connecting: workspace={}, actor={}, protocol={}, sdk={}",
            config.workspace_id, config.actor_id, PROTOCOL_NAME, SDK_VERSION
        );

        let nodes = NodeSync::subscribe(&config, transports.pubsub.clone(), transports.feed.clone()).await?;
        let scenes = SceneSync::subscribe(&config, transports.pubsub.clone(), transports.feed.clone()).await?;
        let presence = PresenceTracker::join(&config, transports.presence.clone(), location).await?;
        let cursors = CursorBroadcaster::join(&config, transports.pubsub.clone()).await?;

        info!("✅ realtime session ready: workspace={}", config.workspace_id);
        Ok(Self {
            config,
            nodes,
            scenes,
            presence,
            cursors,
            closed: AtomicBool::new(false),
        })
    }

    pub fn nodes(&self) -> &NodeSync {
        &self.nodes
    }

    pub fn scenes(&self) -> &SceneSync {
        &self.scenes
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn cursors(&self) -> &CursorBroadcaster {
        &self.cursors
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    /// 所有组件都处于连接状态
    pub fn is_connected(&self) -> bool {
        !self.is_closed()
            && self.nodes.is_connected()
            && self.scenes.is_connected()
            && self.presence.is_connected()
            && self.cursors.is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 关闭全部组件；可重复调用
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.nodes.teardown();
        self.scenes.teardown();
        self.presence.leave().await;
        self.cursors.leave().await;
        info!("realtime session closed: workspace={}", self.config.workspace_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RealtimeError;

    fn config(actor: &str) -> RealtimeConfig {
        RealtimeConfig::builder()
            .workspace_id("ws1")
            .actor_id(actor)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_and_shutdown() {
        let hub = MemoryHub::new();
        let session = RealtimeSession::connect(config("user-a"), Transports::memory(&hub), PresenceLocation::Dashboard)
            .await
            .unwrap();
        session.presence().wait_until_tracking().await.unwrap();

        assert!(session.is_connected());
        assert_eq!(session.nodes().topic(), "nodes:ws1");
        assert_eq!(session.scenes().topic(), "scenes:ws1");

        session.shutdown().await;
        session.shutdown().await;

        assert!(session.is_closed());
        assert!(!session.is_connected());
        assert!(hub.presence_state("presence:ws1").is_empty());
        assert!(matches!(
            session.nodes().broadcast_delete("n1").await,
            Err(RealtimeError::ShuttingDown(_))
        ));
    }
}
