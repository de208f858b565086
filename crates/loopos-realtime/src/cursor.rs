//! 光标广播模块
//!
//! 功能包括：
//! - 本地指针移动按固定速率节流（默认每个用户 50ms 最多一次）
//! - 远端光标按 userId upsert，较旧的时间戳被忽略
//! - 每次刷新都会重新布置过期计时器；到期时若没有更新的刷新则移除（处理静默断线）
//! - 显式 `cursor_leave` 立即移除，不等计时器
//!
//! 光标只有"最新"有意义，所以用固定速率节流而不是尾沿合并。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RealtimeConfig;
use crate::connection_state::{ConnectionStateManager, ConnectionStatus};
use crate::error::{RealtimeError, Result};
use crate::transport::{BroadcastMessage, PubSub};

pub const CURSOR_MOVE: &str = "cursor_move";
pub const CURSOR_LEAVE: &str = "cursor_leave";

/// 光标位置（`timestamp` 为毫秒级 Unix 时间戳）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub user_id: String,
    pub display_name: String,
    pub colour: String,
    pub x: f64,
    pub y: f64,
    pub timestamp: i64,
}

/// 光标统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorStats {
    pub sent: u64,
    pub throttled: u64,
    pub received: u64,
    /// 时间戳比已有记录更旧
    pub stale: u64,
    /// 计时器到期移除
    pub expired: u64,
    /// 显式 leave 移除
    pub left: u64,
}

/// 固定速率节流器
#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// 距离上一次放行不足间隔时返回 false
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last {
            if now.duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.last = Some(now);
        true
    }
}

struct CursorEntry {
    position: CursorPosition,
    /// 每次刷新递增，过期计时器只移除自己布置时的那一代
    generation: u64,
}

struct CursorInner {
    topic: String,
    user_id: String,
    display_name: String,
    colour: String,
    ttl: Duration,
    pubsub: Arc<dyn PubSub>,
    throttle: Mutex<Throttle>,
    cursors: Mutex<HashMap<String, CursorEntry>>,
    next_generation: AtomicU64,
    connection: ConnectionStateManager,
    cancel: CancellationToken,
    left: AtomicBool,
    stats: Mutex<CursorStats>,
}

/// 光标广播器
pub struct CursorBroadcaster {
    inner: Arc<CursorInner>,
}

impl CursorBroadcaster {
    /// 订阅 `cursors:{workspace}` 主题
    pub async fn join(config: &RealtimeConfig, pubsub: Arc<dyn PubSub>) -> Result<Self> {
        let topic = format!("cursors:{}", config.workspace_id);
        let inner = Arc::new(CursorInner {
            topic: topic.clone(),
            user_id: config.actor_id.clone(),
            display_name: config.display_name.clone(),
            colour: config.colour.clone(),
            ttl: config.cursor_ttl,
            pubsub,
            throttle: Mutex::new(Throttle::new(config.cursor_throttle)),
            cursors: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            connection: ConnectionStateManager::new(topic.clone()),
            cancel: CancellationToken::new(),
            left: AtomicBool::new(false),
            stats: Mutex::new(CursorStats::default()),
        });

        inner.connection.set(ConnectionStatus::Subscribing);
        let rx = match inner.pubsub.subscribe(&topic).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("⚠️ cursor subscribe failed on {}: {}", topic, e);
                inner.connection.set(ConnectionStatus::Disconnected);
                return Err(e);
            }
        };
        inner.connection.set(ConnectionStatus::Connected);
        spawn_reader(inner.clone(), rx);
        info!("✅ cursors subscribed: {}", topic);

        Ok(Self { inner })
    }

    /// 本地指针移动；被节流时返回 Ok(false)
    pub async fn move_cursor(&self, x: f64, y: f64) -> Result<bool> {
        if self.inner.left.load(Ordering::SeqCst) {
            return Err(RealtimeError::ShuttingDown(self.inner.topic.clone()));
        }
        if !self.inner.throttle.lock().try_acquire() {
            self.inner.stats.lock().throttled += 1;
            return Ok(false);
        }

        let position = CursorPosition {
            user_id: self.inner.user_id.clone(),
            display_name: self.inner.display_name.clone(),
            colour: self.inner.colour.clone(),
            x,
            y,
            timestamp: Utc::now().timestamp_millis(),
        };
        let message = BroadcastMessage::new(CURSOR_MOVE, serde_json::to_value(&position)?);
        if let Err(e) = self.inner.pubsub.publish(&self.inner.topic, message).await {
            warn!("⚠️ cursor send failed on {}: {}", self.inner.topic, e);
            return Err(e);
        }
        self.inner.stats.lock().sent += 1;
        Ok(true)
    }

    /// 广播离开并停止接收；可重复调用
    pub async fn leave(&self) {
        if self.inner.left.swap(true, Ordering::SeqCst) {
            return;
        }
        let message = BroadcastMessage::new(CURSOR_LEAVE, json!({ "userId": self.inner.user_id }));
        if let Err(e) = self.inner.pubsub.publish(&self.inner.topic, message).await {
            debug!("cursor leave not delivered on {}: {}", self.inner.topic, e);
        }
        self.inner.cancel.cancel();
        self.inner.cursors.lock().clear();
        self.inner.connection.set(ConnectionStatus::Disconnected);
        info!("cursors left: {}", self.inner.topic);
    }

    /// 远端光标快照，按 userId 排序
    pub fn cursors(&self) -> Vec<CursorPosition> {
        let mut cursors: Vec<CursorPosition> = self
            .inner
            .cursors
            .lock()
            .values()
            .map(|entry| entry.position.clone())
            .collect();
        cursors.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        cursors
    }

    pub fn get(&self, user_id: &str) -> Option<CursorPosition> {
        self.inner.cursors.lock().get(user_id).map(|entry| entry.position.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.cursors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.cursors.lock().is_empty()
    }

    pub fn stats(&self) -> CursorStats {
        self.inner.stats.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.connection.subscribe()
    }
}

/// 未调用 `leave()` 就被 drop 时，在当前运行时上尽力广播 `cursor_leave`
impl Drop for CursorBroadcaster {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        if self.inner.left.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("cursors {} dropped outside a runtime, skipping leave", self.inner.topic);
            return;
        };
        let pubsub = self.inner.pubsub.clone();
        let topic = self.inner.topic.clone();
        let message = BroadcastMessage::new(CURSOR_LEAVE, json!({ "userId": self.inner.user_id }));
        handle.spawn(async move {
            if let Err(e) = pubsub.publish(&topic, message).await {
                debug!("cursor leave on drop not delivered on {}: {}", topic, e);
            }
        });
    }
}

impl CursorInner {
    fn handle_message(self: &Arc<Self>, message: &BroadcastMessage) {
        match message.event.as_str() {
            CURSOR_MOVE => match serde_json::from_value::<CursorPosition>(message.payload.clone()) {
                Ok(position) => self.upsert(position),
                Err(e) => debug!("{} ignoring malformed cursor: {}", self.topic, e),
            },
            CURSOR_LEAVE => {
                let Some(user_id) = message.payload.get("userId").and_then(Value::as_str) else {
                    return;
                };
                if self.cursors.lock().remove(user_id).is_some() {
                    self.stats.lock().left += 1;
                    debug!("{} cursor left: {}", self.topic, user_id);
                }
            }
            other => debug!("{} ignoring event {}", self.topic, other),
        }
    }

    fn upsert(self: &Arc<Self>, position: CursorPosition) {
        if position.user_id == self.user_id {
            return;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let user_id = position.user_id.clone();
        let accepted = {
            let mut cursors = self.cursors.lock();
            match cursors.get(&user_id) {
                Some(existing) if existing.position.timestamp > position.timestamp => false,
                _ => {
                    cursors.insert(user_id.clone(), CursorEntry { position, generation });
                    true
                }
            }
        };

        let mut stats = self.stats.lock();
        if !accepted {
            stats.stale += 1;
            return;
        }
        stats.received += 1;
        drop(stats);
        self.arm_eviction(user_id, generation);
    }

    fn arm_eviction(self: &Arc<Self>, user_id: String, generation: u64) {
        let weak: Weak<CursorInner> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(ttl) => {}
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let expired = {
                let mut cursors = inner.cursors.lock();
                match cursors.get(&user_id) {
                    Some(entry) if entry.generation == generation => {
                        cursors.remove(&user_id);
                        true
                    }
                    _ => false,
                }
            };
            if expired {
                inner.stats.lock().expired += 1;
                debug!("{} cursor expired: {}", inner.topic, user_id);
            }
        });
    }
}

fn spawn_reader(inner: Arc<CursorInner>, mut rx: mpsc::UnboundedReceiver<BroadcastMessage>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => inner.handle_message(&message),
                    None => {
                        warn!("⚠️ cursor channel {} closed by transport", inner.topic);
                        inner.connection.set(ConnectionStatus::Disconnected);
                        break;
                    }
                },
            }
        }
        debug!("cursor reader exited: {}", inner.topic);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryHub;
    use tokio::time::sleep;

    fn config(actor: &str) -> RealtimeConfig {
        RealtimeConfig::builder()
            .workspace_id("ws1")
            .actor_id(actor)
            .build()
            .unwrap()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn remote_move(user: &str, x: f64, timestamp: i64) -> BroadcastMessage {
        let position = CursorPosition {
            user_id: user.to_string(),
            display_name: user.to_string(),
            colour: "#10B981".to_string(),
            x,
            y: 0.0,
            timestamp,
        };
        BroadcastMessage::new(CURSOR_MOVE, serde_json::to_value(position).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_pointer_moves_are_throttled() {
        let hub = MemoryHub::new();
        let a = CursorBroadcaster::join(&config("user-a"), hub.clone()).await.unwrap();

        for n in 0..10 {
            a.move_cursor(n as f64, 0.0).await.unwrap();
            sleep(Duration::from_millis(10)).await;
        }

        let stats = a.stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.throttled, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_expires_after_ttl() {
        let hub = MemoryHub::new();
        let a = CursorBroadcaster::join(&config("user-a"), hub.clone()).await.unwrap();

        hub.publish("cursors:ws1", remote_move("user-b", 1.0, 1_000)).await.unwrap();
        settle().await;
        assert!(a.get("user-b").is_some());

        sleep(Duration::from_millis(4999)).await;
        settle().await;
        assert!(a.get("user-b").is_some());

        sleep(Duration::from_millis(2)).await;
        settle().await;
        assert!(a.get("user-b").is_none());
        assert_eq!(a.stats().expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_rearms_expiry() {
        let hub = MemoryHub::new();
        let a = CursorBroadcaster::join(&config("user-a"), hub.clone()).await.unwrap();

        hub.publish("cursors:ws1", remote_move("user-b", 1.0, 1_000)).await.unwrap();
        settle().await;
        sleep(Duration::from_secs(3)).await;
        hub.publish("cursors:ws1", remote_move("user-b", 2.0, 4_000)).await.unwrap();
        settle().await;

        // 第一个计时器在 5s 时到期，但已有更新的刷新
        sleep(Duration::from_millis(2500)).await;
        settle().await;
        assert_eq!(a.get("user-b").map(|c| c.x), Some(2.0));

        sleep(Duration::from_secs(3)).await;
        settle().await;
        assert!(a.is_empty());
    }

    #[tokio::test]
    async fn test_older_timestamp_is_ignored() {
        let hub = MemoryHub::new();
        let a = CursorBroadcaster::join(&config("user-a"), hub.clone()).await.unwrap();

        hub.publish("cursors:ws1", remote_move("user-b", 5.0, 2_000)).await.unwrap();
        hub.publish("cursors:ws1", remote_move("user-b", 1.0, 1_000)).await.unwrap();
        settle().await;

        assert_eq!(a.get("user-b").map(|c| c.x), Some(5.0));
        assert_eq!(a.stats().stale, 1);
    }

    #[tokio::test]
    async fn test_leave_removes_cursor_immediately() {
        let hub = MemoryHub::new();
        let a = CursorBroadcaster::join(&config("user-a"), hub.clone()).await.unwrap();
        let b = CursorBroadcaster::join(&config("user-b"), hub.clone()).await.unwrap();

        b.move_cursor(3.0, 4.0).await.unwrap();
        a.move_cursor(1.0, 1.0).await.unwrap();
        settle().await;
        assert_eq!(a.len(), 1);
        // 自己的光标不进入本地表
        assert!(a.get("user-a").is_none());

        b.leave().await;
        b.leave().await;
        settle().await;

        assert!(a.is_empty());
        assert_eq!(a.stats().left, 1);
        assert!(!b.is_connected());
        assert!(matches!(b.move_cursor(0.0, 0.0).await, Err(RealtimeError::ShuttingDown(_))));
    }

    #[tokio::test]
    async fn test_drop_without_leave_removes_cursor_on_peers() {
        let hub = MemoryHub::new();
        let a = CursorBroadcaster::join(&config("user-a"), hub.clone()).await.unwrap();
        let b = CursorBroadcaster::join(&config("user-b"), hub.clone()).await.unwrap();

        b.move_cursor(3.0, 4.0).await.unwrap();
        settle().await;
        assert_eq!(a.len(), 1);

        drop(b);
        settle().await;

        assert!(a.is_empty());
        assert_eq!(a.stats().left, 1);
    }
}
