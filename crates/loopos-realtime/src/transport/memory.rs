//! 进程内传输实现
//!
//! 同时实现 `PubSub`、`PresenceChannel`、`ChangeFeed`，用于测试以及
//! 单机/离线会话。广播会投递给包括发布者在内的所有订阅者（回声抑制是核心的职责）。
//!
//! 额外提供一些"扮演外部世界"的控制方法：
//! - `commit`：模拟持久化写入完成后变更流推送
//! - `emit_presence`：注入任意在线状态信号（例如残缺的 join）
//! - `close_topic`：模拟传输层断开
//! - `set_offline`：之后的发送 / track 全部失败

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    BroadcastMessage, ChangeFeed, PresenceChannel, PresenceSignal, PresenceState, PubSub, RowChange,
    RowOp,
};
use crate::error::{RealtimeError, Result};

struct FeedSubscriber {
    table: String,
    workspace_id: String,
    tx: mpsc::UnboundedSender<RowChange>,
}

#[derive(Default)]
struct HubInner {
    topics: HashMap<String, Vec<mpsc::UnboundedSender<BroadcastMessage>>>,
    presence_subscribers: HashMap<String, Vec<mpsc::UnboundedSender<PresenceSignal>>>,
    presence: HashMap<String, PresenceState>,
    feeds: Vec<FeedSubscriber>,
}

/// 进程内传输中心
pub struct MemoryHub {
    inner: Mutex<HubInner>,
    /// 订阅后是否立即确认在线状态订阅
    presence_auto_ack: AtomicBool,
    offline: AtomicBool,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
            presence_auto_ack: AtomicBool::new(true),
            offline: AtomicBool::new(false),
        }
    }
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 关闭自动确认后，需要调用 `confirm_presence` 才会推送 `Subscribed`
    pub fn set_presence_auto_ack(&self, enabled: bool) {
        self.presence_auto_ack.store(enabled, Ordering::SeqCst);
    }

    /// 确认某个在线状态主题上的全部订阅
    pub fn confirm_presence(&self, topic: &str) {
        self.emit_presence(topic, PresenceSignal::Subscribed);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// 模拟持久化写入完成：把行变更推送给匹配表与工作区的订阅者
    pub fn commit(&self, op: RowOp, table: &str, row: Value) {
        let workspace_id = row
            .get("workspace_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let change = RowChange {
            op,
            table: table.to_string(),
            row,
        };

        let mut inner = self.inner.lock();
        inner.feeds.retain(|sub| {
            if sub.table != table || sub.workspace_id != workspace_id {
                return !sub.tx.is_closed();
            }
            sub.tx.send(change.clone()).is_ok()
        });
        debug!("[memory] commit {:?} on {} (workspace {})", op, table, workspace_id);
    }

    /// 向某个在线状态主题的所有订阅者推送信号
    pub fn emit_presence(&self, topic: &str, signal: PresenceSignal) {
        let mut inner = self.inner.lock();
        if let Some(subscribers) = inner.presence_subscribers.get_mut(topic) {
            subscribers.retain(|tx| tx.send(signal.clone()).is_ok());
        }
    }

    /// 关闭主题：广播与在线状态订阅者都会收到通道结束
    pub fn close_topic(&self, topic: &str) {
        let mut inner = self.inner.lock();
        inner.topics.remove(topic);
        if let Some(subscribers) = inner.presence_subscribers.remove(topic) {
            for tx in subscribers {
                let _ = tx.send(PresenceSignal::Closed);
            }
        }
        inner.presence.remove(topic);
        debug!("[memory] closed topic {}", topic);
    }

    /// 当前仍存活的广播订阅者数量
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let inner = self.inner.lock();
        inner
            .topics
            .get(topic)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RealtimeError::Transport("memory hub is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PubSub for MemoryHub {
    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<BroadcastMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn publish(&self, topic: &str, message: BroadcastMessage) -> Result<()> {
        self.ensure_online()?;
        let mut inner = self.inner.lock();
        if let Some(subscribers) = inner.topics.get_mut(topic) {
            subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        }
        Ok(())
    }
}

#[async_trait]
impl PresenceChannel for MemoryHub {
    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<PresenceSignal>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.presence_auto_ack.load(Ordering::SeqCst) {
            let _ = tx.send(PresenceSignal::Subscribed);
        }
        self.inner
            .lock()
            .presence_subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn track(&self, topic: &str, key: &str, state: Value) -> Result<()> {
        self.ensure_online()?;
        {
            let mut inner = self.inner.lock();
            inner
                .presence
                .entry(topic.to_string())
                .or_default()
                .insert(key.to_string(), vec![state.clone()]);
        }
        self.emit_presence(
            topic,
            PresenceSignal::Join {
                key: key.to_string(),
                payload: state,
            },
        );
        self.emit_presence(topic, PresenceSignal::Sync);
        Ok(())
    }

    async fn untrack(&self, topic: &str, key: &str) -> Result<()> {
        let removed = {
            let mut inner = self.inner.lock();
            inner
                .presence
                .get_mut(topic)
                .and_then(|state| state.remove(key))
        };
        if let Some(metas) = removed {
            self.emit_presence(
                topic,
                PresenceSignal::Leave {
                    key: key.to_string(),
                    payload: Value::Array(metas),
                },
            );
            self.emit_presence(topic, PresenceSignal::Sync);
        }
        Ok(())
    }

    fn presence_state(&self, topic: &str) -> PresenceState {
        self.inner
            .lock()
            .presence
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChangeFeed for MemoryHub {
    async fn subscribe(
        &self,
        table: &str,
        workspace_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<RowChange>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().feeds.push(FeedSubscriber {
            table: table.to_string(),
            workspace_id: workspace_id.to_string(),
            tx,
        });
        Ok(rx)
    }
}
