//! 实体同步门面 - 每种实体一个实例
//!
//! 组合准入门、防抖合并器、临时广播通道与持久化变更流：
//! - 构造时打开两个订阅：`{kind}s:{workspace}` 广播主题 + 对应表的变更流
//! - 广播事件经过回声抑制 + 版本门，接受后立即交给消费者（低延迟路径，可能是近似值）
//! - 变更流事件**不做**回声过滤（发起者也要收到，用于纠正乐观写入的偏差），但仍经过版本门
//! - 本地 create / delete 不会回送给本地消费者，但会更新账本，之后的确认事件被识别为已应用
//!
//! ## NOTE: 门面不做重试
//!
//! 发送失败只记录日志并返回错误，重试策略由调用方决定。

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::debounce::DebounceCoalescer;
use super::entity::{ChangeSource, EntityChange, SyncEntity};
use super::event::{ChangeEvent, ChangeKind};
use super::version_gate::{Admission, VersionLedger};
use super::EntityKind;
use crate::config::RealtimeConfig;
use crate::connection_state::{ConnectionStateManager, ConnectionStatus};
use crate::error::{RealtimeError, Result};
use crate::transport::{BroadcastMessage, ChangeFeed, PubSub, RowChange};

/// 变更监听器
pub type ChangeListener = Arc<dyn Fn(&EntityChange) + Send + Sync>;

/// 同步统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySyncStats {
    /// 被接受并交付的事件
    pub accepted: u64,
    /// 版本过期或重复
    pub stale: u64,
    /// 自身回声
    pub echoes: u64,
    /// 无法解析的载荷
    pub malformed: u64,
    /// 成功发出的广播
    pub sent: u64,
    /// 发送失败的广播
    pub dropped_sends: u64,
}

struct SyncInner {
    kind: EntityKind,
    workspace_id: String,
    actor_id: String,
    topic: String,
    pubsub: Arc<dyn PubSub>,
    ledger: Mutex<VersionLedger>,
    listeners: RwLock<Vec<ChangeListener>>,
    coalescer: DebounceCoalescer,
    connection: ConnectionStateManager,
    cancel: CancellationToken,
    torn_down: AtomicBool,
    stats: Mutex<EntitySyncStats>,
}

/// 实体同步门面
pub struct EntitySync<T: SyncEntity> {
    inner: Arc<SyncInner>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: SyncEntity> EntitySync<T> {
    /// 打开广播订阅与变更流订阅
    pub async fn subscribe(
        config: &RealtimeConfig,
        pubsub: Arc<dyn PubSub>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Result<Self> {
        let kind = T::KIND;
        let topic = kind.topic(&config.workspace_id);
        let inner = Arc::new(SyncInner {
            kind,
            workspace_id: config.workspace_id.clone(),
            actor_id: config.actor_id.clone(),
            topic: topic.clone(),
            pubsub,
            ledger: Mutex::new(VersionLedger::new()),
            listeners: RwLock::new(Vec::new()),
            coalescer: DebounceCoalescer::new(config.debounce_window),
            connection: ConnectionStateManager::new(topic.clone()),
            cancel: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
            stats: Mutex::new(EntitySyncStats::default()),
        });

        inner.connection.set(ConnectionStatus::Subscribing);
        let broadcast_rx = match inner.pubsub.subscribe(&topic).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("⚠️ {} broadcast subscribe failed: {}", topic, e);
                inner.connection.set(ConnectionStatus::Disconnected);
                return Err(e);
            }
        };
        let feed_rx = match feed.subscribe(kind.table(), &config.workspace_id).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("⚠️ {} change feed subscribe failed: {}", kind.table(), e);
                inner.connection.set(ConnectionStatus::Disconnected);
                return Err(e);
            }
        };
        inner.connection.set(ConnectionStatus::Connected);

        spawn_reader(inner.clone(), broadcast_rx, feed_rx);
        info!("✅ {} sync subscribed: topic={}, table={}", kind, topic, kind.table());

        Ok(Self {
            inner,
            _entity: PhantomData,
        })
    }

    /// 注册变更监听器
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(&EntityChange) + Send + Sync + 'static,
    {
        self.inner.listeners.write().push(Arc::new(listener));
    }

    /// 广播新建；本地账本记录其版本
    pub async fn broadcast_create(&self, entity: &T) -> Result<()> {
        self.ensure_active()?;
        self.inner.ledger.lock().record(entity.id(), entity.version());
        let event = self
            .inner
            .event(ChangeKind::Created, entity.id())
            .with_version(Some(entity.version()))
            .with_data(serde_json::to_value(entity)?);
        self.inner.send(event).await
    }

    /// 广播部分字段更新（立即发送）
    pub async fn broadcast_update(&self, id: &str, partial: Value, version: Option<u64>) -> Result<()> {
        self.ensure_active()?;
        if let Some(version) = version {
            self.inner.ledger.lock().record(id, version);
        }
        let event = self
            .inner
            .event(ChangeKind::Updated, id)
            .with_version(version)
            .with_data(partial);
        self.inner.send(event).await
    }

    /// 广播移动（防抖：同一个 id 每个窗口最多发送一次，总是最新坐标）
    pub fn broadcast_move(&self, id: &str, x: f64, y: f64, version: Option<u64>) -> Result<()> {
        self.ensure_active()?;
        self.ensure_supported(ChangeKind::Moved)?;
        if let Some(version) = version {
            self.inner.ledger.lock().record(id, version);
        }
        let event = self
            .inner
            .event(ChangeKind::Moved, id)
            .with_version(version)
            .with_data(json!({ "x": x, "y": y }));

        let weak: Weak<SyncInner> = Arc::downgrade(&self.inner);
        self.inner.coalescer.schedule(id, async move {
            // 通道已经不在了：静默丢弃，下一次本地修改会重新调度
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.cancel.is_cancelled() {
                return;
            }
            let _ = inner.send(event).await;
        });
        Ok(())
    }

    /// 广播删除；本地账本留下墓碑，确认它的变更流事件不会再交付
    pub async fn broadcast_delete(&self, id: &str) -> Result<()> {
        self.ensure_active()?;
        self.inner.ledger.lock().mark_deleted(id);
        let event = self.inner.event(ChangeKind::Deleted, id);
        self.inner.send(event).await
    }

    /// 广播激活（仅场景）
    pub async fn broadcast_activate(&self, id: &str, version: Option<u64>) -> Result<()> {
        self.ensure_active()?;
        self.ensure_supported(ChangeKind::Activated)?;
        if let Some(version) = version {
            self.inner.ledger.lock().record(id, version);
        }
        let event = self.inner.event(ChangeKind::Activated, id).with_version(version);
        self.inner.send(event).await
    }

    /// 取消两个订阅与所有未到期的防抖发送；可重复调用
    pub fn teardown(&self) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.coalescer.cancel_all();
        self.inner.listeners.write().clear();
        self.inner.connection.set(ConnectionStatus::Disconnected);
        info!("{} sync torn down: topic={}", self.inner.kind, self.inner.topic);
    }

    pub fn kind(&self) -> EntityKind {
        self.inner.kind
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// 账本中某个实体的已知版本
    pub fn known_version(&self, id: &str) -> Option<u64> {
        self.inner.ledger.lock().known(id)
    }

    pub fn ledger_len(&self) -> usize {
        self.inner.ledger.lock().len()
    }

    /// 等待发送的 move 数量
    pub fn pending_moves(&self) -> usize {
        self.inner.coalescer.pending_count()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.connection.subscribe()
    }

    pub fn stats(&self) -> EntitySyncStats {
        self.inner.stats.lock().clone()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return Err(RealtimeError::ShuttingDown(self.inner.topic.clone()));
        }
        Ok(())
    }

    fn ensure_supported(&self, change: ChangeKind) -> Result<()> {
        if !self.inner.kind.supports(change) {
            return Err(RealtimeError::InvalidInput(format!(
                "{} does not support {} events",
                self.inner.kind,
                change.as_str()
            )));
        }
        Ok(())
    }
}

impl<T: SyncEntity> Drop for EntitySync<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl SyncInner {
    fn event(&self, kind: ChangeKind, id: &str) -> ChangeEvent {
        ChangeEvent::new(kind, id, self.actor_id.as_str(), self.workspace_id.as_str())
    }

    async fn send(&self, event: ChangeEvent) -> Result<()> {
        let message = event.to_message(self.kind);
        match self.pubsub.publish(&self.topic, message).await {
            Ok(()) => {
                self.stats.lock().sent += 1;
                Ok(())
            }
            Err(e) => {
                warn!("⚠️ {} send {} failed: {}", self.topic, event.entity_id, e);
                self.stats.lock().dropped_sends += 1;
                Err(e)
            }
        }
    }

    fn handle_broadcast(&self, message: &BroadcastMessage) {
        let event = match ChangeEvent::from_message(self.kind, message) {
            Ok(event) => event,
            Err(e) => {
                debug!("{} ignoring broadcast {}: {}", self.topic, message.event, e);
                self.stats.lock().malformed += 1;
                return;
            }
        };
        if event.workspace_id != self.workspace_id {
            debug!("{} ignoring event for workspace {}", self.topic, event.workspace_id);
            return;
        }
        self.admit_and_deliver(event, Some(self.actor_id.as_str()), ChangeSource::Broadcast);
    }

    fn handle_row(&self, change: &RowChange) {
        if change.table != self.kind.table() {
            return;
        }
        let event = match ChangeEvent::from_row_change(change) {
            Ok(event) => event,
            Err(e) => {
                debug!("{} ignoring row change: {}", self.kind.table(), e);
                self.stats.lock().malformed += 1;
                return;
            }
        };
        if !event.workspace_id.is_empty() && event.workspace_id != self.workspace_id {
            return;
        }
        // 变更流不做回声过滤
        self.admit_and_deliver(event, None, ChangeSource::Feed);
    }

    fn admit_and_deliver(&self, event: ChangeEvent, local_actor_id: Option<&str>, source: ChangeSource) {
        let admission = self.ledger.lock().admit(&event, local_actor_id);
        {
            let mut stats = self.stats.lock();
            match admission {
                Admission::Accepted => stats.accepted += 1,
                Admission::Echo => stats.echoes += 1,
                Admission::Stale { .. } | Admission::AlreadyDeleted => stats.stale += 1,
            }
        }
        if !admission.is_accepted() {
            return;
        }

        let change = EntityChange {
            id: event.entity_id,
            kind: event.kind,
            version: event.version,
            data: event.data.unwrap_or(Value::Null),
            source,
        };
        // 先复制监听器列表，回调里可以安全地再调用门面
        let listeners = self.listeners.read().clone();
        for listener in listeners.iter() {
            listener(&change);
        }
    }
}

/// 单个读取任务串行处理两个订阅，保证交付顺序与处理顺序一致
fn spawn_reader(
    inner: Arc<SyncInner>,
    mut broadcast_rx: mpsc::UnboundedReceiver<BroadcastMessage>,
    mut feed_rx: mpsc::UnboundedReceiver<RowChange>,
) {
    tokio::spawn(async move {
        let mut broadcast_open = true;
        let mut feed_open = true;

        while broadcast_open || feed_open {
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                message = broadcast_rx.recv(), if broadcast_open => match message {
                    Some(message) => inner.handle_broadcast(&message),
                    None => {
                        warn!("⚠️ {} broadcast channel closed by transport", inner.topic);
                        broadcast_open = false;
                        inner.connection.set(ConnectionStatus::Disconnected);
                    }
                },
                change = feed_rx.recv(), if feed_open => match change {
                    Some(change) => inner.handle_row(&change),
                    None => {
                        warn!("⚠️ {} change feed closed by transport", inner.kind.table());
                        feed_open = false;
                        inner.connection.set(ConnectionStatus::Disconnected);
                    }
                },
            }
        }
        debug!("{} reader exited", inner.topic);
    });
}
