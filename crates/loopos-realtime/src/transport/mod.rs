//! 传输层抽象
//!
//! 核心只依赖三个小接口，任何满足它们的传输（WebSocket 中继、MQTT、自研网关）都可以接入：
//! - `PubSub`：发布/订阅，至少一次、无序投递（临时广播通道）
//! - `PresenceChannel`：track / sync / join / leave 的在线状态原语
//! - `ChangeFeed`：按行有序的 insert / update / delete 持久化变更流
//!
//! 订阅统一返回 `mpsc::UnboundedReceiver`：接收端被 drop 即等价于取消订阅，
//! 发送端被传输层关闭（`recv()` 返回 `None`）即视为断开。

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

pub mod memory;

pub use memory::MemoryHub;

/// 临时广播消息（事件名 + JSON 载荷）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub event: String,
    pub payload: Value,
}

impl BroadcastMessage {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// 行级变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowOp {
    Insert,
    Update,
    Delete,
}

/// 持久化变更流中的一条行变更
///
/// `row` 为当前完整行（含 version 列）；delete 时为被删除的旧行。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub op: RowOp,
    pub table: String,
    pub row: Value,
}

/// 在线状态原语推送的信号
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceSignal {
    /// 传输层确认订阅成功
    Subscribed,
    /// 成员快照已更新
    Sync,
    /// 有成员加入（载荷可能不完整，只作为"重新读取"的触发）
    Join { key: String, payload: Value },
    /// 有成员离开
    Leave { key: String, payload: Value },
    /// 通道被关闭
    Closed,
}

/// 在线成员快照：presence key -> 该 key 下的所有状态
pub type PresenceState = HashMap<String, Vec<Value>>;

/// 发布/订阅（临时广播通道）
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<BroadcastMessage>>;

    async fn publish(&self, topic: &str, message: BroadcastMessage) -> Result<()>;
}

/// 在线状态通道
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    /// 订阅；订阅被确认后，第一条信号为 `PresenceSignal::Subscribed`
    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<PresenceSignal>>;

    /// 发布（或替换）本地 key 的状态
    async fn track(&self, topic: &str, key: &str, state: Value) -> Result<()>;

    async fn untrack(&self, topic: &str, key: &str) -> Result<()>;

    /// 当前完整成员快照，随时可查询
    fn presence_state(&self, topic: &str) -> PresenceState;
}

/// 持久化变更流
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// 订阅某张表中属于 `workspace_id` 的行变更
    async fn subscribe(
        &self,
        table: &str,
        workspace_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<RowChange>>;
}
