//! 连接状态
//!
//! 每个实时组件（实体同步、在线状态、光标）各持有一个 `ConnectionStateManager`，
//! 对外暴露 `is_connected` 信号。核心不负责重连：传输层重新订阅后，
//! 由新的 sync 快照 / 变更流恢复状态。

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// 未连接
    Disconnected,
    /// 订阅中（等待传输层确认）
    Subscribing,
    /// 已连接
    Connected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "未连接"),
            ConnectionStatus::Subscribing => write!(f, "订阅中"),
            ConnectionStatus::Connected => write!(f, "已连接"),
        }
    }
}

/// 连接状态管理器
#[derive(Debug)]
pub struct ConnectionStateManager {
    /// 组件名（仅用于日志）
    label: String,
    sender: watch::Sender<ConnectionStatus>,
}

impl ConnectionStateManager {
    pub fn new(label: impl Into<String>) -> Self {
        let (sender, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            label: label.into(),
            sender,
        }
    }

    /// 更新状态；状态未变化时不通知订阅者
    pub fn set(&self, status: ConnectionStatus) {
        let changed = self.sender.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            debug!("[{}] connection status -> {}", self.label, status);
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.sender.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_transitions_notify_subscribers() {
        let manager = ConnectionStateManager::new("nodes:ws1");
        let mut rx = manager.subscribe();
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(!manager.is_connected());

        manager.set(ConnectionStatus::Connected);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionStatus::Connected);
        assert!(manager.is_connected());
    }

    #[test]
    fn test_same_status_is_not_a_change() {
        let manager = ConnectionStateManager::new("cursors:ws1");
        let rx = manager.subscribe();
        manager.set(ConnectionStatus::Disconnected);
        assert!(!rx.has_changed().unwrap());
    }
}
