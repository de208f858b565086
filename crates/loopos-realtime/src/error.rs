use std::fmt;

use crate::sync::PayloadError;

/// 实时同步核心错误
///
/// 注意：过期事件、重复事件、自身回声、乱序到达都不是错误，
/// 它们在准入门（VersionLedger）内被静默丢弃，只计入统计。
#[derive(Debug)]
pub enum RealtimeError {
    Transport(String),      // 传输层错误（发送/订阅失败）
    NotConnected,
    InvalidState(String),   // 状态机错误，例如订阅确认前调用 track
    InvalidInput(String),
    Serialization(String),
    ChannelClosed(String),  // 订阅通道被传输层关闭
    ShuttingDown(String),   // 已 teardown 的实例上继续调用
    Other(String),
}

impl fmt::Display for RealtimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RealtimeError::Transport(e) => write!(f, "Transport error: {}", e),
            RealtimeError::NotConnected => write!(f, "Not connected"),
            RealtimeError::InvalidState(e) => write!(f, "Invalid state: {}", e),
            RealtimeError::InvalidInput(e) => write!(f, "Invalid input: {}", e),
            RealtimeError::Serialization(e) => write!(f, "Serialization error: {}", e),
            RealtimeError::ChannelClosed(e) => write!(f, "Channel closed: {}", e),
            RealtimeError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
            RealtimeError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for RealtimeError {}

impl From<serde_json::Error> for RealtimeError {
    fn from(error: serde_json::Error) -> Self {
        RealtimeError::Serialization(error.to_string())
    }
}

impl From<PayloadError> for RealtimeError {
    fn from(error: PayloadError) -> Self {
        RealtimeError::InvalidInput(error.to_string())
    }
}

impl RealtimeError {
    /// 是否值得由调用方按自己的策略重试
    ///
    /// 核心本身不做重连与退避，只把可重试的失败交还给调用方。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RealtimeError::Transport(_) | RealtimeError::NotConnected | RealtimeError::ChannelClosed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
