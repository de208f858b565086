//! 实时同步配置
//!
//! 所有时间参数都有参考默认值：
//!
//! | 参数 | 默认值 | 说明 |
//! |------|--------|------|
//! | debounce_window | 120ms | 拖拽等连续修改的合并窗口（每个实体 key） |
//! | cursor_throttle | 50ms | 光标广播最小间隔（每个用户） |
//! | cursor_ttl | 5s | 远端光标无刷新后的过期时间 |
//! | idle_threshold | 5min | 在线成员多久无活动视为空闲 |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RealtimeError, Result};
use crate::presence::colour_for_user;

/// 实时同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// 工作区 ID（所有频道都以它为作用域）
    pub workspace_id: String,
    /// 本地 actor ID（回声抑制的依据）
    pub actor_id: String,
    /// 展示名称（在线状态、光标）
    pub display_name: String,
    /// 用户颜色（在线状态、光标）
    pub colour: String,
    /// 防抖合并窗口
    pub debounce_window: Duration,
    /// 光标广播节流间隔
    pub cursor_throttle: Duration,
    /// 远端光标过期时间
    pub cursor_ttl: Duration,
    /// 空闲判定阈值
    pub idle_threshold: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            workspace_id: String::new(),
            actor_id: String::new(),
            display_name: String::new(),
            colour: String::new(),
            debounce_window: Duration::from_millis(120),
            cursor_throttle: Duration::from_millis(50),
            cursor_ttl: Duration::from_secs(5),
            idle_threshold: Duration::from_secs(5 * 60),
        }
    }
}

impl RealtimeConfig {
    pub fn builder() -> RealtimeConfigBuilder {
        RealtimeConfigBuilder::new()
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct RealtimeConfigBuilder {
    config: RealtimeConfig,
}

impl RealtimeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RealtimeConfig::default(),
        }
    }

    pub fn workspace_id<S: Into<String>>(mut self, workspace_id: S) -> Self {
        self.config.workspace_id = workspace_id.into();
        self
    }

    pub fn actor_id<S: Into<String>>(mut self, actor_id: S) -> Self {
        self.config.actor_id = actor_id.into();
        self
    }

    pub fn display_name<S: Into<String>>(mut self, display_name: S) -> Self {
        self.config.display_name = display_name.into();
        self
    }

    /// 不设置时按 actor_id 从调色板中确定性选取
    pub fn colour<S: Into<String>>(mut self, colour: S) -> Self {
        self.config.colour = colour.into();
        self
    }

    pub fn debounce_window(mut self, window: Duration) -> Self {
        self.config.debounce_window = window;
        self
    }

    pub fn cursor_throttle(mut self, throttle: Duration) -> Self {
        self.config.cursor_throttle = throttle;
        self
    }

    pub fn cursor_ttl(mut self, ttl: Duration) -> Self {
        self.config.cursor_ttl = ttl;
        self
    }

    pub fn idle_threshold(mut self, threshold: Duration) -> Self {
        self.config.idle_threshold = threshold;
        self
    }

    pub fn build(self) -> Result<RealtimeConfig> {
        let mut config = self.config;
        if config.workspace_id.trim().is_empty() {
            return Err(RealtimeError::InvalidInput("workspace_id is required".to_string()));
        }
        if config.actor_id.trim().is_empty() {
            return Err(RealtimeError::InvalidInput("actor_id is required".to_string()));
        }
        if config.display_name.is_empty() {
            config.display_name = config.actor_id.clone();
        }
        if config.colour.is_empty() {
            config.colour = colour_for_user(&config.actor_id).to_string();
        }
        Ok(config)
    }
}
