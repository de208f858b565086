//! 在线状态模块
//!
//! 功能包括：
//! - 订阅工作区的在线状态主题 `presence:{workspace}`
//! - 订阅被传输层确认后再推送本地状态（track）
//! - sync / join / leave 一律从传输层重新读取完整成员快照，不按事件载荷增量修补
//! - 参与者排序、空闲判断、按位置统计
//!
//! 在线状态没有持久化的权威来源，不经过版本门：传输层上最后一次写入生效。

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RealtimeConfig;
use crate::error::{RealtimeError, Result};
use crate::transport::{PresenceChannel, PresenceSignal};

/// 参与者所在的功能区
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceLocation {
    Dashboard,
    Timeline,
    Designer,
    Coach,
    Journal,
    Packs,
    Playbook,
    Export,
}

impl PresenceLocation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dashboard => "dashboard",
            Self::Timeline => "timeline",
            Self::Designer => "designer",
            Self::Coach => "coach",
            Self::Journal => "journal",
            Self::Packs => "packs",
            Self::Playbook => "playbook",
            Self::Export => "export",
        }
    }
}

impl FromStr for PresenceLocation {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dashboard" => Ok(Self::Dashboard),
            "timeline" => Ok(Self::Timeline),
            "designer" => Ok(Self::Designer),
            "coach" => Ok(Self::Coach),
            "journal" => Ok(Self::Journal),
            "packs" => Ok(Self::Packs),
            "playbook" => Ok(Self::Playbook),
            "export" => Ok(Self::Export),
            other => Err(RealtimeError::InvalidInput(format!("unknown location: {}", other))),
        }
    }
}

impl fmt::Display for PresenceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 在线参与者（不带版本，sync 时整体替换）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceParticipant {
    pub user_id: String,
    pub display_name: String,
    pub colour: String,
    pub location: PresenceLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_scene_id: Option<String>,
    pub last_active_at: DateTime<Utc>,
}

/// 本地状态的部分更新
///
/// 焦点字段使用 `Option<Option<_>>`：外层 None 表示不修改，`Some(None)` 表示清除。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceUpdate {
    pub display_name: Option<String>,
    pub colour: Option<String>,
    pub location: Option<PresenceLocation>,
    pub focus_node_id: Option<Option<String>>,
    pub focus_scene_id: Option<Option<String>>,
}

impl PresenceUpdate {
    pub fn location(mut self, location: PresenceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn focus_node(mut self, node_id: Option<&str>) -> Self {
        self.focus_node_id = Some(node_id.map(str::to_string));
        self
    }

    pub fn focus_scene(mut self, scene_id: Option<&str>) -> Self {
        self.focus_scene_id = Some(scene_id.map(str::to_string));
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    fn apply_to(self, participant: &mut PresenceParticipant) {
        if let Some(name) = self.display_name {
            participant.display_name = name;
        }
        if let Some(colour) = self.colour {
            participant.colour = colour;
        }
        if let Some(location) = self.location {
            participant.location = location;
        }
        if let Some(focus) = self.focus_node_id {
            participant.focus_node_id = focus;
        }
        if let Some(focus) = self.focus_scene_id {
            participant.focus_scene_id = focus;
        }
    }
}

/// 在线状态阶段：disconnected -> subscribing -> tracking -> disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresencePhase {
    Disconnected,
    Subscribing,
    Tracking,
}

struct PresenceInner {
    topic: String,
    user_id: String,
    idle_threshold: Duration,
    channel: Arc<dyn PresenceChannel>,
    local: Mutex<PresenceParticipant>,
    participants: RwLock<Vec<PresenceParticipant>>,
    phase: watch::Sender<PresencePhase>,
    cancel: CancellationToken,
    left: AtomicBool,
}

/// 在线状态跟踪器
pub struct PresenceTracker {
    inner: Arc<PresenceInner>,
}

impl PresenceTracker {
    /// 订阅工作区在线状态；本地状态在订阅被确认后才会推送
    pub async fn join(
        config: &RealtimeConfig,
        channel: Arc<dyn PresenceChannel>,
        location: PresenceLocation,
    ) -> Result<Self> {
        let topic = format!("presence:{}", config.workspace_id);
        let local = PresenceParticipant {
            user_id: config.actor_id.clone(),
            display_name: config.display_name.clone(),
            colour: config.colour.clone(),
            location,
            focus_node_id: None,
            focus_scene_id: None,
            last_active_at: Utc::now(),
        };
        let (phase, _) = watch::channel(PresencePhase::Disconnected);
        let inner = Arc::new(PresenceInner {
            topic: topic.clone(),
            user_id: config.actor_id.clone(),
            idle_threshold: config.idle_threshold,
            channel,
            local: Mutex::new(local),
            participants: RwLock::new(Vec::new()),
            phase,
            cancel: CancellationToken::new(),
            left: AtomicBool::new(false),
        });

        inner.set_phase(PresencePhase::Subscribing);
        let rx = match inner.channel.subscribe(&topic).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("⚠️ presence subscribe failed on {}: {}", topic, e);
                inner.set_phase(PresencePhase::Disconnected);
                return Err(e);
            }
        };
        spawn_signal_reader(inner.clone(), rx);

        Ok(Self { inner })
    }

    /// 推送本地状态；只能在 tracking 阶段调用
    pub async fn track(&self) -> Result<()> {
        if self.phase() != PresencePhase::Tracking {
            return Err(RealtimeError::InvalidState(format!(
                "presence track before subscription confirmed on {}",
                self.inner.topic
            )));
        }
        self.inner.push_local().await
    }

    /// 合并到本地状态并重新发布
    ///
    /// 尚未进入 tracking 时只更新本地，进入 tracking 时一起推送。
    pub async fn update_presence(&self, update: PresenceUpdate) -> Result<()> {
        if self.inner.left.load(Ordering::SeqCst) {
            return Err(RealtimeError::ShuttingDown(self.inner.topic.clone()));
        }
        {
            let mut local = self.inner.local.lock();
            update.apply_to(&mut local);
            local.last_active_at = Utc::now();
        }
        if self.phase() == PresencePhase::Tracking {
            self.inner.push_local().await?;
        }
        Ok(())
    }

    /// 等待进入 tracking；通道在确认前断开时返回 NotConnected
    pub async fn wait_until_tracking(&self) -> Result<()> {
        let mut rx = self.inner.phase.subscribe();
        let phase = *rx
            .wait_for(|phase| *phase != PresencePhase::Subscribing)
            .await
            .map_err(|_| RealtimeError::ChannelClosed(self.inner.topic.clone()))?;
        match phase {
            PresencePhase::Tracking => Ok(()),
            _ => Err(RealtimeError::NotConnected),
        }
    }

    /// 离开：撤销本地状态并取消订阅；可重复调用
    pub async fn leave(&self) {
        if self.inner.left.swap(true, Ordering::SeqCst) {
            return;
        }
        let was_tracking = self.phase() == PresencePhase::Tracking;
        self.inner.cancel.cancel();
        if was_tracking {
            if let Err(e) = self.inner.channel.untrack(&self.inner.topic, &self.inner.user_id).await {
                warn!("⚠️ presence untrack failed on {}: {}", self.inner.topic, e);
            }
        }
        self.inner.participants.write().clear();
        self.inner.set_phase(PresencePhase::Disconnected);
        info!("presence left: {}", self.inner.topic);
    }

    /// 可见参与者（不含本地用户），活跃者在前，其次按最近活跃时间
    pub fn participants(&self) -> Vec<PresenceParticipant> {
        self.inner.participants.read().clone()
    }

    pub fn participant_count(&self) -> usize {
        self.inner.participants.read().len()
    }

    pub fn location_counts(&self) -> BTreeMap<PresenceLocation, usize> {
        location_counts(&self.inner.participants.read())
    }

    /// 本地用户当前发布的状态
    pub fn local_state(&self) -> PresenceParticipant {
        self.inner.local.lock().clone()
    }

    pub fn is_idle(&self, participant: &PresenceParticipant) -> bool {
        is_participant_idle(participant, Utc::now(), self.inner.idle_threshold)
    }

    pub fn phase(&self) -> PresencePhase {
        *self.inner.phase.borrow()
    }

    pub fn phase_changes(&self) -> watch::Receiver<PresencePhase> {
        self.inner.phase.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == PresencePhase::Tracking
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }
}

/// 未调用 `leave()` 就被 drop 时，在当前运行时上尽力撤销本地状态
impl Drop for PresenceTracker {
    fn drop(&mut self) {
        let was_tracking = self.phase() == PresencePhase::Tracking;
        self.inner.cancel.cancel();
        if self.inner.left.swap(true, Ordering::SeqCst) || !was_tracking {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("presence {} dropped outside a runtime, skipping untrack", self.inner.topic);
            return;
        };
        let channel = self.inner.channel.clone();
        let topic = self.inner.topic.clone();
        let user_id = self.inner.user_id.clone();
        handle.spawn(async move {
            if let Err(e) = channel.untrack(&topic, &user_id).await {
                debug!("presence untrack on drop failed for {}: {}", topic, e);
            }
        });
    }
}

impl PresenceInner {
    fn set_phase(&self, next: PresencePhase) {
        let changed = self.phase.send_if_modified(|phase| {
            if *phase == next {
                return false;
            }
            *phase = next;
            true
        });
        if changed {
            info!("presence {} -> {:?}", self.topic, next);
        }
    }

    fn phase(&self) -> PresencePhase {
        *self.phase.borrow()
    }

    async fn push_local(&self) -> Result<()> {
        let state = serde_json::to_value(&*self.local.lock())?;
        self.channel.track(&self.topic, &self.user_id, state).await
    }

    /// 从传输层重新读取完整成员快照
    fn refresh(&self) {
        let snapshot = self.channel.presence_state(&self.topic);
        let mut by_user: HashMap<String, PresenceParticipant> = HashMap::new();

        for (key, metas) in snapshot {
            for meta in metas {
                let participant: PresenceParticipant = match serde_json::from_value(meta) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!("presence {} skipping malformed state for {}: {}", self.topic, key, e);
                        continue;
                    }
                };
                if participant.user_id == self.user_id {
                    continue;
                }
                // 同一用户多个连接时保留最近活跃的那一份
                match by_user.get(&participant.user_id) {
                    Some(existing) if existing.last_active_at >= participant.last_active_at => {}
                    _ => {
                        by_user.insert(participant.user_id.clone(), participant);
                    }
                }
            }
        }

        let mut participants: Vec<PresenceParticipant> = by_user.into_values().collect();
        sort_participants(&mut participants, Utc::now(), self.idle_threshold);
        debug!("presence {} refreshed: {} participants", self.topic, participants.len());
        *self.participants.write() = participants;
    }

    async fn handle_signal(&self, signal: PresenceSignal) {
        match signal {
            PresenceSignal::Subscribed => {
                if self.phase() != PresencePhase::Subscribing {
                    return;
                }
                self.set_phase(PresencePhase::Tracking);
                if let Err(e) = self.push_local().await {
                    warn!("⚠️ presence track failed on {}: {}", self.topic, e);
                }
                self.refresh();
            }
            PresenceSignal::Sync | PresenceSignal::Join { .. } | PresenceSignal::Leave { .. } => {
                if self.phase() == PresencePhase::Tracking {
                    self.refresh();
                }
            }
            PresenceSignal::Closed => self.on_closed(),
        }
    }

    fn on_closed(&self) {
        warn!("⚠️ presence channel {} closed by transport", self.topic);
        self.participants.write().clear();
        self.set_phase(PresencePhase::Disconnected);
    }
}

fn spawn_signal_reader(inner: Arc<PresenceInner>, mut rx: mpsc::UnboundedReceiver<PresenceSignal>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                signal = rx.recv() => match signal {
                    Some(PresenceSignal::Closed) | None => {
                        inner.on_closed();
                        break;
                    }
                    Some(signal) => inner.handle_signal(signal).await,
                },
            }
        }
        debug!("presence reader exited: {}", inner.topic);
    });
}

/// 超过阈值没有活动即视为空闲
pub fn is_participant_idle(participant: &PresenceParticipant, now: DateTime<Utc>, threshold: Duration) -> bool {
    now.signed_duration_since(participant.last_active_at)
        .to_std()
        .map(|elapsed| elapsed > threshold)
        .unwrap_or(false)
}

/// 按位置统计参与者数量
pub fn location_counts(participants: &[PresenceParticipant]) -> BTreeMap<PresenceLocation, usize> {
    let mut counts = BTreeMap::new();
    for participant in participants {
        *counts.entry(participant.location).or_insert(0) += 1;
    }
    counts
}

/// 活跃者在前，其次按最近活跃时间倒序
pub fn sort_participants(participants: &mut [PresenceParticipant], now: DateTime<Utc>, idle_threshold: Duration) {
    participants.sort_by(|a, b| {
        let a_idle = is_participant_idle(a, now, idle_threshold);
        let b_idle = is_participant_idle(b, now, idle_threshold);
        a_idle
            .cmp(&b_idle)
            .then_with(|| b.last_active_at.cmp(&a.last_active_at))
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
}

const PALETTE: [&str; 8] = [
    "#3AA9BE", "#FF6B35", "#8B5CF6", "#10B981", "#F59E0B", "#EC4899", "#0078D7", "#D4A574",
];

/// 由用户 ID 确定性地选择一个颜色
pub fn colour_for_user(user_id: &str) -> &'static str {
    let hash = user_id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    PALETTE[(hash as usize) % PALETTE.len()]
}
