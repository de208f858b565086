//! 变更事件与线上格式
//!
//! 广播载荷：`{ <kindId>: string, userId: string, workspaceId: string, version?: number, data?: object }`，
//! 其中 `<kindId>` 为 `nodeId` / `sceneId`。
//! 变更流的行变更也被归一化为同一个 `ChangeEvent`，这样两条路径共用一个准入门。

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::EntityKind;
use crate::transport::{BroadcastMessage, RowChange, RowOp};

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Moved,
    Deleted,
    Activated,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Moved => "moved",
            Self::Deleted => "deleted",
            Self::Activated => "activated",
        }
    }
}

impl FromStr for ChangeKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            "moved" => Ok(Self::Moved),
            "deleted" => Ok(Self::Deleted),
            "activated" => Ok(Self::Activated),
            _ => Err(()),
        }
    }
}

/// 载荷解析错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PayloadError {
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("payload is not an object")]
    NotAnObject,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid version: {0}")]
    InvalidVersion(String),
}

/// 变更事件（线上消息，从不由核心持久化）
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub entity_id: String,
    /// 发起者；变更流事件不做回声过滤，这里仅作记录
    pub actor_id: String,
    pub workspace_id: String,
    /// 没有版本号的事件（部分 move）是"后到者胜"的提示，不是权威状态
    pub version: Option<u64>,
    pub data: Option<Value>,
}

impl ChangeEvent {
    pub fn new(
        kind: ChangeKind,
        entity_id: impl Into<String>,
        actor_id: impl Into<String>,
        workspace_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
            actor_id: actor_id.into(),
            workspace_id: workspace_id.into(),
            version: None,
            data: None,
        }
    }

    pub fn with_version(mut self, version: Option<u64>) -> Self {
        self.version = version;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// 编码为广播消息
    pub fn to_message(&self, entity: EntityKind) -> BroadcastMessage {
        let mut payload = Map::new();
        payload.insert(entity.id_field().to_string(), Value::String(self.entity_id.clone()));
        payload.insert("userId".to_string(), Value::String(self.actor_id.clone()));
        payload.insert("workspaceId".to_string(), Value::String(self.workspace_id.clone()));
        if let Some(version) = self.version {
            payload.insert("version".to_string(), Value::from(version));
        }
        if let Some(data) = &self.data {
            payload.insert("data".to_string(), data.clone());
        }
        BroadcastMessage::new(entity.event_name(self.kind), Value::Object(payload))
    }

    /// 从广播消息解码
    pub fn from_message(entity: EntityKind, message: &BroadcastMessage) -> Result<Self, PayloadError> {
        let kind = entity
            .parse_event_name(&message.event)
            .ok_or_else(|| PayloadError::UnknownEvent(message.event.clone()))?;
        let payload = message.payload.as_object().ok_or(PayloadError::NotAnObject)?;

        let entity_id = required_str(payload, entity.id_field())?;
        let actor_id = required_str(payload, "userId")?;
        let workspace_id = required_str(payload, "workspaceId")?;
        let version = parse_version(payload.get("version"))?;
        let data = payload.get("data").filter(|v| !v.is_null()).cloned();

        Ok(Self {
            kind,
            entity_id,
            actor_id,
            workspace_id,
            version,
            data,
        })
    }

    /// 把变更流的行变更归一化为变更事件；`data` 为完整行
    pub fn from_row_change(change: &RowChange) -> Result<Self, PayloadError> {
        let row = change.row.as_object().ok_or(PayloadError::NotAnObject)?;
        let kind = match change.op {
            RowOp::Insert => ChangeKind::Created,
            RowOp::Update => ChangeKind::Updated,
            RowOp::Delete => ChangeKind::Deleted,
        };

        let entity_id = required_str(row, "id")?;
        let workspace_id = row
            .get("workspace_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let actor_id = ["updated_by", "user_id"]
            .iter()
            .find_map(|field| row.get(*field).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();
        let version = parse_version(row.get("version"))?;

        Ok(Self {
            kind,
            entity_id,
            actor_id,
            workspace_id,
            version,
            data: Some(change.row.clone()),
        })
    }
}

fn required_str(payload: &Map<String, Value>, field: &'static str) -> Result<String, PayloadError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(PayloadError::MissingField(field))
}

fn parse_version(value: Option<&Value>) -> Result<Option<u64>, PayloadError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| PayloadError::InvalidVersion(v.to_string())),
    }
}
