//! 同步实体与消费端缓存
//!
//! - `SyncEntity`：参与同步的实体类型需要提供种类、ID、版本与字段合并
//! - `Node` / `Scene`：两种实体（流程图节点、设计器场景）
//! - `EntityCache`：消费端按 `EntityChange` 合并本地副本的辅助结构

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ChangeKind, EntityKind};
use crate::error::{RealtimeError, Result};

/// 变更来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeSource {
    /// 临时广播（低延迟，可能是近似值）
    Broadcast,
    /// 持久化变更流（权威）
    Feed,
}

/// 交付给消费者的变更
#[derive(Debug, Clone, PartialEq)]
pub struct EntityChange {
    pub id: String,
    pub kind: ChangeKind,
    pub version: Option<u64>,
    pub data: Value,
    pub source: ChangeSource,
}

/// 可同步实体
pub trait SyncEntity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;

    fn version(&self) -> u64;

    /// 把一份部分字段合并进本地副本
    ///
    /// 默认实现按 JSON 字段覆盖；未知字段被忽略，只读字段 `id` 不会被覆盖。
    fn merge(&mut self, patch: &Value) -> Result<()> {
        let patch = match patch {
            Value::Object(patch) => patch,
            Value::Null => return Ok(()),
            _ => return Err(RealtimeError::InvalidInput("merge patch must be an object".to_string())),
        };
        let mut current = serde_json::to_value(&*self)?;
        if let Value::Object(fields) = &mut current {
            for (key, value) in patch {
                if key != "id" {
                    fields.insert(key.clone(), value.clone());
                }
            }
        }
        *self = serde_json::from_value(current)?;
        Ok(())
    }

    /// 激活标记；只有场景有意义
    fn set_active(&mut self, _active: bool) {}
}

/// 流程图节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub workspace_id: String,
    #[serde(default = "initial_version")]
    pub version: u64,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub payload: Value,
}

impl Node {
    pub fn new(id: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            version: initial_version(),
            x: 0.0,
            y: 0.0,
            node_type: String::new(),
            title: String::new(),
            status: String::new(),
            payload: Value::Null,
        }
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.x = x;
        self.y = y;
        self
    }
}

impl SyncEntity for Node {
    const KIND: EntityKind = EntityKind::Node;

    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// 设计器场景
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub workspace_id: String,
    #[serde(default = "initial_version")]
    pub version: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub is_active: bool,
}

impl Scene {
    pub fn new(id: impl Into<String>, workspace_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            version: initial_version(),
            name: name.into(),
            payload: Value::Null,
            is_active: false,
        }
    }
}

impl SyncEntity for Scene {
    const KIND: EntityKind = EntityKind::Scene;

    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_active(&mut self, active: bool) {
        self.is_active = active;
    }
}

/// 新建实体的版本从 1 开始
fn initial_version() -> u64 {
    1
}

/// 消费端实体缓存（可能过期的本地副本）
#[derive(Debug, Clone)]
pub struct EntityCache<T: SyncEntity> {
    items: HashMap<String, T>,
}

impl<T: SyncEntity> Default for EntityCache<T> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
        }
    }
}

impl<T: SyncEntity> EntityCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 本地乐观写入（调用方在广播前自己完成）
    pub fn insert(&mut self, entity: T) {
        self.items.insert(entity.id().to_string(), entity);
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.items.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        self.items.remove(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    /// 应用一条变更，返回本地状态是否发生变化
    pub fn apply(&mut self, change: &EntityChange) -> Result<bool> {
        let patch = versioned_patch(change);
        match change.kind {
            ChangeKind::Created => match self.items.get_mut(&change.id) {
                Some(existing) => existing.merge(&patch).map(|_| true),
                None => {
                    let entity: T = serde_json::from_value(patch)?;
                    self.insert(entity);
                    Ok(true)
                }
            },
            ChangeKind::Updated | ChangeKind::Moved => match self.items.get_mut(&change.id) {
                Some(existing) => existing.merge(&patch).map(|_| true),
                // 变更流携带完整行，本地没有时可以直接建立副本
                None => match serde_json::from_value::<T>(patch) {
                    Ok(entity) if change.source == ChangeSource::Feed => {
                        self.insert(entity);
                        Ok(true)
                    }
                    _ => Ok(false),
                },
            },
            ChangeKind::Activated => {
                if !self.items.contains_key(&change.id) {
                    return Ok(false);
                }
                for (id, entity) in self.items.iter_mut() {
                    entity.set_active(id == &change.id);
                }
                if let Some(target) = self.items.get_mut(&change.id) {
                    target.merge(&patch)?;
                    target.set_active(true);
                }
                Ok(true)
            }
            ChangeKind::Deleted => Ok(self.items.remove(&change.id).is_some()),
        }
    }
}

/// 变更数据 + 事件上的版本号
fn versioned_patch(change: &EntityChange) -> Value {
    let mut patch = match &change.data {
        Value::Object(_) => change.data.clone(),
        _ => Value::Object(Default::default()),
    };
    if let (Some(version), Value::Object(fields)) = (change.version, &mut patch) {
        fields.insert("version".to_string(), Value::from(version));
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(id: &str, kind: ChangeKind, version: Option<u64>, data: Value) -> EntityChange {
        EntityChange {
            id: id.to_string(),
            kind,
            version,
            data,
            source: ChangeSource::Broadcast,
        }
    }

    #[test]
    fn test_merge_keeps_id_and_unknown_fields_are_ignored() {
        let mut node = Node::new("n1", "ws1");
        node.merge(&json!({"id": "other", "x": 10.0, "y": 20.0, "colour": "#fff"})).unwrap();

        assert_eq!(node.id, "n1");
        assert_eq!((node.x, node.y), (10.0, 20.0));
        assert!(node.merge(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_cache_create_move_delete() {
        let mut cache = EntityCache::<Node>::new();
        let created = serde_json::to_value(Node::new("n1", "ws1")).unwrap();

        assert!(cache.apply(&change("n1", ChangeKind::Created, Some(1), created)).unwrap());
        assert!(cache.apply(&change("n1", ChangeKind::Moved, None, json!({"x": 5.0, "y": 6.0}))).unwrap());
        let node = cache.get("n1").unwrap();
        assert_eq!((node.x, node.y, node.version), (5.0, 6.0, 1));

        assert!(cache.apply(&change("n1", ChangeKind::Deleted, None, Value::Null)).unwrap());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_broadcast_update_for_unknown_entity_is_ignored() {
        let mut cache = EntityCache::<Node>::new();
        let applied = cache
            .apply(&change("n9", ChangeKind::Moved, None, json!({"x": 1.0})))
            .unwrap();
        assert!(!applied);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_feed_row_creates_missing_entity() {
        let mut cache = EntityCache::<Scene>::new();
        let mut row = change(
            "s1",
            ChangeKind::Updated,
            Some(4),
            json!({"id": "s1", "workspace_id": "ws1", "version": 4, "name": "Intro"}),
        );
        row.source = ChangeSource::Feed;

        assert!(cache.apply(&row).unwrap());
        assert_eq!(cache.get("s1").unwrap().name, "Intro");
        assert_eq!(cache.get("s1").unwrap().version, 4);
    }

    #[test]
    fn test_activating_a_scene_deactivates_the_others() {
        let mut cache = EntityCache::<Scene>::new();
        let mut intro = Scene::new("s1", "ws1", "Intro");
        intro.is_active = true;
        cache.insert(intro);
        cache.insert(Scene::new("s2", "ws1", "Chorus"));

        assert!(cache.apply(&change("s2", ChangeKind::Activated, Some(3), Value::Null)).unwrap());
        assert!(!cache.get("s1").unwrap().is_active);
        assert!(cache.get("s2").unwrap().is_active);
        assert_eq!(cache.get("s2").unwrap().version, 3);
    }
}
