//! 实体种类 - 受控枚举
//!
//! 每种实体对应一组固定的广播事件名、主题、变更流表名。
//! 新增实体种类需要客户端与存储同步升级。

use std::str::FromStr;

use super::event::ChangeKind;

/// 实体种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// 流程图节点
    Node,
    /// 设计器场景
    Scene,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Scene => "scene",
        }
    }

    /// 广播载荷中实体 ID 的字段名
    pub fn id_field(self) -> &'static str {
        match self {
            Self::Node => "nodeId",
            Self::Scene => "sceneId",
        }
    }

    /// 持久化变更流对应的表
    pub fn table(self) -> &'static str {
        match self {
            Self::Node => "loopos_nodes",
            Self::Scene => "loopos_designer_scenes",
        }
    }

    /// 临时广播主题：每个 (工作区, 实体种类) 一个
    pub fn topic(self, workspace_id: &str) -> String {
        format!("{}s:{}", self.as_str(), workspace_id)
    }

    /// moved 只属于节点，activated 只属于场景
    pub fn supports(self, change: ChangeKind) -> bool {
        match change {
            ChangeKind::Created | ChangeKind::Updated | ChangeKind::Deleted => true,
            ChangeKind::Moved => self == Self::Node,
            ChangeKind::Activated => self == Self::Scene,
        }
    }

    /// 广播事件名，例如 `node_moved`
    pub fn event_name(self, change: ChangeKind) -> String {
        format!("{}_{}", self.as_str(), change.as_str())
    }

    /// 从广播事件名解析变更类型；不属于本种类的事件返回 None
    pub fn parse_event_name(self, event: &str) -> Option<ChangeKind> {
        let suffix = event.strip_prefix(self.as_str())?.strip_prefix('_')?;
        let change = ChangeKind::from_str(suffix).ok()?;
        self.supports(change).then_some(change)
    }
}

impl FromStr for EntityKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node" => Ok(Self::Node),
            "scene" => Ok(Self::Scene),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_as_str_and_from_str() {
        assert_eq!(EntityKind::Node.as_str(), "node");
        assert_eq!(EntityKind::Scene.as_str(), "scene");
        assert_eq!(EntityKind::from_str("scene").unwrap(), EntityKind::Scene);
        assert!(EntityKind::from_str("cursor").is_err());
    }

    #[test]
    fn topics_and_tables() {
        assert_eq!(EntityKind::Node.topic("ws1"), "nodes:ws1");
        assert_eq!(EntityKind::Scene.topic("ws1"), "scenes:ws1");
        assert_eq!(EntityKind::Node.table(), "loopos_nodes");
        assert_eq!(EntityKind::Scene.table(), "loopos_designer_scenes");
    }

    #[test]
    fn kind_specific_events() {
        assert_eq!(EntityKind::Node.event_name(ChangeKind::Moved), "node_moved");
        assert_eq!(EntityKind::Node.parse_event_name("node_moved"), Some(ChangeKind::Moved));
        // moved 只属于节点，activated 只属于场景
        assert_eq!(EntityKind::Scene.parse_event_name("scene_moved"), None);
        assert_eq!(EntityKind::Node.parse_event_name("node_activated"), None);
        assert_eq!(EntityKind::Scene.parse_event_name("scene_activated"), Some(ChangeKind::Activated));
        // 其它种类的事件不被识别
        assert_eq!(EntityKind::Node.parse_event_name("scene_created"), None);
        assert_eq!(EntityKind::Node.parse_event_name("nodes_created"), None);
    }
}
