//! 准入门：版本账本 + 回声抑制
//!
//! 每条入站消息（包括高频 move）都要经过这里，所以判定只做一次 O(1) 的 map 查询。
//! 判定只比较"入站版本 vs 已知版本"，与到达顺序无关，因此在任意乱序、重复下都是幂等的。
//!
//! 删除的特殊处理：
//! - 变更流的 delete 携带被删除的旧行，其版本等于最后一次写入的版本，所以 delete 只在版本**严格小于**已知版本时才算过期
//! - 本地删除留下墓碑，确认它的 delete 被识别为已应用（不再交付），随后墓碑被清除

use std::collections::HashMap;

use tracing::debug;

use super::event::{ChangeEvent, ChangeKind};

/// 准入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// 接受，交给调用方合并
    Accepted,
    /// 本地 actor 自己发出的事件
    Echo,
    /// 版本不大于已知版本（重复或乱序到达）
    Stale { known: u64 },
    /// 确认本地删除的 delete 事件
    AlreadyDeleted,
}

impl Admission {
    pub fn is_accepted(self) -> bool {
        matches!(self, Admission::Accepted)
    }
}

/// 纯判定：`shouldApply(event, knownVersion, localActorId)`
///
/// `local_actor_id` 为 None 表示不做回声过滤（变更流路径）。
pub fn should_apply(event: &ChangeEvent, known_version: Option<u64>, local_actor_id: Option<&str>) -> Admission {
    if local_actor_id.is_some_and(|actor| actor == event.actor_id) {
        return Admission::Echo;
    }
    match (event.version, known_version) {
        (Some(incoming), Some(known)) if is_stale(event.kind, incoming, known) => Admission::Stale { known },
        _ => Admission::Accepted,
    }
}

fn is_stale(kind: ChangeKind, incoming: u64, known: u64) -> bool {
    match kind {
        // 旧行的版本就是最后一次写入的版本
        ChangeKind::Deleted => incoming < known,
        _ => incoming <= known,
    }
}

/// 版本账本：entity_id -> 最后应用的版本
///
/// 不变量：同一个 id 的值只增不减；接受 deleted 事件后清除该 id。
/// 账本只属于当前客户端进程，重连时从零重建，不做持久化。
#[derive(Debug, Default)]
pub struct VersionLedger {
    versions: HashMap<String, u64>,
    /// 本地已删除、尚未被确认的 id -> 删除时的已知版本
    tombstones: HashMap<String, Option<u64>>,
}

impl VersionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn known(&self, entity_id: &str) -> Option<u64> {
        self.versions.get(entity_id).copied()
    }

    /// 判定并在接受时推进账本
    pub fn admit(&mut self, event: &ChangeEvent, local_actor_id: Option<&str>) -> Admission {
        let known = self
            .known(&event.entity_id)
            .or_else(|| self.tombstones.get(&event.entity_id).copied().flatten());
        let admission = should_apply(event, known, local_actor_id);
        if admission == Admission::Echo {
            return admission;
        }

        if event.kind == ChangeKind::Deleted && self.tombstones.remove(&event.entity_id).is_some() {
            debug!("delete of {} confirms local delete", event.entity_id);
            return Admission::AlreadyDeleted;
        }
        if !admission.is_accepted() {
            debug!(
                "rejected {} {} (version {:?}): {:?}",
                event.kind.as_str(),
                event.entity_id,
                event.version,
                admission
            );
            return admission;
        }

        match event.kind {
            ChangeKind::Deleted => self.forget(&event.entity_id),
            kind => {
                if kind == ChangeKind::Created {
                    self.tombstones.remove(&event.entity_id);
                }
                if let Some(version) = event.version {
                    self.record(&event.entity_id, version);
                }
            }
        }
        admission
    }

    /// 记录本地已应用的版本（本地 create / update），只增不减
    pub fn record(&mut self, entity_id: &str, version: u64) {
        let entry = self.versions.entry(entity_id.to_string()).or_insert(version);
        if version > *entry {
            *entry = version;
        }
    }

    /// 本地删除：清除版本并留下墓碑，等待变更流确认
    pub fn mark_deleted(&mut self, entity_id: &str) {
        let known = self.versions.remove(entity_id);
        self.tombstones.insert(entity_id.to_string(), known);
    }

    pub fn is_tombstoned(&self, entity_id: &str) -> bool {
        self.tombstones.contains_key(entity_id)
    }

    pub fn forget(&mut self, entity_id: &str) {
        self.versions.remove(entity_id);
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn clear(&mut self) {
        self.versions.clear();
        self.tombstones.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(id: &str, actor: &str, version: Option<u64>) -> ChangeEvent {
        ChangeEvent::new(ChangeKind::Updated, id, actor, "ws1").with_version(version)
    }

    #[test]
    fn test_duplicate_event_applies_once() {
        let mut ledger = VersionLedger::new();
        let event = update("n1", "user-b", Some(3));

        assert_eq!(ledger.admit(&event, Some("user-a")), Admission::Accepted);
        assert_eq!(ledger.admit(&event, Some("user-a")), Admission::Stale { known: 3 });
        assert_eq!(ledger.known("n1"), Some(3));
    }

    #[test]
    fn test_arrival_order_does_not_matter() {
        let mut ledger = VersionLedger::new();
        let accepted: Vec<u64> = [3, 1, 5, 2]
            .into_iter()
            .filter(|v| ledger.admit(&update("n1", "user-b", Some(*v)), Some("user-a")).is_accepted())
            .collect();

        assert_eq!(accepted, vec![3, 5]);
        assert_eq!(ledger.known("n1"), Some(5));
    }

    #[test]
    fn test_echo_is_rejected_regardless_of_version() {
        let mut ledger = VersionLedger::new();
        for version in [None, Some(1), Some(100)] {
            assert_eq!(ledger.admit(&update("n1", "user-a", version), Some("user-a")), Admission::Echo);
        }
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_unversioned_events_are_always_accepted() {
        let mut ledger = VersionLedger::new();
        ledger.record("n1", 9);
        let hint = ChangeEvent::new(ChangeKind::Moved, "n1", "user-b", "ws1");

        assert!(ledger.admit(&hint, Some("user-a")).is_accepted());
        assert!(ledger.admit(&hint, Some("user-a")).is_accepted());
        assert_eq!(ledger.known("n1"), Some(9));
    }

    #[test]
    fn test_feed_path_is_not_actor_filtered() {
        let mut ledger = VersionLedger::new();
        let own_write = update("n1", "user-a", Some(2));
        assert!(ledger.admit(&own_write, None).is_accepted());
        // 已经通过临时通道应用过的版本，再次确认时是 no-op
        assert_eq!(ledger.admit(&own_write, None), Admission::Stale { known: 2 });
    }

    #[test]
    fn test_record_never_decreases() {
        let mut ledger = VersionLedger::new();
        ledger.record("s1", 4);
        ledger.record("s1", 2);
        assert_eq!(ledger.known("s1"), Some(4));
    }

    #[test]
    fn test_accepted_delete_clears_entry() {
        let mut ledger = VersionLedger::new();
        ledger.record("n1", 4);
        let delete = ChangeEvent::new(ChangeKind::Deleted, "n1", "user-b", "ws1");

        assert!(ledger.admit(&delete, Some("user-a")).is_accepted());
        assert_eq!(ledger.known("n1"), None);
    }

    #[test]
    fn test_feed_delete_carrying_known_version_is_accepted() {
        let mut ledger = VersionLedger::new();
        assert!(ledger.admit(&update("n1", "user-x", Some(5)), None).is_accepted());

        // 旧行的版本与最后一次写入相同
        let delete = ChangeEvent::new(ChangeKind::Deleted, "n1", "user-x", "ws1").with_version(Some(5));
        assert!(ledger.admit(&delete, None).is_accepted());
        assert_eq!(ledger.known("n1"), None);

        let mut ledger = VersionLedger::new();
        ledger.record("n1", 6);
        let older = ChangeEvent::new(ChangeKind::Deleted, "n1", "user-x", "ws1").with_version(Some(5));
        assert_eq!(ledger.admit(&older, None), Admission::Stale { known: 6 });
    }

    #[test]
    fn test_local_delete_is_confirmed_once() {
        let mut ledger = VersionLedger::new();
        ledger.record("n1", 3);
        ledger.mark_deleted("n1");
        assert!(ledger.is_tombstoned("n1"));

        // 本地删除前的旧写入仍然是过期的
        assert_eq!(
            ledger.admit(&update("n1", "user-b", Some(3)), None),
            Admission::Stale { known: 3 }
        );

        let confirm = ChangeEvent::new(ChangeKind::Deleted, "n1", "user-a", "ws1").with_version(Some(3));
        assert_eq!(ledger.admit(&confirm, Some("user-a")), Admission::Echo);
        assert_eq!(ledger.admit(&confirm, None), Admission::AlreadyDeleted);
        assert!(!ledger.is_tombstoned("n1"));
        assert!(ledger.admit(&confirm, None).is_accepted());
    }

    #[test]
    fn test_recreate_clears_tombstone() {
        let mut ledger = VersionLedger::new();
        ledger.mark_deleted("n1");
        let created = ChangeEvent::new(ChangeKind::Created, "n1", "user-b", "ws1").with_version(Some(1));

        assert!(ledger.admit(&created, Some("user-a")).is_accepted());
        assert!(!ledger.is_tombstoned("n1"));
        assert_eq!(ledger.known("n1"), Some(1));
    }
}
