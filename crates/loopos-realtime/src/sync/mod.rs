/// 实体同步模块
///
/// 职责：
/// - 在临时广播通道上传播实体变更（低延迟、可能是近似值）
/// - 在持久化变更流上接收权威状态（纠正偏差）
/// - 两条路径共用同一个准入门（版本账本 + 回声抑制）
/// - 对高频 move 做每实体的防抖合并

pub mod debounce;
pub mod entity;
pub mod entity_kind;
pub mod event;
pub mod facade;
pub mod version_gate;

pub use debounce::DebounceCoalescer;
pub use entity::{ChangeSource, EntityCache, EntityChange, Node, Scene, SyncEntity};
pub use entity_kind::EntityKind;
pub use event::{ChangeEvent, ChangeKind, PayloadError};
pub use facade::{ChangeListener, EntitySync, EntitySyncStats};
pub use version_gate::{should_apply, Admission, VersionLedger};

/// 节点同步
pub type NodeSync = EntitySync<Node>;

/// 场景同步
pub type SceneSync = EntitySync<Scene>;
