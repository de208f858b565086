//! 版本与构建元信息
//!
//! - **Crate Version** → Cargo.toml（唯一权威源）
//! - **Build Metadata** → build.rs 中由 vergen 生成

/// crate semver，来自 Cargo.toml
///
/// 禁止手写版本号，必须用 `env!("CARGO_PKG_VERSION")` 与 Cargo.toml 保持同步。
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// build time（由 vergen 在 build.rs 中生成）
pub const BUILD_TIME: &str = env!("VERGEN_BUILD_TIMESTAMP");

/// 协议版本，写入广播载荷以外的诊断信息（日志、统计）
pub const PROTOCOL_NAME: &str = "loopos-entity-sync/1";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_not_empty() {
        assert!(!SDK_VERSION.is_empty());
        assert!(PROTOCOL_NAME.starts_with("loopos-entity-sync"));
    }
}
