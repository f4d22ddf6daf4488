//! 内存存储实现模块
//!
//! 用于测试和单进程部署。
//!
//! 包含以下实现：
//! - PresenceStore: InMemoryPresenceStore

pub mod presence;

pub use presence::*;
