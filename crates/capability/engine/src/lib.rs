//! 在线状态引擎
//!
//! 跟踪大量 id 的在线/离线状态：
//! - `Backend`：后端能力契约（上线、下线、查询、监听、关闭）
//! - `TtlBackend`：按键 TTL 判定在线，依赖存储的键事件通知
//! - `FaultTolerantBackend`：成员集合 + 元数据 + 后台清扫，崩溃可恢复
//! - `Session`：面向调用方的门面
//!
//! 所有在线状态都保存在外部存储中，进程内只保留关闭标记与通道。

pub mod backend;
pub mod error;
pub mod fault_tolerant;
pub mod namespace;
pub mod session;
mod state;
pub mod ttl;

pub use backend::Backend;
pub use domain::{BatchError, Event, Status};
pub use error::PresenceError;
pub use fault_tolerant::{FaultTolerantBackend, FaultTolerantKeys, SweepReport};
pub use namespace::Namespace;
pub use session::Session;
pub use ttl::{NotificationDecoder, TtlBackend};

use presence_config::{BackendKind, PresenceConfig};
use std::sync::Arc;
use tracing::info;

/// 按配置选择后端并连接 Redis。
pub async fn connect(config: &PresenceConfig) -> Result<Session, PresenceError> {
    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Ttl => Arc::new(TtlBackend::connect(config).await?),
        BackendKind::FaultTolerant => Arc::new(FaultTolerantBackend::connect(config).await?),
    };
    info!(
        target: "presence.engine",
        backend = ?config.backend,
        redis_db = config.redis_db,
        "presence_session_ready"
    );
    Ok(Session::new(backend))
}
