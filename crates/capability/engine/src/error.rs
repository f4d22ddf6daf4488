use domain::{BatchError, Event};
use presence_storage::StorageError;

/// 在线状态引擎错误。
///
/// 调用方据此区分三种结果：`Ok` 为全部成功；`failures()` 返回 `Some`
/// 为部分成功（可定位到具体 id）；其余 `Err` 为整体失败。
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("reply count mismatch: expected {expected}, got {got}")]
    ReplyMismatch { expected: usize, got: usize },
    #[error("{0}")]
    Batch(#[from] BatchError),
    /// 状态查询部分失败：`events` 仍与请求一一对应，失败的 id 为 `Unknown`。
    #[error("{failures}")]
    PartialStatus {
        events: Vec<Event>,
        failures: BatchError,
    },
    #[error("closing of already closed backend")]
    AlreadyClosed,
    #[error("backend is closed")]
    Closed,
    #[error("status changes are already being listened to")]
    AlreadyListening,
    #[error("invalid id in notification: {0:?}")]
    InvalidId(String),
    #[error("unknown notification pattern: {0}")]
    UnknownPattern(String),
    #[error("notification subscription closed")]
    SubscriptionClosed,
    #[error("invalid metadata for {id}: {reason}")]
    InvalidMetadata { id: String, reason: String },
    /// 清扫单个成员失败。
    #[error("sweep failed for {id}: {source}")]
    Sweep {
        id: String,
        #[source]
        source: Box<PresenceError>,
    },
}

impl PresenceError {
    /// 部分成功时的逐 id 错误。
    pub fn failures(&self) -> Option<&BatchError> {
        match self {
            Self::Batch(failures) | Self::PartialStatus { failures, .. } => Some(failures),
            _ => None,
        }
    }

    /// 部分成功的状态查询结果。
    pub fn partial_events(&self) -> Option<&[Event]> {
        match self {
            Self::PartialStatus { events, .. } => Some(events),
            _ => None,
        }
    }

    pub(crate) fn sweep(id: &str, source: PresenceError) -> Self {
        Self::Sweep {
            id: id.to_string(),
            source: Box::new(source),
        }
    }
}

/// 校验批量回复数量与请求一致。
pub(crate) fn check_replies<T>(expected: usize, replies: &[T]) -> Result<(), PresenceError> {
    if replies.len() != expected {
        return Err(PresenceError::ReplyMismatch {
            expected,
            got: replies.len(),
        });
    }
    Ok(())
}

/// 将逐 id 错误收束为调用结果。
pub(crate) fn finish(failures: BatchError) -> Result<(), PresenceError> {
    if failures.is_empty() {
        return Ok(());
    }
    presence_telemetry::record_batch_failures(failures.len());
    Err(PresenceError::Batch(failures))
}

/// 状态查询结果：有失败时返回 `PartialStatus`。
pub(crate) fn finish_status(
    events: Vec<Event>,
    failures: BatchError,
) -> Result<Vec<Event>, PresenceError> {
    if failures.is_empty() {
        return Ok(events);
    }
    presence_telemetry::record_batch_failures(failures.len());
    Err(PresenceError::PartialStatus { events, failures })
}
