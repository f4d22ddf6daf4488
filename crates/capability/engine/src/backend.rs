//! 后端能力契约

use crate::error::PresenceError;
use async_trait::async_trait;
use domain::Event;
use tokio::sync::mpsc;

/// 在线状态后端
///
/// 批量接口按请求顺序处理 id，空切片直接返回成功。
/// 关闭后所有操作返回 [`PresenceError::Closed`]。
#[async_trait]
pub trait Backend: Send + Sync {
    /// 标记 id 在线（刷新最近活跃时间）。
    async fn online(&self, ids: &[String]) -> Result<(), PresenceError>;

    /// 标记 id 离线；对已离线或从未出现的 id 幂等。
    async fn offline(&self, ids: &[String]) -> Result<(), PresenceError>;

    /// 查询状态，结果与请求一一对应。
    async fn status(&self, ids: &[String]) -> Result<Vec<Event>, PresenceError>;

    /// 释放资源并关闭事件通道；重复关闭返回 [`PresenceError::AlreadyClosed`]。
    async fn close(&self) -> Result<(), PresenceError>;

    /// 异步错误通道，仅第一次调用返回 `Some`。
    fn errors(&self) -> Option<mpsc::Receiver<PresenceError>>;

    /// 订阅 Online/Offline 变化，每个后端只允许一个监听者。
    ///
    /// 关闭后端或事件来源终止时通道结束。离线事件不做变化判断，
    /// 消费方可能收到同一 id 的重复 Offline。
    async fn listen_status_changes(&self) -> Result<mpsc::Receiver<Event>, PresenceError>;
}
