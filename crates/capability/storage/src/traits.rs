//! 存储接口 Trait 定义
//!
//! 在线状态引擎依赖的外部键值存储能力：
//! - 批量 TTL 刷新 / 条件创建 / 存在性检查（TTL 后端）
//! - 集合与哈希读写、短期锁（容错后端）
//! - 键事件订阅（状态变化监听）
//!
//! 设计原则：
//! - 批量接口在一个事务内执行，外层 `Result` 表示整体传输失败，
//!   内层按请求顺序给出每个键的结果
//! - 使用 async_trait 支持动态分发

use crate::error::StorageError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// 批量命令中每个键的结果（与请求顺序一致）。
pub type BatchReply<T> = Vec<Result<T, StorageError>>;

/// 订阅通道：存储侧错误以 `Err` 送达后订阅结束。
pub type NotificationReceiver = mpsc::Receiver<Result<KeyNotification, StorageError>>;

/// 一条键事件通知。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNotification {
    /// 命中的订阅模式。
    pub pattern: String,
    pub channel: String,
    /// 通知内容（keyevent 通道下为键名）。
    pub payload: Vec<u8>,
}

/// keyevent 通知通道名。
pub fn keyevent_channel(db: i64, event: &str) -> String {
    format!("__keyevent@{}__:{}", db, event)
}

/// 在线状态存储接口
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// 当前使用的数据库编号（用于拼接通知通道）。
    fn db(&self) -> i64;

    /// 批量设置过期时间（毫秒，0 表示立即删除），返回键在设置前是否存在。
    async fn pexpire_many(
        &self,
        keys: &[String],
        ttl_ms: u64,
    ) -> Result<BatchReply<bool>, StorageError>;

    /// 批量“不存在才创建”并附带过期时间，返回是否由本次创建。
    async fn set_nx_px_many(
        &self,
        entries: &[(String, String)],
        ttl_ms: u64,
    ) -> Result<BatchReply<bool>, StorageError>;

    /// 批量存在性检查。
    async fn exists_many(&self, keys: &[String]) -> Result<BatchReply<bool>, StorageError>;

    /// 向集合添加成员，返回新增数量。
    async fn set_add(&self, set: &str, members: &[String]) -> Result<u64, StorageError>;

    /// 从集合移除成员，返回移除数量。
    async fn set_remove(&self, set: &str, members: &[String]) -> Result<u64, StorageError>;

    /// 随机弹出一个成员。
    async fn set_pop(&self, set: &str) -> Result<Option<String>, StorageError>;

    /// 集合成员数。
    async fn set_card(&self, set: &str) -> Result<u64, StorageError>;

    /// 批量写入哈希字段。
    async fn hash_set_many(
        &self,
        entries: &[(String, Vec<(String, String)>)],
    ) -> Result<BatchReply<()>, StorageError>;

    /// 批量读取整个哈希（不存在的键返回空表）。
    async fn hash_get_all_many(
        &self,
        keys: &[String],
    ) -> Result<BatchReply<HashMap<String, String>>, StorageError>;

    /// 条件写入：哈希字段 `guard.0` 仍等于 `guard.1` 时才写入 `field`，返回是否写入。
    ///
    /// 缺失的守护字段按空串比较；比较与写入为原子操作。
    async fn hash_set_if_eq(
        &self,
        key: &str,
        guard: (&str, &str),
        field: &str,
        value: &str,
    ) -> Result<bool, StorageError>;

    /// 尝试获取短期锁。
    async fn try_lock(&self, key: &str, token: &str, ttl_ms: u64) -> Result<bool, StorageError>;

    /// 释放锁（仅当持有者标识一致时删除）。
    async fn unlock(&self, key: &str, token: &str) -> Result<bool, StorageError>;

    /// 开启键事件通知。
    async fn enable_key_notifications(&self) -> Result<(), StorageError>;

    /// 按模式订阅通知；接收端被丢弃后订阅随之取消。
    async fn subscribe(&self, patterns: &[String]) -> Result<NotificationReceiver, StorageError>;
}
