//! # Presence Storage 模块
//!
//! 本模块为在线状态引擎提供外部键值存储的抽象与实现。
//!
//! ## 架构设计
//!
//! 1. **接口抽象层** (`traits.rs`)：`PresenceStore` 异步 Trait，覆盖引擎需要的全部命令
//! 2. **错误处理层** (`error.rs`)：统一的存储错误类型
//! 3. **连接管理层** (`connection.rs`)：Redis 客户端初始化（连接串 + 库编号）
//! 4. **实现层**：
//!    - `redis.rs`：Redis 实现（生产环境使用）
//!    - `in_memory/`：内存实现（测试与单进程部署）
//!
//! ## 批量语义
//!
//! 批量接口（`pexpire_many`、`exists_many`、`hash_get_all_many` 等）在一个事务
//! （`MULTI/EXEC`）内执行：
//!
//! - 外层 `Err`：传输/协议失败，整个调用无结果
//! - 内层 `Vec<Result<..>>`：与请求顺序一一对应的单键结果；
//!   事务中某条命令的服务端错误（如 WRONGTYPE）只落在对应的键上
//!
//! ## 键事件通知
//!
//! `subscribe` 以模式订阅 `__keyevent@<db>__:<event>` 通道，
//! 通知内容为键名。接收端被丢弃后，订阅任务退出并释放连接。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use presence_storage::{PresenceStore, RedisPresenceStore};
//!
//! let store = RedisPresenceStore::connect("redis://127.0.0.1:6379", 0).await?;
//! let existed = store.pexpire_many(&["presence:u1".to_string()], 1_000).await?;
//! ```

pub mod connection;
pub mod error;
pub mod in_memory;
pub mod redis;
pub mod traits;

pub use connection::*;
pub use error::*;
pub use in_memory::InMemoryPresenceStore;
pub use self::redis::RedisPresenceStore;
pub use traits::*;
