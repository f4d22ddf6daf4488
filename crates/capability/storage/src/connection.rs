//! Redis 连接管理
//!
//! 提供客户端初始化功能：
//! - open_client：解析连接串并应用数据库编号

use crate::error::StorageError;
use redis::IntoConnectionInfo;

/// 打开 Redis 客户端
///
/// 连接串中的数据库编号会被 `db` 覆盖，便于通过独立配置项选择库。
///
/// # 参数
/// - `redis_url`：Redis 连接字符串
/// - `db`：数据库编号
pub fn open_client(redis_url: &str, db: i64) -> Result<redis::Client, StorageError> {
    let mut info = redis_url.into_connection_info()?;
    info.redis.db = db;
    let client = redis::Client::open(info)?;
    Ok(client)
}
