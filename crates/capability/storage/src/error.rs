//! 存储层错误类型
//!
//! 定义统一的存储错误类型，用于封装底层错误：
//! - Redis 命令/协议错误
//! - 连接错误
//! - 数据类型不匹配（WRONGTYPE）与回复解码错误

#[derive(Debug, Clone)]
pub struct StorageError {
    message: String,
}

impl StorageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StorageError {}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        Self::new(err.to_string())
    }
}
