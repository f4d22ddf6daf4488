//! 在线状态引擎运行配置加载。

use std::env;
use std::time::Duration;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 后端策略选择。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// 按键 TTL 刷新的简单后端。
    #[default]
    Ttl,
    /// 成员集合 + 元数据 + 后台清扫的容错后端。
    FaultTolerant,
}

impl BackendKind {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "ttl" => Some(Self::Ttl),
            "fault-tolerant" | "fault_tolerant" | "ft" => Some(Self::FaultTolerant),
            _ => None,
        }
    }
}

/// 在线状态引擎配置。
///
/// 所有后端构造函数都显式接收该结构，不存在进程级可变配置。
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub redis_url: String,
    pub redis_db: i64,
    /// 无心跳允许时长（TTL 后端的键 TTL / 容错后端的淘汰阈值）。
    pub inactive_ms: u64,
    /// 容错后端清扫周期。
    pub sweep_interval_ms: u64,
    pub prefix: String,
    pub fault_tolerant_prefix: String,
    pub event_buffer: usize,
    pub error_buffer: usize,
    pub lock_ttl_ms: u64,
    /// 监听前是否执行 `CONFIG SET notify-keyspace-events`。
    pub configure_notifications: bool,
    pub backend: BackendKind,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_db: 0,
            inactive_ms: 60_000,
            sweep_interval_ms: 100,
            prefix: "presence".to_string(),
            fault_tolerant_prefix: "ftpp".to_string(),
            event_buffer: 1000,
            error_buffer: 64,
            lock_ttl_ms: 5_000,
            configure_notifications: false,
            backend: BackendKind::Ttl,
        }
    }
}

impl PresenceConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// 从任意键值来源读取配置（未设置的键取默认值）。
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let redis_url = lookup("PRESENCE_REDIS_URL").unwrap_or(defaults.redis_url);
        let redis_db = read_i64_with_default(&lookup, "PRESENCE_REDIS_DB", defaults.redis_db)?;
        let inactive_ms =
            read_positive_u64(&lookup, "PRESENCE_INACTIVE_MS", defaults.inactive_ms)?;
        let sweep_interval_ms = read_positive_u64(
            &lookup,
            "PRESENCE_SWEEP_INTERVAL_MS",
            defaults.sweep_interval_ms,
        )?;
        let prefix = read_non_empty(&lookup, "PRESENCE_PREFIX", defaults.prefix)?;
        let fault_tolerant_prefix = read_non_empty(
            &lookup,
            "PRESENCE_FT_PREFIX",
            defaults.fault_tolerant_prefix,
        )?;
        let event_buffer =
            read_positive_u64(&lookup, "PRESENCE_EVENT_BUFFER", defaults.event_buffer as u64)?
                as usize;
        let error_buffer =
            read_positive_u64(&lookup, "PRESENCE_ERROR_BUFFER", defaults.error_buffer as u64)?
                as usize;
        let lock_ttl_ms = read_positive_u64(&lookup, "PRESENCE_LOCK_TTL_MS", defaults.lock_ttl_ms)?;
        let configure_notifications = read_bool_with_default(
            &lookup,
            "PRESENCE_CONFIGURE_NOTIFICATIONS",
            defaults.configure_notifications,
        );
        let backend = match lookup("PRESENCE_BACKEND") {
            Some(value) if !value.is_empty() => BackendKind::parse(&value)
                .ok_or_else(|| ConfigError::Invalid("PRESENCE_BACKEND".to_string(), value))?,
            _ => defaults.backend,
        };

        if redis_db < 0 {
            return Err(ConfigError::Invalid(
                "PRESENCE_REDIS_DB".to_string(),
                redis_db.to_string(),
            ));
        }

        Ok(Self {
            redis_url,
            redis_db,
            inactive_ms,
            sweep_interval_ms,
            prefix,
            fault_tolerant_prefix,
            event_buffer,
            error_buffer,
            lock_ttl_ms,
            configure_notifications,
            backend,
        })
    }

    pub fn inactive_duration(&self) -> Duration {
        Duration::from_millis(self.inactive_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }
}

fn read_i64_with_default<F>(lookup: &F, key: &str, default: i64) -> Result<i64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = match lookup(key) {
        Some(value) if !value.is_empty() => value,
        _ => return Ok(default),
    };
    value
        .parse::<i64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_positive_u64<F>(lookup: &F, key: &str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = match lookup(key) {
        Some(value) if !value.is_empty() => value,
        _ => return Ok(default),
    };
    match value.parse::<u64>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(ConfigError::Invalid(key.to_string(), value)),
    }
}

fn read_non_empty<F>(lookup: &F, key: &str, default: String) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if value.trim().is_empty() => Err(ConfigError::Invalid(key.to_string(), value)),
        Some(value) => Ok(value),
        None => Ok(default),
    }
}

fn read_bool_with_default<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        None => default,
    }
}
