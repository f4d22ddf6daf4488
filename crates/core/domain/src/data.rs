use std::fmt;
use std::str::FromStr;

const ONLINE: &str = "ONLINE";
const OFFLINE: &str = "OFFLINE";
const UNKNOWN: &str = "UNKNOWN";

/// 标识的在线状态。
///
/// 默认值为 `Unknown`，字符串形式为 `UNKNOWN`，
/// 与显式的 `Offline` 区分开（未赋值的事件不会被当作离线）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Unknown,
    Offline,
    Online,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Online => ONLINE,
            Status::Offline => OFFLINE,
            Status::Unknown => UNKNOWN,
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Status::Online)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 状态字符串解析失败。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStatusError(String);

impl fmt::Display for ParseStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status token: {}", self.0)
    }
}

impl std::error::Error for ParseStatusError {}

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            ONLINE => Ok(Status::Online),
            OFFLINE => Ok(Status::Offline),
            UNKNOWN => Ok(Status::Unknown),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// 单个标识在某一时刻的状态观测或状态变化。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Event {
    /// 应用侧给出的标识，引擎不解析其内容。
    pub id: String,
    pub status: Status,
    /// 最近一次确认在线的时间（Unix 纳秒），仅容错后端填写。
    pub seen_at_ns: Option<i64>,
}

impl Event {
    pub fn new(id: impl Into<String>, status: Status) -> Self {
        Self {
            id: id.into(),
            status,
            seen_at_ns: None,
        }
    }

    pub fn with_seen_at(id: impl Into<String>, status: Status, seen_at_ns: i64) -> Self {
        Self {
            id: id.into(),
            status,
            seen_at_ns: Some(seen_at_ns),
        }
    }
}
