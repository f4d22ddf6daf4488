use crate::error::PresenceError;

/// 键命名空间：所有键形如 `<prefix>:<id>`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self, id: &str) -> String {
        format!("{}:{}", self.prefix, id)
    }

    pub fn keys(&self, ids: &[String]) -> Vec<String> {
        ids.iter().map(|id| self.key(id)).collect()
    }

    /// 子命名空间，例如 `ftpp` -> `ftpp:status`。
    pub fn child(&self, segment: &str) -> Self {
        Self::new(self.key(segment))
    }

    /// 从通知载荷（键名）还原 id，剥去 `len(prefix) + 1` 字节。
    ///
    /// 不属于本命名空间的键返回 `Ok(None)`。
    pub fn strip(&self, payload: &[u8]) -> Result<Option<String>, PresenceError> {
        let prefix = self.prefix.as_bytes();
        if payload.len() <= prefix.len() {
            return Err(invalid_id(payload));
        }
        if !payload.starts_with(prefix) || payload[prefix.len()] != b':' {
            return Ok(None);
        }
        let id = std::str::from_utf8(&payload[prefix.len() + 1..])
            .map_err(|_| invalid_id(payload))?;
        if id.is_empty() {
            return Err(invalid_id(payload));
        }
        Ok(Some(id.to_string()))
    }
}

fn invalid_id(payload: &[u8]) -> PresenceError {
    PresenceError::InvalidId(String::from_utf8_lossy(payload).into_owned())
}
