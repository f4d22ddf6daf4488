//! 批量操作的按标识聚合错误。

use std::collections::BTreeMap;
use std::fmt;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 批量操作部分失败时，按标识收集的错误集合。
///
/// 批量调用中成功的标识照常返回结果，失败的标识在这里逐个可查，
/// 调用方据此区分“全部成功 / 全部失败 / 部分成功”。
#[derive(Debug, Default)]
pub struct BatchError {
    errors: BTreeMap<String, BoxError>,
}

impl BatchError {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录某个标识的错误（同一标识重复记录时以最后一次为准）。
    pub fn append(&mut self, id: impl Into<String>, err: impl Into<BoxError>) {
        self.errors.insert(id.into(), err.into());
    }

    pub fn has(&self, id: &str) -> bool {
        self.errors.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.errors.get(id).map(|err| &**err)
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &(dyn std::error::Error + Send + Sync + 'static))> {
        self.errors
            .iter()
            .map(|(id, err)| (id.as_str(), &**err))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.errors.keys().map(String::as_str)
    }

    /// 合并另一组错误。
    pub fn extend(&mut self, other: BatchError) {
        self.errors.extend(other.errors);
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("presence error:")?;
        for (id, err) in &self.errors {
            write!(f, "{{id: {}, err: {}}}", id, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchError {}
