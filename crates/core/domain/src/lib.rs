//! 在线状态领域模型：所有模块共享的值类型。

pub mod data;
pub mod error;

pub use data::{Event, ParseStatusError, Status};
pub use error::BatchError;
