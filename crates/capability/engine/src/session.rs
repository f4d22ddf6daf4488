use crate::backend::Backend;
use crate::error::PresenceError;
use domain::Event;
use std::sync::Arc;
use tokio::sync::mpsc;

/// 面向调用方的会话：持有一个后端并转发全部操作。
#[derive(Clone)]
pub struct Session {
    backend: Arc<dyn Backend>,
}

impl Session {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub async fn online(&self, ids: &[String]) -> Result<(), PresenceError> {
        self.backend.online(ids).await
    }

    pub async fn offline(&self, ids: &[String]) -> Result<(), PresenceError> {
        self.backend.offline(ids).await
    }

    pub async fn status(&self, ids: &[String]) -> Result<Vec<Event>, PresenceError> {
        self.backend.status(ids).await
    }

    pub async fn close(&self) -> Result<(), PresenceError> {
        self.backend.close().await
    }

    pub fn errors(&self) -> Option<mpsc::Receiver<PresenceError>> {
        self.backend.errors()
    }

    pub async fn listen_status_changes(&self) -> Result<mpsc::Receiver<Event>, PresenceError> {
        self.backend.listen_status_changes().await
    }
}
