//! TTL 后端
//!
//! 在线即键存在：`<prefix>:<id>` 带有无活跃 TTL，心跳刷新 TTL，
//! 过期或被删除即离线。状态变化来自存储的 keyevent 通知。

use crate::backend::Backend;
use crate::error::{PresenceError, check_replies, finish, finish_status};
use crate::namespace::Namespace;
use crate::state::BackendState;
use async_trait::async_trait;
use domain::{BatchError, Event, Status};
use presence_config::PresenceConfig;
use presence_storage::{
    KeyNotification, NotificationReceiver, PresenceStore, RedisPresenceStore, keyevent_channel,
};
use presence_telemetry::{record_offline_call, record_online_call, record_status_call};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// 通知解码：按命中的模式判定 Online/Offline，按前缀还原 id。
#[derive(Debug, Clone)]
pub struct NotificationDecoder {
    namespace: Namespace,
    online_pattern: String,
    offline_patterns: Vec<String>,
}

impl NotificationDecoder {
    pub fn new(namespace: Namespace, db: i64) -> Self {
        Self {
            namespace,
            online_pattern: keyevent_channel(db, "set"),
            offline_patterns: vec![keyevent_channel(db, "expired"), keyevent_channel(db, "del")],
        }
    }

    /// 需要订阅的全部模式。
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns = vec![self.online_pattern.clone()];
        patterns.extend(self.offline_patterns.iter().cloned());
        patterns
    }

    /// 命名空间外的键返回 `Ok(None)`。
    pub fn decode(&self, notification: &KeyNotification) -> Result<Option<Event>, PresenceError> {
        let Some(id) = self.namespace.strip(&notification.payload)? else {
            return Ok(None);
        };
        let status = if notification.pattern == self.online_pattern {
            Status::Online
        } else if self.offline_patterns.contains(&notification.pattern) {
            Status::Offline
        } else {
            return Err(PresenceError::UnknownPattern(notification.pattern.clone()));
        };
        Ok(Some(Event::new(id, status)))
    }
}

/// TTL 后端
pub struct TtlBackend<S> {
    store: Arc<S>,
    namespace: Namespace,
    ttl_ms: u64,
    configure_notifications: bool,
    state: Arc<BackendState>,
}

impl TtlBackend<RedisPresenceStore> {
    /// 按配置连接 Redis。
    pub async fn connect(config: &PresenceConfig) -> Result<Self, PresenceError> {
        let store = RedisPresenceStore::connect(&config.redis_url, config.redis_db).await?;
        Ok(Self::new(Arc::new(store), config))
    }
}

impl<S> TtlBackend<S>
where
    S: PresenceStore + 'static,
{
    pub fn new(store: Arc<S>, config: &PresenceConfig) -> Self {
        Self {
            store,
            namespace: Namespace::new(config.prefix.clone()),
            ttl_ms: config.inactive_ms,
            configure_notifications: config.configure_notifications,
            state: Arc::new(BackendState::new(config.event_buffer, config.error_buffer)),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// 第一阶段：刷新 TTL，返回不存在的 id 与逐 id 错误。
    async fn refresh(&self, ids: &[String]) -> Result<(Vec<String>, BatchError), PresenceError> {
        let keys = self.namespace.keys(ids);
        let replies = self.store.pexpire_many(&keys, self.ttl_ms).await?;
        check_replies(ids.len(), &replies)?;

        let mut missing = Vec::new();
        let mut failures = BatchError::new();
        for (id, reply) in ids.iter().zip(replies) {
            match reply {
                Ok(true) => {}
                Ok(false) => missing.push(id.clone()),
                Err(err) => failures.append(id.clone(), err),
            }
        }
        Ok((missing, failures))
    }

    /// 第二阶段：仅创建仍不存在的键，已存在的键不覆盖。
    async fn create_missing(
        &self,
        missing: &[String],
        failures: &mut BatchError,
    ) -> Result<(), PresenceError> {
        let entries: Vec<(String, String)> = missing
            .iter()
            .map(|id| (self.namespace.key(id), id.clone()))
            .collect();
        let replies = self.store.set_nx_px_many(&entries, self.ttl_ms).await?;
        check_replies(missing.len(), &replies)?;
        for (id, reply) in missing.iter().zip(replies) {
            // NX 被拒说明两阶段之间已被并发创建，同样视为成功
            if let Err(err) = reply {
                failures.append(id.clone(), err);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S> Backend for TtlBackend<S>
where
    S: PresenceStore + 'static,
{
    async fn online(&self, ids: &[String]) -> Result<(), PresenceError> {
        self.state.ensure_open()?;
        if ids.is_empty() {
            return Ok(());
        }
        record_online_call(ids.len());
        let (missing, mut failures) = self.refresh(ids).await?;
        if !missing.is_empty() {
            self.create_missing(&missing, &mut failures).await?;
        }
        finish(failures)
    }

    async fn offline(&self, ids: &[String]) -> Result<(), PresenceError> {
        self.state.ensure_open()?;
        if ids.is_empty() {
            return Ok(());
        }
        record_offline_call(ids.len());
        let keys = self.namespace.keys(ids);
        let replies = self.store.pexpire_many(&keys, 0).await?;
        check_replies(ids.len(), &replies)?;
        let mut failures = BatchError::new();
        for (id, reply) in ids.iter().zip(replies) {
            if let Err(err) = reply {
                failures.append(id.clone(), err);
            }
        }
        finish(failures)
    }

    async fn status(&self, ids: &[String]) -> Result<Vec<Event>, PresenceError> {
        self.state.ensure_open()?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        record_status_call(ids.len());
        let keys = self.namespace.keys(ids);
        let replies = self.store.exists_many(&keys).await?;
        check_replies(ids.len(), &replies)?;

        let mut events = Vec::with_capacity(ids.len());
        let mut failures = BatchError::new();
        for (id, reply) in ids.iter().zip(replies) {
            match reply {
                Ok(true) => events.push(Event::new(id.clone(), Status::Online)),
                Ok(false) => events.push(Event::new(id.clone(), Status::Offline)),
                Err(err) => {
                    failures.append(id.clone(), err);
                    events.push(Event::new(id.clone(), Status::Unknown));
                }
            }
        }
        finish_status(events, failures)
    }

    async fn close(&self) -> Result<(), PresenceError> {
        self.state.close()?;
        info!(target: "presence.engine", prefix = %self.namespace.prefix(), "ttl_backend_closed");
        Ok(())
    }

    fn errors(&self) -> Option<mpsc::Receiver<PresenceError>> {
        self.state.take_errors()
    }

    async fn listen_status_changes(&self) -> Result<mpsc::Receiver<Event>, PresenceError> {
        self.state.ensure_can_listen()?;
        if self.configure_notifications {
            self.store.enable_key_notifications().await?;
        }
        let decoder = NotificationDecoder::new(self.namespace.clone(), self.store.db());
        let notifications = self.store.subscribe(&decoder.patterns()).await?;
        // 并发的第二个监听者在这里被拒绝，其订阅随接收端一起丢弃
        let events = self.state.listen()?;
        tokio::spawn(run_listener(notifications, decoder, self.state.clone()));
        info!(target: "presence.engine", prefix = %self.namespace.prefix(), "listener_started");
        Ok(events)
    }
}

impl<S> Drop for TtlBackend<S> {
    fn drop(&mut self) {
        // 未显式关闭时也要让监听任务退出
        let _ = self.state.close();
    }
}

async fn run_listener(
    mut notifications: NotificationReceiver,
    decoder: NotificationDecoder,
    state: Arc<BackendState>,
) {
    let mut closed = state.closed_signal();
    loop {
        if state.is_closed() {
            break;
        }
        let received = tokio::select! {
            _ = closed.changed() => break,
            received = notifications.recv() => received,
        };
        match received {
            Some(Ok(notification)) => match decoder.decode(&notification) {
                Ok(Some(event)) => {
                    state.emit(event).await;
                }
                Ok(None) => {
                    debug!(
                        target: "presence.engine",
                        channel = %notification.channel,
                        "notification_outside_namespace"
                    );
                }
                Err(err) => state.report(err),
            },
            Some(Err(err)) => {
                if !state.is_closed() {
                    state.report(err.into());
                }
                break;
            }
            None => {
                if !state.is_closed() {
                    state.report(PresenceError::SubscriptionClosed);
                }
                break;
            }
        }
    }
    state.detach_events();
    debug!(target: "presence.engine", "listener_stopped");
}
