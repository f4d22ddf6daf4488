//! 容错后端
//!
//! 在线状态全部保存在存储中，进程崩溃后可完整恢复：
//! - 成员集合 `<prefix>:online`：当前在线的 id
//! - 元数据哈希 `<prefix>:status:<id>`：`status` 与 `seenAt`（纳秒）
//! - 清扫锁 `<prefix>:lock:<id>`：持有者为实例 ID
//!
//! 后台清扫任务周期性检查集合成员，淘汰超过无活跃阈值的 id。

use crate::backend::Backend;
use crate::error::{PresenceError, check_replies, finish, finish_status};
use crate::namespace::Namespace;
use crate::state::BackendState;
use async_trait::async_trait;
use domain::{BatchError, Event, Status};
use presence_config::PresenceConfig;
use presence_storage::{PresenceStore, RedisPresenceStore};
use presence_telemetry::{
    new_instance_id, record_offline_call, record_online_call, record_status_call,
    record_sweep_eviction, record_sweep_pass,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const STATUS_FIELD: &str = "status";
const SEEN_AT_FIELD: &str = "seenAt";

/// 当前 Unix 时间（纳秒）。
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or(0)
}

/// 容错后端使用的全部键。
#[derive(Debug, Clone)]
pub struct FaultTolerantKeys {
    members: String,
    status: Namespace,
    lock: Namespace,
}

impl FaultTolerantKeys {
    pub fn new(prefix: &str) -> Self {
        let root = Namespace::new(prefix);
        Self {
            members: root.key("online"),
            status: root.child("status"),
            lock: root.child("lock"),
        }
    }

    pub fn members(&self) -> &str {
        &self.members
    }

    pub fn status(&self, id: &str) -> String {
        self.status.key(id)
    }

    pub fn lock(&self, id: &str) -> String {
        self.lock.key(id)
    }
}

fn metadata_fields(status: Status, seen_at_ns: i64) -> Vec<(String, String)> {
    vec![
        (STATUS_FIELD.to_string(), status.as_str().to_string()),
        (SEEN_AT_FIELD.to_string(), seen_at_ns.to_string()),
    ]
}

/// 解析元数据；没有记录即从未上线，视为离线。
pub fn decode_metadata(id: &str, fields: &HashMap<String, String>) -> Result<Event, PresenceError> {
    if fields.is_empty() {
        return Ok(Event::new(id, Status::Offline));
    }
    let invalid = |reason: String| PresenceError::InvalidMetadata {
        id: id.to_string(),
        reason,
    };
    let status = fields
        .get(STATUS_FIELD)
        .ok_or_else(|| invalid(format!("missing field {}", STATUS_FIELD)))?
        .parse::<Status>()
        .map_err(|err| invalid(err.to_string()))?;
    let seen_at_ns = fields
        .get(SEEN_AT_FIELD)
        .map(|value| value.parse::<i64>())
        .transpose()
        .map_err(|err| invalid(format!("{}: {}", SEEN_AT_FIELD, err)))?;
    Ok(Event {
        id: id.to_string(),
        status,
        seen_at_ns,
    })
}

/// 单次清扫统计。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: u64,
    /// 仍在活跃阈值内，放回集合。
    pub kept: u64,
    pub evicted: u64,
    /// 状态非在线或记录缺失，直接移出集合。
    pub dropped: u64,
    /// 锁被其他实例持有，放回集合。
    pub skipped: u64,
    pub failed: u64,
}

enum SweepOutcome {
    Kept,
    Evicted,
    Dropped,
    Skipped,
}

impl SweepReport {
    fn record(&mut self, outcome: SweepOutcome) {
        match outcome {
            SweepOutcome::Kept => self.kept += 1,
            SweepOutcome::Evicted => self.evicted += 1,
            SweepOutcome::Dropped => self.dropped += 1,
            SweepOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// 清扫器：与后端共享存储与状态，由后台任务驱动。
struct Sweeper<S> {
    store: Arc<S>,
    keys: FaultTolerantKeys,
    state: Arc<BackendState>,
    inactive_ns: i64,
    lock_ttl_ms: u64,
    instance_id: String,
}

impl<S> Sweeper<S>
where
    S: PresenceStore + 'static,
{
    async fn run(self: Arc<Self>, interval: Duration) {
        let mut closed = self.state.closed_signal();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = closed.changed() => break,
                _ = ticker.tick() => {}
            }
            if self.state.is_closed() {
                break;
            }
            match self.sweep_once().await {
                Ok(report) if report.evicted > 0 || report.failed > 0 => {
                    debug!(
                        target: "presence.engine",
                        examined = report.examined,
                        evicted = report.evicted,
                        failed = report.failed,
                        "sweep_pass_finished"
                    );
                }
                Ok(_) => {}
                Err(err) => self.state.report(err),
            }
        }
        debug!(target: "presence.engine", instance_id = %self.instance_id, "sweep_stopped");
    }

    async fn sweep_once(&self) -> Result<SweepReport, PresenceError> {
        let now = now_ns();
        let count = self.store.set_card(self.keys.members()).await?;
        let mut report = SweepReport::default();
        for _ in 0..count {
            if self.state.is_closed() {
                break;
            }
            let Some(id) = self.store.set_pop(self.keys.members()).await? else {
                break;
            };
            report.examined += 1;
            match self.sweep_member(&id, now).await {
                Ok(outcome) => report.record(outcome),
                Err(err) => {
                    report.failed += 1;
                    self.state.report(PresenceError::sweep(&id, err));
                }
            }
        }
        record_sweep_pass();
        Ok(report)
    }

    async fn sweep_member(&self, id: &str, now: i64) -> Result<SweepOutcome, PresenceError> {
        let lock_key = self.keys.lock(id);
        let locked = match self
            .store
            .try_lock(&lock_key, &self.instance_id, self.lock_ttl_ms)
            .await
        {
            Ok(locked) => locked,
            Err(err) => {
                self.restore(id).await?;
                return Err(err.into());
            }
        };
        if !locked {
            // 其他实例正在处理该成员
            self.restore(id).await?;
            return Ok(SweepOutcome::Skipped);
        }
        let outcome = self.evaluate(id, now).await;
        if let Err(err) = self.store.unlock(&lock_key, &self.instance_id).await {
            self.state.report(PresenceError::sweep(id, err.into()));
        }
        outcome
    }

    async fn evaluate(&self, id: &str, now: i64) -> Result<SweepOutcome, PresenceError> {
        let key = self.keys.status(id);
        let fields = match self.read_metadata(&key).await {
            Ok(fields) => fields,
            Err(err) => {
                // 读取失败不能把在线记录留在集合之外
                self.restore(id).await?;
                return Err(err);
            }
        };
        let event = decode_metadata(id, &fields)?;
        if !event.status.is_online() {
            return Ok(SweepOutcome::Dropped);
        }
        let seen_at = event.seen_at_ns.unwrap_or(0);
        if now.saturating_sub(seen_at) <= self.inactive_ns {
            self.restore(id).await?;
            return Ok(SweepOutcome::Kept);
        }

        // 读取之后若有并发上线改写了 seenAt，条件写入失败，记录保持在线
        let observed = fields.get(SEEN_AT_FIELD).map(String::as_str).unwrap_or("");
        let written = self
            .store
            .hash_set_if_eq(
                &key,
                (SEEN_AT_FIELD, observed),
                STATUS_FIELD,
                Status::Offline.as_str(),
            )
            .await;
        match written {
            Ok(true) => {}
            Ok(false) => {
                debug!(target: "presence.engine", id = %id, "sweep_eviction_superseded");
                self.restore(id).await?;
                return Ok(SweepOutcome::Kept);
            }
            Err(err) => {
                self.restore(id).await?;
                return Err(err.into());
            }
        }

        record_sweep_eviction();
        info!(target: "presence.engine", id = %id, seen_at_ns = seen_at, "sweep_evicted");
        let evicted = match event.seen_at_ns {
            Some(seen_at) => Event::with_seen_at(id, Status::Offline, seen_at),
            None => Event::new(id, Status::Offline),
        };
        self.state.try_emit(evicted);
        Ok(SweepOutcome::Evicted)
    }

    async fn read_metadata(&self, key: &str) -> Result<HashMap<String, String>, PresenceError> {
        let replies = self.store.hash_get_all_many(&[key.to_string()]).await?;
        check_replies(1, &replies)?;
        match replies.into_iter().next() {
            Some(reply) => Ok(reply?),
            None => Err(PresenceError::ReplyMismatch {
                expected: 1,
                got: 0,
            }),
        }
    }

    async fn restore(&self, id: &str) -> Result<(), PresenceError> {
        self.store
            .set_add(self.keys.members(), &[id.to_string()])
            .await?;
        Ok(())
    }
}

/// 容错后端
///
/// 构造时启动清扫任务，`close()` 等待其退出。
pub struct FaultTolerantBackend<S> {
    store: Arc<S>,
    keys: FaultTolerantKeys,
    state: Arc<BackendState>,
    sweeper: Arc<Sweeper<S>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl FaultTolerantBackend<RedisPresenceStore> {
    /// 按配置连接 Redis。
    pub async fn connect(config: &PresenceConfig) -> Result<Self, PresenceError> {
        let store = RedisPresenceStore::connect(&config.redis_url, config.redis_db).await?;
        Ok(Self::new(Arc::new(store), config))
    }
}

impl<S> FaultTolerantBackend<S>
where
    S: PresenceStore + 'static,
{
    /// 需要在 tokio 运行时内调用（会启动清扫任务）。
    pub fn new(store: Arc<S>, config: &PresenceConfig) -> Self {
        let keys = FaultTolerantKeys::new(&config.fault_tolerant_prefix);
        let state = Arc::new(
            BackendState::new(config.event_buffer, config.error_buffer).with_event_channel(),
        );
        let instance_id = new_instance_id();
        let sweeper = Arc::new(Sweeper {
            store: store.clone(),
            keys: keys.clone(),
            state: state.clone(),
            inactive_ns: (config.inactive_ms as i64).saturating_mul(1_000_000),
            lock_ttl_ms: config.lock_ttl_ms,
            instance_id: instance_id.clone(),
        });
        let sweep_task = tokio::spawn(sweeper.clone().run(config.sweep_interval()));
        info!(
            target: "presence.engine",
            prefix = %config.fault_tolerant_prefix,
            instance_id = %instance_id,
            "fault_tolerant_backend_started"
        );
        Self {
            store,
            keys,
            state,
            sweeper,
            sweep_task: Mutex::new(Some(sweep_task)),
        }
    }

    pub fn keys(&self) -> &FaultTolerantKeys {
        &self.keys
    }

    /// 立即执行一次清扫（与后台任务互不干扰，依赖清扫锁互斥）。
    pub async fn sweep_now(&self) -> Result<SweepReport, PresenceError> {
        self.state.ensure_open()?;
        self.sweeper.sweep_once().await
    }

    async fn read_status(&self, ids: &[String]) -> Result<Vec<Event>, PresenceError> {
        let keys: Vec<String> = ids.iter().map(|id| self.keys.status(id)).collect();
        let replies = self.store.hash_get_all_many(&keys).await?;
        check_replies(ids.len(), &replies)?;

        let mut events = Vec::with_capacity(ids.len());
        let mut failures = BatchError::new();
        for (id, reply) in ids.iter().zip(replies) {
            let decoded = reply
                .map_err(PresenceError::from)
                .and_then(|fields| decode_metadata(id, &fields));
            match decoded {
                Ok(event) => events.push(event),
                Err(err) => {
                    failures.append(id.clone(), err);
                    events.push(Event::new(id.clone(), Status::Unknown));
                }
            }
        }
        if failures.is_empty() {
            return Ok(events);
        }
        Err(PresenceError::PartialStatus { events, failures })
    }

    /// 写入元数据，返回写入失败的 id。
    async fn write_metadata(
        &self,
        ids: &[String],
        status: Status,
        seen_at_ns: i64,
        failures: &mut BatchError,
    ) -> Result<HashSet<String>, PresenceError> {
        let entries: Vec<(String, Vec<(String, String)>)> = ids
            .iter()
            .map(|id| (self.keys.status(id), metadata_fields(status, seen_at_ns)))
            .collect();
        let replies = self.store.hash_set_many(&entries).await?;
        check_replies(ids.len(), &replies)?;
        let mut failed = HashSet::new();
        for (id, reply) in ids.iter().zip(replies) {
            if let Err(err) = reply {
                failed.insert(id.clone());
                failures.append(id.clone(), err);
            }
        }
        Ok(failed)
    }
}

#[async_trait]
impl<S> Backend for FaultTolerantBackend<S>
where
    S: PresenceStore + 'static,
{
    async fn online(&self, ids: &[String]) -> Result<(), PresenceError> {
        self.state.ensure_open()?;
        if ids.is_empty() {
            return Ok(());
        }
        record_online_call(ids.len());
        let now = now_ns();
        let (previous, mut failures) = match self.read_status(ids).await {
            Ok(events) => (events, BatchError::new()),
            Err(PresenceError::PartialStatus { events, failures }) => (events, failures),
            Err(err) => return Err(err),
        };

        // 先写集合：两步之间失败时，元数据非在线的成员会被清扫移除
        self.store.set_add(self.keys.members(), ids).await?;
        let failed = self
            .write_metadata(ids, Status::Online, now, &mut failures)
            .await?;

        // 只有确认此前离线才算变化；读取失败（Unknown）不上报，避免重复的上线事件
        let mut emitted = HashSet::new();
        for event in previous {
            if event.status != Status::Offline || failed.contains(&event.id) {
                continue;
            }
            if emitted.insert(event.id.clone()) {
                self.state
                    .try_emit(Event::with_seen_at(event.id, Status::Online, now));
            }
        }
        finish(failures)
    }

    async fn offline(&self, ids: &[String]) -> Result<(), PresenceError> {
        self.state.ensure_open()?;
        if ids.is_empty() {
            return Ok(());
        }
        record_offline_call(ids.len());
        let now = now_ns();
        let mut failures = BatchError::new();
        self.store.set_remove(self.keys.members(), ids).await?;
        self.write_metadata(ids, Status::Offline, now, &mut failures)
            .await?;
        for id in ids {
            self.state
                .try_emit(Event::with_seen_at(id.clone(), Status::Offline, now));
        }
        finish(failures)
    }

    async fn status(&self, ids: &[String]) -> Result<Vec<Event>, PresenceError> {
        self.state.ensure_open()?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        record_status_call(ids.len());
        match self.read_status(ids).await {
            Ok(events) => Ok(events),
            Err(PresenceError::PartialStatus { events, failures }) => {
                finish_status(events, failures)
            }
            Err(err) => Err(err),
        }
    }

    async fn close(&self) -> Result<(), PresenceError> {
        self.state.close()?;
        let task = self
            .sweep_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(target: "presence.engine", error = %err, "sweep_task_join_failed");
            }
        }
        info!(target: "presence.engine", members = %self.keys.members(), "fault_tolerant_backend_closed");
        Ok(())
    }

    fn errors(&self) -> Option<mpsc::Receiver<PresenceError>> {
        self.state.take_errors()
    }

    async fn listen_status_changes(&self) -> Result<mpsc::Receiver<Event>, PresenceError> {
        self.state.listen()
    }
}

impl<S> Drop for FaultTolerantBackend<S> {
    fn drop(&mut self) {
        // 未显式关闭时也要停止清扫
        let _ = self.state.close();
    }
}
