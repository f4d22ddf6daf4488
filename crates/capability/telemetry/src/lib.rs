//! 追踪初始化、基础指标与实例 ID 生成。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 基础指标快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub online_calls: u64,
    pub offline_calls: u64,
    pub status_calls: u64,
    pub ids_processed: u64,
    pub batch_failures: u64,
    pub events_emitted: u64,
    pub events_dropped: u64,
    pub sweep_passes: u64,
    pub sweep_evictions: u64,
    pub async_errors: u64,
}

/// 基础指标（进程内累计值）。
pub struct TelemetryMetrics {
    online_calls: AtomicU64,
    offline_calls: AtomicU64,
    status_calls: AtomicU64,
    ids_processed: AtomicU64,
    batch_failures: AtomicU64,
    events_emitted: AtomicU64,
    events_dropped: AtomicU64,
    sweep_passes: AtomicU64,
    sweep_evictions: AtomicU64,
    async_errors: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            online_calls: AtomicU64::new(0),
            offline_calls: AtomicU64::new(0),
            status_calls: AtomicU64::new(0),
            ids_processed: AtomicU64::new(0),
            batch_failures: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            sweep_passes: AtomicU64::new(0),
            sweep_evictions: AtomicU64::new(0),
            async_errors: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            online_calls: self.online_calls.load(Ordering::Relaxed),
            offline_calls: self.offline_calls.load(Ordering::Relaxed),
            status_calls: self.status_calls.load(Ordering::Relaxed),
            ids_processed: self.ids_processed.load(Ordering::Relaxed),
            batch_failures: self.batch_failures.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            sweep_passes: self.sweep_passes.load(Ordering::Relaxed),
            sweep_evictions: self.sweep_evictions.load(Ordering::Relaxed),
            async_errors: self.async_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 生成新的后端实例 ID（用作清扫锁的持有者标识）。
pub fn new_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 记录 Online 调用及其标识数。
pub fn record_online_call(ids: usize) {
    let metrics = metrics();
    metrics.online_calls.fetch_add(1, Ordering::Relaxed);
    metrics
        .ids_processed
        .fetch_add(ids as u64, Ordering::Relaxed);
}

/// 记录 Offline 调用及其标识数。
pub fn record_offline_call(ids: usize) {
    let metrics = metrics();
    metrics.offline_calls.fetch_add(1, Ordering::Relaxed);
    metrics
        .ids_processed
        .fetch_add(ids as u64, Ordering::Relaxed);
}

/// 记录 Status 调用及其标识数。
pub fn record_status_call(ids: usize) {
    let metrics = metrics();
    metrics.status_calls.fetch_add(1, Ordering::Relaxed);
    metrics
        .ids_processed
        .fetch_add(ids as u64, Ordering::Relaxed);
}

/// 记录批量调用中的单标识失败数。
pub fn record_batch_failures(count: usize) {
    metrics()
        .batch_failures
        .fetch_add(count as u64, Ordering::Relaxed);
}

/// 记录成功投递的事件。
pub fn record_event_emitted() {
    metrics().events_emitted.fetch_add(1, Ordering::Relaxed);
}

/// 记录因通道已满/无人监听而丢弃的事件。
pub fn record_event_dropped() {
    metrics().events_dropped.fetch_add(1, Ordering::Relaxed);
}

/// 记录完成的清扫轮次。
pub fn record_sweep_pass() {
    metrics().sweep_passes.fetch_add(1, Ordering::Relaxed);
}

/// 记录被清扫淘汰为离线的标识。
pub fn record_sweep_eviction() {
    metrics().sweep_evictions.fetch_add(1, Ordering::Relaxed);
}

/// 记录异步错误（监听/清扫）。
pub fn record_async_error() {
    metrics().async_errors.fetch_add(1, Ordering::Relaxed);
}
