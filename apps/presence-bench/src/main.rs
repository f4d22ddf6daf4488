//! 在线状态压测客户端：批量上线与批量查询并发执行，状态变化以 JSON 行输出。

use presence_config::PresenceConfig;
use presence_engine::{Event, Session};
use presence_telemetry::{MetricsSnapshot, init_tracing, metrics};
use serde::Serialize;
use std::env;
use std::error::Error;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// 压测范围与批大小（`BENCH_*` 环境变量）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BenchConfig {
    start: u64,
    end: u64,
    batch: usize,
}

impl BenchConfig {
    fn from_env() -> Result<Self, Box<dyn Error>> {
        let config = Self {
            start: read_env("BENCH_START", 1)?,
            end: read_env("BENCH_END", 30_000)?,
            batch: read_env("BENCH_BATCH", 1_500)?,
        };
        if config.batch == 0 || config.start > config.end {
            return Err(format!("invalid bench range: {:?}", config).into());
        }
        Ok(config)
    }
}

fn read_env<T: FromStr>(key: &str, default: T) -> Result<T, Box<dyn Error>> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| format!("invalid value for {}: {}", key, value).into()),
        Err(_) => Ok(default),
    }
}

/// 把 `[start, end]` 切成批次，最后一批可能不足 `size`。
fn batches(start: u64, end: u64, size: usize) -> Vec<Vec<String>> {
    let ids: Vec<String> = (start..=end).map(|id| id.to_string()).collect();
    ids.chunks(size.max(1)).map(|chunk| chunk.to_vec()).collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventLine<'a> {
    kind: &'static str,
    id: &'a str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    seen_at_ns: Option<i64>,
}

impl<'a> From<&'a Event> for EventLine<'a> {
    fn from(event: &'a Event) -> Self {
        Self {
            kind: "event",
            id: &event.id,
            status: event.status.as_str(),
            seen_at_ns: event.seen_at_ns,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
struct LoopStats {
    batches: u64,
    failed: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsDto {
    online_calls: u64,
    offline_calls: u64,
    status_calls: u64,
    ids_processed: u64,
    batch_failures: u64,
    events_emitted: u64,
    events_dropped: u64,
    sweep_passes: u64,
    sweep_evictions: u64,
    async_errors: u64,
}

impl From<MetricsSnapshot> for MetricsDto {
    fn from(snapshot: MetricsSnapshot) -> Self {
        Self {
            online_calls: snapshot.online_calls,
            offline_calls: snapshot.offline_calls,
            status_calls: snapshot.status_calls,
            ids_processed: snapshot.ids_processed,
            batch_failures: snapshot.batch_failures,
            events_emitted: snapshot.events_emitted,
            events_dropped: snapshot.events_dropped,
            sweep_passes: snapshot.sweep_passes,
            sweep_evictions: snapshot.sweep_evictions,
            async_errors: snapshot.async_errors,
        }
    }
}

async fn ping(session: Session, batches: Arc<Vec<Vec<String>>>) -> LoopStats {
    let mut stats = LoopStats::default();
    for batch in batches.iter() {
        stats.batches += 1;
        if let Err(err) = session.online(batch).await {
            stats.failed += 1;
            warn!(target: "presence.bench", error = %err, size = batch.len(), "online_failed");
        }
    }
    stats
}

async fn query(session: Session, batches: Arc<Vec<Vec<String>>>) -> LoopStats {
    let mut stats = LoopStats::default();
    for batch in batches.iter() {
        stats.batches += 1;
        if let Err(err) = session.status(batch).await {
            stats.failed += 1;
            warn!(target: "presence.bench", error = %err, size = batch.len(), "status_failed");
        }
    }
    stats
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // 加载本地 .env（如存在）
    dotenvy::dotenv().ok();
    let config = PresenceConfig::from_env()?;
    let bench = BenchConfig::from_env()?;
    init_tracing();

    let session = presence_engine::connect(&config).await?;
    info!(
        target: "presence.bench",
        start = bench.start,
        end = bench.end,
        batch = bench.batch,
        "bench_started"
    );

    // 状态变化逐行输出
    let mut events = session.listen_status_changes().await?;
    let printer = tokio::spawn(async move {
        let mut printed = 0u64;
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&EventLine::from(&event)) {
                Ok(line) => println!("{}", line),
                Err(err) => warn!(target: "presence.bench", error = %err, "event_encode_failed"),
            }
            printed += 1;
        }
        printed
    });
    // 异步错误已由引擎记录日志，这里只需排空通道
    if let Some(mut errors) = session.errors() {
        tokio::spawn(async move { while errors.recv().await.is_some() {} });
    }

    let batches = Arc::new(batches(bench.start, bench.end, bench.batch));
    let started = Instant::now();
    let pinger = tokio::spawn(ping(session.clone(), batches.clone()));
    let querier = tokio::spawn(query(session.clone(), batches));
    let online = pinger.await?;
    let status = querier.await?;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    session.close().await?;
    let printed = printer.await?;

    let summary = serde_json::json!({
        "kind": "summary",
        "elapsedMs": elapsed_ms,
        "online": online,
        "status": status,
        "eventsPrinted": printed,
        "metrics": MetricsDto::from(metrics().snapshot()),
    });
    println!("{}", summary);
    Ok(())
}
