mod common;

use common::{FlakyStore, config, ids, next_error, next_event};
use presence_config::PresenceConfig;
use presence_engine::fault_tolerant::now_ns;
use presence_engine::{Backend, Event, FaultTolerantBackend, PresenceError, Status};
use presence_storage::{InMemoryPresenceStore, PresenceStore};
use std::sync::Arc;
use std::time::Duration;

type MemoryBackend = FaultTolerantBackend<InMemoryPresenceStore>;

fn backend_with(config: &PresenceConfig) -> (Arc<InMemoryPresenceStore>, MemoryBackend) {
    let store = Arc::new(InMemoryPresenceStore::new());
    let backend = FaultTolerantBackend::new(store.clone(), config);
    (store, backend)
}

fn statuses(events: &[Event]) -> Vec<Status> {
    events.iter().map(|event| event.status).collect()
}

#[tokio::test]
async fn online_writes_membership_and_metadata() {
    let (store, backend) = backend_with(&config(60_000));
    let batch = ids(&["u1", "u2"]);
    backend.online(&batch).await.expect("online");

    let events = backend.status(&batch).await.expect("status");
    assert_eq!(statuses(&events), vec![Status::Online; 2]);
    assert!(events.iter().all(|event| event.seen_at_ns.is_some()));

    let members = store.members("ftpp:online").expect("members");
    assert!(members.contains("u1") && members.contains("u2"));
}

#[tokio::test]
async fn offline_reports_offline_including_unseen() {
    let (store, backend) = backend_with(&config(60_000));
    backend.online(&ids(&["u1"])).await.expect("online");
    backend.offline(&ids(&["u1"])).await.expect("offline");

    let events = backend
        .status(&ids(&["u1", "never-seen"]))
        .await
        .expect("status");
    assert_eq!(statuses(&events), vec![Status::Offline, Status::Offline]);
    assert!(events[0].seen_at_ns.is_some());
    assert_eq!(events[1].seen_at_ns, None);
    assert!(store.members("ftpp:online").expect("members").is_empty());
}

#[tokio::test]
async fn online_and_offline_are_idempotent() {
    let (_store, backend) = backend_with(&config(60_000));
    let batch = ids(&["u1", "u2"]);
    backend.online(&batch).await.expect("online");
    backend.online(&batch).await.expect("online again");
    assert_eq!(
        statuses(&backend.status(&batch).await.expect("status")),
        vec![Status::Online; 2]
    );

    backend.offline(&batch).await.expect("offline");
    backend.offline(&batch).await.expect("offline again");
    assert_eq!(
        statuses(&backend.status(&batch).await.expect("status")),
        vec![Status::Offline; 2]
    );
}

#[tokio::test]
async fn status_preserves_request_order_for_mixed_batches() {
    let (_store, backend) = backend_with(&config(60_000));
    backend.online(&ids(&["a", "c"])).await.expect("online");

    let events = backend
        .status(&ids(&["c", "b", "a"]))
        .await
        .expect("status");
    let returned: Vec<&str> = events.iter().map(|event| event.id.as_str()).collect();
    assert_eq!(returned, vec!["c", "b", "a"]);
    assert_eq!(
        statuses(&events),
        vec![Status::Online, Status::Offline, Status::Online]
    );
}

#[tokio::test]
async fn online_emits_only_transitions() {
    let (_store, backend) = backend_with(&config(60_000));
    let mut events = backend.listen_status_changes().await.expect("listen");

    backend.online(&ids(&["u1"])).await.expect("online");
    backend.online(&ids(&["u1"])).await.expect("online again");
    let first = next_event(&mut events).await;
    assert_eq!(first.id, "u1");
    assert_eq!(first.status, Status::Online);
    assert!(first.seen_at_ns.is_some());
    assert!(events.try_recv().is_err());

    // 离线不做变化判断，每次都上报
    backend.offline(&ids(&["u1"])).await.expect("offline");
    backend.offline(&ids(&["u1"])).await.expect("offline again");
    assert_eq!(next_event(&mut events).await.status, Status::Offline);
    assert_eq!(next_event(&mut events).await.status, Status::Offline);
}

#[tokio::test]
async fn unreadable_prior_status_does_not_repeat_online() {
    let store = Arc::new(FlakyStore::new(InMemoryPresenceStore::new()));
    let backend = FaultTolerantBackend::new(store.clone(), &config(60_000));
    let mut events = backend.listen_status_changes().await.expect("listen");

    backend.online(&ids(&["u1"])).await.expect("online");
    assert_eq!(next_event(&mut events).await.status, Status::Online);

    // 读取失败时无法确认此前离线，不上报变化
    store.set_fail_reads(true);
    let err = backend
        .online(&ids(&["u1"]))
        .await
        .expect_err("read failure");
    assert!(err.failures().expect("failures").has("u1"));
    assert!(events.try_recv().is_err());

    // 心跳本身已写入
    store.set_fail_reads(false);
    assert_eq!(
        statuses(&backend.status(&ids(&["u1"])).await.expect("status")),
        vec![Status::Online]
    );
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn emission_never_blocks_without_listener() {
    let config = PresenceConfig {
        event_buffer: 2,
        ..config(60_000)
    };
    let (_store, backend) = backend_with(&config);
    let batch: Vec<String> = (0..10).map(|n| format!("u{n}")).collect();

    tokio::time::timeout(Duration::from_secs(1), backend.online(&batch))
        .await
        .expect("online does not block")
        .expect("online");
    tokio::time::timeout(Duration::from_secs(1), backend.offline(&batch))
        .await
        .expect("offline does not block")
        .expect("offline");

    // 缓冲只保留最早的两条，其余被丢弃
    let mut events = backend.listen_status_changes().await.expect("listen");
    assert_eq!(next_event(&mut events).await.status, Status::Online);
    assert_eq!(next_event(&mut events).await.status, Status::Online);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn background_sweep_evicts_silent_members() {
    let config = PresenceConfig {
        sweep_interval_ms: 20,
        ..config(100)
    };
    let (store, backend) = backend_with(&config);
    let mut events = backend.listen_status_changes().await.expect("listen");

    backend.online(&ids(&["u1"])).await.expect("online");
    let online = next_event(&mut events).await;
    assert_eq!(online.status, Status::Online);

    let evicted = next_event(&mut events).await;
    assert_eq!(evicted.id, "u1");
    assert_eq!(evicted.status, Status::Offline);
    // 淘汰事件携带最后一次在线时间
    assert_eq!(evicted.seen_at_ns, online.seen_at_ns);

    let status = backend.status(&ids(&["u1"])).await.expect("status");
    assert_eq!(status[0].status, Status::Offline);
    assert_eq!(status[0].seen_at_ns, online.seen_at_ns);
    assert!(!store.members("ftpp:online").expect("members").contains("u1"));
}

#[tokio::test]
async fn sweep_keeps_fresh_members() {
    let (store, backend) = backend_with(&config(60_000));
    backend.online(&ids(&["a", "b", "c"])).await.expect("online");

    let report = backend.sweep_now().await.expect("sweep");
    assert_eq!(report.examined, 3);
    assert_eq!(report.kept, 3);
    assert_eq!(report.evicted, 0);
    assert_eq!(store.members("ftpp:online").expect("members").len(), 3);
}

#[tokio::test]
async fn sweep_examines_every_member_once() {
    let (store, backend) = backend_with(&config(100));
    backend.online(&ids(&["fresh-1", "stale"])).await.expect("online");
    tokio::time::sleep(Duration::from_millis(200)).await;
    backend.online(&ids(&["fresh-1", "fresh-2"])).await.expect("refresh");

    let report = backend.sweep_now().await.expect("sweep");
    assert_eq!(report.examined, 3);
    assert_eq!(report.kept, 2);
    assert_eq!(report.evicted, 1);

    let members = store.members("ftpp:online").expect("members");
    assert!(!members.contains("stale"));
    assert_eq!(members.len(), 2);
}

#[tokio::test]
async fn sweep_keeps_members_refreshed_after_the_read() {
    let store = Arc::new(FlakyStore::new(InMemoryPresenceStore::new()));
    let backend = FaultTolerantBackend::new(store.clone(), &config(100));
    let mut events = backend.listen_status_changes().await.expect("listen");
    backend.online(&ids(&["u1"])).await.expect("online");
    assert_eq!(next_event(&mut events).await.status, Status::Online);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // 清扫读到过期记录后，并发心跳改写了 seenAt
    let refreshed = now_ns();
    store.touch_after_read("ftpp:status:u1", &refreshed.to_string());

    let report = backend.sweep_now().await.expect("sweep");
    assert_eq!(report.examined, 1);
    assert_eq!(report.kept, 1);
    assert_eq!(report.evicted, 0);
    assert!(events.try_recv().is_err());

    let status = backend.status(&ids(&["u1"])).await.expect("status");
    assert_eq!(status[0].status, Status::Online);
    assert_eq!(status[0].seen_at_ns, Some(refreshed));
    assert!(
        store
            .inner
            .members("ftpp:online")
            .expect("members")
            .contains("u1")
    );

    // 之后一直静默，下一轮照常淘汰
    tokio::time::sleep(Duration::from_millis(200)).await;
    let report = backend.sweep_now().await.expect("sweep");
    assert_eq!(report.evicted, 1);
    let evicted = next_event(&mut events).await;
    assert_eq!(evicted.status, Status::Offline);
    assert_eq!(evicted.seen_at_ns, Some(refreshed));
}

#[tokio::test]
async fn sweep_repairs_members_without_online_metadata() {
    let (store, backend) = backend_with(&config(60_000));
    let mut events = backend.listen_status_changes().await.expect("listen");
    store
        .set_add("ftpp:online", &ids(&["ghost"]))
        .await
        .expect("sadd");

    let report = backend.sweep_now().await.expect("sweep");
    assert_eq!(report.dropped, 1);
    assert!(store.members("ftpp:online").expect("members").is_empty());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn sweep_skips_members_locked_by_another_instance() {
    let (store, backend) = backend_with(&config(1));
    // 先占锁，后台清扫的首轮也只能跳过该成员
    assert!(
        store
            .try_lock("ftpp:lock:u1", "other-instance", 10_000)
            .await
            .expect("lock")
    );
    backend.online(&ids(&["u1"])).await.expect("online");
    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = backend.sweep_now().await.expect("sweep");
    assert_eq!(report.skipped, 1);
    assert_eq!(report.evicted, 0);
    assert!(store.members("ftpp:online").expect("members").contains("u1"));

    assert!(
        store
            .unlock("ftpp:lock:u1", "other-instance")
            .await
            .expect("unlock")
    );
    let report = backend.sweep_now().await.expect("sweep");
    assert_eq!(report.evicted, 1);
    // 本实例释放了自己的锁
    assert_eq!(store.get_text("ftpp:lock:u1").expect("get"), None);
}

#[tokio::test]
async fn sweep_read_failure_keeps_member_and_reports() {
    let store = Arc::new(FlakyStore::new(InMemoryPresenceStore::new()));
    let backend = FaultTolerantBackend::new(store.clone(), &config(60_000));
    let mut errors = backend.errors().expect("errors");
    backend.online(&ids(&["u1"])).await.expect("online");
    store.poison("ftpp:status:u1");

    let report = backend.sweep_now().await.expect("sweep");
    assert_eq!(report.failed, 1);
    assert!(
        store
            .inner
            .members("ftpp:online")
            .expect("members")
            .contains("u1")
    );
    match next_error(&mut errors).await {
        PresenceError::Sweep { id, .. } => assert_eq!(id, "u1"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn malformed_metadata_is_a_per_id_failure() {
    let (store, backend) = backend_with(&config(60_000));
    backend.online(&ids(&["ok"])).await.expect("online");
    store.insert_text("ftpp:status:wrong-type", "x").expect("insert");
    store
        .hash_set_many(&[(
            "ftpp:status:bad-token".to_string(),
            vec![("status".to_string(), "AWAY".to_string())],
        )])
        .await
        .expect("hset");

    let err = backend
        .status(&ids(&["ok", "wrong-type", "bad-token"]))
        .await
        .expect_err("partial status");
    let failures = err.failures().expect("failures");
    assert_eq!(failures.len(), 2);
    assert!(failures.has("wrong-type") && failures.has("bad-token"));
    assert_eq!(
        statuses(err.partial_events().expect("events")),
        vec![Status::Online, Status::Unknown, Status::Unknown]
    );
}

#[tokio::test]
async fn online_with_unreadable_metadata_still_applies_other_ids() {
    let (store, backend) = backend_with(&config(60_000));
    store.insert_text("ftpp:status:broken", "x").expect("insert");

    let err = backend
        .online(&ids(&["fine", "broken"]))
        .await
        .expect_err("partial failure");
    let failures = err.failures().expect("failures");
    assert!(failures.has("broken"));
    assert!(!failures.has("fine"));
    assert_eq!(
        statuses(&backend.status(&ids(&["fine"])).await.expect("status")),
        vec![Status::Online]
    );
}

#[tokio::test]
async fn close_stops_sweep_and_closes_channels() {
    let config = PresenceConfig {
        sweep_interval_ms: 10,
        ..config(60_000)
    };
    let (_store, backend) = backend_with(&config);
    let mut events = backend.listen_status_changes().await.expect("listen");
    backend.online(&ids(&["u1"])).await.expect("online");
    assert_eq!(next_event(&mut events).await.status, Status::Online);

    tokio::time::timeout(Duration::from_secs(1), backend.close())
        .await
        .expect("close is bounded")
        .expect("close");
    assert!(events.recv().await.is_none());

    assert!(matches!(
        backend.close().await,
        Err(PresenceError::AlreadyClosed)
    ));
    assert!(matches!(
        backend.online(&ids(&["u1"])).await,
        Err(PresenceError::Closed)
    ));
    assert!(matches!(
        backend.status(&ids(&["u1"])).await,
        Err(PresenceError::Closed)
    ));
    assert!(matches!(backend.sweep_now().await, Err(PresenceError::Closed)));
    assert!(matches!(
        backend.listen_status_changes().await,
        Err(PresenceError::Closed)
    ));
}
