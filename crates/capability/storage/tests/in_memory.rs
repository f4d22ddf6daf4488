use presence_storage::{InMemoryPresenceStore, PresenceStore, keyevent_channel};
use std::time::Duration;

fn keys(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn flags(replies: Vec<Result<bool, presence_storage::StorageError>>) -> Vec<bool> {
    replies
        .into_iter()
        .map(|reply| reply.expect("per-key reply"))
        .collect()
}

#[tokio::test]
async fn pexpire_reports_existence_and_keeps_order() {
    let store = InMemoryPresenceStore::new();
    store
        .set_nx_px_many(&[("k2".to_string(), "v".to_string())], 10_000)
        .await
        .expect("set");

    let replies = store
        .pexpire_many(&keys(&["k1", "k2", "k3"]), 5_000)
        .await
        .expect("pexpire");
    assert_eq!(flags(replies), vec![false, true, false]);

    let ttl = store.ttl("k2").expect("ttl").expect("exists").expect("has ttl");
    assert!(ttl <= Duration::from_millis(5_000));
}

#[tokio::test]
async fn set_nx_never_overwrites() {
    let store = InMemoryPresenceStore::new();
    let first = store
        .set_nx_px_many(&[("k".to_string(), "first".to_string())], 10_000)
        .await
        .expect("set");
    let second = store
        .set_nx_px_many(&[("k".to_string(), "second".to_string())], 10_000)
        .await
        .expect("set");

    assert_eq!(flags(first), vec![true]);
    assert_eq!(flags(second), vec![false]);
    assert_eq!(store.get_text("k").expect("get").as_deref(), Some("first"));
}

#[tokio::test]
async fn keys_expire_after_ttl() {
    let store = InMemoryPresenceStore::new();
    store
        .set_nx_px_many(&[("k".to_string(), "v".to_string())], 50)
        .await
        .expect("set");
    assert_eq!(flags(store.exists_many(&keys(&["k"])).await.expect("exists")), vec![true]);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(flags(store.exists_many(&keys(&["k"])).await.expect("exists")), vec![false]);
}

#[tokio::test]
async fn pexpire_zero_deletes() {
    let store = InMemoryPresenceStore::new();
    store
        .set_nx_px_many(&[("k".to_string(), "v".to_string())], 10_000)
        .await
        .expect("set");
    let replies = store.pexpire_many(&keys(&["k"]), 0).await.expect("pexpire");
    assert_eq!(flags(replies), vec![true]);
    assert_eq!(flags(store.exists_many(&keys(&["k"])).await.expect("exists")), vec![false]);
}

#[tokio::test]
async fn set_operations_behave_like_redis() {
    let store = InMemoryPresenceStore::new();
    let added = store
        .set_add("online", &keys(&["a", "b", "a"]))
        .await
        .expect("sadd");
    assert_eq!(added, 2);
    assert_eq!(store.set_card("online").await.expect("scard"), 2);

    let removed = store
        .set_remove("online", &keys(&["a", "missing"]))
        .await
        .expect("srem");
    assert_eq!(removed, 1);

    let popped = store.set_pop("online").await.expect("spop");
    assert_eq!(popped.as_deref(), Some("b"));
    assert_eq!(store.set_pop("online").await.expect("spop"), None);
    assert_eq!(store.set_card("online").await.expect("scard"), 0);
}

#[tokio::test]
async fn hash_reads_report_wrong_type_per_key() {
    let store = InMemoryPresenceStore::new();
    store.insert_text("text", "value").expect("insert");
    let writes = store
        .hash_set_many(&[
            (
                "meta".to_string(),
                vec![("status".to_string(), "ONLINE".to_string())],
            ),
            (
                "text".to_string(),
                vec![("status".to_string(), "ONLINE".to_string())],
            ),
        ])
        .await
        .expect("hset");
    assert!(writes[0].is_ok());
    assert!(writes[1].is_err());

    let replies = store
        .hash_get_all_many(&keys(&["meta", "text", "absent"]))
        .await
        .expect("hgetall");
    assert_eq!(replies.len(), 3);
    let meta = replies[0].as_ref().expect("meta");
    assert_eq!(meta.get("status").map(String::as_str), Some("ONLINE"));
    let err = replies[1].as_ref().expect_err("wrong type");
    assert!(err.to_string().starts_with("WRONGTYPE"));
    assert!(replies[2].as_ref().expect("absent").is_empty());
}

#[tokio::test]
async fn conditional_hash_write_checks_the_guard_field() {
    let store = InMemoryPresenceStore::new();
    store
        .hash_set_many(&[(
            "meta".to_string(),
            vec![
                ("status".to_string(), "ONLINE".to_string()),
                ("seenAt".to_string(), "100".to_string()),
            ],
        )])
        .await
        .expect("hset");

    // 守护字段已被改写，不能覆盖
    assert!(
        !store
            .hash_set_if_eq("meta", ("seenAt", "99"), "status", "OFFLINE")
            .await
            .expect("cas")
    );
    assert!(
        store
            .hash_set_if_eq("meta", ("seenAt", "100"), "status", "OFFLINE")
            .await
            .expect("cas")
    );
    let replies = store
        .hash_get_all_many(&keys(&["meta"]))
        .await
        .expect("hgetall");
    let meta = replies[0].as_ref().expect("meta");
    assert_eq!(meta.get("status").map(String::as_str), Some("OFFLINE"));
    assert_eq!(meta.get("seenAt").map(String::as_str), Some("100"));

    // 缺失字段按空串比较
    assert!(
        store
            .hash_set_if_eq("absent", ("seenAt", ""), "status", "OFFLINE")
            .await
            .expect("cas")
    );
    assert!(
        !store
            .hash_set_if_eq("other", ("seenAt", "1"), "status", "OFFLINE")
            .await
            .expect("cas")
    );

    store.insert_text("text", "value").expect("insert");
    assert!(
        store
            .hash_set_if_eq("text", ("seenAt", ""), "status", "OFFLINE")
            .await
            .is_err()
    );
}

#[tokio::test]
async fn lock_is_exclusive_and_owner_checked() {
    let store = InMemoryPresenceStore::new();
    assert!(store.try_lock("lock:a", "owner-1", 1_000).await.expect("lock"));
    assert!(!store.try_lock("lock:a", "owner-2", 1_000).await.expect("lock"));

    assert!(!store.unlock("lock:a", "owner-2").await.expect("unlock"));
    assert!(store.unlock("lock:a", "owner-1").await.expect("unlock"));
    assert!(store.try_lock("lock:a", "owner-2", 1_000).await.expect("lock"));
}

#[tokio::test]
async fn subscription_delivers_matching_key_events() {
    let store = InMemoryPresenceStore::with_db(3);
    let set_channel = keyevent_channel(3, "set");
    let expired_channel = keyevent_channel(3, "expired");
    let mut notifications = store
        .subscribe(&[set_channel.clone(), expired_channel.clone()])
        .await
        .expect("subscribe");

    store
        .set_nx_px_many(&[("presence:u1".to_string(), "u1".to_string())], 30)
        .await
        .expect("set");

    let created = tokio::time::timeout(Duration::from_secs(1), notifications.recv())
        .await
        .expect("created in time")
        .expect("open")
        .expect("ok");
    assert_eq!(created.pattern, set_channel);
    assert_eq!(created.payload, b"presence:u1".to_vec());

    let expired = tokio::time::timeout(Duration::from_secs(1), notifications.recv())
        .await
        .expect("expired in time")
        .expect("open")
        .expect("ok");
    assert_eq!(expired.pattern, expired_channel);
    assert_eq!(expired.channel, "__keyevent@3__:expired");
    assert_eq!(expired.payload, b"presence:u1".to_vec());
}
