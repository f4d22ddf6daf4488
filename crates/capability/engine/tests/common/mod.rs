#![allow(dead_code)]

use async_trait::async_trait;
use presence_config::PresenceConfig;
use presence_engine::{Event, PresenceError};
use presence_storage::{
    BatchReply, InMemoryPresenceStore, NotificationReceiver, PresenceStore, StorageError,
};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn ids(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

pub fn config(inactive_ms: u64) -> PresenceConfig {
    PresenceConfig {
        inactive_ms,
        // 默认不自动清扫，测试中手动调用 sweep_now
        sweep_interval_ms: 3_600_000,
        ..PresenceConfig::default()
    }
}

pub async fn next_event(events: &mut mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event in time")
        .expect("channel open")
}

pub async fn next_error(errors: &mut mpsc::Receiver<PresenceError>) -> PresenceError {
    tokio::time::timeout(Duration::from_secs(2), errors.recv())
        .await
        .expect("error in time")
        .expect("channel open")
}

/// 订阅通道的故障方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionFault {
    /// 先送达一个存储错误再结束。
    Error,
    /// 直接结束，不带错误。
    End,
}

/// 可注入故障的存储：指定键逐个失败，或整体传输失败。
pub struct FlakyStore {
    pub inner: InMemoryPresenceStore,
    poisoned: Mutex<HashSet<String>>,
    down: AtomicBool,
    fail_reads: AtomicBool,
    subscription_fault: Mutex<Option<SubscriptionFault>>,
    /// 下一次读到该键后，模拟并发上线改写 `seenAt`。
    touch_after_read: Mutex<Option<(String, String)>>,
}

impl FlakyStore {
    pub fn new(inner: InMemoryPresenceStore) -> Self {
        Self {
            inner,
            poisoned: Mutex::new(HashSet::new()),
            down: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            subscription_fault: Mutex::new(None),
            touch_after_read: Mutex::new(None),
        }
    }

    /// 哈希读取逐键失败，写入不受影响。
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn break_subscription(&self, fault: SubscriptionFault) {
        *self.subscription_fault.lock().unwrap() = Some(fault);
    }

    pub fn touch_after_read(&self, key: &str, seen_at: &str) {
        *self.touch_after_read.lock().unwrap() = Some((key.to_string(), seen_at.to_string()));
    }

    pub fn poison(&self, key: &str) {
        self.poisoned.lock().unwrap().insert(key.to_string());
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::new("connection refused"));
        }
        Ok(())
    }

    fn mask<'a>(&self, keys: impl Iterator<Item = &'a String>) -> Vec<bool> {
        let poisoned = self.poisoned.lock().unwrap();
        keys.map(|key| poisoned.contains(key)).collect()
    }
}

fn merge<T>(mask: &[bool], healthy: BatchReply<T>) -> BatchReply<T> {
    let mut healthy = healthy.into_iter();
    mask.iter()
        .map(|bad| {
            if *bad {
                Err(StorageError::new("injected failure"))
            } else {
                healthy.next().unwrap()
            }
        })
        .collect()
}

fn keep<T: Clone>(mask: &[bool], items: &[T]) -> Vec<T> {
    items
        .iter()
        .zip(mask)
        .filter(|(_, bad)| !**bad)
        .map(|(item, _)| item.clone())
        .collect()
}

#[async_trait]
impl PresenceStore for FlakyStore {
    fn db(&self) -> i64 {
        self.inner.db()
    }

    async fn pexpire_many(
        &self,
        keys: &[String],
        ttl_ms: u64,
    ) -> Result<BatchReply<bool>, StorageError> {
        self.check()?;
        let mask = self.mask(keys.iter());
        let healthy = self.inner.pexpire_many(&keep(&mask, keys), ttl_ms).await?;
        Ok(merge(&mask, healthy))
    }

    async fn set_nx_px_many(
        &self,
        entries: &[(String, String)],
        ttl_ms: u64,
    ) -> Result<BatchReply<bool>, StorageError> {
        self.check()?;
        let mask = self.mask(entries.iter().map(|(key, _)| key));
        let healthy = self
            .inner
            .set_nx_px_many(&keep(&mask, entries), ttl_ms)
            .await?;
        Ok(merge(&mask, healthy))
    }

    async fn exists_many(&self, keys: &[String]) -> Result<BatchReply<bool>, StorageError> {
        self.check()?;
        let mask = self.mask(keys.iter());
        let healthy = self.inner.exists_many(&keep(&mask, keys)).await?;
        Ok(merge(&mask, healthy))
    }

    async fn set_add(&self, set: &str, members: &[String]) -> Result<u64, StorageError> {
        self.check()?;
        self.inner.set_add(set, members).await
    }

    async fn set_remove(&self, set: &str, members: &[String]) -> Result<u64, StorageError> {
        self.check()?;
        self.inner.set_remove(set, members).await
    }

    async fn set_pop(&self, set: &str) -> Result<Option<String>, StorageError> {
        self.check()?;
        self.inner.set_pop(set).await
    }

    async fn set_card(&self, set: &str) -> Result<u64, StorageError> {
        self.check()?;
        self.inner.set_card(set).await
    }

    async fn hash_set_many(
        &self,
        entries: &[(String, Vec<(String, String)>)],
    ) -> Result<BatchReply<()>, StorageError> {
        self.check()?;
        let mask = self.mask(entries.iter().map(|(key, _)| key));
        let healthy = self.inner.hash_set_many(&keep(&mask, entries)).await?;
        Ok(merge(&mask, healthy))
    }

    async fn hash_get_all_many(
        &self,
        keys: &[String],
    ) -> Result<BatchReply<HashMap<String, String>>, StorageError> {
        self.check()?;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Ok(keys
                .iter()
                .map(|_| Err(StorageError::new("injected read failure")))
                .collect());
        }
        let mask = self.mask(keys.iter());
        let healthy = self.inner.hash_get_all_many(&keep(&mask, keys)).await?;

        let touch = {
            let mut pending = self.touch_after_read.lock().unwrap();
            let hit = pending.as_ref().is_some_and(|(key, _)| keys.contains(key));
            if hit { pending.take() } else { None }
        };
        if let Some((key, seen_at)) = touch {
            self.inner
                .hash_set_many(&[(
                    key,
                    vec![
                        ("status".to_string(), "ONLINE".to_string()),
                        ("seenAt".to_string(), seen_at),
                    ],
                )])
                .await?;
        }
        Ok(merge(&mask, healthy))
    }

    async fn hash_set_if_eq(
        &self,
        key: &str,
        guard: (&str, &str),
        field: &str,
        value: &str,
    ) -> Result<bool, StorageError> {
        self.check()?;
        if self.poisoned.lock().unwrap().contains(key) {
            return Err(StorageError::new("injected failure"));
        }
        self.inner.hash_set_if_eq(key, guard, field, value).await
    }

    async fn try_lock(&self, key: &str, token: &str, ttl_ms: u64) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.try_lock(key, token, ttl_ms).await
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.unlock(key, token).await
    }

    async fn enable_key_notifications(&self) -> Result<(), StorageError> {
        self.check()?;
        self.inner.enable_key_notifications().await
    }

    async fn subscribe(&self, patterns: &[String]) -> Result<NotificationReceiver, StorageError> {
        self.check()?;
        let fault = *self.subscription_fault.lock().unwrap();
        match fault {
            None => self.inner.subscribe(patterns).await,
            Some(fault) => {
                let (tx, rx) = mpsc::channel(1);
                if fault == SubscriptionFault::Error {
                    tx.try_send(Err(StorageError::new("connection reset by peer")))
                        .unwrap();
                }
                Ok(rx)
            }
        }
    }
}
