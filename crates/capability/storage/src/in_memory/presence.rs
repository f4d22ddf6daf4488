//! 在线状态内存实现（用于测试与单进程部署）。
//!
//! 按 Redis 语义模拟所需命令：字符串/哈希/集合三类值、毫秒级过期、
//! WRONGTYPE 错误，以及 `__keyevent@<db>__:<event>` 形式的键事件通知。

use crate::error::StorageError;
use crate::traits::{
    BatchReply, KeyNotification, NotificationReceiver, PresenceStore, keyevent_channel,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
const EVENT_BUFFER: usize = 1024;
const NOTIFICATION_BUFFER: usize = 256;
const REAPER_TICK: Duration = Duration::from_millis(5);

enum Value {
    Text(String),
    Hash(HashMap<String, String>),
    Members(MemberSet),
}

/// 集合值：SPOP 按加入顺序弹出，重新加入的成员排到队尾。
#[derive(Default)]
struct MemberSet {
    order: VecDeque<String>,
    index: HashSet<String>,
}

impl MemberSet {
    fn insert(&mut self, member: &str) -> bool {
        if !self.index.insert(member.to_string()) {
            return false;
        }
        self.order.push_back(member.to_string());
        true
    }

    fn remove(&mut self, member: &str) -> bool {
        if !self.index.remove(member) {
            return false;
        }
        self.order.retain(|current| current != member);
        true
    }

    fn pop(&mut self) -> Option<String> {
        let member = self.order.pop_front()?;
        self.index.remove(&member);
        Some(member)
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone)]
struct KeyEvent {
    event: &'static str,
    key: String,
}

struct Inner {
    db: i64,
    entries: RwLock<HashMap<String, Slot>>,
    events: broadcast::Sender<KeyEvent>,
    reaper_started: AtomicBool,
}

impl Inner {
    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Slot>>, StorageError> {
        self.entries
            .read()
            .map_err(|_| StorageError::new("lock failed"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Slot>>, StorageError> {
        self.entries
            .write()
            .map_err(|_| StorageError::new("lock failed"))
    }

    fn publish(&self, pending: Vec<KeyEvent>) {
        for event in pending {
            // 没有订阅者时发送失败，直接忽略
            let _ = self.events.send(event);
        }
    }

    /// 主动回收所有已过期键并发出 `expired` 通知。
    fn purge_expired(&self) -> Result<(), StorageError> {
        let now = Instant::now();
        let mut pending = Vec::new();
        {
            let mut entries = self.write()?;
            entries.retain(|key, slot| {
                if slot.is_expired(now) {
                    pending.push(KeyEvent {
                        event: "expired",
                        key: key.clone(),
                    });
                    false
                } else {
                    true
                }
            });
        }
        self.publish(pending);
        Ok(())
    }
}

/// 惰性过期：访问前先移除已过期的键。
fn expire_if_due(
    entries: &mut HashMap<String, Slot>,
    key: &str,
    now: Instant,
    pending: &mut Vec<KeyEvent>,
) {
    if entries.get(key).is_some_and(|slot| slot.is_expired(now)) {
        entries.remove(key);
        pending.push(KeyEvent {
            event: "expired",
            key: key.to_string(),
        });
    }
}

fn live<'a>(entries: &'a HashMap<String, Slot>, key: &str, now: Instant) -> Option<&'a Slot> {
    entries.get(key).filter(|slot| !slot.is_expired(now))
}

fn event(event: &'static str, key: &str) -> KeyEvent {
    KeyEvent {
        event,
        key: key.to_string(),
    }
}

/// 简单 glob 匹配（支持 `*` 与 `?`），与 PSUBSCRIBE 的常用子集一致。
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

/// 内存在线状态存储
///
/// 克隆后共享同一份数据。
#[derive(Clone)]
pub struct InMemoryPresenceStore {
    inner: Arc<Inner>,
}

impl InMemoryPresenceStore {
    pub fn new() -> Self {
        Self::with_db(0)
    }

    pub fn with_db(db: i64) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                db,
                entries: RwLock::new(HashMap::new()),
                events,
                reaper_started: AtomicBool::new(false),
            }),
        }
    }

    /// 直接写入一个字符串键（测试中用于构造异常数据）。
    pub fn insert_text(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.inner.write()?;
        entries.insert(key.to_string(), Slot::new(Value::Text(value.to_string())));
        Ok(())
    }

    /// 剩余存活时间；键不存在返回 `None`，无过期时间返回 `Some(None)`。
    pub fn ttl(&self, key: &str) -> Result<Option<Option<Duration>>, StorageError> {
        let now = Instant::now();
        let entries = self.inner.read()?;
        Ok(live(&entries, key, now)
            .map(|slot| slot.expires_at.map(|at| at.saturating_duration_since(now))))
    }

    /// 读取字符串键的值。
    pub fn get_text(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        let entries = self.inner.read()?;
        match live(&entries, key, now).map(|slot| &slot.value) {
            None => Ok(None),
            Some(Value::Text(value)) => Ok(Some(value.clone())),
            Some(_) => Err(StorageError::new(WRONGTYPE)),
        }
    }

    /// 读取集合全部成员。
    pub fn members(&self, set: &str) -> Result<HashSet<String>, StorageError> {
        let now = Instant::now();
        let entries = self.inner.read()?;
        match live(&entries, set, now).map(|slot| &slot.value) {
            None => Ok(HashSet::new()),
            Some(Value::Members(members)) => Ok(members.index.clone()),
            Some(_) => Err(StorageError::new(WRONGTYPE)),
        }
    }

    fn ensure_reaper(&self) {
        if self.inner.reaper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REAPER_TICK).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Err(err) = inner.purge_expired() {
                    warn!(target: "presence.storage", error = %err, "in_memory_reaper_failed");
                }
            }
        });
    }
}

impl Default for InMemoryPresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PresenceStore for InMemoryPresenceStore {
    fn db(&self) -> i64 {
        self.inner.db
    }

    async fn pexpire_many(
        &self,
        keys: &[String],
        ttl_ms: u64,
    ) -> Result<BatchReply<bool>, StorageError> {
        let now = Instant::now();
        let mut pending = Vec::new();
        let mut replies = Vec::with_capacity(keys.len());
        {
            let mut entries = self.inner.write()?;
            for key in keys {
                expire_if_due(&mut entries, key, now, &mut pending);
                if !entries.contains_key(key) {
                    replies.push(Ok(false));
                    continue;
                }
                if ttl_ms == 0 {
                    entries.remove(key);
                    pending.push(event("del", key));
                } else if let Some(slot) = entries.get_mut(key) {
                    slot.expires_at = Some(now + Duration::from_millis(ttl_ms));
                    pending.push(event("expire", key));
                }
                replies.push(Ok(true));
            }
        }
        self.inner.publish(pending);
        Ok(replies)
    }

    async fn set_nx_px_many(
        &self,
        entries_to_set: &[(String, String)],
        ttl_ms: u64,
    ) -> Result<BatchReply<bool>, StorageError> {
        let now = Instant::now();
        let mut pending = Vec::new();
        let mut replies = Vec::with_capacity(entries_to_set.len());
        {
            let mut entries = self.inner.write()?;
            for (key, value) in entries_to_set {
                expire_if_due(&mut entries, key, now, &mut pending);
                if entries.contains_key(key) {
                    replies.push(Ok(false));
                    continue;
                }
                let mut slot = Slot::new(Value::Text(value.clone()));
                slot.expires_at = Some(now + Duration::from_millis(ttl_ms));
                entries.insert(key.clone(), slot);
                pending.push(event("set", key));
                replies.push(Ok(true));
            }
        }
        self.inner.publish(pending);
        Ok(replies)
    }

    async fn exists_many(&self, keys: &[String]) -> Result<BatchReply<bool>, StorageError> {
        let now = Instant::now();
        let entries = self.inner.read()?;
        Ok(keys
            .iter()
            .map(|key| Ok(live(&entries, key, now).is_some()))
            .collect())
    }

    async fn set_add(&self, set: &str, members: &[String]) -> Result<u64, StorageError> {
        if members.is_empty() {
            return Ok(0);
        }
        let now = Instant::now();
        let mut pending = Vec::new();
        let added = {
            let mut entries = self.inner.write()?;
            expire_if_due(&mut entries, set, now, &mut pending);
            let slot = entries
                .entry(set.to_string())
                .or_insert_with(|| Slot::new(Value::Members(MemberSet::default())));
            let Value::Members(current) = &mut slot.value else {
                return Err(StorageError::new(WRONGTYPE));
            };
            let mut added = 0;
            for member in members {
                if current.insert(member) {
                    added += 1;
                }
            }
            added
        };
        if added > 0 {
            pending.push(event("sadd", set));
        }
        self.inner.publish(pending);
        Ok(added)
    }

    async fn set_remove(&self, set: &str, members: &[String]) -> Result<u64, StorageError> {
        let now = Instant::now();
        let mut pending = Vec::new();
        let removed = {
            let mut entries = self.inner.write()?;
            expire_if_due(&mut entries, set, now, &mut pending);
            let Some(slot) = entries.get_mut(set) else {
                drop(entries);
                self.inner.publish(pending);
                return Ok(0);
            };
            let Value::Members(current) = &mut slot.value else {
                return Err(StorageError::new(WRONGTYPE));
            };
            let mut removed = 0;
            for member in members {
                if current.remove(member) {
                    removed += 1;
                }
            }
            if current.is_empty() {
                entries.remove(set);
            }
            removed
        };
        if removed > 0 {
            pending.push(event("srem", set));
        }
        self.inner.publish(pending);
        Ok(removed)
    }

    async fn set_pop(&self, set: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        let mut pending = Vec::new();
        let popped = {
            let mut entries = self.inner.write()?;
            expire_if_due(&mut entries, set, now, &mut pending);
            match entries.get_mut(set) {
                None => None,
                Some(slot) => {
                    let Value::Members(current) = &mut slot.value else {
                        return Err(StorageError::new(WRONGTYPE));
                    };
                    let member = current.pop();
                    if current.is_empty() {
                        entries.remove(set);
                    }
                    member
                }
            }
        };
        if popped.is_some() {
            pending.push(event("spop", set));
        }
        self.inner.publish(pending);
        Ok(popped)
    }

    async fn set_card(&self, set: &str) -> Result<u64, StorageError> {
        let now = Instant::now();
        let entries = self.inner.read()?;
        match live(&entries, set, now).map(|slot| &slot.value) {
            None => Ok(0),
            Some(Value::Members(current)) => Ok(current.len() as u64),
            Some(_) => Err(StorageError::new(WRONGTYPE)),
        }
    }

    async fn hash_set_many(
        &self,
        entries_to_set: &[(String, Vec<(String, String)>)],
    ) -> Result<BatchReply<()>, StorageError> {
        let now = Instant::now();
        let mut pending = Vec::new();
        let mut replies = Vec::with_capacity(entries_to_set.len());
        {
            let mut entries = self.inner.write()?;
            for (key, fields) in entries_to_set {
                expire_if_due(&mut entries, key, now, &mut pending);
                let slot = entries
                    .entry(key.clone())
                    .or_insert_with(|| Slot::new(Value::Hash(HashMap::new())));
                match &mut slot.value {
                    Value::Hash(current) => {
                        for (field, value) in fields {
                            current.insert(field.clone(), value.clone());
                        }
                        pending.push(event("hset", key));
                        replies.push(Ok(()));
                    }
                    _ => replies.push(Err(StorageError::new(WRONGTYPE))),
                }
            }
        }
        self.inner.publish(pending);
        Ok(replies)
    }

    async fn hash_get_all_many(
        &self,
        keys: &[String],
    ) -> Result<BatchReply<HashMap<String, String>>, StorageError> {
        let now = Instant::now();
        let entries = self.inner.read()?;
        Ok(keys
            .iter()
            .map(|key| match live(&entries, key, now).map(|slot| &slot.value) {
                None => Ok(HashMap::new()),
                Some(Value::Hash(fields)) => Ok(fields.clone()),
                Some(_) => Err(StorageError::new(WRONGTYPE)),
            })
            .collect())
    }

    async fn hash_set_if_eq(
        &self,
        key: &str,
        guard: (&str, &str),
        field: &str,
        value: &str,
    ) -> Result<bool, StorageError> {
        let now = Instant::now();
        let mut pending = Vec::new();
        let written = {
            let mut entries = self.inner.write()?;
            expire_if_due(&mut entries, key, now, &mut pending);
            match entries.get_mut(key).map(|slot| &mut slot.value) {
                Some(Value::Hash(fields)) => {
                    let current = fields.get(guard.0).map(String::as_str).unwrap_or("");
                    if current == guard.1 {
                        fields.insert(field.to_string(), value.to_string());
                        pending.push(event("hset", key));
                        true
                    } else {
                        false
                    }
                }
                Some(_) => return Err(StorageError::new(WRONGTYPE)),
                None => {
                    // 与 Redis 一致：不存在的哈希视为空表
                    if guard.1.is_empty() {
                        let mut fields = HashMap::new();
                        fields.insert(field.to_string(), value.to_string());
                        entries.insert(key.to_string(), Slot::new(Value::Hash(fields)));
                        pending.push(event("hset", key));
                        true
                    } else {
                        false
                    }
                }
            }
        };
        self.inner.publish(pending);
        Ok(written)
    }

    async fn try_lock(&self, key: &str, token: &str, ttl_ms: u64) -> Result<bool, StorageError> {
        let created = self
            .set_nx_px_many(&[(key.to_string(), token.to_string())], ttl_ms)
            .await?;
        match created.into_iter().next() {
            Some(result) => result,
            None => Err(StorageError::new("empty lock reply")),
        }
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, StorageError> {
        let now = Instant::now();
        let mut pending = Vec::new();
        let removed = {
            let mut entries = self.inner.write()?;
            expire_if_due(&mut entries, key, now, &mut pending);
            let owned = matches!(
                entries.get(key).map(|slot| &slot.value),
                Some(Value::Text(current)) if current == token
            );
            if owned {
                entries.remove(key);
                pending.push(event("del", key));
            }
            owned
        };
        self.inner.publish(pending);
        Ok(removed)
    }

    async fn enable_key_notifications(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn subscribe(&self, patterns: &[String]) -> Result<NotificationReceiver, StorageError> {
        self.ensure_reaper();
        let mut events = self.inner.events.subscribe();
        let patterns = patterns.to_vec();
        let db = self.inner.db;
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    received = events.recv() => match received {
                        Ok(key_event) => {
                            let channel = keyevent_channel(db, key_event.event);
                            let Some(pattern) = patterns
                                .iter()
                                .find(|pattern| glob_match(pattern, &channel))
                            else {
                                continue;
                            };
                            let notification = KeyNotification {
                                pattern: pattern.clone(),
                                channel,
                                payload: key_event.key.into_bytes(),
                            };
                            if tx.send(Ok(notification)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(target: "presence.storage", skipped, "in_memory_subscription_lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            let _ = tx
                                .send(Err(StorageError::new("in-memory store dropped")))
                                .await;
                            break;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}
