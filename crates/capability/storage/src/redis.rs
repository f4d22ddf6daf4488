//! Redis 在线状态存储实现

use crate::connection::open_client;
use crate::error::StorageError;
use crate::traits::{BatchReply, KeyNotification, NotificationReceiver, PresenceStore};
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::{ConnectionLike, MultiplexedConnection};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const NOTIFICATION_BUFFER: usize = 256;

/// 仅当锁值与持有者一致时删除。
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// 仅当守护字段仍等于期望值时写入目标字段（缺失字段按空串比较）。
const HSET_IF_EQ_SCRIPT: &str = r#"
local current = redis.call("HGET", KEYS[1], ARGV[1]) or ""
if current == ARGV[2] then
    redis.call("HSET", KEYS[1], ARGV[3], ARGV[4])
    return 1
end
return 0
"#;

/// Redis 在线状态存储
///
/// 命令走一条复用连接，订阅使用独立的 Pub/Sub 连接。
pub struct RedisPresenceStore {
    client: redis::Client,
    connection: MultiplexedConnection,
    db: i64,
}

impl RedisPresenceStore {
    pub async fn connect(redis_url: &str, db: i64) -> Result<Self, StorageError> {
        let client = open_client(redis_url, db)?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        Ok(Self {
            client,
            connection,
            db,
        })
    }

    fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// 执行 MULTI/EXEC 批次，按命令顺序返回原始回复。
    ///
    /// 跳过 `MULTI` 与各条 `QUEUED` 回复，只读取 `EXEC` 的数组；
    /// 数组中的服务端错误原样保留，由调用方逐键解码。
    async fn exec(
        &self,
        pipe: &redis::Pipeline,
        count: usize,
    ) -> Result<Vec<redis::Value>, StorageError> {
        let mut connection = self.connection();
        let mut replies = connection.req_packed_commands(pipe, count + 1, 1).await?;
        exec_values(replies.pop(), count)
    }
}

/// 校验 EXEC 回复并取出每条命令的结果。
fn exec_values(
    reply: Option<redis::Value>,
    count: usize,
) -> Result<Vec<redis::Value>, StorageError> {
    match reply {
        Some(redis::Value::Array(values)) if values.len() == count => Ok(values),
        Some(redis::Value::Array(values)) => Err(StorageError::new(format!(
            "EXEC returned {} replies, expected {}",
            values.len(),
            count
        ))),
        Some(redis::Value::Nil) => Err(StorageError::new("transaction aborted")),
        Some(other) => match other.extract_error() {
            Err(err) => Err(err.into()),
            Ok(other) => Err(StorageError::new(format!(
                "unexpected EXEC reply: {:?}",
                other
            ))),
        },
        None => Err(StorageError::new("missing EXEC reply")),
    }
}

/// 逐键解码：单条命令的服务端错误只影响该键。
fn per_key<T>(
    values: Vec<redis::Value>,
    decode: fn(&redis::Value) -> Result<T, StorageError>,
) -> BatchReply<T> {
    values
        .into_iter()
        .map(|value| match value.extract_error() {
            Ok(value) => decode(&value),
            Err(err) => Err(err.into()),
        })
        .collect()
}

fn decode_flag(value: &redis::Value) -> Result<bool, StorageError> {
    let flag: i64 = redis::from_redis_value(value)?;
    Ok(flag != 0)
}

fn decode_created(value: &redis::Value) -> Result<bool, StorageError> {
    match value {
        redis::Value::Nil => Ok(false),
        redis::Value::Okay | redis::Value::SimpleString(_) => Ok(true),
        other => Err(StorageError::new(format!(
            "unexpected SET reply: {:?}",
            other
        ))),
    }
}

fn decode_written(value: &redis::Value) -> Result<(), StorageError> {
    match value {
        redis::Value::Int(_) | redis::Value::Okay | redis::Value::SimpleString(_) => Ok(()),
        other => Err(StorageError::new(format!(
            "unexpected HSET reply: {:?}",
            other
        ))),
    }
}

fn decode_hash(value: &redis::Value) -> Result<HashMap<String, String>, StorageError> {
    let fields: HashMap<String, String> = redis::from_redis_value(value)?;
    Ok(fields)
}

#[async_trait::async_trait]
impl PresenceStore for RedisPresenceStore {
    fn db(&self) -> i64 {
        self.db
    }

    async fn pexpire_many(
        &self,
        keys: &[String],
        ttl_ms: u64,
    ) -> Result<BatchReply<bool>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in keys {
            pipe.cmd("PEXPIRE").arg(key).arg(ttl_ms);
        }
        let values = self.exec(&pipe, keys.len()).await?;
        Ok(per_key(values, decode_flag))
    }

    async fn set_nx_px_many(
        &self,
        entries: &[(String, String)],
        ttl_ms: u64,
    ) -> Result<BatchReply<bool>, StorageError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms);
        }
        let values = self.exec(&pipe, entries.len()).await?;
        Ok(per_key(values, decode_created))
    }

    async fn exists_many(&self, keys: &[String]) -> Result<BatchReply<bool>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in keys {
            pipe.cmd("EXISTS").arg(key);
        }
        let values = self.exec(&pipe, keys.len()).await?;
        Ok(per_key(values, decode_flag))
    }

    async fn set_add(&self, set: &str, members: &[String]) -> Result<u64, StorageError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut connection = self.connection();
        let added = connection.sadd::<_, _, u64>(set, members).await?;
        Ok(added)
    }

    async fn set_remove(&self, set: &str, members: &[String]) -> Result<u64, StorageError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut connection = self.connection();
        let removed = connection.srem::<_, _, u64>(set, members).await?;
        Ok(removed)
    }

    async fn set_pop(&self, set: &str) -> Result<Option<String>, StorageError> {
        let mut connection = self.connection();
        let member = connection.spop::<_, Option<String>>(set).await?;
        Ok(member)
    }

    async fn set_card(&self, set: &str) -> Result<u64, StorageError> {
        let mut connection = self.connection();
        let count = connection.scard::<_, u64>(set).await?;
        Ok(count)
    }

    async fn hash_set_many(
        &self,
        entries: &[(String, Vec<(String, String)>)],
    ) -> Result<BatchReply<()>, StorageError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, fields) in entries {
            let cmd = pipe.cmd("HSET").arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
        }
        let values = self.exec(&pipe, entries.len()).await?;
        Ok(per_key(values, decode_written))
    }

    async fn hash_get_all_many(
        &self,
        keys: &[String],
    ) -> Result<BatchReply<HashMap<String, String>>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in keys {
            pipe.cmd("HGETALL").arg(key);
        }
        let values = self.exec(&pipe, keys.len()).await?;
        Ok(per_key(values, decode_hash))
    }

    async fn hash_set_if_eq(
        &self,
        key: &str,
        guard: (&str, &str),
        field: &str,
        value: &str,
    ) -> Result<bool, StorageError> {
        let mut connection = self.connection();
        let written: i64 = redis::Script::new(HSET_IF_EQ_SCRIPT)
            .key(key)
            .arg(guard.0)
            .arg(guard.1)
            .arg(field)
            .arg(value)
            .invoke_async(&mut connection)
            .await?;
        Ok(written != 0)
    }

    async fn try_lock(&self, key: &str, token: &str, ttl_ms: u64) -> Result<bool, StorageError> {
        let mut connection = self.connection();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut connection)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, StorageError> {
        let mut connection = self.connection();
        let removed: i64 = redis::Script::new(UNLOCK_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut connection)
            .await?;
        Ok(removed != 0)
    }

    async fn enable_key_notifications(&self) -> Result<(), StorageError> {
        let mut connection = self.connection();
        redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Eg$x")
            .exec_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, patterns: &[String]) -> Result<NotificationReceiver, StorageError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for pattern in patterns {
            pubsub.psubscribe(pattern).await?;
        }
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    message = messages.next() => {
                        let Some(message) = message else {
                            warn!(target: "presence.storage", "redis_subscription_ended");
                            let _ = tx
                                .send(Err(StorageError::new("redis subscription ended")))
                                .await;
                            break;
                        };
                        let pattern = message
                            .get_pattern::<Option<String>>()
                            .ok()
                            .flatten()
                            .unwrap_or_default();
                        let notification = KeyNotification {
                            pattern,
                            channel: message.get_channel_name().to_string(),
                            payload: message.get_payload_bytes().to_vec(),
                        };
                        if tx.send(Ok(notification)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            // 丢弃 PubSub 连接即取消订阅
            debug!(target: "presence.storage", "redis_subscription_stopped");
        });
        Ok(rx)
    }
}
