//! RedisStateStore - 複数 worker で circuit 状態を共有するための StateStore
//!
//! `redis` feature でのみビルドされる。接続は `ConnectionManager` に任せ、
//! 切断時の再接続もそちらで行う。

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use crate::config::redact_url;
use crate::error::EngineError;
use crate::ports::StateStore;

#[derive(Clone)]
pub struct RedisStateStore {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStateStore")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisStateStore {
    pub async fn connect(redis_url: &str) -> Result<Self, EngineError> {
        info!(url = %redact_url(redis_url), "connecting to redis state store");

        let client = redis::Client::open(redis_url)
            .map_err(|e| EngineError::Store(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| EngineError::Store(format!("failed to connect to redis: {e}")))?;

        Ok(Self { conn })
    }
}

fn store_err(op: &str, key: &str) -> impl FnOnce(redis::RedisError) -> EngineError {
    let ctx = format!("redis {op} {key} failed");
    move |e| EngineError::Store(format!("{ctx}: {e}"))
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(store_err("GET", key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value)
            .await
            .map_err(store_err("SET", key))
    }

    async fn incr(&self, key: &str) -> Result<i64, EngineError> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1_i64).await.map_err(store_err("INCR", key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, EngineError> {
        let mut conn = self.conn.clone();
        let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
        debug!(key, ttl_ms = millis, "PEXPIRE");
        redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis)
            .query_async(&mut conn)
            .await
            .map_err(store_err("PEXPIRE", key))
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(store_err("DEL", key))
    }
}
