//! InMemoryStateStore - プロセス内の StateStore 実装
//!
//! 単一 worker 構成、およびテスト用。複数 worker で circuit を共有したい場合は
//! `redis` feature の `RedisStateStore` を使う。
//!
//! # Redis との互換ポイント
//! - TTL は注入された [`Clock`] で判定する（ManualClock を進めれば期限切れになる）
//! - `set` は TTL を消す / `incr` は TTL を保持する
//! - `expire` は存在しない key に対して `false`

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::ports::{Clock, StateStore, SystemClock};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

pub struct InMemoryStateStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryStateStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 生きている key の数（期限切れは数えない）
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 期限切れを掃除してから可変参照を返す
    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Self::live(&mut entries, key, now).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), EngineError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, EngineError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        match Self::live(&mut entries, key, now) {
            Some(entry) => {
                let current: i64 = entry.value.parse().map_err(|_| {
                    EngineError::Store(format!("value at {key} is not an integer"))
                })?;
                let next = current
                    .checked_add(1)
                    .ok_or_else(|| EngineError::Store(format!("increment at {key} overflows")))?;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(entry) = Self::live(&mut entries, key, now) else {
            return Ok(false);
        };
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        entry.expires_at = Some(now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}
