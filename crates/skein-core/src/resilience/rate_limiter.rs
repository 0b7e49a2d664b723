//! Per-domain rate limiter.
//!
//! Grants for the same partition key are spaced at least `delay` apart;
//! different keys never wait on each other.
//!
//! Design:
//! - One slot (`Arc<Mutex<Option<Instant>>>`) per key, created lazily.
//! - The slot map's lock only guards get-or-insert, so two callers that
//!   discover a new key together still end up sharing one slot.
//! - `acquire` reserves its grant time under the slot lock, releases it, and
//!   only then sleeps. No lock is held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::PartitionKey;

type Slot = Arc<Mutex<Option<Instant>>>;

/// Read-only view of one key's limiter state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub key: PartitionKey,
    pub delay_ms: u128,

    /// Whether this key has ever been granted.
    pub tracked: bool,

    /// Milliseconds until the latest reserved grant (0 once it has passed).
    pub next_grant_in_ms: u128,
}

pub struct DomainRateLimiter {
    delay: RwLock<Duration>,
    slots: Mutex<HashMap<PartitionKey, Slot>>,
}

impl DomainRateLimiter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay: RwLock::new(delay),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn delay(&self) -> Duration {
        *self.delay.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap the spacing. Reservations already handed out keep their time.
    pub fn reconfigure(&self, delay: Duration) {
        *self.delay.write().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Wait until this key may be contacted, then record the grant.
    ///
    /// Returns how long the caller was held back.
    pub async fn acquire(&self, key: &PartitionKey) -> Duration {
        let slot = self.slot(key);
        let delay = self.delay();

        let grant_at = {
            let mut last = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let grant_at = match *last {
                Some(prev) => (prev + delay).max(now),
                None => now,
            };
            *last = Some(grant_at);
            grant_at
        };

        let wait = grant_at.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            debug!(domain = %key, wait_ms = wait.as_millis() as u64, "rate limiting");
            tokio::time::sleep_until(grant_at).await;
        }
        wait
    }

    pub fn stats(&self, key: &PartitionKey) -> RateLimitStats {
        let last = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|slot| *slot.lock().unwrap_or_else(PoisonError::into_inner));

        let last = last.flatten();
        RateLimitStats {
            key: key.clone(),
            delay_ms: self.delay().as_millis(),
            tracked: last.is_some(),
            next_grant_in_ms: last
                .map(|t| t.saturating_duration_since(Instant::now()).as_millis())
                .unwrap_or(0),
        }
    }

    /// Number of keys with a slot.
    pub fn tracked_keys(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn slot(&self, key: &PartitionKey) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key.clone()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> PartitionKey {
        PartitionKey::new(s)
    }

    #[tokio::test(start_paused = true)]
    async fn first_acquire_does_not_wait() {
        let limiter = DomainRateLimiter::new(Duration::from_secs(1));
        let waited = limiter.acquire(&key("shop.example")).await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_acquires_are_spaced() {
        let delay = Duration::from_millis(500);
        let limiter = DomainRateLimiter::new(delay);
        let k = key("shop.example");

        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire(&k).await;
        }
        assert!(start.elapsed() >= delay * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_do_not_block_each_other() {
        let delay = Duration::from_secs(1);
        let limiter = Arc::new(DomainRateLimiter::new(delay));
        for k in ["a.example", "b.example", "c.example"] {
            limiter.acquire(&key(k)).await;
        }

        let start = Instant::now();
        let mut handles = Vec::new();
        for k in ["a.example", "b.example", "c.example"] {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.acquire(&key(k)).await }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // one delay, not three
        let elapsed = start.elapsed();
        assert!(elapsed >= delay);
        assert!(elapsed < delay * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_same_key_grants_are_spaced() {
        let delay = Duration::from_millis(300);
        let limiter = Arc::new(DomainRateLimiter::new(delay));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire(&key("shop.example")).await;
                Instant::now()
            }));
        }
        let mut grants = Vec::new();
        for h in handles {
            grants.push(h.await.unwrap());
        }
        grants.sort();

        for pair in grants.windows(2) {
            assert!(pair[1] - pair[0] >= delay, "grants closer than delay");
        }
    }

    #[tokio::test]
    async fn concurrent_first_use_shares_one_slot() {
        let limiter = Arc::new(DomainRateLimiter::new(Duration::ZERO));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.slot(&key("new.example")) }));
        }
        let mut slots = Vec::new();
        for h in handles {
            slots.push(h.await.unwrap());
        }

        assert_eq!(limiter.tracked_keys(), 1);
        assert!(slots.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test(start_paused = true)]
    async fn stats_do_not_create_slots() {
        let limiter = DomainRateLimiter::new(Duration::from_secs(2));
        let stats = limiter.stats(&key("shop.example"));
        assert!(!stats.tracked);
        assert_eq!(limiter.tracked_keys(), 0);

        limiter.acquire(&key("shop.example")).await;
        limiter.acquire(&key("shop.example")).await;
        let stats = limiter.stats(&key("shop.example"));
        assert!(stats.tracked);
        assert_eq!(stats.delay_ms, 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn reconfigure_changes_spacing() {
        let limiter = DomainRateLimiter::new(Duration::from_secs(5));
        let k = key("shop.example");
        limiter.acquire(&k).await;
        limiter.reconfigure(Duration::from_secs(1));

        let waited = limiter.acquire(&k).await;
        assert_eq!(waited, Duration::from_secs(1));
    }
}
