//! Circuit breaker backed by a shared [`StateStore`].
//!
//! State per partition key lives in four store keys so that every worker
//! instance pointing at the same store agrees on it:
//!
//! | key                            | value                           |
//! |--------------------------------|---------------------------------|
//! | `circuit:{key}:state`          | `closed` / `open` / `half_open` |
//! | `circuit:{key}:failures`       | integer counter                 |
//! | `circuit:{key}:last_failure`   | epoch millis                    |
//! | `circuit:{key}:half_open_calls`| integer counter                 |
//!
//! Opening sets a TTL of `cooldown` on the state key. When it lapses while the
//! failure counter is still at or above the threshold, the circuit resolves
//! to HALF_OPEN even if nobody observed the cooldown through the timestamp.
//!
//! The four reads/writes are not one transaction. Transitions are written so
//! that repeating them is harmless (OPEN -> OPEN does nothing), and so that
//! racing callers cannot hand out the HALF_OPEN budget twice: `half_open_calls`
//! is only cleared when a circuit opens or closes, never on the way into
//! HALF_OPEN, where any number of callers may observe the cooldown at once.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::CircuitConfig;
use crate::domain::PartitionKey;
use crate::error::EngineError;
use crate::ports::{Clock, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "closed" => Some(CircuitState::Closed),
            "open" => Some(CircuitState::Open),
            "half_open" => Some(CircuitState::HalfOpen),
            _ => None,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of one circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    pub key: PartitionKey,

    /// Effective state: an OPEN circuit past its cooldown reads as HALF_OPEN.
    pub state: CircuitState,
    pub failures: i64,
    pub last_failure: Option<DateTime<Utc>>,
    pub half_open_calls: i64,
    pub enabled: bool,
}

struct Keys {
    state: String,
    failures: String,
    last_failure: String,
    half_open_calls: String,
}

impl Keys {
    fn for_partition(key: &PartitionKey) -> Self {
        Self {
            state: format!("circuit:{key}:state"),
            failures: format!("circuit:{key}:failures"),
            last_failure: format!("circuit:{key}:last_failure"),
            half_open_calls: format!("circuit:{key}:half_open_calls"),
        }
    }
}

/// Raw values as stored, before any cooldown logic.
struct Snapshot {
    state: Option<CircuitState>,
    failures: i64,
    last_failure: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    config: RwLock<CircuitConfig>,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, config: CircuitConfig) -> Self {
        Self {
            store,
            clock,
            config: RwLock::new(config),
        }
    }

    pub fn config(&self) -> CircuitConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reconfigure(&self, config: CircuitConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Resolve the current state, moving OPEN to HALF_OPEN once the cooldown
    /// has elapsed.
    pub async fn state(&self, key: &PartitionKey) -> Result<CircuitState, EngineError> {
        let cfg = self.config();
        if !cfg.enabled {
            return Ok(CircuitState::Closed);
        }
        let keys = Keys::for_partition(key);
        let snap = self.snapshot(&keys).await?;

        let effective = self.effective_state(&snap, &cfg);
        if effective == CircuitState::HalfOpen && snap.state != Some(CircuitState::HalfOpen) {
            // idempotent: `open()` already emptied `half_open_calls`
            self.store.set(&keys.state, CircuitState::HalfOpen.as_str()).await?;
            info!(domain = %key, "circuit half-open, probing");
        }
        Ok(effective)
    }

    /// Should a task for `key` be attempted now?
    ///
    /// In HALF_OPEN every call consumes one probe; once `half_open_max_calls`
    /// probes are out, further calls are refused until the window resolves.
    pub async fn is_allowed(&self, key: &PartitionKey) -> Result<bool, EngineError> {
        let cfg = self.config();
        if !cfg.enabled {
            return Ok(true);
        }

        match self.state(key).await? {
            CircuitState::Closed => Ok(true),
            CircuitState::Open => {
                debug!(domain = %key, "circuit open, rejecting");
                Ok(false)
            }
            CircuitState::HalfOpen => {
                let keys = Keys::for_partition(key);
                let probes = self.store.incr(&keys.half_open_calls).await?;
                // A probe window that never resolves must not stay exhausted.
                if probes == 1 && !cfg.cooldown().is_zero() {
                    self.store.expire(&keys.half_open_calls, cfg.cooldown()).await?;
                }
                let allowed = probes <= i64::from(cfg.half_open_max_calls);
                if !allowed {
                    debug!(domain = %key, probes, "probe budget exhausted, rejecting");
                }
                Ok(allowed)
            }
        }
    }

    pub async fn record_success(&self, key: &PartitionKey) -> Result<(), EngineError> {
        if !self.config().enabled {
            return Ok(());
        }
        let keys = Keys::for_partition(key);

        match self.state(key).await? {
            CircuitState::Closed => {
                self.store.delete(&keys.failures).await?;
            }
            CircuitState::HalfOpen => {
                self.store.set(&keys.state, CircuitState::Closed.as_str()).await?;
                self.store.delete(&keys.failures).await?;
                self.store.delete(&keys.half_open_calls).await?;
                info!(domain = %key, "circuit closed, target recovered");
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened finished late.
                debug!(domain = %key, "ignoring success while open");
            }
        }
        Ok(())
    }

    pub async fn record_failure(&self, key: &PartitionKey) -> Result<(), EngineError> {
        let cfg = self.config();
        if !cfg.enabled {
            return Ok(());
        }
        let keys = Keys::for_partition(key);

        match self.state(key).await? {
            CircuitState::Closed => {
                let failures = self.store.incr(&keys.failures).await?;
                self.stamp(&keys).await?;
                if failures >= i64::from(cfg.failure_threshold) {
                    self.open(&keys, &cfg).await?;
                    error!(
                        domain = %key,
                        failures,
                        cooldown_secs = cfg.cooldown_secs,
                        "circuit opened"
                    );
                } else {
                    debug!(domain = %key, failures, "failure recorded");
                }
            }
            CircuitState::HalfOpen => {
                self.store.incr(&keys.failures).await?;
                self.open(&keys, &cfg).await?;
                warn!(domain = %key, "probe failed, circuit re-opened");
            }
            CircuitState::Open => {
                self.store.incr(&keys.failures).await?;
            }
        }
        Ok(())
    }

    /// Read-only snapshot. Never transitions or writes.
    pub async fn stats(&self, key: &PartitionKey) -> Result<CircuitStats, EngineError> {
        let cfg = self.config();
        let keys = Keys::for_partition(key);
        let snap = self.snapshot(&keys).await?;
        let half_open_calls = read_int(self.store.get(&keys.half_open_calls).await?);

        let state = if cfg.enabled {
            self.effective_state(&snap, &cfg)
        } else {
            CircuitState::Closed
        };

        Ok(CircuitStats {
            key: key.clone(),
            state,
            failures: snap.failures,
            last_failure: snap.last_failure,
            half_open_calls,
            enabled: cfg.enabled,
        })
    }

    /// Operator reset: forget everything about `key`.
    pub async fn reset(&self, key: &PartitionKey) -> Result<(), EngineError> {
        let keys = Keys::for_partition(key);
        for k in [
            &keys.state,
            &keys.failures,
            &keys.last_failure,
            &keys.half_open_calls,
        ] {
            self.store.delete(k).await?;
        }
        info!(domain = %key, "circuit reset");
        Ok(())
    }

    async fn snapshot(&self, keys: &Keys) -> Result<Snapshot, EngineError> {
        let state = self
            .store
            .get(&keys.state)
            .await?
            .and_then(|raw| CircuitState::parse(&raw));
        let failures = read_int(self.store.get(&keys.failures).await?);
        let last_failure = self
            .store
            .get(&keys.last_failure)
            .await?
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis);

        Ok(Snapshot {
            state,
            failures,
            last_failure,
        })
    }

    fn effective_state(&self, snap: &Snapshot, cfg: &CircuitConfig) -> CircuitState {
        match snap.state {
            Some(CircuitState::Open) => {
                if self.cooled_down(snap.last_failure, cfg.cooldown()) {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
            Some(CircuitState::HalfOpen) => CircuitState::HalfOpen,
            Some(CircuitState::Closed) => CircuitState::Closed,
            // State key expired (or was never written) with the counter still tripped.
            None if snap.failures >= i64::from(cfg.failure_threshold) => {
                if self.cooled_down(snap.last_failure, cfg.cooldown()) {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
            None => CircuitState::Closed,
        }
    }

    /// A missing stamp counts as elapsed.
    fn cooled_down(&self, last_failure: Option<DateTime<Utc>>, cooldown: Duration) -> bool {
        let Some(stamp) = last_failure else {
            return true;
        };
        let elapsed = self.clock.now().signed_duration_since(stamp);
        match elapsed.to_std() {
            Ok(elapsed) => elapsed >= cooldown,
            // clock went backwards
            Err(_) => cooldown.is_zero(),
        }
    }

    async fn stamp(&self, keys: &Keys) -> Result<(), EngineError> {
        let now = self.clock.now().timestamp_millis().to_string();
        self.store.set(&keys.last_failure, &now).await
    }

    async fn open(&self, keys: &Keys, cfg: &CircuitConfig) -> Result<(), EngineError> {
        self.store.set(&keys.state, CircuitState::Open.as_str()).await?;
        self.stamp(keys).await?;
        if !cfg.cooldown().is_zero() {
            self.store.expire(&keys.state, cfg.cooldown()).await?;
        }
        self.store.delete(&keys.half_open_calls).await
    }
}

fn read_int(raw: Option<String>) -> i64 {
    raw.and_then(|v| v.parse().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryStateStore;
    use crate::ports::ManualClock;

    fn cfg() -> CircuitConfig {
        CircuitConfig {
            enabled: true,
            failure_threshold: 3,
            cooldown_secs: 5.0,
            half_open_max_calls: 2,
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryStateStore>,
        breaker: CircuitBreaker,
    }

    fn fixture(cfg: CircuitConfig) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryStateStore::new(clock.clone()));
        let breaker = CircuitBreaker::new(store.clone(), clock.clone(), cfg);
        Fixture {
            clock,
            store,
            breaker,
        }
    }

    fn key() -> PartitionKey {
        PartitionKey::new("shop.example")
    }

    async fn trip(b: &CircuitBreaker, n: u32) {
        for _ in 0..n {
            b.record_failure(&key()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn starts_closed() {
        let f = fixture(cfg());
        assert_eq!(f.breaker.state(&key()).await.unwrap(), CircuitState::Closed);
        assert!(f.breaker.is_allowed(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn threshold_failures_open_the_circuit() {
        let f = fixture(cfg());
        trip(&f.breaker, 2).await;
        assert_eq!(f.breaker.state(&key()).await.unwrap(), CircuitState::Closed);

        trip(&f.breaker, 1).await;
        assert_eq!(f.breaker.state(&key()).await.unwrap(), CircuitState::Open);
        assert!(!f.breaker.is_allowed(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn success_while_closed_resets_failures() {
        let f = fixture(cfg());
        trip(&f.breaker, 2).await;
        f.breaker.record_success(&key()).await.unwrap();
        trip(&f.breaker, 2).await;
        assert_eq!(f.breaker.state(&key()).await.unwrap(), CircuitState::Closed);
        assert_eq!(f.breaker.stats(&key()).await.unwrap().failures, 2);
    }

    #[tokio::test]
    async fn cooldown_moves_open_to_half_open() {
        let f = fixture(cfg());
        trip(&f.breaker, 3).await;

        f.clock.advance(Duration::from_secs(4));
        assert_eq!(f.breaker.state(&key()).await.unwrap(), CircuitState::Open);

        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.breaker.state(&key()).await.unwrap(), CircuitState::HalfOpen);
        assert_eq!(
            f.store.get("circuit:shop.example:state").await.unwrap().as_deref(),
            Some("half_open")
        );
    }

    #[tokio::test]
    async fn half_open_success_closes_and_resets() {
        let f = fixture(cfg());
        trip(&f.breaker, 3).await;
        f.clock.advance(Duration::from_secs(6));

        assert!(f.breaker.is_allowed(&key()).await.unwrap());
        f.breaker.record_success(&key()).await.unwrap();

        let stats = f.breaker.stats(&key()).await.unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.half_open_calls, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let f = fixture(cfg());
        trip(&f.breaker, 3).await;
        f.clock.advance(Duration::from_secs(6));
        assert!(f.breaker.is_allowed(&key()).await.unwrap());

        f.breaker.record_failure(&key()).await.unwrap();
        assert_eq!(f.breaker.state(&key()).await.unwrap(), CircuitState::Open);

        // freshly stamped: a full cooldown is needed again
        f.clock.advance(Duration::from_secs(4));
        assert!(!f.breaker.is_allowed(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn half_open_limits_probes() {
        let f = fixture(cfg());
        trip(&f.breaker, 3).await;
        f.clock.advance(Duration::from_secs(6));

        assert!(f.breaker.is_allowed(&key()).await.unwrap());
        assert!(f.breaker.is_allowed(&key()).await.unwrap());
        assert!(!f.breaker.is_allowed(&key()).await.unwrap());
        assert!(!f.breaker.is_allowed(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn unresolved_probe_window_rearms() {
        let f = fixture(cfg());
        trip(&f.breaker, 3).await;
        f.clock.advance(Duration::from_secs(6));

        assert!(f.breaker.is_allowed(&key()).await.unwrap());
        assert!(f.breaker.is_allowed(&key()).await.unwrap());
        assert!(!f.breaker.is_allowed(&key()).await.unwrap());

        f.clock.advance(Duration::from_secs(5));
        assert!(f.breaker.is_allowed(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn failure_while_open_does_not_restamp() {
        let f = fixture(cfg());
        trip(&f.breaker, 3).await;
        let opened = f.breaker.stats(&key()).await.unwrap().last_failure;

        f.clock.advance(Duration::from_secs(3));
        f.breaker.record_failure(&key()).await.unwrap();

        let stats = f.breaker.stats(&key()).await.unwrap();
        assert_eq!(stats.last_failure, opened);
        assert_eq!(stats.failures, 4);

        f.clock.advance(Duration::from_secs(2));
        assert_eq!(f.breaker.state(&key()).await.unwrap(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn late_success_while_open_keeps_it_open() {
        let f = fixture(cfg());
        trip(&f.breaker, 3).await;
        f.breaker.record_success(&key()).await.unwrap();
        assert_eq!(f.breaker.state(&key()).await.unwrap(), CircuitState::Open);
    }

    #[tokio::test]
    async fn expired_state_key_resolves_half_open() {
        let f = fixture(cfg());
        trip(&f.breaker, 3).await;
        // drop the timestamp so only the TTL path can notice the cooldown
        f.store.delete("circuit:shop.example:last_failure").await.unwrap();
        f.clock.advance(Duration::from_secs(5));

        assert_eq!(f.store.get("circuit:shop.example:state").await.unwrap(), None);
        assert_eq!(f.breaker.state(&key()).await.unwrap(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn stats_do_not_transition() {
        let f = fixture(cfg());
        trip(&f.breaker, 3).await;
        f.clock.advance(Duration::from_secs(6));

        let stats = f.breaker.stats(&key()).await.unwrap();
        assert_eq!(stats.state, CircuitState::HalfOpen);
        assert_eq!(stats.failures, 3);
        assert_eq!(
            f.store.get("circuit:shop.example:state").await.unwrap(),
            None,
            "stats must not rewrite the expired state key"
        );
    }

    /// Delays chosen writes so concurrent callers interleave the way they do
    /// over a network round trip.
    struct Laggy {
        inner: Arc<InMemoryStateStore>,
        lag_half_open_once: std::sync::atomic::AtomicBool,
        lag_incr: Duration,
    }

    impl Laggy {
        fn new(inner: Arc<InMemoryStateStore>, lag_incr: Duration) -> Self {
            Self {
                inner,
                lag_half_open_once: std::sync::atomic::AtomicBool::new(true),
                lag_incr,
            }
        }
    }

    #[async_trait::async_trait]
    impl StateStore for Laggy {
        async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), EngineError> {
            if value == "half_open"
                && self
                    .lag_half_open_once
                    .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.inner.set(key, value).await
        }

        async fn incr(&self, key: &str) -> Result<i64, EngineError> {
            if !self.lag_incr.is_zero() {
                tokio::time::sleep(self.lag_incr).await;
            }
            self.inner.incr(key).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, EngineError> {
            self.inner.expire(key, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<(), EngineError> {
            self.inner.delete(key).await
        }
    }

    fn laggy_fixture(cfg: CircuitConfig, lag_incr: Duration) -> (Fixture, Arc<CircuitBreaker>) {
        let f = fixture(cfg.clone());
        let laggy = Arc::new(Laggy::new(f.store.clone(), lag_incr));
        let breaker = Arc::new(CircuitBreaker::new(laggy, f.clock.clone(), cfg));
        (f, breaker)
    }

    #[tokio::test(start_paused = true)]
    async fn racing_callers_share_one_half_open_budget() {
        let cfg = CircuitConfig {
            failure_threshold: 1,
            half_open_max_calls: 1,
            ..cfg()
        };
        let (f, breaker) = laggy_fixture(cfg, Duration::ZERO);
        breaker.record_failure(&key()).await.unwrap();
        f.clock.advance(Duration::from_secs(6));

        let calls = (0..5).map(|_| {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move { breaker.is_allowed(&key()).await.unwrap() })
        });
        let mut admitted = 0;
        for allowed in futures::future::join_all(calls).await {
            if allowed.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 1);
        assert_eq!(breaker.state(&key()).await.unwrap(), CircuitState::HalfOpen);
        assert_eq!(breaker.stats(&key()).await.unwrap().half_open_calls, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_failures_are_each_counted() {
        let (f, breaker) = laggy_fixture(cfg(), Duration::from_millis(5));

        let calls = (0..10).map(|_| {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move { breaker.record_failure(&key()).await.unwrap() })
        });
        for done in futures::future::join_all(calls).await {
            done.unwrap();
        }

        let stats = breaker.stats(&key()).await.unwrap();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.failures, 10);

        // every opener stamped the same instant, so one cooldown is enough
        f.clock.advance(Duration::from_secs(5));
        assert!(breaker.is_allowed(&key()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_half_open_calls_and_successes_settle_closed() {
        let (f, breaker) = laggy_fixture(cfg(), Duration::from_millis(5));
        trip(&breaker, 3).await;
        f.clock.advance(Duration::from_secs(6));

        let calls = (0..4).map(|_| {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move { breaker.is_allowed(&key()).await.unwrap() })
        });
        let admitted = futures::future::join_all(calls)
            .await
            .into_iter()
            .filter(|allowed| *allowed.as_ref().unwrap())
            .count();
        assert_eq!(admitted, 2);

        let successes = (0..2).map(|_| {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move { breaker.record_success(&key()).await.unwrap() })
        });
        for done in futures::future::join_all(successes).await {
            done.unwrap();
        }

        let stats = breaker.stats(&key()).await.unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.half_open_calls, 0);
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let f = fixture(cfg());
        trip(&f.breaker, 3).await;
        f.breaker.reset(&key()).await.unwrap();
        assert!(f.store.is_empty());
        assert!(f.breaker.is_allowed(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn disabled_breaker_always_allows() {
        let f = fixture(CircuitConfig {
            enabled: false,
            ..cfg()
        });
        trip(&f.breaker, 10).await;
        assert!(f.breaker.is_allowed(&key()).await.unwrap());
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let f = fixture(cfg());
        trip(&f.breaker, 3).await;
        let other = PartitionKey::new("other.example");
        assert!(f.breaker.is_allowed(&other).await.unwrap());
    }

    #[tokio::test]
    async fn reconfigure_changes_threshold() {
        let f = fixture(cfg());
        f.breaker.reconfigure(CircuitConfig {
            failure_threshold: 1,
            ..cfg()
        });
        trip(&f.breaker, 1).await;
        assert_eq!(f.breaker.state(&key()).await.unwrap(), CircuitState::Open);
    }
}
