//! Adaptive throttle (AIMD).
//!
//! Per partition key, keeps a recommended delay that
//! - multiplies by `increase_factor` on every throttling-eligible failure
//!   (capped at `max_delay`), resetting the success streak, and
//! - steps down by `decrease_step` after `success_threshold` consecutive
//!   successes (floored at `min_delay`).
//!
//! Successes may carry the response time of the attempt. The last
//! `latency_window` samples are averaged per key, and a success that leaves
//! the average above `target_response_secs` is treated like a throttling
//! failure: the target answered, but slowly.
//!
//! One failure is serious; one success is not proof of recovery.
//!
//! `(delay, streak)` for a key is always updated under one lock, so readers
//! never see half of a transition.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ThrottleConfig, secs};
use crate::domain::{FailureSignal, PartitionKey};

#[derive(Debug, Clone)]
struct ThrottleState {
    delay: f64,
    success_streak: u32,
    failures_recorded: u64,
    latencies: VecDeque<Duration>,
}

impl ThrottleState {
    fn observe(&mut self, latency: Duration, window: usize) {
        while self.latencies.len() >= window.max(1) {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn avg_response_secs(&self) -> Option<f64> {
        if self.latencies.is_empty() {
            return None;
        }
        let total: f64 = self.latencies.iter().map(Duration::as_secs_f64).sum();
        Some(total / self.latencies.len() as f64)
    }

    /// Multiplicative step up, shared by failures and slow successes.
    fn increase(&mut self, cfg: &ThrottleConfig) -> (f64, f64) {
        let current = clamp(self.delay, cfg);
        let next = (current * cfg.increase_factor).min(cfg.max_delay);
        self.delay = next;
        self.success_streak = 0;
        (current, next)
    }
}

/// Read-only view of one key's throttle state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThrottleStats {
    pub key: PartitionKey,
    pub delay_secs: f64,
    pub success_streak: u32,

    /// Throttling-eligible failures seen for this key.
    pub failures_recorded: u64,

    /// Rolling average over the latency window; `None` until a success
    /// reports its response time.
    pub avg_response_ms: Option<f64>,
}

pub struct AdaptiveThrottle {
    config: RwLock<ThrottleConfig>,
    states: Mutex<HashMap<PartitionKey, ThrottleState>>,
}

impl AdaptiveThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config: RwLock::new(config),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> ThrottleConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap parameters. Stored delays are re-clamped on their next update.
    pub fn reconfigure(&self, config: ThrottleConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Recommended delay in seconds. Unseen keys get `base_delay`.
    pub fn delay_secs(&self, key: &PartitionKey) -> f64 {
        let cfg = self.config();
        if !cfg.enabled {
            return cfg.base_delay;
        }
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states
            .get(key)
            .map(|s| clamp(s.delay, &cfg))
            .unwrap_or(cfg.base_delay)
    }

    pub fn delay(&self, key: &PartitionKey) -> Duration {
        secs(self.delay_secs(key))
    }

    /// Feed a success, optionally with the attempt's response time.
    pub fn record_success(&self, key: &PartitionKey, latency: Option<Duration>) {
        let cfg = self.config();
        if !cfg.enabled {
            return;
        }

        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(key.clone()).or_insert_with(|| fresh(&cfg));

        if let Some(latency) = latency {
            state.observe(latency, cfg.latency_window);
            if let Some(avg) = state.avg_response_secs()
                && avg > cfg.target_response_secs
            {
                let (from, to) = state.increase(&cfg);
                if to > from {
                    info!(domain = %key, from, to, avg_response_secs = avg, "slow responses, throttling");
                }
                return;
            }
        }

        state.success_streak += 1;

        if state.success_streak >= cfg.success_threshold {
            let current = clamp(state.delay, &cfg);
            let next = (current - cfg.decrease_step).max(cfg.min_delay);
            if next < current {
                debug!(domain = %key, from = current, to = next, "decreasing delay");
            }
            state.delay = next;
            state.success_streak = 0;
        }
    }

    /// Feed a failure. Signals that are not throttling-eligible (404, other
    /// 4xx) leave the state untouched.
    pub fn record_failure(&self, key: &PartitionKey, signal: FailureSignal) {
        let cfg = self.config();
        if !cfg.enabled || !signal.is_throttling() {
            return;
        }

        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(key.clone()).or_insert_with(|| fresh(&cfg));

        let (from, to) = state.increase(&cfg);
        if to > from {
            warn!(domain = %key, from, to, ?signal, "throttling");
        }
        state.failures_recorded += 1;
    }

    pub fn stats(&self, key: &PartitionKey) -> ThrottleStats {
        let cfg = self.config();
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        match states.get(key) {
            Some(s) => ThrottleStats {
                key: key.clone(),
                delay_secs: if cfg.enabled { clamp(s.delay, &cfg) } else { cfg.base_delay },
                success_streak: s.success_streak,
                failures_recorded: s.failures_recorded,
                avg_response_ms: s.avg_response_secs().map(|avg| avg * 1_000.0),
            },
            None => ThrottleStats {
                key: key.clone(),
                delay_secs: cfg.base_delay,
                success_streak: 0,
                failures_recorded: 0,
                avg_response_ms: None,
            },
        }
    }
}

fn fresh(cfg: &ThrottleConfig) -> ThrottleState {
    ThrottleState {
        delay: cfg.base_delay,
        success_streak: 0,
        failures_recorded: 0,
        latencies: VecDeque::new(),
    }
}

fn clamp(delay: f64, cfg: &ThrottleConfig) -> f64 {
    delay.max(cfg.min_delay).min(cfg.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ThrottleConfig {
        ThrottleConfig {
            enabled: true,
            base_delay: 2.0,
            min_delay: 1.0,
            max_delay: 5.0,
            increase_factor: 2.0,
            decrease_step: 0.5,
            success_threshold: 3,
            target_response_secs: 2.0,
            latency_window: 4,
        }
    }

    fn key() -> PartitionKey {
        PartitionKey::new("slow.example")
    }

    #[test]
    fn unseen_key_gets_base_delay_without_side_effects() {
        let t = AdaptiveThrottle::new(cfg());
        assert_eq!(t.delay_secs(&key()), 2.0);
        assert_eq!(t.delay(&key()), Duration::from_secs(2));
        assert!(t.states.lock().unwrap().is_empty());
    }

    #[test]
    fn failures_multiply_and_clamp() {
        let t = AdaptiveThrottle::new(cfg());
        let mut seen = vec![t.delay_secs(&key())];
        for _ in 0..3 {
            t.record_failure(&key(), FailureSignal::Status(503));
            seen.push(t.delay_secs(&key()));
        }
        assert_eq!(seen, vec![2.0, 4.0, 5.0, 5.0]);
        assert_eq!(t.stats(&key()).failures_recorded, 3);
    }

    #[test]
    fn threshold_successes_step_down_once() {
        let t = AdaptiveThrottle::new(cfg());
        t.record_success(&key(), None);
        t.record_success(&key(), None);
        assert_eq!(t.delay_secs(&key()), 2.0);
        assert_eq!(t.stats(&key()).success_streak, 2);

        t.record_success(&key(), None);
        assert_eq!(t.delay_secs(&key()), 1.5);
        assert_eq!(t.stats(&key()).success_streak, 0);
    }

    #[test]
    fn decrease_is_floored_at_min_delay() {
        let t = AdaptiveThrottle::new(cfg());
        for _ in 0..30 {
            t.record_success(&key(), None);
        }
        assert_eq!(t.delay_secs(&key()), 1.0);
    }

    #[test]
    fn failure_resets_streak_even_at_max() {
        let t = AdaptiveThrottle::new(cfg());
        for _ in 0..5 {
            t.record_failure(&key(), FailureSignal::Transport);
        }
        assert_eq!(t.delay_secs(&key()), 5.0);

        t.record_success(&key(), None);
        t.record_success(&key(), None);
        t.record_failure(&key(), FailureSignal::Status(429));
        let stats = t.stats(&key());
        assert_eq!(stats.delay_secs, 5.0);
        assert_eq!(stats.success_streak, 0);
    }

    #[test]
    fn not_found_is_ignored() {
        let t = AdaptiveThrottle::new(cfg());
        t.record_success(&key(), None);
        let before = t.stats(&key());

        t.record_failure(&key(), FailureSignal::Status(404));
        t.record_failure(&key(), FailureSignal::Status(401));

        assert_eq!(t.stats(&key()), before);
    }

    #[test]
    fn disabled_throttle_is_inert() {
        let t = AdaptiveThrottle::new(ThrottleConfig {
            enabled: false,
            ..cfg()
        });
        t.record_failure(&key(), FailureSignal::Transport);
        assert_eq!(t.delay_secs(&key()), 2.0);
        assert_eq!(t.stats(&key()).failures_recorded, 0);
    }

    #[test]
    fn reconfigure_reclamps_existing_delay() {
        let t = AdaptiveThrottle::new(cfg());
        t.record_failure(&key(), FailureSignal::Transport);
        assert_eq!(t.delay_secs(&key()), 4.0);

        t.reconfigure(ThrottleConfig {
            max_delay: 3.0,
            ..cfg()
        });
        assert_eq!(t.delay_secs(&key()), 3.0);
    }

    #[test]
    fn keys_are_independent() {
        let t = AdaptiveThrottle::new(cfg());
        t.record_failure(&key(), FailureSignal::Transport);
        assert_eq!(t.delay_secs(&PartitionKey::new("fast.example")), 2.0);
    }

    #[test]
    fn slow_average_counts_as_throttling() {
        let t = AdaptiveThrottle::new(cfg());
        t.record_success(&key(), Some(Duration::from_millis(500)));
        t.record_success(&key(), Some(Duration::from_millis(500)));
        assert_eq!(t.delay_secs(&key()), 2.0);
        assert_eq!(t.stats(&key()).success_streak, 2);

        // (0.5 + 0.5 + 6.0) / 3 > 2.0
        t.record_success(&key(), Some(Duration::from_secs(6)));
        let stats = t.stats(&key());
        assert_eq!(stats.delay_secs, 4.0);
        assert_eq!(stats.success_streak, 0);
        assert_eq!(stats.failures_recorded, 0);
        let avg = stats.avg_response_ms.unwrap();
        assert!((avg - 7_000.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn latency_window_forgets_old_samples() {
        let t = AdaptiveThrottle::new(cfg());
        t.record_success(&key(), Some(Duration::from_secs(9)));
        assert_eq!(t.delay_secs(&key()), 4.0);

        // the slow sample keeps the average high until it leaves the window
        for _ in 0..4 {
            t.record_success(&key(), Some(Duration::from_millis(100)));
        }
        let stats = t.stats(&key());
        assert!((stats.avg_response_ms.unwrap() - 100.0).abs() < 1e-6);
        assert_eq!(stats.delay_secs, 5.0);
        assert_eq!(stats.success_streak, 1);

        t.record_success(&key(), Some(Duration::from_millis(100)));
        t.record_success(&key(), Some(Duration::from_millis(100)));
        assert_eq!(t.delay_secs(&key()), 4.5);
    }

    #[test]
    fn unseen_key_has_no_average() {
        let t = AdaptiveThrottle::new(cfg());
        assert_eq!(t.stats(&key()).avg_response_ms, None);
        t.record_success(&key(), None);
        assert_eq!(t.stats(&key()).avg_response_ms, None);
    }

    #[test]
    fn concurrent_updates_keep_pairs_consistent() {
        use std::sync::Arc;

        let t = Arc::new(AdaptiveThrottle::new(ThrottleConfig {
            max_delay: 1_000.0,
            ..cfg()
        }));
        let mut handles = Vec::new();
        for i in 0..8 {
            let t = Arc::clone(&t);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    if i % 2 == 0 {
                        t.record_success(&key(), None);
                    } else {
                        t.record_failure(&key(), FailureSignal::Status(500));
                    }
                    let d = t.delay_secs(&key());
                    assert!((1.0..=1_000.0).contains(&d));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let stats = t.stats(&key());
        assert_eq!(stats.failures_recorded, 400);
        assert!(stats.success_streak < 3);
    }
}
