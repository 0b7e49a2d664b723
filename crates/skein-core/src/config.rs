//! Engine configuration.
//!
//! 値の出どころ（YAML, 環境変数, ホットリロード）は外側の責務。
//! ここでは型・デフォルト値・検証だけを持つ。`load` は `config` crate による
//! 「デフォルト → ファイル → 環境変数」の重ね合わせを提供する。

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix for environment overrides, e.g. `SKEIN__CIRCUIT__FAILURE_THRESHOLD=3`.
pub const ENV_PREFIX: &str = "SKEIN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Admission pool size (simultaneous in-flight executions).
    pub max_concurrency: usize,

    /// Minimum spacing between two grants for the same partition key.
    pub per_domain_delay_secs: f64,

    /// How long to wait before polling an empty backlog again.
    pub idle_poll_ms: u64,

    /// Bound on the graceful drain after shutdown is requested.
    pub shutdown_grace_secs: f64,

    /// Optional bound on the rate-limit + throttle wait of one task.
    pub admission_deadline_secs: Option<f64>,

    pub throttle: ThrottleConfig,
    pub circuit: CircuitConfig,
    pub retry: RetryConfig,
    pub store: StoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            per_domain_delay_secs: 1.0,
            idle_poll_ms: 2_000,
            shutdown_grace_secs: 30.0,
            admission_deadline_secs: None,
            throttle: ThrottleConfig::default(),
            circuit: CircuitConfig::default(),
            retry: RetryConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// AIMD throttle parameters (all delays in seconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub enabled: bool,
    pub base_delay: f64,
    pub min_delay: f64,
    pub max_delay: f64,
    pub increase_factor: f64,
    pub decrease_step: f64,
    pub success_threshold: u32,

    /// A success whose rolling average response time exceeds this counts
    /// as a throttling signal.
    pub target_response_secs: f64,

    /// Number of recent response times averaged per key.
    pub latency_window: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: 2.0,
            min_delay: 1.0,
            max_delay: 30.0,
            increase_factor: 2.0,
            decrease_step: 0.5,
            success_threshold: 5,
            target_response_secs: 2.0,
            latency_window: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub cooldown_secs: f64,
    pub half_open_max_calls: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            cooldown_secs: 300.0,
            half_open_max_calls: 3,
        }
    }
}

impl CircuitConfig {
    pub fn cooldown(&self) -> Duration {
        secs(self.cooldown_secs)
    }
}

/// Retry/backoff parameters. Defaults wait 2s, 4s, 8s (capped at 10s).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_wait_secs: f64,
    pub min_wait_secs: f64,
    pub max_wait_secs: f64,

    /// Per-attempt timeout; expiry counts as a retryable transport failure.
    pub attempt_timeout_secs: Option<f64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_wait_secs: 2.0,
            min_wait_secs: 2.0,
            max_wait_secs: 10.0,
            attempt_timeout_secs: Some(90.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local; correct only for a single worker instance.
    #[default]
    Memory,
    /// Shared across worker instances.
    Redis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://localhost:6379/0".to_string(),
        }
    }
}

impl StoreConfig {
    /// `redis_url` safe for logs.
    pub fn redacted_redis_url(&self) -> String {
        redact_url(&self.redis_url)
    }
}

/// Mask the userinfo part of a URL (`redis://:secret@host` -> `redis://***@host`).
/// Input that does not parse is masked entirely.
pub(crate) fn redact_url(raw: &str) -> String {
    let Ok(mut url) = url::Url::parse(raw) else {
        return "<unparsable url>".to_string();
    };
    if url.username().is_empty() && url.password().is_none() {
        return url.to_string();
    }
    // cannot-be-a-base URLs have no userinfo to mask
    if url.set_password(None).is_err() || url.set_username("***").is_err() {
        return "<redacted url>".to_string();
    }
    url.to_string()
}

impl EngineConfig {
    /// Defaults, then `path` (if any), then `SKEIN__*` environment overrides.
    ///
    /// Every section is `#[serde(default)]`, so a file only needs the keys it changes.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Self = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.into()))
        }

        if self.max_concurrency == 0 {
            return invalid("max_concurrency must be at least 1");
        }
        if !(self.per_domain_delay_secs >= 0.0) {
            return invalid("per_domain_delay_secs must be >= 0");
        }
        if !(self.shutdown_grace_secs >= 0.0) {
            return invalid("shutdown_grace_secs must be >= 0");
        }
        if let Some(d) = self.admission_deadline_secs
            && !(d > 0.0)
        {
            return invalid("admission_deadline_secs must be > 0");
        }

        let t = &self.throttle;
        if !(t.min_delay > 0.0 && t.min_delay <= t.base_delay && t.base_delay <= t.max_delay) {
            return invalid("throttle delays must satisfy 0 < min_delay <= base_delay <= max_delay");
        }
        if !(t.increase_factor > 1.0) {
            return invalid("throttle.increase_factor must be > 1");
        }
        if !(t.decrease_step > 0.0) {
            return invalid("throttle.decrease_step must be > 0");
        }
        if t.success_threshold == 0 {
            return invalid("throttle.success_threshold must be at least 1");
        }
        if !(t.target_response_secs > 0.0) {
            return invalid("throttle.target_response_secs must be > 0");
        }
        if t.latency_window == 0 {
            return invalid("throttle.latency_window must be at least 1");
        }

        let c = &self.circuit;
        if c.failure_threshold == 0 {
            return invalid("circuit.failure_threshold must be at least 1");
        }
        if c.half_open_max_calls == 0 {
            return invalid("circuit.half_open_max_calls must be at least 1");
        }
        if !(c.cooldown_secs >= 0.0) {
            return invalid("circuit.cooldown_secs must be >= 0");
        }

        let r = &self.retry;
        if r.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if !(r.base_wait_secs >= 0.0 && r.min_wait_secs >= 0.0) {
            return invalid("retry waits must be >= 0");
        }
        if r.min_wait_secs > r.max_wait_secs {
            return invalid("retry.min_wait_secs cannot be greater than retry.max_wait_secs");
        }
        if let Some(t) = r.attempt_timeout_secs
            && !(t > 0.0)
        {
            return invalid("retry.attempt_timeout_secs must be > 0");
        }

        Ok(())
    }

    pub fn per_domain_delay(&self) -> Duration {
        secs(self.per_domain_delay_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        secs(self.shutdown_grace_secs)
    }

    pub fn admission_deadline(&self) -> Option<Duration> {
        self.admission_deadline_secs.map(secs)
    }
}

/// Seconds as `f64` to `Duration`, saturating on negative / non-finite input.
pub(crate) fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}
