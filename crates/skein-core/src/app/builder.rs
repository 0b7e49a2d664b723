//! SchedulerBuilder - Scheduler の構築とワイヤリング
//!
//! # 方針
//! - 起動時検証（Fail-fast）: 設定の検証と必須コラボレーターの欠落は build() で弾く
//! - controller は Arc で生成し、Scheduler から参照を返す（reconfigure / status 用）
//! - StateStore 未指定なら、backend=memory のときだけ InMemoryStateStore を補う

use std::sync::Arc;

use tracing::info;

use super::scheduler::{Engine, Scheduler};
use crate::config::{ConfigError, EngineConfig, StoreBackend, StoreConfig};
use crate::error::EngineError;
use crate::impls::InMemoryStateStore;
use crate::ports::{Backlog, Clock, StateStore, SystemClock, TaskBody};
use crate::resilience::{
    AdaptiveThrottle, CircuitBreaker, DomainRateLimiter, RetryExecutor, RetryPolicy,
};

/// BuildError は Scheduler 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no backlog configured")]
    MissingBacklog,

    #[error("no task body configured")]
    MissingTaskBody,

    #[error("store backend is {0:?} but no state store was provided")]
    MissingStateStore(StoreBackend),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

/// # 使用例
/// ```ignore
/// let scheduler = SchedulerBuilder::new(EngineConfig::load(None)?)
///     .backlog(backlog)
///     .task_body(body)
///     .build()?;
/// let handle = Arc::new(scheduler).spawn();
/// ```
pub struct SchedulerBuilder {
    config: EngineConfig,
    backlog: Option<Arc<dyn Backlog>>,
    body: Option<Arc<dyn TaskBody>>,
    store: Option<Arc<dyn StateStore>>,
    clock: Arc<dyn Clock>,
}

impl SchedulerBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            backlog: None,
            body: None,
            store: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn backlog(mut self, backlog: Arc<dyn Backlog>) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn task_body(mut self, body: Arc<dyn TaskBody>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Clock for circuit cooldowns (and the default in-memory store's TTLs).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Scheduler, BuildError> {
        self.config.validate()?;

        let backlog = self.backlog.ok_or(BuildError::MissingBacklog)?;
        let body = self.body.ok_or(BuildError::MissingTaskBody)?;
        let store = match (self.store, self.config.store.backend) {
            (Some(store), _) => store,
            (None, StoreBackend::Memory) => {
                Arc::new(InMemoryStateStore::new(Arc::clone(&self.clock))) as Arc<dyn StateStore>
            }
            (None, backend) => return Err(BuildError::MissingStateStore(backend)),
        };

        let cfg = self.config;
        let engine = Engine::new(
            backlog,
            body,
            Arc::new(DomainRateLimiter::new(cfg.per_domain_delay())),
            Arc::new(AdaptiveThrottle::new(cfg.throttle.clone())),
            Arc::new(CircuitBreaker::new(store, self.clock, cfg.circuit.clone())),
            RetryExecutor::new(RetryPolicy::from_config(&cfg.retry)),
            cfg.admission_deadline(),
        );

        info!(
            max_concurrency = cfg.max_concurrency,
            per_domain_delay_secs = cfg.per_domain_delay_secs,
            store = ?cfg.store.backend,
            "scheduler built"
        );
        Ok(Scheduler::new(
            engine,
            cfg.max_concurrency,
            cfg.idle_poll(),
            cfg.shutdown_grace(),
        ))
    }
}

/// Open the state store named by `cfg`.
///
/// `redis` requires the crate's `redis` feature.
pub async fn connect_state_store(
    cfg: &StoreConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn StateStore>, EngineError> {
    match cfg.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryStateStore::new(clock))),
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let store = crate::impls::RedisStateStore::connect(&cfg.redis_url).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => Err(EngineError::Config(ConfigError::Invalid(format!(
            "store.backend = redis ({}) needs the `redis` feature",
            cfg.redacted_redis_url()
        )))),
    }
}
