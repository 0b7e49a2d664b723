//! Scheduler - 有界並行のタスク実行ループ
//!
//! # フロー（1 タスク = 1 execution unit）
//! 1. admission token（semaphore permit）を取ってから backlog に `fetch_next`
//! 2. circuit breaker に問い合わせ、拒否なら `CircuitRejected` で mark_failed
//! 3. rate limiter の acquire → throttle の推奨 delay だけ sleep
//! 4. RetryExecutor で task body を実行
//! 5. throttle と circuit に health を報告し、backlog に mark_done / mark_failed
//!
//! permit は unit が終わるまで（abort されても）unit 自身が持つ。
//!
//! # 報告の保証
//! fetch した task は必ず一度 backlog に報告する。
//! - unit 内の panic（store / backlog / controller 由来も含む）は境界で捕まえ、
//!   health に影響しない business failure として報告する
//! - drain の grace を超えて abort された unit の task は `aborted at shutdown` で失敗にする

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::{self, JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::status::DomainStatus;
use crate::domain::{HealthSignal, PartitionKey, Settlement, Task, TaskFailure, TaskId};
use crate::error::EngineError;
use crate::ports::{Backlog, TaskBody};
use crate::resilience::retry::panic_message;
use crate::resilience::{AdaptiveThrottle, CircuitBreaker, DomainRateLimiter, RetryExecutor};

/// Point-in-time counters.
///
/// `succeeded + failed + rejected` is the number of settled units;
/// `rejected` counts circuit rejections only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub admitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
}

/// What one `run` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub admitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,

    /// Units still running when the drain grace ran out.
    pub aborted: usize,
}

#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    admitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.admitted.fetch_add(1, Ordering::Relaxed);
        InFlight(self)
    }

    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            admitted: self.admitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Decrements `in_flight` on every exit path, including abort.
struct InFlight<'a>(&'a Counters);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Which counter a settled unit lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tally {
    Rejected,
    Ran,
}

/// Everything an execution unit needs, shared by all units.
pub(crate) struct Engine {
    backlog: Arc<dyn Backlog>,
    body: Arc<dyn TaskBody>,
    rate_limiter: Arc<DomainRateLimiter>,
    throttle: Arc<AdaptiveThrottle>,
    circuit: Arc<CircuitBreaker>,
    retry: RetryExecutor,
    admission_deadline: Option<Duration>,
    counters: Counters,
}

impl Engine {
    pub(crate) fn new(
        backlog: Arc<dyn Backlog>,
        body: Arc<dyn TaskBody>,
        rate_limiter: Arc<DomainRateLimiter>,
        throttle: Arc<AdaptiveThrottle>,
        circuit: Arc<CircuitBreaker>,
        retry: RetryExecutor,
        admission_deadline: Option<Duration>,
    ) -> Self {
        Self {
            backlog,
            body,
            rate_limiter,
            throttle,
            circuit,
            retry,
            admission_deadline,
            counters: Counters::default(),
        }
    }

    /// One execution unit, start to settlement. Reports to the backlog
    /// exactly once, whatever panics on the way.
    async fn execute(&self, task: Task) {
        let _in_flight = self.counters.enter();
        let key = task.partition_key();

        let (settlement, tally) = match contain(self.settle(&task, &key)).await {
            Ok(settled) => settled,
            Err(panic) => {
                error!(task_id = %task.id, domain = %key, panic = %panic, "execution unit panicked");
                (Settlement::neutral_failure(unit_panicked(&panic), 0), Tally::Ran)
            }
        };
        match tally {
            Tally::Rejected => self.counters.rejected.fetch_add(1, Ordering::Relaxed),
            Tally::Ran if settlement.is_success() => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed)
            }
            Tally::Ran => self.counters.failed.fetch_add(1, Ordering::Relaxed),
        };

        // health first: once the backlog sees the settlement, so do the controllers
        let fed = contain(self.feed_health(&key, settlement.health, settlement.latency)).await;
        if let Err(panic) = fed {
            error!(domain = %key, panic = %panic, "recording health panicked");
        }
        self.report(&task, &key, settlement).await;
    }

    /// Circuit check, admission, then the task body under retries.
    async fn settle(&self, task: &Task, key: &PartitionKey) -> (Settlement, Tally) {
        let allowed = match self.circuit.is_allowed(key).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(domain = %key, error = %e, "circuit check failed, allowing");
                true
            }
        };
        if !allowed {
            let failure = TaskFailure::circuit_rejected(key);
            return (Settlement::neutral_failure(failure, 0), Tally::Rejected);
        }

        if let Err(failure) = self.admit(key).await {
            return (Settlement::neutral_failure(failure, 0), Tally::Ran);
        }

        (self.retry.run(self.body.as_ref(), task).await, Tally::Ran)
    }

    /// Rate limit, then throttle, both under the optional admission deadline.
    async fn admit(&self, key: &PartitionKey) -> Result<(), TaskFailure> {
        let wait = async {
            let waited = self.rate_limiter.acquire(key).await;
            let delay = self.throttle.delay(key);
            debug!(
                domain = %key,
                rate_wait_ms = waited.as_millis() as u64,
                throttle_ms = delay.as_millis() as u64,
                "admitting"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        };

        match self.admission_deadline {
            Some(deadline) => tokio::time::timeout(deadline, wait)
                .await
                .map_err(|_| TaskFailure::admission_timeout(deadline)),
            None => {
                wait.await;
                Ok(())
            }
        }
    }

    async fn report(&self, task: &Task, key: &PartitionKey, settlement: Settlement) {
        let attempts = settlement.attempts;
        let reported = match settlement.outcome {
            Ok(payload) => {
                info!(task_id = %task.id, domain = %key, attempts, "task done");
                contain(self.backlog.mark_done(task.id, payload)).await
            }
            Err(failure) => {
                let summary = format!("{failure} (attempts={attempts})");
                warn!(task_id = %task.id, domain = %key, error = %summary, "task failed");
                contain(self.backlog.mark_failed(task.id, summary)).await
            }
        };
        match reported {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(task_id = %task.id, error = %e, "failed to report settlement to backlog");
            }
            Err(panic) => {
                error!(task_id = %task.id, panic = %panic, "backlog panicked while reporting");
                self.fail_unreported(task.id, unit_panicked(&panic)).await;
            }
        }
    }

    /// Last-resort failure report for a task whose unit never reported.
    /// A task that was reported after all stays as it is.
    async fn fail_unreported(&self, task_id: TaskId, failure: TaskFailure) {
        match contain(self.backlog.mark_failed(task_id, failure.to_string())).await {
            Ok(Ok(())) => warn!(task_id = %task_id, error = %failure, "task failed"),
            Ok(Err(EngineError::NotProcessing(_))) => {
                debug!(task_id = %task_id, "task already reported");
            }
            Ok(Err(e)) => error!(task_id = %task_id, error = %e, "failed to report lost task"),
            Err(panic) => error!(task_id = %task_id, panic = %panic, "backlog panicked again"),
        }
    }

    async fn feed_health(
        &self,
        key: &PartitionKey,
        health: HealthSignal,
        latency: Option<Duration>,
    ) {
        let recorded = match health {
            HealthSignal::Success => {
                self.throttle.record_success(key, latency);
                self.circuit.record_success(key).await
            }
            HealthSignal::Failure(signal) => {
                self.throttle.record_failure(key, signal);
                self.circuit.record_failure(key).await
            }
            HealthSignal::Neutral => Ok(()),
        };
        if let Err(e) = recorded {
            warn!(domain = %key, error = %e, "failed to record circuit outcome");
        }
    }
}

/// Bounded concurrent scheduler. Build one with
/// [`SchedulerBuilder`](super::SchedulerBuilder).
pub struct Scheduler {
    engine: Arc<Engine>,
    max_concurrency: usize,
    idle_poll: Duration,
    shutdown_grace: Duration,
}

impl Scheduler {
    pub(crate) fn new(
        engine: Engine,
        max_concurrency: usize,
        idle_poll: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            engine: Arc::new(engine),
            max_concurrency,
            idle_poll,
            shutdown_grace,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn rate_limiter(&self) -> &Arc<DomainRateLimiter> {
        &self.engine.rate_limiter
    }

    pub fn throttle(&self) -> &Arc<AdaptiveThrottle> {
        &self.engine.throttle
    }

    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.engine.circuit
    }

    pub fn stats(&self) -> SchedulerStats {
        self.engine.counters.snapshot()
    }

    /// Combined read-only view of one partition key.
    pub async fn domain_status(&self, key: &PartitionKey) -> Result<DomainStatus, EngineError> {
        DomainStatus::collect(
            key,
            &self.engine.circuit,
            &self.engine.throttle,
            &self.engine.rate_limiter,
        )
        .await
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped), then
    /// drain in-flight units for up to the configured grace period.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> RunSummary {
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let mut units = Units::default();
        let before = self.stats();

        info!(max_concurrency = self.max_concurrency, "scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.reap(&mut units).await;

            // 容量が空くまで待つ。shutdown とは select で競合させる
            let permit = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let task = match self.engine.backlog.fetch_next().await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    drop(permit);
                    if !self.idle(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "backlog fetch failed");
                    drop(permit);
                    if !self.idle(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            debug!(task_id = %task.id, target = %task.target, "dispatching");
            let engine = Arc::clone(&self.engine);
            let task_id = task.id;
            units.spawn(task_id, async move {
                let _permit = permit;
                engine.execute(task).await;
            });
        }

        let aborted = self.drain(&mut units).await;
        let after = self.stats();
        let summary = RunSummary {
            admitted: after.admitted - before.admitted,
            succeeded: after.succeeded - before.succeeded,
            failed: after.failed - before.failed,
            rejected: after.rejected - before.rejected,
            aborted,
        };
        info!(?summary, "scheduler stopped");
        summary
    }

    /// Run on a background task.
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(&self);
        let join = tokio::spawn(async move { scheduler.run(shutdown_rx).await });
        SchedulerHandle {
            shutdown_tx,
            join,
            scheduler: self,
        }
    }

    /// Sleep for the idle poll interval. Returns `false` if shutdown arrived.
    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
            _ = tokio::time::sleep(self.idle_poll) => true,
        }
    }

    async fn drain(&self, units: &mut Units) -> usize {
        if units.set.is_empty() {
            return 0;
        }
        info!(
            in_flight = units.set.len(),
            grace_ms = self.shutdown_grace.as_millis() as u64,
            "draining in-flight tasks"
        );

        if tokio::time::timeout(self.shutdown_grace, self.join_all(units))
            .await
            .is_ok()
        {
            return 0;
        }

        warn!(remaining = units.set.len(), "drain grace expired, aborting");
        units.set.abort_all();
        let mut aborted = 0;
        while let Some(res) = units.set.join_next_with_id().await {
            if matches!(&res, Err(e) if e.is_cancelled()) {
                aborted += 1;
            }
            self.collect(units, res).await;
        }
        aborted
    }

    async fn reap(&self, units: &mut Units) {
        while let Some(res) = units.set.try_join_next_with_id() {
            self.collect(units, res).await;
        }
    }

    async fn join_all(&self, units: &mut Units) {
        while let Some(res) = units.set.join_next_with_id().await {
            self.collect(units, res).await;
        }
    }

    /// Forget a finished unit. A unit that never got to report (aborted, or
    /// panicked outside its own containment) fails its task here.
    async fn collect(&self, units: &mut Units, res: Result<(task::Id, ()), JoinError>) {
        let (id, lost) = match res {
            Ok((id, ())) => (id, None),
            Err(e) => (e.id(), Some(e)),
        };
        let task_id = units.tasks.remove(&id);
        let (Some(e), Some(task_id)) = (lost, task_id) else {
            return;
        };

        let failure = if e.is_cancelled() {
            TaskFailure::business("aborted at shutdown")
        } else {
            error!(task_id = %task_id, error = %e, "execution unit panicked");
            unit_panicked(&e.to_string())
        };
        self.engine.fail_unreported(task_id, failure).await;
    }
}

/// Running units, and the task each one carries.
#[derive(Default)]
struct Units {
    set: JoinSet<()>,
    tasks: HashMap<task::Id, TaskId>,
}

impl Units {
    fn spawn<F>(&mut self, task_id: TaskId, unit: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.set.spawn(unit);
        self.tasks.insert(handle.id(), task_id);
    }
}

/// Run `fut`, turning a panic into its message.
async fn contain<F: Future>(fut: F) -> Result<F::Output, String> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|panic| panic_message(panic.as_ref()))
}

fn unit_panicked(panic: &str) -> TaskFailure {
    TaskFailure::business(format!("execution unit panicked: {panic}"))
}

/// Handle to a scheduler running on a background task.
/// - `request_shutdown()` で新規取得を止める（実行中のものは drain される）
/// - `shutdown_and_join()` で停止を要求して終了を待つ
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<RunSummary>,
    scheduler: Arc<Scheduler>,
}

impl SchedulerHandle {
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) -> Result<RunSummary, JoinError> {
        self.request_shutdown();
        self.join.await
    }
}
