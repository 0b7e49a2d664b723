//! Resilience controllers.
//!
//! Scheduler が 1 タスクごとに参照する 4 つの部品:
//! - [`DomainRateLimiter`]: 同一 partition への接触間隔の下限
//! - [`AdaptiveThrottle`]: 失敗・成功に応じて伸び縮みする推奨 delay（AIMD）
//! - [`CircuitBreaker`]: 失敗が続く partition を一時的に遮断（状態は StateStore に共有）
//! - [`RetryExecutor`]: retryable な失敗だけを backoff 付きで再試行
//!
//! どれも明示的に構築して Scheduler に注入する。グローバル状態は持たない。

pub mod circuit;
pub mod rate_limiter;
pub mod retry;
pub mod throttle;

pub use self::circuit::{CircuitBreaker, CircuitState, CircuitStats};
pub use self::rate_limiter::{DomainRateLimiter, RateLimitStats};
pub use self::retry::{RetryExecutor, RetryPolicy};
pub use self::throttle::{AdaptiveThrottle, ThrottleStats};
