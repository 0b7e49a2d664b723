//! Status - partition key ごとの読み取り専用ビュー
//!
//! 運用者が「なぜこのドメインが止まっているのか」を見るためのもの。
//! どのアクセサも状態を変更しない。

use serde::Serialize;

use crate::domain::PartitionKey;
use crate::error::EngineError;
use crate::resilience::{
    AdaptiveThrottle, CircuitBreaker, CircuitStats, DomainRateLimiter, RateLimitStats,
    ThrottleStats,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainStatus {
    pub key: PartitionKey,
    pub circuit: CircuitStats,
    pub throttle: ThrottleStats,
    pub rate_limit: RateLimitStats,
}

impl DomainStatus {
    pub async fn collect(
        key: &PartitionKey,
        circuit: &CircuitBreaker,
        throttle: &AdaptiveThrottle,
        rate_limiter: &DomainRateLimiter,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            key: key.clone(),
            circuit: circuit.stats(key).await?,
            throttle: throttle.stats(key),
            rate_limit: rate_limiter.stats(key),
        })
    }
}
