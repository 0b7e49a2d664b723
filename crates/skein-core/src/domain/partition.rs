//! Partition key: the sharding dimension for all per-domain state.
//!
//! Every controller (rate limiter, throttle, circuit breaker) keys its state by
//! the network authority of a task's target, so two targets on the same host
//! share one budget no matter what path they point at.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Key used when a target cannot be parsed or carries no host.
pub const UNKNOWN_PARTITION: &str = "unknown";

/// The network authority (`host[:port]`) of a task target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Derive the key for an arbitrary target.
    ///
    /// - host is lowercased (the `url` parser normalizes it)
    /// - an explicit non-default port is kept: `shop.example:8443`
    /// - userinfo, path, query and fragment are dropped
    /// - a scheme-less target is read as `http://<target>`
    /// - anything without a host maps to [`UNKNOWN_PARTITION`]
    pub fn from_target(target: &str) -> Self {
        let target = target.trim();
        // "shop.example:8080" would otherwise parse with "shop.example" as its scheme.
        let parsed = if target.contains("://") {
            Url::parse(target).ok()
        } else {
            Url::parse(&format!("http://{target}")).ok()
        };

        let Some(url) = parsed else {
            return Self::unknown();
        };
        let Some(host) = url.host_str().filter(|h| !h.is_empty()) else {
            return Self::unknown();
        };

        match url.port() {
            Some(port) => Self(format!("{host}:{port}")),
            None => Self(host.to_string()),
        }
    }

    pub fn unknown() -> Self {
        Self(UNKNOWN_PARTITION.to_string())
    }

    /// Wrap an already-extracted authority as-is.
    pub fn new(authority: impl Into<String>) -> Self {
        Self(authority.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_PARTITION
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
