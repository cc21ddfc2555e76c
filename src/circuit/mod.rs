//! Per-namespace gates in front of backend calls
//!
//! The session core consumes these through the [`Breaker`] and
//! [`RateLimiter`] capabilities; [`SlidingWindowBreaker`] and [`QpsLimiter`]
//! are the implementations a [`ProxyNamespace`](crate::namespace::ProxyNamespace)
//! builds from its configuration.

mod breaker;
mod limiter;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::Scope;

pub use breaker::{BreakerError, BreakerState, SlidingWindowBreaker};
pub use limiter::{LimitError, LimiterStats, QpsLimiter};

/// Circuit breaker capability
pub trait Breaker: Send + Sync {
    /// Which key `name` is derived from
    fn scope(&self) -> Scope;

    /// Record the outcome of a call into window cell `idx` (as returned by `status`)
    fn hit(&self, name: &str, idx: usize, is_failure: bool) -> Result<(), BreakerError>;

    /// Current state for `name` plus the window cell to report the next outcome into
    ///
    /// A `HalfOpen` answer admits the caller as the single probe.
    fn status(&self, name: &str) -> (BreakerState, usize);

    /// Give back a probe admitted by `status` whose call never reached a backend
    fn abandon(&self, _name: &str) {}

    /// Calls slower than this are reported as failures
    fn slow_query_threshold(&self) -> Option<Duration> {
        None
    }
}

/// Rate limiter capability
#[async_trait]
pub trait RateLimiter: Send + Sync {
    fn scope(&self) -> Scope;

    /// Admit one call for `key`, or fail without touching the backend
    async fn limit(&self, cancel: &CancellationToken, key: &str) -> Result<(), LimitError>;
}

/// Select the breaker/limiter key for a statement
pub fn scope_key<'a>(scope: Scope, namespace: &'a str, db: &'a str, sql: &'a str) -> &'a str {
    match scope {
        Scope::Namespace => namespace,
        Scope::Database => db,
        Scope::Sql => sql,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_key() {
        assert_eq!(scope_key(Scope::Namespace, "app", "shop", "SELECT 1"), "app");
        assert_eq!(scope_key(Scope::Database, "app", "shop", "SELECT 1"), "shop");
        assert_eq!(scope_key(Scope::Sql, "app", "shop", "SELECT 1"), "SELECT 1");
    }
}
