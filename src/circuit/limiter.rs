use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{RateLimiterConfig, Scope};

use super::RateLimiter;

const WINDOW: Duration = Duration::from_secs(1);

/// Error type for rate limiting
#[derive(Debug, thiserror::Error)]
pub enum LimitError {
    #[error("Rate limit exceeded for '{key}': max {qps} qps")]
    QpsExceeded { key: String, qps: u32 },

    #[error("Rate limiting cancelled")]
    Cancelled,
}

/// Fixed one-second window for a single key
struct QpsWindow {
    started: Instant,
    count: u32,
}

impl QpsWindow {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            count: 0,
        }
    }
}

#[derive(Default)]
struct Counters {
    admitted: AtomicUsize,
    rejected: AtomicUsize,
}

/// QPS limiter keyed by namespace, database, or SQL text
///
/// Rejects immediately once a key has used up its allowance for the current
/// second; it never queues callers.
pub struct QpsLimiter {
    scope: Scope,
    /// Allowed calls per second per key (0 = unlimited)
    qps: u32,
    windows: DashMap<String, QpsWindow>,
    /// Expired windows are swept out no earlier than this
    next_sweep: Mutex<Instant>,
    counters: Counters,
}

impl QpsLimiter {
    pub fn new(scope: Scope, qps: u32) -> Self {
        Self {
            scope,
            qps,
            windows: DashMap::new(),
            next_sweep: Mutex::new(Instant::now() + WINDOW),
            counters: Counters::default(),
        }
    }

    /// A limiter that admits everything
    pub fn unlimited() -> Self {
        Self::new(Scope::Namespace, 0)
    }

    pub fn qps(&self) -> u32 {
        self.qps
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            total_admitted: self.counters.admitted.load(Ordering::Relaxed),
            total_rejected: self.counters.rejected.load(Ordering::Relaxed),
            active_keys: self.windows.len(),
        }
    }

    /// Drop windows that have already run out, at most once per window
    ///
    /// Must not be called while holding a guard into `windows`.
    fn sweep_expired(&self, now: Instant) {
        let Some(mut next) = self.next_sweep.try_lock() else {
            return;
        };
        if now < *next {
            return;
        }
        *next = now + WINDOW;
        drop(next);

        let before = self.windows.len();
        self.windows
            .retain(|_, window| now.duration_since(window.started) < WINDOW);
        debug!(evicted = before.saturating_sub(self.windows.len()), "Swept expired rate limit windows");
    }

    fn try_admit(&self, key: &str) -> Result<(), LimitError> {
        let now = Instant::now();
        self.sweep_expired(now);

        let mut window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| QpsWindow::new(now));

        if now.duration_since(window.started) >= WINDOW {
            *window = QpsWindow::new(now);
        }

        if window.count >= self.qps {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, qps = self.qps, "Rate limit exceeded");
            return Err(LimitError::QpsExceeded {
                key: key.to_string(),
                qps: self.qps,
            });
        }

        window.count += 1;
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl From<&RateLimiterConfig> for QpsLimiter {
    fn from(config: &RateLimiterConfig) -> Self {
        Self::new(config.scope, config.qps)
    }
}

#[async_trait]
impl RateLimiter for QpsLimiter {
    fn scope(&self) -> Scope {
        self.scope
    }

    async fn limit(&self, cancel: &CancellationToken, key: &str) -> Result<(), LimitError> {
        if cancel.is_cancelled() {
            return Err(LimitError::Cancelled);
        }
        if self.qps == 0 {
            return Ok(());
        }
        self.try_admit(key)
    }
}

/// Limiter statistics
#[derive(Debug, Clone)]
pub struct LimiterStats {
    pub total_admitted: usize,
    pub total_rejected: usize,
    pub active_keys: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_qps() {
        let limiter = QpsLimiter::new(Scope::Namespace, 2);
        let cancel = CancellationToken::new();

        limiter.limit(&cancel, "app").await.unwrap();
        limiter.limit(&cancel, "app").await.unwrap();
        let result = limiter.limit(&cancel, "app").await;
        assert!(matches!(result, Err(LimitError::QpsExceeded { qps: 2, .. })));

        let stats = limiter.stats();
        assert_eq!(stats.total_admitted, 2);
        assert_eq!(stats.total_rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_a_second() {
        let limiter = QpsLimiter::new(Scope::Namespace, 1);
        let cancel = CancellationToken::new();

        limiter.limit(&cancel, "app").await.unwrap();
        assert!(limiter.limit(&cancel, "app").await.is_err());

        tokio::time::advance(Duration::from_millis(1001)).await;
        limiter.limit(&cancel, "app").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = QpsLimiter::new(Scope::Database, 1);
        let cancel = CancellationToken::new();

        limiter.limit(&cancel, "shop").await.unwrap();
        limiter.limit(&cancel, "billing").await.unwrap();
        assert!(limiter.limit(&cancel, "shop").await.is_err());
        assert_eq!(limiter.stats().active_keys, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_windows_are_evicted() {
        let limiter = QpsLimiter::new(Scope::Sql, 5);
        let cancel = CancellationToken::new();

        for i in 0..10_000 {
            let sql = format!("SELECT * FROM t WHERE id = {}", i);
            limiter.limit(&cancel, &sql).await.unwrap();
        }
        assert_eq!(limiter.stats().active_keys, 10_000);

        tokio::time::advance(Duration::from_secs(3600)).await;
        limiter.limit(&cancel, "SELECT 1").await.unwrap();
        assert_eq!(limiter.stats().active_keys, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_current_windows() {
        let limiter = QpsLimiter::new(Scope::Database, 1);
        let cancel = CancellationToken::new();

        limiter.limit(&cancel, "stale").await.unwrap();
        tokio::time::advance(Duration::from_millis(900)).await;
        limiter.limit(&cancel, "shop").await.unwrap();

        // "stale" has expired, "shop" is still inside its second
        tokio::time::advance(Duration::from_millis(200)).await;
        limiter.limit(&cancel, "billing").await.unwrap();
        assert_eq!(limiter.stats().active_keys, 2);
        assert!(limiter.limit(&cancel, "shop").await.is_err());
    }

    #[tokio::test]
    async fn test_unlimited() {
        let limiter = QpsLimiter::unlimited();
        let cancel = CancellationToken::new();

        for _ in 0..1000 {
            limiter.limit(&cancel, "app").await.unwrap();
        }
        assert_eq!(limiter.stats().active_keys, 0);
    }

    #[tokio::test]
    async fn test_cancelled() {
        let limiter = QpsLimiter::new(Scope::Namespace, 10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = limiter.limit(&cancel, "app").await;
        assert!(matches!(result, Err(LimitError::Cancelled)));
    }
}
