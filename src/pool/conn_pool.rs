use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{BackendConn, BackendError, Connector};
use crate::config::PoolSettings;

use super::connection::PooledConn;

/// Runtime configuration for a connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum connections lent out or idle at once
    pub max_size: usize,
    /// Idle connections older than this are closed on the next borrow
    pub idle_timeout: Duration,
    /// How long a borrow waits for a free slot
    pub borrow_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            idle_timeout: Duration::from_secs(60),
            borrow_timeout: Duration::from_secs(3),
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            max_size: settings.pool_size.max(1),
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
            borrow_timeout: Duration::from_millis(settings.borrow_timeout_ms),
        }
    }
}

/// Pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Pool exhausted: no connection available after {timeout:?}")]
    Exhausted { timeout: Duration },

    #[error("Borrow cancelled")]
    Cancelled,

    #[error("Failed to open backend connection: {0}")]
    Connect(#[from] BackendError),

    #[error("Pool closed")]
    Closed,
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently lent out (borrowed or pinned)
    pub in_use: usize,
    pub idle: usize,
    pub created: u64,
    pub returned: u64,
    pub destroyed: u64,
}

struct IdleConn<T> {
    conn: T,
    idle_since: Instant,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    returned: AtomicU64,
    destroyed: AtomicU64,
}

pub(super) struct PoolShared<C: Connector> {
    name: String,
    connector: C,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleConn<C::Conn>>>,
    /// One permit per connection slot; a lent connection holds its permit
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    counters: Counters,
}

impl<C: Connector> PoolShared<C> {
    /// Pop the most recently returned idle connection, closing expired ones
    async fn take_idle(&self) -> Option<C::Conn> {
        loop {
            let candidate = self.idle.lock().await.pop_back();
            let mut idle = candidate?;

            if idle.idle_since.elapsed() > self.config.idle_timeout {
                debug!(pool = %self.name, "Connection idle too long, closing");
                idle.conn.close().await;
                self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            return Some(idle.conn);
        }
    }

    /// Take a connection back from a borrower
    ///
    /// A connection that still carries transaction or autocommit-off state
    /// would leak that state into the next borrower, so it is closed instead.
    pub(super) async fn put(&self, mut conn: C::Conn) {
        if conn.is_in_transaction() || !conn.is_autocommit() {
            warn!(
                pool = %self.name,
                connection_id = conn.connection_id(),
                in_transaction = conn.is_in_transaction(),
                autocommit = conn.is_autocommit(),
                "Returned connection carries session state, discarding"
            );
            self.destroy(conn).await;
            return;
        }

        if self.closed.load(Ordering::Acquire) {
            debug!(pool = %self.name, "Pool closed, discarding returned connection");
            self.destroy(conn).await;
            return;
        }

        let mut idle = self.idle.lock().await;
        idle.push_back(IdleConn {
            conn,
            idle_since: Instant::now(),
        });
        self.counters.returned.fetch_add(1, Ordering::Relaxed);
        debug!(pool = %self.name, idle_count = idle.len(), "Returned connection to pool");
    }

    /// Close a connection for good
    pub(super) async fn destroy(&self, mut conn: C::Conn) {
        conn.close().await;
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Account for a lent connection dropped without being returned or closed
    pub(super) fn forget(&self, connection_id: u32) {
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        warn!(pool = %self.name, connection_id, "Lent connection dropped, socket closed without handshake");
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }
}

/// A bounded pool of backend connections for one namespace
///
/// Borrowers hold a slot for as long as the connection is lent out, so a
/// connection pinned to a session counts against `max_size` until the
/// session releases or destroys it.
pub struct ConnPool<C: Connector> {
    shared: Arc<PoolShared<C>>,
}

impl<C: Connector> Clone for ConnPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connector> ConnPool<C> {
    pub fn new(name: impl Into<String>, connector: C, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_size));
        Self {
            shared: Arc::new(PoolShared {
                name: name.into(),
                connector,
                config,
                idle: Mutex::new(VecDeque::new()),
                permits,
                closed: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Borrow a connection
    ///
    /// Waits up to `borrow_timeout` for a free slot, or until `cancel` fires.
    /// Reuses an idle connection if one is available, otherwise opens a new one.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<PooledConn<C>, PoolError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let borrow_timeout = self.shared.config.borrow_timeout;
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            acquired = timeout(borrow_timeout, self.shared.permits.clone().acquire_owned()) => {
                match acquired {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(PoolError::Closed),
                    Err(_) => {
                        warn!(
                            pool = %self.shared.name,
                            timeout = ?borrow_timeout,
                            "Pool exhausted"
                        );
                        return Err(PoolError::Exhausted {
                            timeout: borrow_timeout,
                        });
                    }
                }
            }
        };

        if let Some(conn) = self.shared.take_idle().await {
            debug!(pool = %self.shared.name, "Reusing idle connection");
            return Ok(PooledConn::new(conn, self.shared.clone(), permit));
        }

        debug!(pool = %self.shared.name, "Creating new connection");
        let conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            connected = self.shared.connector.connect() => connected?,
        };
        self.shared.counters.created.fetch_add(1, Ordering::Relaxed);

        Ok(PooledConn::new(conn, self.shared.clone(), permit))
    }

    /// Get pool statistics
    pub async fn stats(&self) -> PoolStats {
        let idle = self.shared.idle.lock().await.len();
        let counters = &self.shared.counters;
        PoolStats {
            in_use: self
                .shared
                .config
                .max_size
                .saturating_sub(self.shared.permits.available_permits()),
            idle,
            created: counters.created.load(Ordering::Relaxed),
            returned: counters.returned.load(Ordering::Relaxed),
            destroyed: counters.destroyed.load(Ordering::Relaxed),
        }
    }

    /// Reject further borrows and close all idle connections
    ///
    /// Connections currently lent out are destroyed when they come back.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.permits.close();

        let drained: Vec<_> = self.shared.idle.lock().await.drain(..).collect();
        for idle in drained {
            self.shared.destroy(idle.conn).await;
        }
        debug!(pool = %self.shared.name, "Closed pool");
    }
}
