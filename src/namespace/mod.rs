//! Namespaces: the policy bundle a client session runs under
//!
//! A namespace owns the backend pool plus the breaker and rate limiter that
//! gate it. Sessions look theirs up by name when the client authenticates
//! and hold it for the life of the connection.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::{Connector, PooledBackendConn};
use crate::circuit::{Breaker, QpsLimiter, RateLimiter, SlidingWindowBreaker};
use crate::config::{Config, NamespaceConfig};
use crate::pool::{ConnPool, PoolConfig, PoolError, PooledConn};

/// What the session core needs from a namespace
#[async_trait]
pub trait Namespace: Send + Sync + 'static {
    type Conn: PooledBackendConn + 'static;

    fn name(&self) -> &str;

    /// Borrow a backend connection, waiting until cancelled or timed out
    async fn get_pooled_conn(&self, cancel: &CancellationToken) -> Result<Self::Conn, PoolError>;

    fn breaker(&self) -> Option<&dyn Breaker>;

    fn rate_limiter(&self) -> &dyn RateLimiter;
}

/// Namespace backed by a [`ConnPool`]
pub struct ProxyNamespace<C: Connector> {
    name: String,
    pool: ConnPool<C>,
    breaker: Option<SlidingWindowBreaker>,
    limiter: QpsLimiter,
}

impl<C: Connector> ProxyNamespace<C> {
    pub fn new(config: &NamespaceConfig, connector: C) -> Self {
        let pool = ConnPool::new(config.name.clone(), connector, PoolConfig::from(&config.pool));

        Self {
            name: config.name.clone(),
            pool,
            breaker: config.breaker.as_ref().map(SlidingWindowBreaker::from_config),
            limiter: QpsLimiter::from(&config.rate_limiter),
        }
    }

    pub fn pool(&self) -> &ConnPool<C> {
        &self.pool
    }

    pub fn limiter(&self) -> &QpsLimiter {
        &self.limiter
    }
}

#[async_trait]
impl<C: Connector> Namespace for ProxyNamespace<C> {
    type Conn = PooledConn<C>;

    fn name(&self) -> &str {
        &self.name
    }

    async fn get_pooled_conn(&self, cancel: &CancellationToken) -> Result<PooledConn<C>, PoolError> {
        self.pool.get(cancel).await
    }

    fn breaker(&self) -> Option<&dyn Breaker> {
        self.breaker.as_ref().map(|b| b as &dyn Breaker)
    }

    fn rate_limiter(&self) -> &dyn RateLimiter {
        &self.limiter
    }
}

/// Namespaces by name
pub struct NamespaceManager<N> {
    namespaces: DashMap<String, Arc<N>>,
}

impl<N: Namespace> NamespaceManager<N> {
    pub fn new() -> Self {
        Self {
            namespaces: DashMap::new(),
        }
    }

    /// Add or replace a namespace
    pub fn register(&self, namespace: N) -> Arc<N> {
        let namespace = Arc::new(namespace);
        self.namespaces
            .insert(namespace.name().to_string(), namespace.clone());
        namespace
    }

    /// Get namespace by name
    ///
    /// Returns None if namespace not found
    pub fn get(&self, name: &str) -> Option<Arc<N>> {
        self.namespaces.get(name).map(|r| r.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<N>> {
        self.namespaces.remove(name).map(|(_, ns)| ns)
    }

    /// Registered namespace names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}

impl<N: Namespace> Default for NamespaceManager<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector> NamespaceManager<ProxyNamespace<C>> {
    /// Build one [`ProxyNamespace`] per configured namespace
    pub fn from_config<F>(config: &Config, mut connector: F) -> Self
    where
        F: FnMut(&NamespaceConfig) -> C,
    {
        let manager = Self::new();
        for ns_config in &config.namespaces {
            manager.register(ProxyNamespace::new(ns_config, connector(ns_config)));
            info!(
                namespace = %ns_config.name,
                pool_size = ns_config.pool.pool_size,
                breaker = ns_config.breaker.is_some(),
                "Registered namespace"
            );
        }
        manager
    }
}
