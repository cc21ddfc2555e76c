use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Namespaces served by this proxy (one per tenant)
    #[serde(default)]
    pub namespaces: Vec<NamespaceConfig>,
}

impl Config {
    /// Find a namespace by name
    pub fn namespace(&self, name: &str) -> Option<&NamespaceConfig> {
        self.namespaces.iter().find(|ns| ns.name == name)
    }
}

/// Key selector shared by the breaker and the rate limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// One key for the whole namespace
    #[default]
    Namespace,
    /// One key per database
    Database,
    /// One key per SQL text
    Sql,
}

// ============================================================================
// Namespace Configuration
// ============================================================================

/// Namespace: policy bundle a client authenticates against
#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceConfig {
    /// Unique namespace name
    pub name: String,
    /// Backend connection pool sizing
    #[serde(default)]
    pub pool: PoolSettings,
    /// Circuit breaker (absent = no breaker)
    #[serde(default)]
    pub breaker: Option<BreakerConfig>,
    /// Rate limiter
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
}

/// Pool sizing for a namespace
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    /// Maximum connections lent out or idle at once
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Idle connections older than this are closed instead of reused (seconds)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// How long a borrow waits for a free slot (milliseconds)
    #[serde(default = "default_borrow_timeout_ms")]
    pub borrow_timeout_ms: u64,
}

fn default_pool_size() -> usize {
    10
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_borrow_timeout_ms() -> u64 {
    3000
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
            borrow_timeout_ms: default_borrow_timeout_ms(),
        }
    }
}

// ============================================================================
// Breaker / Rate Limiter Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub strategy: BreakerStrategy,
}

/// Sliding window breaker strategy
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerStrategy {
    /// Minimum average QPS over the window before the breaker may trip
    #[serde(default = "default_min_qps")]
    pub min_qps: u64,
    /// Failure percentage that trips the breaker (0 disables)
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: u64,
    /// Absolute failures in the window that trip the breaker (0 disables)
    #[serde(default = "default_failure_num")]
    pub failure_num: u64,
    /// How long the breaker stays open before letting a probe through (milliseconds)
    #[serde(default = "default_open_status_duration_ms")]
    pub open_status_duration_ms: u64,
    /// Number of cells in the sliding window
    #[serde(default = "default_window_size")]
    pub size: usize,
    /// Width of one cell (milliseconds)
    #[serde(default = "default_cell_interval_ms")]
    pub cell_interval_ms: u64,
    /// Statements slower than this count as failures (0 disables)
    #[serde(default)]
    pub sql_timeout_ms: u64,
}

fn default_min_qps() -> u64 {
    3
}

fn default_failure_rate_threshold() -> u64 {
    50
}

fn default_failure_num() -> u64 {
    5
}

fn default_open_status_duration_ms() -> u64 {
    5000
}

fn default_window_size() -> usize {
    10
}

fn default_cell_interval_ms() -> u64 {
    1000
}

impl Default for BreakerStrategy {
    fn default() -> Self {
        Self {
            min_qps: default_min_qps(),
            failure_rate_threshold: default_failure_rate_threshold(),
            failure_num: default_failure_num(),
            open_status_duration_ms: default_open_status_duration_ms(),
            size: default_window_size(),
            cell_interval_ms: default_cell_interval_ms(),
            sql_timeout_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default)]
    pub scope: Scope,
    /// Allowed statements per second per key (0 = unlimited)
    #[serde(default)]
    pub qps: u32,
}
