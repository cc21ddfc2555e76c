//! Sliding-window circuit breaker
//!
//! Each key owns a ring of time cells. Outcomes are counted into the cell
//! handed out by `status`, and the breaker trips once the live part of the
//! ring shows enough traffic with enough failures.

use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{BreakerConfig, BreakerStrategy, Scope};

use super::Breaker;

#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    #[error("Breaker cell {idx} out of range (window size {size})")]
    CellOutOfRange { idx: usize, size: usize },
}

/// Breaker state for a single key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected
    Open,
    /// One probe call is allowed through
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Default)]
struct Cell {
    epoch: u64,
    total: u64,
    failures: u64,
}

#[derive(Debug)]
struct Circuit {
    state: BreakerState,
    cells: Vec<Cell>,
    /// When the circuit last opened (or the last probe was admitted)
    since: Instant,
    probe_in_flight: bool,
}

impl Circuit {
    fn new(size: usize, now: Instant) -> Self {
        Self {
            state: BreakerState::Closed,
            cells: vec![Cell::default(); size],
            since: now,
            probe_in_flight: false,
        }
    }

    fn reset_window(&mut self) {
        self.cells.iter_mut().for_each(|c| *c = Cell::default());
    }

    /// A closed circuit with nothing left in its window carries no information
    fn is_idle(&self, epoch: u64) -> bool {
        self.state == BreakerState::Closed && self.live_counts(epoch).0 == 0
    }

    /// Totals over cells that still fall inside the window ending at `epoch`
    fn live_counts(&self, epoch: u64) -> (u64, u64) {
        let span = self.cells.len() as u64;
        self.cells
            .iter()
            .filter(|c| c.total > 0 && epoch.saturating_sub(c.epoch) < span)
            .fold((0, 0), |(t, f), c| (t + c.total, f + c.failures))
    }
}

/// Per-key sliding-window breaker
pub struct SlidingWindowBreaker {
    scope: Scope,
    strategy: BreakerStrategy,
    circuits: DashMap<String, Circuit>,
    origin: Instant,
    /// Stale circuits are swept out no earlier than this
    next_sweep: Mutex<Instant>,
}

impl SlidingWindowBreaker {
    pub fn new(scope: Scope, strategy: BreakerStrategy) -> Self {
        let mut strategy = strategy;
        strategy.size = strategy.size.max(1);
        strategy.cell_interval_ms = strategy.cell_interval_ms.max(1);

        let now = Instant::now();
        let span = Duration::from_millis(strategy.size as u64 * strategy.cell_interval_ms);
        Self {
            scope,
            strategy,
            circuits: DashMap::new(),
            origin: now,
            next_sweep: Mutex::new(now + span),
        }
    }

    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(config.scope, config.strategy.clone())
    }

    /// Number of keys with a tracked circuit
    pub fn tracked(&self) -> usize {
        self.circuits.len()
    }

    fn window_span(&self) -> Duration {
        Duration::from_millis(self.strategy.size as u64 * self.strategy.cell_interval_ms)
    }

    /// Evict circuits that no longer affect any decision, at most once per window span
    ///
    /// Closed circuits go once their window is empty. Open and half-open ones
    /// go once they have been left alone for an open period plus a full
    /// window, after which a fresh closed circuit is equivalent. Must not be
    /// called while holding a guard into `circuits`.
    fn sweep_stale(&self, now: Instant) {
        let Some(mut next) = self.next_sweep.try_lock() else {
            return;
        };
        if now < *next {
            return;
        }
        *next = now + self.window_span();
        drop(next);

        let epoch = self.epoch(now);
        let abandoned_after = self.open_duration() + self.window_span();
        let before = self.circuits.len();
        self.circuits.retain(|_, circuit| {
            if circuit.state == BreakerState::Closed {
                !circuit.is_idle(epoch)
            } else {
                now.duration_since(circuit.since) < abandoned_after
            }
        });
        debug!(evicted = before.saturating_sub(self.circuits.len()), "Swept stale breaker circuits");
    }

    fn open_duration(&self) -> Duration {
        Duration::from_millis(self.strategy.open_status_duration_ms)
    }

    fn epoch(&self, now: Instant) -> u64 {
        now.duration_since(self.origin).as_millis() as u64 / self.strategy.cell_interval_ms
    }

    fn cell_index(&self, epoch: u64) -> usize {
        (epoch % self.strategy.size as u64) as usize
    }

    fn should_trip(&self, total: u64, failures: u64) -> bool {
        let s = &self.strategy;
        let window_ms = s.size as u64 * s.cell_interval_ms;

        // total / window_secs >= min_qps
        if total * 1000 < s.min_qps * window_ms {
            return false;
        }
        let by_count = s.failure_num > 0 && failures >= s.failure_num;
        let by_rate = s.failure_rate_threshold > 0 && failures * 100 >= s.failure_rate_threshold * total;
        by_count || by_rate
    }
}

impl Breaker for SlidingWindowBreaker {
    fn scope(&self) -> Scope {
        self.scope
    }

    fn status(&self, name: &str) -> (BreakerState, usize) {
        let now = Instant::now();
        let idx = self.cell_index(self.epoch(now));
        let open_for = self.open_duration();

        let Some(mut circuit) = self.circuits.get_mut(name) else {
            return (BreakerState::Closed, idx);
        };

        match circuit.state {
            BreakerState::Closed => (BreakerState::Closed, idx),
            BreakerState::Open | BreakerState::HalfOpen => {
                let probe_returned = circuit.state == BreakerState::HalfOpen && !circuit.probe_in_flight;
                if !probe_returned && now.duration_since(circuit.since) < open_for {
                    return (BreakerState::Open, idx);
                }
                // Admit a single probe; an unanswered probe is replaced after another period
                circuit.state = BreakerState::HalfOpen;
                circuit.since = now;
                circuit.probe_in_flight = true;
                debug!(key = %name, "Breaker half-open, admitting probe");
                (BreakerState::HalfOpen, idx)
            }
        }
    }

    fn hit(&self, name: &str, idx: usize, is_failure: bool) -> Result<(), BreakerError> {
        let size = self.strategy.size;
        if idx >= size {
            return Err(BreakerError::CellOutOfRange { idx, size });
        }

        let now = Instant::now();
        self.sweep_stale(now);

        let epoch = self.epoch(now);
        let mut circuit = self
            .circuits
            .entry(name.to_string())
            .or_insert_with(|| Circuit::new(size, now));

        match circuit.state {
            BreakerState::Open => return Ok(()),
            BreakerState::HalfOpen => {
                if !circuit.probe_in_flight {
                    return Ok(());
                }
                circuit.probe_in_flight = false;
                if is_failure {
                    circuit.state = BreakerState::Open;
                    circuit.since = now;
                    warn!(key = %name, "Breaker probe failed, re-opening");
                } else {
                    circuit.state = BreakerState::Closed;
                    circuit.reset_window();
                    debug!(key = %name, "Breaker probe succeeded, closing");
                }
                return Ok(());
            }
            BreakerState::Closed => {}
        }

        let cell = &mut circuit.cells[idx];
        if cell.epoch != epoch {
            *cell = Cell {
                epoch,
                ..Cell::default()
            };
        }
        cell.total += 1;
        if is_failure {
            cell.failures += 1;
        }

        let (total, failures) = circuit.live_counts(epoch);
        if self.should_trip(total, failures) {
            circuit.state = BreakerState::Open;
            circuit.since = now;
            warn!(key = %name, total, failures, "Breaker tripped open");
        }
        Ok(())
    }

    fn abandon(&self, name: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(name) {
            if circuit.state == BreakerState::HalfOpen && circuit.probe_in_flight {
                circuit.probe_in_flight = false;
                debug!(key = %name, "Breaker probe abandoned before reaching the backend");
            }
        }
    }

    fn slow_query_threshold(&self) -> Option<Duration> {
        match self.strategy.sql_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
