//! Session core of a MySQL proxy
//!
//! For every client connection a [`SessionManager`] walks a shared
//! [`TransitionTable`] of session flags and decides per statement whether a backend
//! connection stays pinned to the session or is borrowed from the
//! namespace's pool and returned right away.

pub mod backend;
pub mod circuit;
pub mod config;
pub mod fsm;
pub mod namespace;
pub mod pool;
pub mod session;

#[cfg(test)]
mod testing;

pub use backend::{BackendConn, BackendError, Connector, PooledBackendConn};
pub use config::{load_config, Config, ConfigError};
pub use fsm::{EventKind, SessionState, TransitionTable};
pub use namespace::{Namespace, NamespaceManager, ProxyNamespace};
pub use session::{Event, Outcome, SessionError, SessionManager};
