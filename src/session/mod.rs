//! Per-connection session manager
//!
//! Owns the session's FSM state and, outside the initial state, the backend
//! connection pinned to it. The protocol layer turns each decoded client
//! command into an [`Event`] and calls [`SessionManager::dispatch`].

mod handlers;


use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{BackendConn, BackendError, PooledBackendConn, PreparedStmt, QueryResult, StmtId};
use crate::circuit::LimitError;
use crate::fsm::{EventKind, SessionState, TransitionTable};
use crate::namespace::Namespace;
use crate::pool::PoolError;

/// A client command as seen by the state machine
#[derive(Debug, Clone)]
pub enum Event<'a> {
    Query { db: &'a str, sql: &'a str },
    Begin,
    CommitOrRollback { commit: bool },
    DisableAutoCommit,
    EnableAutoCommit,
    StmtPrepare { db: &'a str, sql: &'a str },
    /// Raw execute/send-long-data payload, forwarded unmodified
    StmtForwardData { stmt_id: StmtId, data: Bytes },
    StmtClose { stmt_id: StmtId },
}

impl Event<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Query { .. } => EventKind::Query,
            Event::Begin => EventKind::Begin,
            Event::CommitOrRollback { .. } => EventKind::CommitOrRollback,
            Event::DisableAutoCommit => EventKind::DisableAutoCommit,
            Event::EnableAutoCommit => EventKind::EnableAutoCommit,
            Event::StmtPrepare { .. } => EventKind::StmtPrepare,
            Event::StmtForwardData { .. } => EventKind::StmtForwardData,
            Event::StmtClose { .. } => EventKind::StmtClose,
        }
    }
}

/// What a successful dispatch produced
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// OK with nothing to report back
    Done,
    Rows(QueryResult),
    Prepared(PreparedStmt),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Event {event} not allowed in state {state}")]
    EventNotAllowed { state: SessionState, event: EventKind },

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Circuit open for '{0}'")]
    CircuitOpen(String),

    #[error("Rate limit error: {0}")]
    RateLimit(#[from] LimitError),

    #[error("Pinned backend connection is broken")]
    ConnectionBroken,

    #[error("No backend connection attached")]
    NotAttached,
}

impl SessionError {
    /// Whether the pinned connection (if any) can no longer be used
    pub fn is_connection_error(&self) -> bool {
        match self {
            SessionError::Backend(e) => e.is_connection_error(),
            SessionError::ConnectionBroken => true,
            _ => false,
        }
    }
}

/// State machine driver for one client connection
pub struct SessionManager<N: Namespace> {
    id: u32,
    table: Arc<TransitionTable>,
    namespace: Arc<N>,
    state: SessionState,
    /// Pinned connection; present in every state except the initial one
    attached: Option<N::Conn>,
    /// Mirrors the IN_PREPARE bit
    is_prepared: bool,
    /// Set once the pinned connection failed at the wire level
    broken: bool,
}

impl<N: Namespace> SessionManager<N> {
    pub fn new(id: u32, table: Arc<TransitionTable>, namespace: Arc<N>) -> Self {
        Self {
            id,
            table,
            namespace,
            state: SessionState::INITIAL,
            attached: None,
            is_prepared: false,
            broken: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn namespace(&self) -> &Arc<N> {
        &self.namespace
    }

    pub fn is_attached(&self) -> bool {
        self.attached.is_some()
    }

    /// Backend connection id of the pinned connection
    pub fn attached_conn_id(&self) -> Option<u32> {
        self.attached.as_ref().map(|c| c.connection_id())
    }

    pub fn is_prepared(&self) -> bool {
        self.is_prepared
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Run one event through the transition table
    ///
    /// The state moves to the entry's target when the handler succeeds, or
    /// regardless of the outcome when the entry is forced. The handler's
    /// error is returned unchanged.
    pub async fn dispatch(
        &mut self,
        cancel: &CancellationToken,
        event: Event<'_>,
    ) -> Result<Outcome, SessionError> {
        if self.broken {
            return Err(SessionError::ConnectionBroken);
        }

        let kind = event.kind();
        let Some(entry) = self.table.lookup(self.state, kind).copied() else {
            debug!(session_id = self.id, state = %self.state, event = %kind, "Event not allowed");
            return Err(SessionError::EventNotAllowed {
                state: self.state,
                event: kind,
            });
        };

        let from = self.state;
        let result = self.run_handler(cancel, entry.handler, event).await;

        if let Err(e) = &result {
            debug!(
                session_id = self.id,
                state = %from,
                event = %kind,
                handler = ?entry.handler,
                error = %e,
                "Handler failed"
            );
            if e.is_connection_error() && self.attached.is_some() {
                warn!(
                    session_id = self.id,
                    namespace = %self.namespace.name(),
                    error = %e,
                    "Pinned connection broken, session must be closed"
                );
                self.broken = true;
            }
        }

        if result.is_ok() || entry.force {
            if entry.next != from {
                debug!(
                    session_id = self.id,
                    from = %from,
                    to = %entry.next,
                    event = %kind,
                    forced = result.is_err(),
                    "State transition"
                );
            }
            self.state = entry.next;
        }

        debug_assert_eq!(
            self.attached.is_some(),
            !self.state.is_initial(),
            "pinning out of sync in state {}",
            self.state
        );
        debug_assert_eq!(self.is_prepared, self.state.in_prepare());

        result
    }

    /// End the session, returning or destroying the pinned connection
    ///
    /// A connection that only had autocommit switched off goes back to the
    /// pool once autocommit is restored. Anything with transaction or
    /// prepared-statement state on it is rolled back and destroyed.
    pub async fn close(mut self) {
        let Some(mut conn) = self.attached.take() else {
            return;
        };

        if !self.broken && self.state == SessionState::empty() {
            match conn.set_autocommit(true).await {
                Ok(()) => {
                    debug!(session_id = self.id, "Session closed, connection returned");
                    conn.put_back().await;
                    return;
                }
                Err(e) => {
                    warn!(session_id = self.id, error = %e, "Failed to restore autocommit on close");
                }
            }
        } else if !self.broken {
            if let Err(e) = conn.rollback().await {
                debug!(session_id = self.id, error = %e, "Rollback on close failed");
            }
        }

        debug!(session_id = self.id, state = %self.state, "Session closed, connection destroyed");
        conn.error_close().await;
    }

    fn attached(&mut self) -> Result<&mut N::Conn, SessionError> {
        self.attached.as_mut().ok_or(SessionError::NotAttached)
    }

    fn attach(&mut self, conn: N::Conn) {
        debug!(
            session_id = self.id,
            conn_id = conn.connection_id(),
            namespace = %self.namespace.name(),
            "Pinned backend connection"
        );
        self.attached = Some(conn);
    }
}

impl<N: Namespace> Drop for SessionManager<N> {
    fn drop(&mut self) {
        if let Some(conn) = self.attached.take() {
            warn!(
                session_id = self.id,
                state = %self.state,
                conn_id = conn.connection_id(),
                "Session dropped with a pinned connection, destroying it"
            );
        }
    }
}

/// Switch to `db` unless it is empty or already selected
async fn select_db<C: BackendConn>(conn: &mut C, db: &str) -> Result<(), BackendError> {
    if db.is_empty() || conn.db() == Some(db) {
        return Ok(());
    }
    conn.use_db(db).await
}

async fn execute_in<C: BackendConn>(conn: &mut C, db: &str, sql: &str) -> Result<QueryResult, BackendError> {
    select_db(conn, db).await?;
    conn.execute(sql).await
}
