//! Handler bodies, one per [`Handler`] variant

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{BackendConn, BackendError, PooledBackendConn};
use crate::circuit::{scope_key, BreakerState};
use crate::fsm::{Handler, SessionState};
use crate::namespace::Namespace;
use crate::pool::PoolError;

use super::{execute_in, select_db, Event, Outcome, SessionError, SessionManager};

/// Breaker cell a gated call reports into
struct BreakerTicket {
    key: String,
    idx: usize,
    started: Instant,
}

impl<N: Namespace> SessionManager<N> {
    pub(super) async fn run_handler(
        &mut self,
        cancel: &CancellationToken,
        handler: Handler,
        event: Event<'_>,
    ) -> Result<Outcome, SessionError> {
        match (handler, event) {
            (Handler::Noop, _) => Ok(Outcome::Done),
            (Handler::Forbidden, event) => Err(SessionError::EventNotAllowed {
                state: self.state,
                event: event.kind(),
            }),
            (Handler::QueryPooled, Event::Query { db, sql }) => self.query_pooled(cancel, db, sql).await,
            (Handler::QueryAttached, Event::Query { db, sql }) => self.query_attached(cancel, db, sql).await,
            (Handler::BeginAttached, Event::Begin) => {
                self.attached()?.begin().await?;
                Ok(Outcome::Done)
            }
            (Handler::BeginFetch, Event::Begin) => self.begin_fetch(cancel).await,
            (Handler::CommitOrRollbackAttached, Event::CommitOrRollback { commit }) => {
                self.commit_or_rollback_attached(commit).await
            }
            (Handler::CommitOrRollbackRelease, Event::CommitOrRollback { commit }) => {
                let conn = self.attached()?;
                let result = if commit { conn.commit().await } else { conn.rollback().await };
                self.release_attached(result).await
            }
            (Handler::DisableAutoCommitFetch, Event::DisableAutoCommit) => {
                self.disable_autocommit_fetch(cancel).await
            }
            (Handler::DisableAutoCommitAttached, Event::DisableAutoCommit) => {
                self.attached()?.set_autocommit(false).await?;
                Ok(Outcome::Done)
            }
            (Handler::EnableAutoCommitAttached, Event::EnableAutoCommit) => {
                self.attached()?.set_autocommit(true).await?;
                Ok(Outcome::Done)
            }
            (Handler::EnableAutoCommitRelease, Event::EnableAutoCommit) => {
                let result = self.attached()?.set_autocommit(true).await;
                self.release_attached(result).await
            }
            (Handler::StmtPrepareAttached, Event::StmtPrepare { db, sql }) => {
                self.prepare_attached(db, sql, true).await
            }
            (Handler::StmtPrepareInSession, Event::StmtPrepare { db, sql }) => {
                self.prepare_attached(db, sql, false).await
            }
            (Handler::StmtPrepareFetch, Event::StmtPrepare { db, sql }) => {
                self.prepare_fetch(cancel, db, sql).await
            }
            (Handler::StmtForward, Event::StmtForwardData { stmt_id, data }) => {
                let result = self.attached()?.stmt_execute_forward(stmt_id, &data).await?;
                Ok(Outcome::Rows(result))
            }
            (Handler::StmtCloseAttached, Event::StmtClose { stmt_id }) => {
                let result = self.attached()?.stmt_close(stmt_id).await;
                self.is_prepared = false;
                result?;
                Ok(Outcome::Done)
            }
            (Handler::StmtCloseRelease, Event::StmtClose { stmt_id }) => {
                let result = self.attached()?.stmt_close(stmt_id).await;
                self.is_prepared = false;
                self.release_attached(result).await
            }
            (handler, event) => unreachable!("handler {:?} registered for event {}", handler, event.kind()),
        }
    }

    async fn query_pooled(
        &mut self,
        cancel: &CancellationToken,
        db: &str,
        sql: &str,
    ) -> Result<Outcome, SessionError> {
        let ticket = admit(&*self.namespace, cancel, db, sql).await?;
        let mut conn = match self.namespace.get_pooled_conn(cancel).await {
            Ok(conn) => conn,
            Err(e) => {
                // A backend that refuses connections counts against the circuit
                if matches!(e, PoolError::Connect(_)) {
                    report(&*self.namespace, ticket, true);
                } else {
                    abandon(&*self.namespace, ticket);
                }
                return Err(e.into());
            }
        };

        let result = execute_in(&mut conn, db, sql).await;
        report(&*self.namespace, ticket, result.is_err());

        match result {
            Ok(rows) => {
                conn.put_back().await;
                Ok(Outcome::Rows(rows))
            }
            Err(e) => {
                if e.is_connection_error() {
                    warn!(session_id = self.id, error = %e, "Pooled query broke its connection, destroying it");
                    conn.error_close().await;
                } else {
                    conn.put_back().await;
                }
                Err(e.into())
            }
        }
    }

    async fn query_attached(
        &mut self,
        cancel: &CancellationToken,
        db: &str,
        sql: &str,
    ) -> Result<Outcome, SessionError> {
        let ticket = admit(&*self.namespace, cancel, db, sql).await?;
        let conn = self.attached()?;

        let result = execute_in(conn, db, sql).await;
        report(&*self.namespace, ticket, result.is_err());

        Ok(Outcome::Rows(result?))
    }

    async fn begin_fetch(&mut self, cancel: &CancellationToken) -> Result<Outcome, SessionError> {
        let mut conn = self.namespace.get_pooled_conn(cancel).await?;
        match conn.begin().await {
            Ok(()) => {
                self.attach(conn);
                Ok(Outcome::Done)
            }
            Err(e) => {
                conn.error_close().await;
                Err(e.into())
            }
        }
    }

    async fn disable_autocommit_fetch(&mut self, cancel: &CancellationToken) -> Result<Outcome, SessionError> {
        let mut conn = self.namespace.get_pooled_conn(cancel).await?;
        match conn.set_autocommit(false).await {
            Ok(()) => {
                self.attach(conn);
                Ok(Outcome::Done)
            }
            Err(e) => {
                conn.error_close().await;
                Err(e.into())
            }
        }
    }

    async fn prepare_fetch(
        &mut self,
        cancel: &CancellationToken,
        db: &str,
        sql: &str,
    ) -> Result<Outcome, SessionError> {
        let mut conn = self.namespace.get_pooled_conn(cancel).await?;

        let prepared = match select_db(&mut conn, db).await {
            Ok(()) => conn.stmt_prepare(sql).await,
            Err(e) => Err(e),
        };

        match prepared {
            Ok(stmt) => {
                self.attach(conn);
                self.is_prepared = true;
                Ok(Outcome::Prepared(stmt))
            }
            Err(e) => {
                conn.error_close().await;
                Err(e.into())
            }
        }
    }

    async fn prepare_attached(&mut self, db: &str, sql: &str, enter: bool) -> Result<Outcome, SessionError> {
        let conn = self.attached()?;
        select_db(conn, db).await?;
        let stmt = conn.stmt_prepare(sql).await?;
        if enter {
            self.is_prepared = true;
        }
        Ok(Outcome::Prepared(stmt))
    }

    async fn commit_or_rollback_attached(&mut self, commit: bool) -> Result<Outcome, SessionError> {
        let session_id = self.id;
        let conn = self.attached()?;
        if !commit {
            conn.rollback().await?;
            return Ok(Outcome::Done);
        }

        if let Err(e) = conn.commit().await {
            // Leave nothing half-committed behind on the pinned connection
            if let Err(rb) = conn.rollback().await {
                warn!(session_id, error = %rb, "Rollback after failed commit failed");
            }
            return Err(e.into());
        }
        Ok(Outcome::Done)
    }

    /// Unpin after the releasing operation: return on success, otherwise roll back and destroy
    ///
    /// Every releasing cell is a forced move to the initial state, so the
    /// session is put there before the first await. A caller that drops the
    /// dispatch future midway then leaves a consistent unpinned session, and
    /// the connection is destroyed by its own drop.
    async fn release_attached(&mut self, result: Result<(), BackendError>) -> Result<Outcome, SessionError> {
        let Some(mut conn) = self.attached.take() else {
            return Err(SessionError::NotAttached);
        };
        self.state = SessionState::INITIAL;
        self.is_prepared = false;

        match result {
            Ok(()) => {
                debug!(session_id = self.id, conn_id = conn.connection_id(), "Released backend connection");
                conn.put_back().await;
                Ok(Outcome::Done)
            }
            Err(e) => {
                if let Err(rb) = conn.rollback().await {
                    debug!(session_id = self.id, error = %rb, "Rollback before error-close failed");
                }
                warn!(
                    session_id = self.id,
                    conn_id = conn.connection_id(),
                    error = %e,
                    "Release failed, destroying backend connection"
                );
                conn.error_close().await;
                Err(e.into())
            }
        }
    }
}

/// Consult the breaker, then the rate limiter, before a statement touches a backend
///
/// A statement the breaker would reject never spends a rate limit slot.
async fn admit<N: Namespace>(
    namespace: &N,
    cancel: &CancellationToken,
    db: &str,
    sql: &str,
) -> Result<Option<BreakerTicket>, SessionError> {
    let ticket = match namespace.breaker() {
        Some(breaker) => {
            let key = scope_key(breaker.scope(), namespace.name(), db, sql);
            let (state, idx) = breaker.status(key);
            if state == BreakerState::Open {
                debug!(namespace = %namespace.name(), key = %key, "Circuit open, rejecting statement");
                return Err(SessionError::CircuitOpen(key.to_string()));
            }
            Some(BreakerTicket {
                key: key.to_string(),
                idx,
                started: Instant::now(),
            })
        }
        None => None,
    };

    let limiter = namespace.rate_limiter();
    if let Err(e) = limiter
        .limit(cancel, scope_key(limiter.scope(), namespace.name(), db, sql))
        .await
    {
        abandon(namespace, ticket);
        return Err(e.into());
    }

    Ok(ticket)
}

/// Hand back a ticket whose statement never reached a backend
fn abandon<N: Namespace>(namespace: &N, ticket: Option<BreakerTicket>) {
    if let (Some(ticket), Some(breaker)) = (ticket, namespace.breaker()) {
        breaker.abandon(&ticket.key);
    }
}

/// Report a gated call's outcome; slow calls count as failures
fn report<N: Namespace>(namespace: &N, ticket: Option<BreakerTicket>, failed: bool) {
    let (Some(ticket), Some(breaker)) = (ticket, namespace.breaker()) else {
        return;
    };
    let slow = breaker
        .slow_query_threshold()
        .is_some_and(|limit| ticket.started.elapsed() >= limit);

    if let Err(e) = breaker.hit(&ticket.key, ticket.idx, failed || slow) {
        warn!(namespace = %namespace.name(), error = %e, "Failed to record breaker outcome");
    }
}
