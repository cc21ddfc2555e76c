use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tracing::debug;

use crate::backend::{
    BackendConn, BackendError, Connector, PooledBackendConn, PreparedStmt, QueryResult, StmtId,
};

use super::conn_pool::PoolShared;

/// A backend connection lent out by a [`ConnPool`](super::ConnPool)
///
/// Holds the pool slot for as long as it is alive. Dropping it without
/// [`put_back`](PooledBackendConn::put_back) or
/// [`error_close`](PooledBackendConn::error_close) frees the slot and counts
/// the connection as destroyed; it is never reused.
pub struct PooledConn<C: Connector> {
    /// Underlying backend connection
    conn: C::Conn,
    /// Slot and pool bookkeeping
    loan: Loan<C>,
    /// When the connection was borrowed
    borrowed_at: Instant,
}

/// Pool slot held by a lent connection
///
/// Reports the connection as destroyed when dropped before being settled.
struct Loan<C: Connector> {
    shared: Arc<PoolShared<C>>,
    _permit: OwnedSemaphorePermit,
    connection_id: u32,
    settled: bool,
}

impl<C: Connector> Drop for Loan<C> {
    fn drop(&mut self) {
        if !self.settled {
            self.shared.forget(self.connection_id);
        }
    }
}

impl<C: Connector> PooledConn<C> {
    pub(super) fn new(conn: C::Conn, shared: Arc<PoolShared<C>>, permit: OwnedSemaphorePermit) -> Self {
        let connection_id = conn.connection_id();
        Self {
            conn,
            loan: Loan {
                shared,
                _permit: permit,
                connection_id,
                settled: false,
            },
            borrowed_at: Instant::now(),
        }
    }

    /// Name of the pool this connection belongs to
    pub fn pool_name(&self) -> &str {
        self.loan.shared.name()
    }

    /// How long the connection has been lent out
    pub fn held_for(&self) -> std::time::Duration {
        self.borrowed_at.elapsed()
    }
}

#[async_trait]
impl<C: Connector> BackendConn for PooledConn<C> {
    async fn ping(&mut self) -> Result<(), BackendError> {
        self.conn.ping().await
    }

    async fn use_db(&mut self, db: &str) -> Result<(), BackendError> {
        self.conn.use_db(db).await
    }

    fn db(&self) -> Option<&str> {
        self.conn.db()
    }

    async fn execute(&mut self, sql: &str) -> Result<QueryResult, BackendError> {
        self.conn.execute(sql).await
    }

    async fn begin(&mut self) -> Result<(), BackendError> {
        self.conn.begin().await
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        self.conn.commit().await
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        self.conn.rollback().await
    }

    async fn stmt_prepare(&mut self, sql: &str) -> Result<PreparedStmt, BackendError> {
        self.conn.stmt_prepare(sql).await
    }

    async fn stmt_execute_forward(
        &mut self,
        stmt_id: StmtId,
        data: &[u8],
    ) -> Result<QueryResult, BackendError> {
        self.conn.stmt_execute_forward(stmt_id, data).await
    }

    async fn stmt_close(&mut self, stmt_id: StmtId) -> Result<(), BackendError> {
        self.conn.stmt_close(stmt_id).await
    }

    async fn set_charset(&mut self, charset: &str) -> Result<(), BackendError> {
        self.conn.set_charset(charset).await
    }

    fn charset(&self) -> &str {
        self.conn.charset()
    }

    async fn set_autocommit(&mut self, enabled: bool) -> Result<(), BackendError> {
        self.conn.set_autocommit(enabled).await
    }

    fn is_autocommit(&self) -> bool {
        self.conn.is_autocommit()
    }

    fn is_in_transaction(&self) -> bool {
        self.conn.is_in_transaction()
    }

    fn connection_id(&self) -> u32 {
        self.conn.connection_id()
    }

    fn status(&self) -> u16 {
        self.conn.status()
    }

    async fn close(&mut self) {
        self.conn.close().await
    }
}

#[async_trait]
impl<C: Connector> PooledBackendConn for PooledConn<C> {
    async fn put_back(self) {
        let PooledConn {
            conn,
            mut loan,
            borrowed_at,
        } = self;
        debug!(
            pool = %loan.shared.name(),
            connection_id = conn.connection_id(),
            held_ms = borrowed_at.elapsed().as_millis() as u64,
            "Putting connection back"
        );
        loan.shared.put(conn).await;
        loan.settled = true;
    }

    async fn error_close(self) {
        let PooledConn { conn, mut loan, .. } = self;
        debug!(
            pool = %loan.shared.name(),
            connection_id = conn.connection_id(),
            "Error-closing connection"
        );
        loan.shared.destroy(conn).await;
        loan.settled = true;
    }
}
