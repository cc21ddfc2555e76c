//! Scripted in-memory backend for unit tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::backend::status::{SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS};
use crate::backend::{BackendConn, BackendError, Connector, PreparedStmt, QueryResult, StmtId};

/// Route tracing output through the test harness; `RUST_LOG` overrides the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::WARN.into())
                .from_env_lossy(),
        )
        .with_test_writer()
        .try_init();
}

/// Shared state behind every connection a [`MockConnector`] opens
#[derive(Default)]
pub struct MockBackend {
    next_id: AtomicU32,
    /// One-shot failures per operation name
    faults: Mutex<HashMap<&'static str, VecDeque<BackendError>>>,
    /// Every attempted operation as (connection id, "op detail")
    log: Mutex<Vec<(u32, String)>>,
    closed: Mutex<HashSet<u32>>,
    /// Operations whose next call never completes
    stalls: Mutex<HashSet<&'static str>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next call of `op` on any connection fail with `err`
    pub fn fail_next(&self, op: &'static str, err: BackendError) {
        self.faults.lock().entry(op).or_default().push_back(err);
    }

    /// Make the next call of `op` hang until its future is dropped
    pub fn stall_next(&self, op: &'static str) {
        self.stalls.lock().insert(op);
    }

    pub fn is_closed(&self, id: u32) -> bool {
        self.closed.lock().contains(&id)
    }

    /// Operations attempted on one connection, in order
    pub fn ops(&self, id: u32) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|(conn, _)| *conn == id)
            .map(|(_, op)| op.clone())
            .collect()
    }

    /// Number of connections opened so far
    pub fn opened(&self) -> u32 {
        self.next_id.load(Ordering::SeqCst)
    }

    async fn maybe_stall(&self, op: &'static str) {
        let stalled = self.stalls.lock().remove(op);
        if stalled {
            std::future::pending::<()>().await;
        }
    }

    fn attempt(&self, id: u32, op: &'static str, detail: &str) -> Result<(), BackendError> {
        let entry = if detail.is_empty() {
            op.to_string()
        } else {
            format!("{} {}", op, detail)
        };
        self.log.lock().push((id, entry));
        match self.faults.lock().get_mut(op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub struct MockConnector {
    backend: Arc<MockBackend>,
}

impl MockConnector {
    pub fn new(backend: Arc<MockBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Conn = MockConn;

    async fn connect(&self) -> Result<MockConn, BackendError> {
        self.backend.attempt(0, "connect", "")?;
        let id = self.backend.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockConn {
            id,
            backend: self.backend.clone(),
            db: None,
            status: SERVER_STATUS_AUTOCOMMIT,
            charset: "utf8mb4".to_string(),
            next_stmt: 0,
            stmts: HashSet::new(),
        })
    }
}

/// Connection that tracks autocommit/transaction flags the way MySQL does
pub struct MockConn {
    id: u32,
    backend: Arc<MockBackend>,
    db: Option<String>,
    status: u16,
    charset: String,
    next_stmt: StmtId,
    stmts: HashSet<StmtId>,
}

impl MockConn {
    /// With autocommit off, the first statement opens a transaction implicitly
    fn implicit_begin(&mut self) {
        if self.status & SERVER_STATUS_AUTOCOMMIT == 0 {
            self.status |= SERVER_STATUS_IN_TRANS;
        }
    }
}

#[async_trait]
impl BackendConn for MockConn {
    async fn ping(&mut self) -> Result<(), BackendError> {
        self.backend.attempt(self.id, "ping", "")
    }

    async fn use_db(&mut self, db: &str) -> Result<(), BackendError> {
        self.backend.attempt(self.id, "use_db", db)?;
        self.db = Some(db.to_string());
        Ok(())
    }

    fn db(&self) -> Option<&str> {
        self.db.as_deref()
    }

    async fn execute(&mut self, sql: &str) -> Result<QueryResult, BackendError> {
        self.backend.attempt(self.id, "execute", sql)?;
        self.implicit_begin();
        if sql.trim_start().to_uppercase().starts_with("SELECT") {
            return Ok(QueryResult {
                status: self.status,
                columns: vec!["1".to_string()],
                rows: vec![vec![Some(Bytes::from_static(b"1"))]],
                ..Default::default()
            });
        }
        Ok(QueryResult::ok(self.status, 1))
    }

    async fn begin(&mut self) -> Result<(), BackendError> {
        self.backend.attempt(self.id, "begin", "")?;
        self.status |= SERVER_STATUS_IN_TRANS;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        self.backend.attempt(self.id, "commit", "")?;
        self.status &= !SERVER_STATUS_IN_TRANS;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        self.backend.attempt(self.id, "rollback", "")?;
        self.backend.maybe_stall("rollback").await;
        self.status &= !SERVER_STATUS_IN_TRANS;
        Ok(())
    }

    async fn stmt_prepare(&mut self, sql: &str) -> Result<PreparedStmt, BackendError> {
        self.backend.attempt(self.id, "stmt_prepare", sql)?;
        self.next_stmt += 1;
        self.stmts.insert(self.next_stmt);
        Ok(PreparedStmt {
            id: self.next_stmt,
            param_count: sql.matches('?').count() as u16,
            column_count: 0,
        })
    }

    async fn stmt_execute_forward(
        &mut self,
        stmt_id: StmtId,
        data: &[u8],
    ) -> Result<QueryResult, BackendError> {
        self.backend
            .attempt(self.id, "stmt_execute", &format!("{} {}", stmt_id, data.len()))?;
        if !self.stmts.contains(&stmt_id) {
            return Err(BackendError::server(
                1243,
                "HY000",
                "Unknown prepared statement handler given to mysqld_stmt_execute",
            ));
        }
        self.implicit_begin();
        Ok(QueryResult::ok(self.status, 1))
    }

    async fn stmt_close(&mut self, stmt_id: StmtId) -> Result<(), BackendError> {
        self.backend
            .attempt(self.id, "stmt_close", &stmt_id.to_string())?;
        self.stmts.remove(&stmt_id);
        Ok(())
    }

    async fn set_charset(&mut self, charset: &str) -> Result<(), BackendError> {
        self.backend.attempt(self.id, "set_charset", charset)?;
        self.charset = charset.to_string();
        Ok(())
    }

    fn charset(&self) -> &str {
        &self.charset
    }

    async fn set_autocommit(&mut self, enabled: bool) -> Result<(), BackendError> {
        self.backend
            .attempt(self.id, "set_autocommit", if enabled { "1" } else { "0" })?;
        if enabled {
            // Turning autocommit on commits any open transaction
            self.status |= SERVER_STATUS_AUTOCOMMIT;
            self.status &= !SERVER_STATUS_IN_TRANS;
        } else {
            self.status &= !SERVER_STATUS_AUTOCOMMIT;
        }
        Ok(())
    }

    fn connection_id(&self) -> u32 {
        self.id
    }

    fn status(&self) -> u16 {
        self.status
    }

    async fn close(&mut self) {
        let _ = self.backend.attempt(self.id, "close", "");
        self.backend.closed.lock().insert(self.id);
    }
}
