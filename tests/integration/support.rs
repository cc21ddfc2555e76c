use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mooring::backend::status::{SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS};
use mooring::backend::{BackendConn, BackendError, Connector, PreparedStmt, QueryResult, StmtId};

/// Counters shared by every connection a [`MemoryConnector`] opens
#[derive(Default)]
pub struct MemoryServer {
    next_id: AtomicU32,
    pub closed: AtomicUsize,
    pub statements: AtomicUsize,
}

pub struct MemoryConnector {
    server: Arc<MemoryServer>,
}

impl MemoryConnector {
    pub fn new(server: Arc<MemoryServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Conn = MemoryConn;

    async fn connect(&self) -> Result<MemoryConn, BackendError> {
        Ok(MemoryConn {
            id: self.server.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            server: self.server.clone(),
            db: None,
            status: SERVER_STATUS_AUTOCOMMIT,
            next_stmt: 0,
        })
    }
}

pub struct MemoryConn {
    id: u32,
    server: Arc<MemoryServer>,
    db: Option<String>,
    status: u16,
    next_stmt: StmtId,
}

impl MemoryConn {
    fn statement(&mut self) -> QueryResult {
        self.server.statements.fetch_add(1, Ordering::SeqCst);
        if self.status & SERVER_STATUS_AUTOCOMMIT == 0 {
            self.status |= SERVER_STATUS_IN_TRANS;
        }
        QueryResult::ok(self.status, 1)
    }
}

#[async_trait]
impl BackendConn for MemoryConn {
    async fn ping(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn use_db(&mut self, db: &str) -> Result<(), BackendError> {
        self.db = Some(db.to_string());
        Ok(())
    }

    fn db(&self) -> Option<&str> {
        self.db.as_deref()
    }

    async fn execute(&mut self, _sql: &str) -> Result<QueryResult, BackendError> {
        tokio::task::yield_now().await;
        Ok(self.statement())
    }

    async fn begin(&mut self) -> Result<(), BackendError> {
        self.status |= SERVER_STATUS_IN_TRANS;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        self.status &= !SERVER_STATUS_IN_TRANS;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        self.status &= !SERVER_STATUS_IN_TRANS;
        Ok(())
    }

    async fn stmt_prepare(&mut self, sql: &str) -> Result<PreparedStmt, BackendError> {
        self.next_stmt += 1;
        Ok(PreparedStmt {
            id: self.next_stmt,
            param_count: sql.matches('?').count() as u16,
            column_count: 0,
        })
    }

    async fn stmt_execute_forward(
        &mut self,
        _stmt_id: StmtId,
        _data: &[u8],
    ) -> Result<QueryResult, BackendError> {
        Ok(self.statement())
    }

    async fn stmt_close(&mut self, _stmt_id: StmtId) -> Result<(), BackendError> {
        Ok(())
    }

    async fn set_charset(&mut self, _charset: &str) -> Result<(), BackendError> {
        Ok(())
    }

    fn charset(&self) -> &str {
        "utf8mb4"
    }

    async fn set_autocommit(&mut self, enabled: bool) -> Result<(), BackendError> {
        if enabled {
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
        self.server.closed.fetch_add(1, Ordering::SeqCst);
    }
}
