//! Backend connection capability
//!
//! The concrete MySQL driver lives outside this crate. The session core only
//! talks to backends through [`BackendConn`], and to pooled backends through
//! [`PooledBackendConn`], which adds the two ways a lent connection can end
//! its loan: a graceful return or a destroy.

use async_trait::async_trait;
use bytes::Bytes;

/// Prepared statement identifier assigned by the backend
pub type StmtId = u32;

/// Server status flags reported in OK/EOF packets
pub mod status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
}

/// Result of a statement executed on a backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Server status flags after the statement
    pub status: u16,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    /// Column names, empty for statements without a result set
    pub columns: Vec<String>,
    /// Text-protocol rows; `None` is SQL NULL
    pub rows: Vec<Vec<Option<Bytes>>>,
}

impl QueryResult {
    /// Result of a statement that returned no rows
    pub fn ok(status: u16, affected_rows: u64) -> Self {
        Self {
            status,
            affected_rows,
            ..Default::default()
        }
    }

    pub fn has_result_set(&self) -> bool {
        !self.columns.is_empty()
    }
}

/// A statement prepared on a backend connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedStmt {
    pub id: StmtId,
    pub param_count: u16,
    pub column_count: u16,
}

/// Backend errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Server error {code} ({state}): {message}")]
    Server {
        code: u16,
        state: String,
        message: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Backend disconnected")]
    Disconnected,
}

impl BackendError {
    pub fn server(code: u16, state: &str, message: impl Into<String>) -> Self {
        Self::Server {
            code,
            state: state.to_string(),
            message: message.into(),
        }
    }

    /// Whether the connection's wire state can no longer be trusted
    ///
    /// A server error leaves the connection usable; everything else means the
    /// connection must be destroyed rather than reused.
    pub fn is_connection_error(&self) -> bool {
        !matches!(self, BackendError::Server { .. })
    }
}

/// A single physical connection to a MySQL backend
#[async_trait]
pub trait BackendConn: Send {
    async fn ping(&mut self) -> Result<(), BackendError>;

    /// Select the current database (COM_INIT_DB)
    async fn use_db(&mut self, db: &str) -> Result<(), BackendError>;

    /// Currently selected database
    fn db(&self) -> Option<&str>;

    async fn execute(&mut self, sql: &str) -> Result<QueryResult, BackendError>;

    async fn begin(&mut self) -> Result<(), BackendError>;

    async fn commit(&mut self) -> Result<(), BackendError>;

    async fn rollback(&mut self) -> Result<(), BackendError>;

    async fn stmt_prepare(&mut self, sql: &str) -> Result<PreparedStmt, BackendError>;

    /// Forward a raw COM_STMT_EXECUTE / COM_STMT_SEND_LONG_DATA payload unmodified
    async fn stmt_execute_forward(
        &mut self,
        stmt_id: StmtId,
        data: &[u8],
    ) -> Result<QueryResult, BackendError>;

    async fn stmt_close(&mut self, stmt_id: StmtId) -> Result<(), BackendError>;

    async fn set_charset(&mut self, charset: &str) -> Result<(), BackendError>;

    fn charset(&self) -> &str;

    async fn set_autocommit(&mut self, enabled: bool) -> Result<(), BackendError>;

    fn is_autocommit(&self) -> bool {
        self.status() & status::SERVER_STATUS_AUTOCOMMIT != 0
    }

    fn is_in_transaction(&self) -> bool {
        self.status() & status::SERVER_STATUS_IN_TRANS != 0
    }

    fn connection_id(&self) -> u32;

    /// Last server status flags seen on this connection
    fn status(&self) -> u16;

    /// Close the underlying socket
    async fn close(&mut self);
}

/// A backend connection lent out by a pool
///
/// Exactly one of [`put_back`](Self::put_back) or
/// [`error_close`](Self::error_close) ends the loan. Dropping the value
/// without calling either destroys the connection.
#[async_trait]
pub trait PooledBackendConn: BackendConn + Sized {
    /// Return the connection to its pool for reuse
    async fn put_back(self);

    /// Destroy a connection whose protocol state is no longer trustworthy
    async fn error_close(self);
}

/// Opens new physical connections for a pool
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: BackendConn + 'static;

    async fn connect(&self) -> Result<Self::Conn, BackendError>;
}
