mod conn_pool;
mod connection;

pub use conn_pool::{ConnPool, PoolConfig, PoolError, PoolStats};
pub use connection::PooledConn;
