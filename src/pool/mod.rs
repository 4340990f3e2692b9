pub mod connection_pool;

pub use connection_pool::{
    ConnectionKind, ConnectionPool, ConnectionState, DbConnection, DbPoolMetrics, HttpAgent,
    HttpPoolMetrics, PoolMetrics, PooledConnection,
};
