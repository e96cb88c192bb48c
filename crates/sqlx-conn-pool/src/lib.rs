//! # sqlx-conn-pool
//!
//! A bounded connection pool for sqlx connections, built for many
//! cooperative async tasks sharing a small number of database sessions.
//!
//! ## Core Types
//!
//! - **[`ConnectionPool`]**: Bounded pool with FIFO waiters and dead-connection replacement
//! - **[`PooledConnection`]**: A checked-out connection; release it back when done
//! - **[`DatabaseConfig`]** / **[`PoolConfig`]**: Validated database and pool settings
//! - **[`Connector`]** / **[`Connection`]**: The driver seam the pool is generic over
//! - **[`SqliteConnector`]**: Built-in SQLite driver on `sqlx`
//! - **[`Error`]**: Error type for pool operations
//!
//! ## Architecture
//!
//! - **Lazy**: nothing is opened until the first acquire, never more than `max_size`
//! - **Fair**: exhausted pools queue callers and serve them strictly in order
//! - **Direct hand-off**: a released connection goes to the oldest waiter, not the idle queue
//! - **Self-healing**: released connections are checked; dead ones are replaced for waiters

mod config;
mod connection;
mod error;
mod pool;
mod sqlite;

// Re-export public types
pub use config::{DatabaseConfig, DatabaseFamily, FamilyKind, PoolConfig};
pub use connection::{Connection, ConnectionId, Connector, Row, WriteQueryResult};
pub use error::{Error, Result};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use sqlite::{SqliteConnector, SqliteDriverConnection, bind_value, decode_rows};
