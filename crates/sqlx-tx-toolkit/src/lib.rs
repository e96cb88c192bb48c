//! # sqlx-tx-toolkit
//!
//! Transactions with retries, isolation control and commit/rollback hooks
//! on top of [`sqlx_conn_pool`], plus plain queries that find the caller's
//! transaction on their own.
//!
//! ## Core Types
//!
//! - **[`DatabaseWrapper`]**: Entry point for queries, transactions and hooks
//! - **[`TransactionCoordinator`]**: Runs units of work with retry and rollback
//! - **[`Transaction`]**: Handle a unit of work uses to talk to its connection
//! - **[`IsolationLevel`]**: Per-transaction isolation, mapped to each family's SQL
//! - **[`Error`]**: Error type with machine-readable codes
//!
//! ## Routing
//!
//! A transaction body runs inside a task scope. Queries made through the
//! [`DatabaseWrapper`] from that scope use the transaction's connection;
//! queries from anywhere else, including tasks spawned by the body, use the
//! pool.

mod context;
mod coordinator;
mod error;
mod isolation;
pub mod statement;
mod transaction;
mod wrapper;

pub use context::HookFuture;
pub use coordinator::{RetryAttempt, TransactionCoordinator};
pub use error::{Error, Result};
pub use isolation::{IsolationLevel, default_isolation, isolation_statement};
pub use transaction::Transaction;
pub use wrapper::DatabaseWrapper;

// Re-export the pool API so most callers only need this crate
pub use sqlx_conn_pool::{
   ConnectionId, ConnectionPool, DatabaseConfig, DatabaseFamily, PoolConfig, PoolStats, Row,
   SqliteConnector, WriteQueryResult,
};
