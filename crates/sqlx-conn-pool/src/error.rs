//! Error types for sqlx-conn-pool

use std::time::Duration;

use thiserror::Error;

/// Errors that may occur when working with sqlx-conn-pool
#[derive(Error, Debug)]
pub enum Error {
   /// Pool or database configuration is invalid or incomplete. Raised when
   /// the pool is constructed and never retried.
   #[error("Configuration error: {0}")]
   Configuration(String),

   /// Opening a new database connection failed.
   #[error("Failed to open database connection: {0}")]
   ConnectionPool(#[source] sqlx::Error),

   /// The pool has been closed and cannot hand out connections
   #[error("Connection pool has been closed")]
   PoolClosed,

   /// No connection became available within the caller's deadline
   #[error("Timed out after {0:?} waiting for a database connection")]
   AcquireTimeout(Duration),
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
