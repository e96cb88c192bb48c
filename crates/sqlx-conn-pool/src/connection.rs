//! The seam between the pool and a database driver
//!
//! The pool never talks to a database directly. It opens sessions through a
//! [`Connector`] and drives them through the [`Connection`] operations below,
//! which keeps the pool and everything layered on it independent of any one
//! driver. [`SqliteConnector`](crate::SqliteConnector) is the built-in
//! implementation.

use std::fmt;
use std::future::Future;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::config::{DatabaseConfig, DatabaseFamily};

/// One decoded result row, keyed by column name in select order.
pub type Row = IndexMap<String, JsonValue>;

/// Result returned from write operations (e.g. INSERT, UPDATE, DELETE).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteQueryResult {
   /// The number of rows affected by the write operation.
   pub rows_affected: u64,
   /// The last inserted row ID, for drivers that report one (0 otherwise).
   pub last_insert_id: i64,
}

/// Pool-unique identity of one physical connection.
///
/// Stays the same for as long as the connection lives, across any number of
/// check-outs and hand-offs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
   pub fn as_u64(&self) -> u64 {
      self.0
   }
}

impl fmt::Display for ConnectionId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}", self.0)
   }
}

/// A single live database session.
///
/// Implementations are owned by exactly one task at a time; the pool never
/// calls into a connection that has been handed out.
pub trait Connection: Send + 'static {
   /// Family of the database this session talks to
   fn family(&self) -> DatabaseFamily;

   /// Run a statement and decode every returned row
   fn fetch_all(
      &mut self,
      query: &str,
      values: &[JsonValue],
   ) -> impl Future<Output = Result<Vec<Row>, sqlx::Error>> + Send;

   /// Run a statement for its side effects
   fn execute(
      &mut self,
      query: &str,
      values: &[JsonValue],
   ) -> impl Future<Output = Result<WriteQueryResult, sqlx::Error>> + Send;

   fn begin(&mut self) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

   fn commit(&mut self) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

   fn rollback(&mut self) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

   /// Whether a transaction opened with [`Connection::begin`] is still open
   fn in_transaction(&self) -> bool;

   /// Lightweight liveness check, typically `SELECT 1`
   fn is_alive(&mut self) -> impl Future<Output = bool> + Send;
}

/// Opens new connections for a pool.
pub trait Connector: Send + Sync + 'static {
   type Connection: Connection;

   fn connect(
      &self,
      config: &DatabaseConfig,
   ) -> impl Future<Output = Result<Self::Connection, sqlx::Error>> + Send;
}
