//! Scoped transaction handle passed to units of work

use std::future::Future;

use serde_json::Value as JsonValue;
use sqlx_conn_pool::{ConnectionId, Connector, PooledConnection, Row, SqliteConnector, WriteQueryResult};
use tokio::sync::MappedMutexGuard;

use crate::context::SharedConnection;
use crate::coordinator::TransactionCoordinator;
use crate::statement;
use crate::{Error, Result};

/// Handle to the transaction a unit of work runs in.
///
/// Every query goes to the transaction's own connection, never to the pool.
/// The handle is only good for the attempt it was created for: once the
/// coordinator commits or rolls back, every operation fails with
/// [`Error::TransactionAlreadyFinalized`].
///
/// Clones share the same connection; operations on them run one at a time.
pub struct Transaction<C: Connector = SqliteConnector> {
   coordinator: TransactionCoordinator<C>,
   connection: SharedConnection<C>,
   id: ConnectionId,
}

impl<C: Connector> Clone for Transaction<C> {
   fn clone(&self) -> Self {
      Self {
         coordinator: self.coordinator.clone(),
         connection: self.connection.clone(),
         id: self.id,
      }
   }
}

impl<C: Connector> Transaction<C> {
   pub(crate) fn new(
      coordinator: TransactionCoordinator<C>,
      connection: SharedConnection<C>,
      id: ConnectionId,
   ) -> Self {
      Self {
         coordinator,
         connection,
         id,
      }
   }

   /// Pool identity of the connection this transaction runs on
   pub fn connection_id(&self) -> ConnectionId {
      self.id
   }

   /// Execute a SELECT query, possibly returning multiple rows
   pub async fn query(&self, sql: &str, params: &[JsonValue]) -> Result<Vec<Row>> {
      let mut conn = self.connection().await?;
      statement::query(&mut **conn, sql, params).await
   }

   /// Execute a SELECT query, returning only the first row
   pub async fn fetch_one(&self, sql: &str, params: &[JsonValue]) -> Result<Option<Row>> {
      let mut conn = self.connection().await?;
      statement::fetch_one(&mut **conn, sql, params).await
   }

   pub async fn fetch_value(&self, sql: &str, params: &[JsonValue]) -> Result<Option<JsonValue>> {
      let mut conn = self.connection().await?;
      statement::fetch_value(&mut **conn, sql, params).await
   }

   /// Execute a write query (INSERT/UPDATE/DELETE)
   pub async fn execute(&self, sql: &str, params: &[JsonValue]) -> Result<WriteQueryResult> {
      let mut conn = self.connection().await?;
      statement::execute(&mut **conn, sql, params).await
   }

   /// See [`TransactionCoordinator::on_commit`].
   pub fn on_commit<F, Fut>(&self, hook: F) -> Result<()>
   where
      F: FnOnce() -> Fut + Send + 'static,
      Fut: Future<Output = Result<()>> + Send + 'static,
   {
      self.coordinator.on_commit(hook)
   }

   /// See [`TransactionCoordinator::on_rollback`].
   pub fn on_rollback<F, Fut>(&self, hook: F) -> Result<()>
   where
      F: FnOnce() -> Fut + Send + 'static,
      Fut: Future<Output = Result<()>> + Send + 'static,
   {
      self.coordinator.on_rollback(hook)
   }

   /// Lock and borrow the underlying connection.
   ///
   /// Other operations on this transaction, including ambient
   /// [`DatabaseWrapper`](crate::DatabaseWrapper) queries from the same
   /// body, wait until the guard is dropped.
   pub async fn connection(&self) -> Result<MappedMutexGuard<'_, PooledConnection<C>>> {
      let guard = self.connection.lock().await;
      tokio::sync::MutexGuard::try_map(guard, Option::as_mut)
         .map_err(|_| Error::TransactionAlreadyFinalized)
   }
}
