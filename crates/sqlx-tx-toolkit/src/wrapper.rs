use std::future::Future;

use serde_json::Value as JsonValue;
use sqlx_conn_pool::{
   ConnectionPool, Connector, DatabaseConfig, PoolConfig, PoolStats, Row, SqliteConnector,
   WriteQueryResult,
};

use crate::coordinator::TransactionCoordinator;
use crate::isolation::IsolationLevel;
use crate::statement;
use crate::transaction::Transaction;
use crate::Result;

/// Database access for many cooperating tasks: plain queries, retried
/// transactions and transaction hooks behind one handle.
///
/// Queries issued from inside a transaction body run on that transaction's
/// connection. Everywhere else they check a connection out of the pool for
/// the single call and always give it back, whether the call succeeded or
/// not.
pub struct DatabaseWrapper<C: Connector = SqliteConnector> {
   coordinator: TransactionCoordinator<C>,
}

impl<C: Connector> Clone for DatabaseWrapper<C> {
   fn clone(&self) -> Self {
      Self {
         coordinator: self.coordinator.clone(),
      }
   }
}

impl DatabaseWrapper<SqliteConnector> {
   /// Create a wrapper over a new pool using the built-in driver.
   ///
   /// Validates the configuration only; connections are opened on first use.
   pub fn connect(config: DatabaseConfig, pool_config: Option<PoolConfig>) -> Result<Self> {
      Ok(Self::from_pool(ConnectionPool::new(config, pool_config)?))
   }
}

impl<C: Connector> DatabaseWrapper<C> {
   /// Create a wrapper over a new pool that opens connections through
   /// `connector`.
   pub fn with_connector(
      config: DatabaseConfig,
      pool_config: Option<PoolConfig>,
      connector: C,
   ) -> Result<Self> {
      Ok(Self::from_pool(ConnectionPool::with_connector(
         config,
         pool_config,
         connector,
      )?))
   }

   pub fn from_pool(pool: ConnectionPool<C>) -> Self {
      Self {
         coordinator: TransactionCoordinator::new(pool),
      }
   }

   pub fn pool(&self) -> &ConnectionPool<C> {
      self.coordinator.pool()
   }

   pub fn coordinator(&self) -> &TransactionCoordinator<C> {
      &self.coordinator
   }

   /// Execute a SELECT query, possibly returning multiple rows
   pub async fn query(&self, sql: &str, params: &[JsonValue]) -> Result<Vec<Row>> {
      let mut routed = self.coordinator.route().await?;
      let result = match routed.connection() {
         Ok(conn) => statement::query(conn, sql, params).await,
         Err(e) => Err(e),
      };
      routed.finish().await;
      result
   }

   /// Execute a SELECT query, returning only the first row
   pub async fn fetch_one(&self, sql: &str, params: &[JsonValue]) -> Result<Option<Row>> {
      let mut routed = self.coordinator.route().await?;
      let result = match routed.connection() {
         Ok(conn) => statement::fetch_one(conn, sql, params).await,
         Err(e) => Err(e),
      };
      routed.finish().await;
      result
   }

   /// First column of the first row, or `None` when nothing matched
   pub async fn fetch_value(&self, sql: &str, params: &[JsonValue]) -> Result<Option<JsonValue>> {
      let mut routed = self.coordinator.route().await?;
      let result = match routed.connection() {
         Ok(conn) => statement::fetch_value(conn, sql, params).await,
         Err(e) => Err(e),
      };
      routed.finish().await;
      result
   }

   /// Execute a write query (INSERT/UPDATE/DELETE)
   pub async fn execute(&self, sql: &str, params: &[JsonValue]) -> Result<WriteQueryResult> {
      let mut routed = self.coordinator.route().await?;
      let result = match routed.connection() {
         Ok(conn) => statement::execute(conn, sql, params).await,
         Err(e) => Err(e),
      };
      routed.finish().await;
      result
   }

   /// Run `unit_of_work` once in a transaction at the family's default
   /// isolation level.
   ///
   /// # Example
   ///
   /// ```no_run
   /// # use serde_json::json;
   /// # use sqlx_conn_pool::DatabaseConfig;
   /// # use sqlx_tx_toolkit::{DatabaseWrapper, Error};
   /// # async fn example() -> sqlx_tx_toolkit::Result<()> {
   /// let db = DatabaseWrapper::connect(DatabaseConfig::sqlite("app.db"), None)?;
   ///
   /// let order_id = db
   ///    .transaction(|tx| async move {
   ///       let order = tx
   ///          .execute("INSERT INTO orders (total) VALUES ($1)", &[json!(42)])
   ///          .await?;
   ///       tx.on_commit(|| async { Ok(()) })?;
   ///       Ok::<_, Error>(order.last_insert_id)
   ///    })
   ///    .await?;
   /// # Ok(())
   /// # }
   /// ```
   pub async fn transaction<T, F, Fut>(&self, unit_of_work: F) -> Result<T>
   where
      F: FnMut(Transaction<C>) -> Fut,
      Fut: Future<Output = Result<T>>,
   {
      self.coordinator.run(unit_of_work, 1, None).await
   }

   /// Run `unit_of_work` in a transaction, retrying up to `attempts` times
   /// at the given isolation level (or the family default).
   pub async fn transaction_with<T, F, Fut>(
      &self,
      unit_of_work: F,
      attempts: u32,
      isolation: Option<IsolationLevel>,
   ) -> Result<T>
   where
      F: FnMut(Transaction<C>) -> Fut,
      Fut: Future<Output = Result<T>>,
   {
      self.coordinator.run(unit_of_work, attempts, isolation).await
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

   pub fn in_transaction(&self) -> bool {
      self.coordinator.in_transaction()
   }

   pub fn stats(&self) -> PoolStats {
      self.pool().stats()
   }

   /// Close the underlying pool. See [`ConnectionPool::close`].
   pub fn close(&self) {
      self.pool().close()
   }
}
