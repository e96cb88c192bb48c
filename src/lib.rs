//! # sqlx-task-db
//!
//! Process-wide database access for async tasks.
//!
//! Call [`init`] once at startup; every free function in this crate then
//! runs against that database. Applications that need more than one
//! database, or want to inject the handle, use
//! [`DatabaseWrapper`] from `sqlx-tx-toolkit` directly: the free functions
//! are thin sugar over one shared wrapper.
//!
//! ```no_run
//! use serde_json::json;
//! use sqlx_task_db::DatabaseConfig;
//!
//! # async fn example() -> sqlx_task_db::Result<()> {
//! sqlx_task_db::init(DatabaseConfig::sqlite("app.db"), None)?;
//!
//! sqlx_task_db::transaction(|tx| async move {
//!    tx.execute("INSERT INTO audit (event) VALUES ($1)", &[json!("login")])
//!       .await?;
//!    // Runs on the transaction's connection, found through the task scope
//!    sqlx_task_db::execute("UPDATE users SET seen = 1", &[]).await?;
//!    Ok::<_, sqlx_tx_toolkit::Error>(())
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use tracing::debug;

mod error;

pub use error::{Error, Result};
pub use sqlx_tx_toolkit::{
   DatabaseConfig, DatabaseFamily, DatabaseWrapper, IsolationLevel, PoolConfig, PoolStats,
   RetryAttempt, Row, Transaction, WriteQueryResult,
};

static DATABASE: RwLock<Option<Arc<DatabaseWrapper>>> = RwLock::new(None);

/// Initialize the shared database with the built-in SQLite driver.
///
/// Validates the configuration; connections are opened on first use.
pub fn init(config: DatabaseConfig, pool_config: Option<PoolConfig>) -> Result<()> {
   let wrapper = DatabaseWrapper::connect(config, pool_config)?;
   init_with(wrapper)
}

/// Install an already built wrapper as the shared database.
pub fn init_with(wrapper: DatabaseWrapper) -> Result<()> {
   let mut slot = DATABASE.write();
   if slot.is_some() {
      return Err(Error::AlreadyInitialized);
   }

   debug!(family = %wrapper.pool().family(), "Initialized shared database");
   *slot = Some(Arc::new(wrapper));
   Ok(())
}

/// The shared database.
pub fn get() -> Result<Arc<DatabaseWrapper>> {
   DATABASE.read().clone().ok_or(Error::NotInitialized)
}

/// Close the shared database's pool and forget it, so [`init`] can be
/// called again. A no-op when nothing is initialized.
pub fn reset() {
   if let Some(wrapper) = DATABASE.write().take() {
      wrapper.close();
      debug!("Reset shared database");
   }
}

/// See [`DatabaseWrapper::query`].
pub async fn query(sql: &str, params: &[JsonValue]) -> Result<Vec<Row>> {
   Ok(get()?.query(sql, params).await?)
}

/// See [`DatabaseWrapper::fetch_one`].
pub async fn fetch_one(sql: &str, params: &[JsonValue]) -> Result<Option<Row>> {
   Ok(get()?.fetch_one(sql, params).await?)
}

/// See [`DatabaseWrapper::fetch_value`].
pub async fn fetch_value(sql: &str, params: &[JsonValue]) -> Result<Option<JsonValue>> {
   Ok(get()?.fetch_value(sql, params).await?)
}

/// See [`DatabaseWrapper::execute`].
pub async fn execute(sql: &str, params: &[JsonValue]) -> Result<WriteQueryResult> {
   Ok(get()?.execute(sql, params).await?)
}

/// See [`DatabaseWrapper::transaction`].
pub async fn transaction<T, F, Fut>(unit_of_work: F) -> Result<T>
where
   F: FnMut(Transaction) -> Fut,
   Fut: Future<Output = sqlx_tx_toolkit::Result<T>>,
{
   Ok(get()?.transaction(unit_of_work).await?)
}

/// See [`DatabaseWrapper::transaction_with`].
pub async fn transaction_with<T, F, Fut>(
   unit_of_work: F,
   attempts: u32,
   isolation: Option<IsolationLevel>,
) -> Result<T>
where
   F: FnMut(Transaction) -> Fut,
   Fut: Future<Output = sqlx_tx_toolkit::Result<T>>,
{
   Ok(get()?
      .transaction_with(unit_of_work, attempts, isolation)
      .await?)
}

/// See [`DatabaseWrapper::on_commit`].
pub fn on_commit<F, Fut>(hook: F) -> Result<()>
where
   F: FnOnce() -> Fut + Send + 'static,
   Fut: Future<Output = sqlx_tx_toolkit::Result<()>> + Send + 'static,
{
   Ok(get()?.on_commit(hook)?)
}

/// See [`DatabaseWrapper::on_rollback`].
pub fn on_rollback<F, Fut>(hook: F) -> Result<()>
where
   F: FnOnce() -> Fut + Send + 'static,
   Fut: Future<Output = sqlx_tx_toolkit::Result<()>> + Send + 'static,
{
   Ok(get()?.on_rollback(hook)?)
}

/// See [`DatabaseWrapper::stats`].
pub fn stats() -> Result<PoolStats> {
   Ok(get()?.stats())
}

/// Close the shared pool without forgetting it. Later calls fail with a
/// pool-closed error until [`reset`] and [`init`].
pub fn close() -> Result<()> {
   get()?.close();
   Ok(())
}
