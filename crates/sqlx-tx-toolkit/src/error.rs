use serde_json::Value as JsonValue;

use crate::coordinator::RetryAttempt;

/// Result type alias for toolkit operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for transaction and query operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from the connection pool (configuration, creation, closed pool).
   #[error(transparent)]
   ConnectionManager(#[from] sqlx_conn_pool::Error),

   /// A statement failed in the driver.
   #[error("query failed: {source} (sql: {sql})")]
   Query {
      sql: String,
      params: Vec<JsonValue>,
      #[source]
      source: sqlx::Error,
   },

   /// Isolation, BEGIN or COMMIT could not be carried out.
   #[error("transaction error: {0}")]
   Transaction(String),

   /// One or more commit or rollback hooks failed.
   ///
   /// Every hook was still given a chance to run. After a commit the data
   /// is durable; after a rollback this is recorded next to the error that
   /// caused it, see [`RetryAttempt::rollback_hooks`].
   #[error("{failed} hook(s) failed; first failure: {first}")]
   HookFailed {
      failed: usize,
      #[source]
      first: Box<Error>,
   },

   /// The current task is mapped to a connection that has no transaction
   /// context. Indicates a bookkeeping bug, never a caller mistake.
   #[error("transaction state corrupted: {0}")]
   TransactionStateCorrupted(String),

   /// Every attempt of a transaction failed.
   #[error("transaction failed after {attempts} attempt(s): {source}")]
   TransactionFailed {
      attempts: u32,
      history: Vec<RetryAttempt>,
      #[source]
      source: Box<Error>,
   },

   /// Transaction has already been committed or rolled back.
   #[error("transaction has already been finalized (committed or rolled back)")]
   TransactionAlreadyFinalized,

   /// A hook was registered outside of a transaction body.
   #[error("no active transaction for the current task")]
   NotInTransaction,

   #[error("invalid argument: {0}")]
   InvalidArgument(String),

   /// Generic error for operations that don't fit other categories.
   #[error("{0}")]
   Other(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::ConnectionManager(e) => match e {
            sqlx_conn_pool::Error::Configuration(_) => "CONFIGURATION_ERROR".to_string(),
            sqlx_conn_pool::Error::PoolClosed => "POOL_CLOSED".to_string(),
            sqlx_conn_pool::Error::AcquireTimeout(_) => "ACQUIRE_TIMEOUT".to_string(),
            sqlx_conn_pool::Error::ConnectionPool(_) => "CONNECTION_ERROR".to_string(),
         },
         Error::Query { source, .. } => {
            database_code(source).unwrap_or_else(|| "QUERY_ERROR".to_string())
         }
         Error::Transaction(_) => "TRANSACTION_ERROR".to_string(),
         Error::HookFailed { .. } => "HOOK_FAILED".to_string(),
         Error::TransactionStateCorrupted(_) => "TRANSACTION_STATE_CORRUPTED".to_string(),
         Error::TransactionFailed { .. } => "TRANSACTION_FAILED".to_string(),
         Error::TransactionAlreadyFinalized => "TRANSACTION_ALREADY_FINALIZED".to_string(),
         Error::NotInTransaction => "NOT_IN_TRANSACTION".to_string(),
         Error::InvalidArgument(_) => "INVALID_ARGUMENT".to_string(),
         Error::Other(_) => "ERROR".to_string(),
      }
   }
}

fn database_code(e: &sqlx::Error) -> Option<String> {
   let code = e.as_database_error().and_then(|db_err| db_err.code())?;
   Some(format!("DATABASE_{}", code))
}
