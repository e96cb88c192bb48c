use serde::{Serialize, Serializer};

/// Errors from the process-wide database facade.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// A free function was called before [`init`](crate::init).
   #[error("database has not been initialized; call init() first")]
   NotInitialized,

   /// [`init`](crate::init) was called twice without [`reset`](crate::reset).
   #[error("database is already initialized; call reset() before initializing again")]
   AlreadyInitialized,

   /// Error from the transaction toolkit or the pool beneath it.
   #[error(transparent)]
   Toolkit(#[from] sqlx_tx_toolkit::Error),
}

impl Error {
   /// Machine-readable error code, stable across releases.
   pub fn error_code(&self) -> String {
      match self {
         Error::NotInitialized => "NOT_INITIALIZED".to_string(),
         Error::AlreadyInitialized => "ALREADY_INITIALIZED".to_string(),
         Error::Toolkit(e) => e.error_code(),
      }
   }
}

impl From<sqlx_conn_pool::Error> for Error {
   fn from(err: sqlx_conn_pool::Error) -> Self {
      Error::Toolkit(err.into())
   }
}

/// Lets transaction bodies use `?` on the free functions.
impl From<Error> for sqlx_tx_toolkit::Error {
   fn from(err: Error) -> Self {
      match err {
         Error::Toolkit(e) => e,
         other => sqlx_tx_toolkit::Error::Other(other.to_string()),
      }
   }
}

/// Errors serialize as `{ "code": ..., "message": ... }` for logs and
/// API responses.
impl Serialize for Error {
   fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
   where
      S: Serializer,
   {
      use serde::ser::SerializeStruct;
      let mut state = serializer.serialize_struct("Error", 2)?;
      state.serialize_field("code", &self.error_code())?;
      state.serialize_field("message", &self.to_string())?;
      state.end()
   }
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
