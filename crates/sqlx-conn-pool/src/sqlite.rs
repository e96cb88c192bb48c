//! Built-in SQLite driver on top of a single `sqlx::SqliteConnection`

use std::str::FromStr;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{
   SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow,
   SqliteValueRef,
};
use sqlx::{Column, ConnectOptions, Decode, Row as _, Sqlite, TypeInfo, ValueRef};
use tracing::trace;

use crate::config::{DatabaseConfig, DatabaseFamily};
use crate::connection::{Connection, Connector, Row, WriteQueryResult};

const MEMORY_PATH: &str = ":memory:";

/// Opens [`SqliteDriverConnection`]s from a `sqlite` [`DatabaseConfig`].
///
/// File databases are created when missing and switched to WAL journal mode
/// so readers and a writer on separate pooled connections don't block each
/// other. Set the `busy_timeout_ms` option to change how long a connection
/// waits on a locked database (sqlx defaults to 5 seconds).
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteConnector;

impl Connector for SqliteConnector {
   type Connection = SqliteDriverConnection;

   async fn connect(&self, config: &DatabaseConfig) -> Result<Self::Connection, sqlx::Error> {
      let path = config
         .database
         .as_deref()
         .ok_or_else(|| sqlx::Error::Configuration("missing sqlite database path".into()))?;

      let mut options = if path == MEMORY_PATH {
         SqliteConnectOptions::from_str("sqlite::memory:")?
      } else {
         SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
      };

      if let Some(ms) = config.option_u64("busy_timeout_ms") {
         options = options.busy_timeout(Duration::from_millis(ms));
      }

      let conn = options.connect().await?;
      trace!(path, "Opened sqlite connection");

      Ok(SqliteDriverConnection {
         conn,
         in_transaction: false,
      })
   }
}

/// A pooled SQLite session.
#[derive(Debug)]
pub struct SqliteDriverConnection {
   conn: SqliteConnection,
   in_transaction: bool,
}

impl SqliteDriverConnection {
   /// Raw sqlx connection, for work the [`Connection`] operations don't cover
   pub fn as_sqlx(&mut self) -> &mut SqliteConnection {
      &mut self.conn
   }
}

impl Connection for SqliteDriverConnection {
   fn family(&self) -> DatabaseFamily {
      DatabaseFamily::Sqlite
   }

   async fn fetch_all(&mut self, query: &str, values: &[JsonValue]) -> Result<Vec<Row>, sqlx::Error> {
      let mut q = sqlx::query(query);
      for value in values {
         q = bind_value(q, value.clone());
      }

      let rows = q.fetch_all(&mut self.conn).await?;
      decode_rows(rows)
   }

   async fn execute(
      &mut self,
      query: &str,
      values: &[JsonValue],
   ) -> Result<WriteQueryResult, sqlx::Error> {
      let mut q = sqlx::query(query);
      for value in values {
         q = bind_value(q, value.clone());
      }

      let result = q.execute(&mut self.conn).await?;
      Ok(WriteQueryResult {
         rows_affected: result.rows_affected(),
         last_insert_id: result.last_insert_rowid(),
      })
   }

   async fn begin(&mut self) -> Result<(), sqlx::Error> {
      // IMMEDIATE takes the write lock up front so two pooled connections
      // can't deadlock upgrading from a shared lock.
      sqlx::query("BEGIN IMMEDIATE").execute(&mut self.conn).await?;
      self.in_transaction = true;
      Ok(())
   }

   async fn commit(&mut self) -> Result<(), sqlx::Error> {
      // A failed COMMIT leaves the transaction open; the flag stays set so
      // the caller knows to roll back.
      sqlx::query("COMMIT").execute(&mut self.conn).await?;
      self.in_transaction = false;
      Ok(())
   }

   async fn rollback(&mut self) -> Result<(), sqlx::Error> {
      sqlx::query("ROLLBACK").execute(&mut self.conn).await?;
      self.in_transaction = false;
      Ok(())
   }

   fn in_transaction(&self) -> bool {
      self.in_transaction
   }

   async fn is_alive(&mut self) -> bool {
      sqlx::query("SELECT 1").execute(&mut self.conn).await.is_ok()
   }
}

/// Helper function to bind a JSON value to a SQLx query
pub fn bind_value<'a>(
   query: sqlx::query::Query<'a, Sqlite, SqliteArguments<'a>>,
   value: JsonValue,
) -> sqlx::query::Query<'a, Sqlite, SqliteArguments<'a>> {
   match value {
      JsonValue::Null => query.bind(None::<String>),
      JsonValue::Bool(flag) => query.bind(flag),
      JsonValue::String(text) => query.bind(text),
      JsonValue::Number(number) => {
         // Preserve integer precision by binding as i64 when possible
         if let Some(int_val) = number.as_i64() {
            query.bind(int_val)
         } else if let Some(uint_val) = number.as_u64() {
            // Value too large for i64, use f64 (will lose precision)
            query.bind(uint_val as f64)
         } else {
            query.bind(number.as_f64().unwrap_or_default())
         }
      }
      // Arrays and objects are stored as JSON text
      other => query.bind(other.to_string()),
   }
}

/// Decode SQLite rows into ordered column maps
pub fn decode_rows(rows: Vec<SqliteRow>) -> Result<Vec<Row>, sqlx::Error> {
   let mut values = Vec::with_capacity(rows.len());
   for row in rows {
      let mut value = Row::default();
      for (i, column) in row.columns().iter().enumerate() {
         let v = row.try_get_raw(i)?;
         value.insert(column.name().to_string(), to_json(v)?);
      }
      values.push(value);
   }
   Ok(values)
}

/// Convert one SQLite value to JSON by its storage class.
///
/// BLOBs become base64 strings; non-finite REALs become null.
fn to_json(value: SqliteValueRef<'_>) -> Result<JsonValue, sqlx::Error> {
   if value.is_null() {
      return Ok(JsonValue::Null);
   }

   let type_name = value.type_info().name().to_ascii_uppercase();
   let decoded = match type_name.as_str() {
      "INTEGER" | "INT" | "INT8" | "BIGINT" | "BOOLEAN" => {
         <i64 as Decode<Sqlite>>::decode(value).map(JsonValue::from)
      }
      "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => <f64 as Decode<Sqlite>>::decode(value).map(|v| {
         serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
      }),
      "BLOB" => <Vec<u8> as Decode<Sqlite>>::decode(value)
         .map(|bytes| JsonValue::String(BASE64.encode(bytes))),
      _ => <String as Decode<Sqlite>>::decode(value).map(JsonValue::String),
   };

   decoded.map_err(sqlx::Error::Decode)
}
