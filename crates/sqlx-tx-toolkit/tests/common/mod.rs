//! Shared helpers for toolkit integration tests

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use sqlx_conn_pool::{Connection, Connector, DatabaseConfig, DatabaseFamily, Row, WriteQueryResult};
use sqlx_tx_toolkit::{DatabaseWrapper, PoolConfig, SqliteConnector};
use tempfile::TempDir;

type DriverResult<T> = std::result::Result<T, sqlx::Error>;

/// Show the coordinator's trace output when a test fails.
pub fn init_tracing() {
   let _ = tracing_subscriber::fmt()
      .with_max_level(tracing::Level::TRACE)
      .with_test_writer()
      .try_init();
}

/// Wrapper over a fresh SQLite file with an `items` table.
pub async fn sqlite_db(max_size: usize) -> (DatabaseWrapper<SqliteConnector>, TempDir) {
   let temp_dir = TempDir::new().expect("Failed to create temp directory");
   let path = temp_dir.path().join("test.db");
   let db = DatabaseWrapper::connect(
      DatabaseConfig::sqlite(path.to_string_lossy()),
      Some(PoolConfig { max_size }),
   )
   .expect("Failed to create database wrapper");

   db.execute(
      "CREATE TABLE items (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL)",
      &[],
   )
   .await
   .expect("Failed to create table");

   (db, temp_dir)
}

pub async fn count_items(db: &DatabaseWrapper<SqliteConnector>) -> i64 {
   db.fetch_value("SELECT COUNT(*) FROM items", &[])
      .await
      .unwrap()
      .and_then(|v| v.as_i64())
      .unwrap()
}

/// Connector that talks to no database and records every statement it is
/// asked to run, in order, across all of its connections.
#[derive(Clone)]
pub struct RecordingConnector {
   family: DatabaseFamily,
   log: Arc<Mutex<Vec<String>>>,
}

impl RecordingConnector {
   pub fn new(family: DatabaseFamily) -> Self {
      Self {
         family,
         log: Arc::default(),
      }
   }

   pub fn statements(&self) -> Vec<String> {
      self.log.lock().clone()
   }
}

impl Connector for RecordingConnector {
   type Connection = RecordingConnection;

   async fn connect(&self, _config: &DatabaseConfig) -> DriverResult<RecordingConnection> {
      Ok(RecordingConnection {
         family: self.family,
         log: Arc::clone(&self.log),
         in_transaction: false,
      })
   }
}

pub struct RecordingConnection {
   family: DatabaseFamily,
   log: Arc<Mutex<Vec<String>>>,
   in_transaction: bool,
}

impl RecordingConnection {
   fn record(&self, statement: &str) {
      self.log.lock().push(statement.to_string());
   }
}

impl Connection for RecordingConnection {
   fn family(&self) -> DatabaseFamily {
      self.family
   }

   async fn fetch_all(&mut self, query: &str, _values: &[JsonValue]) -> DriverResult<Vec<Row>> {
      self.record(query);
      Ok(Vec::new())
   }

   async fn execute(&mut self, query: &str, _values: &[JsonValue]) -> DriverResult<WriteQueryResult> {
      self.record(query);
      Ok(WriteQueryResult::default())
   }

   async fn begin(&mut self) -> DriverResult<()> {
      self.record("BEGIN");
      self.in_transaction = true;
      Ok(())
   }

   async fn commit(&mut self) -> DriverResult<()> {
      self.record("COMMIT");
      self.in_transaction = false;
      Ok(())
   }

   async fn rollback(&mut self) -> DriverResult<()> {
      self.record("ROLLBACK");
      self.in_transaction = false;
      Ok(())
   }

   fn in_transaction(&self) -> bool {
      self.in_transaction
   }

   async fn is_alive(&mut self) -> bool {
      true
   }
}

/// Wrapper over a [`RecordingConnector`] for `config`.
pub fn recording_db(
   config: DatabaseConfig,
   family: DatabaseFamily,
) -> (DatabaseWrapper<RecordingConnector>, RecordingConnector) {
   let connector = RecordingConnector::new(family);
   let db = DatabaseWrapper::with_connector(config, Some(PoolConfig { max_size: 2 }), connector.clone())
      .expect("Failed to create database wrapper");
   (db, connector)
}
