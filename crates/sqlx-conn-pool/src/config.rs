//! Configuration for database connection pools

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{Error, Result};

/// Database families the pool knows how to validate and configure.
///
/// The family decides which configuration fields are required and which
/// isolation-level syntax a transaction uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseFamily {
   MySql,
   Postgres,
   SqlServer,
   Oracle,
   Odbc,
   Sqlite,
   DuckDb,
}

/// How a family locates its database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyKind {
   /// Server reached over the network (needs `host` and `database`)
   Network,
   /// Embedded engine backed by a file (needs `database` as a path)
   File,
   /// Driver-string based access (needs `dsn`)
   DriverString,
}

impl DatabaseFamily {
   pub fn name(&self) -> &'static str {
      match self {
         DatabaseFamily::MySql => "mysql",
         DatabaseFamily::Postgres => "pgsql",
         DatabaseFamily::SqlServer => "sqlsrv",
         DatabaseFamily::Oracle => "oci",
         DatabaseFamily::Odbc => "odbc",
         DatabaseFamily::Sqlite => "sqlite",
         DatabaseFamily::DuckDb => "duckdb",
      }
   }

   pub fn kind(&self) -> FamilyKind {
      match self {
         DatabaseFamily::MySql
         | DatabaseFamily::Postgres
         | DatabaseFamily::SqlServer
         | DatabaseFamily::Oracle => FamilyKind::Network,
         DatabaseFamily::Sqlite | DatabaseFamily::DuckDb => FamilyKind::File,
         DatabaseFamily::Odbc => FamilyKind::DriverString,
      }
   }
}

impl fmt::Display for DatabaseFamily {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.name())
   }
}

impl FromStr for DatabaseFamily {
   type Err = Error;

   fn from_str(s: &str) -> Result<Self> {
      match s.trim().to_ascii_lowercase().as_str() {
         "mysql" | "mariadb" => Ok(DatabaseFamily::MySql),
         "pgsql" | "postgres" | "postgresql" => Ok(DatabaseFamily::Postgres),
         "sqlsrv" | "mssql" | "sqlserver" => Ok(DatabaseFamily::SqlServer),
         "oci" | "oracle" => Ok(DatabaseFamily::Oracle),
         "odbc" => Ok(DatabaseFamily::Odbc),
         "sqlite" | "sqlite3" => Ok(DatabaseFamily::Sqlite),
         "duckdb" => Ok(DatabaseFamily::DuckDb),
         other => Err(Error::Configuration(format!(
            "unsupported database driver '{other}'"
         ))),
      }
   }
}

/// Connection settings for one database.
///
/// Deserializes from the usual mapping form, so it can come straight out of
/// a JSON or TOML settings file:
///
/// ```
/// use sqlx_conn_pool::{DatabaseConfig, DatabaseFamily};
///
/// let config = DatabaseConfig::from_value(serde_json::json!({
///    "driver": "pgsql",
///    "host": "db.internal",
///    "database": "orders",
///    "username": "app",
/// }))
/// .unwrap();
///
/// assert_eq!(config.family().unwrap(), DatabaseFamily::Postgres);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
   /// Database family name, e.g. `sqlite`, `pgsql`, `mysql`
   pub driver: String,

   #[serde(default)]
   pub host: Option<String>,

   #[serde(default)]
   pub port: Option<u16>,

   /// Database name for network families, file path for embedded ones
   #[serde(default)]
   pub database: Option<String>,

   #[serde(default)]
   pub username: Option<String>,

   #[serde(default)]
   pub password: Option<String>,

   /// Prebuilt driver string for ODBC-style families
   #[serde(default)]
   pub dsn: Option<String>,

   /// Driver-specific extras (e.g. `busy_timeout_ms` for SQLite)
   #[serde(default)]
   pub options: BTreeMap<String, JsonValue>,
}

impl DatabaseConfig {
   /// Configuration for a SQLite database file.
   pub fn sqlite(path: impl Into<String>) -> Self {
      Self {
         driver: DatabaseFamily::Sqlite.name().to_string(),
         database: Some(path.into()),
         ..Default::default()
      }
   }

   /// Configuration for a network database.
   pub fn network(
      driver: impl Into<String>,
      host: impl Into<String>,
      database: impl Into<String>,
   ) -> Self {
      Self {
         driver: driver.into(),
         host: Some(host.into()),
         database: Some(database.into()),
         ..Default::default()
      }
   }

   /// Parse a configuration mapping, reporting any shape problem as a
   /// configuration error.
   pub fn from_value(value: JsonValue) -> Result<Self> {
      serde_json::from_value(value).map_err(|e| Error::Configuration(e.to_string()))
   }

   /// Set a driver-specific option.
   pub fn with_option(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
      self.options.insert(key.into(), value.into());
      self
   }

   /// Resolve the configured driver name to a family.
   pub fn family(&self) -> Result<DatabaseFamily> {
      self.driver.parse()
   }

   /// Read a numeric option, accepting either a number or a numeric string.
   pub fn option_u64(&self, key: &str) -> Option<u64> {
      match self.options.get(key)? {
         JsonValue::Number(n) => n.as_u64(),
         JsonValue::String(s) => s.trim().parse().ok(),
         _ => None,
      }
   }

   /// Check that the configuration names a supported family and supplies
   /// every field that family needs.
   pub fn validate(&self) -> Result<DatabaseFamily> {
      let family = self.family()?;

      let missing = |field: &str| {
         Error::Configuration(format!(
            "'{field}' is required for {family} connections"
         ))
      };

      match family.kind() {
         FamilyKind::Network => {
            if is_blank(&self.host) {
               return Err(missing("host"));
            }
            if is_blank(&self.database) {
               return Err(missing("database"));
            }
         }
         FamilyKind::File => {
            if is_blank(&self.database) {
               return Err(missing("database"));
            }
         }
         FamilyKind::DriverString => {
            if is_blank(&self.dsn) {
               return Err(missing("dsn"));
            }
         }
      }

      Ok(family)
   }
}

fn is_blank(value: &Option<String>) -> bool {
   value.as_deref().is_none_or(|v| v.trim().is_empty())
}

/// Configuration for connection pools
///
/// # Examples
///
/// ```
/// use sqlx_conn_pool::PoolConfig;
///
/// // Use defaults
/// let config = PoolConfig::default();
/// assert_eq!(config.max_size, 10);
///
/// // Override the size
/// let config = PoolConfig { max_size: 3 };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
   /// Maximum number of connections open at once, idle or checked out
   ///
   /// Demand beyond this waits in a FIFO queue until a connection is
   /// released.
   ///
   /// Default: 10
   pub max_size: usize,
}

impl Default for PoolConfig {
   fn default() -> Self {
      Self { max_size: 10 }
   }
}

impl PoolConfig {
   pub fn validate(&self) -> Result<()> {
      if self.max_size == 0 {
         return Err(Error::Configuration(
            "pool max_size must be at least 1".to_string(),
         ));
      }
      Ok(())
   }
}
