//! Isolation levels and the per-family statement that selects them

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx_conn_pool::DatabaseFamily;

use crate::{Error, Result};

/// ANSI transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
   #[serde(rename = "READ UNCOMMITTED", alias = "read_uncommitted")]
   ReadUncommitted,
   #[serde(rename = "READ COMMITTED", alias = "read_committed")]
   ReadCommitted,
   #[serde(rename = "REPEATABLE READ", alias = "repeatable_read")]
   RepeatableRead,
   #[serde(rename = "SERIALIZABLE", alias = "serializable")]
   Serializable,
}

impl IsolationLevel {
   /// The level as it appears in SQL, e.g. `READ COMMITTED`
   pub fn as_sql(&self) -> &'static str {
      match self {
         IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
         IsolationLevel::ReadCommitted => "READ COMMITTED",
         IsolationLevel::RepeatableRead => "REPEATABLE READ",
         IsolationLevel::Serializable => "SERIALIZABLE",
      }
   }
}

impl fmt::Display for IsolationLevel {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_sql())
   }
}

impl FromStr for IsolationLevel {
   type Err = Error;

   /// Accepts the SQL spelling as well as snake or kebab case, in any case.
   fn from_str(s: &str) -> Result<Self> {
      let normalized = s
         .trim()
         .to_ascii_uppercase()
         .replace(['_', '-'], " ");

      match normalized.split_whitespace().collect::<Vec<_>>().join(" ").as_str() {
         "READ UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
         "READ COMMITTED" => Ok(IsolationLevel::ReadCommitted),
         "REPEATABLE READ" => Ok(IsolationLevel::RepeatableRead),
         "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
         _ => Err(Error::InvalidArgument(format!("unknown isolation level '{s}'"))),
      }
   }
}

/// Level a family runs at when none is requested.
pub fn default_isolation(family: DatabaseFamily) -> IsolationLevel {
   match family {
      DatabaseFamily::MySql => IsolationLevel::RepeatableRead,
      DatabaseFamily::Postgres
      | DatabaseFamily::SqlServer
      | DatabaseFamily::Oracle
      | DatabaseFamily::Odbc => IsolationLevel::ReadCommitted,
      DatabaseFamily::Sqlite | DatabaseFamily::DuckDb => IsolationLevel::Serializable,
   }
}

/// Statement to run before `BEGIN` so the transaction uses `requested` (or
/// the family default).
///
/// Returns `Ok(None)` when the family has no statement for it: SQLite is
/// always serializable, and DuckDB cannot change level so only its default
/// is accepted. Levels a family does not support are a
/// [`Error::Transaction`].
pub fn isolation_statement(
   family: DatabaseFamily,
   requested: Option<IsolationLevel>,
) -> Result<Option<String>> {
   let level = requested.unwrap_or_else(|| default_isolation(family));

   match family {
      DatabaseFamily::MySql | DatabaseFamily::SqlServer | DatabaseFamily::Odbc => Ok(Some(
         format!("SET TRANSACTION ISOLATION LEVEL {level}"),
      )),
      DatabaseFamily::Postgres => Ok(Some(format!(
         "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {level}"
      ))),
      DatabaseFamily::Oracle => match level {
         IsolationLevel::ReadCommitted | IsolationLevel::Serializable => {
            Ok(Some(format!("ALTER SESSION SET ISOLATION_LEVEL = {level}")))
         }
         _ => Err(Error::Transaction(format!(
            "isolation level {level} is not supported by {family}; use READ COMMITTED or SERIALIZABLE"
         ))),
      },
      DatabaseFamily::Sqlite => Ok(None),
      DatabaseFamily::DuckDb => match requested {
         None => Ok(None),
         Some(level) => Err(Error::Transaction(format!(
            "{family} does not support setting the isolation level (requested {level})"
         ))),
      },
   }
}
