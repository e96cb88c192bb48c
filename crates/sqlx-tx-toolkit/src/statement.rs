//! Statement execution and result shaping over any [`Connection`]

use serde_json::Value as JsonValue;
use sqlx_conn_pool::{Connection, Row, WriteQueryResult};

use crate::{Error, Result};

/// Execute a SELECT query, returning every row
pub async fn query<T: Connection>(
   conn: &mut T,
   sql: &str,
   params: &[JsonValue],
) -> Result<Vec<Row>> {
   conn
      .fetch_all(sql, params)
      .await
      .map_err(|e| query_error(sql, params, e))
}

/// Execute a SELECT query and keep only the first row
pub async fn fetch_one<T: Connection>(
   conn: &mut T,
   sql: &str,
   params: &[JsonValue],
) -> Result<Option<Row>> {
   Ok(query(conn, sql, params).await?.into_iter().next())
}

/// First column of the first row, e.g. for `SELECT COUNT(*) ...`
pub async fn fetch_value<T: Connection>(
   conn: &mut T,
   sql: &str,
   params: &[JsonValue],
) -> Result<Option<JsonValue>> {
   let row = fetch_one(conn, sql, params).await?;
   Ok(row.and_then(|row| row.into_iter().next().map(|(_, value)| value)))
}

/// Execute a write query (INSERT/UPDATE/DELETE)
pub async fn execute<T: Connection>(
   conn: &mut T,
   sql: &str,
   params: &[JsonValue],
) -> Result<WriteQueryResult> {
   conn
      .execute(sql, params)
      .await
      .map_err(|e| query_error(sql, params, e))
}

fn query_error(sql: &str, params: &[JsonValue], source: sqlx::Error) -> Error {
   Error::Query {
      sql: sql.to_string(),
      params: params.to_vec(),
      source,
   }
}
