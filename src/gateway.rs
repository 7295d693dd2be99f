//! Connection gateway over the sqlx PostgreSQL driver.
//!
//! One logical connection serves all query traffic, serialized behind an
//! async mutex so that two interleaved executions can never mix commands on
//! the wire. The notification loop gets its own dedicated connection (a lazy
//! one-connection pool), so waiting for events never blocks query execution.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::{
    PgArguments, PgConnectOptions, PgPoolOptions, PgRow, PgStatement,
};
use sqlx::query::Query;
use sqlx::{
    Column, ConnectOptions, Connection, Executor, PgConnection, PgPool, Postgres, Row, Statement,
    TypeInfo,
};
use tokio::sync::Mutex;

use crate::error::{HubError, HubResult};
use crate::shape::{shape, QueryOutput};
use crate::value::SqlValue;

/// Connection parameters, passed opaquely to the driver.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ConnectParams {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            database: database.into(),
        }
    }

    fn pg_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// The boundary to the database driver.
///
/// Owns the single query connection; every use goes through one mutex.
pub struct Gateway {
    params: ConnectParams,
    conn: Mutex<Option<PgConnection>>,
}

impl Gateway {
    pub fn new(params: ConnectParams) -> Self {
        Self {
            params,
            conn: Mutex::new(None),
        }
    }

    /// Open the query connection. No-op when already connected.
    pub async fn connect(&self) -> HubResult<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let conn = self.params.pg_options().connect().await?;
            *guard = Some(conn);
        }
        Ok(())
    }

    /// Close the query connection, releasing all server-side state.
    pub async fn close(&self) -> HubResult<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close().await?;
        }
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Prepare `sql` as a server-side statement and return the owned handle.
    pub async fn prepare(&self, sql: &str) -> HubResult<PgStatement<'static>> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(HubError::NotConnected)?;
        let statement = conn.prepare(sql).await?;
        // `Statement::to_owned`, not `ToOwned::to_owned`: detach the handle
        // from the borrowed query text.
        Ok(Statement::to_owned(&statement))
    }

    /// Release the connection's server-side statement set.
    pub async fn clear_statements(&self) -> HubResult<()> {
        if let Some(conn) = self.conn.lock().await.as_mut() {
            conn.clear_cached_statements()
                .await
                .map_err(HubError::Deallocate)?;
        }
        Ok(())
    }

    /// Execute a prepared query inside an explicit transaction.
    ///
    /// Begin → run → commit on success. A driver-reported error during the
    /// run rolls back and soft-fails: the call returns
    /// [`QueryOutput::None`] rather than propagating, so application code
    /// inside notification handlers does not need to wrap every call.
    /// Commit failures still propagate.
    pub async fn execute(&self, sql: &str, args: &[SqlValue]) -> HubResult<QueryOutput> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(HubError::NotConnected)?;
        let mut tx = conn.begin().await?;

        let mut query = sqlx::query(sql);
        for value in args {
            query = bind_value(query, value);
        }

        match query.fetch_all(&mut *tx).await {
            Ok(rows) => {
                tx.commit().await?;
                let (columns, table) = rows_to_table(&rows);
                Ok(shape(&columns, table))
            }
            Err(error) => {
                tracing::warn!(%error, "query execution failed, rolling back");
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Ok(QueryOutput::None)
            }
        }
    }

    /// A dedicated lazy one-connection pool for the notification listener.
    pub fn notify_pool(&self) -> PgPool {
        PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy_with(self.params.pg_options())
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Null => query.bind(Option::<String>::None),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::String(v) => query.bind(v.clone()),
        SqlValue::Json(v) => query.bind(v.clone()),
    }
}

fn rows_to_table(rows: &[PgRow]) -> (Vec<String>, Vec<Vec<Value>>) {
    let columns: Vec<String> = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let table = rows
        .iter()
        .map(|row| {
            (0..row.columns().len())
                .map(|index| decode_column(row, index))
                .collect()
        })
        .collect();

    (columns, table)
}

/// Convert one cell to a dynamic value, dispatching on the column type name.
/// Unknown types fall back to their text representation; NULL and undecodable
/// cells become `Value::Null`.
fn decode_column(row: &PgRow, index: usize) -> Value {
    let type_name = row.columns()[index].type_info().name();

    match type_name {
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        "INT2" => decode_int(row.try_get::<Option<i16>, _>(index).ok().flatten().map(i64::from)),
        "INT4" => decode_int(row.try_get::<Option<i32>, _>(index).ok().flatten().map(i64::from)),
        "INT8" => decode_int(row.try_get::<Option<i64>, _>(index).ok().flatten()),
        "FLOAT4" => decode_float(
            row.try_get::<Option<f32>, _>(index)
                .ok()
                .flatten()
                .map(f64::from),
        ),
        "FLOAT8" => decode_float(row.try_get::<Option<f64>, _>(index).ok().flatten()),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(index)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_rfc3339()))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

fn decode_int(value: Option<i64>) -> Value {
    value
        .map(|v| Value::Number(v.into()))
        .unwrap_or(Value::Null)
}

fn decode_float(value: Option<f64>) -> Value {
    value
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_params_debug_redacts_password() {
        let params = ConnectParams::new("localhost", 5432, "app", "hunter2", "appdb");
        let debug = format!("{params:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_decode_float_rejects_nan() {
        assert_eq!(decode_float(Some(f64::NAN)), Value::Null);
        assert_eq!(decode_float(Some(1.5)), serde_json::json!(1.5));
        assert_eq!(decode_int(Some(7)), serde_json::json!(7));
        assert_eq!(decode_int(None), Value::Null);
    }

    #[tokio::test]
    async fn test_gateway_refuses_use_before_connect() {
        let gateway = Gateway::new(ConnectParams::new("localhost", 5432, "u", "p", "db"));
        assert!(!gateway.is_connected().await);
        assert!(matches!(
            gateway.prepare("SELECT 1").await,
            Err(HubError::NotConnected)
        ));
        assert!(matches!(
            gateway.execute("SELECT 1", &[]).await,
            Err(HubError::NotConnected)
        ));
        // Releasing statements on a never-connected gateway is a no-op.
        assert!(gateway.clear_statements().await.is_ok());
    }
}
