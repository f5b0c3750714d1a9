//! Embedded file-based connector (SQLite)
//!
//! Owns a single rusqlite connection behind a mutex; all statement work runs
//! on the blocking thread pool so the async runtime never stalls on disk I/O.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::config::ConnectorConfig;
use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::types::{
    mask_locator, ConnectorMetadata, ExecuteResult, HealthStatus, QueryResult, Row, StoreKind,
    Value,
};

const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

type SharedConnection = Arc<Mutex<Option<rusqlite::Connection>>>;

/// Connector over an embedded SQLite database file.
pub struct EmbeddedConnector {
    locator: String,
    conn: SharedConnection,
    connected: AtomicBool,
    ping_timeout: Duration,
}

impl EmbeddedConnector {
    /// Open (or create) the database file named by the config locator.
    pub fn open(config: &ConnectorConfig) -> Result<Self> {
        let conn = rusqlite::Connection::open(&config.locator)
            .map_err(|e| Error::connection(format!("opening {}: {e}", config.locator)))?;
        Ok(Self {
            locator: config.locator.clone(),
            conn: Arc::new(Mutex::new(Some(conn))),
            connected: AtomicBool::new(true),
            ping_timeout: config.option_secs("ping_timeout_secs").unwrap_or(DEFAULT_PING_TIMEOUT),
        })
    }

    fn connection(&self) -> SharedConnection {
        Arc::clone(&self.conn)
    }
}

/// Outcome of a blocking statement run: query-level failures carry a message
/// instead of raising, so the breaker only ever sees connection problems.
enum SqlOutcome<T> {
    Ok(T),
    QueryError(String),
}

fn classify(e: rusqlite::Error) -> std::result::Result<String, Error> {
    if let rusqlite::Error::SqliteFailure(inner, ref message) = e {
        use rusqlite::ErrorCode::*;
        if matches!(
            inner.code,
            CannotOpen | DiskFull | DatabaseBusy | DatabaseLocked | SystemIoFailure | NotADatabase
        ) {
            return Err(Error::connection(
                message.clone().unwrap_or_else(|| e.to_string()),
            ));
        }
    }
    Ok(e.to_string())
}

fn to_sqlite(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(i64::from(*b)),
        Value::Int(n) => rusqlite::types::Value::Integer(*n),
        Value::Float(n) => rusqlite::types::Value::Real(*n),
        Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
        Value::Bytes(b) => rusqlite::types::Value::Blob(b.clone()),
        Value::Json(v) => rusqlite::types::Value::Text(v.to_string()),
    }
}

fn from_sqlite(value: rusqlite::types::ValueRef<'_>) -> Value {
    match value {
        rusqlite::types::ValueRef::Null => Value::Null,
        rusqlite::types::ValueRef::Integer(n) => Value::Int(n),
        rusqlite::types::ValueRef::Real(n) => Value::Float(n),
        rusqlite::types::ValueRef::Text(bytes) => {
            Value::Text(String::from_utf8_lossy(bytes).into_owned())
        }
        rusqlite::types::ValueRef::Blob(bytes) => Value::Bytes(bytes.to_vec()),
    }
}

fn run_query(
    conn: &SharedConnection,
    sql: &str,
    params: &[Value],
) -> Result<SqlOutcome<Vec<Row>>> {
    let guard = conn.lock();
    let Some(conn) = guard.as_ref() else {
        return Err(Error::connection("embedded connector closed"));
    };

    let bound: Vec<rusqlite::types::Value> = params.iter().map(to_sqlite).collect();

    let mut stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(e) => return Ok(SqlOutcome::QueryError(classify(e)?)),
    };
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let column_count = columns.len();

    let mut rows = match stmt.query(rusqlite::params_from_iter(bound.iter())) {
        Ok(rows) => rows,
        Err(e) => return Ok(SqlOutcome::QueryError(classify(e)?)),
    };

    let mut out = Vec::new();
    loop {
        match rows.next() {
            Ok(Some(row)) => {
                let mut values = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    match row.get_ref(i) {
                        Ok(v) => values.push(from_sqlite(v)),
                        Err(e) => return Ok(SqlOutcome::QueryError(classify(e)?)),
                    }
                }
                out.push(Row::new(columns.clone(), values));
            }
            Ok(None) => break,
            Err(e) => return Ok(SqlOutcome::QueryError(classify(e)?)),
        }
    }
    Ok(SqlOutcome::Ok(out))
}

fn run_execute(conn: &SharedConnection, sql: &str, params: &[Value]) -> Result<SqlOutcome<u64>> {
    let guard = conn.lock();
    let Some(conn) = guard.as_ref() else {
        return Err(Error::connection("embedded connector closed"));
    };

    let bound: Vec<rusqlite::types::Value> = params.iter().map(to_sqlite).collect();
    match conn.execute(sql, rusqlite::params_from_iter(bound.iter())) {
        Ok(affected) => Ok(SqlOutcome::Ok(affected as u64)),
        Err(e) => Ok(SqlOutcome::QueryError(classify(e)?)),
    }
}

#[async_trait]
impl Connector for EmbeddedConnector {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let start = Instant::now();
        let conn = self.connection();
        let sql_owned = sql.to_string();
        let params_owned = params.to_vec();

        let outcome = tokio::task::spawn_blocking(move || {
            run_query(&conn, &sql_owned, &params_owned)
        })
        .await
        .map_err(|e| Error::internal(format!("query task panicked: {e}")))??;

        match outcome {
            SqlOutcome::Ok(rows) => Ok(QueryResult::ok(rows, start.elapsed())),
            SqlOutcome::QueryError(message) => Ok(QueryResult::failed(message, start.elapsed())),
        }
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        let conn = self.connection();
        let sql_owned = sql.to_string();
        let params_owned = params.to_vec();

        let outcome = tokio::task::spawn_blocking(move || {
            run_execute(&conn, &sql_owned, &params_owned)
        })
        .await
        .map_err(|e| Error::internal(format!("execute task panicked: {e}")))??;

        match outcome {
            SqlOutcome::Ok(affected) => Ok(ExecuteResult::applied(affected)),
            SqlOutcome::QueryError(message) => {
                warn!(error = %message, "embedded execute failed");
                Ok(ExecuteResult::failed())
            }
        }
    }

    async fn ping(&self) -> HealthStatus {
        let start = Instant::now();
        if !self.connected.load(Ordering::SeqCst) {
            return HealthStatus::unhealthy(start.elapsed(), "embedded connector closed");
        }

        let conn = self.connection();
        let probe = tokio::task::spawn_blocking(move || run_query(&conn, "SELECT 1", &[]));

        match tokio::time::timeout(self.ping_timeout, probe).await {
            Ok(Ok(Ok(SqlOutcome::Ok(_)))) => {
                HealthStatus::healthy(start.elapsed()).with_metadata("store", "sqlite")
            }
            Ok(Ok(Ok(SqlOutcome::QueryError(message)))) => {
                HealthStatus::unhealthy(start.elapsed(), message)
            }
            Ok(Ok(Err(e))) => HealthStatus::unhealthy(start.elapsed(), e.to_string()),
            Ok(Err(e)) => HealthStatus::unhealthy(start.elapsed(), format!("ping task: {e}")),
            Err(_) => HealthStatus::unhealthy(start.elapsed(), "ping timed out"),
        }
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the connection releases the file handles; repeated closes
        // find the slot already empty.
        let conn = self.connection();
        tokio::task::spawn_blocking(move || {
            drop(conn.lock().take());
        })
        .await
        .map_err(|e| Error::internal(format!("close task panicked: {e}")))?;
        Ok(())
    }

    fn metadata(&self) -> ConnectorMetadata {
        ConnectorMetadata {
            kind: StoreKind::EmbeddedFile,
            masked_locator: mask_locator(&self.locator),
            capabilities: vec!["query".into(), "execute".into()],
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
