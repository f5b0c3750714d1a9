//! In-memory mock connector
//!
//! Deterministic canned data with simulated latency. Used by the test suite
//! and as the ultimate fallback store: it always answers, so a gateway
//! configured with a mock fallback keeps serving reads while real stores are
//! down.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::ConnectorConfig;
use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::types::{
    parse_statement, ConnectorMetadata, ExecuteResult, HealthStatus, QueryResult, Row, StoreKind,
    Value,
};

/// Deterministic in-memory connector.
pub struct MockConnector {
    locator: String,
    latency: Duration,
    tables: RwLock<HashMap<String, Vec<Row>>>,
    applied: RwLock<Vec<String>>,
    failing: AtomicBool,
    connected: AtomicBool,
}

impl MockConnector {
    /// Create a mock with the default canned dataset.
    pub fn new(config: &ConnectorConfig) -> Self {
        let latency = config
            .options
            .get("latency_ms")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(1));

        Self {
            locator: config.locator.clone(),
            latency,
            tables: RwLock::new(canned_dataset()),
            applied: RwLock::new(Vec::new()),
            failing: AtomicBool::new(false),
            connected: AtomicBool::new(true),
        }
    }

    /// Create an empty mock with no canned data (test helper).
    pub fn empty() -> Self {
        Self {
            locator: "mock://empty".to_string(),
            latency: Duration::ZERO,
            tables: RwLock::new(HashMap::new()),
            applied: RwLock::new(Vec::new()),
            failing: AtomicBool::new(false),
            connected: AtomicBool::new(true),
        }
    }

    /// Toggle failure injection: while failing, every operation raises a
    /// connection-level error and pings report unhealthy.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Replace the rows of one table.
    pub fn set_table(&self, table: impl Into<String>, rows: Vec<Row>) {
        self.tables.write().insert(table.into(), rows);
    }

    /// Statements applied through `execute`, in order (test helper).
    pub fn applied_statements(&self) -> Vec<String> {
        self.applied.read().clone()
    }

    fn check_up(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::connection("mock connector failure injected"));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::connection("mock connector closed"));
        }
        Ok(())
    }

    fn table_for_select(&self, sql: &str) -> Option<String> {
        let lower = sql.to_ascii_lowercase();
        let from = lower.find(" from ")?;
        let rest = sql[from + 6..].trim_start();
        let table: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        (!table.is_empty()).then_some(table)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn query(&self, sql: &str, _params: &[Value]) -> Result<QueryResult> {
        let start = Instant::now();
        tokio::time::sleep(self.latency).await;
        self.check_up()?;

        match self.table_for_select(sql) {
            Some(table) => {
                let rows = self
                    .tables
                    .read()
                    .get(&table)
                    .cloned()
                    .unwrap_or_default();
                Ok(QueryResult::ok(rows, start.elapsed()))
            }
            None => Ok(QueryResult::failed(
                format!("mock cannot interpret statement: {sql}"),
                start.elapsed(),
            )),
        }
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        tokio::time::sleep(self.latency).await;
        self.check_up()?;

        match parse_statement(sql) {
            Some((kind, table)) => {
                self.applied.write().push(sql.to_string());
                // Inserts grow the canned table so follow-up reads observe them
                if kind == crate::types::MutationKind::Insert {
                    let row = Row::new(
                        (0..params.len()).map(|i| format!("p{i}")).collect(),
                        params.to_vec(),
                    );
                    self.tables.write().entry(table).or_default().push(row);
                }
                Ok(ExecuteResult::applied(1))
            }
            None => Ok(ExecuteResult::failed()),
        }
    }

    async fn ping(&self) -> HealthStatus {
        let start = Instant::now();
        tokio::time::sleep(self.latency).await;
        if self.failing.load(Ordering::SeqCst) || !self.connected.load(Ordering::SeqCst) {
            HealthStatus::unhealthy(start.elapsed(), "mock connector unavailable")
        } else {
            HealthStatus::healthy(start.elapsed()).with_metadata("store", "mock")
        }
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn metadata(&self) -> ConnectorMetadata {
        ConnectorMetadata {
            kind: StoreKind::InMemoryMock,
            masked_locator: self.locator.clone(),
            capabilities: vec!["query".into(), "execute".into()],
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.failing.load(Ordering::SeqCst)
    }
}

/// Small deterministic retail dataset for tests and demos.
fn canned_dataset() -> HashMap<String, Vec<Row>> {
    let mut tables = HashMap::new();
    tables.insert(
        "transactions".to_string(),
        vec![
            Row::new(
                vec!["id".into(), "store_id".into(), "amount".into()],
                vec![Value::Int(1), Value::from("riyadh-01"), Value::Float(24.5)],
            ),
            Row::new(
                vec!["id".into(), "store_id".into(), "amount".into()],
                vec![Value::Int(2), Value::from("jeddah-02"), Value::Float(9.75)],
            ),
        ],
    );
    tables.insert(
        "products".to_string(),
        vec![Row::new(
            vec!["sku".into(), "name".into()],
            vec![Value::from("SKU-100"), Value::from("Sparkling water")],
        )],
    );
    tables
}
