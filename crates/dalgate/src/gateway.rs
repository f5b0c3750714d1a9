//! DAL gateway
//!
//! Routes every statement through the active connector's circuit breaker,
//! falls back to a configured secondary connector on connection-level
//! failure, and captures failed mutations in the durable sync queue for
//! later replay. Two background timers keep the system converging: a health
//! loop that switches back and forth between stores, and a drain loop that
//! replays the queue.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::config::{ConnectorConfig, GatewayConfig};
use crate::connector::{create_connector, Connector};
use crate::error::{Error, Result};
use crate::metrics::{ConnectorStatusReport, DalMetrics, OperationStats, QueueSummary};
use crate::queue::{DeadLetterFn, DrainOutcome, QueueItem, SyncQueue, SyncQueueStatus};
use crate::types::{
    parse_statement, validate_identifier, ExecuteResult, HealthStatus, QueryResult, Row, Value,
};

#[derive(Clone)]
struct ConnectorEntry {
    config: ConnectorConfig,
    connector: Arc<dyn Connector>,
    breaker: Arc<CircuitBreaker>,
}

struct GatewayInner {
    config: GatewayConfig,
    registry: RwLock<HashMap<String, ConnectorEntry>>,
    active: RwLock<Option<String>>,
    queue: Arc<SyncQueue>,
    stats: OperationStats,
    last_health_check: RwLock<Option<DateTime<Utc>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

/// Uniform data-access facade over a set of registered connectors.
///
/// Cheap to clone; all clones share the same registry, queue, and timers.
#[derive(Clone)]
pub struct DalGateway {
    inner: Arc<GatewayInner>,
}

impl DalGateway {
    /// Create a gateway. The sync queue snapshot (if persistence is
    /// configured) is reloaded here.
    pub fn new(config: GatewayConfig) -> Self {
        let queue = Arc::new(SyncQueue::new(config.queue.clone()));
        Self::with_queue(config, queue)
    }

    /// Create a gateway whose sync queue forwards permanently dropped items
    /// to a dead-letter callback.
    pub fn with_dead_letter(config: GatewayConfig, callback: Arc<DeadLetterFn>) -> Self {
        let queue = Arc::new(SyncQueue::new(config.queue.clone()).with_dead_letter(callback));
        Self::with_queue(config, queue)
    }

    fn with_queue(config: GatewayConfig, queue: Arc<SyncQueue>) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                config,
                registry: RwLock::new(HashMap::new()),
                active: RwLock::new(None),
                queue,
                stats: OperationStats::default(),
                last_health_check: RwLock::new(None),
                health_task: Mutex::new(None),
                drain_task: Mutex::new(None),
            }),
        }
    }

    /// Build and register the connector described by `config`.
    ///
    /// The first enabled connector registered becomes active. Registering an
    /// id twice is a configuration error.
    pub fn register_connector(&self, config: ConnectorConfig) -> Result<()> {
        let connector = create_connector(&config)?;
        self.register_connector_with(config, connector)
    }

    /// Register a pre-built connector under `config.id`. Intended for tests
    /// and host-defined store implementations.
    pub fn register_connector_with(
        &self,
        config: ConnectorConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<()> {
        let id = config.id.clone();

        // Opening the active connector's breaker triggers an immediate
        // failover; the callback holds a weak handle so a dropped gateway
        // never keeps itself alive through its own breakers.
        let weak = Arc::downgrade(&self.inner);
        let breaker_id = id.clone();
        let breaker = Arc::new(
            CircuitBreaker::new(self.inner.config.breaker.clone())
                .with_name(&id)
                .with_state_change(Arc::new(move |_old, new| {
                    if new != CircuitState::Open {
                        return;
                    }
                    if let Some(inner) = weak.upgrade() {
                        inner.on_breaker_opened(&breaker_id);
                    }
                })),
        );

        let enabled = config.enabled;
        // Duplicate check and insert under one guard so racing registrations
        // of the same id cannot both land
        match self.inner.registry.write().entry(id.clone()) {
            std::collections::hash_map::Entry::Occupied(_) => {
                return Err(Error::config(format!("connector '{id}' already registered")));
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(ConnectorEntry {
                    config,
                    connector: connector.clone(),
                    breaker,
                });
            }
        }

        // Non-fatal initial probe, purely informational
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let probe_id = id.clone();
            handle.spawn(async move {
                let health = connector.ping().await;
                debug!(
                    connector = %probe_id,
                    connected = health.connected,
                    "initial liveness probe"
                );
            });
        }

        let mut active = self.inner.active.write();
        if active.is_none() && enabled {
            info!(connector = %id, "first connector registered, marking active");
            *active = Some(id.clone());
        } else {
            info!(connector = %id, "connector registered");
        }
        Ok(())
    }

    /// Currently active connector id.
    pub fn active_connector(&self) -> Option<String> {
        self.inner.active.read().clone()
    }

    /// Switch the active connector after a breaker-gated liveness probe.
    ///
    /// A successful switch kicks off a queue drain so writes captured while
    /// the previous store was down land on the new one promptly.
    pub async fn set_active_connector(&self, id: &str) -> Result<()> {
        let entry = self
            .inner
            .entry(id)
            .ok_or_else(|| Error::UnknownConnector { id: id.to_string() })?;

        self.inner.probe(&entry).await?;

        *self.inner.active.write() = Some(id.to_string());
        info!(connector = %id, "active connector switched");
        self.inner.spawn_drain();
        Ok(())
    }

    /// Activate the reachable enabled connector with the best (lowest)
    /// priority. Returns the chosen id.
    pub async fn activate_by_priority(&self) -> Result<String> {
        let mut candidates: Vec<(i32, String)> = self
            .inner
            .registry
            .read()
            .values()
            .filter(|e| e.config.enabled)
            .map(|e| (e.config.priority, e.config.id.clone()))
            .collect();
        candidates.sort();

        for (_, id) in candidates {
            match self.set_active_connector(&id).await {
                Ok(()) => return Ok(id),
                Err(e) => debug!(connector = %id, error = %e, "candidate not reachable"),
            }
        }
        Err(Error::connection("no enabled connector is reachable"))
    }

    /// Execute a read-only statement on the active connector, falling back
    /// on connection-level failure.
    ///
    /// Query-level failures (`success: false`) come back as-is without
    /// touching the fallback; an error is raised only when every attempted
    /// connector failed at the connection level.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let (active_id, entry) = self.inner.active_entry()?;

        let first = entry
            .breaker
            .execute(|| entry.connector.query(sql, params))
            .await;
        match first {
            Ok(result) => {
                self.inner.stats.record_success(result.response_time);
                return Ok(result);
            }
            Err(e) => {
                warn!(connector = %active_id, error = %e, "query failed on active connector");
                if let Some(fallback) = self.inner.fallback_entry(&active_id) {
                    let second = fallback
                        .breaker
                        .execute(|| fallback.connector.query(sql, params))
                        .await;
                    match second {
                        Ok(result) => {
                            info!(connector = %fallback.config.id, "query served by fallback");
                            self.inner.stats.record_success(result.response_time);
                            return Ok(result);
                        }
                        Err(e) => {
                            self.inner.stats.record_failure();
                            return Err(e);
                        }
                    }
                }
                self.inner.stats.record_failure();
                Err(e)
            }
        }
    }

    /// Execute a mutating statement on the active connector, falling back on
    /// connection-level failure.
    ///
    /// When every attempted connector fails and the statement parses as a
    /// mutation, it is captured in the sync queue and the caller receives
    /// [`ExecuteResult::accepted`]. Non-mutations (DDL, unparseable text)
    /// propagate the error instead.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        let (active_id, entry) = self.inner.active_entry()?;
        let start = Instant::now();

        let first = entry
            .breaker
            .execute(|| entry.connector.execute(sql, params))
            .await;
        let last_error = match first {
            Ok(result) => {
                self.inner.stats.record_success(start.elapsed());
                return Ok(result);
            }
            Err(e) => {
                warn!(connector = %active_id, error = %e, "execute failed on active connector");
                match self.inner.fallback_entry(&active_id) {
                    Some(fallback) => {
                        let second = fallback
                            .breaker
                            .execute(|| fallback.connector.execute(sql, params))
                            .await;
                        match second {
                            Ok(result) => {
                                info!(connector = %fallback.config.id, "execute served by fallback");
                                self.inner.stats.record_success(start.elapsed());
                                return Ok(result);
                            }
                            Err(e) => e,
                        }
                    }
                    None => e,
                }
            }
        };

        self.inner.stats.record_failure();
        match parse_statement(sql) {
            Some((kind, table)) => {
                let item = QueueItem::new(kind, table, sql, params.to_vec());
                info!(id = %item.id, op = %kind, error = %last_error, "capturing failed mutation for replay");
                self.inner.queue.enqueue(item).await?;
                Ok(ExecuteResult::accepted())
            }
            None => Err(last_error),
        }
    }

    /// Fetch transaction rows matching the given equality filters.
    ///
    /// Filter keys are validated as SQL identifiers; null and empty-string
    /// values are skipped. Results are newest-first, capped at the
    /// configured row limit.
    pub async fn get_transactions(
        &self,
        filters: &HashMap<String, Value>,
    ) -> Result<Vec<Row>> {
        let mut keys: Vec<&String> = filters.keys().collect();
        keys.sort();

        let mut clauses = Vec::new();
        let mut params = Vec::new();
        for key in keys {
            let value = &filters[key];
            match value {
                Value::Null => continue,
                Value::Text(s) if s.is_empty() => continue,
                _ => {}
            }
            validate_identifier(key)?;
            clauses.push(format!("{key} = ?"));
            params.push(value.clone());
        }

        let mut sql = String::from("SELECT * FROM transactions");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ");
        sql.push_str(&self.inner.config.max_rows.to_string());

        let result = self.query(&sql, &params).await?;
        if !result.success {
            let message = result.error.unwrap_or_else(|| "query failed".to_string());
            return Err(Error::query_with_sql(message, sql));
        }
        Ok(result.rows)
    }

    /// Ping every registered connector independently and return the results
    /// keyed by connector id.
    pub async fn health_check(&self) -> HashMap<String, HealthStatus> {
        self.inner.health_check_all().await
    }

    /// Start the health-check and queue-drain timers. Idempotent: calling
    /// again while running does nothing.
    pub fn start_health_monitoring(&self) {
        {
            let mut task = self.inner.health_task.lock();
            if task.is_none() {
                let weak = Arc::downgrade(&self.inner);
                let interval = self.inner.config.health_check_interval;
                *task = Some(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        let Some(inner) = weak.upgrade() else { break };
                        inner.health_tick().await;
                    }
                }));
            }
        }

        let mut task = self.inner.drain_task.lock();
        if task.is_none() {
            let weak = Arc::downgrade(&self.inner);
            let interval = self.inner.config.drain_interval;
            *task = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(inner) = weak.upgrade() else { break };
                    if let Err(e) = inner.drain_queue().await {
                        warn!(error = %e, "scheduled queue drain failed");
                    }
                }
            }));
        }
    }

    /// Stop the background timers. Idempotent.
    pub fn stop_health_monitoring(&self) {
        if let Some(task) = self.inner.health_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.inner.drain_task.lock().take() {
            task.abort();
        }
    }

    /// Run one queue drain pass immediately.
    pub async fn force_sync_queue(&self) -> Result<DrainOutcome> {
        self.inner.drain_queue().await
    }

    /// Current sync queue contents and counters.
    pub fn sync_queue_status(&self) -> SyncQueueStatus {
        self.inner.queue.status()
    }

    /// Drop every pending queued mutation.
    pub async fn clear_sync_queue(&self) -> Result<()> {
        self.inner.queue.clear().await
    }

    /// Force one connector's breaker closed (ops hook).
    pub fn reset_breaker(&self, id: &str) -> Result<()> {
        let entry = self
            .inner
            .entry(id)
            .ok_or_else(|| Error::UnknownConnector { id: id.to_string() })?;
        entry.breaker.reset();
        Ok(())
    }

    /// Aggregate gateway metrics.
    pub fn metrics(&self) -> DalMetrics {
        let registry = self.inner.registry.read();
        let breakers = registry
            .iter()
            .map(|(id, entry)| (id.clone(), entry.breaker.snapshot()))
            .collect();
        let queue_status = self.inner.queue.status();

        DalMetrics {
            total_operations: self.inner.stats.total(),
            failed_operations: self.inner.stats.failed(),
            avg_response_time: self.inner.stats.average(),
            active_connector: self.inner.active.read().clone(),
            registered_connectors: registry.len(),
            breakers,
            last_health_check: *self.inner.last_health_check.read(),
            queue: QueueSummary {
                pending: queue_status.pending,
                metrics: queue_status.metrics,
            },
        }
    }

    /// Per-connector status lines, ordered by priority then id.
    pub fn connector_status(&self) -> Vec<ConnectorStatusReport> {
        let active = self.inner.active.read().clone();
        let mut reports: Vec<ConnectorStatusReport> = self
            .inner
            .registry
            .read()
            .values()
            .map(|entry| ConnectorStatusReport {
                id: entry.config.id.clone(),
                name: entry.config.name.clone(),
                metadata: entry.connector.metadata(),
                active: active.as_deref() == Some(entry.config.id.as_str()),
                enabled: entry.config.enabled,
                priority: entry.config.priority,
                connected: entry.connector.is_connected(),
                breaker: entry.breaker.snapshot(),
            })
            .collect();
        reports.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
        reports
    }

    /// Shut the gateway down: stop timers, close every connector, and empty
    /// the registry. Close failures are logged, not raised.
    pub async fn close(&self) -> Result<()> {
        self.stop_health_monitoring();

        let entries: Vec<ConnectorEntry> =
            self.inner.registry.write().drain().map(|(_, e)| e).collect();
        *self.inner.active.write() = None;

        for entry in entries {
            if let Err(e) = entry.connector.close().await {
                warn!(connector = %entry.config.id, error = %e, "connector close failed");
            }
        }
        info!("gateway closed");
        Ok(())
    }
}

impl GatewayInner {
    fn entry(&self, id: &str) -> Option<ConnectorEntry> {
        self.registry.read().get(id).cloned()
    }

    fn active_entry(&self) -> Result<(String, ConnectorEntry)> {
        let active = self
            .active
            .read()
            .clone()
            .ok_or_else(|| Error::config("no active connector"))?;
        let entry = self
            .entry(&active)
            .ok_or_else(|| Error::internal(format!("active connector '{active}' not registered")))?;
        Ok((active, entry))
    }

    fn fallback_entry(&self, exclude: &str) -> Option<ConnectorEntry> {
        let fallback = self.config.fallback_connector.as_deref()?;
        if fallback == exclude {
            return None;
        }
        self.entry(fallback)
    }

    /// Breaker-gated liveness probe used before activating a connector.
    async fn probe(&self, entry: &ConnectorEntry) -> Result<()> {
        let timeout = self.config.ping_timeout;
        entry
            .breaker
            .execute(|| async {
                match tokio::time::timeout(timeout, entry.connector.ping()).await {
                    Ok(health) if health.connected => Ok(()),
                    Ok(health) => Err(Error::connection(
                        health.error.unwrap_or_else(|| "store unreachable".to_string()),
                    )),
                    Err(_) => Err(Error::timeout("liveness probe timed out")),
                }
            })
            .await
    }

    /// Reaction to the active connector's breaker opening: switch straight
    /// to the fallback so subsequent calls never wait out the reset timeout.
    fn on_breaker_opened(self: &Arc<Self>, id: &str) {
        if self.active.read().as_deref() != Some(id) {
            return;
        }
        let Some(fallback) = self.config.fallback_connector.clone() else {
            return;
        };
        if fallback == id {
            return;
        }
        if !self.registry.read().contains_key(&fallback) {
            warn!(fallback = %fallback, "fallback connector is not registered, staying put");
            return;
        }

        *self.active.write() = Some(fallback.clone());
        warn!(from = %id, to = %fallback, "breaker opened on active connector, failing over");
        self.spawn_drain();
    }

    /// Kick off a drain pass without blocking the caller. No-op outside a
    /// runtime (the breaker callback can fire from sync test code).
    fn spawn_drain(self: &Arc<Self>) {
        if self.queue.is_empty() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(self);
            handle.spawn(async move {
                if let Err(e) = inner.drain_queue().await {
                    warn!(error = %e, "post-failover queue drain failed");
                }
            });
        }
    }

    async fn health_check_all(&self) -> HashMap<String, HealthStatus> {
        let entries: Vec<ConnectorEntry> = self.registry.read().values().cloned().collect();
        let timeout = self.config.ping_timeout;

        let mut statuses = HashMap::with_capacity(entries.len());
        for entry in entries {
            let started = Instant::now();
            let status = match tokio::time::timeout(timeout, entry.connector.ping()).await {
                Ok(status) => status,
                Err(_) => HealthStatus::unhealthy(started.elapsed(), "ping timed out"),
            };
            statuses.insert(entry.config.id.clone(), status);
        }
        *self.last_health_check.write() = Some(Utc::now());
        statuses
    }

    /// One pass of the health loop: fail over when the active store is down
    /// and the fallback is up, drain opportunistically when the active store
    /// is healthy.
    async fn health_tick(self: &Arc<Self>) {
        let statuses = self.health_check_all().await;
        let Some(active) = self.active.read().clone() else {
            return;
        };
        let active_healthy = statuses.get(&active).map(|s| s.connected).unwrap_or(false);

        if active_healthy {
            if !self.queue.is_empty() {
                if let Err(e) = self.drain_queue().await {
                    warn!(error = %e, "health-tick queue drain failed");
                }
            }
            return;
        }

        let Some(fallback) = self.config.fallback_connector.clone() else {
            return;
        };
        if fallback == active {
            return;
        }
        let fallback_healthy = statuses.get(&fallback).map(|s| s.connected).unwrap_or(false);
        if !fallback_healthy {
            return;
        }

        *self.active.write() = Some(fallback.clone());
        warn!(from = %active, to = %fallback, "active store unhealthy, failing over");
        if let Err(e) = self.drain_queue().await {
            warn!(error = %e, "post-failover queue drain failed");
        }
    }

    /// Replay queued mutations through the current active connector.
    async fn drain_queue(self: &Arc<Self>) -> Result<DrainOutcome> {
        if self.queue.is_empty() {
            return Ok(DrainOutcome::default());
        }
        let Ok((_, entry)) = self.active_entry() else {
            return Ok(DrainOutcome::default());
        };

        self.queue
            .process_queue(|item| {
                let entry = entry.clone();
                async move {
                    let result = entry
                        .breaker
                        .execute(|| entry.connector.execute(&item.statement, &item.params))
                        .await?;
                    if result.success {
                        Ok(())
                    } else {
                        Err(Error::query_with_sql("replay rejected by store", item.statement))
                    }
                }
            })
            .await
    }
}

impl std::fmt::Debug for DalGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DalGateway")
            .field("active", &self.inner.active.read().clone())
            .field("connectors", &self.inner.registry.read().len())
            .field("queue_pending", &self.inner.queue.len())
            .finish()
    }
}
