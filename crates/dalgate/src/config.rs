//! Configuration types for connectors, the circuit breaker, the sync queue,
//! and the gateway.
//!
//! Host applications source these from files or environment at startup and
//! hand them to [`crate::gateway::DalGateway`]; everything is immutable once
//! registered.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::StoreKind;

/// Fixed file name for the persisted sync-queue snapshot.
pub const QUEUE_SNAPSHOT_FILE: &str = "dal-sync-queue.json";

/// Static description of one backing data store.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    /// Unique connector id
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Store kind, selects the concrete connector implementation
    pub kind: StoreKind,
    /// Connection locator: file path, base URL, or mock dataset name
    pub locator: String,
    /// Free-form options (timeouts, api keys, ...)
    #[serde(default)]
    pub options: HashMap<String, String>,
    /// Priority — lower is tried first by `activate_by_priority`
    #[serde(default)]
    pub priority: i32,
    /// Disabled connectors are registered but never auto-activated
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ConnectorConfig {
    /// Create a config with the given id, kind, and locator
    pub fn new(id: impl Into<String>, kind: StoreKind, locator: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            locator: locator.into(),
            options: HashMap::new(),
            priority: 0,
            enabled: true,
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add an option
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Set the priority (lower = preferred)
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Mark the connector disabled
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Fetch an option parsed as seconds
    pub(crate) fn option_secs(&self, key: &str) -> Option<Duration> {
        self.options
            .get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// Per-breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls before allowing a trial
    pub reset_timeout: Duration,
    /// Failures further apart than this restart the count
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the reset timeout
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the monitoring period
    pub fn with_monitoring_period(mut self, period: Duration) -> Self {
        self.monitoring_period = period;
        self
    }
}

/// Sync queue configuration.
#[derive(Debug, Clone)]
pub struct SyncQueueConfig {
    /// Maximum queued items; the oldest is evicted when full
    pub max_queue_size: usize,
    /// Maximum serialized size of a single item
    pub max_item_bytes: usize,
    /// Retry-delay schedule indexed by attempt number; items that fail more
    /// than `retry_delays.len()` times are dropped permanently
    pub retry_delays: Vec<Duration>,
    /// Snapshot file path; `None` disables persistence
    pub persist_path: Option<PathBuf>,
}

impl Default for SyncQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_item_bytes: 64 * 1024,
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
                Duration::from_secs(120),
                Duration::from_secs(300),
            ],
            persist_path: None,
        }
    }
}

impl SyncQueueConfig {
    /// Set the queue capacity
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size.max(1);
        self
    }

    /// Set the per-item serialized size limit
    pub fn with_max_item_bytes(mut self, bytes: usize) -> Self {
        self.max_item_bytes = bytes;
        self
    }

    /// Replace the retry-delay schedule
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    /// Persist snapshots under `dir`, using the fixed snapshot file name
    pub fn persist_in(mut self, dir: impl AsRef<Path>) -> Self {
        self.persist_path = Some(dir.as_ref().join(QUEUE_SNAPSHOT_FILE));
        self
    }

    /// Persist snapshots at an explicit path
    pub fn with_persist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_path = Some(path.into());
        self
    }
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Connector attempted when the active one fails
    pub fallback_connector: Option<String>,
    /// Health-check timer period
    pub health_check_interval: Duration,
    /// Sync-queue drain timer period
    pub drain_interval: Duration,
    /// Upper bound for a single `ping`
    pub ping_timeout: Duration,
    /// Row-count cap applied by high-level query helpers
    pub max_rows: u64,
    /// Breaker configuration applied to every registered connector
    pub breaker: CircuitBreakerConfig,
    /// Sync queue configuration
    pub queue: SyncQueueConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            fallback_connector: None,
            health_check_interval: Duration::from_secs(30),
            drain_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(5),
            max_rows: 1000,
            breaker: CircuitBreakerConfig::default(),
            queue: SyncQueueConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Set the fallback connector id
    pub fn with_fallback(mut self, id: impl Into<String>) -> Self {
        self.fallback_connector = Some(id.into());
        self
    }

    /// Set the health-check interval
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the queue-drain interval
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    /// Set the ping timeout
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Set the row cap for query helpers
    pub fn with_max_rows(mut self, max_rows: u64) -> Self {
        self.max_rows = max_rows.max(1);
        self
    }

    /// Set the breaker configuration
    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Set the sync queue configuration
    pub fn with_queue(mut self, queue: SyncQueueConfig) -> Self {
        self.queue = queue;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_config_builder() {
        let config = ConnectorConfig::new("primary", StoreKind::EmbeddedFile, "./retail.db")
            .with_name("Primary store")
            .with_option("timeout_secs", "10")
            .with_priority(1);

        assert_eq!(config.id, "primary");
        assert_eq!(config.name, "Primary store");
        assert!(config.enabled);
        assert_eq!(config.option_secs("timeout_secs"), Some(Duration::from_secs(10)));
        assert_eq!(config.option_secs("missing"), None);
    }

    #[test]
    fn test_connector_config_deserialize() {
        let config: ConnectorConfig = serde_json::from_str(
            r#"{"id":"cloud","kind":"hosted-network","locator":"https://api.example.com"}"#,
        )
        .unwrap();
        assert_eq!(config.kind, StoreKind::HostedNetwork);
        assert!(config.enabled);
        assert_eq!(config.priority, 0);
    }

    #[test]
    fn test_breaker_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_queue_config_persist_in() {
        let config = SyncQueueConfig::default().persist_in("/var/lib/dal");
        assert_eq!(
            config.persist_path.unwrap(),
            PathBuf::from("/var/lib/dal").join(QUEUE_SNAPSHOT_FILE)
        );
    }

    #[test]
    fn test_gateway_config_builder() {
        let config = GatewayConfig::default()
            .with_fallback("mock")
            .with_max_rows(50);
        assert_eq!(config.fallback_connector.as_deref(), Some("mock"));
        assert_eq!(config.max_rows, 50);
    }
}
