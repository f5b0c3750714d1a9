//! # dalgate
//!
//! Resilient data abstraction layer for retail analytics workloads.
//!
//! This crate provides a uniform query/execute surface over interchangeable
//! backing stores, with the failure handling needed to keep point-of-sale
//! analytics flowing when a store goes down.
//!
//! ## Features
//!
//! - **Interchangeable Stores**: embedded SQLite file, hosted HTTP endpoint,
//!   and a deterministic in-memory mock behind one `Connector` trait
//! - **Circuit Breakers**: per-connector CLOSED/OPEN/HALF_OPEN breakers that
//!   stop hammering a failing store
//! - **Automatic Failover**: an opening breaker or a failed health check
//!   switches the gateway to a configured fallback connector
//! - **Offline Sync Queue**: failed mutations are captured in a durable,
//!   size-bounded FIFO and replayed on a retry schedule
//! - **Health Monitoring**: background loops probe every store and drain the
//!   queue once connectivity returns
//! - **Metrics**: operation counters, breaker snapshots, and queue totals in
//!   one aggregate view
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dalgate::prelude::*;
//!
//! let gateway = DalGateway::new(
//!     GatewayConfig::default()
//!         .with_fallback("mock")
//!         .with_queue(SyncQueueConfig::default().persist_in("./data")),
//! );
//!
//! gateway.register_connector(ConnectorConfig::new(
//!     "primary",
//!     StoreKind::EmbeddedFile,
//!     "./data/retail.db",
//! ))?;
//! gateway.register_connector(ConnectorConfig::new(
//!     "mock",
//!     StoreKind::InMemoryMock,
//!     "mock://canned",
//! ))?;
//! gateway.start_health_monitoring();
//!
//! let result = gateway
//!     .query("SELECT * FROM transactions WHERE store_id = ?", &[Value::from("riyadh-01")])
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod breaker;
pub mod config;
pub mod connector;
pub mod connectors;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod queue;
pub mod types;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
    pub use crate::config::{
        CircuitBreakerConfig, ConnectorConfig, GatewayConfig, SyncQueueConfig,
    };
    pub use crate::connector::{create_connector, Connector};
    pub use crate::connectors::{EmbeddedConnector, HostedConnector, MockConnector};
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::gateway::DalGateway;
    pub use crate::metrics::{ConnectorStatusReport, DalMetrics};
    pub use crate::queue::{DrainOutcome, QueueItem, SyncQueue, SyncQueueStatus};
    pub use crate::types::{
        ExecuteResult, HealthStatus, MutationKind, QueryResult, Row, StoreKind, Value,
    };
}
