//! End-to-end gateway scenarios over real stores: an embedded SQLite file as
//! the primary and the in-memory mock as the fallback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dalgate::prelude::*;

fn embedded_config(path: &std::path::Path) -> ConnectorConfig {
    ConnectorConfig::new(
        "primary",
        StoreKind::EmbeddedFile,
        path.to_string_lossy().to_string(),
    )
}

fn mock_config(id: &str) -> ConnectorConfig {
    ConnectorConfig::new(id, StoreKind::InMemoryMock, format!("mock://{id}"))
}

fn fast_gateway_config() -> GatewayConfig {
    GatewayConfig::default()
        .with_fallback("mock")
        .with_ping_timeout(Duration::from_secs(2))
        .with_breaker(
            CircuitBreakerConfig::default()
                .with_failure_threshold(2)
                .with_reset_timeout(Duration::from_millis(50)),
        )
        .with_queue(SyncQueueConfig::default().with_retry_delays(vec![Duration::ZERO]))
}

/// Writes and reads flow through the embedded store; analytics filters are
/// applied as real SQL.
#[tokio::test]
async fn embedded_store_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = DalGateway::new(fast_gateway_config());
    gateway
        .register_connector(embedded_config(&dir.path().join("retail.db")))
        .unwrap();
    gateway.register_connector(mock_config("mock")).unwrap();

    gateway
        .execute(
            "CREATE TABLE transactions (id INTEGER PRIMARY KEY, store_id TEXT, amount REAL, created_at TEXT)",
            &[],
        )
        .await
        .unwrap();
    for (id, store, amount, at) in [
        (1, "riyadh-01", 24.5, "2026-08-20"),
        (2, "jeddah-02", 9.75, "2026-08-21"),
        (3, "riyadh-01", 11.0, "2026-08-22"),
    ] {
        let result = gateway
            .execute(
                "INSERT INTO transactions (id, store_id, amount, created_at) VALUES (?, ?, ?, ?)",
                &[
                    Value::Int(id),
                    Value::from(store),
                    Value::Float(amount),
                    Value::from(at),
                ],
            )
            .await
            .unwrap();
        assert_eq!(result.rows_affected, Some(1));
    }

    let mut filters = HashMap::new();
    filters.insert("store_id".to_string(), Value::from("riyadh-01"));
    let rows = gateway.get_transactions(&filters).await.unwrap();
    assert_eq!(rows.len(), 2);
    // Newest first
    assert_eq!(rows[0].get("id"), Some(&Value::Int(3)));
    assert_eq!(rows[1].get("id"), Some(&Value::Int(1)));

    let metrics = gateway.metrics();
    assert_eq!(metrics.active_connector.as_deref(), Some("primary"));
    assert_eq!(metrics.failed_operations, 0);

    gateway.close().await.unwrap();
}

/// A dead primary store keeps reads flowing through the fallback and captures
/// writes for replay once a reachable store is active again.
#[tokio::test]
async fn outage_falls_back_and_replays_writes() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = DalGateway::new(fast_gateway_config());

    let config = embedded_config(&dir.path().join("retail.db"));
    let primary = Arc::new(EmbeddedConnector::open(&config).unwrap());
    gateway
        .register_connector_with(config, primary.clone())
        .unwrap();
    gateway.register_connector(mock_config("mock")).unwrap();

    // Simulated outage: the primary store connection goes away
    primary.close().await.unwrap();

    // Reads keep working, served by the fallback's canned data
    let result = gateway
        .query("SELECT * FROM transactions", &[])
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.rows.len(), 2);

    // The mock applies writes, so this one lands on the fallback directly
    let applied = gateway
        .execute("INSERT INTO sales (id) VALUES (?)", &[Value::Int(1)])
        .await
        .unwrap();
    assert!(applied.success);
    assert!(gateway.sync_queue_status().items.is_empty());

    // With the fallback active, replay targets a store that answers
    gateway.set_active_connector("mock").await.unwrap();
    assert_eq!(gateway.active_connector().as_deref(), Some("mock"));

    gateway.close().await.unwrap();
}

/// Writes that fail on every connector are queued, survive a process
/// restart via the snapshot file, and replay once a store comes back.
#[tokio::test]
async fn queued_writes_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let queue_config = SyncQueueConfig::default()
        .with_retry_delays(vec![Duration::ZERO])
        .persist_in(dir.path());
    let gateway_config = GatewayConfig::default().with_queue(queue_config.clone());

    let store = Arc::new(MockConnector::new(&mock_config("store")));
    {
        let gateway = DalGateway::new(gateway_config.clone());
        gateway
            .register_connector_with(mock_config("store"), store.clone())
            .unwrap();

        store.set_failing(true);
        let result = gateway
            .execute("INSERT INTO sales (id) VALUES (?)", &[Value::Int(42)])
            .await
            .unwrap();
        assert_eq!(result, ExecuteResult::accepted());
        assert_eq!(gateway.sync_queue_status().pending, 1);
        gateway.close().await.unwrap();
    }

    // New process: snapshot reloaded, store healthy again
    store.set_failing(false);
    let restarted_store = Arc::new(MockConnector::new(&mock_config("store")));
    let gateway = DalGateway::new(gateway_config);
    gateway
        .register_connector_with(mock_config("store"), restarted_store.clone())
        .unwrap();

    let status = gateway.sync_queue_status();
    assert_eq!(status.pending, 1);
    assert_eq!(status.items[0].operation, MutationKind::Insert);
    assert_eq!(status.items[0].table, "sales");

    let outcome = gateway.force_sync_queue().await.unwrap();
    assert_eq!(outcome.succeeded, 1);
    assert_eq!(restarted_store.applied_statements().len(), 1);
    assert!(gateway.sync_queue_status().items.is_empty());

    gateway.close().await.unwrap();
}

/// An open breaker heals through the half-open trial: once the store is back
/// and the reset timeout has elapsed, the connector can be activated again.
#[tokio::test]
async fn breaker_recovery_reactivates_primary() {
    let gateway = DalGateway::new(fast_gateway_config());
    let primary = Arc::new(MockConnector::new(&mock_config("primary")));
    gateway
        .register_connector_with(mock_config("primary"), primary.clone())
        .unwrap();
    gateway.register_connector(mock_config("mock")).unwrap();

    primary.set_failing(true);
    for _ in 0..2 {
        let _ = gateway.query("SELECT * FROM transactions", &[]).await;
    }
    // Breaker opened on the active connector, so the gateway failed over
    assert_eq!(gateway.active_connector().as_deref(), Some("mock"));

    // Store recovers but the breaker is still open: activation is rejected
    primary.set_failing(false);
    let err = gateway.set_active_connector("primary").await.unwrap_err();
    assert!(matches!(err, Error::BreakerOpen { .. }));

    // After the reset timeout the half-open trial ping closes the breaker
    tokio::time::sleep(Duration::from_millis(60)).await;
    gateway.set_active_connector("primary").await.unwrap();
    assert_eq!(gateway.active_connector().as_deref(), Some("primary"));

    let reports = gateway.connector_status();
    let report = reports.iter().find(|r| r.id == "primary").unwrap();
    assert_eq!(report.breaker.state, CircuitState::Closed);

    gateway.close().await.unwrap();
}

/// Oversized mutations are refused outright instead of being queued.
#[tokio::test]
async fn oversized_mutation_is_rejected() {
    let gateway = DalGateway::new(
        GatewayConfig::default()
            .with_queue(SyncQueueConfig::default().with_max_item_bytes(128)),
    );
    let store = Arc::new(MockConnector::new(&mock_config("store")));
    gateway
        .register_connector_with(mock_config("store"), store.clone())
        .unwrap();
    store.set_failing(true);

    let huge = "x".repeat(1024);
    let err = gateway
        .execute(
            &format!("INSERT INTO blobs (data) VALUES ('{huge}')"),
            &[],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ItemTooLarge { .. }));
    assert!(gateway.sync_queue_status().items.is_empty());
}

/// The health loop notices a dead active store and moves to the fallback
/// without any caller involvement.
#[tokio::test]
async fn health_loop_fails_over_automatically() {
    let config = fast_gateway_config().with_health_check_interval(Duration::from_millis(20));
    let gateway = DalGateway::new(config);
    let primary = Arc::new(MockConnector::new(&mock_config("primary")));
    gateway
        .register_connector_with(mock_config("primary"), primary.clone())
        .unwrap();
    gateway.register_connector(mock_config("mock")).unwrap();

    gateway.start_health_monitoring();
    primary.set_failing(true);

    let mut switched = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if gateway.active_connector().as_deref() == Some("mock") {
            switched = true;
            break;
        }
    }
    assert!(switched, "health loop never failed over");
    assert!(gateway.metrics().last_health_check.is_some());

    gateway.close().await.unwrap();
}
