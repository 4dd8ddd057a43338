//! Breaker-path integration tests: per-node isolation, outcome
//! classification and typed rejection counters.

use super::{CapturingStats, MemoryDriverFactory};
use crate::breaker;
use crate::config::{BackendConfig, BreakerConfig, ClientMode, ConnectorConfig};
use crate::connector::Connector;
use crate::error::Error;
use crate::limiter::breaker_key;
use crate::telemetry::{TAG_BREAKER_CIRCUIT_OPEN, TAG_BREAKER_TIMEOUT};
use crate::types::{Context, Value};
use std::sync::Arc;
use std::time::Duration;

fn tripping_breaker() -> BreakerConfig {
    BreakerConfig {
        timeout_in_ms: 60_000,
        max_concurrent_requests: 100,
        request_volume_threshold: 1,
        error_percent_threshold: 1,
        sleep_window_in_ms: 60_000,
        queue_size_rejection_threshold: 0,
    }
}

fn guarded_single(addr: &str, settings: BreakerConfig) -> BackendConfig {
    BackendConfig::new(ClientMode::SingleHost, vec![addr.to_string()]).with_breaker(settings)
}

#[tokio::test]
async fn test_transport_error_opens_circuit_and_rejections_are_typed() {
    let addr = "cb.open:6379";
    let factory = MemoryDriverFactory::new();
    let stats = Arc::new(CapturingStats::new());
    let ctx = Context::background();
    let connector = Connector::builder(factory.clone())
        .with_stats(stats.clone())
        .connect_static(
            &ctx,
            ConnectorConfig::new(guarded_single(addr, tripping_breaker())),
        )
        .await
        .unwrap();

    factory
        .server(addr)
        .fail_with(Some(Error::Transport("connection reset".into())));

    let err = connector
        .do_cmd(&ctx, "SET", &[Value::from("k"), Value::from("v")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert!(breaker::is_circuit_open(&breaker_key(addr)));

    // Within the sleep window the circuit rejects without dispatch, and the
    // rejection is classified structurally.
    let err = connector
        .do_cmd(&ctx, "SET", &[Value::from("k"), Value::from("v")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }));
    assert!(stats.count_of("error", TAG_BREAKER_CIRCUIT_OPEN) >= 1);
}

#[tokio::test]
async fn test_probe_admitted_after_sleep_window() {
    let addr = "cb.probe:6379";
    let factory = MemoryDriverFactory::new();
    let ctx = Context::background();
    let settings = BreakerConfig {
        sleep_window_in_ms: 50,
        ..tripping_breaker()
    };
    let connector = Connector::connect_static(
        &ctx,
        factory.clone(),
        ConnectorConfig::new(guarded_single(addr, settings)),
    )
    .await
    .unwrap();

    let server = factory.server(addr);
    server.fail_with(Some(Error::Transport("down".into())));
    let _ = connector.do_cmd(&ctx, "PING", &[]).await;
    assert!(breaker::is_circuit_open(&breaker_key(addr)));

    // After the sleep window a probe is admitted; success closes the
    // circuit again.
    tokio::time::sleep(Duration::from_millis(70)).await;
    server.fail_with(None);
    connector.do_cmd(&ctx, "PING", &[]).await.unwrap();
    assert!(!breaker::is_circuit_open(&breaker_key(addr)));
}

#[tokio::test]
async fn test_deadline_expiry_is_a_threat() {
    let addr = "cb.deadline:6379";
    let factory = MemoryDriverFactory::new();
    let connector = Connector::connect_static(
        &Context::background(),
        factory.clone(),
        ConnectorConfig::new(guarded_single(addr, tripping_breaker())),
    )
    .await
    .unwrap();

    factory
        .server(addr)
        .set_latency(Some(Duration::from_millis(200)));

    let ctx = Context::with_timeout(Duration::from_millis(10));
    let err = connector
        .do_cmd(&ctx, "GET", &[Value::from("k")])
        .await
        .unwrap_err();
    assert_eq!(err, Error::DeadlineExceeded);
    assert!(breaker::is_circuit_open(&breaker_key(addr)));
}

#[tokio::test]
async fn test_cancellation_is_not_a_threat() {
    let addr = "cb.cancel:6379";
    let factory = MemoryDriverFactory::new();
    let connector = Connector::connect_static(
        &Context::background(),
        factory.clone(),
        ConnectorConfig::new(guarded_single(addr, tripping_breaker())),
    )
    .await
    .unwrap();

    let cancelled = Context::background();
    cancelled.cancel();
    let err = connector
        .do_cmd(&cancelled, "GET", &[Value::from("k")])
        .await
        .unwrap_err();
    assert_eq!(err, Error::Cancelled);
    assert!(!breaker::is_circuit_open(&breaker_key(addr)));
}

#[tokio::test]
async fn test_server_error_is_not_counted() {
    let addr = "cb.server:6379";
    let factory = MemoryDriverFactory::new();
    let ctx = Context::background();
    let connector = Connector::connect_static(
        &ctx,
        factory.clone(),
        ConnectorConfig::new(guarded_single(addr, tripping_breaker())),
    )
    .await
    .unwrap();

    for _ in 0..5 {
        let err = connector.do_cmd(&ctx, "NOSUCH", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Server(_)));
    }
    let key = breaker_key(addr);
    assert!(!breaker::is_circuit_open(&key));
    assert_eq!(breaker::tracked_errors(&key), Some(0));
}

#[tokio::test]
async fn test_read_only_topology_error_is_counted() {
    let addr = "cb.readonly:6379";
    let factory = MemoryDriverFactory::new();
    let ctx = Context::background();
    let connector = Connector::connect_static(
        &ctx,
        factory.clone(),
        ConnectorConfig::new(guarded_single(addr, tripping_breaker())),
    )
    .await
    .unwrap();

    factory.server(addr).fail_with(Some(Error::ReadOnlyNode(
        "READONLY You can't write against a read only replica.".into(),
    )));

    let err = connector
        .do_cmd(&ctx, "SET", &[Value::from("k"), Value::from("v")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadOnlyNode(_)));
    assert!(breaker::is_circuit_open(&breaker_key(addr)));
}

#[tokio::test]
async fn test_breaker_timeout_opens_circuit() {
    let addr = "cb.timeout:6379";
    let factory = MemoryDriverFactory::new();
    let stats = Arc::new(CapturingStats::new());
    let ctx = Context::background();
    let settings = BreakerConfig {
        timeout_in_ms: 20,
        ..tripping_breaker()
    };
    let connector = Connector::builder(factory.clone())
        .with_stats(stats.clone())
        .connect_static(&ctx, ConnectorConfig::new(guarded_single(addr, settings)))
        .await
        .unwrap();

    factory
        .server(addr)
        .set_latency(Some(Duration::from_millis(200)));

    let err = connector.do_cmd(&ctx, "PING", &[]).await.unwrap_err();
    assert!(matches!(err, Error::BreakerTimeout { timeout_ms: 20, .. }));
    assert!(breaker::is_circuit_open(&breaker_key(addr)));
    assert!(stats.count_of("error", TAG_BREAKER_TIMEOUT) >= 1);
}

#[tokio::test]
async fn test_fault_opens_only_the_owning_nodes_circuit() {
    let addrs = ["cb.n1:7000", "cb.n2:7000", "cb.n3:7000"];
    let factory = MemoryDriverFactory::new();
    let ctx = Context::background();
    let config = BackendConfig::new(
        ClientMode::Cluster,
        addrs.iter().map(|a| a.to_string()).collect(),
    )
    .with_breaker(tripping_breaker());
    let connector = Connector::connect_static(&ctx, factory.clone(), ConnectorConfig::new(config))
        .await
        .unwrap();

    factory
        .server("cb.n2:7000")
        .fail_with(Some(Error::Transport("shard down".into())));

    // Spread keys across the shards; only traffic owned by the faulty node
    // fails, and only its circuit opens.
    for i in 0..30 {
        let _ = connector
            .do_cmd(
                &ctx,
                "SET",
                &[Value::from(format!("key-{i}")), Value::from("v")],
            )
            .await;
    }

    assert!(breaker::is_circuit_open(&breaker_key("cb.n2:7000")));
    assert!(!breaker::is_circuit_open(&breaker_key("cb.n1:7000")));
    assert!(!breaker::is_circuit_open(&breaker_key("cb.n3:7000")));
}

#[tokio::test]
async fn test_disabled_breaker_never_trips() {
    let addr = "cb.disabled:6379";
    let factory = MemoryDriverFactory::new();
    let ctx = Context::background();
    let connector = Connector::connect_static(
        &ctx,
        factory.clone(),
        ConnectorConfig::new(BackendConfig::new(
            ClientMode::SingleHost,
            vec![addr.to_string()],
        )),
    )
    .await
    .unwrap();

    factory
        .server(addr)
        .fail_with(Some(Error::Transport("down".into())));
    for _ in 0..5 {
        let err = connector.do_cmd(&ctx, "PING", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
    assert!(!breaker::is_circuit_open(&breaker_key(addr)));
}
