//! Producer-to-collector flow over the loopback transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use trellis_core::{ChannelConfig, ClientEndpoint, Server, ServiceRegistry, Transport};
use trellis_diagnostics::{
    DiagnosticEvent, DiagnosticKind, DiagnosticsClient, DiagnosticsConfig, LogLevel, MemorySink,
    diagnostics_service,
};

fn collector() -> (Arc<MemorySink>, ClientEndpoint) {
    let sink = MemorySink::new();
    let registry = diagnostics_service(sink.clone()).unwrap();
    let (client_side, server_side) = Transport::mem_pair();
    let server = Server::new(registry);
    tokio::spawn(async move { server.serve(server_side).await });
    (sink, ClientEndpoint::connect(client_side, ChannelConfig::default()))
}

fn test_config() -> DiagnosticsConfig {
    DiagnosticsConfig {
        source: "test-endpoint".into(),
        retry_backoff: Duration::from_millis(10),
        ..DiagnosticsConfig::default()
    }
}

#[tokio::test]
async fn flush_ships_logs_and_metrics() {
    let (sink, endpoint) = collector();
    let client = DiagnosticsClient::new(endpoint, test_config());

    client.log(LogLevel::Info, "starting up");
    client.log(LogLevel::Error, "peer vanished");
    client.latency("unary/Echo", 3.5);
    client.resource(12.0, 4096);
    client.trace("dispatch", serde_json::json!({"stream": 1}));

    let sent = client.flush().await.unwrap();
    assert_eq!(sent, 5);
    assert_eq!(client.buffered(), 0);
    assert_eq!(client.dropped(), 0);

    let events = sink.events();
    assert_eq!(events.len(), 5);
    assert_eq!(
        events
            .iter()
            .filter(|e| e.kind == DiagnosticKind::Log)
            .count(),
        2
    );
    assert!(events.iter().all(|e| e.source == "test-endpoint"));
}

#[tokio::test]
async fn empty_flush_is_a_noop() {
    let (sink, endpoint) = collector();
    let client = DiagnosticsClient::new(endpoint, test_config());
    assert_eq!(client.flush().await.unwrap(), 0);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn min_level_filters_at_source() {
    let (sink, endpoint) = collector();
    let client = DiagnosticsClient::new(
        endpoint,
        DiagnosticsConfig {
            min_log_level: LogLevel::Warning,
            ..test_config()
        },
    );

    client.log(LogLevel::Debug, "noise");
    client.log(LogLevel::Info, "still noise");
    client.log(LogLevel::Critical, "signal");

    client.flush().await.unwrap();
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["message"], "signal");
}

#[tokio::test]
async fn zero_sampling_rate_drops_a_kind_entirely() {
    let (sink, endpoint) = collector();
    let client = DiagnosticsClient::new(
        endpoint,
        DiagnosticsConfig {
            sampling: HashMap::from([(DiagnosticKind::Latency, 0.0)]),
            ..test_config()
        },
    );

    for _ in 0..50 {
        client.latency("op", 1.0);
    }
    client.error_metric("E1", "kept");

    client.flush().await.unwrap();
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, DiagnosticKind::Error);
}

#[tokio::test]
async fn ring_overflow_drops_oldest_and_counts() {
    let (sink, endpoint) = collector();
    let client = DiagnosticsClient::new(
        endpoint,
        DiagnosticsConfig {
            buffer_capacity: 3,
            ..test_config()
        },
    );

    for i in 0..5 {
        client.log(LogLevel::Info, format!("event {i}"));
    }
    assert_eq!(client.buffered(), 3);
    assert_eq!(client.dropped(), 2);

    client.flush().await.unwrap();
    let messages: Vec<String> = sink
        .events()
        .iter()
        .map(|e| e.payload["message"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(messages, vec!["event 2", "event 3", "event 4"]);
}

#[tokio::test]
async fn failed_flush_retries_then_drops_the_batch() {
    // A server with no diagnostics service: every send is unimplemented.
    let (client_side, server_side) = Transport::mem_pair();
    let server = Server::new(ServiceRegistry::new());
    tokio::spawn(async move { server.serve(server_side).await });
    let endpoint = ClientEndpoint::connect(client_side, ChannelConfig::default());

    let client = DiagnosticsClient::new(
        endpoint,
        DiagnosticsConfig {
            max_retry_count: 2,
            retry_backoff: Duration::from_millis(5),
            ..test_config()
        },
    );
    client.log(LogLevel::Info, "doomed");

    let err = client.flush().await.unwrap_err();
    assert_eq!(err.code(), trellis_core::StatusCode::Unimplemented);
    assert_eq!(client.dropped(), 1);
    assert_eq!(client.buffered(), 0);
}

#[tokio::test]
async fn background_flush_loop_delivers_periodically() {
    let (sink, endpoint) = collector();
    let client = DiagnosticsClient::new(
        endpoint,
        DiagnosticsConfig {
            flush_interval: Duration::from_millis(50),
            ..test_config()
        },
    );
    let handle = client.spawn_flush_loop();

    client.log(LogLevel::Info, "first");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.len(), 1);

    client.emit(DiagnosticEvent::latency("test-endpoint", "op", 1.0));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.len(), 2);

    handle.abort();
}
