//! Router behavior over real endpoints on the loopback transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use trellis_core::{
    CallOptions, ChannelConfig, ClientEndpoint, Server, StatusCode, Transport, json as json_codec,
};
use trellis_router::{
    ClientFilter, P2pConnection, P2pOptions, RegisterOptions, Router, RouterConfig, RouterHandle,
    RouterMessage, RouterMessageKind, SERVICE_NAME, TopologyEvent, TopologyEventKind,
};

fn start(config: RouterConfig) -> (Router, Server) {
    let router = Router::start(config);
    let server = Server::new(router.contract().unwrap());
    (router, server)
}

fn connect(server: &Server) -> ClientEndpoint {
    let (client_side, server_side) = Transport::mem_pair();
    let server = server.clone();
    tokio::spawn(async move { server.serve(server_side).await });
    ClientEndpoint::connect(client_side, ChannelConfig::default())
}

async fn join(server: &Server, name: &str, groups: &[&str]) -> RouterHandle {
    RouterHandle::register(
        connect(server),
        RegisterOptions::named(name)
            .with_groups(groups.iter().map(|s| s.to_string()).collect()),
    )
    .await
    .unwrap()
}

fn payload(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

async fn recv_within(conn: &mut P2pConnection, ms: u64) -> Option<RouterMessage> {
    timeout(Duration::from_millis(ms), conn.next_message())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn ping_echoes_server_time() {
    let (_router, server) = start(RouterConfig::default());
    let handle = join(&server, "alpha", &[]).await;
    let ping = handle.ping().await.unwrap();
    assert!(ping.server_time_ms > 0);
}

#[tokio::test]
async fn p2p_stream_without_identity_heartbeat_is_rejected() {
    let (_router, server) = start(RouterConfig::default());
    let handle = join(&server, "alpha", &[]).await;

    // Hand-rolled p2p stream whose first message is not a heartbeat.
    let (mut sink, mut responses) = handle
        .endpoint()
        .duplex(
            SERVICE_NAME,
            "p2p",
            Arc::new(json_codec::<RouterMessage>()),
            Arc::new(json_codec::<RouterMessage>()),
            CallOptions::default(),
        )
        .await
        .unwrap();
    sink.send(&RouterMessage::unicast(
        handle.client_id().to_string(),
        "whoever",
        Default::default(),
    ))
    .await
    .unwrap();

    let err = responses.next().await.unwrap().unwrap_err();
    assert_eq!(err.code(), StatusCode::FailedPrecondition);
}

#[tokio::test]
async fn p2p_stream_with_unregistered_id_is_rejected() {
    let (_router, server) = start(RouterConfig::default());
    let handle = join(&server, "alpha", &[]).await;

    let (mut sink, mut responses) = handle
        .endpoint()
        .duplex(
            SERVICE_NAME,
            "p2p",
            Arc::new(json_codec::<RouterMessage>()),
            Arc::new(json_codec::<RouterMessage>()),
            CallOptions::default(),
        )
        .await
        .unwrap();
    sink.send(&RouterMessage::heartbeat("not-a-registered-id"))
        .await
        .unwrap();

    let err = responses.next().await.unwrap().unwrap_err();
    assert_eq!(err.code(), StatusCode::FailedPrecondition);
}

#[tokio::test]
async fn p2p_request_response_roundtrip() {
    let (_router, server) = start(RouterConfig::default());

    let alpha = join(&server, "alpha", &[]).await;
    let beta = join(&server, "beta", &[]).await;
    let gamma = join(&server, "gamma", &[]).await;
    let beta_id = beta.client_id().to_string();

    let alpha_conn = alpha.open_p2p(P2pOptions::default()).await.unwrap();
    let mut beta_conn = beta.open_p2p(P2pOptions::default()).await.unwrap();
    let mut gamma_conn = gamma.open_p2p(P2pOptions::default()).await.unwrap();

    // Beta answers every request with {"a": 2} and reports what it saw.
    let (seen_tx, mut seen_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        while let Some(msg) = beta_conn.next_message().await {
            if msg.kind == RouterMessageKind::P2pRequest {
                let _ = seen_tx.send(msg.payload.clone()).await;
                let _ = beta_conn
                    .respond(&msg, true, payload(&[("a", json!(2))]))
                    .await;
            }
        }
    });

    let response = alpha_conn
        .request(beta_id, payload(&[("q", json!(1))]))
        .await
        .unwrap();

    assert_eq!(response.kind, RouterMessageKind::P2pResponse);
    assert_eq!(response.success, Some(true));
    assert_eq!(response.payload.get("a"), Some(&json!(2)));

    // Beta saw the request; gamma saw nothing at all.
    let seen = timeout(Duration::from_secs(1), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.get("q"), Some(&json!(1)));
    assert!(recv_within(&mut gamma_conn, 200).await.is_none());
}

#[tokio::test]
async fn request_to_missing_peer_synthesizes_not_found() {
    let (_router, server) = start(RouterConfig::default());
    let alpha = join(&server, "alpha", &[]).await;
    let conn = alpha.open_p2p(P2pOptions::default()).await.unwrap();

    let response = conn
        .request("no-such-client", payload(&[("q", json!(1))]))
        .await
        .unwrap();

    assert_eq!(response.kind, RouterMessageKind::P2pResponse);
    assert_eq!(response.success, Some(false));
    assert!(response.error.unwrap().contains("not-found"));
}

#[tokio::test]
async fn unicast_reaches_only_its_target() {
    let (_router, server) = start(RouterConfig::default());
    let alpha = join(&server, "alpha", &[]).await;
    let beta = join(&server, "beta", &[]).await;
    let gamma = join(&server, "gamma", &[]).await;
    let beta_id = beta.client_id().to_string();

    let alpha_conn = alpha.open_p2p(P2pOptions::default()).await.unwrap();
    let mut beta_conn = beta.open_p2p(P2pOptions::default()).await.unwrap();
    let mut gamma_conn = gamma.open_p2p(P2pOptions::default()).await.unwrap();

    alpha_conn
        .unicast(beta_id, payload(&[("note", json!("hi"))]))
        .await
        .unwrap();

    let got = recv_within(&mut beta_conn, 1000).await.unwrap();
    assert_eq!(got.kind, RouterMessageKind::Unicast);
    assert_eq!(got.payload.get("note"), Some(&json!("hi")));
    assert!(recv_within(&mut gamma_conn, 200).await.is_none());
}

#[tokio::test]
async fn multicast_dedupes_across_groups_and_skips_sender() {
    let (_router, server) = start(RouterConfig::default());
    // Alpha is itself in g1; beta is in both targeted groups.
    let alpha = join(&server, "alpha", &["g1"]).await;
    let beta = join(&server, "beta", &["g1", "g2"]).await;
    let gamma = join(&server, "gamma", &["g2"]).await;
    let outsider = join(&server, "outsider", &["other"]).await;

    let alpha_conn = alpha.open_p2p(P2pOptions::default()).await.unwrap();
    let mut beta_conn = beta.open_p2p(P2pOptions::default()).await.unwrap();
    let mut gamma_conn = gamma.open_p2p(P2pOptions::default()).await.unwrap();
    let mut outsider_conn = outsider.open_p2p(P2pOptions::default()).await.unwrap();

    alpha_conn
        .multicast(
            vec!["g1".into(), "g2".into()],
            payload(&[("n", json!(1))]),
        )
        .await
        .unwrap();

    // Beta gets exactly one copy despite membership in both groups.
    assert!(recv_within(&mut beta_conn, 1000).await.is_some());
    assert!(recv_within(&mut beta_conn, 200).await.is_none());

    assert!(recv_within(&mut gamma_conn, 1000).await.is_some());
    assert!(recv_within(&mut outsider_conn, 200).await.is_none());
}

#[tokio::test]
async fn broadcast_reaches_everyone_but_the_sender() {
    let (_router, server) = start(RouterConfig::default());
    let alpha = join(&server, "alpha", &[]).await;
    let beta = join(&server, "beta", &[]).await;
    let gamma = join(&server, "gamma", &[]).await;

    let mut alpha_conn = alpha.open_p2p(P2pOptions::default()).await.unwrap();
    let mut beta_conn = beta.open_p2p(P2pOptions::default()).await.unwrap();
    let mut gamma_conn = gamma.open_p2p(P2pOptions::default()).await.unwrap();

    alpha_conn.broadcast(payload(&[("x", json!(0))])).await.unwrap();

    assert!(recv_within(&mut beta_conn, 1000).await.is_some());
    assert!(recv_within(&mut beta_conn, 200).await.is_none());
    assert!(recv_within(&mut gamma_conn, 1000).await.is_some());
    assert!(recv_within(&mut alpha_conn, 200).await.is_none());
}

#[tokio::test]
async fn subscription_starts_with_a_snapshot_then_deltas() {
    let (_router, server) = start(RouterConfig::default());
    let alpha = join(&server, "alpha", &[]).await;

    let mut events = alpha.subscribe_events().await.unwrap();
    let first: TopologyEvent = events.next().await.unwrap().unwrap();
    assert_eq!(first.kind, TopologyEventKind::Snapshot);
    assert_eq!(first.clients.len(), 1);
    assert_eq!(first.clients[0].name, "alpha");

    let beta = join(&server, "beta", &[]).await;
    let joined = timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(joined.kind, TopologyEventKind::ClientJoined);
    assert_eq!(joined.client.as_ref().unwrap().name, "beta");

    // Closing beta's p2p stream produces client-left.
    let beta_conn = beta.open_p2p(P2pOptions::default()).await.unwrap();
    beta_conn.close().await.unwrap();
    let left = timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(left.kind, TopologyEventKind::ClientLeft);
    assert_eq!(left.client.as_ref().unwrap().name, "beta");
}

#[tokio::test]
async fn reregistration_keeps_id_and_emits_no_join() {
    let (_router, server) = start(RouterConfig::default());
    let alpha = join(&server, "alpha", &[]).await;
    let id = alpha.client_id().to_string();

    let mut events = alpha.subscribe_events().await.unwrap();
    let first = events.next().await.unwrap().unwrap();
    assert_eq!(first.kind, TopologyEventKind::Snapshot);

    // Reconnect presenting the unexpired id: same id back.
    let again = RouterHandle::register(
        connect(&server),
        RegisterOptions {
            client_id: Some(id.clone()),
            name: "alpha".into(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(again.client_id(), id);

    // No client-joined delta arrives.
    assert!(
        timeout(Duration::from_millis(300), events.next())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn changing_metadata_on_reregister_emits_delta() {
    let (_router, server) = start(RouterConfig::default());
    let alpha = join(&server, "alpha", &[]).await;
    let id = alpha.client_id().to_string();

    let mut events = alpha.subscribe_events().await.unwrap();
    events.next().await.unwrap().unwrap(); // snapshot

    RouterHandle::register(
        connect(&server),
        RegisterOptions {
            client_id: Some(id),
            name: "alpha".into(),
            metadata: HashMap::from([("zone".to_string(), "eu".to_string())]),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let delta = timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(delta.kind, TopologyEventKind::ClientMetadataChanged);
    assert_eq!(
        delta.client.unwrap().metadata.get("zone").map(String::as_str),
        Some("eu")
    );
}

#[tokio::test]
async fn slow_subscriber_is_dropped_with_resource_exhausted() {
    let (router, server) = start(RouterConfig {
        event_queue_depth: 1,
        ..RouterConfig::default()
    });
    let alpha = join(&server, "alpha", &[]).await;

    let mut events = alpha.subscribe_events().await.unwrap();
    // Receiving the snapshot proves the subscription is live server-side.
    let first = events.next().await.unwrap().unwrap();
    assert_eq!(first.kind, TopologyEventKind::Snapshot);

    // Emit a burst of joins without yielding in between: the first one
    // parks in the depth-1 queue and the second overflows it, so the
    // broadcaster drops this subscriber instead of blocking.
    for i in 0..3 {
        router
            .register_client(trellis_router::RegisterRequest {
                client_id: None,
                name: format!("peer-{i}"),
                groups: Vec::new(),
                metadata: HashMap::new(),
            })
            .unwrap();
    }

    let outcome = timeout(Duration::from_secs(5), async {
        loop {
            match events.next().await {
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(e),
                None => return None,
            }
        }
    })
    .await
    .unwrap();

    let err = outcome.expect("stream must end with an overflow error");
    assert_eq!(err.code(), StatusCode::ResourceExhausted);
    assert!(router.metrics().subscribers_dropped >= 1);
}

#[tokio::test]
async fn stale_clients_are_evicted() {
    let (router, server) = start(RouterConfig {
        heartbeat_interval: Duration::from_millis(50),
        client_timeout: Duration::from_millis(150),
        ..RouterConfig::default()
    });
    let alpha = join(&server, "alpha", &[]).await;
    let watcher = join(&server, "watcher", &[]).await;

    // Keep the watcher alive through p2p heartbeats; alpha stays idle.
    let _watcher_conn = watcher
        .open_p2p(P2pOptions {
            heartbeat_interval: Duration::from_millis(50),
            ..P2pOptions::default()
        })
        .await
        .unwrap();

    let mut events = watcher.subscribe_events().await.unwrap();
    events.next().await.unwrap().unwrap(); // snapshot

    let left = timeout(Duration::from_secs(2), async {
        loop {
            let event = events.next().await.unwrap().unwrap();
            if event.kind == TopologyEventKind::ClientLeft {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(left.client.unwrap().name, "alpha");

    let online = watcher.online_clients(ClientFilter::default()).await.unwrap();
    assert!(online.iter().all(|c| c.name != "alpha"));
    assert!(router.metrics().clients_evicted >= 1);
    drop(alpha);
}
