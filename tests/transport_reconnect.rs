// tests/transport_reconnect.rs
//
// Reconnection policy of the managed transport: fallback rotation, the
// single free retry after abnormal closures, connect timeouts, the
// preferred-endpoint budget, heartbeat supervision, and server pacing.
// The clock is paused throughout, so every delay asserted here is exact.

mod common;

use std::time::Duration;

use callwire::backoff::BackoffConfig;
use callwire::error::SignalingError;
use callwire::transport::{Transport, TransportConfig, TransportEvent, TransportState};
use common::{
    ConnectScript, MockConnector, expect_link, expect_no_link, expect_raw_frame, init_logging,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Jitter-free tuning so the asserted delays are deterministic.
fn config(uris: &[&str]) -> TransportConfig {
    TransportConfig {
        uris: uris.iter().map(|u| u.to_string()).collect(),
        preferred_backoff: BackoffConfig {
            jitter: 0.0,
            max_delay: Duration::from_secs(10),
            ..BackoffConfig::default()
        },
        primary_backoff: BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        },
        ..TransportConfig::default()
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("timed out waiting for a transport event")
        .expect("transport driver stopped")
}

async fn wait_for_open(events: &mut mpsc::UnboundedReceiver<TransportEvent>) {
    loop {
        if matches!(next_event(events).await, TransportEvent::Open) {
            return;
        }
    }
}

fn drain(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn failed_connects_rotate_through_the_ranked_list_and_wrap() {
    init_logging();
    let (connector, mut links) = MockConnector::new();
    connector.script([ConnectScript::Refuse; 5]);
    let (transport, _events) =
        Transport::new(config(&["wss://a", "wss://b", "wss://c"]), connector.clone());

    transport.open();
    let link = expect_link(&mut links).await;

    assert_eq!(link.uri, "wss://c");
    assert_eq!(
        connector.dialed(),
        vec!["wss://a", "wss://b", "wss://c", "wss://a", "wss://b", "wss://c"]
    );
}

#[tokio::test(start_paused = true)]
async fn abnormal_closure_retries_the_same_endpoint_once_before_rotating() {
    init_logging();
    let (connector, mut links) = MockConnector::new();
    connector.script([ConnectScript::Accept, ConnectScript::Refuse]);
    let (transport, mut events) = Transport::new(config(&["wss://a", "wss://b"]), connector.clone());

    transport.open();
    let link = expect_link(&mut links).await;
    wait_for_open(&mut events).await;
    link.remote.close(1006).await;

    // The free retry re-dials a; the scripted refusal consumes it and the
    // cursor finally rotates to b.
    let fallback = expect_link(&mut links).await;
    assert_eq!(fallback.uri, "wss://b");
    assert_eq!(connector.dialed(), vec!["wss://a", "wss://a", "wss://b"]);
}

#[tokio::test(start_paused = true)]
async fn orderly_closure_redials_the_same_endpoint_without_rotating() {
    init_logging();
    let (connector, mut links) = MockConnector::new();
    let (transport, mut events) = Transport::new(config(&["wss://a", "wss://b"]), connector.clone());

    transport.open();
    let link = expect_link(&mut links).await;
    wait_for_open(&mut events).await;
    link.remote.close(1000).await;

    let again = expect_link(&mut links).await;
    assert_eq!(again.uri, "wss://a");
    assert_eq!(connector.dialed(), vec!["wss://a", "wss://a"]);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_abandons_the_attempt_and_advances() {
    init_logging();
    let (connector, mut links) = MockConnector::new();
    connector.script([ConnectScript::Hang]);
    let (transport, _events) = Transport::new(
        TransportConfig {
            connect_timeout: Duration::from_secs(1),
            ..config(&["wss://a", "wss://b"])
        },
        connector.clone(),
    );

    transport.open();
    let link = expect_link(&mut links).await;

    assert_eq!(link.uri, "wss://b");
    assert_eq!(connector.dialed(), vec!["wss://a", "wss://b"]);
}

#[tokio::test(start_paused = true)]
async fn preferred_endpoint_is_abandoned_once_its_budget_expires() {
    init_logging();
    let (connector, mut links) = MockConnector::new();
    connector.script([ConnectScript::Refuse, ConnectScript::Refuse]);
    let (transport, mut events) = Transport::new(
        TransportConfig {
            preferred_uri: Some("wss://edge".to_owned()),
            max_preferred_duration: Duration::from_millis(300),
            ..config(&["wss://a"])
        },
        connector.clone(),
    );

    // Preferred attempts at 0ms and 100ms; the retry due at 300ms finds the
    // budget spent and falls back to the ranked list.
    transport.open();
    let link = expect_link(&mut links).await;
    wait_for_open(&mut events).await;
    assert_eq!(link.uri, "wss://a");
    assert_eq!(connector.dialed(), vec!["wss://edge", "wss://edge", "wss://a"]);

    // The preferred endpoint stays gone after later failures.
    link.remote.close(1006).await;
    let again = expect_link(&mut links).await;
    assert_eq!(again.uri, "wss://a");
}

#[tokio::test(start_paused = true)]
async fn frames_feed_the_heartbeat_and_silence_kills_the_connection() {
    init_logging();
    let (connector, mut links) = MockConnector::new();
    let (transport, mut events) = Transport::new(config(&["wss://a"]), connector.clone());

    transport.open();
    let link = expect_link(&mut links).await;
    wait_for_open(&mut events).await;

    // A frame at 10s pushes the 15s heartbeat deadline out to 25s.
    tokio::time::sleep(Duration::from_secs(10)).await;
    link.remote.frame("tick").await;
    expect_no_link(&mut links, Duration::from_secs(14)).await;

    // Then nothing else arrives, the watchdog fires, and the endpoint is
    // redialed.
    let redial = expect_link(&mut links).await;
    assert_eq!(redial.uri, "wss://a");

    let seen = drain(&mut events);
    assert!(
        seen.iter().any(|event| matches!(
            event,
            TransportEvent::Error(SignalingError::ConnectionDisconnected(m))
                if m.contains("heartbeat")
        )),
        "expected a heartbeat error, saw {seen:?}"
    );
    assert!(
        seen.iter()
            .any(|event| matches!(event, TransportEvent::Closed { will_reconnect: true })),
        "expected a reconnecting close, saw {seen:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn stable_connection_rewinds_the_backoff_curve() {
    init_logging();
    let (connector, mut links) = MockConnector::new();
    connector.script([ConnectScript::Refuse, ConnectScript::Refuse]);
    let (transport, mut events) = Transport::new(config(&["wss://a"]), connector.clone());

    // Two failures grow the delay to 400ms for whatever comes next.
    transport.open();
    let link = expect_link(&mut links).await;
    wait_for_open(&mut events).await;

    // Staying open past the stability threshold rewinds the curve, so the
    // redial after the next drop waits the minimum again.
    tokio::time::sleep(Duration::from_millis(10_500)).await;
    let before = Instant::now();
    link.remote.close(1006).await;
    let _redial = expect_link(&mut links).await;
    let waited = before.elapsed();

    assert!(
        waited >= Duration::from_millis(100) && waited < Duration::from_millis(200),
        "redial waited {waited:?}, expected the minimum delay"
    );
}

#[tokio::test(start_paused = true)]
async fn send_reports_whether_a_healthy_connection_took_the_frame() {
    init_logging();
    let (connector, mut links) = MockConnector::new();
    let (transport, mut events) = Transport::new(config(&["wss://a"]), connector.clone());

    assert!(!transport.send("too early".to_owned()).await);

    transport.open();
    let mut link = expect_link(&mut links).await;
    wait_for_open(&mut events).await;
    assert!(transport.send("hello".to_owned()).await);
    assert_eq!(expect_raw_frame(&mut link).await, "hello");

    transport.close();
    assert!(!transport.send("too late".to_owned()).await);
    assert_eq!(transport.state().await, TransportState::Closed);
}

#[tokio::test(start_paused = true)]
async fn explicit_close_stops_reconnecting_and_drops_the_socket() {
    init_logging();
    let (connector, mut links) = MockConnector::new();
    let (transport, mut events) = Transport::new(config(&["wss://a"]), connector.clone());

    transport.open();
    let mut link = expect_link(&mut links).await;
    wait_for_open(&mut events).await;

    transport.close();
    loop {
        match next_event(&mut events).await {
            TransportEvent::Closed { will_reconnect } => {
                assert!(!will_reconnect);
                break;
            }
            other => panic!("expected the close notification, got {other:?}"),
        }
    }
    expect_no_link(&mut links, Duration::from_secs(60)).await;
    assert!(link.outbound.recv().await.is_none(), "socket kept alive");
}

#[tokio::test(start_paused = true)]
async fn replacing_the_uri_list_restarts_from_its_head() {
    init_logging();
    let (connector, mut links) = MockConnector::new();
    connector.script([ConnectScript::Refuse, ConnectScript::Refuse]);
    let (transport, _events) =
        Transport::new(config(&["wss://a", "wss://b", "wss://c"]), connector.clone());

    transport.open();
    // Both scripted refusals land (a at 0ms, b at 100ms); the next retry is
    // due at 300ms.
    tokio::time::sleep(Duration::from_millis(200)).await;
    transport.update_uris(vec!["wss://x".to_owned(), "wss://y".to_owned()]);

    let link = expect_link(&mut links).await;
    assert_eq!(link.uri, "wss://x");
    assert_eq!(connector.dialed(), vec!["wss://a", "wss://b", "wss://x"]);
}

#[tokio::test(start_paused = true)]
async fn server_pacing_overrides_exactly_one_delay() {
    init_logging();
    let (connector, mut links) = MockConnector::new();
    connector.script([ConnectScript::Refuse, ConnectScript::Refuse]);
    let (transport, _events) = Transport::new(config(&["wss://a"]), connector.clone());

    transport.set_retry_after(Duration::from_secs(3));
    let started = Instant::now();
    transport.open();

    // First gap honors the server's 3s, the second falls back to the curve
    // (200ms at attempt one), so the accepted dial lands at 3.2s.
    let _link = expect_link(&mut links).await;
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(3_200) && elapsed < Duration::from_millis(3_300),
        "accepted dial landed after {elapsed:?}"
    );
    assert_eq!(connector.dialed(), vec!["wss://a", "wss://a", "wss://a"]);
}
