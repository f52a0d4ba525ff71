mod common;

use common::{fast_config, next_event, wait_until, TestEngine};
use pg_pubsub::{ConnectionState, InMemoryServer, NotifyClient, PubSubError, PubSubEvent};
use serde_json::json;
use std::time::Duration;
use tokio_test::assert_ok;

#[tokio::test]
async fn test_reconnect_restores_channels() {
    let server = InMemoryServer::new();
    let a = TestEngine::connected(&server, fast_config()).await;
    assert_ok!(a.pubsub.listen("orders").await);
    let old_pid = a.pid();
    let mut events = a.pubsub.subscribe();

    assert!(server.kill_session(old_pid));

    assert!(matches!(
        next_event(&mut events, |e| matches!(e, PubSubEvent::End)).await,
        PubSubEvent::End
    ));
    // the new session announces itself before the reconnect completes
    let first = next_event(&mut events, |e| {
        matches!(e, PubSubEvent::Connect | PubSubEvent::Reconnect(_))
    })
    .await;
    assert!(matches!(first, PubSubEvent::Connect));
    let reconnect = next_event(&mut events, |e| matches!(e, PubSubEvent::Reconnect(_))).await;
    assert!(matches!(reconnect, PubSubEvent::Reconnect(1)));

    let new_pid = a.pid();
    assert_ne!(new_pid, old_pid);
    assert_eq!(server.listeners("orders"), vec![new_pid]);
    assert_eq!(a.pubsub.state(), ConnectionState::Connected);

    let stats = a.pubsub.stats();
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.retry_count, 0);

    let publisher = TestEngine::connected(&server, fast_config()).await;
    assert_ok!(publisher.pubsub.notify("orders", &json!("after")).await);
    wait_until("message after reconnect", || a.messages.len() == 1).await;
}

#[tokio::test]
async fn test_reconnect_retries_until_server_returns() {
    let server = InMemoryServer::new();
    let a = TestEngine::connected(&server, fast_config().with_retry_limit(50)).await;
    assert_ok!(a.pubsub.listen("orders").await);
    let mut events = a.pubsub.subscribe();

    server.set_available(false);
    assert!(server.kill_session(a.pid()));
    wait_until("a few refused attempts", || server.connect_attempts() >= 4).await;
    server.set_available(true);

    match next_event(&mut events, |e| matches!(e, PubSubEvent::Reconnect(_))).await {
        PubSubEvent::Reconnect(retries) => assert!(retries >= 4, "retries = {retries}"),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(a.pubsub.stats().retry_count, 0);
    assert_eq!(server.listeners("orders"), vec![a.pid()]);
}

/// Exhausting the retry limit emits exactly one error and closes for good
#[tokio::test]
async fn test_retry_exhaustion_closes_engine() {
    let server = InMemoryServer::new();
    let a = TestEngine::connected(&server, fast_config().with_retry_limit(3)).await;
    let mut events = a.pubsub.subscribe();

    server.set_available(false);
    assert!(server.kill_session(a.pid()));

    match next_event(&mut events, |e| matches!(e, PubSubEvent::Error(_))).await {
        PubSubEvent::Error(error) => {
            assert!(matches!(
                *error,
                PubSubError::ReconnectExhausted { retries: 3 }
            ));
            assert_eq!(error.to_string(), "Connect failed after 3 retries...");
        }
        other => panic!("unexpected event {other:?}"),
    }
    next_event(&mut events, |e| matches!(e, PubSubEvent::Close)).await;

    let attempts = server.connect_attempts();
    // initial connect plus the attempts before the limit was reached
    assert_eq!(attempts, 3);

    server.set_available(true);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(server.connect_attempts(), attempts);
    assert_eq!(a.pubsub.state(), ConnectionState::Failed);
    assert!(!a.client.is_connected());
    let further_errors = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, PubSubEvent::Error(_)))
        .count();
    assert_eq!(further_errors, 0);

    // closing after the engine gave up is a no-op
    assert_ok!(a.pubsub.close().await);
}

#[tokio::test]
async fn test_close_cancels_pending_reconnect() {
    let server = InMemoryServer::new();
    let a = TestEngine::connected(
        &server,
        fast_config()
            .with_retry_delay(Duration::from_millis(200))
            .with_retry_backoff(1.0, Duration::from_millis(200)),
    )
    .await;
    let mut events = a.pubsub.subscribe();

    assert!(server.kill_session(a.pid()));
    next_event(&mut events, |e| matches!(e, PubSubEvent::End)).await;
    assert_eq!(a.pubsub.state(), ConnectionState::Disconnected);

    assert_ok!(a.pubsub.close().await);
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(server.connect_attempts(), 1);
    assert_eq!(a.pubsub.state(), ConnectionState::Closed);
    let reconnects = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, PubSubEvent::Reconnect(_)))
        .count();
    assert_eq!(reconnects, 0);
}

#[tokio::test]
async fn test_deliberate_close_never_reconnects() {
    let server = InMemoryServer::new();
    let a = TestEngine::connected(&server, fast_config()).await;

    assert_ok!(a.pubsub.close().await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server.connect_attempts(), 1);
    assert_eq!(server.session_count(), 0);
    assert_eq!(a.pubsub.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_exclusive_engine_reacquires_after_reconnect() {
    let server = InMemoryServer::new();
    let a = TestEngine::connected(&server, fast_config().with_single_listener(true)).await;
    assert_ok!(a.pubsub.listen("orders").await);
    let mut events = a.pubsub.subscribe();

    assert!(server.kill_session(a.pid()));
    next_event(&mut events, |e| matches!(e, PubSubEvent::End)).await;
    assert!(!a.pubsub.is_active(Some("orders")));

    next_event(&mut events, |e| matches!(e, PubSubEvent::Reconnect(_))).await;
    assert!(a.pubsub.is_active(Some("orders")));
    assert_eq!(
        server.lock_holder(pg_pubsub::LockKey::for_channel("orders")),
        Some(a.pid())
    );
}

#[tokio::test]
async fn test_escalating_backoff_spaces_attempts() {
    let server = InMemoryServer::new();
    let a = TestEngine::connected(
        &server,
        fast_config()
            .with_retry_limit(100)
            .with_retry_delay(Duration::from_millis(20))
            .with_retry_backoff(4.0, Duration::from_secs(10)),
    )
    .await;

    server.set_available(false);
    assert!(server.kill_session(a.pid()));

    // delays of 20, 80, 320ms: two attempts fit in 250ms, a third does not
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(server.connect_attempts(), 1 + 2);
    assert_eq!(a.pubsub.state(), ConnectionState::Disconnected);

    assert_ok!(a.pubsub.close().await);
}
