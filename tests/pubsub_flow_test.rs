mod common;

use common::{fast_config, settle, wait_until, TestEngine};
use pg_pubsub::sql::Statement;
use pg_pubsub::{EventKind, InMemoryServer, NotifyClient, PubSubEvent};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_test::assert_ok;

/// Without election every subscriber receives every message
#[tokio::test]
async fn test_all_subscribers_receive_without_election() {
    let server = InMemoryServer::new();
    let a = TestEngine::connected(&server, fast_config()).await;
    let b = TestEngine::connected(&server, fast_config()).await;
    let publisher = TestEngine::connected(&server, fast_config()).await;

    assert_ok!(a.pubsub.listen("orders").await);
    assert_ok!(b.pubsub.listen("orders").await);

    assert_ok!(publisher.pubsub.notify("orders", &json!({"id": 1})).await);
    assert_ok!(publisher.pubsub.notify("orders", &json!({"id": 2})).await);

    wait_until("both subscribers to receive", || {
        a.messages.len() == 2 && b.messages.len() == 2
    })
    .await;

    let expected = vec![Some(json!({"id": 1})), Some(json!({"id": 2}))];
    assert_eq!(a.messages.payloads("orders"), expected);
    assert_eq!(b.messages.payloads("orders"), expected);
    assert_eq!(publisher.messages.len(), 0);
}

#[tokio::test]
async fn test_listen_emits_event_and_tracks_channel() {
    let server = InMemoryServer::new();
    let a = TestEngine::connected(&server, fast_config()).await;
    let mut events = a.pubsub.subscribe();

    assert_ok!(a.pubsub.listen("orders").await);

    match events.try_recv().expect("listen event") {
        PubSubEvent::Listen(channel) => assert_eq!(channel, "orders"),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(a.pubsub.all_channels(), vec!["orders".to_string()]);
    assert_eq!(a.pubsub.active_channels(), vec!["orders".to_string()]);
    assert!(a.pubsub.inactive_channels().is_empty());
    assert_eq!(server.listeners("orders"), vec![a.pid()]);
}

#[tokio::test]
async fn test_unlisten_stops_delivery() {
    let server = InMemoryServer::new();
    let a = TestEngine::connected(&server, fast_config()).await;
    let mut events = a.pubsub.subscribe();

    assert_ok!(a.pubsub.listen("orders").await);
    assert_ok!(a.pubsub.unlisten("orders").await);
    assert_ok!(a.pubsub.notify("orders", &json!(1)).await);
    settle().await;

    assert_eq!(a.messages.len(), 0);
    let unlisten = std::iter::from_fn(|| events.try_recv().ok())
        .find_map(|event| match event {
            PubSubEvent::Unlisten(channels) => Some(channels),
            _ => None,
        });
    assert_eq!(unlisten, Some(vec!["orders".to_string()]));
}

#[tokio::test]
async fn test_own_messages_are_dropped_when_filtered() {
    let server = InMemoryServer::new();
    let filtered = TestEngine::connected(&server, fast_config().with_filtered(true)).await;
    let unfiltered = TestEngine::connected(&server, fast_config()).await;

    for engine in [&filtered, &unfiltered] {
        assert_ok!(engine.pubsub.listen("orders").await);
    }
    for engine in [&filtered, &unfiltered] {
        assert_ok!(engine.pubsub.notify("orders", &json!("self")).await);
    }

    wait_until("unfiltered engine to see both messages", || {
        unfiltered.messages.len() == 2
    })
    .await;
    wait_until("filtered engine to see the other message", || {
        filtered.messages.len() == 1
    })
    .await;
    settle().await;

    assert_eq!(filtered.messages.len(), 1);
    assert_eq!(filtered.pubsub.stats().messages_dropped, 1);
}

#[tokio::test]
async fn test_payload_decoding() {
    let server = InMemoryServer::new();
    let a = TestEngine::connected(&server, fast_config()).await;
    assert_ok!(a.pubsub.listen("raw").await);

    let raw = server.client();
    raw.connect().await.unwrap();
    for payload in ["", "not json", r#"{"id":7}"#] {
        raw.execute(Statement::Notify {
            channel: "raw".to_string(),
            payload: payload.to_string(),
        })
        .await
        .unwrap();
    }

    wait_until("three messages", || a.messages.len() == 3).await;
    assert_eq!(
        a.messages.payloads("raw"),
        vec![None, Some(json!({})), Some(json!({"id": 7}))]
    );
}

#[tokio::test]
async fn test_unusual_channel_names_and_payloads() {
    let server = InMemoryServer::new();
    let a = TestEngine::connected(&server, fast_config()).await;
    let channel = "we\"ird 'chan\\nel";

    assert_ok!(a.pubsub.listen(channel).await);
    assert_ok!(a.pubsub.notify(channel, &json!({"text": "it's a \\ test"})).await);

    wait_until("message on quoted channel", || a.messages.len() == 1).await;
    assert_eq!(
        a.messages.payloads(channel),
        vec![Some(json!({"text": "it's a \\ test"}))]
    );
}

#[tokio::test]
async fn test_handlers_can_be_removed() {
    let server = InMemoryServer::new();
    let a = TestEngine::connected(&server, fast_config()).await;
    let count = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&count);
    let id = a.pubsub.on(EventKind::Message, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert_ok!(a.pubsub.listen("orders").await);
    assert_ok!(a.pubsub.notify("orders", &json!(1)).await);
    wait_until("first message", || a.messages.len() == 1).await;

    assert!(a.pubsub.off(id));
    assert_ok!(a.pubsub.notify("orders", &json!(2)).await);
    wait_until("second message", || a.messages.len() == 2).await;

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stats_track_messages() {
    let server = InMemoryServer::new();
    let a = TestEngine::connected(&server, fast_config()).await;
    assert!(a.pubsub.stats().last_message_at.is_none());

    assert_ok!(a.pubsub.listen("orders").await);
    assert_ok!(a.pubsub.listen("invoices").await);
    assert_ok!(a.pubsub.notify("orders", &json!(1)).await);
    wait_until("message", || a.messages.len() == 1).await;

    let stats = a.pubsub.stats();
    assert_eq!(stats.tracked_channels, 2);
    assert_eq!(stats.active_channels, 2);
    assert_eq!(stats.messages_received, 1);
    assert_eq!(stats.reconnects, 0);
    assert!(stats.last_message_at.is_some());
}
