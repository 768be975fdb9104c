//! End-to-end scenarios driven through the public Router/Connection surface,
//! one per exercised delivery path.

use std::sync::Arc;

use agent_relay::broker::Broker;
use agent_relay::channel::{ChannelRegistry, TopicRegistry};
use agent_relay::config::Config;
use agent_relay::connection::{Connection, ConnectionState, EntityKind, Transport};
use agent_relay::envelope::{Envelope, EnvelopeKind};
use agent_relay::message_log::MessageLog;
use agent_relay::protocol;
use agent_relay::registry::Registry;
use agent_relay::router::Router;

fn router() -> Router {
    Router::new(
        Arc::new(Registry::new()),
        Arc::new(ChannelRegistry::new()),
        Arc::new(TopicRegistry::new()),
        Arc::new(MessageLog::new(50_000, 24 * 60 * 60 * 1000)),
        true,
    )
}

fn join(name: &str, router: &Router) -> (Arc<Connection>, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let conn = Arc::new(Connection::new(Transport::Local, EntityKind::Agent, tx));
    conn.set_state(ConnectionState::Active);
    {
        let mut meta = conn.meta.lock().unwrap();
        meta.agent_name = Some(name.to_string());
    }
    router.registry.register(name, &conn.id, false, |_| false).unwrap();
    router.attach_connection(Arc::clone(&conn));
    (conn, rx)
}

fn deliver_from(frame: &[u8]) -> Envelope {
    Envelope::from_json(&frame[4..]).unwrap()
}

/// Drives a HELLO through the real handshake (`protocol::handle_hello`)
/// against a live `Broker`, returning the fresh Connection, the envelopes a
/// resume replayed (empty for a fresh HELLO), and the WELCOME's assigned
/// resume token.
async fn hello(broker: &Broker, name: &str, resume_token: Option<&str>) -> (Arc<Connection>, Vec<Envelope>, String) {
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let conn = Arc::new(Connection::new(Transport::Local, EntityKind::Agent, tx));
    let mut payload = serde_json::json!({ "agent": name });
    if let Some(token) = resume_token {
        payload["session"] = serde_json::json!({ "resumeToken": token });
    }
    let envelope = Envelope::new(EnvelopeKind::Hello).with_payload(payload);
    let (welcome, replay) = protocol::handle_hello(broker, &conn, envelope).await.unwrap();
    let resume_token = welcome.payload.get("resumeToken").and_then(|v| v.as_str()).unwrap().to_string();
    (conn, replay, resume_token)
}

#[tokio::test]
async fn direct_message_both_parties_connected() {
    let router = router();
    let (alice, _alice_rx) = join("alice", &router);
    let (_bob, mut bob_rx) = join("bob", &router);

    let send = Envelope::new(EnvelopeKind::Send).with_to("bob").with_payload(serde_json::json!({"body": "hi"}));
    router.route(&alice, send).await.unwrap();

    let deliver = deliver_from(&bob_rx.try_recv().expect("bob should see exactly one DELIVER"));
    assert_eq!(deliver.kind, EnvelopeKind::Deliver);
    assert_eq!(deliver.from.as_deref(), Some("alice"));
    assert_eq!(deliver.body(), Some("hi"));
    assert_eq!(deliver.seq, Some(1));
    assert!(bob_rx.try_recv().is_err(), "only one DELIVER expected");
}

#[tokio::test]
async fn broadcast_reaches_every_other_active_peer_with_distinct_ids() {
    let router = router();
    let (alice, mut alice_rx) = join("alice", &router);
    let (_bob, mut bob_rx) = join("bob", &router);
    let (_carol, mut carol_rx) = join("carol", &router);

    let send = Envelope::new(EnvelopeKind::Send).with_to("*").with_payload(serde_json::json!({"body": "ping"}));
    router.route(&alice, send).await.unwrap();

    assert!(alice_rx.try_recv().is_err(), "sender should not receive its own broadcast");
    let bob_deliver = deliver_from(&bob_rx.try_recv().unwrap());
    let carol_deliver = deliver_from(&carol_rx.try_recv().unwrap());
    assert_ne!(bob_deliver.id, carol_deliver.id);
}

#[tokio::test]
async fn channel_message_survives_a_disconnect_and_resume_without_duplication() {
    let broker = Broker::new(Config::for_test());
    let (alice, _, _) = hello(&broker, "alice", None).await;
    let (bob, _, bob_token) = hello(&broker, "bob", None).await;
    broker.router.channels.join("#general", "alice");
    broker.router.channels.join("#general", "bob");

    // Bob disconnects; his inbound high-water mark is persisted into the
    // resume record as of this moment (nothing received yet).
    broker.router.detach_connection(&bob.id);

    let message = Envelope::new(EnvelopeKind::ChannelMessage).with_topic("#general").with_payload(serde_json::json!({"body": "x"}));
    broker.router.route(&alice, message).await.unwrap();

    // Bob reconnects with his resume token and should see exactly the one
    // channel message that arrived while he was away, no duplicates.
    let (new_bob, replay, new_bob_token) = hello(&broker, "bob", Some(&bob_token)).await;
    assert_eq!(replay.len(), 1);
    assert_eq!(replay[0].body(), Some("x"));

    // A third connect with the fresh token from the second HELLO replays
    // nothing further: the high-water mark now covers the channel message.
    broker.router.detach_connection(&new_bob.id);
    let (_, replay_again, _) = hello(&broker, "bob", Some(&new_bob_token)).await;
    assert!(replay_again.is_empty());
}

#[tokio::test]
async fn resume_token_replays_only_the_messages_after_the_high_water_mark() {
    let broker = Broker::new(Config::for_test());
    let (alice, _, _) = hello(&broker, "alice", None).await;
    let (bob, mut bob_rx, bob_token) = hello(&broker, "bob", None).await;

    for i in 1..=5 {
        let send = Envelope::new(EnvelopeKind::Send).with_to("bob").with_payload(serde_json::json!({"body": format!("msg{i}")}));
        broker.router.route(&alice, send).await.unwrap();
        bob_rx.try_recv().unwrap();
    }

    // Bob's transport drops; his inbound high-water (seq 5 on this stream)
    // is persisted into the resume record.
    broker.router.detach_connection(&bob.id);

    // Three more arrive while he's away.
    for i in 6..=8 {
        let send = Envelope::new(EnvelopeKind::Send).with_to("bob").with_payload(serde_json::json!({"body": format!("msg{i}")}));
        broker.router.route(&alice, send).await.unwrap();
    }

    // Bob reconnects with his resume token: exactly 3 DELIVERs, for seqs 6-8.
    let (_new_bob, replay, _) = hello(&broker, "bob", Some(&bob_token)).await;
    assert_eq!(replay.len(), 3);
    let seqs: Vec<_> = replay.iter().filter_map(|e| e.seq).collect();
    assert_eq!(seqs, vec![6, 7, 8]);
    let bodies: Vec<_> = replay.iter().filter_map(|e| e.body().map(str::to_string)).collect();
    assert_eq!(bodies, vec!["msg6", "msg7", "msg8"]);
}

#[tokio::test]
async fn unknown_recipient_blocking_send_errors_without_closing_the_connection() {
    let router = router();
    let (alice, _alice_rx) = join("alice", &router);

    let send = Envelope::new(EnvelopeKind::Send)
        .with_to("ghost")
        .with_payload(serde_json::json!({"body": "hi", "sync": {"blocking": true, "correlationId": "c1"}}));
    let err = router.route(&alice, send).await.unwrap_err();
    assert_eq!(err.kind, agent_relay::error::ErrorKind::UnknownRecipient);
    assert!(!err.kind.is_fatal());
}
