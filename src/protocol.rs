//! Shared per-connection envelope handling (§4.1, §4.7).
//!
//! [`socket_server`](crate::socket_server) and the WebSocket listener both terminate
//! a transport's read loop into the same two entry points here: [`handle_hello`]
//! drives the HANDSHAKING → ACTIVE transition, and [`dispatch`] handles every
//! envelope kind once a Connection is ACTIVE. Neither function owns a loop or
//! a socket; the transport task still decides how bytes become envelopes and
//! envelopes become bytes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::broker::Broker;
use crate::connection::{Connection, ConnectionState};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::RelayError;
use crate::message_log::{MessageLogEntry, ResumeRecord};

/// How long a freshly-accepted transport has to send HELLO before the
/// transport task must close it (§6).
pub const HELLO_DEADLINE: Duration = Duration::from_secs(10);

/// Validates HELLO, registers the agent name, optionally resumes a prior
/// session, and returns the WELCOME to send back plus any envelopes the
/// resume must replay (§4.4): every entry logged for this agent with a
/// `seq` strictly greater than the stored high-water mark for its stream.
/// On error the caller must send the resulting ERROR and close the
/// transport — every HELLO failure is fatal to the attempt (§4.1).
pub async fn handle_hello(
    broker: &Broker,
    conn: &Arc<Connection>,
    envelope: Envelope,
) -> Result<(Envelope, Vec<Envelope>), RelayError> {
    if envelope.kind != EnvelopeKind::Hello {
        return Err(RelayError::bad_request("first envelope must be HELLO"));
    }

    let agent_name = envelope
        .payload
        .get("agent")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::bad_request("HELLO missing 'agent'"))?
        .to_string();
    let internal = envelope.payload.get("internal").and_then(Value::as_bool).unwrap_or(false);
    let resume_token = envelope
        .payload
        .get("session")
        .and_then(|s| s.get("resumeToken"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let router = &broker.router;
    let is_prior_active =
        |existing_connection_id: &str| router.connection_by_id(existing_connection_id).is_some_and(|c| c.is_active());
    router.registry.register(&agent_name, &conn.id, internal, is_prior_active)?;

    {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let mut meta = conn.meta.lock().unwrap();
        meta.agent_name = Some(agent_name.clone());
        meta.cli = envelope.payload.get("cli").and_then(Value::as_str).map(str::to_string);
        meta.model = envelope.payload.get("model").and_then(Value::as_str).map(str::to_string);
        meta.cwd = envelope.payload.get("cwd").and_then(Value::as_str).map(str::to_string);
        meta.team = envelope.payload.get("team").and_then(Value::as_str).map(str::to_string);
    }

    let mut resumed = false;
    let mut replay = Vec::new();
    if let Some(ref token) = resume_token {
        let record = broker.log.by_resume_token(token).ok_or_else(RelayError::resume_too_old)?;
        if record.agent_name != agent_name {
            return Err(RelayError::resume_too_old());
        }
        conn.adopt_session(record.session_id, token.clone());
        {
            #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
            let mut sequencer = conn.sequencer.lock().unwrap();
            for ((topic, peer), high_water) in &record.high_water {
                sequencer.seed(topic, peer, *high_water);
            }
        }
        conn.seed_inbound_high_water(record.high_water.clone());
        replay = replay_envelopes(broker, &agent_name, &record.high_water);
        // The replay itself counts as delivery: fold each replayed envelope's
        // seq into the high-water mark now, or a second resume with no live
        // traffic in between would replay the same envelopes again.
        for deliver in &replay {
            let topic = deliver.topic.as_deref().unwrap_or(crate::dedup::DEFAULT_TOPIC);
            let from = deliver.from.as_deref().unwrap_or_default();
            if let Some(seq) = deliver.seq {
                conn.record_inbound(topic, from, seq);
            }
        }
        resumed = true;
    }

    conn.set_state(ConnectionState::Active);
    router.attach_connection(Arc::clone(conn));

    let (session_id, resume_token) = {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let session_id = conn.session_id.lock().unwrap().clone();
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let resume_token = conn.resume_token.lock().unwrap().clone();
        (session_id, resume_token)
    };
    // Stored with this connection's own inbound high-water marks at HELLO
    // time; kept current as the session runs (see [`Router::detach_connection`]).
    broker.log.put_session(
        &resume_token,
        ResumeRecord {
            session_id: session_id.clone(),
            agent_name: agent_name.clone(),
            high_water: conn.inbound_high_water(),
        },
    );

    let welcome = Envelope::new(EnvelopeKind::Welcome).with_payload(serde_json::json!({
        "sessionId": session_id,
        "resumeToken": resume_token,
        "maxFrameBytes": broker.config.max_frame_bytes,
        "heartbeatMs": broker.config.heartbeat_ms,
        "resumed": resumed,
    }));
    Ok((welcome, replay))
}

/// Rebuilds the DELIVERs a resuming `agent_name` missed: every logged entry
/// addressed to it whose `seq` is strictly greater than the stored
/// high-water mark for its `(topic, from)` stream (§4.4).
fn replay_envelopes(
    broker: &Broker,
    agent_name: &str,
    high_water: &HashMap<crate::dedup::StreamKey, u64>,
) -> Vec<Envelope> {
    broker
        .log
        .by_recipient(agent_name, None, None)
        .into_iter()
        .filter(|entry| entry.kind == "Deliver")
        .filter_map(|entry| {
            let seq = entry.seq?;
            let topic = entry.topic.clone().unwrap_or_else(|| crate::dedup::DEFAULT_TOPIC.to_string());
            let from = entry.from.clone().unwrap_or_default();
            let already_seen = high_water.get(&(topic.clone(), from.clone())).copied().unwrap_or(0);
            if seq <= already_seen {
                return None;
            }
            Some(deliver_from_entry(&entry, &topic, &from, seq))
        })
        .collect()
}

fn deliver_from_entry(entry: &MessageLogEntry, topic: &str, from: &str, seq: u64) -> Envelope {
    Envelope::new(EnvelopeKind::Deliver)
        .with_from(from)
        .with_to(entry.to.clone())
        .with_topic(topic)
        .with_seq(seq)
        .with_payload(serde_json::json!({ "body": entry.body }))
}

/// Handles one envelope from an ACTIVE connection. Returns the reply to send
/// back, if any; `None` means the envelope needed no direct reply (DELIVER
/// fan-out, a PONG recorded, an ACK forwarded elsewhere).
pub async fn dispatch(broker: &Broker, conn: &Arc<Connection>, envelope: Envelope) -> Option<Envelope> {
    match envelope.kind {
        EnvelopeKind::Ping => Some(Envelope::new(EnvelopeKind::Pong)),
        EnvelopeKind::Pong => {
            conn.record_pong();
            None
        }
        EnvelopeKind::Ack | EnvelopeKind::Nack => {
            forward_ack(broker, &envelope);
            None
        }
        EnvelopeKind::Status => Some(handle_status(broker, &envelope)),
        EnvelopeKind::Inbox => Some(handle_inbox(broker, conn, &envelope)),
        EnvelopeKind::ListAgents => Some(handle_list_agents(broker)),
        EnvelopeKind::Spawn => Some(handle_spawn(broker, &envelope)),
        EnvelopeKind::Release => Some(handle_release(broker, &envelope)),
        _ => match broker.router.route(conn, envelope).await {
            Ok(()) => None,
            Err(err) => {
                if err.kind.is_fatal() {
                    conn.set_state(ConnectionState::Closing);
                }
                Some(err.to_envelope())
            }
        },
    }
}

/// Forwards an ACK/NACK to the Connection that sent the blocking SEND it
/// correlates to, resolved through the router's PendingAck table.
fn forward_ack(broker: &Broker, envelope: &Envelope) {
    let Some(correlation_id) = envelope.payload.get("correlationId").and_then(Value::as_str) else {
        return;
    };
    let Some(sender_connection_id) = broker.router.resolve_pending_ack(correlation_id) else {
        return;
    };
    if let Some(sender_conn) = broker.router.connection_by_id(&sender_connection_id) {
        let _ = sender_conn.send(envelope);
    }
}

/// STATUS / STATUS_RESPONSE: presence and liveness for one agent (`to`) or,
/// with no `to`, a roster of every currently-active name.
fn handle_status(broker: &Broker, envelope: &Envelope) -> Envelope {
    let body = if let Some(name) = envelope.to.as_deref() {
        let record = broker.registry.get(name);
        serde_json::json!({
            "agent": name,
            "online": record.as_ref().is_some_and(|r| r.connection_id.is_some()),
            "lastSeenMs": record.map(|r| r.last_seen_ms),
        })
    } else {
        serde_json::json!({ "agents": broker.registry.active_names() })
    };
    Envelope::new(EnvelopeKind::StatusResponse).with_payload(body)
}

/// INBOX / INBOX_RESPONSE: the message log's view of envelopes addressed to
/// the requesting agent, optionally bounded by `since`/`limit` in the payload.
fn handle_inbox(broker: &Broker, conn: &Connection, envelope: &Envelope) -> Envelope {
    let name = conn.agent_name().unwrap_or_default();
    let since_ms = envelope.payload.get("since").and_then(Value::as_u64);
    let limit = envelope.payload.get("limit").and_then(Value::as_u64).map(|l| l as usize);
    let entries = broker.log.by_recipient(&name, since_ms, limit);
    let messages: Vec<Value> = entries
        .iter()
        .map(|e| {
            serde_json::json!({
                "envelopeId": e.envelope_id,
                "from": e.from,
                "body": e.body,
                "tsMs": e.ts_ms,
                "status": format!("{:?}", e.status),
            })
        })
        .collect();
    Envelope::new(EnvelopeKind::InboxResponse).with_payload(serde_json::json!({ "messages": messages }))
}

/// LIST_AGENTS / LIST_AGENTS_RESPONSE: the registry's active roster.
fn handle_list_agents(broker: &Broker) -> Envelope {
    let agents: Vec<Value> = broker
        .registry
        .active_names()
        .into_iter()
        .filter_map(|name| broker.registry.get(&name))
        .map(|r| {
            serde_json::json!({
                "name": r.name,
                "cli": r.cli,
                "team": r.team,
                "lastSeenMs": r.last_seen_ms,
            })
        })
        .collect();
    Envelope::new(EnvelopeKind::ListAgentsResponse).with_payload(serde_json::json!({ "agents": agents }))
}

/// SPAWN: wraps a new CLI in a PTY under the broker's supervision. Payload
/// shape: `{"name", "cli", "args": [...], "cwd", "env": {...}}`.
fn handle_spawn(broker: &Broker, envelope: &Envelope) -> Envelope {
    let correlation_id = correlation_id_of(envelope);
    let Some(name) = envelope.payload.get("name").and_then(Value::as_str) else {
        return Envelope::nack(&correlation_id, "BAD_REQUEST", "SPAWN missing 'name'");
    };
    let Some(cli) = envelope.payload.get("cli").and_then(Value::as_str) else {
        return Envelope::nack(&correlation_id, "BAD_REQUEST", "SPAWN missing 'cli'");
    };
    let args: Vec<String> = envelope
        .payload
        .get("args")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let cwd = envelope
        .payload
        .get("cwd")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let env: HashMap<String, String> = envelope
        .payload
        .get("env")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    match broker.spawn_pty(name, cli, &args, &cwd, &env) {
        Ok(_) => Envelope::new(EnvelopeKind::Ack)
            .with_payload(serde_json::json!({"correlationId": correlation_id, "agent": name})),
        Err(err) => Envelope::nack(&correlation_id, "INTERNAL", err.to_string()),
    }
}

/// RELEASE: tears down a PTY-wrapped agent spawned via SPAWN.
fn handle_release(broker: &Broker, envelope: &Envelope) -> Envelope {
    let correlation_id = correlation_id_of(envelope);
    let Some(name) = envelope.payload.get("name").and_then(Value::as_str) else {
        return Envelope::nack(&correlation_id, "BAD_REQUEST", "RELEASE missing 'name'");
    };
    broker.release_pty(name);
    Envelope::new(EnvelopeKind::Ack).with_payload(serde_json::json!({"correlationId": correlation_id, "agent": name}))
}

fn correlation_id_of(envelope: &Envelope) -> String {
    envelope
        .payload
        .get("sync")
        .and_then(|s| s.get("correlationId"))
        .and_then(Value::as_str)
        .unwrap_or(&envelope.id)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::connection::{EntityKind, Transport};
    use tokio::sync::mpsc;

    fn test_conn() -> (Arc<Connection>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Connection::new(Transport::Local, EntityKind::Agent, tx)), rx)
    }

    #[tokio::test]
    async fn hello_registers_agent_and_activates_connection() {
        let broker = Broker::new(Config::for_test());
        let (conn, _rx) = test_conn();
        let hello = Envelope::new(EnvelopeKind::Hello).with_payload(serde_json::json!({"agent": "alice"}));
        let (welcome, replay) = handle_hello(&broker, &conn, hello).await.unwrap();
        assert_eq!(welcome.kind, EnvelopeKind::Welcome);
        assert!(replay.is_empty());
        assert!(conn.is_active());
        assert_eq!(broker.registry.connection_id_of("alice"), Some(conn.id.clone()));
    }

    #[tokio::test]
    async fn hello_rejects_reserved_name() {
        let broker = Broker::new(Config::for_test());
        let (conn, _rx) = test_conn();
        let hello = Envelope::new(EnvelopeKind::Hello).with_payload(serde_json::json!({"agent": "system"}));
        let err = handle_hello(&broker, &conn, hello).await.unwrap_err();
        assert_eq!(err.kind.code(), "BAD_REQUEST");
    }

    #[tokio::test]
    async fn hello_with_unknown_resume_token_is_resume_too_old() {
        let broker = Broker::new(Config::for_test());
        let (conn, _rx) = test_conn();
        let hello = Envelope::new(EnvelopeKind::Hello)
            .with_payload(serde_json::json!({"agent": "alice", "session": {"resumeToken": "nope"}}));
        let err = handle_hello(&broker, &conn, hello).await.unwrap_err();
        assert_eq!(err.kind.code(), "RESUME_TOO_OLD");
    }

    #[tokio::test]
    async fn hello_with_resume_token_replays_envelopes_past_the_high_water_mark() {
        use crate::message_log::DeliveryStatus;

        let broker = Broker::new(Config::for_test());
        for seq in 1..=3u64 {
            broker.log.append(MessageLogEntry {
                envelope_id: format!("d{seq}"),
                ts_ms: seq,
                from: Some("alice".to_string()),
                to: "bob".to_string(),
                kind: "Deliver".to_string(),
                body: format!("msg{seq}"),
                thread_id: None,
                topic: Some("default".to_string()),
                is_broadcast: false,
                status: DeliveryStatus::Delivered,
                seq: Some(seq),
            });
        }
        let mut high_water = HashMap::new();
        high_water.insert(("default".to_string(), "alice".to_string()), 1u64);
        broker.log.put_session(
            "resume-token-1",
            ResumeRecord {
                session_id: "sess-1".to_string(),
                agent_name: "bob".to_string(),
                high_water,
            },
        );

        let (conn, _rx) = test_conn();
        let hello = Envelope::new(EnvelopeKind::Hello)
            .with_payload(serde_json::json!({"agent": "bob", "session": {"resumeToken": "resume-token-1"}}));
        let (welcome, replay) = handle_hello(&broker, &conn, hello).await.unwrap();
        assert_eq!(welcome.payload["resumed"], true);
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].seq, Some(2));
        assert_eq!(replay[1].seq, Some(3));
        assert_eq!(replay[0].to.as_deref(), Some("bob"));

        // The replay folds into the new resume record, so a second resume
        // with no traffic in between must not replay the same envelopes again.
        let second_record = broker.log.by_resume_token(&welcome.payload["resumeToken"].as_str().unwrap().to_string()).unwrap();
        assert_eq!(second_record.high_water.get(&("default".to_string(), "alice".to_string())), Some(&3u64));
    }

    #[tokio::test]
    async fn ping_replies_with_pong() {
        let broker = Broker::new(Config::for_test());
        let (conn, _rx) = test_conn();
        conn.set_state(ConnectionState::Active);
        let reply = dispatch(&broker, &conn, Envelope::new(EnvelopeKind::Ping)).await;
        assert_eq!(reply.unwrap().kind, EnvelopeKind::Pong);
    }

    #[tokio::test]
    async fn pong_records_heartbeat_without_a_reply() {
        let broker = Broker::new(Config::for_test());
        let (conn, _rx) = test_conn();
        let reply = dispatch(&broker, &conn, Envelope::new(EnvelopeKind::Pong)).await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn list_agents_reports_active_roster() {
        let broker = Broker::new(Config::for_test());
        let (conn, _rx) = test_conn();
        let hello = Envelope::new(EnvelopeKind::Hello).with_payload(serde_json::json!({"agent": "alice"}));
        handle_hello(&broker, &conn, hello).await.unwrap();

        let reply = dispatch(&broker, &conn, Envelope::new(EnvelopeKind::ListAgents)).await.unwrap();
        assert_eq!(reply.kind, EnvelopeKind::ListAgentsResponse);
        assert_eq!(reply.payload["agents"][0]["name"], "alice");
    }

    #[tokio::test]
    async fn unknown_recipient_blocking_send_becomes_error_reply() {
        let broker = Broker::new(Config::for_test());
        let (conn, _rx) = test_conn();
        let hello = Envelope::new(EnvelopeKind::Hello).with_payload(serde_json::json!({"agent": "alice"}));
        handle_hello(&broker, &conn, hello).await.unwrap();

        let send = Envelope::new(EnvelopeKind::Send).with_to("ghost").with_payload(serde_json::json!({
            "body": "hi",
            "sync": {"blocking": true, "correlationId": "c1"},
        }));
        let reply = dispatch(&broker, &conn, send).await.unwrap();
        assert_eq!(reply.kind, EnvelopeKind::Error);
        assert_eq!(reply.payload["code"], "UNKNOWN_RECIPIENT");
    }
}
