//! C7 — router & channel fabric.
//!
//! The central dispatch. `Router::route` is the only place addressing rules
//! (direct, broadcast, channel, topic) are decided; everything upstream just
//! hands it a sender and an envelope, and everything downstream is either a
//! transport write, an injection enqueue, or a cloud-bound mirror.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::channel::{canonical_dm_name, is_channel_name, ChannelRegistry, TopicRegistry};
use crate::connection::Connection;
use crate::dedup::DEFAULT_TOPIC;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::RelayError;
use crate::injection::{InjectionOutcome, InjectionQueue};
use crate::message_log::{DeliveryStatus, MessageLog, MessageLogEntry, ResumeRecord};
use crate::registry::Registry;

/// Correlation record for a synchronous (blocking) SEND (§3, §4.7).
#[derive(Debug, Clone)]
struct PendingAck {
    sender_connection_id: String,
    deadline: Instant,
}

/// Central dispatcher owning the shared routing state.
pub struct Router {
    pub registry: Arc<Registry>,
    pub channels: Arc<ChannelRegistry>,
    pub topics: Arc<TopicRegistry>,
    pub log: Arc<MessageLog>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    injection_queues: Mutex<HashMap<String, InjectionQueue>>,
    pending_acks: Mutex<HashMap<String, PendingAck>>,
    remote_routes: Mutex<std::collections::HashSet<String>>,
    cloud_outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    self_send_visible_in_inbox: bool,
}

impl Router {
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        channels: Arc<ChannelRegistry>,
        topics: Arc<TopicRegistry>,
        log: Arc<MessageLog>,
        self_send_visible_in_inbox: bool,
    ) -> Self {
        Self {
            registry,
            channels,
            topics,
            log,
            connections: Mutex::new(HashMap::new()),
            injection_queues: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            remote_routes: Mutex::new(std::collections::HashSet::new()),
            cloud_outbound: Mutex::new(None),
            self_send_visible_in_inbox,
        }
    }

    /// Registers a live Connection so the router can hand it DELIVERs directly.
    pub fn attach_connection(&self, conn: Arc<Connection>) {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.connections.lock().unwrap().insert(conn.id.clone(), conn);
    }

    /// Drops a Connection from the live routing table and, if it had
    /// registered an agent name, persists its inbound high-water marks so a
    /// later HELLO presenting its resume token only replays what's new.
    pub fn detach_connection(&self, connection_id: &str) {
        let removed = {
            #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
            self.connections.lock().unwrap().remove(connection_id)
        };
        let Some(conn) = removed else { return };
        let Some(agent_name) = conn.agent_name() else { return };
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let resume_token = conn.resume_token.lock().unwrap().clone();
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let session_id = conn.session_id.lock().unwrap().clone();
        self.log.put_session(
            &resume_token,
            ResumeRecord {
                session_id,
                agent_name,
                high_water: conn.inbound_high_water(),
            },
        );
    }

    /// Registers the injection queue backing a PTY-wrapped agent's stdin.
    pub fn attach_injection_queue(&self, agent_name: &str, queue: InjectionQueue) {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.injection_queues
            .lock()
            .unwrap()
            .insert(agent_name.to_string(), queue);
    }

    pub fn detach_injection_queue(&self, agent_name: &str) {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.injection_queues.lock().unwrap().remove(agent_name);
    }

    /// Marks `name` as routed through the cloud uplink rather than locally.
    pub fn mark_remote(&self, name: &str) {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.remote_routes.lock().unwrap().insert(name.to_string());
    }

    #[must_use]
    fn is_remote(&self, name: &str) -> bool {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.remote_routes.lock().unwrap().contains(name)
    }

    /// Wires the channel the cloud uplink drains to mirror locally-committed
    /// DELIVERs outward (§4.8.1). `None` disables mirroring (uplink down).
    pub fn set_cloud_outbound(&self, sender: Option<mpsc::UnboundedSender<Envelope>>) {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        {
            *self.cloud_outbound.lock().unwrap() = sender;
        }
    }

    fn connection_by_name(&self, name: &str) -> Option<Arc<Connection>> {
        let id = self.registry.connection_id_of(name)?;
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.connections.lock().unwrap().get(&id).cloned()
    }

    /// Looks up a live Connection by its own id, for replies (e.g. an ACK
    /// routed back to a blocking SEND's sender) that don't go through the
    /// name-based addressing rules in [`Router::route`].
    #[must_use]
    pub fn connection_by_id(&self, connection_id: &str) -> Option<Arc<Connection>> {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.connections.lock().unwrap().get(connection_id).cloned()
    }

    fn is_pty_wrapped(&self, name: &str) -> bool {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.injection_queues.lock().unwrap().contains_key(name)
    }

    /// Central dispatch, implementing §4.7's addressing rules.
    pub async fn route(&self, sender: &Connection, envelope: Envelope) -> Result<(), RelayError> {
        match envelope.kind {
            EnvelopeKind::Subscribe => {
                if let Some(topic) = &envelope.topic {
                    self.topics.subscribe(topic, &sender.id);
                }
                return Ok(());
            }
            EnvelopeKind::Unsubscribe => {
                if let Some(topic) = &envelope.topic {
                    self.topics.unsubscribe(topic, &sender.id);
                }
                return Ok(());
            }
            EnvelopeKind::ChannelJoin => {
                if let Some(ref channel) = envelope.to {
                    let agent = sender.agent_name().unwrap_or_default();
                    self.channels.join(channel, &agent);
                    self.log.append(membership_entry(channel, &agent, "CHANNEL_JOIN"));
                }
                return Ok(());
            }
            EnvelopeKind::ChannelLeave => {
                if let Some(ref channel) = envelope.to {
                    let agent = sender.agent_name().unwrap_or_default();
                    self.channels.leave(channel, &agent);
                    self.log.append(membership_entry(channel, &agent, "CHANNEL_LEAVE"));
                }
                return Ok(());
            }
            _ => {}
        }

        let Some(to) = envelope.to.clone() else {
            return Ok(());
        };

        let sender_name = sender.agent_name().unwrap_or_default();
        let blocking = envelope
            .payload
            .get("sync")
            .and_then(|s| s.get("blocking"))
            .and_then(|b| b.as_bool())
            .unwrap_or(false);

        if blocking {
            if let Some(correlation_id) = envelope
                .payload
                .get("sync")
                .and_then(|s| s.get("correlationId"))
                .and_then(|c| c.as_str())
            {
                let timeout_ms = envelope
                    .payload
                    .get("sync")
                    .and_then(|s| s.get("timeoutMs"))
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(30_000);
                #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
                self.pending_acks.lock().unwrap().insert(
                    correlation_id.to_string(),
                    PendingAck {
                        sender_connection_id: sender.id.clone(),
                        deadline: Instant::now() + Duration::from_millis(timeout_ms),
                    },
                );
            }
        }

        if to == "*" {
            for member in self.registry.active_names() {
                if member == sender_name {
                    continue;
                }
                self.deliver_one(sender, &member, &envelope).await;
            }
            return Ok(());
        }

        if is_channel_name(&to) {
            for member in self.channels.members(&to) {
                self.deliver_one(sender, &member, &envelope).await;
            }
            // Canonical DM form also logs individual direct entries for both
            // participants so inbox queries by either return it (§4.7).
            if let Some((a, b)) = parse_dm_pair(&to) {
                self.log.append(direct_mirror_entry(&a, &sender_name, &envelope));
                self.log.append(direct_mirror_entry(&b, &sender_name, &envelope));
            }
            return Ok(());
        }

        if self.is_remote(&to) {
            #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
            let outbound = self.cloud_outbound.lock().unwrap().clone();
            if let Some(outbound) = outbound {
                let _ = outbound.send(envelope.clone());
                self.log.append(log_entry_for(&to, &sender_name, &envelope, DeliveryStatus::Delivered));
                return Ok(());
            }
        }

        if self.registry.contains(&to) {
            self.deliver_one(sender, &to, &envelope).await;
            Ok(())
        } else if blocking {
            Err(RelayError::unknown_recipient(&to))
        } else {
            // Fire-and-forget to an absent name: log for later replay.
            self.log
                .append(log_entry_for(&to, &sender_name, &envelope, DeliveryStatus::Pending));
            Ok(())
        }
    }

    /// Routes one DELIVER to a single named recipient, either by injection
    /// (PTY-wrapped) or direct transport write, logging before the attempt.
    async fn deliver_one(&self, sender: &Connection, recipient: &str, original: &Envelope) {
        let sender_name = sender.agent_name().unwrap_or_default();
        if recipient == sender_name && !self.self_send_visible_in_inbox && original.kind == EnvelopeKind::Send {
            return;
        }

        let topic = original.topic.clone().unwrap_or_else(|| DEFAULT_TOPIC.to_string());
        let seq = {
            #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
            sender.sequencer.lock().unwrap().next(&topic, recipient)
        };

        let deliver = Envelope::new(EnvelopeKind::Deliver)
            .with_from(sender_name.clone())
            .with_to(recipient)
            .with_topic(topic)
            .with_seq(seq)
            .with_payload(original.payload.clone());

        self.log
            .append(log_entry_for(recipient, &sender_name, &deliver, DeliveryStatus::Pending));

        if let Some(conn) = self.connection_by_name(recipient) {
            if conn.is_active() {
                // Dedup keys off the *original* envelope's id, shared across
                // every recipient's copy and stable across retransmits of the
                // same SEND — the freshly-minted DELIVER id below only needs
                // to be distinct on the wire, not for replay detection.
                if conn
                    .dedup
                    .lock()
                    .map(|mut d| d.check_and_insert(&original.id))
                    .unwrap_or(false)
                {
                    return;
                }
                conn.record_inbound(&deliver.topic.clone().unwrap_or_default(), &sender_name, seq);
                if self.is_pty_wrapped(recipient) {
                    self.inject(recipient, deliver.clone()).await;
                } else {
                    let _ = conn.send(&deliver);
                    self.log.mark_status(&deliver.id, DeliveryStatus::Delivered);
                }
                return;
            }
        }

        // No live ACTIVE connection: the entry already logged above serves
        // as the queued-for-replay record.
    }

    async fn inject(&self, recipient: &str, envelope: Envelope) {
        let queue = {
            #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
            self.injection_queues.lock().unwrap().get(recipient).cloned()
        };
        let Some(queue) = queue else { return };
        let deadline = Instant::now() + crate::injection::DEFAULT_INJECTION_DEADLINE;
        let envelope_id = envelope.id.clone();
        match queue.enqueue(envelope, deadline).await {
            InjectionOutcome::Delivered => {
                self.log.mark_status(&envelope_id, DeliveryStatus::Delivered);
            }
            InjectionOutcome::TimedOut => {
                self.log.mark_status(&envelope_id, DeliveryStatus::Failed);
            }
        }
    }

    /// Resolves a PendingAck whose correlation id matches an observed ACK,
    /// forwarding the ACK to the original blocking sender.
    pub fn resolve_pending_ack(&self, correlation_id: &str) -> Option<String> {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.pending_acks
            .lock()
            .unwrap()
            .remove(correlation_id)
            .map(|p| p.sender_connection_id)
    }

    /// Removes and returns every PendingAck whose deadline has passed,
    /// driven by the C9 sweeper on a 100ms cadence.
    pub fn sweep_expired_acks(&self) -> Vec<String> {
        let now = Instant::now();
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let mut pending = self.pending_acks.lock().unwrap();
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            pending.remove(id);
        }
        expired
    }
}

fn parse_dm_pair(channel: &str) -> Option<(String, String)> {
    let rest = channel.strip_prefix("dm:")?;
    let mut parts = rest.splitn(2, ':');
    let a = parts.next()?.to_string();
    let b = parts.next()?.to_string();
    Some((a, b))
}

fn log_entry_for(to: &str, from: &str, envelope: &Envelope, status: DeliveryStatus) -> MessageLogEntry {
    MessageLogEntry {
        envelope_id: envelope.id.clone(),
        ts_ms: envelope.ts,
        from: Some(from.to_string()),
        to: to.to_string(),
        kind: format!("{:?}", envelope.kind),
        body: envelope.body().unwrap_or_default().to_string(),
        thread_id: envelope
            .payload
            .get("threadId")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        topic: envelope.topic.clone(),
        is_broadcast: envelope.to.as_deref() == Some("*"),
        status,
        seq: envelope.seq,
    }
}

fn direct_mirror_entry(to: &str, from: &str, envelope: &Envelope) -> MessageLogEntry {
    log_entry_for(to, from, envelope, DeliveryStatus::Delivered)
}

fn membership_entry(channel: &str, agent: &str, kind: &str) -> MessageLogEntry {
    MessageLogEntry {
        envelope_id: uuid::Uuid::new_v4().simple().to_string(),
        ts_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
        from: Some(agent.to_string()),
        to: channel.to_string(),
        kind: kind.to_string(),
        body: String::new(),
        thread_id: None,
        topic: None,
        is_broadcast: false,
        status: DeliveryStatus::Delivered,
        seq: None,
    }
}

#[must_use]
pub fn canonical_dm(a: &str, b: &str) -> String {
    canonical_dm_name(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{EntityKind, Transport};
    use tokio::sync::mpsc as tmpsc;

    fn router() -> Router {
        Router::new(
            Arc::new(Registry::new()),
            Arc::new(ChannelRegistry::new()),
            Arc::new(TopicRegistry::new()),
            Arc::new(MessageLog::default()),
            true,
        )
    }

    fn router_hiding_self_sends() -> Router {
        Router::new(
            Arc::new(Registry::new()),
            Arc::new(ChannelRegistry::new()),
            Arc::new(TopicRegistry::new()),
            Arc::new(MessageLog::default()),
            false,
        )
    }

    fn connection(name: &str, router: &Router) -> (Arc<Connection>, tmpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = tmpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(Transport::Local, EntityKind::Agent, tx));
        conn.set_state(crate::connection::ConnectionState::Active);
        {
            #[allow(unwrap_used)]
            let mut meta = conn.meta.lock().unwrap();
            meta.agent_name = Some(name.to_string());
        }
        router
            .registry
            .register(name, &conn.id, false, |_| false)
            .unwrap();
        router.attach_connection(Arc::clone(&conn));
        (conn, rx)
    }

    #[tokio::test]
    async fn direct_message_both_parties_connected() {
        let router = router();
        let (alice, _a_rx) = connection("alice", &router);
        let (_bob, mut b_rx) = connection("bob", &router);

        let send = Envelope::new(EnvelopeKind::Send)
            .with_to("bob")
            .with_payload(serde_json::json!({"body": "hi"}));
        router.route(&alice, send).await.unwrap();

        let frame = b_rx.try_recv().expect("bob should receive a DELIVER");
        let json_start = 4; // length-prefixed local transport
        let deliver = Envelope::from_json(&frame[json_start..]).unwrap();
        assert_eq!(deliver.kind, EnvelopeKind::Deliver);
        assert_eq!(deliver.from.as_deref(), Some("alice"));
        assert_eq!(deliver.body(), Some("hi"));
    }

    #[tokio::test]
    async fn broadcast_excludes_sender_and_uses_distinct_ids() {
        let router = router();
        let (alice, mut a_rx) = connection("alice", &router);
        let (_bob, mut b_rx) = connection("bob", &router);
        let (_carol, mut c_rx) = connection("carol", &router);

        let send = Envelope::new(EnvelopeKind::Send)
            .with_to("*")
            .with_payload(serde_json::json!({"body": "ping"}));
        router.route(&alice, send).await.unwrap();

        assert!(a_rx.try_recv().is_err());
        let b_frame = b_rx.try_recv().unwrap();
        let c_frame = c_rx.try_recv().unwrap();
        let b_env = Envelope::from_json(&b_frame[4..]).unwrap();
        let c_env = Envelope::from_json(&c_frame[4..]).unwrap();
        assert_ne!(b_env.id, c_env.id);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_deduped_by_id() {
        let router = router();
        let (alice, _a_rx) = connection("alice", &router);
        let (_bob, mut b_rx) = connection("bob", &router);

        let send = Envelope::new(EnvelopeKind::Send)
            .with_to("bob")
            .with_payload(serde_json::json!({"body": "x"}));
        // A retransmitted SEND keeps its original id; bob must only see one DELIVER.
        router.route(&alice, send.clone()).await.unwrap();
        assert!(b_rx.try_recv().is_ok());
        router.route(&alice, send).await.unwrap();
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn self_addressed_send_is_hidden_when_self_send_visibility_is_off() {
        let router = router_hiding_self_sends();
        let (alice, mut a_rx) = connection("alice", &router);

        let send = Envelope::new(EnvelopeKind::Send)
            .with_to("alice")
            .with_payload(serde_json::json!({"body": "note to self"}));
        router.route(&alice, send).await.unwrap();
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn self_addressed_channel_message_still_delivers_when_self_send_visibility_is_off() {
        let router = router_hiding_self_sends();
        let (alice, mut a_rx) = connection("alice", &router);
        router.channels.join("#general", "alice");

        let msg = Envelope::new(EnvelopeKind::ChannelMessage)
            .with_to("#general")
            .with_payload(serde_json::json!({"body": "hi all"}));
        router.route(&alice, msg).await.unwrap();
        assert!(a_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn delivery_records_the_recipients_inbound_high_water_mark() {
        let router = router();
        let (alice, _a_rx) = connection("alice", &router);
        let (bob, mut b_rx) = connection("bob", &router);

        for _ in 0..3 {
            let send = Envelope::new(EnvelopeKind::Send)
                .with_to("bob")
                .with_payload(serde_json::json!({"body": "x"}));
            router.route(&alice, send).await.unwrap();
        }
        while b_rx.try_recv().is_ok() {}
        let marks = bob.inbound_high_water();
        assert_eq!(marks.get(&("default".to_string(), "alice".to_string())), Some(&3));
    }

    #[tokio::test]
    async fn detach_connection_persists_inbound_high_water_into_the_resume_record() {
        let router = router();
        let (alice, _a_rx) = connection("alice", &router);
        let (bob, mut b_rx) = connection("bob", &router);
        #[allow(unwrap_used)]
        let bob_token = bob.resume_token.lock().unwrap().clone();

        let send = Envelope::new(EnvelopeKind::Send)
            .with_to("bob")
            .with_payload(serde_json::json!({"body": "x"}));
        router.route(&alice, send).await.unwrap();
        let _ = b_rx.try_recv();

        router.detach_connection(&bob.id);
        let record = router.log.by_resume_token(&bob_token).unwrap();
        assert_eq!(record.high_water.get(&("default".to_string(), "alice".to_string())), Some(&1));
    }

    #[tokio::test]
    async fn unknown_recipient_blocking_send_errors() {
        let router = router();
        let (alice, _a_rx) = connection("alice", &router);
        let send = Envelope::new(EnvelopeKind::Send)
            .with_to("ghost")
            .with_payload(serde_json::json!({"body": "hi", "sync": {"blocking": true, "correlationId": "c1"}}));
        let err = router.route(&alice, send).await.unwrap_err();
        assert_eq!(err.kind.code(), "UNKNOWN_RECIPIENT");
    }

    #[tokio::test]
    async fn unknown_recipient_fire_and_forget_is_queued_not_an_error() {
        let router = router();
        let (alice, _a_rx) = connection("alice", &router);
        let send = Envelope::new(EnvelopeKind::Send)
            .with_to("ghost")
            .with_payload(serde_json::json!({"body": "hi"}));
        router.route(&alice, send).await.unwrap();
        assert_eq!(router.log.by_recipient("ghost", None, None).len(), 1);
    }

    #[tokio::test]
    async fn channel_message_logs_mirror_entries_for_dm_pair() {
        let router = router();
        let (alice, _a_rx) = connection("alice", &router);
        let (_bob, mut b_rx) = connection("bob", &router);
        router.channels.join("dm:alice:bob", "alice");
        router.channels.join("dm:alice:bob", "bob");

        let msg = Envelope::new(EnvelopeKind::ChannelMessage)
            .with_to("dm:alice:bob")
            .with_payload(serde_json::json!({"body": "x"}));
        router.route(&alice, msg).await.unwrap();
        assert!(b_rx.try_recv().is_ok());
        assert_eq!(router.log.by_recipient("alice", None, None).len(), 1);
        assert_eq!(router.log.by_recipient("bob", None, None).len(), 2); // channel deliver + mirror
    }

    #[test]
    fn pending_ack_sweeper_expires_stale_correlations() {
        let router = router();
        {
            #[allow(unwrap_used)]
            let mut pending = router.pending_acks.lock().unwrap();
            pending.insert(
                "c1".to_string(),
                PendingAck {
                    sender_connection_id: "conn-1".to_string(),
                    deadline: Instant::now() - Duration::from_secs(1),
                },
            );
        }
        let expired = router.sweep_expired_acks();
        assert_eq!(expired, vec!["c1".to_string()]);
        assert!(router.sweep_expired_acks().is_empty());
    }
}
