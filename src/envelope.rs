//! The envelope: the one thing ever sent on any transport.
//!
//! An [`Envelope`] is immutable once constructed. Every field beyond `kind`
//! and `id` is optional because most envelope kinds only need a handful of
//! them; the wire encoding stays flat JSON rather than an externally-tagged
//! enum so that unknown future fields round-trip untouched through brokers
//! running slightly different versions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Current protocol version understood by this broker.
pub const PROTOCOL_VERSION: u32 = 1;

/// One of the wire-level envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    Hello,
    Welcome,
    Send,
    Deliver,
    Ack,
    Nack,
    Ping,
    Pong,
    Subscribe,
    Unsubscribe,
    ChannelJoin,
    ChannelLeave,
    ChannelMessage,
    Spawn,
    Release,
    Status,
    StatusResponse,
    Inbox,
    InboxResponse,
    ListAgents,
    ListAgentsResponse,
    Error,
    Bye,
    Log,
}

impl EnvelopeKind {
    /// Envelope kinds accepted while a connection is still HANDSHAKING.
    #[must_use]
    pub fn allowed_while_handshaking(self) -> bool {
        matches!(self, Self::Hello)
    }

    /// Whether this kind carries addressed traffic and therefore a `seq`.
    #[must_use]
    pub fn is_addressed(self) -> bool {
        matches!(
            self,
            Self::Send | Self::Deliver | Self::ChannelMessage
        )
    }
}

/// The atomic unit of protocol traffic.
///
/// Construct with [`Envelope::new`] or one of the `Envelope::<kind>` helpers;
/// fields are public for pattern matching but the struct is always built
/// whole, never mutated in place once it has left the sender's Connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub id: String,
    pub ts: u64,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

fn fresh_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn now_ms() -> u64 {
    // Millisecond resolution timestamp; u64 is safe until the year 292 million.
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

impl Envelope {
    /// Builds a bare envelope of the given kind with a fresh id and timestamp.
    #[must_use]
    pub fn new(kind: EnvelopeKind) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: fresh_id(),
            ts: now_ms(),
            kind,
            from: None,
            to: None,
            topic: None,
            seq: None,
            payload: Value::Null,
        }
    }

    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    #[must_use]
    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    #[must_use]
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// The first 8 hex characters of the envelope id, used by the injector
    /// to render the short-id shown inline in injected PTY input.
    #[must_use]
    pub fn short_id(&self) -> &str {
        &self.id[..8.min(self.id.len())]
    }

    /// Convenience accessor for the common `{"body": "..."}` payload shape.
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        self.payload.get("body").and_then(Value::as_str)
    }

    /// Builds a terminal ERROR envelope.
    #[must_use]
    pub fn error(code: &str, message: impl Into<String>, fatal: bool) -> Self {
        Self::new(EnvelopeKind::Error).with_payload(serde_json::json!({
            "code": code,
            "message": message.into(),
            "fatal": fatal,
        }))
    }

    /// Builds a NACK replying to `correlation_id` with an error code.
    #[must_use]
    pub fn nack(correlation_id: &str, code: &str, message: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Nack).with_payload(serde_json::json!({
            "correlationId": correlation_id,
            "code": code,
            "message": message.into(),
        }))
    }

    /// Serializes this envelope to a single line of UTF-8 JSON (no trailing newline).
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parses an envelope from a UTF-8 JSON byte slice.
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
