//! C1 — the per-party state machine and its outgoing-message plumbing.
//!
//! A [`Connection`] is the broker's view of one attached party. The Router
//! holds connections behind `Arc<Connection>` and the registry holds only
//! names → ids (see [`crate::registry`]) — the weak-reference discipline
//! from the design notes. The transport task that owns the socket or
//! WebSocket stream is the only thing that ever drops the `Arc`'s last
//! strong owner; the Router's lookups are always by id through that
//! transport-owned lifetime.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::dedup::{DedupCache, OutboundSequencer, StreamKey, DEFAULT_DEDUP_CAPACITY};
use crate::envelope::Envelope;

/// The connection-level state machine from §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Active,
    Closing,
    Closed,
    Error,
}

/// What kind of party this Connection represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Agent,
    User,
    System,
}

/// Which transport carries this Connection's frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Local length-prefixed stream socket.
    Local,
    /// Listening or outbound WebSocket — one envelope per text message.
    WebSocket,
}

/// Static, rarely-changing identity fields set by HELLO.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
    pub agent_name: Option<String>,
    pub cli: Option<String>,
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub team: Option<String>,
    pub peer_addr: Option<SocketAddr>,
}

/// One party attached to the broker.
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub transport: Transport,
    pub kind: EntityKind,
    pub session_id: Mutex<String>,
    pub resume_token: Mutex<String>,
    pub meta: Mutex<ConnectionMeta>,
    state: Mutex<ConnectionState>,
    pub sequencer: Mutex<OutboundSequencer>,
    pub dedup: Mutex<DedupCache>,
    /// High-water `seq` per `(topic, sender)` stream actually delivered to
    /// this Connection, persisted into a `ResumeRecord` on detach so a
    /// reconnect with this session's resume token only replays what's new.
    inbound_high_water: Mutex<HashMap<StreamKey, u64>>,
    /// Raw bytes queued for the transport task to write out, in FIFO order.
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    last_pong_ms: AtomicU64,
    /// Exempts the heartbeat timer while an injection is in flight (§4.1).
    processing: AtomicBool,
}

impl Connection {
    /// Creates a fresh Connection in CONNECTING state with a new session id
    /// and resume token, wired to `outbound` for writing frames back out.
    #[must_use]
    pub fn new(transport: Transport, kind: EntityKind, outbound: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            transport,
            kind,
            session_id: Mutex::new(Uuid::new_v4().simple().to_string()),
            resume_token: Mutex::new(Uuid::new_v4().simple().to_string()),
            meta: Mutex::new(ConnectionMeta::default()),
            state: Mutex::new(ConnectionState::Connecting),
            sequencer: Mutex::new(OutboundSequencer::new()),
            dedup: Mutex::new(DedupCache::new(DEFAULT_DEDUP_CAPACITY)),
            inbound_high_water: Mutex::new(HashMap::new()),
            outbound,
            last_pong_ms: AtomicU64::new(now_ms()),
            processing: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, new_state: ConnectionState) {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let mut guard = self.state.lock().unwrap();
        *guard = new_state;
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    #[must_use]
    pub fn agent_name(&self) -> Option<String> {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.meta.lock().unwrap().agent_name.clone()
    }

    pub fn adopt_session(&self, session_id: String, resume_token: String) {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        {
            *self.session_id.lock().unwrap() = session_id;
            *self.resume_token.lock().unwrap() = resume_token;
        }
    }

    /// Marks the Connection as currently handling an injected message, which
    /// exempts its heartbeat timer from timing out (see §4.1).
    pub fn set_processing(&self, processing: bool) {
        self.processing.store(processing, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Records that `seq` was just delivered to this Connection on
    /// `(topic, from)`, so a later resume only replays what's past it.
    pub fn record_inbound(&self, topic: &str, from: &str, seq: u64) {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let mut marks = self.inbound_high_water.lock().unwrap();
        let entry = marks.entry((topic.to_string(), from.to_string())).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
    }

    /// Seeds inbound high-water marks from a resumed session's stored record.
    pub fn seed_inbound_high_water(&self, marks: HashMap<StreamKey, u64>) {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        {
            *self.inbound_high_water.lock().unwrap() = marks;
        }
    }

    /// Snapshot of inbound high-water marks, persisted into the resume
    /// record when this Connection detaches.
    #[must_use]
    pub fn inbound_high_water(&self) -> HashMap<StreamKey, u64> {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.inbound_high_water.lock().unwrap().clone()
    }

    /// Whether more than `heartbeat_ms * multiplier` has elapsed since the
    /// last observed PONG, unless the agent is currently processing.
    #[must_use]
    pub fn is_heartbeat_expired(&self, heartbeat_ms: u64, multiplier: u32) -> bool {
        if self.is_processing() {
            return false;
        }
        let elapsed = now_ms().saturating_sub(self.last_pong_ms.load(Ordering::Relaxed));
        elapsed > heartbeat_ms.saturating_mul(u64::from(multiplier))
    }

    /// Encodes and queues an envelope for the transport task to write.
    ///
    /// Local transport frames get the length prefix; WebSocket frames are
    /// sent as-is, one per text message, per §4.1/§6.
    pub fn send(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let json = envelope.to_json()?;
        let frame = match self.transport {
            Transport::Local => crate::framing::encode_frame(&json),
            Transport::WebSocket => json,
        };
        self.outbound
            .send(frame)
            .map_err(|_| anyhow::anyhow!("connection {} outbound channel closed", self.id))?;
        Ok(())
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
