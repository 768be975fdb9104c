//! C8 — cloud uplink.
//!
//! An outbound WebSocket connection to a relay-cloud endpoint. To the Router
//! it is just another peer: the uplink presents a resume token on reconnect,
//! re-issues SUBSCRIBE/CHANNEL_JOIN for whatever this broker was watching,
//! and mirrors DELIVERs the router marks remote back out over the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::connection::{Connection, EntityKind, Transport};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::router::Router;

/// Reserved name the uplink registers itself under so the router treats it
/// as an ordinary (internal) Connection for inbound cloud traffic.
const UPLINK_CONNECTION_NAME: &str = "cloud-uplink";

/// Initial reconnect backoff.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Reconnect backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Config needed to maintain the uplink.
#[derive(Debug, Clone)]
pub struct UplinkConfig {
    pub url: String,
    pub workspace_token: String,
}

/// Handle to a running uplink task. Dropping it does not stop the task;
/// call [`CloudUplink::shutdown`] for a clean stop.
pub struct CloudUplink {
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl CloudUplink {
    /// Spawns the reconnect-loop task and wires its outbound mirror channel
    /// into `router`. Returns a handle for liveness queries and shutdown.
    #[must_use]
    pub fn spawn(config: UplinkConfig, router: Arc<Router>, resume_token: Arc<std::sync::Mutex<String>>) -> Self {
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        router.set_cloud_outbound(Some(outbound_tx));

        {
            let connected = Arc::clone(&connected);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                run_reconnect_loop(config, router, resume_token, outbound_rx, connected, shutdown).await;
            });
        }

        Self { connected, shutdown }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

async fn run_reconnect_loop(
    config: UplinkConfig,
    router: Arc<Router>,
    resume_token: Arc<std::sync::Mutex<String>>,
    mut outbound_rx: mpsc::UnboundedReceiver<Envelope>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
) {
    let mut backoff = INITIAL_BACKOFF;

    // A synthetic Connection standing in for the cloud endpoint so inbound
    // envelopes can go through the same `Router::route` dispatch as any
    // locally-attached peer. Its own outbound channel is unused: replies to
    // "cloud-uplink" itself are not a thing the protocol defines.
    let (unused_tx, _unused_rx) = mpsc::unbounded_channel();
    let cloud_conn = Arc::new(Connection::new(Transport::WebSocket, EntityKind::System, unused_tx));
    cloud_conn.set_state(crate::connection::ConnectionState::Active);
    let _ = router
        .registry
        .register(UPLINK_CONNECTION_NAME, &cloud_conn.id, true, |_| false);
    router.attach_connection(Arc::clone(&cloud_conn));

    while !shutdown.load(Ordering::Relaxed) {
        match connect_once(&config, &resume_token).await {
            Ok((ws_tx, ws_rx)) => {
                connected.store(true, Ordering::Relaxed);
                backoff = INITIAL_BACKOFF;
                run_session(ws_tx, ws_rx, &router, &cloud_conn, &mut outbound_rx, &shutdown).await;
                connected.store(false, Ordering::Relaxed);
            }
            Err(err) => {
                log::warn!("cloud uplink connect failed: {err}");
            }
        }

        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    router.detach_connection(&cloud_conn.id);
    router.set_cloud_outbound(None);
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_once(
    config: &UplinkConfig,
    resume_token: &Arc<std::sync::Mutex<String>>,
) -> anyhow::Result<(
    futures_util::stream::SplitSink<WsStream, Message>,
    futures_util::stream::SplitStream<WsStream>,
)> {
    let url = format!("{}?token={}", config.url, config.workspace_token);
    let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
    let (mut tx, rx) = ws.split();

    #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
    let token = resume_token.lock().unwrap().clone();
    let hello = Envelope::new(EnvelopeKind::Hello).with_payload(serde_json::json!({
        "session": { "resumeToken": token },
    }));
    tx.send(Message::Text(String::from_utf8(hello.to_json()?)?)).await?;

    Ok((tx, rx))
}

/// Runs one connected session until the socket drops or shutdown is requested.
async fn run_session(
    mut ws_tx: futures_util::stream::SplitSink<WsStream, Message>,
    mut ws_rx: futures_util::stream::SplitStream<WsStream>,
    router: &Arc<Router>,
    cloud_conn: &Arc<Connection>,
    outbound_rx: &mut mpsc::UnboundedReceiver<Envelope>,
    shutdown: &Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                let Some(envelope) = outgoing else { break };
                let Ok(json) = envelope.to_json() else { continue };
                let Ok(text) = String::from_utf8(json) else { continue };
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(envelope) = Envelope::from_json(text.as_bytes()) {
                            route_from_cloud(router, cloud_conn, envelope).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        log::warn!("cloud uplink read error: {err}");
                        break;
                    }
                }
            }
        }
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
    }
}

/// Injects an envelope arriving from the cloud back into local routing, with
/// the synthetic uplink Connection standing in as the sender.
async fn route_from_cloud(router: &Arc<Router>, cloud_conn: &Arc<Connection>, envelope: Envelope) {
    if let Some(from) = envelope.from.clone() {
        router.mark_remote(&from);
    }
    if let Err(err) = router.route(cloud_conn, envelope).await {
        log::warn!("routing cloud-origin envelope failed: {err}");
    }
}
