//! Optional listening WebSocket transport (§6): one envelope per text
//! message, gated by the workspace token via `?token=` or an `Authorization:
//! Bearer` header when a token is configured.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::broker::Broker;
use crate::connection::{Connection, ConnectionState, EntityKind, Transport};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::RelayError;
use crate::protocol;
use crate::supervisor::Supervisor;

/// Handle to the running accept loop.
pub struct WsServer {
    accept_handle: tokio::task::JoinHandle<()>,
}

impl WsServer {
    pub async fn start(broker: Arc<Broker>, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.with_context(|| format!("binding ws listener on {addr}"))?;
        log::info!("websocket listener on {addr}");
        let accept_handle = tokio::spawn(accept_loop(listener, broker));
        Ok(Self { accept_handle })
    }

    pub fn shutdown(self) {
        self.accept_handle.abort();
    }
}

async fn accept_loop(listener: TcpListener, broker: Arc<Broker>) {
    let mut shutdown_rx = broker.supervisor.subscribe_shutdown();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let broker = Arc::clone(&broker);
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(broker, stream, addr).await {
                                log::debug!("websocket connection from {addr} ended: {err}");
                            }
                        });
                    }
                    Err(err) => log::error!("ws accept error: {err}"),
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}

/// Validates the workspace token during the WS upgrade, before any envelope
/// is exchanged, rather than after HELLO.
fn check_token(expected: &str, request: &Request) -> Result<(), ErrorResponse> {
    if expected.is_empty() {
        return Ok(());
    }
    let from_query = request
        .uri()
        .query()
        .and_then(|q| q.split('&').find_map(|kv| kv.strip_prefix("token=")));
    let from_header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if from_query == Some(expected) || from_header == Some(expected) {
        Ok(())
    } else {
        let mut response = Response::new(None);
        *response.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::UNAUTHORIZED;
        Err(response)
    }
}

async fn handle_connection(broker: Arc<Broker>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
    let expected_token = broker.config.workspace_token.clone();
    let ws = tokio_tungstenite::accept_hdr_async(stream, move |request: &Request, response: Response| {
        check_token(&expected_token, request).map(|()| response)
    })
    .await
    .context("websocket upgrade failed")?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let conn = Arc::new(Connection::new(Transport::WebSocket, EntityKind::Agent, outbound_tx));
    {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        conn.meta.lock().unwrap().peer_addr = Some(addr);
    }

    let Ok(Some(Ok(Message::Text(first)))) = tokio::time::timeout(protocol::HELLO_DEADLINE, ws_rx.next()).await else {
        return Ok(());
    };
    let hello = Envelope::from_json(first.as_bytes()).context("malformed HELLO")?;
    match protocol::handle_hello(&broker, &conn, hello).await {
        Ok((welcome, replay)) => {
            conn.send(&welcome)?;
            for deliver in replay {
                conn.send(&deliver)?;
            }
        }
        Err(err) => {
            let json = err.to_envelope().to_json()?;
            let _ = ws_tx.send(Message::Text(String::from_utf8(json)?)).await;
            return Ok(());
        }
    }

    if let Some(name) = conn.agent_name() {
        let _ = broker.router.route(&conn, Supervisor::agent_ready(&name)).await;
    }

    let mut heartbeat = tokio::time::interval(Duration::from_millis(broker.config.heartbeat_ms));
    heartbeat.tick().await; // first tick fires immediately; skip it

    'session: loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                let Some(bytes) = outgoing else { break 'session };
                let Ok(text) = String::from_utf8(bytes) else { continue };
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break 'session;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(envelope) = Envelope::from_json(text.as_bytes()) else { continue };
                        if let Some(reply) = protocol::dispatch(&broker, &conn, envelope).await {
                            let _ = conn.send(&reply);
                        }
                        if conn.state() == ConnectionState::Closing {
                            break 'session;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break 'session,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        log::debug!("websocket read error: {err}");
                        break 'session;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if conn.is_heartbeat_expired(broker.config.heartbeat_ms, broker.config.heartbeat_multiplier as u32) {
                    let reply = RelayError::heartbeat_timeout().to_envelope();
                    let _ = conn.send(&reply);
                    break 'session;
                }
                let _ = conn.send(&Envelope::new(EnvelopeKind::Ping));
            }
        }
    }

    if let Some(name) = conn.agent_name() {
        broker.registry.unregister(&name, &conn.id);
        let _ = broker.router.route(&conn, Supervisor::agent_left(&name)).await;
    }
    broker.router.detach_connection(&conn.id);
    Ok(())
}
