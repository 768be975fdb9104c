//! Local stream-socket transport (§6): a length-prefixed Unix domain socket,
//! one task per connection, terminating into [`crate::protocol`]'s shared
//! handshake and dispatch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::broker::Broker;
use crate::connection::{Connection, ConnectionState, EntityKind, Transport};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::RelayError;
use crate::framing::FrameDecoder;
use crate::protocol;
use crate::supervisor::Supervisor;

/// Conservative `sun_path` limit shared across macOS (104) and Linux (108).
const MAX_SOCKET_PATH: usize = 104;

/// Handle to the running accept loop. Dropping it does not stop the task;
/// call [`SocketServer::shutdown`].
pub struct SocketServer {
    socket_path: PathBuf,
    accept_handle: tokio::task::JoinHandle<()>,
}

impl SocketServer {
    /// Binds the listener at `socket_path`, removing any stale socket file
    /// left by a prior crashed process, and spawns the accept loop.
    pub fn start(broker: Arc<Broker>, socket_path: PathBuf) -> Result<Self> {
        let path_len = socket_path.as_os_str().len();
        if path_len >= MAX_SOCKET_PATH {
            anyhow::bail!(
                "socket path too long ({path_len} bytes, max {}): {}",
                MAX_SOCKET_PATH - 1,
                socket_path.display()
            );
        }

        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = std::os::unix::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("binding socket {}", socket_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;
        log::info!("local socket listening on {}", socket_path.display());

        let path = socket_path.clone();
        let accept_handle = tokio::spawn(accept_loop(listener, broker, path));
        Ok(Self { socket_path, accept_handle })
    }

    pub fn shutdown(self) {
        self.accept_handle.abort();
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn accept_loop(listener: UnixListener, broker: Arc<Broker>, socket_path: PathBuf) {
    let mut shutdown_rx = broker.supervisor.subscribe_shutdown();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let broker = Arc::clone(&broker);
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(broker, stream).await {
                                log::debug!("local connection ended: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        if !socket_path.exists() {
                            log::info!("socket file removed, stopping accept loop");
                            break;
                        }
                        log::error!("accept error: {err}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}

/// Drives one Connection end to end: HELLO handshake, then dispatch until
/// the transport closes or a fatal error ends it.
async fn handle_connection(broker: Arc<Broker>, mut stream: UnixStream) -> Result<()> {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let conn = Arc::new(Connection::new(Transport::Local, EntityKind::Agent, outbound_tx));
    let mut decoder = FrameDecoder::new(broker.config.max_frame_bytes as u32);
    let mut buf = vec![0u8; 64 * 1024];

    let Some(first) = tokio::time::timeout(protocol::HELLO_DEADLINE, read_one_frame(&mut stream, &mut decoder, &mut buf))
        .await
        .ok()
        .flatten()
    else {
        return Ok(());
    };

    let hello = match Envelope::from_json(&first) {
        Ok(hello) => hello,
        Err(err) => {
            log::debug!("malformed HELLO: {err}");
            return Ok(());
        }
    };

    match protocol::handle_hello(&broker, &conn, hello).await {
        Ok((welcome, replay)) => {
            conn.send(&welcome)?;
            for deliver in replay {
                conn.send(&deliver)?;
            }
        }
        Err(err) => {
            write_frame(&mut stream, &err.to_envelope()).await?;
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
                if stream.write_all(&bytes).await.is_err() {
                    break 'session;
                }
            }
            incoming = stream.read(&mut buf) => {
                let n = match incoming {
                    Ok(0) | Err(_) => break 'session,
                    Ok(n) => n,
                };
                let frames = match decoder.feed(&buf[..n]) {
                    Ok(frames) => frames,
                    Err(_) => {
                        let reply = RelayError::frame_too_large(broker.config.max_frame_bytes as u32).to_envelope();
                        let _ = conn.send(&reply);
                        break 'session;
                    }
                };
                for payload in frames {
                    let Ok(envelope) = Envelope::from_json(&payload) else {
                        let _ = conn.send(&RelayError::bad_request("malformed envelope").to_envelope());
                        continue;
                    };
                    if let Some(reply) = protocol::dispatch(&broker, &conn, envelope).await {
                        let _ = conn.send(&reply);
                    }
                    if conn.state() == ConnectionState::Closing {
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

/// Reads from `stream` until the decoder yields exactly one frame, used only
/// for the HELLO handshake before the main select loop starts.
async fn read_one_frame(stream: &mut UnixStream, decoder: &mut FrameDecoder, buf: &mut [u8]) -> Option<Vec<u8>> {
    loop {
        let n = stream.read(buf).await.ok()?;
        if n == 0 {
            return None;
        }
        let mut frames = decoder.feed(&buf[..n]).ok()?;
        if !frames.is_empty() {
            return Some(frames.remove(0));
        }
    }
}

async fn write_frame(stream: &mut UnixStream, envelope: &Envelope) -> Result<()> {
    let json = envelope.to_json()?;
    stream.write_all(&crate::framing::encode_frame(&json)).await?;
    Ok(())
}
