//! Per-PTY-session injection control socket (§6).
//!
//! A colocated helper process (not a full protocol peer) can request
//! injection into a specific PTY-wrapped agent without opening a HELLO
//! handshake on the main transport. The protocol is newline-delimited JSON,
//! one control message per line: `{"type":"inject","id","from","body",
//! "priority"}` or `{"type":"shutdown"}`. Every inject gets exactly one
//! `{"type":"inject_result","id","status"}` response line.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::envelope::{Envelope, EnvelopeKind};
use crate::injection::{DEFAULT_INJECTION_DEADLINE, InjectionQueue};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage {
    Inject {
        id: String,
        from: String,
        body: String,
        #[serde(default)]
        priority: Option<u8>,
    },
    Shutdown,
}

/// Handle to one PTY session's control-socket accept loop.
pub struct PtyControlSocket {
    socket_path: PathBuf,
    accept_handle: tokio::task::JoinHandle<()>,
}

impl PtyControlSocket {
    /// Binds the control socket at `socket_path` and starts accepting
    /// connections, injecting through `queue` on behalf of `agent_name`.
    pub fn start(socket_path: PathBuf, agent_name: String, queue: InjectionQueue) -> Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("removing stale control socket {}", socket_path.display()))?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = std::os::unix::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("binding control socket {}", socket_path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }
        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        let path = socket_path.clone();
        let accept_handle = tokio::spawn(accept_loop(listener, agent_name, queue, path));
        Ok(Self { socket_path, accept_handle })
    }

    pub fn shutdown(self) {
        self.accept_handle.abort();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn accept_loop(listener: UnixListener, agent_name: String, queue: InjectionQueue, socket_path: PathBuf) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let agent_name = agent_name.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_client(stream, &agent_name, queue).await {
                        log::debug!("pty control connection for '{agent_name}' ended: {err}");
                    }
                });
            }
            Err(err) => {
                if !socket_path.exists() {
                    break;
                }
                log::error!("pty control accept error: {err}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_client(stream: UnixStream, agent_name: &str, queue: InjectionQueue) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message: ControlMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(err) => {
                log::debug!("malformed pty control message for '{agent_name}': {err}");
                continue;
            }
        };

        match message {
            ControlMessage::Inject { id, from, body, priority } => {
                let _ = priority; // FIFO ordering only; no priority lane (§4.6).
                let envelope = Envelope::new(EnvelopeKind::Send).with_from(from).with_payload(serde_json::json!({"body": body}));
                let deadline = Instant::now() + DEFAULT_INJECTION_DEADLINE;
                let outcome = queue.enqueue(envelope, deadline).await;
                let status = match outcome {
                    crate::injection::InjectionOutcome::Delivered => "delivered",
                    crate::injection::InjectionOutcome::TimedOut => "timed_out",
                };
                let response = serde_json::json!({"type": "inject_result", "id": id, "status": status}).to_string();
                write_half.write_all(response.as_bytes()).await?;
                write_half.write_all(b"\n").await?;
            }
            ControlMessage::Shutdown => break,
        }
    }
    Ok(())
}

/// The well-known per-session control socket path for `agent_name` under
/// the broker's state directory.
#[must_use]
pub fn control_socket_path(state_dir: &std::path::Path, agent_name: &str) -> PathBuf {
    state_dir.join("pty-control").join(format!("{agent_name}.sock"))
}
