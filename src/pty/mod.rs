//! C5 — PTY session supervisor.
//!
//! Spawns a wrapped CLI under a controlling terminal, streams its output to
//! subscribers (the quiescence detector foremost among them), and exposes the
//! single writer the injection controller uses to deliver formatted messages.
//!
//! Output is also fed through a `vt100::Parser` so the quiescence detector
//! only sees a change when the rendered screen actually changes, not on
//! every cursor-movement or color escape. A background poller drives the
//! detector's idle-gap timer independently of the reader thread, since a
//! busy→quiescent edge can only fire while the child stays silent.

pub mod cli_table;
pub mod quiescence;

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::broadcast;
use vt100::Parser;

use self::quiescence::{QuiescenceDetector, QuiescenceEdge};
use crate::pty::cli_table::profile_for;

/// Upper bound on retained scrollback, in bytes, mirroring the bounded
/// buffer the supervisor keeps for ANSI-snapshot/resume purposes.
pub const MAX_SCROLLBACK_BYTES: usize = 2 * 1024 * 1024;

/// How often the quiescence poller checks the idle-gap timer between reader
/// thread wakeups (§4.5 requires the busy→quiescent edge to fire even while
/// the wrapped CLI stays silent, not just on the next byte of output).
const QUIESCENCE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Events a PTY session publishes to subscribers (the injector and, for
/// diagnostics, the router).
#[derive(Debug, Clone)]
pub enum PtyEvent {
    Output(Vec<u8>),
    Resized { rows: u16, cols: u16 },
    ProcessExited { exit_code: Option<i32> },
    QuiescenceChanged(QuiescenceEdge),
}

impl PtyEvent {
    #[must_use]
    pub fn is_output(&self) -> bool {
        matches!(self, Self::Output(_))
    }

    #[must_use]
    pub fn is_process_exited(&self) -> bool {
        matches!(self, Self::ProcessExited { .. })
    }
}

/// A supervised child CLI process running under a pseudo-terminal.
pub struct PtySession {
    pub agent_name: String,
    pub cli_name: String,
    pub pid: Option<u32>,
    writer: Mutex<Box<dyn Write + Send>>,
    #[allow(dead_code, reason = "kept alive for the duration of the session")]
    master: Box<dyn MasterPty + Send>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
    #[allow(dead_code, reason = "kept alive for the duration of the session; stopped via `running`")]
    quiescence_poller: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    scrollback: Arc<Mutex<VecDeque<u8>>>,
    /// Terminal emulator the reader thread feeds raw output through, so
    /// quiescence is judged on rendered screen content rather than the raw
    /// byte stream (cursor-movement/color escapes alone must not count as
    /// output, per §4.5).
    ansi_parser: Arc<Mutex<Parser>>,
    quiescence: Arc<Mutex<QuiescenceDetector>>,
    events_tx: broadcast::Sender<PtyEvent>,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("agent_name", &self.agent_name)
            .field("cli_name", &self.cli_name)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl PtySession {
    /// Spawns `cli_name` (with its permission-bypass args from the CLI
    /// table) under a new pseudo-terminal in `cwd`, with `env` set before
    /// exec along with the agent-identity variables the wrapped CLI expects.
    pub fn spawn(
        agent_name: &str,
        cli_name: &str,
        args: &[String],
        cwd: &Path,
        env: &HashMap<String, String>,
        rows: u16,
        cols: u16,
    ) -> Result<Self> {
        let profile = profile_for(cli_name);
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let mut cmd = CommandBuilder::new(cli_name);
        for arg in args {
            cmd.arg(arg);
        }
        for arg in &profile.permission_bypass_args {
            cmd.arg(arg);
        }
        cmd.cwd(cwd);
        for (k, v) in env {
            cmd.env(k, v);
        }
        cmd.env("RELAY_AGENT_NAME", agent_name);

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn '{cli_name}'"))?;
        let pid = child.process_id();

        let writer = pair
            .master
            .take_writer()
            .context("failed to take pty writer")?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;

        let (events_tx, _) = broadcast::channel(1024);
        let scrollback = Arc::new(Mutex::new(VecDeque::with_capacity(4096)));
        let ansi_parser = Arc::new(Mutex::new(Parser::new(rows, cols, 0)));
        let quiescence = Arc::new(Mutex::new(QuiescenceDetector::new(profile.idle_threshold)));
        let running = Arc::new(AtomicBool::new(true));

        let reader_thread = {
            let events_tx = events_tx.clone();
            let scrollback = Arc::clone(&scrollback);
            let ansi_parser = Arc::clone(&ansi_parser);
            let quiescence = Arc::clone(&quiescence);
            thread::spawn(move || {
                let mut buf = [0_u8; 8192];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => {
                            let _ = events_tx.send(PtyEvent::ProcessExited { exit_code: None });
                            break;
                        }
                        Ok(n) => {
                            let chunk = &buf[..n];
                            {
                                #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
                                let mut sb = scrollback.lock().unwrap();
                                sb.extend(chunk.iter().copied());
                                while sb.len() > MAX_SCROLLBACK_BYTES {
                                    sb.pop_front();
                                }
                            }
                            let rendered_changed = {
                                #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
                                let mut parser = ansi_parser.lock().unwrap();
                                let before = parser.screen().contents();
                                parser.process(chunk);
                                parser.screen().contents() != before
                            };
                            if rendered_changed {
                                let edge = {
                                    #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
                                    let mut q = quiescence.lock().unwrap();
                                    q.record_output()
                                };
                                if let Some(edge) = edge {
                                    let _ = events_tx.send(PtyEvent::QuiescenceChanged(edge));
                                }
                            }
                            let _ = events_tx.send(PtyEvent::Output(chunk.to_vec()));
                        }
                        Err(err) => {
                            log::warn!("pty read error for '{agent_name}': {err}");
                            let _ = events_tx.send(PtyEvent::ProcessExited { exit_code: None });
                            break;
                        }
                    }
                }
            })
        };

        let quiescence_poller = {
            let events_tx = events_tx.clone();
            let quiescence = Arc::clone(&quiescence);
            let running = Arc::clone(&running);
            thread::spawn(move || {
                while running.load(Ordering::Relaxed) {
                    thread::sleep(QUIESCENCE_POLL_INTERVAL);
                    let edge = {
                        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
                        let mut q = quiescence.lock().unwrap();
                        q.poll_transition()
                    };
                    if let Some(edge) = edge {
                        let _ = events_tx.send(PtyEvent::QuiescenceChanged(edge));
                    }
                }
            })
        };

        Ok(Self {
            agent_name: agent_name.to_string(),
            cli_name: cli_name.to_string(),
            pid,
            writer: Mutex::new(writer),
            master: pair.master,
            child: Mutex::new(Some(child)),
            reader_thread: Mutex::new(Some(reader_thread)),
            quiescence_poller: Mutex::new(Some(quiescence_poller)),
            running,
            scrollback,
            ansi_parser,
            quiescence,
            events_tx,
        })
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PtyEvent> {
        self.events_tx.subscribe()
    }

    /// Writes raw bytes to the child's stdin in one call, matching the
    /// "single atomic write" requirement from the injector (§4.6).
    pub fn write_input(&self, bytes: &[u8]) -> Result<()> {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(bytes).context("pty stdin write failed")?;
        writer.flush().context("pty stdin flush failed")?;
        Ok(())
    }

    /// Polls the quiescence detector's idle-gap timer for a transition. The
    /// supervisor calls this on a periodic tick independent of the reader
    /// thread (which only fires edges on new output).
    pub fn poll_quiescence(&self) -> Option<QuiescenceEdge> {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let edge = self.quiescence.lock().unwrap().poll_transition();
        if let Some(edge) = edge {
            let _ = self.events_tx.send(PtyEvent::QuiescenceChanged(edge));
        }
        edge
    }

    #[must_use]
    pub fn is_quiescent_now(&self) -> bool {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.quiescence.lock().unwrap().is_quiescent_now()
    }

    #[must_use]
    pub fn scrollback_snapshot(&self) -> Vec<u8> {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.scrollback.lock().unwrap().iter().copied().collect()
    }

    /// Terminates the child, if still running, and stops the quiescence
    /// poller thread. Idempotent.
    pub fn kill(&self) {
        self.running.store(false, Ordering::Relaxed);
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let mut child = self.child.lock().unwrap();
        if let Some(mut c) = child.take() {
            let _ = c.kill();
        }
    }

    /// Blocks briefly waiting for the reader thread to notice EOF, for tests
    /// that need deterministic exit observation rather than a sleep loop.
    pub fn join_reader(&self, timeout: Duration) {
        let deadline = std::time::Instant::now() + timeout;
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        while self.reader_thread.lock().unwrap().is_some() && std::time::Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.kill();
    }
}
