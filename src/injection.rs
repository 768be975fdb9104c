//! C6 — injection controller.
//!
//! Consumes envelopes destined for a PTY-wrapped agent, gates the stdin
//! write on the quiescence signal from C5, and reports the outcome back to
//! the caller so the router can ACK or NACK the sender. One [`InjectionQueue`]
//! owns exactly one PTY session's stdin and processes jobs strictly FIFO,
//! regardless of which sender enqueued them (§4.6 ordering rule).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::envelope::Envelope;
use crate::pty::{PtyEvent, PtySession};

/// Default time an envelope is allowed to wait for quiescence before it
/// is dropped and surfaced as a NACK.
pub const DEFAULT_INJECTION_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionOutcome {
    Delivered,
    TimedOut,
}

struct InjectionJob {
    envelope: Envelope,
    deadline: Instant,
    result_tx: oneshot::Sender<InjectionOutcome>,
}

/// Formats an envelope as the single text line written to a PTY's stdin.
///
/// `Relay message from <sender> [<short-id>]: <body>\n` — multi-line bodies
/// keep their embedded newlines; the trailing `\n` is the trigger character
/// the wrapped CLI's line-based input loop reacts to.
#[must_use]
pub fn format_injection(sender: &str, short_id: &str, body: &str) -> String {
    format!("Relay message from {sender} [{short_id}]: {body}\n")
}

/// Owns one PTY session's stdin and serializes writes to it.
#[derive(Debug, Clone)]
pub struct InjectionQueue {
    tx: mpsc::UnboundedSender<InjectionJob>,
}

impl InjectionQueue {
    /// Spawns the background task that drains the FIFO and performs writes.
    /// `on_processing` is called with `true`/`false` around each wait so the
    /// owning Connection's heartbeat can be exempted per §4.1.
    pub fn spawn(pty: Arc<PtySession>, on_processing: impl Fn(bool) + Send + 'static) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<InjectionJob>();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                on_processing(true);
                let outcome = wait_and_write(&pty, &job.envelope, job.deadline).await;
                on_processing(false);
                let _ = job.result_tx.send(outcome);
            }
        });

        Self { tx }
    }

    /// Enqueues `envelope` for injection, resolving once it is either
    /// written or its deadline expires.
    pub async fn enqueue(&self, envelope: Envelope, deadline: Instant) -> InjectionOutcome {
        let (result_tx, result_rx) = oneshot::channel();
        let job = InjectionJob {
            envelope,
            deadline,
            result_tx,
        };
        if self.tx.send(job).is_err() {
            return InjectionOutcome::TimedOut;
        }
        result_rx.await.unwrap_or(InjectionOutcome::TimedOut)
    }
}

async fn wait_and_write(pty: &PtySession, envelope: &Envelope, deadline: Instant) -> InjectionOutcome {
    if !wait_for_quiescence(pty, deadline).await {
        return InjectionOutcome::TimedOut;
    }

    let sender = envelope.from.as_deref().unwrap_or("unknown");
    let body = envelope.body().unwrap_or("");
    let line = format_injection(sender, envelope.short_id(), body);

    match pty.write_input(line.as_bytes()) {
        Ok(()) => InjectionOutcome::Delivered,
        Err(err) => {
            log::warn!("injection write failed for {}: {err}", pty.agent_name);
            InjectionOutcome::TimedOut
        }
    }
}

/// Waits until `pty` is quiescent or `deadline` passes, consuming edge
/// events rather than polling (§9 design note).
async fn wait_for_quiescence(pty: &PtySession, deadline: Instant) -> bool {
    if pty.is_quiescent_now() {
        return true;
    }

    let mut events = pty.subscribe();
    loop {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let remaining = deadline - now;
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(PtyEvent::QuiescenceChanged(edge)) if matches!(edge, crate::pty::quiescence::QuiescenceEdge::BecameQuiescent) => {
                        return true;
                    }
                    Ok(_) => continue,
                    Err(_) => {
                        // Lagged or closed: fall back to a direct check.
                        if pty.is_quiescent_now() {
                            return true;
                        }
                    }
                }
            }
            () = tokio::time::sleep(remaining.min(Duration::from_millis(200))) => {
                if pty.is_quiescent_now() {
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_the_relay_message_line() {
        let line = format_injection("alice", "deadbeef", "hi there");
        assert_eq!(line, "Relay message from alice [deadbeef]: hi there\n");
    }

    #[test]
    fn multiline_bodies_keep_embedded_newlines() {
        let line = format_injection("alice", "deadbeef", "line one\nline two");
        assert!(line.starts_with("Relay message from alice [deadbeef]: line one\nline two"));
        assert!(line.ends_with('\n'));
    }

    #[tokio::test]
    async fn delivers_once_child_is_quiescent() {
        let pty = Arc::new(
            PtySession::spawn(
                "test-agent",
                "cat",
                &[],
                std::path::Path::new("."),
                &std::collections::HashMap::new(),
                24,
                80,
            )
            .expect("spawn cat"),
        );
        let queue = InjectionQueue::spawn(Arc::clone(&pty), |_| {});

        let envelope = Envelope::new(crate::envelope::EnvelopeKind::Send)
            .with_from("alice")
            .with_payload(serde_json::json!({"body": "now"}));

        let outcome = queue
            .enqueue(envelope, Instant::now() + Duration::from_secs(5))
            .await;
        assert_eq!(outcome, InjectionOutcome::Delivered);
        pty.kill();
    }

    #[tokio::test]
    async fn times_out_when_deadline_has_already_passed() {
        let pty = Arc::new(
            PtySession::spawn(
                "test-agent",
                "cat",
                &[],
                std::path::Path::new("."),
                &std::collections::HashMap::new(),
                24,
                80,
            )
            .expect("spawn cat"),
        );
        // Force busy so the deadline (already in the past) cannot be met.
        pty.write_input(b"").ok();
        let queue = InjectionQueue::spawn(Arc::clone(&pty), |_| {});
        let envelope = Envelope::new(crate::envelope::EnvelopeKind::Send)
            .with_payload(serde_json::json!({"body": "now"}));
        let outcome = queue.enqueue(envelope, Instant::now()).await;
        // Deadline already expired; quiescence wait should fail fast.
        assert_eq!(outcome, InjectionOutcome::TimedOut);
        pty.kill();
    }
}
