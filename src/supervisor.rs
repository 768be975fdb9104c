//! C9 — supervisor & lifecycle.
//!
//! Owns startup ordering (restore state, open listeners, accept connections)
//! and the periodic housekeeping ticks: the PendingAck sweeper and the
//! heartbeat/quiescence poll. Shutdown drains in-flight work with a grace
//! period before the process exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::interval;

use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::ErrorKind;
use crate::router::Router;

/// Cadence of the PendingAck sweeper, matching the 100ms granularity §9 calls for.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// How long a graceful shutdown waits for in-flight injections/ACKs to
/// settle before forcing connections closed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Background housekeeping the broker runs for as long as it's up.
pub struct Supervisor {
    router: Arc<Router>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Supervisor {
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { router, shutdown_tx }
    }

    /// Spawns the sweeper task; returns a receiver callers can also use to
    /// learn when shutdown has been requested.
    pub fn spawn_sweeper(&self) {
        let router = Arc::clone(&self.router);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for correlation_id in router.sweep_expired_acks() {
                            log::debug!("pending ack '{correlation_id}' expired without a reply");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Requests shutdown: every subscriber (sweeper, PTY pollers, transport
    /// accept loops) observes this on their next select and winds down.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    #[must_use]
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Builds the presence envelope broadcast when an agent attaches.
    #[must_use]
    pub fn agent_ready(agent_name: &str) -> Envelope {
        Envelope::new(EnvelopeKind::Status)
            .with_from(agent_name)
            .with_to("*")
            .with_payload(serde_json::json!({"event": "AGENT_READY", "agent": agent_name}))
    }

    /// Builds the presence envelope broadcast when an agent detaches.
    #[must_use]
    pub fn agent_left(agent_name: &str) -> Envelope {
        Envelope::new(EnvelopeKind::Status)
            .with_from(agent_name)
            .with_to("*")
            .with_payload(serde_json::json!({"event": "AGENT_LEFT", "agent": agent_name}))
    }

    /// Sends BYE to a connection and waits up to [`SHUTDOWN_GRACE`] for its
    /// outbound queue to drain before the transport task closes the socket.
    pub async fn drain_connection(conn: &crate::connection::Connection) {
        let bye = Envelope::new(EnvelopeKind::Bye).with_payload(serde_json::json!({
            "code": ErrorKind::Internal.code(),
            "reason": "broker shutting down",
        }));
        let _ = conn.send(&bye);
        tokio::time::sleep(SHUTDOWN_GRACE).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelRegistry, TopicRegistry};
    use crate::message_log::MessageLog;
    use crate::registry::Registry;

    fn router() -> Arc<Router> {
        Arc::new(Router::new(
            Arc::new(Registry::new()),
            Arc::new(ChannelRegistry::new()),
            Arc::new(TopicRegistry::new()),
            Arc::new(MessageLog::default()),
            true,
        ))
    }

    #[tokio::test]
    async fn shutdown_broadcast_reaches_all_subscribers() {
        let supervisor = Supervisor::new(router());
        let mut rx1 = supervisor.subscribe_shutdown();
        let mut rx2 = supervisor.subscribe_shutdown();
        supervisor.request_shutdown();
        rx1.recv().await.unwrap();
        rx2.recv().await.unwrap();
    }

    #[test]
    fn presence_envelopes_carry_expected_event_names() {
        let ready = Supervisor::agent_ready("alice");
        assert_eq!(ready.payload["event"], "AGENT_READY");
        let left = Supervisor::agent_left("alice");
        assert_eq!(left.payload["event"], "AGENT_LEFT");
    }
}
