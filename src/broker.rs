//! Top-level wiring: the pieces from C1-C9 assembled into one running broker.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::channel::{ChannelRegistry, TopicRegistry};
use crate::config::Config;
use crate::connection::{Connection, ConnectionState, EntityKind, Transport};
use crate::message_log::MessageLog;
use crate::pty::PtySession;
use crate::registry::Registry;
use crate::router::Router;
use crate::snapshot::{default_snapshot_path, StateSnapshot};
use crate::supervisor::Supervisor;

/// Everything the protocol/transport layer needs to answer an envelope.
pub struct Broker {
    pub router: Arc<Router>,
    pub registry: Arc<Registry>,
    pub channels: Arc<ChannelRegistry>,
    pub topics: Arc<TopicRegistry>,
    pub log: Arc<MessageLog>,
    pub supervisor: Arc<Supervisor>,
    pub config: Config,
    ptys: Mutex<HashMap<String, Arc<PtySession>>>,
    /// The synthetic Connection standing in for each PTY-wrapped agent, so
    /// the router's name → Connection lookup (and its `is_active` check)
    /// works for injected delivery the same as for a transport-backed peer.
    pty_connections: Mutex<HashMap<String, Arc<Connection>>>,
    snapshot_path: PathBuf,
}

impl Broker {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(Registry::new());
        let channels = Arc::new(ChannelRegistry::new());
        let topics = Arc::new(TopicRegistry::new());
        let log = Arc::new(MessageLog::new(config.message_log_max_entries, config.message_log_max_age_ms));
        let router = Arc::new(Router::new(
            Arc::clone(&registry),
            Arc::clone(&channels),
            Arc::clone(&topics),
            Arc::clone(&log),
            config.self_send_visible_in_inbox,
        ));
        let supervisor = Arc::new(Supervisor::new(Arc::clone(&router)));
        let snapshot_path = default_snapshot_path(&config.state_dir);

        Self {
            router,
            registry,
            channels,
            topics,
            log,
            supervisor,
            config,
            ptys: Mutex::new(HashMap::new()),
            pty_connections: Mutex::new(HashMap::new()),
            snapshot_path,
        }
    }

    /// Restores channel memberships from the persisted snapshot. Call before
    /// opening any listener (§4.9 startup ordering).
    pub fn restore_state(&self) -> Result<()> {
        let snap = StateSnapshot::load(&self.snapshot_path).context("loading state snapshot")?;
        snap.restore_into(&self.channels);
        Ok(())
    }

    /// Persists the current channel/roster snapshot, best-effort.
    pub fn save_state(&self) {
        let snap = StateSnapshot::capture(&self.channels, &self.registry);
        if let Err(err) = snap.save(&self.snapshot_path) {
            log::warn!("failed to persist state snapshot: {err}");
        }
    }

    /// Spawns a PTY-wrapped CLI for `agent_name`, registering a synthetic
    /// Connection (so the router's name lookup and `is_active` check behave
    /// exactly as they do for a transport-backed peer) and an injection
    /// queue so SENDs addressed to it are delivered via stdin injection
    /// instead of a wire write.
    pub fn spawn_pty(
        &self,
        agent_name: &str,
        cli_name: &str,
        args: &[String],
        cwd: &std::path::Path,
        env: &HashMap<String, String>,
    ) -> Result<Arc<PtySession>> {
        let pty = Arc::new(PtySession::spawn(agent_name, cli_name, args, cwd, env, 24, 80)?);

        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(Transport::Local, EntityKind::Agent, outbound_tx));
        {
            #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
            let mut meta = conn.meta.lock().unwrap();
            meta.agent_name = Some(agent_name.to_string());
            meta.cli = Some(cli_name.to_string());
            meta.cwd = Some(cwd.display().to_string());
        }
        conn.set_state(ConnectionState::Active);
        self.registry
            .register(agent_name, &conn.id, false, |_| false)
            .context("registering PTY-wrapped agent")?;
        self.router.attach_connection(Arc::clone(&conn));

        let router = Arc::clone(&self.router);
        let name = agent_name.to_string();
        let name_for_queue = name.clone();
        let conn_for_queue = Arc::clone(&conn);
        let queue = crate::injection::InjectionQueue::spawn(Arc::clone(&pty), move |processing| {
            conn_for_queue.set_processing(processing);
            if let Some(connection_id) = router.registry.connection_id_of(&name_for_queue) {
                log::trace!("agent '{name_for_queue}' (conn {connection_id}) processing={processing}");
            }
        });
        self.router.attach_injection_queue(&name, queue);
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        {
            self.ptys.lock().unwrap().insert(name.clone(), Arc::clone(&pty));
            self.pty_connections.lock().unwrap().insert(name, conn);
        }
        Ok(pty)
    }

    /// The synthetic Connection standing in for a PTY-wrapped agent, used by
    /// the protocol layer to route presence envelopes with the right sender.
    #[must_use]
    pub fn pty_connection(&self, agent_name: &str) -> Option<Arc<Connection>> {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.pty_connections.lock().unwrap().get(agent_name).cloned()
    }

    pub fn release_pty(&self, agent_name: &str) {
        self.router.detach_injection_queue(agent_name);
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        {
            if let Some(conn) = self.pty_connections.lock().unwrap().remove(agent_name) {
                self.registry.unregister(agent_name, &conn.id);
                self.router.detach_connection(&conn.id);
            }
            if let Some(pty) = self.ptys.lock().unwrap().remove(agent_name) {
                pty.kill();
            }
        }
    }

    #[must_use]
    pub fn pty_for(&self, agent_name: &str) -> Option<Arc<PtySession>> {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.ptys.lock().unwrap().get(agent_name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_broker_has_empty_state() {
        let broker = Broker::new(Config::for_test());
        assert!(broker.registry.active_names().is_empty());
        assert!(broker.log.is_empty());
    }

    #[test]
    fn save_and_restore_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_test();
        config.state_dir = dir.path().to_path_buf();
        let broker = Broker::new(config);
        broker.channels.join("#general", "alice");
        broker.save_state();

        let config2 = Config {
            state_dir: dir.path().to_path_buf(),
            ..Config::for_test()
        };
        let broker2 = Broker::new(config2);
        broker2.restore_state().unwrap();
        assert_eq!(broker2.channels.members("#general"), vec!["alice".to_string()]);
    }
}
