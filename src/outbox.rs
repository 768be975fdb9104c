//! Outbox directory protocol (§4.10): lets a wrapped CLI emit relay commands
//! by writing files instead of speaking the wire protocol directly.
//!
//! Each PTY-wrapped agent gets a per-agent outbox directory. A file created
//! there is parsed as either a header-style message (`TO:`/`KIND:`/`NAME:`/
//! `CLI:`/`THREAD:`/`ACTION:`, a blank line, then a body) or, failing that,
//! as JSON. The file is deleted once ingested. Because file-system watchers
//! can miss events under load, a periodic directory scan runs alongside the
//! watcher as a backstop (§9's listed edge case), and ingestion is idempotent
//! by envelope id so a file processed twice by both paths is harmless.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::broker::Broker;
use crate::connection::{Connection, EntityKind, Transport};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::file_watcher::{FileEventKind, FileWatcher};

/// Cadence of the directory-scan backstop.
const SCAN_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboxKind {
    Message,
    Spawn,
    Release,
    Continuity,
}

impl OutboxKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "message" => Some(Self::Message),
            "spawn" => Some(Self::Spawn),
            "release" => Some(Self::Release),
            "continuity" => Some(Self::Continuity),
            _ => None,
        }
    }
}

/// A parsed outbox file, independent of whether it was header-style or JSON.
#[derive(Debug, Clone, Default)]
struct OutboxEntry {
    to: Option<String>,
    kind: Option<OutboxKind>,
    name: Option<String>,
    cli: Option<String>,
    thread: Option<String>,
    action: Option<String>,
    body: String,
}

/// Watches one agent's outbox directory and ingests files into the broker.
pub struct OutboxWatcher {
    handle: tokio::task::JoinHandle<()>,
}

impl OutboxWatcher {
    /// Spawns the watcher. `agent_name` identifies the sender recorded on
    /// ingested message entries.
    pub fn spawn(broker: Arc<Broker>, agent_name: String, dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let mut watcher = FileWatcher::new()?;
        watcher.watch(&dir, false)?;

        let handle = tokio::spawn(async move {
            run(broker, agent_name, dir, watcher).await;
        });
        Ok(Self { handle })
    }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}

async fn run(broker: Arc<Broker>, agent_name: String, dir: PathBuf, watcher: FileWatcher) {
    let mut shutdown_rx = broker.supervisor.subscribe_shutdown();
    let seen: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
    let mut ticker = tokio::time::interval(SCAN_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for event in watcher.poll() {
                    if event.kind == FileEventKind::Create {
                        ingest_once(&broker, &agent_name, &event.path, &seen).await;
                    }
                }
                scan_directory(&broker, &agent_name, &dir, &seen).await;
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}

/// The periodic backstop: re-lists the directory so a create event the
/// watcher missed still gets ingested on the next tick.
async fn scan_directory(broker: &Arc<Broker>, agent_name: &str, dir: &Path, seen: &Mutex<HashSet<String>>) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        ingest_once(broker, agent_name, &entry.path(), seen).await;
    }
}

/// Ingests `path` unless its content has already been processed (idempotent
/// by envelope id, not by path, since the watcher and the scan can both
/// observe the same file before it's deleted).
async fn ingest_once(broker: &Arc<Broker>, agent_name: &str, path: &Path, seen: &Mutex<HashSet<String>>) {
    let Ok(raw) = std::fs::read_to_string(path) else { return };
    let Some(entry) = parse_header_style(&raw).or_else(|| parse_json(&raw)) else {
        log::warn!("outbox file {} did not parse as a message", path.display());
        let _ = std::fs::remove_file(path);
        return;
    };

    let envelope_id = crate::envelope::Envelope::new(EnvelopeKind::Send).id;
    let dedup_key = format!("{agent_name}:{raw}");
    {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let mut seen = seen.lock().unwrap();
        if !seen.insert(dedup_key) {
            let _ = std::fs::remove_file(path);
            return;
        }
    }

    ingest(broker, agent_name, entry, envelope_id).await;
    let _ = std::fs::remove_file(path);
}

async fn ingest(broker: &Arc<Broker>, agent_name: &str, entry: OutboxEntry, envelope_id: String) {
    let (outbound_tx, _outbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let sender = Arc::new(Connection::new(Transport::Local, EntityKind::Agent, outbound_tx));
    {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        sender.meta.lock().unwrap().agent_name = Some(agent_name.to_string());
    }

    match entry.kind.unwrap_or(OutboxKind::Message) {
        OutboxKind::Message => {
            let Some(to) = entry.to else {
                log::warn!("outbox message from '{agent_name}' missing TO:");
                return;
            };
            let mut envelope = Envelope::new(EnvelopeKind::Send)
                .with_from(agent_name)
                .with_to(to)
                .with_payload(serde_json::json!({"body": entry.body}));
            envelope.id = envelope_id;
            if let Some(thread) = entry.thread {
                envelope.payload["threadId"] = serde_json::Value::String(thread);
            }
            if let Err(err) = broker.router.route(&sender, envelope).await {
                log::warn!("outbox SEND from '{agent_name}' failed: {err}");
            }
        }
        OutboxKind::Spawn => {
            let Some(name) = entry.name else {
                log::warn!("outbox spawn from '{agent_name}' missing NAME:");
                return;
            };
            let cli = entry.cli.unwrap_or_else(|| "claude".to_string());
            if let Err(err) = broker.spawn_pty(&name, &cli, &[], Path::new("."), &std::collections::HashMap::new()) {
                log::warn!("outbox SPAWN from '{agent_name}' failed: {err}");
            }
        }
        OutboxKind::Release => {
            if let Some(name) = entry.name {
                broker.release_pty(&name);
            }
        }
        OutboxKind::Continuity => {
            log::debug!("outbox continuity note from '{agent_name}': {}", entry.action.unwrap_or_default());
        }
    }
}

/// Parses the `TO:`/`KIND:`/... header block, a blank line, then the body.
fn parse_header_style(raw: &str) -> Option<OutboxEntry> {
    let (header, body) = raw.split_once("\n\n")?;
    let mut entry = OutboxEntry::default();
    let mut saw_header_field = false;
    for line in header.lines() {
        let Some((key, value)) = line.split_once(':') else { continue };
        let value = value.trim().to_string();
        match key.trim() {
            "TO" => entry.to = Some(value),
            "KIND" => entry.kind = OutboxKind::parse(&value),
            "NAME" => entry.name = Some(value),
            "CLI" => entry.cli = Some(value),
            "THREAD" => entry.thread = Some(value),
            "ACTION" => entry.action = Some(value),
            _ => continue,
        }
        saw_header_field = true;
    }
    if !saw_header_field {
        return None;
    }
    entry.body = body.to_string();
    Some(entry)
}

/// JSON fallback: `{"to", "kind", "name", "cli", "thread", "action", "body"}`.
fn parse_json(raw: &str) -> Option<OutboxEntry> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    Some(OutboxEntry {
        to: value.get("to").and_then(|v| v.as_str()).map(str::to_string),
        kind: value.get("kind").and_then(|v| v.as_str()).and_then(OutboxKind::parse),
        name: value.get("name").and_then(|v| v.as_str()).map(str::to_string),
        cli: value.get("cli").and_then(|v| v.as_str()).map(str::to_string),
        thread: value.get("thread").and_then(|v| v.as_str()).map(str::to_string),
        action: value.get("action").and_then(|v| v.as_str()).map(str::to_string),
        body: value.get("body").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_style_parses_fields_and_body() {
        let raw = "TO: bob\nKIND: message\nTHREAD: t1\n\nhello there";
        let entry = parse_header_style(raw).unwrap();
        assert_eq!(entry.to.as_deref(), Some("bob"));
        assert_eq!(entry.kind, Some(OutboxKind::Message));
        assert_eq!(entry.thread.as_deref(), Some("t1"));
        assert_eq!(entry.body, "hello there");
    }

    #[test]
    fn header_style_requires_at_least_one_field() {
        assert!(parse_header_style("not a header\n\nbody").is_none());
    }

    #[test]
    fn json_fallback_parses_message() {
        let raw = r#"{"to": "bob", "kind": "message", "body": "hi"}"#;
        let entry = parse_json(raw).unwrap();
        assert_eq!(entry.to.as_deref(), Some("bob"));
        assert_eq!(entry.body, "hi");
    }

    #[test]
    fn spawn_kind_requires_name_not_to() {
        let raw = "KIND: spawn\nNAME: codex-1\nCLI: codex\n\n";
        let entry = parse_header_style(raw).unwrap();
        assert_eq!(entry.kind, Some(OutboxKind::Spawn));
        assert_eq!(entry.name.as_deref(), Some("codex-1"));
    }

    #[tokio::test]
    async fn ingest_once_is_idempotent_by_content() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(Broker::new(crate::config::Config::for_test()));
        let path = dir.path().join("msg1");
        std::fs::write(&path, "TO: bob\nKIND: message\n\nhi").unwrap();
        let seen = Mutex::new(HashSet::new());

        ingest_once(&broker, "alice", &path, &seen).await;
        assert!(!path.exists());
        assert_eq!(broker.log.by_recipient("bob", None, None).len(), 1);

        // Re-create the same file content; dedup key matches, so this is a no-op.
        std::fs::write(&path, "TO: bob\nKIND: message\n\nhi").unwrap();
        ingest_once(&broker, "alice", &path, &seen).await;
        assert_eq!(broker.log.by_recipient("bob", None, None).len(), 1);
    }
}
