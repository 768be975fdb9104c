//! Broker state snapshot: channel memberships and the agent roster.
//!
//! Restored before the accept loop opens on startup and saved (best-effort)
//! whenever membership changes, per §6's "Persisted state" note. This is not
//! the message log — it is the thin slice of state that must survive a
//! broker restart so channels don't silently lose members.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelRegistry;
use crate::registry::Registry;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateSnapshot {
    pub channels: HashMap<String, Vec<String>>,
    pub agents: Vec<String>,
}

impl StateSnapshot {
    #[must_use]
    pub fn capture(channels: &ChannelRegistry, registry: &Registry) -> Self {
        let mut channel_map = HashMap::new();
        for name in channels.channel_names() {
            channel_map.insert(name.clone(), channels.members(&name));
        }
        let agents = registry.active_names();
        Self {
            channels: channel_map,
            agents,
        }
    }

    pub fn restore_into(&self, channels: &ChannelRegistry) {
        for (name, members) in &self.channels {
            channels.restore(name, members.clone());
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating snapshot directory {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(self).context("serializing state snapshot")?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &json)
            .with_context(|| format!("writing snapshot to {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming snapshot into place at {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading snapshot from {}", path.display()))?;
        serde_json::from_slice(&bytes).context("parsing state snapshot")
    }
}

#[must_use]
pub fn default_snapshot_path(state_dir: &Path) -> PathBuf {
    state_dir.join("state_snapshot.json")
}
