//! Configuration loading and persistence.
//!
//! Handles reading and writing the broker's configuration file. Precedence,
//! low to highest: built-in [`Default`], then the JSON file under the config
//! directory, then environment-variable overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::collections::HashMap;
use std::{fs, path::PathBuf};

/// Per-CLI idle-threshold and permission-bypass-flag overrides, keyed by
/// the CLI binary name (`claude`, `codex`, ...). Unknown CLIs fall back to
/// [`Config::default_idle_threshold_ms`].
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CliOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_threshold_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass_permissions_flag: Option<String>,
}

/// Configuration for the relay broker.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Path of the local stream socket the broker listens on.
    pub socket_path: PathBuf,
    /// Optional `host:port` to also listen for WebSocket clients on.
    #[serde(default)]
    pub ws_listen_addr: Option<String>,
    /// Optional cloud relay URL for the outbound uplink.
    #[serde(default)]
    pub cloud_uplink_url: Option<String>,
    /// Workspace token presented to the cloud relay. NOT serialized to disk.
    #[serde(skip)]
    pub workspace_token: String,
    /// Milliseconds between PING heartbeats on an ACTIVE Connection.
    pub heartbeat_ms: u64,
    /// A Connection is dead after `heartbeat_ms * heartbeat_multiplier` of
    /// silence, unless it is marked "processing".
    pub heartbeat_multiplier: u64,
    /// Frames larger than this are rejected with `FRAME_TOO_LARGE`.
    pub max_frame_bytes: usize,
    /// Capacity of each Connection's inbound dedup LRU.
    pub dedup_capacity: usize,
    /// Message log retention bound (entry count).
    pub message_log_max_entries: usize,
    /// Message log retention bound (age, milliseconds).
    pub message_log_max_age_ms: u64,
    /// Whether a self-addressed SEND appears in the sender's own inbox query.
    pub self_send_visible_in_inbox: bool,
    /// Directory holding the persisted state snapshot and other broker state.
    pub state_dir: PathBuf,
    /// Fallback idle threshold for CLIs with no entry in `cli_overrides`.
    pub default_idle_threshold_ms: u64,
    /// Per-CLI idle-threshold and flag overrides. Data, not code paths.
    #[serde(default)]
    pub cli_overrides: HashMap<String, CliOverride>,
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = if crate::env::is_any_test() {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/agent-relay-test")
        } else {
            dirs::data_dir()
                .map(|d| d.join(crate::env::APP_NAME))
                .unwrap_or_else(|| PathBuf::from("agent-relay-state"))
        };

        let mut cli_overrides = HashMap::new();
        cli_overrides.insert(
            "claude".to_string(),
            CliOverride {
                idle_threshold_ms: Some(800),
                bypass_permissions_flag: Some("--dangerously-skip-permissions".to_string()),
            },
        );
        cli_overrides.insert(
            "codex".to_string(),
            CliOverride {
                idle_threshold_ms: Some(800),
                bypass_permissions_flag: Some("--full-auto".to_string()),
            },
        );

        Self {
            socket_path: state_dir.join("relay.sock"),
            ws_listen_addr: None,
            cloud_uplink_url: None,
            workspace_token: String::new(),
            heartbeat_ms: 15_000,
            heartbeat_multiplier: 3,
            max_frame_bytes: 1 << 20,
            dedup_capacity: 10_000,
            message_log_max_entries: 50_000,
            message_log_max_age_ms: 24 * 60 * 60 * 1000,
            self_send_visible_in_inbox: true,
            state_dir,
            default_idle_threshold_ms: 500,
            cli_overrides,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `#[cfg(test)]` (unit tests): `tmp/agent-relay-test`
    /// 2. `AGENT_RELAY_CONFIG_DIR` env var: explicit override
    /// 3. `AGENT_RELAY_ENV=test`: `tmp/agent-relay-test` (integration tests)
    /// 4. Default: platform config dir
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/agent-relay-test")
            }

            #[cfg(not(test))]
            {
                if let Ok(dir) = std::env::var("AGENT_RELAY_CONFIG_DIR") {
                    PathBuf::from(dir)
                } else if crate::env::is_any_test() {
                    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/agent-relay-test")
                } else {
                    dirs::config_dir()
                        .context("Could not determine config directory")?
                        .join(crate::env::APP_NAME)
                }
            }
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|_| Self::default());
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            anyhow::bail!("Config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(socket_path) = std::env::var("AGENT_RELAY_SOCKET") {
            self.socket_path = PathBuf::from(socket_path);
        }
        if let Ok(addr) = std::env::var("AGENT_RELAY_WS_ADDR") {
            self.ws_listen_addr = Some(addr);
        }
        if let Ok(url) = std::env::var("AGENT_RELAY_CLOUD_URL") {
            self.cloud_uplink_url = Some(url);
        }
        if let Ok(token) = std::env::var("AGENT_RELAY_WORKSPACE_TOKEN") {
            self.workspace_token = token;
        }
        if let Ok(ms) = std::env::var("AGENT_RELAY_HEARTBEAT_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.heartbeat_ms = ms;
            }
        }
        if let Ok(bytes) = std::env::var("AGENT_RELAY_MAX_FRAME_BYTES") {
            if let Ok(bytes) = bytes.parse::<usize>() {
                self.max_frame_bytes = bytes;
            }
        }
        if let Ok(dir) = std::env::var("AGENT_RELAY_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
    }

    /// Persists the current configuration to disk. The workspace token is
    /// never written (`#[serde(skip)]`).
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Resolves the idle threshold for a wrapped CLI, falling back to
    /// `default_idle_threshold_ms` for CLIs with no table entry.
    #[must_use]
    pub fn idle_threshold_ms(&self, cli_name: &str) -> u64 {
        self.cli_overrides
            .get(cli_name)
            .and_then(|o| o.idle_threshold_ms)
            .unwrap_or(self.default_idle_threshold_ms)
    }

    /// Resolves the permission-bypass flag for a wrapped CLI, if one is known.
    #[must_use]
    pub fn bypass_permissions_flag(&self, cli_name: &str) -> Option<&str> {
        self.cli_overrides
            .get(cli_name)
            .and_then(|o| o.bypass_permissions_flag.as_deref())
    }

    /// A `Config` safe to use from unit tests: isolated state dir, no
    /// listeners enabled, nothing touching the real filesystem until a
    /// caller explicitly points `state_dir` somewhere.
    #[must_use]
    pub fn for_test() -> Self {
        Self {
            state_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/agent-relay-test"),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = Config::default();
        assert_eq!(config.heartbeat_multiplier, 3);
        assert!(config.self_send_visible_in_inbox);
        assert_eq!(config.dedup_capacity, 10_000);
    }

    #[test]
    fn serialization_excludes_workspace_token() {
        let mut config = Config::default();
        config.workspace_token = "secret-token".to_string();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret-token"));
        assert!(!json.contains("workspace_token"));
    }

    #[test]
    fn idle_threshold_falls_back_to_default_for_unknown_cli() {
        let config = Config::default();
        assert_eq!(config.idle_threshold_ms("claude"), 800);
        assert_eq!(config.idle_threshold_ms("some-unlisted-cli"), config.default_idle_threshold_ms);
    }

    #[test]
    fn env_overrides_apply_on_top_of_file_defaults() {
        std::env::set_var("AGENT_RELAY_HEARTBEAT_MS", "9999");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.heartbeat_ms, 9999);
        std::env::remove_var("AGENT_RELAY_HEARTBEAT_MS");
    }
}
