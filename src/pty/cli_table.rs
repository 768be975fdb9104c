//! Per-CLI idiosyncrasies as data, not code paths (§4.5, §9).
//!
//! New wrapped CLIs are added by extending this table, never by adding a
//! branch to the supervisor or injector.

use std::time::Duration;

/// Permission-bypass flags and idle threshold for one wrapped CLI.
#[derive(Debug, Clone)]
pub struct CliProfile {
    /// Command-line flags appended when spawning this CLI so it runs
    /// non-interactively under the PTY without re-prompting for permission.
    pub permission_bypass_args: Vec<String>,
    /// How long the CLI must be silent before it is considered quiescent.
    pub idle_threshold: Duration,
}

impl CliProfile {
    fn new(args: &[&str], idle_ms: u64) -> Self {
        Self {
            permission_bypass_args: args.iter().map(|s| (*s).to_string()).collect(),
            idle_threshold: Duration::from_millis(idle_ms),
        }
    }
}

/// Default profile used for CLIs with no entry in the table.
#[must_use]
pub fn default_profile() -> CliProfile {
    CliProfile::new(&[], 1_500)
}

/// Looks up the profile for a named CLI, falling back to [`default_profile`]
/// for anything unrecognized.
#[must_use]
pub fn profile_for(cli_name: &str) -> CliProfile {
    match cli_name {
        "claude" => CliProfile::new(&["--dangerously-skip-permissions"], 500),
        "codex" => CliProfile::new(&["--full-auto"], 800),
        "gemini" => CliProfile::new(&["--yolo"], 800),
        "aider" => CliProfile::new(&["--yes-always"], 1_000),
        "cursor-agent" => CliProfile::new(&["--force"], 1_000),
        "amp" => CliProfile::new(&[], 30_000),
        _ => default_profile(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_cli_gets_its_own_profile() {
        let claude = profile_for("claude");
        assert_eq!(claude.idle_threshold, Duration::from_millis(500));
        assert!(claude
            .permission_bypass_args
            .contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn unknown_cli_gets_default_profile() {
        let unknown = profile_for("some-future-cli");
        assert_eq!(unknown.idle_threshold, default_profile().idle_threshold);
        assert!(unknown.permission_bypass_args.is_empty());
    }

    #[test]
    fn slow_agent_threshold_is_on_the_order_of_tens_of_seconds() {
        let amp = profile_for("amp");
        assert_eq!(amp.idle_threshold, Duration::from_secs(30));
    }
}
