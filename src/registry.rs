//! C3 — agent registry.
//!
//! Name → Connection id mapping, insertion-ordered the same way the PTY
//! hub's agent table is ordered (iteration determinism for channel fan-out
//! relies on this), plus reserved-name enforcement and presence tracking.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::RelayError;

/// Names that only internal components may claim.
pub const RESERVED_NAMES: &[&str] = &["system", "dashboard", "router", "*"];

#[must_use]
pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name) || name.starts_with('#') || name.starts_with("dm:")
}

/// The registry's view of a logical agent, independent of whether it
/// currently has a live Connection.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub name: String,
    pub connection_id: Option<String>,
    pub last_seen_ms: u64,
    pub cli: Option<String>,
    pub role: Option<String>,
    pub team: Option<String>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    agents: HashMap<String, AgentRecord>,
    order: Vec<String>,
}

/// Thread-safe agent registry.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` to `connection_id`. Fails if `name` is reserved (and
    /// the caller lacks an internal flag) or if the name currently maps to a
    /// different, still-ACTIVE connection.
    pub fn register(
        &self,
        name: &str,
        connection_id: &str,
        internal: bool,
        is_prior_active: impl FnOnce(&str) -> bool,
    ) -> Result<(), RelayError> {
        if is_reserved(name) && !internal {
            return Err(RelayError::bad_request(format!(
                "'{name}' is a reserved name"
            )));
        }

        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.agents.get(name) {
            if let Some(ref existing_conn) = existing.connection_id {
                if existing_conn != connection_id && is_prior_active(existing_conn) {
                    return Err(RelayError::bad_request("name in use"));
                }
            }
        }

        let is_new = !inner.agents.contains_key(name);
        inner.agents.insert(
            name.to_string(),
            AgentRecord {
                name: name.to_string(),
                connection_id: Some(connection_id.to_string()),
                last_seen_ms: now_ms(),
                cli: None,
                role: None,
                team: None,
            },
        );
        if is_new {
            inner.order.push(name.to_string());
        }
        Ok(())
    }

    /// Removes the `name → connection_id` mapping only if it still matches,
    /// defending against a stale close racing a fresh HELLO reusing the name.
    pub fn unregister(&self, name: &str, connection_id: &str) -> bool {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.agents.get_mut(name) {
            if record.connection_id.as_deref() == Some(connection_id) {
                record.connection_id = None;
                return true;
            }
        }
        false
    }

    pub fn touch(&self, name: &str) {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.agents.get_mut(name) {
            record.last_seen_ms = now_ms();
        }
    }

    #[must_use]
    pub fn connection_id_of(&self, name: &str) -> Option<String> {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.inner
            .lock()
            .unwrap()
            .agents
            .get(name)
            .and_then(|r| r.connection_id.clone())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.inner.lock().unwrap().agents.contains_key(name)
    }

    /// Names currently mapped to a live connection, in insertion order.
    #[must_use]
    pub fn active_names(&self) -> Vec<String> {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .filter(|name| {
                inner
                    .agents
                    .get(*name)
                    .is_some_and(|r| r.connection_id.is_some())
            })
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<AgentRecord> {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.inner.lock().unwrap().agents.get(name).cloned()
    }
}

fn now_ms() -> u64 {
    #[allow(unwrap_used, reason = "system clock predates the epoch only if misconfigured")]
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup() {
        let reg = Registry::new();
        reg.register("alice", "conn-1", false, |_| false).unwrap();
        assert_eq!(reg.connection_id_of("alice"), Some("conn-1".to_string()));
    }

    #[test]
    fn reserved_names_are_rejected_for_normal_hellos() {
        let reg = Registry::new();
        let err = reg.register("system", "conn-1", false, |_| false).unwrap_err();
        assert_eq!(err.kind.code(), "BAD_REQUEST");
    }

    #[test]
    fn internal_flag_allows_reserved_names() {
        let reg = Registry::new();
        reg.register("system", "conn-1", true, |_| false).unwrap();
        assert!(reg.contains("system"));
    }

    #[test]
    fn reclaiming_a_name_requires_prior_to_be_inactive() {
        let reg = Registry::new();
        reg.register("alice", "conn-1", false, |_| false).unwrap();
        let err = reg
            .register("alice", "conn-2", false, |_| true)
            .unwrap_err();
        assert_eq!(err.kind.code(), "BAD_REQUEST");

        // Once the prior connection is reported inactive, reclaiming succeeds.
        reg.register("alice", "conn-2", false, |_| false).unwrap();
        assert_eq!(reg.connection_id_of("alice"), Some("conn-2".to_string()));
    }

    #[test]
    fn unregister_only_clears_matching_connection_id() {
        let reg = Registry::new();
        reg.register("alice", "conn-1", false, |_| false).unwrap();
        assert!(!reg.unregister("alice", "conn-stale"));
        assert_eq!(reg.connection_id_of("alice"), Some("conn-1".to_string()));
        assert!(reg.unregister("alice", "conn-1"));
        assert_eq!(reg.connection_id_of("alice"), None);
    }

    #[test]
    fn active_names_preserve_insertion_order() {
        let reg = Registry::new();
        reg.register("carol", "c", false, |_| false).unwrap();
        reg.register("alice", "a", false, |_| false).unwrap();
        reg.register("bob", "b", false, |_| false).unwrap();
        assert_eq!(reg.active_names(), vec!["carol", "alice", "bob"]);
    }

    #[test]
    fn record_persists_after_unregister_for_resume() {
        let reg = Registry::new();
        reg.register("alice", "conn-1", false, |_| false).unwrap();
        reg.unregister("alice", "conn-1");
        assert!(reg.get("alice").is_some());
        assert!(reg.active_names().is_empty());
    }
}
