//! C4 — message log & resume store.
//!
//! Append-only, bounded, single-writer. Every envelope the Router commits to
//! deliver is logged here before the deliver attempt, so the log can answer
//! inbox/channel-backlog queries and seed resumed sessions' high-water marks.
//! Not a durable archive: retention is bounded by entry count with an age
//! cutoff as the secondary bound (see the Open Questions resolution in
//! DESIGN.md), and nothing here survives a process restart.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::dedup::StreamKey;

/// Default number of entries retained before the oldest are evicted.
pub const DEFAULT_MAX_ENTRIES: usize = 50_000;

/// Default age, in milliseconds, past which an entry is evicted regardless
/// of how many free slots remain (24 hours).
pub const DEFAULT_MAX_AGE_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Acked,
    Failed,
}

#[derive(Debug, Clone)]
pub struct MessageLogEntry {
    pub envelope_id: String,
    pub ts_ms: u64,
    pub from: Option<String>,
    pub to: String,
    pub kind: String,
    pub body: String,
    pub thread_id: Option<String>,
    pub topic: Option<String>,
    pub is_broadcast: bool,
    pub status: DeliveryStatus,
    pub seq: Option<u64>,
}

/// Resume-session record seeded by HELLO's `session.resume_token` and
/// consulted by `byResumeToken`.
#[derive(Debug, Clone, Default)]
pub struct ResumeRecord {
    pub session_id: String,
    pub agent_name: String,
    pub high_water: HashMap<StreamKey, u64>,
}

#[derive(Debug, Default)]
struct LogInner {
    entries: VecDeque<MessageLogEntry>,
    sessions: HashMap<String, ResumeRecord>,
}

/// Append-only message log with bounded retention.
#[derive(Debug)]
pub struct MessageLog {
    max_entries: usize,
    max_age_ms: u64,
    inner: Mutex<LogInner>,
}

impl MessageLog {
    #[must_use]
    pub fn new(max_entries: usize, max_age_ms: u64) -> Self {
        Self {
            max_entries: max_entries.max(1),
            max_age_ms,
            inner: Mutex::new(LogInner::default()),
        }
    }

    /// Appends an entry, evicting the oldest entries once over capacity or age.
    pub fn append(&self, entry: MessageLogEntry) {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let mut inner = self.inner.lock().unwrap();
        inner.entries.push_back(entry);
        self.evict(&mut inner);
    }

    fn evict(&self, inner: &mut LogInner) {
        while inner.entries.len() > self.max_entries {
            inner.entries.pop_front();
        }
        if self.max_age_ms > 0 {
            let cutoff = now_ms().saturating_sub(self.max_age_ms);
            while inner
                .entries
                .front()
                .is_some_and(|e| e.ts_ms < cutoff)
            {
                inner.entries.pop_front();
            }
        }
    }

    /// Updates the delivery status of the entry matching `envelope_id`, if present.
    pub fn mark_status(&self, envelope_id: &str, status: DeliveryStatus) {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner
            .entries
            .iter_mut()
            .rev()
            .find(|e| e.envelope_id == envelope_id)
        {
            entry.status = status;
        }
    }

    /// Entries addressed to `name`, optionally only those after `since` (ms),
    /// most-recent-last, capped at `limit`.
    #[must_use]
    pub fn by_recipient(
        &self,
        name: &str,
        since_ms: Option<u64>,
        limit: Option<usize>,
    ) -> Vec<MessageLogEntry> {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let inner = self.inner.lock().unwrap();
        collect(
            inner.entries.iter().filter(|e| e.to == name),
            since_ms,
            limit,
        )
    }

    /// Entries addressed to channel `channel`, same semantics as `by_recipient`.
    #[must_use]
    pub fn by_channel(
        &self,
        channel: &str,
        since_ms: Option<u64>,
        limit: Option<usize>,
    ) -> Vec<MessageLogEntry> {
        self.by_recipient(channel, since_ms, limit)
    }

    /// Entries sharing a thread id.
    #[must_use]
    pub fn by_thread(&self, thread_id: &str) -> Vec<MessageLogEntry> {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .filter(|e| e.thread_id.as_deref() == Some(thread_id))
            .cloned()
            .collect()
    }

    /// Records (or replaces) the resume-session record for `resume_token`.
    pub fn put_session(&self, resume_token: &str, record: ResumeRecord) {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert(resume_token.to_string(), record);
    }

    /// Looks up the resume-session record for a presented resume token.
    #[must_use]
    pub fn by_resume_token(&self, resume_token: &str) -> Option<ResumeRecord> {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(resume_token)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.inner.lock().unwrap().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_AGE_MS)
    }
}

fn collect<'a>(
    iter: impl Iterator<Item = &'a MessageLogEntry>,
    since_ms: Option<u64>,
    limit: Option<usize>,
) -> Vec<MessageLogEntry> {
    let mut out: Vec<MessageLogEntry> = iter
        .filter(|e| match since_ms {
            Some(s) => e.ts_ms > s,
            None => true,
        })
        .cloned()
        .collect();
    if let Some(limit) = limit {
        let start = out.len().saturating_sub(limit);
        out = out.split_off(start);
    }
    out
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(to: &str, id: &str, seq: u64) -> MessageLogEntry {
        MessageLogEntry {
            envelope_id: id.to_string(),
            ts_ms: now_ms(),
            from: Some("alice".to_string()),
            to: to.to_string(),
            kind: "DELIVER".to_string(),
            body: "hi".to_string(),
            thread_id: None,
            topic: Some("default".to_string()),
            is_broadcast: false,
            status: DeliveryStatus::Pending,
            seq: Some(seq),
        }
    }

    #[test]
    fn by_recipient_filters_and_orders() {
        let log = MessageLog::default();
        log.append(entry("bob", "1", 1));
        log.append(entry("carol", "2", 1));
        log.append(entry("bob", "3", 2));
        let bob_entries = log.by_recipient("bob", None, None);
        assert_eq!(bob_entries.len(), 2);
        assert_eq!(bob_entries[0].envelope_id, "1");
        assert_eq!(bob_entries[1].envelope_id, "3");
    }

    #[test]
    fn eviction_bounds_total_entries() {
        let log = MessageLog::new(3, 0);
        for i in 0..10 {
            log.append(entry("bob", &i.to_string(), i));
        }
        assert_eq!(log.len(), 3);
        let remaining = log.by_recipient("bob", None, None);
        assert_eq!(remaining[0].envelope_id, "7");
    }

    #[test]
    fn resume_token_round_trips_high_water_marks() {
        let log = MessageLog::default();
        let mut high_water = HashMap::new();
        high_water.insert(("default".to_string(), "alice".to_string()), 5u64);
        log.put_session(
            "token-1",
            ResumeRecord {
                session_id: "sess-1".to_string(),
                agent_name: "bob".to_string(),
                high_water,
            },
        );
        let record = log.by_resume_token("token-1").unwrap();
        assert_eq!(record.agent_name, "bob");
        assert_eq!(
            record.high_water[&("default".to_string(), "alice".to_string())],
            5
        );
    }

    #[test]
    fn mark_status_updates_most_recent_matching_entry() {
        let log = MessageLog::default();
        log.append(entry("bob", "dup", 1));
        log.mark_status("dup", DeliveryStatus::Delivered);
        let entries = log.by_recipient("bob", None, None);
        assert!(matches!(entries[0].status, DeliveryStatus::Delivered));
    }
}
