//! Quiescence as an observable event stream, not a poll (§9 design note).
//!
//! The detector is fed every chunk of PTY output as it arrives; it owns no
//! timer of its own beyond deriving "quiescent" from the wall-clock gap since
//! the last byte. [`QuiescenceDetector::poll_transition`] is called by the
//! supervisor's periodic tick and returns a transition only on an edge, so
//! consumers (the injector) never have to deduplicate repeated states
//! themselves.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuiescenceState {
    Busy,
    Quiescent,
}

/// An edge in the quiescence state, emitted at most once per transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuiescenceEdge {
    BecameQuiescent,
    BecameBusy,
}

#[derive(Debug)]
pub struct QuiescenceDetector {
    idle_threshold: Duration,
    last_output_at: Instant,
    state: QuiescenceState,
}

impl QuiescenceDetector {
    #[must_use]
    pub fn new(idle_threshold: Duration) -> Self {
        Self {
            idle_threshold,
            last_output_at: Instant::now(),
            // A freshly-spawned child hasn't produced output yet; treat it as
            // quiescent once `idle_threshold` has elapsed, same as any other gap.
            state: QuiescenceState::Quiescent,
        }
    }

    /// Call on every chunk of output observed from the child. Immediately
    /// transitions to Busy and resets the idle clock.
    pub fn record_output(&mut self) -> Option<QuiescenceEdge> {
        self.last_output_at = Instant::now();
        if self.state == QuiescenceState::Quiescent {
            self.state = QuiescenceState::Busy;
            Some(QuiescenceEdge::BecameBusy)
        } else {
            None
        }
    }

    /// Call periodically (the supervisor's tick). Returns `Some` only the
    /// instant the idle threshold is crossed — an edge, not a level.
    pub fn poll_transition(&mut self) -> Option<QuiescenceEdge> {
        if self.state == QuiescenceState::Busy
            && self.last_output_at.elapsed() >= self.idle_threshold
        {
            self.state = QuiescenceState::Quiescent;
            return Some(QuiescenceEdge::BecameQuiescent);
        }
        None
    }

    #[must_use]
    pub fn state(&self) -> QuiescenceState {
        self.state
    }

    /// Whether the child has been silent for at least `idle_threshold`,
    /// independent of whether `poll_transition` has been called recently.
    /// This is the predicate the injector checks before writing (§8 inv. 4).
    #[must_use]
    pub fn is_quiescent_now(&self) -> bool {
        self.last_output_at.elapsed() >= self.idle_threshold
    }
}
