//! Stable, transport-independent error kinds.
//!
//! `RelayError` is the typed surface callers branch on (does this close the
//! connection? does it become a NACK or an ERROR?). Anywhere that distinction
//! doesn't matter, `anyhow::Result` is used instead, as elsewhere in this
//! codebase.

use std::fmt;

/// One of the stable error kinds from the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    UnknownRecipient,
    ResumeTooOld,
    HeartbeatTimeout,
    InjectionTimeout,
    FrameTooLarge,
    Internal,
}

impl ErrorKind {
    /// The machine-readable code sent on the wire.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::UnknownRecipient => "UNKNOWN_RECIPIENT",
            Self::ResumeTooOld => "RESUME_TOO_OLD",
            Self::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            Self::InjectionTimeout => "INJECTION_TIMEOUT",
            Self::FrameTooLarge => "FRAME_TOO_LARGE",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether this kind closes the offending Connection.
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::BadRequest | Self::HeartbeatTimeout | Self::FrameTooLarge
        )
    }
}

/// A relay-level error carrying both a stable kind and a human message.
#[derive(Debug, Clone)]
pub struct RelayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RelayError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    #[must_use]
    pub fn unknown_recipient(name: &str) -> Self {
        Self::new(
            ErrorKind::UnknownRecipient,
            format!("no agent or channel named '{name}'"),
        )
    }

    #[must_use]
    pub fn resume_too_old() -> Self {
        Self::new(
            ErrorKind::ResumeTooOld,
            "resume token unknown or rebinds to a different agent",
        )
    }

    #[must_use]
    pub fn heartbeat_timeout() -> Self {
        Self::new(ErrorKind::HeartbeatTimeout, "no PONG observed in time")
    }

    #[must_use]
    pub fn injection_timeout() -> Self {
        Self::new(
            ErrorKind::InjectionTimeout,
            "PTY did not reach quiescence before the envelope deadline",
        )
    }

    #[must_use]
    pub fn frame_too_large(max: u32) -> Self {
        Self::new(
            ErrorKind::FrameTooLarge,
            format!("frame exceeds max_frame_bytes ({max})"),
        )
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Builds the wire-level ERROR envelope for this error.
    #[must_use]
    pub fn to_envelope(&self) -> crate::envelope::Envelope {
        crate::envelope::Envelope::error(self.kind.code(), self.message.clone(), self.kind.is_fatal())
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for RelayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds_match_the_error_table() {
        assert!(ErrorKind::BadRequest.is_fatal());
        assert!(ErrorKind::HeartbeatTimeout.is_fatal());
        assert!(ErrorKind::FrameTooLarge.is_fatal());
        assert!(!ErrorKind::UnknownRecipient.is_fatal());
        assert!(!ErrorKind::ResumeTooOld.is_fatal());
        assert!(!ErrorKind::InjectionTimeout.is_fatal());
        assert!(!ErrorKind::Internal.is_fatal());
    }

    #[test]
    fn envelope_carries_fatal_flag() {
        let err = RelayError::bad_request("name in use");
        let env = err.to_envelope();
        assert_eq!(env.payload["fatal"], true);
        assert_eq!(env.payload["code"], "BAD_REQUEST");
    }
}
