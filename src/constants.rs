//! Cross-cutting constants that don't belong to one owning module.
//!
//! Most timing and sizing constants live next to the code that uses them
//! (`supervisor::SWEEP_INTERVAL`, `dedup::DEFAULT_DEDUP_CAPACITY`,
//! `framing::LEN_PREFIX`, and so on). What's left here is identity and the
//! defaults `main` wires into its CLI flags.

/// User-Agent header sent on the outbound cloud uplink connection.
pub fn user_agent() -> String {
    format!("agent-relay/{}", env!("CARGO_PKG_VERSION"))
}

/// Default local socket filename under the state directory (§6).
pub const DEFAULT_SOCKET_NAME: &str = "relay.sock";

/// Default bind port for the optional listening WebSocket transport.
pub const DEFAULT_WS_PORT: u16 = 8787;
