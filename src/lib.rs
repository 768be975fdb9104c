// Library modules
pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod constants;
pub mod dedup;
pub mod env;
pub mod envelope;
pub mod error;
pub mod file_watcher;
pub mod framing;
pub mod injection;
pub mod message_log;
pub mod outbox;
pub mod protocol;
pub mod pty;
pub mod pty_control;
pub mod registry;
pub mod router;
pub mod snapshot;
pub mod socket_server;
pub mod supervisor;
pub mod uplink;
pub mod ws_server;

// Re-export commonly used types
pub use broker::Broker;
pub use config::Config;
pub use connection::{Connection, ConnectionState, EntityKind, Transport};
pub use envelope::{Envelope, EnvelopeKind};
pub use error::{ErrorKind, RelayError};
pub use message_log::MessageLog;
pub use outbox::OutboxWatcher;
pub use pty_control::PtyControlSocket;
pub use registry::Registry;
pub use router::Router;
pub use socket_server::SocketServer;
pub use supervisor::Supervisor;
pub use uplink::UplinkConfig;
pub use ws_server::WsServer;
