//! CDP plumbing
//!
//! Transport, connection/session management, and the hand-written
//! protocol types.

pub mod connection;
pub mod transport;
pub mod types;

pub use connection::{Connection, ProtocolEvent, Session};
pub use transport::{Transport, TransportEvent, WebSocketTransport};
