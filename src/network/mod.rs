//! Wire protocol and transport.
//!
//! [`message`] defines the closed message catalogue, the one-line text
//! codec, and the typed payload layer. [`transport`] moves those messages
//! between nodes over broadcast UDP with optional acknowledge-and-retry.

pub mod message;
pub mod transport;

pub use message::{AckInfo, Message, MessageKind, Payload, ProtocolError};
pub use transport::{SendReport, Transport, TransportConfig, TransportError};
