//! # Cubehall Coordinator
//!
//! Distributed coordination for the Cubehall escape-room attraction:
//! one Master, one Frontdesk, and up to twelve Cubebox puzzle controllers
//! exchanging typed messages over broadcast UDP.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      CUBEHALL CRATE                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Shared primitives                         │
//! │  ├── hash.rs     - SHA-256 content hashing (hex)             │
//! │  ├── nodes.rs    - Node identities and the node directory    │
//! │  ├── rfid.rs     - RFID lines and ingest feeds               │
//! │  └── time.rs     - Epoch-second timestamps and durations     │
//! │                                                              │
//! │  game/           - Game-state model (no I/O)                 │
//! │  ├── cubebox.rs  - Cubebox play state machine                │
//! │  ├── team.rs     - Teams, completions, trophies              │
//! │  ├── status.rs   - Authoritative GameStatus + hashing        │
//! │  └── scoring.rs  - Difficulty classes and score computation  │
//! │                                                              │
//! │  network/        - Wire protocol and transport               │
//! │  ├── message.rs  - Message catalogue and text codec          │
//! │  └── transport.rs- Broadcast UDP, ack/retry, node directory  │
//! │                                                              │
//! │  node/           - The three node state machines             │
//! │  ├── master.rs   - Authoritative coordinator                 │
//! │  ├── cubebox.rs  - Per-puzzle controller                     │
//! │  ├── frontdesk.rs- Registration and mirror node              │
//! │  └── prompt.rs   - Interactive console                       │
//! │                                                              │
//! │  io/             - Collaborator seams                        │
//! │  ├── sound.rs    - Sound player interface                    │
//! │  ├── button.rs   - Validation button interface               │
//! │  ├── rgb.rs      - LED-matrix daemon IPC                     │
//! │  └── archive.rs  - Finished-team SQLite archive              │
//! │                                                              │
//! │  config.rs       - Typed configuration view                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Protocol guarantee
//!
//! Every message serializes to a single UTF-8 line and parses back to an
//! equal message; its SHA-256 hex digest is the acknowledgement correlation
//! id. Handlers are idempotent, so the at-least-once delivery of the
//! ack/retry transport never corrupts game state.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod game;
pub mod io;
pub mod network;
pub mod node;

// Re-export commonly used types
pub use crate::config::Config;
pub use crate::core::nodes::{NodeName, NodesList};
pub use crate::core::time::{Seconds, Timestamp};
pub use crate::game::status::GameStatus;
pub use crate::network::message::{AckInfo, Message, MessageKind};
pub use crate::network::transport::{SendReport, Transport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Number of cubeboxes in the attraction
pub const CUBEBOX_COUNT: u8 = 12;

/// Well-known UDP port shared by all nodes
pub const DEFAULT_UDP_PORT: u16 = 5005;

/// Maximum UDP payload accepted on the wire (bytes)
pub const UDP_BUFSIZE: usize = 1024;
