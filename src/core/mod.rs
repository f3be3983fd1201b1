//! Shared primitives used by every node.
//!
//! Everything in this module is deterministic and I/O-free except the
//! wall-clock helpers in [`time`].

pub mod hash;
pub mod nodes;
pub mod rfid;
pub mod time;

pub use hash::ContentHash;
pub use nodes::{NodeInfo, NodeName, NodesList};
pub use rfid::RfidLine;
pub use time::{Seconds, Timestamp};
