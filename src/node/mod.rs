//! The three node state machines.
//!
//! Each node owns one [`Transport`](crate::network::transport::Transport)
//! endpoint and a set of cooperating tokio tasks: a message-dispatch loop
//! consuming the transport's application feed, plus the node-specific
//! producers and periodic loops. `run()` spawns everything; `stop()` flips
//! the shared shutdown channel and closes the transport, and every loop
//! exits at its next suspension point.

pub mod cubebox;
pub mod frontdesk;
pub mod master;
pub mod prompt;

pub use cubebox::CubeboxNode;
pub use frontdesk::FrontdeskNode;
pub use master::MasterNode;
pub use prompt::{Prompt, PromptView};

use std::time::Duration;

use crate::core::nodes::NodeName;

/// Presence beacon period, shared by every node.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Poll period of the periodic loops (timeout detection, status diff).
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The transport is bound under a name that does not fit the node role
/// being constructed.
#[derive(Debug, thiserror::Error)]
#[error("transport is bound as {actual}, expected {expected}")]
pub struct NodeRoleError {
    /// What the constructor needed.
    pub expected: &'static str,
    /// What the transport was bound as.
    pub actual: NodeName,
}
