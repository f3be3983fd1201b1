//! RFID lines and ingest feeds.
//!
//! A token read produces an [`RfidLine`]: the badge uid (exactly ten
//! decimal digits) plus the reader-local timestamp. The hardware reader is
//! a collaborator; the core consumes any [`RfidFeed`], and ships a
//! channel-backed feed that a serial listener or the keyboard fallback can
//! push into.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::time::Timestamp;

/// Length of a valid badge uid.
pub const UID_LENGTH: usize = 10;

/// One RFID read: uid + reader-local timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfidLine {
    /// Badge uid, ten decimal digits.
    pub uid: String,
    /// When the reader saw the badge (reader-local clock).
    pub timestamp: Timestamp,
}

impl RfidLine {
    /// Build a line; the uid is taken as-is and checked with [`Self::is_valid`].
    pub fn new(uid: impl Into<String>, timestamp: Timestamp) -> Self {
        Self { uid: uid.into(), timestamp }
    }

    /// A uid is valid iff it is exactly ten decimal digits.
    pub fn is_valid(&self) -> bool {
        self.uid.len() == UID_LENGTH && self.uid.chars().all(|c| c.is_ascii_digit())
    }
}

/// Pull side of an RFID ingest feed.
///
/// Readers push ordered, deduplicated lines; the cubebox node pulls them
/// one at a time.
pub struct RfidFeed {
    rx: mpsc::Receiver<RfidLine>,
}

/// Push side handed to the reader collaborator (or the console simulator).
#[derive(Clone)]
pub struct RfidInjector {
    tx: mpsc::Sender<RfidLine>,
}

impl RfidFeed {
    /// Create a feed and its injector.
    pub fn channel(capacity: usize) -> (RfidInjector, RfidFeed) {
        let (tx, rx) = mpsc::channel(capacity);
        (RfidInjector { tx }, RfidFeed { rx })
    }

    /// Wait for the next line. `None` after every injector is dropped.
    pub async fn next_line(&mut self) -> Option<RfidLine> {
        self.rx.recv().await
    }
}

impl RfidInjector {
    /// Push a read into the feed. Invalid lines are dropped at the source.
    pub async fn inject(&self, line: RfidLine) -> bool {
        if !line.is_valid() {
            tracing::debug!(uid = %line.uid, "dropping invalid rfid line");
            return false;
        }
        self.tx.send(line).await.is_ok()
    }
}
