//! LED-matrix daemon IPC.
//!
//! The renderer is a separate daemon listening on localhost UDP. The text
//! framing is fixed for compatibility with it: slots are joined with `|`,
//! and inside a slot `#` separates the matrix id from the content while
//! `>` separates the content fields:
//!
//! ```text
//! 0#Paris>1717171717>3600|1#>>
//! ```
//!
//! An empty field means "no value"; a slot with neither timer nor team is
//! blank. This module is the only place that knows the framing.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::core::time::{Seconds, Timestamp};

/// Daemon's listening port on localhost.
pub const RGB_DAEMON_PORT: u16 = 5006;

/// Separator between slots.
pub const SLOT_SEPARATOR: char = '|';

/// Separator between the matrix id and the slot content.
pub const MATRIX_ID_SEPARATOR: char = '#';

/// Separator between the slot content fields.
pub const FIELD_SEPARATOR: char = '>';

/// What one matrix should display.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RgbContent {
    /// Team name shown above the clock, if configured.
    pub team_name: Option<String>,
    /// When the team's clock runs out.
    pub end_timestamp: Option<Timestamp>,
    /// Full allotted time, shown before the clock starts.
    pub max_time_sec: Option<Seconds>,
}

impl RgbContent {
    /// A slot with nothing to display.
    pub fn blank() -> Self {
        Self::default()
    }

    /// Whether the slot displays nothing.
    pub fn is_blank(&self) -> bool {
        self.team_name.is_none() && self.end_timestamp.is_none() && self.max_time_sec.is_none()
    }
}

/// Contents for every display slot, keyed by matrix id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RgbContentMap {
    slots: BTreeMap<u8, RgbContent>,
}

impl RgbContentMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a slot's content.
    pub fn set(&mut self, matrix_id: u8, content: RgbContent) {
        self.slots.insert(matrix_id, content);
    }

    /// Borrow a slot's content.
    pub fn get(&self, matrix_id: u8) -> Option<&RgbContent> {
        self.slots.get(&matrix_id)
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the map has no slots at all.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Wire line consumed by the daemon.
    pub fn to_line(&self) -> String {
        let mut slots = Vec::with_capacity(self.slots.len());
        for (matrix_id, content) in &self.slots {
            let name = content.team_name.as_deref().unwrap_or("");
            let end = content
                .end_timestamp
                .map(|t| t.to_string())
                .unwrap_or_default();
            let max = content
                .max_time_sec
                .map(|t| t.to_string())
                .unwrap_or_default();
            slots.push(format!(
                "{matrix_id}{MATRIX_ID_SEPARATOR}{name}{FIELD_SEPARATOR}{end}{FIELD_SEPARATOR}{max}"
            ));
        }
        slots.join(&SLOT_SEPARATOR.to_string())
    }

    /// Parse a wire line. Slots that do not parse are skipped; the
    /// historical two-field form (no max time) is accepted.
    pub fn parse(line: &str) -> Self {
        let mut map = Self::new();
        for slot in line.split(SLOT_SEPARATOR) {
            let Some((id, rest)) = slot.split_once(MATRIX_ID_SEPARATOR) else {
                continue;
            };
            let Ok(matrix_id) = id.parse::<u8>() else {
                continue;
            };
            let mut fields = rest.split(FIELD_SEPARATOR);
            let name = fields.next().unwrap_or("");
            let end = fields.next().and_then(|v| v.parse::<Timestamp>().ok());
            let max = fields.next().and_then(|v| v.parse::<Seconds>().ok());
            map.set(
                matrix_id,
                RgbContent {
                    team_name: (!name.is_empty()).then(|| name.to_string()),
                    end_timestamp: end,
                    max_time_sec: max,
                },
            );
        }
        map
    }
}

/// Fire-and-forget sender towards the local daemon.
pub struct RgbClient {
    socket: UdpSocket,
    daemon_addr: SocketAddr,
}

impl RgbClient {
    /// Bind an ephemeral localhost socket towards the daemon's port.
    pub async fn connect() -> std::io::Result<Self> {
        Self::connect_to(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            RGB_DAEMON_PORT,
        ))
        .await
    }

    /// Bind towards an explicit daemon address (tests).
    pub async fn connect_to(daemon_addr: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        Ok(Self { socket, daemon_addr })
    }

    /// Push the full slot map to the daemon.
    pub async fn update(&self, contents: &RgbContentMap) {
        let line = contents.to_line();
        match self.socket.send_to(line.as_bytes(), self.daemon_addr).await {
            Ok(_) => debug!(line = %line, "rgb update sent"),
            Err(e) => warn!(error = %e, "rgb daemon unreachable"),
        }
    }
}
