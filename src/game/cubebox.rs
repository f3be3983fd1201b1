//! Cubebox play state and the twelve-slot status list.
//!
//! A cubebox cycles through three states:
//!
//! ```text
//! WaitingForReset ──resetter badge / master reset──► ReadyToPlay
//! ReadyToPlay     ──accepted team badge────────────► Playing
//! Playing         ──accepted long press / order────► WaitingForReset
//! ```
//!
//! Boot state is `WaitingForReset`: a staff member (or the Master) must
//! arm the box before the first team can play it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::hash::{hash_text, ContentHash};
use crate::core::nodes::NodeName;
use crate::core::rfid::RfidLine;
use crate::core::time::{Seconds, Timestamp};
use crate::CUBEBOX_COUNT;

/// Play state of one cubebox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CubeboxState {
    /// Armed and waiting for a team badge.
    ReadyToPlay,
    /// A team is playing; the validation button is live.
    Playing,
    /// Needs a resetter badge (or a master order) before the next team.
    WaitingForReset,
}

/// Full state of one cubebox, replicated between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CubeboxStatus {
    /// Cube id in 1..=12.
    pub cube_id: u8,
    /// Current play state.
    pub state: CubeboxState,
    /// Team currently playing (Playing state only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_team_name: Option<String>,
    /// When the current (or just-finished) play started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<Timestamp>,
    /// When the box was last won; cleared on reset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win_timestamp: Option<Timestamp>,
    /// Last team badge the box accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_valid_rfid_line: Option<RfidLine>,
}

impl CubeboxStatus {
    /// Boot state for a cube id: `WaitingForReset`, nothing recorded.
    pub fn new(cube_id: u8) -> Self {
        Self {
            cube_id,
            state: CubeboxState::WaitingForReset,
            current_team_name: None,
            start_timestamp: None,
            win_timestamp: None,
            last_valid_rfid_line: None,
        }
    }

    /// Node name of the controller owning this cube.
    pub fn node_name(&self) -> NodeName {
        NodeName::CubeBox(self.cube_id)
    }

    /// Whether a team badge would currently be forwarded to the Master.
    pub fn is_ready_to_play(&self) -> bool {
        self.state == CubeboxState::ReadyToPlay
    }

    /// Whether a team is currently playing this box.
    pub fn is_playing(&self) -> bool {
        self.state == CubeboxState::Playing
    }

    /// Arm the box: clears every per-play field.
    pub fn set_ready_to_play(&mut self) {
        self.state = CubeboxState::ReadyToPlay;
        self.current_team_name = None;
        self.start_timestamp = None;
        self.win_timestamp = None;
        self.last_valid_rfid_line = None;
    }

    /// Start a play for `team_name` at `start_timestamp`.
    pub fn set_playing(
        &mut self,
        team_name: Option<String>,
        start_timestamp: Timestamp,
        rfid_line: Option<RfidLine>,
    ) {
        self.state = CubeboxState::Playing;
        self.current_team_name = team_name;
        self.start_timestamp = Some(start_timestamp);
        self.win_timestamp = None;
        if rfid_line.is_some() {
            self.last_valid_rfid_line = rfid_line;
        }
    }

    /// Record a win and park the box until reset.
    pub fn set_won(&mut self, win_timestamp: Timestamp) {
        self.state = CubeboxState::WaitingForReset;
        self.current_team_name = None;
        self.win_timestamp = Some(win_timestamp);
    }

    /// Park the box until reset without recording a win (abandonment,
    /// team deletion, timeout). Idempotent.
    pub fn set_waiting_for_reset(&mut self) {
        self.state = CubeboxState::WaitingForReset;
        self.current_team_name = None;
    }

    /// Time from play start to win, if both are recorded.
    pub fn completion_time(&self) -> Option<Seconds> {
        match (self.start_timestamp, self.win_timestamp) {
            (Some(start), Some(win)) => Some(win - start),
            _ => None,
        }
    }

    /// Canonical JSON used for replication payloads and hashing.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("cubebox status serializes")
    }

    /// Parse a replication payload.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Content hash of the canonical JSON.
    pub fn hash(&self) -> ContentHash {
        hash_text(&self.to_json())
    }

    /// Structural invariant used by tests and debug assertions:
    /// Playing requires a team and a start, and forbids a win timestamp.
    pub fn is_coherent(&self) -> bool {
        match self.state {
            CubeboxState::Playing => {
                self.start_timestamp.is_some() && self.win_timestamp.is_none()
            }
            CubeboxState::ReadyToPlay => {
                self.current_team_name.is_none()
                    && self.start_timestamp.is_none()
                    && self.win_timestamp.is_none()
            }
            CubeboxState::WaitingForReset => self.current_team_name.is_none(),
        }
    }
}

/// The twelve cubeboxes, indexed by cube id. Owned by the Master,
/// replicated at the Frontdesk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CubeboxesStatusList {
    boxes: Vec<CubeboxStatus>,
}

impl Default for CubeboxesStatusList {
    fn default() -> Self {
        Self::new()
    }
}

impl CubeboxesStatusList {
    /// All twelve boxes in boot state.
    pub fn new() -> Self {
        Self {
            boxes: (1..=CUBEBOX_COUNT).map(CubeboxStatus::new).collect(),
        }
    }

    /// Borrow a box by cube id.
    pub fn get(&self, cube_id: u8) -> Option<&CubeboxStatus> {
        self.boxes.get(usize::from(cube_id).checked_sub(1)?)
    }

    /// Mutably borrow a box by cube id.
    pub fn get_mut(&mut self, cube_id: u8) -> Option<&mut CubeboxStatus> {
        self.boxes.get_mut(usize::from(cube_id).checked_sub(1)?)
    }

    /// Replace one box's status (replication).
    pub fn update_from(&mut self, status: CubeboxStatus) -> bool {
        match self.get_mut(status.cube_id) {
            Some(slot) => {
                *slot = status;
                true
            }
            None => false,
        }
    }

    /// Iterate in cube-id order.
    pub fn iter(&self) -> impl Iterator<Item = &CubeboxStatus> {
        self.boxes.iter()
    }

    /// Per-cube content hashes, for hash-diff replication.
    pub fn hash_dict(&self) -> BTreeMap<u8, ContentHash> {
        self.boxes.iter().map(|b| (b.cube_id, b.hash())).collect()
    }

    /// Hash of the whole list.
    pub fn hash(&self) -> ContentHash {
        hash_text(&serde_json::to_string(self).expect("cubebox list serializes"))
    }

    /// Cube ids a new team could badge onto right now.
    pub fn free_cubes(&self) -> Vec<u8> {
        self.boxes
            .iter()
            .filter(|b| b.is_ready_to_play())
            .map(|b| b.cube_id)
            .collect()
    }
}
