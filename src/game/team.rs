//! Teams: registration data, play progress, completions, trophies.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::core::hash::{hash_text, ContentHash};
use crate::core::time::{Seconds, Timestamp};
use crate::game::scoring::ScoringConfig;

/// A named award with a point value, attachable to a team at the
/// operator's discretion. The available set is configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trophy {
    /// Unique trophy name.
    pub name: String,
    /// Operator-facing description.
    pub description: String,
    /// Points added to the team score.
    pub points: i64,
    /// Image asset consumed by the GUI collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_filename: Option<String>,
}

/// One validated cubebox, recorded with the timestamps produced by that
/// cubebox. `win_timestamp` is strictly after `start_timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletedCube {
    /// Which cube was completed.
    pub cube_id: u8,
    /// Cubebox-local play start.
    pub start_timestamp: Timestamp,
    /// Cubebox-local button press.
    pub win_timestamp: Timestamp,
}

impl CompletedCube {
    /// Play duration on the cubebox's clock.
    pub fn completion_time(&self) -> Seconds {
        self.win_timestamp - self.start_timestamp
    }
}

/// A registered team and everything the game knows about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamStatus {
    /// Unique team name (registration key).
    pub name: String,
    /// Free-form display name chosen at the desk.
    #[serde(default)]
    pub custom_name: String,
    /// The team's badge uid (unique among live teams).
    pub rfid_uid: String,
    /// Allotted playing time in seconds.
    pub max_time_sec: Seconds,
    /// When the desk registered the team.
    pub creation_timestamp: Timestamp,
    /// First cube-assignment time; never changes once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<Timestamp>,
    /// Set when the team's run ends (timeout or archiving).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<Timestamp>,
    /// Cube the team is playing right now, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_cubebox_id: Option<u8>,
    /// Validated cubes, in completion order; cube ids pairwise distinct.
    #[serde(default)]
    pub completed_cubeboxes: Vec<CompletedCube>,
    /// Names of trophies awarded by the operator.
    #[serde(default)]
    pub trophies_names: BTreeSet<String>,
    /// Ring the alarm when this team's time runs out.
    #[serde(default)]
    pub use_alarm: bool,
}

impl TeamStatus {
    /// A freshly registered team: no start, no completions.
    pub fn new(
        name: impl Into<String>,
        rfid_uid: impl Into<String>,
        max_time_sec: Seconds,
        creation_timestamp: Timestamp,
    ) -> Self {
        Self {
            name: name.into(),
            custom_name: String::new(),
            rfid_uid: rfid_uid.into(),
            max_time_sec,
            creation_timestamp,
            start_timestamp: None,
            end_timestamp: None,
            current_cubebox_id: None,
            completed_cubeboxes: Vec::new(),
            trophies_names: BTreeSet::new(),
            use_alarm: false,
        }
    }

    /// Whether this team already validated `cube_id`.
    pub fn has_completed(&self, cube_id: u8) -> bool {
        self.completed_cubeboxes.iter().any(|c| c.cube_id == cube_id)
    }

    /// Record a validated cube. Rejects duplicate cube ids and
    /// non-increasing timestamps, leaving the team untouched.
    pub fn complete_cube(
        &mut self,
        cube_id: u8,
        start_timestamp: Timestamp,
        win_timestamp: Timestamp,
    ) -> bool {
        if self.has_completed(cube_id) || win_timestamp <= start_timestamp {
            return false;
        }
        self.completed_cubeboxes.push(CompletedCube {
            cube_id,
            start_timestamp,
            win_timestamp,
        });
        true
    }

    /// Drop the current cube assignment without recording a completion
    /// (the team walked away or was timed out).
    pub fn resign_current_cube(&mut self) {
        self.current_cubebox_id = None;
    }

    /// Whether the allotted time has fully elapsed at `now`.
    ///
    /// A non-positive `max_time_sec` means the clock expires the moment
    /// the team is first assigned a cube.
    pub fn is_time_up(&self, now: Timestamp) -> bool {
        match self.start_timestamp {
            Some(start) => now - start >= self.max_time_sec.max(0.0),
            None => false,
        }
    }

    /// Seconds left on the clock at `now` (zero once up, `None` before
    /// the first assignment).
    pub fn remaining_time(&self, now: Timestamp) -> Option<Seconds> {
        let start = self.start_timestamp?;
        Some((start + self.max_time_sec - now).max(0.0))
    }

    /// When the clock runs out, once the team has started.
    pub fn deadline(&self) -> Option<Timestamp> {
        Some(self.start_timestamp? + self.max_time_sec)
    }

    /// Total score: completed cubes plus trophy points. Trophy names not
    /// present in `defined_trophies` are worth nothing.
    pub fn score(&self, scoring: &ScoringConfig, defined_trophies: &[Trophy]) -> i64 {
        let boxes: i64 = self
            .completed_cubeboxes
            .iter()
            .map(|c| scoring.cube_score(c.cube_id, c.completion_time()))
            .sum();
        let trophies: i64 = self
            .trophies_names
            .iter()
            .filter_map(|name| defined_trophies.iter().find(|t| &t.name == name))
            .map(|t| t.points)
            .sum();
        boxes + trophies
    }

    /// Canonical JSON used for replication payloads and hashing.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("team status serializes")
    }

    /// Parse a replication payload.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Content hash of the canonical JSON.
    pub fn hash(&self) -> ContentHash {
        hash_text(&self.to_json())
    }
}

/// The live teams, keyed by unique name. Names and badge uids are both
/// unique across the list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TeamsList {
    teams: BTreeMap<String, TeamStatus>,
}

impl TeamsList {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a team. Fails if the name or the badge uid is already live.
    pub fn add(&mut self, team: TeamStatus) -> bool {
        if self.teams.contains_key(&team.name) || self.by_rfid_uid(&team.rfid_uid).is_some() {
            return false;
        }
        self.teams.insert(team.name.clone(), team);
        true
    }

    /// Remove a team by name; returns the removed entry.
    pub fn remove(&mut self, name: &str) -> Option<TeamStatus> {
        self.teams.remove(name)
    }

    /// Replace a team's entry (keyed by its name).
    pub fn update(&mut self, team: TeamStatus) -> bool {
        match self.teams.get_mut(&team.name) {
            Some(slot) => {
                *slot = team;
                true
            }
            None => false,
        }
    }

    /// Borrow by name.
    pub fn by_name(&self, name: &str) -> Option<&TeamStatus> {
        self.teams.get(name)
    }

    /// Mutably borrow by name.
    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut TeamStatus> {
        self.teams.get_mut(name)
    }

    /// Borrow by badge uid.
    pub fn by_rfid_uid(&self, uid: &str) -> Option<&TeamStatus> {
        self.teams.values().find(|t| t.rfid_uid == uid)
    }

    /// Mutably borrow by badge uid.
    pub fn by_rfid_uid_mut(&mut self, uid: &str) -> Option<&mut TeamStatus> {
        self.teams.values_mut().find(|t| t.rfid_uid == uid)
    }

    /// The team currently playing `cube_id`, if any.
    pub fn by_current_cube(&self, cube_id: u8) -> Option<&TeamStatus> {
        self.teams.values().find(|t| t.current_cubebox_id == Some(cube_id))
    }

    /// Iterate in name order.
    pub fn iter(&self) -> impl Iterator<Item = &TeamStatus> {
        self.teams.values()
    }

    /// Mutable iteration in name order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TeamStatus> {
        self.teams.values_mut()
    }

    /// Number of live teams.
    pub fn len(&self) -> usize {
        self.teams.len()
    }

    /// Whether no team is live.
    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }

    /// Per-team content hashes, for hash-diff replication.
    pub fn hash_dict(&self) -> BTreeMap<String, ContentHash> {
        self.teams
            .iter()
            .map(|(name, team)| (name.clone(), team.hash()))
            .collect()
    }

    /// Hash of the whole list.
    pub fn hash(&self) -> ContentHash {
        hash_text(&serde_json::to_string(self).expect("teams list serializes"))
    }

    /// Replace the whole list (replication). Idempotent.
    pub fn update_from(&mut self, other: &TeamsList) {
        self.teams = other.teams.clone();
    }
}
