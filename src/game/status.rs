//! The authoritative game snapshot: all teams plus all cubeboxes.
//!
//! The Master owns the single authoritative [`GameStatus`]; the Frontdesk
//! keeps a replica and reconciles it by comparing content hashes, so an
//! unchanged game costs one hash comparison and no full snapshot.

use serde::{Deserialize, Serialize};

use crate::core::hash::{hash_text, ContentHash};
use crate::game::cubebox::CubeboxesStatusList;
use crate::game::team::TeamsList;

/// Teams and cubeboxes, together. The content hash is a pure function of
/// the contents: teams are name-keyed and cubeboxes id-ordered, so the
/// hash never depends on insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameStatus {
    /// All twelve cubeboxes.
    pub cubeboxes: CubeboxesStatusList,
    /// The live teams.
    pub teams: TeamsList,
}

impl GameStatus {
    /// Fresh status: no teams, all boxes in boot state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical JSON used for full-snapshot replication and hashing.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("game status serializes")
    }

    /// Parse a full-snapshot payload.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Content hash over the canonical JSON.
    pub fn hash(&self) -> ContentHash {
        hash_text(&self.to_json())
    }

    /// Replace both lists from another snapshot. Idempotent.
    pub fn update_from(&mut self, other: &GameStatus) {
        self.teams.update_from(&other.teams);
        self.cubeboxes = other.cubeboxes.clone();
    }

    /// Cross-entity invariant check used by tests: every Playing cube
    /// names a live team whose `current_cubebox_id` points back at it,
    /// and no team points at a cube that is not Playing.
    pub fn is_coherent(&self) -> bool {
        for cube in self.cubeboxes.iter() {
            if !cube.is_coherent() {
                return false;
            }
            if cube.is_playing() {
                let Some(team_name) = cube.current_team_name.as_deref() else {
                    return false;
                };
                match self.teams.by_name(team_name) {
                    Some(team) if team.current_cubebox_id == Some(cube.cube_id) => {}
                    _ => return false,
                }
            }
        }
        for team in self.teams.iter() {
            if let Some(cube_id) = team.current_cubebox_id {
                match self.cubeboxes.get(cube_id) {
                    Some(cube) if cube.is_playing() => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::team::TeamStatus;

    #[test]
    fn test_hash_is_content_pure() {
        let mut a = GameStatus::new();
        let mut b = GameStatus::new();
        assert_eq!(a.hash(), b.hash());

        // Insertion order does not matter: teams are name-keyed.
        a.teams.add(TeamStatus::new("Paris", "1234567890", 3600.0, 0.0));
        a.teams.add(TeamStatus::new("Lyon", "0987654321", 3600.0, 0.0));
        b.teams.add(TeamStatus::new("Lyon", "0987654321", 3600.0, 0.0));
        b.teams.add(TeamStatus::new("Paris", "1234567890", 3600.0, 0.0));
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_hash_changes_with_content() {
        let mut status = GameStatus::new();
        let before = status.hash();
        status.cubeboxes.get_mut(1).unwrap().set_ready_to_play();
        assert_ne!(status.hash(), before);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut status = GameStatus::new();
        status.teams.add(TeamStatus::new("Paris", "1234567890", 3650.0, 10.0));
        status.cubeboxes.get_mut(3).unwrap().set_ready_to_play();

        let back = GameStatus::from_json(&status.to_json()).unwrap();
        assert_eq!(back, status);
        assert_eq!(back.hash(), status.hash());
    }

    #[test]
    fn test_update_from_idempotent() {
        let mut src = GameStatus::new();
        src.teams.add(TeamStatus::new("Paris", "1234567890", 3600.0, 0.0));
        src.cubeboxes.get_mut(2).unwrap().set_ready_to_play();

        let mut dst = GameStatus::new();
        dst.update_from(&src);
        let once = dst.clone();
        dst.update_from(&src);
        assert_eq!(dst, once);
        assert_eq!(dst.hash(), src.hash());
    }

    #[test]
    fn test_coherence_detects_dangling_relation() {
        let mut status = GameStatus::new();
        assert!(status.is_coherent());

        let mut team = TeamStatus::new("Paris", "1234567890", 3600.0, 0.0);
        team.current_cubebox_id = Some(4);
        status.teams.add(team);
        // Cube 4 is not Playing: incoherent.
        assert!(!status.is_coherent());

        status.cubeboxes.get_mut(4).unwrap().set_playing(
            Some("Paris".into()),
            100.0,
            None,
        );
        assert!(status.is_coherent());
    }
}
