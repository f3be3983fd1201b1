//! Difficulty classes and score computation.
//!
//! Each cube belongs to a difficulty class by id; each class has a
//! reference time. A completion at or under the reference time earns the
//! full score; past it, the score decays linearly at a third of the
//! overtime and bottoms out at zero. The parameters ship with defaults but
//! live in configuration, because they have historically varied between
//! installations.

use serde::{Deserialize, Serialize};

use crate::core::time::Seconds;

/// Difficulty class of a cubebox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    /// Cubes 1–4.
    Easy,
    /// Cubes 5–8.
    Medium,
    /// Cubes 9–12.
    Hard,
}

impl Difficulty {
    /// Class of a cube id (1..=12).
    pub fn of_cube(cube_id: u8) -> Self {
        match cube_id {
            1..=4 => Self::Easy,
            5..=8 => Self::Medium,
            _ => Self::Hard,
        }
    }
}

/// Tunable scoring parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Full score awarded at or under the reference time.
    pub max_score: i64,
    /// Reference time for Easy cubes (seconds).
    pub easy_ref_sec: Seconds,
    /// Reference time for Medium cubes (seconds).
    pub medium_ref_sec: Seconds,
    /// Reference time for Hard cubes (seconds).
    pub hard_ref_sec: Seconds,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            max_score: 300,
            easy_ref_sec: 300.0,
            medium_ref_sec: 480.0,
            hard_ref_sec: 720.0,
        }
    }
}

impl ScoringConfig {
    /// Reference time for a difficulty class.
    pub fn reference_time(&self, difficulty: Difficulty) -> Seconds {
        match difficulty {
            Difficulty::Easy => self.easy_ref_sec,
            Difficulty::Medium => self.medium_ref_sec,
            Difficulty::Hard => self.hard_ref_sec,
        }
    }

    /// Score for completing `cube_id` in `completion_time` seconds.
    pub fn cube_score(&self, cube_id: u8, completion_time: Seconds) -> i64 {
        let t_ref = self.reference_time(Difficulty::of_cube(cube_id));
        if completion_time <= t_ref {
            self.max_score
        } else {
            let decayed = (t_ref - (completion_time - t_ref) / 3.0).floor() as i64;
            decayed.max(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_by_cube_id() {
        assert_eq!(Difficulty::of_cube(1), Difficulty::Easy);
        assert_eq!(Difficulty::of_cube(4), Difficulty::Easy);
        assert_eq!(Difficulty::of_cube(5), Difficulty::Medium);
        assert_eq!(Difficulty::of_cube(8), Difficulty::Medium);
        assert_eq!(Difficulty::of_cube(9), Difficulty::Hard);
        assert_eq!(Difficulty::of_cube(12), Difficulty::Hard);
    }

    #[test]
    fn test_full_score_under_reference() {
        let cfg = ScoringConfig::default();
        assert_eq!(cfg.cube_score(1, 30.0), 300);
        assert_eq!(cfg.cube_score(5, 479.9), 300);
        assert_eq!(cfg.cube_score(12, 1.0), 300);
    }

    #[test]
    fn test_full_score_at_exact_reference() {
        let cfg = ScoringConfig::default();
        assert_eq!(cfg.cube_score(2, 300.0), 300);
        assert_eq!(cfg.cube_score(6, 480.0), 300);
        assert_eq!(cfg.cube_score(10, 720.0), 300);
    }

    #[test]
    fn test_decay_past_reference() {
        let cfg = ScoringConfig::default();
        // Easy, 30 s overtime: 300 - 30/3 = 290.
        assert_eq!(cfg.cube_score(3, 330.0), 290);
        // Floor applies.
        assert_eq!(cfg.cube_score(3, 301.0), 299);
    }

    #[test]
    fn test_clamped_at_zero() {
        let cfg = ScoringConfig::default();
        // Easy: score hits zero at 300 + 3*300 = 1200 s of play.
        assert_eq!(cfg.cube_score(1, 1200.0), 0);
        assert_eq!(cfg.cube_score(1, 100_000.0), 0);
    }

    #[test]
    fn test_config_overrides() {
        let cfg = ScoringConfig { max_score: 100, easy_ref_sec: 60.0, ..Default::default() };
        assert_eq!(cfg.cube_score(1, 60.0), 100);
        assert_eq!(cfg.cube_score(1, 63.0), 59);
    }
}
