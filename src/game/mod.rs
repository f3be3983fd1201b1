//! Game-state model: teams, cubeboxes, scoring, and the authoritative
//! [`GameStatus`](status::GameStatus) snapshot.
//!
//! Everything here is pure data: no sockets, no clocks. Nodes feed in
//! timestamps; the model never reads the wall clock itself.

pub mod cubebox;
pub mod scoring;
pub mod status;
pub mod team;

pub use cubebox::{CubeboxState, CubeboxStatus, CubeboxesStatusList};
pub use scoring::{Difficulty, ScoringConfig};
pub use status::GameStatus;
pub use team::{CompletedCube, TeamStatus, TeamsList, Trophy};
