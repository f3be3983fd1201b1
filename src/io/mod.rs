//! Collaborator seams: hardware and daemon interfaces consumed by the
//! nodes, kept behind traits so tests substitute fakes and deployments
//! substitute real drivers.

pub mod archive;
pub mod button;
pub mod rgb;
pub mod sound;

pub use archive::{ArchiveError, SqliteArchive, TeamArchive};
pub use button::{Button, SimulatedButton, LONG_PRESS_SEC};
pub use rgb::{RgbClient, RgbContent, RgbContentMap};
pub use sound::{CueSoundPlayer, SoundPlayer};
