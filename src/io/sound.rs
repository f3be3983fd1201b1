//! Sound player seam.
//!
//! The audio device and sample library live in a collaborator process;
//! the core only ever fires cue names at it and never waits.

use tracing::info;

/// Fire-and-forget sound cues.
pub trait SoundPlayer: Send + Sync {
    /// Play the named cue.
    fn play(&self, name: &str);

    /// Play the first cue whose name contains `substring`.
    fn play_matching(&self, substring: &str);
}

/// Default player: logs the cue instead of producing audio. Deployments
/// swap in the real audio collaborator.
#[derive(Debug, Default)]
pub struct CueSoundPlayer;

impl SoundPlayer for CueSoundPlayer {
    fn play(&self, name: &str) {
        info!(cue = name, "sound cue");
    }

    fn play_matching(&self, substring: &str) {
        info!(cue = substring, "sound cue (matching)");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::SoundPlayer;
    use std::sync::Mutex;

    /// Records played cues for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingSound {
        pub played: Mutex<Vec<String>>,
    }

    impl SoundPlayer for RecordingSound {
        fn play(&self, name: &str) {
            self.played.lock().unwrap().push(name.to_string());
        }

        fn play_matching(&self, substring: &str) {
            self.play(substring);
        }
    }
}
