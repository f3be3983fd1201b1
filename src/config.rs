//! Typed configuration view.
//!
//! The on-disk form is a JSON document under `config/`; at-rest encryption
//! is the config collaborator's concern, and the core only ever sees the
//! decrypted view. Every node loads the config at startup and replaces it
//! wholesale when a CONFIG message arrives (`update_from` + `save`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::time::Seconds;
use crate::game::scoring::ScoringConfig;
use crate::game::team::Trophy;
use crate::{DEFAULT_UDP_PORT, VERSION};

/// Default config file location, relative to the project root.
pub const CONFIG_FILE: &str = "config/cubehall.json";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read or written.
    #[error("config i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not a valid config document.
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The document parsed but fails validation.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The full option set, with installation defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Suggested team names offered by the desk UI.
    pub team_names: Vec<String>,
    /// Game durations offered at registration, as `"h:m"` strings.
    pub game_durations: Vec<String>,
    /// Trophies the operator can award.
    pub defined_trophies: Vec<Trophy>,
    /// Accepted node names (the closed set).
    pub valid_node_names: Vec<String>,
    /// Overrides the hostname-derived node identity.
    pub local_node_name: Option<String>,
    /// Neopixel brightness on the cubeboxes, 0..=1.
    pub cubebox_neopixel_intensity: f64,
    /// Show team names (not just clocks) on the RGB matrices.
    pub display_team_names_on_rgb: bool,
    /// Number of RGB display slots driven by the Master.
    pub rgb_matrix_count: usize,
    /// How long the alarm effect runs.
    pub alarm_duration_sec: Seconds,
    /// Badge uids that reset a cubebox.
    pub resetter_rfid_uids: Vec<String>,
    /// Password for the web-admin collaborator.
    pub webapp_password: String,
    /// Score parameters.
    pub scoring: ScoringConfig,
    /// UDP port shared by every node.
    pub udp_port: u16,
    /// LAN broadcast address for node-to-everyone traffic.
    pub broadcast_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            team_names: vec![
                "Paris".into(),
                "Lyon".into(),
                "Oslo".into(),
                "Kyoto".into(),
                "Quebec".into(),
            ],
            game_durations: vec!["0:45".into(), "1:00".into(), "1:30".into(), "2:00".into()],
            defined_trophies: Vec::new(),
            valid_node_names: crate::core::nodes::NodeName::all_real()
                .map(|n| n.to_string())
                .chain(std::iter::once("everyone".to_string()))
                .collect(),
            local_node_name: None,
            cubebox_neopixel_intensity: 0.5,
            display_team_names_on_rgb: true,
            rgb_matrix_count: 2,
            alarm_duration_sec: 5.0,
            resetter_rfid_uids: Vec::new(),
            webapp_password: String::new(),
            scoring: ScoringConfig::default(),
            udp_port: DEFAULT_UDP_PORT,
            broadcast_addr: "255.255.255.255".into(),
        }
    }
}

impl Config {
    /// Load from `path`. A missing file yields the defaults; an unreadable
    /// or malformed file is an error (the Master treats it as fatal).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location under `root`.
    pub fn load_from_root(root: &Path) -> Result<Self, ConfigError> {
        Self::load(&root.join(CONFIG_FILE))
    }

    /// Persist to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json())?;
        Ok(())
    }

    /// Replace every field from `other`. Idempotent.
    pub fn update_from(&mut self, other: &Config) {
        *self = other.clone();
    }

    /// Serialized form carried by CONFIG messages.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("config serializes")
    }

    /// Parse the serialized form.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.game_durations.is_empty() {
            return Err(ConfigError::Invalid("game_durations is empty".into()));
        }
        for duration in &self.game_durations {
            if crate::core::time::parse_hm(duration).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "bad game duration {duration:?}, expected h:m"
                )));
            }
        }
        if self.valid_node_names.is_empty() {
            return Err(ConfigError::Invalid("valid_node_names is empty".into()));
        }
        if !(0.0..=1.0).contains(&self.cubebox_neopixel_intensity) {
            return Err(ConfigError::Invalid(
                "cubebox_neopixel_intensity must be in 0..=1".into(),
            ));
        }
        if self.alarm_duration_sec < 0.0 {
            return Err(ConfigError::Invalid("alarm_duration_sec is negative".into()));
        }
        if self.rgb_matrix_count == 0 {
            return Err(ConfigError::Invalid("rgb_matrix_count is zero".into()));
        }
        Ok(())
    }

    /// The configured game durations in seconds, skipping unparsable
    /// entries (validation already rejects them at load).
    pub fn game_durations_sec(&self) -> Vec<Seconds> {
        self.game_durations
            .iter()
            .filter_map(|d| crate::core::time::parse_hm(d))
            .collect()
    }

    /// Whether a badge uid belongs to a staff resetter.
    pub fn is_resetter_uid(&self, uid: &str) -> bool {
        self.resetter_rfid_uids.iter().any(|u| u == uid)
    }

    /// Version string advertised over REPLY_VERSION.
    pub fn version() -> &'static str {
        VERSION
    }

    /// Default config path under a project root.
    pub fn default_path(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config/cubehall.json");

        let mut config = Config::default();
        config.resetter_rfid_uids.push("4242424242".into());
        config.alarm_duration_sec = 12.0;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validation_rejects_bad_durations() {
        let mut config = Config::default();
        config.game_durations = vec!["ninety minutes".into()];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_update_from_replaces_everything() {
        let mut a = Config::default();
        let mut b = Config::default();
        b.webapp_password = "hunter2".into();
        b.udp_port = 6006;

        a.update_from(&b);
        assert_eq!(a, b);
        // Idempotent.
        a.update_from(&b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_json_message_roundtrip() {
        let mut config = Config::default();
        config.display_team_names_on_rgb = false;
        let back = Config::from_json(&config.to_json()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_resetter_lookup() {
        let mut config = Config::default();
        config.resetter_rfid_uids.push("9999999999".into());
        assert!(config.is_resetter_uid("9999999999"));
        assert!(!config.is_resetter_uid("1234567890"));
    }

    #[test]
    fn test_game_durations_sec() {
        let config = Config::default();
        assert_eq!(config.game_durations_sec()[0], 2700.0);
    }
}
