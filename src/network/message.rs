//! Message catalogue and wire codec.
//!
//! Every datagram is one UTF-8 line:
//!
//! ```text
//! CUBEMSG|sender=CubeBox1|msgtype=CUBEBOX_RFID_READ|timestamp=100|uid=1234567890
//! ```
//!
//! The fixed prefix is followed by `|`-separated `key=value` fields;
//! `sender` and `msgtype` are required, every other field lands in the
//! kwargs map (sorted keys on output, unknown keys preserved). The SHA-256
//! hex of the serialized line is the message's content hash, which ACKs
//! echo back as `acked_hash`.
//!
//! The kwargs bag exists only at the transport boundary: nodes decode a
//! [`Message`] into the typed [`Payload`] sum type at dispatch and never
//! poke at raw kwargs.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use crate::config::Config;
use crate::core::hash::{hash_text, ContentHash};
use crate::core::nodes::NodeName;
use crate::core::rfid::RfidLine;
use crate::core::time::Timestamp;
use crate::game::cubebox::{CubeboxStatus, CubeboxesStatusList};
use crate::game::status::GameStatus;
use crate::game::team::{TeamStatus, TeamsList};

/// Fixed frame prefix; datagrams without it are ignored.
pub const PREFIX: &str = "CUBEMSG";

/// Field separator inside a frame.
pub const SEPARATOR: char = '|';

/// Protocol-level failures. All of them cause the datagram to be dropped;
/// none of them are fatal.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame does not start with [`PREFIX`].
    #[error("bad frame prefix")]
    BadPrefix,

    /// `sender` or `msgtype` is missing.
    #[error("missing required field {0}")]
    MissingField(&'static str),

    /// `msgtype` is not in the catalogue.
    #[error("unknown msgtype {0:?}")]
    UnknownKind(String),

    /// `sender` is not a valid node name.
    #[error("bad sender {0:?}")]
    BadSender(String),

    /// A required kwarg is absent for the message's kind.
    #[error("missing kwarg {0:?}")]
    MissingKwarg(&'static str),

    /// A kwarg failed to parse as its typed form.
    #[error("bad value for kwarg {key:?}: {value:?}")]
    BadValue {
        /// Offending kwarg key.
        key: &'static str,
        /// Raw value.
        value: String,
    },

    /// An embedded JSON payload failed to parse.
    #[error("bad json payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// The closed set of message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(missing_docs)]
pub enum MessageKind {
    Ack,
    Heartbeat,
    WhoIs,
    IAm,
    RequestVersion,
    ReplyVersion,
    Command,
    Config,
    FrontdeskNewTeam,
    FrontdeskDeleteTeam,
    CubeboxRfidRead,
    CubeboxButtonPress,
    OrderCubeboxToReset,
    OrderCubeboxToWaitForReset,
    RequestCubemasterStatus,
    ReplyCubemasterStatus,
    RequestCubeboxStatus,
    ReplyCubeboxStatus,
    RequestAllCubeboxesStatuses,
    ReplyAllCubeboxesStatuses,
    RequestTeamStatus,
    ReplyTeamStatus,
    RequestAllTeamsStatuses,
    ReplyAllTeamsStatuses,
    RequestAllTeamsStatusHashes,
    ReplyAllTeamsStatusHashes,
    RequestAllCubeboxesStatusHashes,
    ReplyAllCubeboxesStatusHashes,
}

impl MessageKind {
    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ACK",
            Self::Heartbeat => "HEARTBEAT",
            Self::WhoIs => "WHO_IS",
            Self::IAm => "I_AM",
            Self::RequestVersion => "REQUEST_VERSION",
            Self::ReplyVersion => "REPLY_VERSION",
            Self::Command => "COMMAND",
            Self::Config => "CONFIG",
            Self::FrontdeskNewTeam => "FRONTDESK_NEW_TEAM",
            Self::FrontdeskDeleteTeam => "FRONTDESK_DELETE_TEAM",
            Self::CubeboxRfidRead => "CUBEBOX_RFID_READ",
            Self::CubeboxButtonPress => "CUBEBOX_BUTTON_PRESS",
            Self::OrderCubeboxToReset => "ORDER_CUBEBOX_TO_RESET",
            Self::OrderCubeboxToWaitForReset => "ORDER_CUBEBOX_TO_WAIT_FOR_RESET",
            Self::RequestCubemasterStatus => "REQUEST_CUBEMASTER_STATUS",
            Self::ReplyCubemasterStatus => "REPLY_CUBEMASTER_STATUS",
            Self::RequestCubeboxStatus => "REQUEST_CUBEBOX_STATUS",
            Self::ReplyCubeboxStatus => "REPLY_CUBEBOX_STATUS",
            Self::RequestAllCubeboxesStatuses => "REQUEST_ALL_CUBEBOXES_STATUSES",
            Self::ReplyAllCubeboxesStatuses => "REPLY_ALL_CUBEBOXES_STATUSES",
            Self::RequestTeamStatus => "REQUEST_TEAM_STATUS",
            Self::ReplyTeamStatus => "REPLY_TEAM_STATUS",
            Self::RequestAllTeamsStatuses => "REQUEST_ALL_TEAMS_STATUSES",
            Self::ReplyAllTeamsStatuses => "REPLY_ALL_TEAMS_STATUSES",
            Self::RequestAllTeamsStatusHashes => "REQUEST_ALL_TEAMS_STATUS_HASHES",
            Self::ReplyAllTeamsStatusHashes => "REPLY_ALL_TEAMS_STATUS_HASHES",
            Self::RequestAllCubeboxesStatusHashes => "REQUEST_ALL_CUBEBOXES_STATUS_HASHES",
            Self::ReplyAllCubeboxesStatusHashes => "REPLY_ALL_CUBEBOXES_STATUS_HASHES",
        }
    }

    /// Parse a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }

    /// Whether messages of this kind carry an acknowledgement obligation.
    ///
    /// Not on the wire: both sides derive it from the kind, so a parsed
    /// message acks exactly when its sender expected it to.
    pub fn requires_ack(&self) -> bool {
        match self {
            Self::Ack
            | Self::Heartbeat
            | Self::WhoIs
            | Self::IAm
            | Self::RequestVersion
            | Self::ReplyVersion => false,
            Self::Command
            | Self::Config
            | Self::FrontdeskNewTeam
            | Self::FrontdeskDeleteTeam
            | Self::CubeboxRfidRead
            | Self::CubeboxButtonPress
            | Self::OrderCubeboxToReset
            | Self::OrderCubeboxToWaitForReset => true,
            // The push replication from Master to Frontdesk is the only
            // reply that must be acknowledged.
            Self::ReplyCubemasterStatus => true,
            _ => false,
        }
    }

    /// Every kind, for exhaustive tests.
    pub const ALL: &'static [MessageKind] = &[
        Self::Ack,
        Self::Heartbeat,
        Self::WhoIs,
        Self::IAm,
        Self::RequestVersion,
        Self::ReplyVersion,
        Self::Command,
        Self::Config,
        Self::FrontdeskNewTeam,
        Self::FrontdeskDeleteTeam,
        Self::CubeboxRfidRead,
        Self::CubeboxButtonPress,
        Self::OrderCubeboxToReset,
        Self::OrderCubeboxToWaitForReset,
        Self::RequestCubemasterStatus,
        Self::ReplyCubemasterStatus,
        Self::RequestCubeboxStatus,
        Self::ReplyCubeboxStatus,
        Self::RequestAllCubeboxesStatuses,
        Self::ReplyAllCubeboxesStatuses,
        Self::RequestTeamStatus,
        Self::ReplyTeamStatus,
        Self::RequestAllTeamsStatuses,
        Self::ReplyAllTeamsStatuses,
        Self::RequestAllTeamsStatusHashes,
        Self::ReplyAllTeamsStatusHashes,
        Self::RequestAllCubeboxesStatusHashes,
        Self::ReplyAllCubeboxesStatusHashes,
    ];
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Info code attached to every acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AckInfo {
    None,
    Ok,
    Error,
    Failed,
    Denied,
    Invalid,
    Occupied,
}

impl AckInfo {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Ok => "OK",
            Self::Error => "ERROR",
            Self::Failed => "FAILED",
            Self::Denied => "DENIED",
            Self::Invalid => "INVALID",
            Self::Occupied => "OCCUPIED",
        }
    }

    /// Parse a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "NONE" => Some(Self::None),
            "OK" => Some(Self::Ok),
            "ERROR" => Some(Self::Error),
            "FAILED" => Some(Self::Failed),
            "DENIED" => Some(Self::Denied),
            "INVALID" => Some(Self::Invalid),
            "OCCUPIED" => Some(Self::Occupied),
            _ => None,
        }
    }
}

impl fmt::Display for AckInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A wire message: kind, sender, and a string→string kwargs bag.
///
/// `sender_ip` is discovered from the datagram source and `require_ack`
/// is implied by the kind; neither is on the wire, and neither takes part
/// in equality.
#[derive(Debug, Clone)]
pub struct Message {
    /// Message kind.
    pub kind: MessageKind,
    /// Originating node.
    pub sender: NodeName,
    /// Source address observed by the receiver (not on the wire).
    pub sender_addr: Option<SocketAddr>,
    /// Kind-specific fields, sorted by key on the wire.
    pub kwargs: BTreeMap<String, String>,
    /// Whether the sender expects an acknowledgement.
    pub require_ack: bool,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.sender == other.sender && self.kwargs == other.kwargs
    }
}

impl Eq for Message {}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl Message {
    /// Bare message of a kind with no kwargs.
    pub fn new(kind: MessageKind, sender: NodeName) -> Self {
        Self {
            kind,
            sender,
            sender_addr: None,
            kwargs: BTreeMap::new(),
            require_ack: kind.requires_ack(),
        }
    }

    fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.kwargs.insert(key.to_string(), value.into());
        self
    }

    /// One-line wire form.
    pub fn serialize(&self) -> String {
        let mut line = format!(
            "{PREFIX}{SEPARATOR}sender={}{SEPARATOR}msgtype={}",
            self.sender, self.kind
        );
        for (key, value) in &self.kwargs {
            line.push(SEPARATOR);
            line.push_str(key);
            line.push('=');
            line.push_str(value);
        }
        line
    }

    /// Parse a wire line. Unknown kwargs are preserved; fields without a
    /// `=` are skipped.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.split(SEPARATOR);
        if parts.next() != Some(PREFIX) {
            return Err(ProtocolError::BadPrefix);
        }

        let mut sender = None;
        let mut msgtype = None;
        let mut kwargs = BTreeMap::new();
        for part in parts {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            match key {
                "sender" => sender = Some(value.to_string()),
                "msgtype" => msgtype = Some(value.to_string()),
                _ => {
                    kwargs.insert(key.to_string(), value.to_string());
                }
            }
        }

        let sender = sender.ok_or(ProtocolError::MissingField("sender"))?;
        let msgtype = msgtype.ok_or(ProtocolError::MissingField("msgtype"))?;
        let sender =
            NodeName::parse(&sender).ok_or_else(|| ProtocolError::BadSender(sender.clone()))?;
        let kind =
            MessageKind::parse(&msgtype).ok_or_else(|| ProtocolError::UnknownKind(msgtype))?;

        Ok(Self {
            kind,
            sender,
            sender_addr: None,
            kwargs,
            require_ack: kind.requires_ack(),
        })
    }

    /// Content hash of the wire form; the ack correlation id.
    pub fn hash(&self) -> ContentHash {
        hash_text(&self.serialize())
    }

    /// Whether `self` acknowledges `other`.
    pub fn is_ack_of(&self, other: &Message) -> bool {
        self.kind == MessageKind::Ack
            && self.kwargs.get("acked_hash").map(String::as_str) == Some(other.hash().as_str())
    }

    /// The hash this ACK correlates to, if this is an ACK.
    pub fn acked_hash(&self) -> Option<&str> {
        if self.kind == MessageKind::Ack {
            self.kwargs.get("acked_hash").map(String::as_str)
        } else {
            None
        }
    }

    /// The info code of this ACK (`None` variant when absent/unparsable).
    pub fn ack_info(&self) -> AckInfo {
        self.kwargs
            .get("info")
            .and_then(|v| AckInfo::parse(v))
            .unwrap_or(AckInfo::None)
    }

    // ------------------------------------------------------------------
    // Constructors, one per catalogue entry
    // ------------------------------------------------------------------

    /// ACK of `acked` with an info code.
    pub fn ack(sender: NodeName, acked: &Message, info: AckInfo) -> Self {
        Self::new(MessageKind::Ack, sender)
            .with("acked_hash", acked.hash())
            .with("info", info.as_str())
    }

    /// Periodic presence beacon.
    pub fn heartbeat(sender: NodeName) -> Self {
        Self::new(MessageKind::Heartbeat, sender)
    }

    /// Ask which peer owns `target`.
    pub fn who_is(sender: NodeName, target: NodeName) -> Self {
        Self::new(MessageKind::WhoIs, sender).with("node_name_to_find", target.to_string())
    }

    /// Response to a WHO_IS naming this node.
    pub fn i_am(sender: NodeName) -> Self {
        Self::new(MessageKind::IAm, sender)
    }

    /// Ask a peer for its software version.
    pub fn request_version(sender: NodeName) -> Self {
        Self::new(MessageKind::RequestVersion, sender)
    }

    /// Version response.
    pub fn reply_version(sender: NodeName, version: &str) -> Self {
        Self::new(MessageKind::ReplyVersion, sender).with("version", version)
    }

    /// Administrative command; the first word of `full_command` is the
    /// target node.
    pub fn command(sender: NodeName, full_command: &str) -> Self {
        Self::new(MessageKind::Command, sender).with("full_command", full_command)
    }

    /// Configuration push; recipients replace and persist their config.
    pub fn config_update(sender: NodeName, config: &Config) -> Self {
        Self::new(MessageKind::Config, sender).with("config", config.to_json())
    }

    /// Frontdesk → Master team registration.
    pub fn new_team(sender: NodeName, team: &TeamStatus) -> Self {
        Self::new(MessageKind::FrontdeskNewTeam, sender).with("team", team.to_json())
    }

    /// Frontdesk → Master team deletion.
    pub fn delete_team(sender: NodeName, team_name: &str) -> Self {
        Self::new(MessageKind::FrontdeskDeleteTeam, sender).with("team_name", team_name)
    }

    /// Cubebox → Master badge report.
    pub fn rfid_read(sender: NodeName, line: &RfidLine) -> Self {
        Self::new(MessageKind::CubeboxRfidRead, sender)
            .with("uid", &line.uid)
            .with("timestamp", line.timestamp.to_string())
    }

    /// Cubebox → Master validation-button report.
    pub fn button_press(
        sender: NodeName,
        start_timestamp: Timestamp,
        press_timestamp: Timestamp,
    ) -> Self {
        Self::new(MessageKind::CubeboxButtonPress, sender)
            .with("start_timestamp", start_timestamp.to_string())
            .with("press_timestamp", press_timestamp.to_string())
    }

    /// Master → Cubebox: arm the box.
    pub fn order_reset(sender: NodeName, cube_id: u8) -> Self {
        Self::new(MessageKind::OrderCubeboxToReset, sender).with("cube_id", cube_id.to_string())
    }

    /// Master → Cubebox: park the box until a staff reset.
    pub fn order_wait_for_reset(sender: NodeName, cube_id: u8) -> Self {
        Self::new(MessageKind::OrderCubeboxToWaitForReset, sender)
            .with("cube_id", cube_id.to_string())
    }

    /// Ask the Master for its full game snapshot.
    pub fn request_cubemaster_status(sender: NodeName) -> Self {
        Self::new(MessageKind::RequestCubemasterStatus, sender)
    }

    /// Full game snapshot (also the Master's push replication).
    pub fn reply_cubemaster_status(sender: NodeName, status: &GameStatus) -> Self {
        Self::new(MessageKind::ReplyCubemasterStatus, sender).with("status", status.to_json())
    }

    /// Ask for one cubebox's status.
    pub fn request_cubebox_status(sender: NodeName, cube_id: u8) -> Self {
        Self::new(MessageKind::RequestCubeboxStatus, sender).with("cube_id", cube_id.to_string())
    }

    /// One cubebox's status (reply or change broadcast).
    pub fn reply_cubebox_status(sender: NodeName, status: &CubeboxStatus) -> Self {
        Self::new(MessageKind::ReplyCubeboxStatus, sender).with("cubebox", status.to_json())
    }

    /// Ask for all twelve cubebox statuses.
    pub fn request_all_cubeboxes_statuses(sender: NodeName) -> Self {
        Self::new(MessageKind::RequestAllCubeboxesStatuses, sender)
    }

    /// All twelve cubebox statuses.
    pub fn reply_all_cubeboxes_statuses(sender: NodeName, list: &CubeboxesStatusList) -> Self {
        Self::new(MessageKind::ReplyAllCubeboxesStatuses, sender)
            .with("cubeboxes", serde_json::to_string(list).expect("list serializes"))
    }

    /// Ask for one team's status by name.
    pub fn request_team_status(sender: NodeName, team_name: &str) -> Self {
        Self::new(MessageKind::RequestTeamStatus, sender).with("team_name", team_name)
    }

    /// One team's status.
    pub fn reply_team_status(sender: NodeName, team: &TeamStatus) -> Self {
        Self::new(MessageKind::ReplyTeamStatus, sender).with("team", team.to_json())
    }

    /// Ask for every live team's status.
    pub fn request_all_teams_statuses(sender: NodeName) -> Self {
        Self::new(MessageKind::RequestAllTeamsStatuses, sender)
    }

    /// Every live team's status.
    pub fn reply_all_teams_statuses(sender: NodeName, teams: &TeamsList) -> Self {
        Self::new(MessageKind::ReplyAllTeamsStatuses, sender)
            .with("teams", serde_json::to_string(teams).expect("teams serialize"))
    }

    /// Ask for the per-team hash dictionary.
    pub fn request_all_teams_status_hashes(sender: NodeName) -> Self {
        Self::new(MessageKind::RequestAllTeamsStatusHashes, sender)
    }

    /// Per-team hash dictionary.
    pub fn reply_all_teams_status_hashes(
        sender: NodeName,
        hashes: &BTreeMap<String, ContentHash>,
    ) -> Self {
        Self::new(MessageKind::ReplyAllTeamsStatusHashes, sender)
            .with("hashes", serde_json::to_string(hashes).expect("hashes serialize"))
    }

    /// Ask for the per-cubebox hash dictionary.
    pub fn request_all_cubeboxes_status_hashes(sender: NodeName) -> Self {
        Self::new(MessageKind::RequestAllCubeboxesStatusHashes, sender)
    }

    /// Per-cubebox hash dictionary.
    pub fn reply_all_cubeboxes_status_hashes(
        sender: NodeName,
        hashes: &BTreeMap<u8, ContentHash>,
    ) -> Self {
        Self::new(MessageKind::ReplyAllCubeboxesStatusHashes, sender)
            .with("hashes", serde_json::to_string(hashes).expect("hashes serialize"))
    }

    // ------------------------------------------------------------------
    // Typed decoding
    // ------------------------------------------------------------------

    fn kwarg(&self, key: &'static str) -> Result<&str, ProtocolError> {
        self.kwargs
            .get(key)
            .map(String::as_str)
            .ok_or(ProtocolError::MissingKwarg(key))
    }

    fn kwarg_parsed<T: std::str::FromStr>(&self, key: &'static str) -> Result<T, ProtocolError> {
        let raw = self.kwarg(key)?;
        raw.parse().map_err(|_| ProtocolError::BadValue {
            key,
            value: raw.to_string(),
        })
    }

    /// Decode into the typed payload for this message's kind.
    pub fn decode(&self) -> Result<Payload, ProtocolError> {
        let payload = match self.kind {
            MessageKind::Ack => Payload::Ack {
                acked_hash: self.kwarg("acked_hash")?.to_string(),
                info: self.ack_info(),
            },
            MessageKind::Heartbeat => Payload::Heartbeat,
            MessageKind::WhoIs => {
                let raw = self.kwarg("node_name_to_find")?;
                let target = NodeName::parse(raw).ok_or(ProtocolError::BadValue {
                    key: "node_name_to_find",
                    value: raw.to_string(),
                })?;
                Payload::WhoIs { target }
            }
            MessageKind::IAm => Payload::IAm,
            MessageKind::RequestVersion => Payload::RequestVersion,
            MessageKind::ReplyVersion => Payload::ReplyVersion {
                version: self.kwarg("version")?.to_string(),
            },
            MessageKind::Command => Payload::Command {
                full_command: self.kwarg("full_command")?.to_string(),
            },
            MessageKind::Config => Payload::Config {
                config: Box::new(
                    Config::from_json(self.kwarg("config")?)
                        .map_err(|_| ProtocolError::BadValue {
                            key: "config",
                            value: "<config json>".to_string(),
                        })?,
                ),
            },
            MessageKind::FrontdeskNewTeam => Payload::NewTeam {
                team: Box::new(TeamStatus::from_json(self.kwarg("team")?)?),
            },
            MessageKind::FrontdeskDeleteTeam => Payload::DeleteTeam {
                team_name: self.kwarg("team_name")?.to_string(),
            },
            MessageKind::CubeboxRfidRead => Payload::RfidRead {
                line: RfidLine::new(
                    self.kwarg("uid")?.to_string(),
                    self.kwarg_parsed("timestamp")?,
                ),
            },
            MessageKind::CubeboxButtonPress => Payload::ButtonPress {
                start_timestamp: self.kwarg_parsed("start_timestamp")?,
                press_timestamp: self.kwarg_parsed("press_timestamp")?,
            },
            MessageKind::OrderCubeboxToReset => Payload::OrderReset {
                cube_id: self.kwarg_parsed("cube_id")?,
            },
            MessageKind::OrderCubeboxToWaitForReset => Payload::OrderWaitForReset {
                cube_id: self.kwarg_parsed("cube_id")?,
            },
            MessageKind::RequestCubemasterStatus => Payload::RequestCubemasterStatus,
            MessageKind::ReplyCubemasterStatus => Payload::ReplyCubemasterStatus {
                status: Box::new(GameStatus::from_json(self.kwarg("status")?)?),
            },
            MessageKind::RequestCubeboxStatus => Payload::RequestCubeboxStatus {
                cube_id: self.kwarg_parsed("cube_id")?,
            },
            MessageKind::ReplyCubeboxStatus => Payload::ReplyCubeboxStatus {
                status: Box::new(CubeboxStatus::from_json(self.kwarg("cubebox")?)?),
            },
            MessageKind::RequestAllCubeboxesStatuses => Payload::RequestAllCubeboxesStatuses,
            MessageKind::ReplyAllCubeboxesStatuses => Payload::ReplyAllCubeboxesStatuses {
                statuses: Box::new(serde_json::from_str(self.kwarg("cubeboxes")?)?),
            },
            MessageKind::RequestTeamStatus => Payload::RequestTeamStatus {
                team_name: self.kwarg("team_name")?.to_string(),
            },
            MessageKind::ReplyTeamStatus => Payload::ReplyTeamStatus {
                team: Box::new(TeamStatus::from_json(self.kwarg("team")?)?),
            },
            MessageKind::RequestAllTeamsStatuses => Payload::RequestAllTeamsStatuses,
            MessageKind::ReplyAllTeamsStatuses => Payload::ReplyAllTeamsStatuses {
                teams: Box::new(serde_json::from_str(self.kwarg("teams")?)?),
            },
            MessageKind::RequestAllTeamsStatusHashes => Payload::RequestAllTeamsStatusHashes,
            MessageKind::ReplyAllTeamsStatusHashes => Payload::ReplyAllTeamsStatusHashes {
                hashes: serde_json::from_str(self.kwarg("hashes")?)?,
            },
            MessageKind::RequestAllCubeboxesStatusHashes => {
                Payload::RequestAllCubeboxesStatusHashes
            }
            MessageKind::ReplyAllCubeboxesStatusHashes => Payload::ReplyAllCubeboxesStatusHashes {
                hashes: serde_json::from_str(self.kwarg("hashes")?)?,
            },
        };
        Ok(payload)
    }
}

/// Typed view of a message, decoded at dispatch.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Payload {
    Ack { acked_hash: String, info: AckInfo },
    Heartbeat,
    WhoIs { target: NodeName },
    IAm,
    RequestVersion,
    ReplyVersion { version: String },
    Command { full_command: String },
    Config { config: Box<Config> },
    NewTeam { team: Box<TeamStatus> },
    DeleteTeam { team_name: String },
    RfidRead { line: RfidLine },
    ButtonPress { start_timestamp: Timestamp, press_timestamp: Timestamp },
    OrderReset { cube_id: u8 },
    OrderWaitForReset { cube_id: u8 },
    RequestCubemasterStatus,
    ReplyCubemasterStatus { status: Box<GameStatus> },
    RequestCubeboxStatus { cube_id: u8 },
    ReplyCubeboxStatus { status: Box<CubeboxStatus> },
    RequestAllCubeboxesStatuses,
    ReplyAllCubeboxesStatuses { statuses: Box<CubeboxesStatusList> },
    RequestTeamStatus { team_name: String },
    ReplyTeamStatus { team: Box<TeamStatus> },
    RequestAllTeamsStatuses,
    ReplyAllTeamsStatuses { teams: Box<TeamsList> },
    RequestAllTeamsStatusHashes,
    ReplyAllTeamsStatusHashes { hashes: BTreeMap<String, ContentHash> },
    RequestAllCubeboxesStatusHashes,
    ReplyAllCubeboxesStatusHashes { hashes: BTreeMap<u8, ContentHash> },
}

/// Split a COMMAND's `full_command` into its target node and the command
/// proper. Returns `None` when the first word is not a node name.
pub fn command_target(full_command: &str) -> Option<(NodeName, &str)> {
    let trimmed = full_command.trim_start();
    let (first, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((first, rest)) => (first, rest.trim_start()),
        None => (trimmed, ""),
    };
    Some((NodeName::parse(first)?, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_team() -> TeamStatus {
        let mut team = TeamStatus::new("Paris", "1234567890", 3650.0, 50.0);
        team.complete_cube(1, 100.0, 130.0);
        team.current_cubebox_id = Some(2);
        team
    }

    fn catalogue() -> Vec<Message> {
        let team = sample_team();
        let mut teams = TeamsList::new();
        teams.add(team.clone());
        let status = GameStatus::new();
        let cubebox = CubeboxStatus::new(3);
        let line = RfidLine::new("1234567890", 100.0);
        let config = Config::default();
        let heartbeat = Message::heartbeat(NodeName::Master);

        vec![
            Message::ack(NodeName::Master, &heartbeat, AckInfo::Ok),
            heartbeat.clone(),
            Message::who_is(NodeName::Frontdesk, NodeName::CubeBox(4)),
            Message::i_am(NodeName::CubeBox(4)),
            Message::request_version(NodeName::Frontdesk),
            Message::reply_version(NodeName::Master, "0.1.0"),
            Message::command(NodeName::Frontdesk, "Master reset"),
            Message::config_update(NodeName::Frontdesk, &config),
            Message::new_team(NodeName::Frontdesk, &team),
            Message::delete_team(NodeName::Frontdesk, "Paris"),
            Message::rfid_read(NodeName::CubeBox(1), &line),
            Message::button_press(NodeName::CubeBox(1), 100.0, 130.0),
            Message::order_reset(NodeName::Master, 1),
            Message::order_wait_for_reset(NodeName::Master, 2),
            Message::request_cubemaster_status(NodeName::Frontdesk),
            Message::reply_cubemaster_status(NodeName::Master, &status),
            Message::request_cubebox_status(NodeName::Frontdesk, 3),
            Message::reply_cubebox_status(NodeName::CubeBox(3), &cubebox),
            Message::request_all_cubeboxes_statuses(NodeName::Frontdesk),
            Message::reply_all_cubeboxes_statuses(NodeName::Master, &status.cubeboxes),
            Message::request_team_status(NodeName::Frontdesk, "Paris"),
            Message::reply_team_status(NodeName::Master, &team),
            Message::request_all_teams_statuses(NodeName::Frontdesk),
            Message::reply_all_teams_statuses(NodeName::Master, &teams),
            Message::request_all_teams_status_hashes(NodeName::Frontdesk),
            Message::reply_all_teams_status_hashes(NodeName::Master, &teams.hash_dict()),
            Message::request_all_cubeboxes_status_hashes(NodeName::Frontdesk),
            Message::reply_all_cubeboxes_status_hashes(
                NodeName::Master,
                &status.cubeboxes.hash_dict(),
            ),
        ]
    }

    #[test]
    fn test_serialize_parse_bijection_over_catalogue() {
        let msgs = catalogue();
        // One constructor per kind.
        assert_eq!(msgs.len(), MessageKind::ALL.len());
        for msg in msgs {
            let line = msg.serialize();
            let parsed = Message::parse(&line).unwrap();
            assert_eq!(parsed, msg, "roundtrip failed for {line}");
            assert_eq!(parsed.serialize(), line);
            assert_eq!(parsed.require_ack, msg.kind.requires_ack());
            // Decoding succeeds for every catalogue entry.
            parsed.decode().unwrap();
        }
    }

    #[test]
    fn test_wire_form_is_stable() {
        let msg = Message::rfid_read(NodeName::CubeBox(1), &RfidLine::new("1234567890", 100.0));
        assert_eq!(
            msg.serialize(),
            "CUBEMSG|sender=CubeBox1|msgtype=CUBEBOX_RFID_READ|timestamp=100|uid=1234567890"
        );
    }

    #[test]
    fn test_ack_correlates_by_content_hash() {
        let msg = Message::button_press(NodeName::CubeBox(2), 100.0, 130.0);
        let ack = Message::ack(NodeName::Master, &msg, AckInfo::Ok);

        assert!(ack.is_ack_of(&msg));
        assert_eq!(ack.acked_hash(), Some(msg.hash().as_str()));
        assert_eq!(ack.ack_info(), AckInfo::Ok);

        let other = Message::button_press(NodeName::CubeBox(2), 100.0, 131.0);
        assert!(!ack.is_ack_of(&other));
    }

    #[test]
    fn test_identical_content_identical_hash() {
        let a = Message::delete_team(NodeName::Frontdesk, "Paris");
        let b = Message::delete_team(NodeName::Frontdesk, "Paris");
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_unknown_kwargs_survive_roundtrip() {
        let line = "CUBEMSG|sender=Master|msgtype=HEARTBEAT|future_field=42";
        let msg = Message::parse(line).unwrap();
        assert_eq!(msg.kwargs.get("future_field").map(String::as_str), Some("42"));
        assert_eq!(msg.serialize(), line);
    }

    #[test]
    fn test_bad_frames_are_rejected() {
        assert!(matches!(Message::parse("NOTCUBE|sender=Master|msgtype=HEARTBEAT"),
            Err(ProtocolError::BadPrefix)));
        assert!(matches!(Message::parse("CUBEMSG|msgtype=HEARTBEAT"),
            Err(ProtocolError::MissingField("sender"))));
        assert!(matches!(Message::parse("CUBEMSG|sender=Master"),
            Err(ProtocolError::MissingField("msgtype"))));
        assert!(matches!(Message::parse("CUBEMSG|sender=Master|msgtype=NOT_A_KIND"),
            Err(ProtocolError::UnknownKind(_))));
        assert!(matches!(Message::parse("CUBEMSG|sender=Nobody|msgtype=HEARTBEAT"),
            Err(ProtocolError::BadSender(_))));
    }

    #[test]
    fn test_fields_without_equals_are_skipped() {
        let msg = Message::parse("CUBEMSG|sender=Master|msgtype=HEARTBEAT||junk").unwrap();
        assert!(msg.kwargs.is_empty());
    }

    #[test]
    fn test_decode_typed_payloads() {
        let line = RfidLine::new("1234567890", 100.0);
        let msg = Message::rfid_read(NodeName::CubeBox(1), &line);
        assert_eq!(msg.decode().unwrap(), Payload::RfidRead { line });

        let msg = Message::button_press(NodeName::CubeBox(1), 100.0, 130.0);
        assert_eq!(
            msg.decode().unwrap(),
            Payload::ButtonPress { start_timestamp: 100.0, press_timestamp: 130.0 }
        );

        let team = sample_team();
        let msg = Message::new_team(NodeName::Frontdesk, &team);
        assert_eq!(msg.decode().unwrap(), Payload::NewTeam { team: Box::new(team) });
    }

    #[test]
    fn test_decode_missing_kwarg() {
        let mut msg = Message::new(MessageKind::CubeboxRfidRead, NodeName::CubeBox(1));
        assert!(matches!(msg.decode(), Err(ProtocolError::MissingKwarg("uid"))));
        msg.kwargs.insert("uid".into(), "1234567890".into());
        msg.kwargs.insert("timestamp".into(), "not-a-number".into());
        assert!(matches!(
            msg.decode(),
            Err(ProtocolError::BadValue { key: "timestamp", .. })
        ));
    }

    #[test]
    fn test_command_target_parsing() {
        let (target, rest) = command_target("Master reset").unwrap();
        assert_eq!(target, NodeName::Master);
        assert_eq!(rest, "reset");

        let (target, rest) = command_target("everyone reboot").unwrap();
        assert_eq!(target, NodeName::Everyone);
        assert_eq!(rest, "reboot");

        let (target, rest) = command_target("CubeBox3 button").unwrap();
        assert_eq!(target, NodeName::CubeBox(3));
        assert_eq!(rest, "button");

        assert!(command_target("NotANode reset").is_none());
        assert!(command_target("").is_none());
    }

    proptest! {
        #[test]
        fn prop_kwargs_roundtrip(entries in proptest::collection::btree_map(
            "[a-z_]{1,12}",
            "[^|=\\r\\n]{0,24}",
            0..6,
        )) {
            let mut msg = Message::heartbeat(NodeName::CubeBox(7));
            for (key, value) in &entries {
                if key != "sender" && key != "msgtype" {
                    msg.kwargs.insert(key.clone(), value.clone());
                }
            }
            let parsed = Message::parse(&msg.serialize()).unwrap();
            prop_assert_eq!(parsed, msg);
        }

        #[test]
        fn prop_hash_is_injective_on_serialization(a in "[a-z]{1,10}", b in "[a-z]{1,10}") {
            let msg_a = Message::delete_team(NodeName::Frontdesk, &a);
            let msg_b = Message::delete_team(NodeName::Frontdesk, &b);
            if a != b {
                prop_assert_ne!(msg_a.hash(), msg_b.hash());
            } else {
                prop_assert_eq!(msg_a.hash(), msg_b.hash());
            }
        }
    }
}
