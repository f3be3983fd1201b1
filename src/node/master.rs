//! The Master node: authoritative owner of the game state.
//!
//! Every game rule lives here. Handlers mutate the single [`GameStatus`]
//! behind one coarse lock and answer each ack-required message with an
//! info code; they never hold the lock across a network await. The
//! cooperating loops are:
//!
//! - message dispatch (consumes the transport feed),
//! - timeout detection (~100 ms poll),
//! - status replication to the Frontdesk (hash diff),
//! - RGB refresh (teams hash diff),
//! - the one-at-a-time alarm effect.
//!
//! Handlers take the relevant event timestamp as an argument instead of
//! reading the wall clock, so the periodic loops pass `time::now()` and
//! tests pass literal clocks.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::hash::ContentHash;
use crate::core::nodes::NodeName;
use crate::core::rfid::RfidLine;
use crate::core::time::{self, Timestamp};
use crate::game::cubebox::{CubeboxState, CubeboxStatus};
use crate::game::status::GameStatus;
use crate::game::team::TeamStatus;
use crate::io::archive::TeamArchive;
use crate::io::rgb::{RgbClient, RgbContent, RgbContentMap};
use crate::io::sound::SoundPlayer;
use crate::network::message::{command_target, AckInfo, Message, Payload};
use crate::network::transport::{Destination, Transport};
use crate::node::{HEARTBEAT_INTERVAL, POLL_INTERVAL};
use crate::UDP_BUFSIZE;

/// Retry budget for the push replication (send plus one retry).
const STATUS_PUSH_TRIES: u32 = 2;

/// The authoritative coordinator.
pub struct MasterNode {
    transport: Arc<Transport>,
    config: RwLock<Config>,
    config_path: Option<PathBuf>,
    state: Arc<RwLock<GameStatus>>,
    sound: Arc<dyn SoundPlayer>,
    archive: Option<Arc<dyn TeamArchive>>,
    rgb: Option<RgbClient>,
    /// Game hash last acknowledged by the Frontdesk.
    last_pushed_hash: Mutex<Option<ContentHash>>,
    /// Teams hash last handed to the RGB daemon.
    last_rgb_hash: Mutex<Option<ContentHash>>,
    alarm_tx: mpsc::Sender<()>,
    alarm_rx: Mutex<Option<mpsc::Receiver<()>>>,
    alarms_requested: AtomicU32,
    reboot_requested: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl MasterNode {
    /// Build the node around a bound transport. `config_path`, the
    /// archive and the RGB client are optional so tests run without
    /// filesystem or daemon collaborators.
    pub fn new(
        transport: Arc<Transport>,
        config: Config,
        config_path: Option<PathBuf>,
        sound: Arc<dyn SoundPlayer>,
        archive: Option<Arc<dyn TeamArchive>>,
        rgb: Option<RgbClient>,
    ) -> Arc<Self> {
        // Capacity 1: an alarm request arriving while one is pending
        // coalesces with it, and a running alarm always completes before
        // the next starts.
        let (alarm_tx, alarm_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            transport,
            config: RwLock::new(config),
            config_path,
            state: Arc::new(RwLock::new(GameStatus::new())),
            sound,
            archive,
            rgb,
            last_pushed_hash: Mutex::new(None),
            last_rgb_hash: Mutex::new(None),
            alarm_tx,
            alarm_rx: Mutex::new(Some(alarm_rx)),
            alarms_requested: AtomicU32::new(0),
            reboot_requested: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    /// Shared view of the authoritative state (prompt, tests).
    pub async fn game_status(&self) -> GameStatus {
        self.state.read().await.clone()
    }

    /// The node's transport endpoint.
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Shared handle to the authoritative state (console view).
    pub fn state_handle(&self) -> Arc<RwLock<GameStatus>> {
        self.state.clone()
    }

    /// Spawn every loop. Returns immediately; use
    /// [`subscribe_shutdown`](Self::subscribe_shutdown) to wait.
    pub fn run(self: &Arc<Self>) {
        self.clone().spawn_dispatch_loop();
        self.clone().spawn_timeout_loop();
        self.clone().spawn_status_loop();
        self.clone().spawn_rgb_loop();
        self.clone().spawn_alarm_loop();
        self.transport.spawn_heartbeat(HEARTBEAT_INTERVAL);
        info!("master node running");
    }

    /// Stop every loop and the transport.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        self.transport.stop();
    }

    /// A receiver that fires when the node is stopping.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Whether a `reboot` command asked the host binary to restart.
    pub fn reboot_requested(&self) -> bool {
        self.reboot_requested.load(Ordering::SeqCst)
    }

    /// How many alarm runs have been requested so far.
    pub fn alarms_requested(&self) -> u32 {
        self.alarms_requested.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Game-rule handlers
    // ------------------------------------------------------------------

    /// FRONTDESK_NEW_TEAM: register a team. The team's clock does not
    /// start here; it starts at its first cube assignment.
    pub async fn register_team(&self, team: TeamStatus) -> AckInfo {
        if team.name.is_empty() || !RfidLine::new(team.rfid_uid.clone(), 0.0).is_valid() {
            return AckInfo::Invalid;
        }
        let mut state = self.state.write().await;
        if state.teams.by_name(&team.name).is_some()
            || state.teams.by_rfid_uid(&team.rfid_uid).is_some()
        {
            return AckInfo::Occupied;
        }
        info!(team = %team.name, uid = %team.rfid_uid, "team registered");
        state.teams.add(team);
        AckInfo::Ok
    }

    /// FRONTDESK_DELETE_TEAM: remove a live team, parking any cube it
    /// still occupies.
    pub async fn delete_team(&self, team_name: &str) -> AckInfo {
        let occupied = {
            let mut state = self.state.write().await;
            if state.teams.by_name(team_name).is_none() {
                return AckInfo::Invalid;
            }
            let occupied = state
                .teams
                .by_name(team_name)
                .and_then(|t| t.current_cubebox_id);
            if let Some(cube_id) = occupied {
                if let Some(cube) = state.cubeboxes.get_mut(cube_id) {
                    cube.set_waiting_for_reset();
                }
            }
            state.teams.remove(team_name);
            occupied
        };
        if let Some(cube_id) = occupied {
            self.order_wait_for_reset(cube_id).await;
        }
        info!(team = %team_name, "team deleted");
        AckInfo::Ok
    }

    /// CUBEBOX_RFID_READ: a team badged onto `cube_id`. The line's
    /// timestamp is the cubebox-local read time and becomes the play
    /// start; it is also the clock the time-up check runs against.
    pub async fn handle_rfid_read(&self, cube_id: u8, line: &RfidLine) -> AckInfo {
        let mut abandoned = None;
        let info = {
            let mut state = self.state.write().await;
            if state.cubeboxes.get(cube_id).is_none() {
                return AckInfo::Invalid;
            }
            let Some(team) = state.teams.by_rfid_uid(&line.uid) else {
                debug!(uid = %line.uid, "rfid read for unknown team");
                return AckInfo::Invalid;
            };
            if team.has_completed(cube_id) {
                debug!(team = %team.name, cube_id, "cube already completed");
                return AckInfo::Denied;
            }
            if team.is_time_up(line.timestamp) {
                debug!(team = %team.name, "time up, read denied");
                return AckInfo::Denied;
            }

            let team_name = team.name.clone();
            let previous = team.current_cubebox_id.filter(|&id| id != cube_id);
            if let Some(prev_id) = previous {
                // The team walked away from its previous cube: no
                // completion is recorded.
                if let Some(prev) = state.cubeboxes.get_mut(prev_id) {
                    prev.set_waiting_for_reset();
                }
                abandoned = Some(prev_id);
                info!(team = %team_name, abandoned = prev_id, "cube abandoned");
            }

            let cube = state.cubeboxes.get_mut(cube_id).expect("checked above");
            cube.set_playing(Some(team_name.clone()), line.timestamp, Some(line.clone()));

            let team = state.teams.by_name_mut(&team_name).expect("team is live");
            team.current_cubebox_id = Some(cube_id);
            if team.start_timestamp.is_none() {
                team.start_timestamp = Some(line.timestamp);
            }
            info!(team = %team_name, cube_id, start = line.timestamp, "team assigned to cube");
            AckInfo::Ok
        };
        if let Some(prev_id) = abandoned {
            self.order_wait_for_reset(prev_id).await;
        }
        info
    }

    /// CUBEBOX_BUTTON_PRESS: the cube reports a validated play with its
    /// local start and press timestamps.
    pub async fn handle_button_press(
        &self,
        cube_id: u8,
        start_timestamp: Timestamp,
        press_timestamp: Timestamp,
    ) -> AckInfo {
        let mut state = self.state.write().await;
        let Some(team_name) = state.teams.by_current_cube(cube_id).map(|t| t.name.clone()) else {
            debug!(cube_id, "button press with no team playing");
            return AckInfo::Invalid;
        };
        if press_timestamp <= start_timestamp {
            warn!(cube_id, start_timestamp, press_timestamp, "non-increasing press times");
            return AckInfo::Invalid;
        }

        let team = state.teams.by_name_mut(&team_name).expect("team is live");
        if !team.complete_cube(cube_id, start_timestamp, press_timestamp) {
            return AckInfo::Invalid;
        }
        team.resign_current_cube();
        if let Some(cube) = state.cubeboxes.get_mut(cube_id) {
            cube.set_won(press_timestamp);
        }
        info!(
            team = %team_name,
            cube_id,
            completion = press_timestamp - start_timestamp,
            "cube completed"
        );
        AckInfo::Ok
    }

    /// Timeout detection: finish every team whose clock ran out by `now`.
    /// Returns how many teams were finished this pass.
    pub async fn check_timeouts(&self, now: Timestamp) -> usize {
        let mut orders = Vec::new();
        let mut finished = Vec::new();
        {
            let mut state = self.state.write().await;
            let timed_out: Vec<String> = state
                .teams
                .iter()
                .filter(|t| t.end_timestamp.is_none() && t.is_time_up(now))
                .map(|t| t.name.clone())
                .collect();

            for name in timed_out {
                let team = state.teams.by_name_mut(&name).expect("team is live");
                team.end_timestamp = Some(now);
                let use_alarm = team.use_alarm;
                let occupied = team.current_cubebox_id.take();
                let snapshot = team.clone();
                if let Some(cube_id) = occupied {
                    if let Some(cube) = state.cubeboxes.get_mut(cube_id) {
                        cube.set_waiting_for_reset();
                    }
                    orders.push(cube_id);
                }
                info!(team = %name, now, "team time up");
                if use_alarm {
                    self.request_alarm();
                }
                finished.push(snapshot);
            }
        }
        for cube_id in &orders {
            self.order_wait_for_reset(*cube_id).await;
        }
        let count = finished.len();
        for team in finished {
            self.emit_team_finished(&team);
        }
        count
    }

    /// A cubebox broadcast its local status. The box is authoritative
    /// for its staff resets; assignments stay here, so a reported state
    /// never overwrites who plays what.
    pub async fn apply_cubebox_report(&self, report: CubeboxStatus) {
        let mut state = self.state.write().await;
        let Some(cube) = state.cubeboxes.get_mut(report.cube_id) else {
            return;
        };
        match report.state {
            CubeboxState::ReadyToPlay if !cube.is_playing() => {
                cube.set_ready_to_play();
                debug!(cube_id = report.cube_id, "cubebox armed by staff reset");
            }
            CubeboxState::WaitingForReset if !cube.is_playing() => {
                cube.set_waiting_for_reset();
            }
            _ => {}
        }
    }

    /// The "team finished" signal: hand a snapshot to the archive
    /// collaborator. Losing a row never loses live state.
    fn emit_team_finished(&self, team: &TeamStatus) {
        if let Some(archive) = &self.archive {
            if let Err(e) = archive.archive(team) {
                warn!(team = %team.name, error = %e, "failed to archive finished team");
            }
        }
    }

    /// COMMAND dispatch. `None` means the command targets another node
    /// and must not be acknowledged.
    pub async fn handle_command(&self, full_command: &str) -> Option<AckInfo> {
        let (target, rest) = command_target(full_command)?;
        if !self.transport.node_name().accepts(target) {
            return None;
        }
        let info = match rest {
            "reset" => {
                *self.state.write().await = GameStatus::new();
                info!("game state wiped by command");
                AckInfo::Ok
            }
            "update_rgb" => {
                self.last_rgb_hash.lock().await.take();
                AckInfo::Ok
            }
            "test_rgb" => {
                self.test_rgb().await;
                AckInfo::Ok
            }
            "alarm" => {
                self.request_alarm();
                AckInfo::Ok
            }
            "reboot" => {
                self.reboot_requested.store(true, Ordering::SeqCst);
                let _ = self.shutdown_tx.send(());
                AckInfo::Ok
            }
            _ => {
                warn!(command = rest, "unknown command");
                AckInfo::Error
            }
        };
        Some(info)
    }

    /// Queue an alarm run. Coalesces with an already-pending request.
    pub fn request_alarm(&self) {
        if self.alarm_tx.try_send(()).is_ok() {
            self.alarms_requested.fetch_add(1, Ordering::SeqCst);
        } else {
            debug!("alarm already pending, request coalesced");
        }
    }

    async fn apply_config(&self, new: Config) {
        let mut config = self.config.write().await;
        config.update_from(&new);
        if let Some(path) = &self.config_path {
            if let Err(e) = config.save(path) {
                warn!(error = %e, "failed to persist received config");
            }
        }
        info!("configuration replaced from network");
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    async fn order_wait_for_reset(&self, cube_id: u8) {
        let msg = Message::order_wait_for_reset(self.transport.node_name(), cube_id);
        let report = self.transport.send_to(&msg, NodeName::CubeBox(cube_id)).await;
        if !report.ack_ok {
            warn!(cube_id, info = %report.ack_info, "wait-for-reset order not confirmed");
        }
    }

    fn reply_dest(msg: &Message) -> Destination {
        match msg.sender_addr {
            Some(addr) => Destination::Addr(addr),
            None => Destination::Node(msg.sender),
        }
    }

    /// Message dispatch: decode, apply, acknowledge.
    pub async fn dispatch(&self, msg: Message) {
        let payload = match msg.decode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(kind = %msg.kind, sender = %msg.sender, error = %e, "undecodable message");
                if msg.require_ack {
                    self.transport.acknowledge(&msg, AckInfo::Invalid).await;
                }
                return;
            }
        };
        match payload {
            Payload::NewTeam { team } => {
                let info = self.register_team(*team).await;
                self.transport.acknowledge(&msg, info).await;
            }
            Payload::DeleteTeam { team_name } => {
                let info = self.delete_team(&team_name).await;
                self.transport.acknowledge(&msg, info).await;
            }
            Payload::RfidRead { line } => {
                let info = match msg.sender.cubebox_id() {
                    Some(cube_id) => self.handle_rfid_read(cube_id, &line).await,
                    None => AckInfo::Invalid,
                };
                self.transport.acknowledge(&msg, info).await;
            }
            Payload::ButtonPress { start_timestamp, press_timestamp } => {
                let info = match msg.sender.cubebox_id() {
                    Some(cube_id) => {
                        self.handle_button_press(cube_id, start_timestamp, press_timestamp)
                            .await
                    }
                    None => AckInfo::Invalid,
                };
                self.transport.acknowledge(&msg, info).await;
            }
            Payload::Command { full_command } => {
                if let Some(info) = self.handle_command(&full_command).await {
                    self.transport.acknowledge(&msg, info).await;
                }
            }
            Payload::Config { config } => {
                self.apply_config(*config).await;
                self.transport.acknowledge(&msg, AckInfo::Ok).await;
            }
            Payload::RequestCubemasterStatus => {
                let reply = {
                    let state = self.state.read().await;
                    Message::reply_cubemaster_status(self.transport.node_name(), &state)
                };
                let dest = Self::reply_dest(&msg);
                self.transport.send(&reply, dest).await;
            }
            Payload::RequestCubeboxStatus { cube_id } => {
                let reply = {
                    let state = self.state.read().await;
                    state
                        .cubeboxes
                        .get(cube_id)
                        .map(|c| Message::reply_cubebox_status(self.transport.node_name(), c))
                };
                if let Some(reply) = reply {
                    self.transport.send(&reply, Self::reply_dest(&msg)).await;
                }
            }
            Payload::RequestAllCubeboxesStatuses => {
                let reply = {
                    let state = self.state.read().await;
                    Message::reply_all_cubeboxes_statuses(
                        self.transport.node_name(),
                        &state.cubeboxes,
                    )
                };
                self.transport.send(&reply, Self::reply_dest(&msg)).await;
            }
            Payload::RequestTeamStatus { team_name } => {
                let reply = {
                    let state = self.state.read().await;
                    state
                        .teams
                        .by_name(&team_name)
                        .map(|t| Message::reply_team_status(self.transport.node_name(), t))
                };
                if let Some(reply) = reply {
                    self.transport.send(&reply, Self::reply_dest(&msg)).await;
                }
            }
            Payload::RequestAllTeamsStatuses => {
                let reply = {
                    let state = self.state.read().await;
                    Message::reply_all_teams_statuses(self.transport.node_name(), &state.teams)
                };
                self.transport.send(&reply, Self::reply_dest(&msg)).await;
            }
            Payload::RequestAllTeamsStatusHashes => {
                let reply = {
                    let state = self.state.read().await;
                    Message::reply_all_teams_status_hashes(
                        self.transport.node_name(),
                        &state.teams.hash_dict(),
                    )
                };
                self.transport.send(&reply, Self::reply_dest(&msg)).await;
            }
            Payload::RequestAllCubeboxesStatusHashes => {
                let reply = {
                    let state = self.state.read().await;
                    Message::reply_all_cubeboxes_status_hashes(
                        self.transport.node_name(),
                        &state.cubeboxes.hash_dict(),
                    )
                };
                self.transport.send(&reply, Self::reply_dest(&msg)).await;
            }
            Payload::ReplyCubeboxStatus { status } => {
                // Only the owning box may report on its own cube.
                if msg.sender.cubebox_id() == Some(status.cube_id) {
                    self.apply_cubebox_report(*status).await;
                }
            }
            _ => {
                debug!(kind = %msg.kind, sender = %msg.sender, "master ignores message");
            }
        }
    }

    // ------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------

    /// The dispatch loop alone, without the periodic loops (tests).
    pub(crate) fn spawn_dispatch_loop(self: Arc<Self>) {
        let mut rx = self.transport.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    msg = rx.recv() => match msg {
                        Ok(msg) => self.dispatch(msg).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "master dispatch lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    fn spawn_timeout_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        self.check_timeouts(time::now()).await;
                    }
                }
            }
        });
    }

    /// Push the game snapshot to the Frontdesk whenever its hash moved.
    /// A snapshot too large for one datagram degrades to the per-entity
    /// hash dictionaries; the Frontdesk then pulls the changed entities.
    pub(crate) async fn push_status_if_changed(&self) {
        let (hash, snapshot) = {
            let state = self.state.read().await;
            (state.hash(), state.clone())
        };
        if self.last_pushed_hash.lock().await.as_ref() == Some(&hash) {
            return;
        }

        let me = self.transport.node_name();
        let full = Message::reply_cubemaster_status(me, &snapshot);
        if full.serialize().len() <= UDP_BUFSIZE {
            let report = self
                .transport
                .send_with(
                    &full,
                    Destination::Node(NodeName::Frontdesk),
                    Duration::from_secs(1),
                    STATUS_PUSH_TRIES,
                )
                .await;
            if report.ack_ok {
                *self.last_pushed_hash.lock().await = Some(hash);
            } else {
                debug!(info = %report.ack_info, "status push unconfirmed, will repeat");
            }
        } else {
            let teams = Message::reply_all_teams_status_hashes(me, &snapshot.teams.hash_dict());
            let cubes = Message::reply_all_cubeboxes_status_hashes(
                me,
                &snapshot.cubeboxes.hash_dict(),
            );
            let dest = Destination::Node(NodeName::Frontdesk);
            self.transport.send(&teams, dest).await;
            self.transport.send(&cubes, dest).await;
            *self.last_pushed_hash.lock().await = Some(hash);
        }
    }

    fn spawn_status_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL * 5);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => self.push_status_if_changed().await,
                }
            }
        });
    }

    /// Per-matrix content: running teams in name order fill the
    /// configured slots; leftover slots go blank.
    async fn rgb_contents(&self) -> (ContentHash, RgbContentMap) {
        let state = self.state.read().await;
        let config = self.config.read().await;
        let mut map = RgbContentMap::new();
        let mut running = state
            .teams
            .iter()
            .filter(|t| t.start_timestamp.is_some() && t.end_timestamp.is_none());
        for matrix_id in 0..config.rgb_matrix_count as u8 {
            let content = match running.next() {
                Some(team) => RgbContent {
                    team_name: config
                        .display_team_names_on_rgb
                        .then(|| team.name.clone()),
                    end_timestamp: team.deadline(),
                    max_time_sec: Some(team.max_time_sec),
                },
                None => RgbContent::blank(),
            };
            map.set(matrix_id, content);
        }
        (state.teams.hash(), map)
    }

    async fn refresh_rgb_if_changed(&self) {
        let Some(rgb) = &self.rgb else { return };
        let (hash, map) = self.rgb_contents().await;
        if self.last_rgb_hash.lock().await.as_ref() == Some(&hash) {
            return;
        }
        rgb.update(&map).await;
        *self.last_rgb_hash.lock().await = Some(hash);
    }

    async fn test_rgb(&self) {
        let Some(rgb) = &self.rgb else { return };
        let count = self.config.read().await.rgb_matrix_count as u8;
        let mut map = RgbContentMap::new();
        for matrix_id in 0..count {
            map.set(
                matrix_id,
                RgbContent {
                    team_name: Some("TEST".into()),
                    end_timestamp: Some(time::now() + 60.0),
                    max_time_sec: Some(60.0),
                },
            );
        }
        rgb.update(&map).await;
        // The next diff pass repaints the real contents.
        self.last_rgb_hash.lock().await.take();
    }

    fn spawn_rgb_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL * 5);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => self.refresh_rgb_if_changed().await,
                }
            }
        });
    }

    /// Alarm runs are strictly sequential: the single consumer finishes
    /// one effect before taking the next request.
    fn spawn_alarm_loop(self: Arc<Self>) {
        let Some(mut rx) = self.alarm_rx.try_lock().ok().and_then(|mut g| g.take()) else {
            warn!("alarm loop already running");
            return;
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    req = rx.recv() => match req {
                        Some(()) => {
                            let duration = self.config.read().await.alarm_duration_sec;
                            info!(duration, "alarm running");
                            self.sound.play("alarm");
                            tokio::time::sleep(Duration::from_secs_f64(duration.max(0.0))).await;
                        }
                        None => break,
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::cubebox::CubeboxState;
    use crate::game::scoring::ScoringConfig;
    use crate::io::sound::testing::RecordingSound;
    use crate::network::transport::TransportConfig;
    use std::net::{IpAddr, Ipv4Addr};

    async fn master_node() -> Arc<MasterNode> {
        let transport = Transport::bind(
            NodeName::Master,
            TransportConfig {
                port: 0,
                broadcast_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                ack_timeout: Duration::from_millis(50),
                max_tries: 1,
            },
        )
        .await
        .unwrap();
        MasterNode::new(
            transport,
            Config::default(),
            None,
            Arc::new(RecordingSound::default()),
            None,
            None,
        )
    }

    fn paris() -> TeamStatus {
        TeamStatus::new("Paris", "1234567890", 3650.0, 50.0)
    }

    #[tokio::test]
    async fn test_scenario_nominal_play_single_cube() {
        let node = master_node().await;

        // Registration: no clock started yet.
        assert_eq!(node.register_team(paris()).await, AckInfo::Ok);
        {
            let state = node.game_status().await;
            let team = state.teams.by_name("Paris").unwrap();
            assert!(team.start_timestamp.is_none());
        }

        // Badge-in on cube 1 at t=100.
        let line = RfidLine::new("1234567890", 100.0);
        assert_eq!(node.handle_rfid_read(1, &line).await, AckInfo::Ok);
        {
            let state = node.game_status().await;
            let cube = state.cubeboxes.get(1).unwrap();
            assert_eq!(cube.state, CubeboxState::Playing);
            assert_eq!(cube.start_timestamp, Some(100.0));
            assert_eq!(cube.current_team_name.as_deref(), Some("Paris"));
            let team = state.teams.by_name("Paris").unwrap();
            assert_eq!(team.current_cubebox_id, Some(1));
            assert_eq!(team.start_timestamp, Some(100.0));
            assert!(state.is_coherent());
        }

        // Long press at t=130.
        assert_eq!(node.handle_button_press(1, 100.0, 130.0).await, AckInfo::Ok);
        let state = node.game_status().await;
        let team = state.teams.by_name("Paris").unwrap();
        assert_eq!(team.completed_cubeboxes.len(), 1);
        assert_eq!(team.completed_cubeboxes[0].cube_id, 1);
        assert_eq!(team.completed_cubeboxes[0].start_timestamp, 100.0);
        assert_eq!(team.completed_cubeboxes[0].win_timestamp, 130.0);
        assert_eq!(team.current_cubebox_id, None);
        assert_eq!(
            state.cubeboxes.get(1).unwrap().state,
            CubeboxState::WaitingForReset
        );
        // 30 s on an easy cube: full score.
        assert_eq!(team.score(&ScoringConfig::default(), &[]), 300);
        assert!(state.is_coherent());
    }

    #[tokio::test]
    async fn test_scenario_already_completed_is_denied() {
        let node = master_node().await;
        node.register_team(paris()).await;
        node.handle_rfid_read(1, &RfidLine::new("1234567890", 100.0)).await;
        node.handle_button_press(1, 100.0, 130.0).await;

        let before = node.game_status().await;
        let again = RfidLine::new("1234567890", 200.0);
        assert_eq!(node.handle_rfid_read(1, &again).await, AckInfo::Denied);
        assert_eq!(node.game_status().await.hash(), before.hash());
    }

    #[tokio::test]
    async fn test_scenario_cube_abandonment() {
        let node = master_node().await;
        node.register_team(paris()).await;
        node.handle_rfid_read(1, &RfidLine::new("1234567890", 100.0)).await;
        node.handle_button_press(1, 100.0, 130.0).await;

        // Badge onto cube 2, then walk to cube 3 without pressing.
        assert_eq!(
            node.handle_rfid_read(2, &RfidLine::new("1234567890", 200.0)).await,
            AckInfo::Ok
        );
        assert_eq!(
            node.handle_rfid_read(3, &RfidLine::new("1234567890", 210.0)).await,
            AckInfo::Ok
        );

        let state = node.game_status().await;
        let cube2 = state.cubeboxes.get(2).unwrap();
        assert_eq!(cube2.state, CubeboxState::WaitingForReset);
        assert!(cube2.current_team_name.is_none());
        let cube3 = state.cubeboxes.get(3).unwrap();
        assert_eq!(cube3.state, CubeboxState::Playing);
        assert_eq!(cube3.start_timestamp, Some(210.0));
        let team = state.teams.by_name("Paris").unwrap();
        assert_eq!(team.current_cubebox_id, Some(3));
        // Only cube 1 ever completed.
        assert_eq!(team.completed_cubeboxes.len(), 1);
        assert!(state.is_coherent());
    }

    #[tokio::test]
    async fn test_scenario_unknown_rfid_is_invalid() {
        let node = master_node().await;
        node.register_team(paris()).await;
        let before = node.game_status().await;

        let unknown = RfidLine::new("9999999999", 100.0);
        assert_eq!(node.handle_rfid_read(1, &unknown).await, AckInfo::Invalid);
        assert_eq!(node.game_status().await.hash(), before.hash());
    }

    #[tokio::test]
    async fn test_scenario_timeout_with_alarm() {
        let node = master_node().await;
        let mut oslo = TeamStatus::new("Oslo", "1111111111", 5.0, 0.0);
        oslo.use_alarm = true;
        node.register_team(oslo).await;
        node.handle_rfid_read(4, &RfidLine::new("1111111111", 0.0)).await;

        // Not yet.
        assert_eq!(node.check_timeouts(4.9).await, 0);

        assert_eq!(node.check_timeouts(5.001).await, 1);
        let state = node.game_status().await;
        let team = state.teams.by_name("Oslo").unwrap();
        assert_eq!(team.end_timestamp, Some(5.001));
        assert_eq!(team.current_cubebox_id, None);
        assert_eq!(
            state.cubeboxes.get(4).unwrap().state,
            CubeboxState::WaitingForReset
        );
        assert_eq!(node.alarms_requested(), 1);

        // Second pass finds nothing: the alarm ran exactly once.
        assert_eq!(node.check_timeouts(6.0).await, 0);
        assert_eq!(node.alarms_requested(), 1);
        assert!(state.is_coherent());
    }

    #[tokio::test]
    async fn test_timeout_archives_finished_team() {
        let transport = Transport::bind(
            NodeName::Master,
            TransportConfig {
                port: 0,
                broadcast_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                ack_timeout: Duration::from_millis(50),
                max_tries: 1,
            },
        )
        .await
        .unwrap();
        let archive = Arc::new(crate::io::archive::SqliteArchive::open_in_memory().unwrap());
        let node = MasterNode::new(
            transport,
            Config::default(),
            None,
            Arc::new(RecordingSound::default()),
            Some(archive.clone()),
            None,
        );

        node.register_team(TeamStatus::new("Oslo", "1111111111", 5.0, 0.0)).await;
        node.handle_rfid_read(4, &RfidLine::new("1111111111", 0.0)).await;
        node.check_timeouts(10.0).await;

        let rows = archive.query(&Default::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Oslo");
        assert_eq!(rows[0].end_timestamp, Some(10.0));
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_occupied() {
        let node = master_node().await;
        assert_eq!(node.register_team(paris()).await, AckInfo::Ok);
        assert_eq!(node.register_team(paris()).await, AckInfo::Occupied);
        // Same uid under another name.
        assert_eq!(
            node.register_team(TeamStatus::new("Lyon", "1234567890", 100.0, 0.0)).await,
            AckInfo::Occupied
        );
        // Malformed uid.
        assert_eq!(
            node.register_team(TeamStatus::new("Nice", "12345", 100.0, 0.0)).await,
            AckInfo::Invalid
        );
    }

    #[tokio::test]
    async fn test_delete_team_clears_occupied_cube() {
        let node = master_node().await;
        node.register_team(paris()).await;
        node.handle_rfid_read(2, &RfidLine::new("1234567890", 10.0)).await;

        assert_eq!(node.delete_team("Paris").await, AckInfo::Ok);
        let state = node.game_status().await;
        assert!(state.teams.by_name("Paris").is_none());
        assert_eq!(
            state.cubeboxes.get(2).unwrap().state,
            CubeboxState::WaitingForReset
        );
        assert!(state.is_coherent());

        assert_eq!(node.delete_team("Paris").await, AckInfo::Invalid);
    }

    #[tokio::test]
    async fn test_button_press_rejections() {
        let node = master_node().await;
        node.register_team(paris()).await;

        // Nobody playing cube 5.
        assert_eq!(node.handle_button_press(5, 10.0, 20.0).await, AckInfo::Invalid);

        node.handle_rfid_read(5, &RfidLine::new("1234567890", 100.0)).await;
        // Non-increasing times.
        assert_eq!(node.handle_button_press(5, 100.0, 100.0).await, AckInfo::Invalid);
        let state = node.game_status().await;
        assert!(state.teams.by_name("Paris").unwrap().completed_cubeboxes.is_empty());
        assert_eq!(state.cubeboxes.get(5).unwrap().state, CubeboxState::Playing);
    }

    #[tokio::test]
    async fn test_duplicate_rfid_read_is_idempotent() {
        let node = master_node().await;
        node.register_team(paris()).await;
        let line = RfidLine::new("1234567890", 100.0);

        assert_eq!(node.handle_rfid_read(1, &line).await, AckInfo::Ok);
        let once = node.game_status().await;
        // Same datagram delivered twice.
        assert_eq!(node.handle_rfid_read(1, &line).await, AckInfo::Ok);
        assert_eq!(node.game_status().await.hash(), once.hash());
    }

    #[tokio::test]
    async fn test_zero_max_time_is_up_at_first_assignment() {
        let node = master_node().await;
        node.register_team(TeamStatus::new("Rush", "2222222222", 0.0, 0.0)).await;
        node.handle_rfid_read(1, &RfidLine::new("2222222222", 100.0)).await;

        // Assigned, but the very next read is denied and the next
        // timeout pass finishes the team.
        assert_eq!(
            node.handle_rfid_read(2, &RfidLine::new("2222222222", 100.5)).await,
            AckInfo::Denied
        );
        assert_eq!(node.check_timeouts(100.0).await, 1);
    }

    #[tokio::test]
    async fn test_cubebox_report_arms_but_never_steals_a_play() {
        let node = master_node().await;

        // Staff reset reported by the box reaches the authoritative list.
        let mut armed = CubeboxStatus::new(6);
        armed.set_ready_to_play();
        node.apply_cubebox_report(armed).await;
        assert_eq!(
            node.game_status().await.cubeboxes.get(6).unwrap().state,
            CubeboxState::ReadyToPlay
        );

        // A report cannot overwrite a running assignment.
        node.register_team(paris()).await;
        node.handle_rfid_read(6, &RfidLine::new("1234567890", 100.0)).await;
        let mut parked = CubeboxStatus::new(6);
        parked.set_waiting_for_reset();
        node.apply_cubebox_report(parked).await;

        let state = node.game_status().await;
        let cube = state.cubeboxes.get(6).unwrap();
        assert_eq!(cube.state, CubeboxState::Playing);
        assert_eq!(cube.current_team_name.as_deref(), Some("Paris"));
        assert!(state.is_coherent());
    }

    #[tokio::test]
    async fn test_command_targeting() {
        let node = master_node().await;
        node.register_team(paris()).await;

        // Wrong target: ignored, no ack info.
        assert_eq!(node.handle_command("CubeBox3 reset").await, None);
        assert_eq!(node.game_status().await.teams.len(), 1);

        // Unknown command: ERROR.
        assert_eq!(node.handle_command("Master dance").await, Some(AckInfo::Error));

        // reset wipes teams and cubeboxes.
        assert_eq!(node.handle_command("everyone reset").await, Some(AckInfo::Ok));
        let state = node.game_status().await;
        assert!(state.teams.is_empty());
        assert_eq!(state.hash(), GameStatus::new().hash());

        // alarm queues one run.
        assert_eq!(node.handle_command("Master alarm").await, Some(AckInfo::Ok));
        assert_eq!(node.alarms_requested(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_acks_new_team_over_the_wire() {
        let node = master_node().await;

        // A frontdesk peer on its own ephemeral port.
        let desk = Transport::bind(
            NodeName::Frontdesk,
            TransportConfig {
                port: 0,
                broadcast_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                ack_timeout: Duration::from_millis(500),
                max_tries: 1,
            },
        )
        .await
        .unwrap();
        let master_addr = std::net::SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            node.transport.local_addr().unwrap().port(),
        );

        // Only the dispatch loop; the periodic loops are not under test.
        node.clone().spawn_dispatch_loop();

        let msg = Message::new_team(NodeName::Frontdesk, &paris());
        let report = desk.send(&msg, Destination::Addr(master_addr)).await;
        assert!(report.ack_ok, "expected OK ack, got {:?}", report.ack_info);
        assert_eq!(node.game_status().await.teams.len(), 1);

        node.stop();
        desk.stop();
    }
}
