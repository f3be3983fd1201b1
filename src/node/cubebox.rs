//! A Cubebox node: one puzzle station's controller.
//!
//! The box owns a single [`CubeboxStatus`] and three producing loops:
//! message dispatch, RFID ingest, and the button poll. Local state only
//! advances when the Master confirms the event, so the box and the
//! Master's view of it cannot diverge on who is playing; the box stays
//! authoritative for its own timestamps.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::nodes::NodeName;
use crate::core::rfid::{RfidFeed, RfidLine};
use crate::core::time::{self, Timestamp};
use crate::game::cubebox::CubeboxStatus;
use crate::io::button::Button;
use crate::io::sound::SoundPlayer;
use crate::network::message::{command_target, AckInfo, Message, Payload};
use crate::network::transport::Transport;
use crate::node::{NodeRoleError, HEARTBEAT_INTERVAL, POLL_INTERVAL};

/// One puzzle controller.
pub struct CubeboxNode {
    cube_id: u8,
    transport: Arc<Transport>,
    config: RwLock<Config>,
    config_path: Option<PathBuf>,
    status: Arc<RwLock<CubeboxStatus>>,
    sound: Arc<dyn SoundPlayer>,
    button: Arc<dyn Button>,
    rfid_feed: Mutex<Option<RfidFeed>>,
    reboot_requested: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl CubeboxNode {
    /// Build the node around a transport bound as `CubeBoxN`. Boot state
    /// is `WaitingForReset`: staff must badge the box ready first.
    pub fn new(
        transport: Arc<Transport>,
        config: Config,
        config_path: Option<PathBuf>,
        sound: Arc<dyn SoundPlayer>,
        button: Arc<dyn Button>,
        rfid_feed: RfidFeed,
    ) -> Result<Arc<Self>, NodeRoleError> {
        let cube_id = transport.node_name().cubebox_id().ok_or(NodeRoleError {
            expected: "CubeBox1..12",
            actual: transport.node_name(),
        })?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Arc::new(Self {
            cube_id,
            transport,
            config: RwLock::new(config),
            config_path,
            status: Arc::new(RwLock::new(CubeboxStatus::new(cube_id))),
            sound,
            button,
            rfid_feed: Mutex::new(Some(rfid_feed)),
            reboot_requested: AtomicBool::new(false),
            shutdown_tx,
        }))
    }

    /// This box's cube id.
    pub fn cube_id(&self) -> u8 {
        self.cube_id
    }

    /// Snapshot of the local status.
    pub async fn status(&self) -> CubeboxStatus {
        self.status.read().await.clone()
    }

    /// The node's transport endpoint.
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Shared handle to the local status (console view).
    pub fn status_handle(&self) -> Arc<RwLock<CubeboxStatus>> {
        self.status.clone()
    }

    /// Spawn every loop and announce the boot state.
    pub fn run(self: &Arc<Self>) {
        self.clone().spawn_dispatch_loop();
        self.clone().spawn_rfid_loop();
        self.clone().spawn_button_loop();
        self.transport.spawn_heartbeat(HEARTBEAT_INTERVAL);
        let node = self.clone();
        tokio::spawn(async move { node.broadcast_status().await });
        info!(cube_id = self.cube_id, "cubebox node running");
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

    /// The status changed: tell whoever listens.
    async fn broadcast_status(&self) {
        let msg = {
            let status = self.status.read().await;
            Message::reply_cubebox_status(self.transport.node_name(), &status)
        };
        self.transport.broadcast(&msg).await;
    }

    /// Staff reset: arm the box for the next team.
    pub async fn perform_reset(&self) {
        self.status.write().await.set_ready_to_play();
        info!(cube_id = self.cube_id, "cubebox reset, ready to play");
        self.broadcast_status().await;
        self.sound.play_matching("reset");
    }

    /// A badge was read. Resetter badges arm the box locally; team
    /// badges only count after the Master accepts them.
    pub async fn handle_rfid(&self, line: RfidLine) {
        if self.config.read().await.is_resetter_uid(&line.uid) {
            self.perform_reset().await;
            return;
        }
        if !self.status.read().await.is_ready_to_play() {
            debug!(cube_id = self.cube_id, uid = %line.uid, "badge read while not ready");
            self.sound.play_matching("error");
            return;
        }

        let msg = Message::rfid_read(self.transport.node_name(), &line);
        let report = self.transport.send_to(&msg, NodeName::Master).await;
        if report.ack_ok {
            self.status
                .write()
                .await
                .set_playing(None, line.timestamp, Some(line));
            self.broadcast_status().await;
            self.sound.play_matching("ok");
        } else {
            warn!(
                cube_id = self.cube_id,
                uid = %line.uid,
                info = %report.ack_info,
                "badge rejected"
            );
            self.sound.play_matching("error");
        }
    }

    /// A qualifying long press. Only reported while Playing; the state
    /// advances when the Master confirms the win, otherwise the box
    /// stays in Playing and the press is lost.
    pub async fn handle_long_press(&self, press_timestamp: Timestamp) {
        let start = {
            let status = self.status.read().await;
            if !status.is_playing() {
                return;
            }
            status.start_timestamp
        };
        let Some(start_timestamp) = start else { return };

        let msg = Message::button_press(self.transport.node_name(), start_timestamp, press_timestamp);
        let report = self.transport.send_to(&msg, NodeName::Master).await;
        if report.ack_ok {
            self.status.write().await.set_won(press_timestamp);
            info!(cube_id = self.cube_id, "win confirmed");
            self.broadcast_status().await;
            self.sound.play_matching("victory");
        } else {
            warn!(
                cube_id = self.cube_id,
                info = %report.ack_info,
                "press not confirmed, staying in play"
            );
        }
    }

    /// ORDER_CUBEBOX_TO_RESET from the Master.
    async fn handle_order_reset(&self) -> AckInfo {
        self.perform_reset().await;
        AckInfo::Ok
    }

    /// ORDER_CUBEBOX_TO_WAIT_FOR_RESET: park the box. A no-op when
    /// already parked, and still acked OK.
    async fn handle_order_wait_for_reset(&self) -> AckInfo {
        self.status.write().await.set_waiting_for_reset();
        info!(cube_id = self.cube_id, "parked until reset by master order");
        self.broadcast_status().await;
        AckInfo::Ok
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
                self.perform_reset().await;
                AckInfo::Ok
            }
            "button" => {
                // Test hook: the poll loop picks this up as a real press.
                self.button.simulate_long_press();
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
            // Orders fall back to broadcast while the master has no
            // address for the box, so every box checks the cube id.
            Payload::OrderReset { cube_id } if cube_id == self.cube_id => {
                let info = self.handle_order_reset().await;
                self.transport.acknowledge(&msg, info).await;
            }
            Payload::OrderWaitForReset { cube_id } if cube_id == self.cube_id => {
                let info = self.handle_order_wait_for_reset().await;
                self.transport.acknowledge(&msg, info).await;
            }
            Payload::OrderReset { .. } | Payload::OrderWaitForReset { .. } => {}
            Payload::Command { full_command } => {
                if let Some(info) = self.handle_command(&full_command).await {
                    self.transport.acknowledge(&msg, info).await;
                }
            }
            Payload::Config { config } => {
                self.apply_config(*config).await;
                self.transport.acknowledge(&msg, AckInfo::Ok).await;
            }
            Payload::RequestCubeboxStatus { cube_id } if cube_id == self.cube_id => {
                let reply = {
                    let status = self.status.read().await;
                    Message::reply_cubebox_status(self.transport.node_name(), &status)
                };
                let dest = match msg.sender_addr {
                    Some(addr) => crate::network::transport::Destination::Addr(addr),
                    None => crate::network::transport::Destination::Node(msg.sender),
                };
                self.transport.send(&reply, dest).await;
            }
            _ => {
                debug!(kind = %msg.kind, sender = %msg.sender, "cubebox ignores message");
            }
        }
    }

    fn spawn_dispatch_loop(self: Arc<Self>) {
        let mut rx = self.transport.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    msg = rx.recv() => match msg {
                        Ok(msg) => self.dispatch(msg).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "cubebox dispatch lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    fn spawn_rfid_loop(self: Arc<Self>) {
        let Some(mut feed) = self.rfid_feed.try_lock().ok().and_then(|mut g| g.take()) else {
            warn!("rfid loop already running");
            return;
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    line = feed.next_line() => match line {
                        Some(line) => self.handle_rfid(line).await,
                        None => {
                            warn!("rfid feed closed");
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_button_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if self.button.has_been_pressed_long_enough() {
                            if self.status.read().await.is_playing() {
                                self.handle_long_press(time::now()).await;
                            } else {
                                debug!(cube_id = self.cube_id, "long press while not playing");
                            }
                            // Consume the press either way so a held
                            // button cannot re-fire.
                            self.button.reset();
                        }
                    }
                }
            }
        });
    }
}
