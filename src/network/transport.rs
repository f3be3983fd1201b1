//! Broadcast-UDP transport with acknowledge-and-retry.
//!
//! One socket per node, bound to the shared well-known port with
//! SO_REUSEADDR / SO_REUSEPORT / SO_BROADCAST so every node on the segment
//! (and several nodes on one development machine) hear the same traffic.
//!
//! A background receive task parses each datagram, drops invalid and
//! self-origin frames, refreshes the node directory, answers the generic
//! kinds (ACK routing, heartbeat, WHO_IS / I_AM, version) and publishes
//! everything else on a broadcast feed that the node's dispatch loop and
//! any `wait_for_message` caller subscribe to. Ack-required sends register
//! interest in the message's content hash, then resend up to `max_tries`
//! until a correlated ACK lands.
//!
//! Delivery is at-least-once for ack-required messages and best-effort for
//! the rest; receivers recognize duplicates by content hash or by having
//! idempotent handlers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::core::nodes::{NodeName, NodesList};
use crate::core::time;
use crate::network::message::{AckInfo, Message, MessageKind};
use crate::{UDP_BUFSIZE, VERSION};

/// Default window for one ack wait.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Default number of send attempts for ack-required messages.
pub const ACK_MAX_TRIES: u32 = 3;

/// Capacity of the message feeds; slow subscribers drop oldest first.
const FEED_CAPACITY: usize = 256;

/// Transport failures. None of them are fatal to a node.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The socket could not be created or bound.
    #[error("failed to bind udp socket: {0}")]
    Bind(std::io::Error),

    /// A datagram could not be sent.
    #[error("failed to send datagram: {0}")]
    Send(std::io::Error),

    /// The serialized message exceeds one datagram.
    #[error("message too large: {0} bytes")]
    TooLarge(usize),
}

/// Where a message is going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// The LAN broadcast address.
    Broadcast,
    /// A named peer, resolved through the node directory (falls back to
    /// broadcast while the peer's address is still unknown).
    Node(NodeName),
    /// An explicit address (ack replies, tests).
    Addr(SocketAddr),
}

/// Outcome of a send, surfaced to the application and the Frontdesk UI.
#[derive(Debug, Clone)]
pub struct SendReport {
    /// The datagram(s) left the socket.
    pub sent_ok: bool,
    /// A correlated ACK with info `OK` arrived within the window.
    pub ack_ok: bool,
    /// Info code of the ACK that arrived, `NONE` if none did.
    pub ack_info: AckInfo,
    /// The ACK message itself, when one arrived.
    pub ack_msg: Option<Message>,
}

impl SendReport {
    fn sent_only(sent_ok: bool) -> Self {
        Self { sent_ok, ack_ok: false, ack_info: AckInfo::None, ack_msg: None }
    }

    /// Shorthand for "sent and positively acknowledged".
    pub fn ok(&self) -> bool {
        self.sent_ok && self.ack_ok
    }
}

/// Transport tuning.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Shared UDP port.
    pub port: u16,
    /// LAN broadcast address.
    pub broadcast_addr: IpAddr,
    /// Window for one ack wait.
    pub ack_timeout: Duration,
    /// Send attempts for ack-required messages.
    pub max_tries: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_UDP_PORT,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            ack_timeout: ACK_TIMEOUT,
            max_tries: ACK_MAX_TRIES,
        }
    }
}

impl TransportConfig {
    /// Build from the node configuration.
    pub fn from_config(config: &crate::config::Config) -> Self {
        let broadcast_addr = config
            .broadcast_addr
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::BROADCAST));
        Self {
            port: config.udp_port,
            broadcast_addr,
            ..Self::default()
        }
    }
}

/// The per-node message bus endpoint.
pub struct Transport {
    node_name: NodeName,
    config: TransportConfig,
    socket: Arc<UdpSocket>,
    nodes: Arc<RwLock<NodesList>>,
    incoming_tx: broadcast::Sender<Message>,
    ack_tx: broadcast::Sender<Message>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Transport {
    /// Bind the shared socket and start the receive task.
    pub async fn bind(
        node_name: NodeName,
        config: TransportConfig,
    ) -> Result<Arc<Self>, TransportError> {
        let socket = bind_shared_socket(config.port).map_err(TransportError::Bind)?;
        let socket = Arc::new(socket);

        let (incoming_tx, _) = broadcast::channel(FEED_CAPACITY);
        let (ack_tx, _) = broadcast::channel(FEED_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        let transport = Arc::new(Self {
            node_name,
            config,
            socket,
            nodes: Arc::new(RwLock::new(NodesList::new())),
            incoming_tx,
            ack_tx,
            shutdown_tx,
        });

        transport.clone().spawn_receive_loop();
        info!(node = %node_name, port = transport.config.port, "transport up");
        Ok(transport)
    }

    /// This node's name.
    pub fn node_name(&self) -> NodeName {
        self.node_name
    }

    /// The bound socket address (the shared port, or the ephemeral test
    /// port when bound to port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The node directory, shared with the owning node.
    pub fn nodes(&self) -> Arc<RwLock<NodesList>> {
        self.nodes.clone()
    }

    /// Subscribe to the application-message feed (everything that is not
    /// an ACK or handled generically by the transport).
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.incoming_tx.subscribe()
    }

    /// Stop the receive task.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn spawn_receive_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut buf = [0u8; UDP_BUFSIZE];
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!(node = %self.node_name, "receive loop stopping");
                        break;
                    }
                    result = self.socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, addr)) => self.handle_datagram(&buf[..len], addr).await,
                            Err(e) => {
                                warn!(node = %self.node_name, error = %e, "recv failed");
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                }
            }
        });
    }

    async fn handle_datagram(&self, data: &[u8], addr: SocketAddr) {
        let Ok(text) = std::str::from_utf8(data) else {
            debug!("dropping non-utf8 datagram from {addr}");
            return;
        };
        let mut msg = match Message::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "dropping unparsable datagram from {addr}");
                return;
            }
        };
        if msg.sender == self.node_name {
            debug!("ignoring message from self");
            return;
        }
        msg.sender_addr = Some(addr);

        self.nodes
            .write()
            .await
            .record(msg.sender, &addr.ip().to_string(), addr.port(), time::now());

        match msg.kind {
            MessageKind::Ack => {
                let _ = self.ack_tx.send(msg);
            }
            MessageKind::Heartbeat => {
                // Presence already recorded above.
            }
            MessageKind::IAm => {
                // Address learned from the datagram source; nothing else.
            }
            MessageKind::WhoIs => {
                let wanted = msg.kwargs.get("node_name_to_find").map(String::as_str);
                if wanted == Some(self.node_name.to_string().as_str()) {
                    let reply = Message::i_am(self.node_name);
                    if let Err(e) = self.send_line(&reply.serialize(), Destination::Addr(addr)).await
                    {
                        debug!(error = %e, "failed to answer WHO_IS");
                    }
                }
            }
            MessageKind::RequestVersion => {
                let reply = Message::reply_version(self.node_name, VERSION);
                if let Err(e) = self.send_line(&reply.serialize(), Destination::Addr(addr)).await {
                    debug!(error = %e, "failed to answer REQUEST_VERSION");
                }
            }
            _ => {
                let _ = self.incoming_tx.send(msg);
            }
        }
    }

    async fn resolve(&self, dest: Destination) -> SocketAddr {
        match dest {
            Destination::Broadcast => {
                SocketAddr::new(self.config.broadcast_addr, self.config.port)
            }
            Destination::Addr(addr) => addr,
            Destination::Node(name) => {
                let nodes = self.nodes.read().await;
                match nodes
                    .get(name)
                    .and_then(|info| Some((info.ip.parse::<IpAddr>().ok()?, info.port)))
                {
                    Some((ip, port)) => SocketAddr::new(ip, port),
                    None => {
                        debug!(node = %name, "peer address unknown, broadcasting");
                        SocketAddr::new(self.config.broadcast_addr, self.config.port)
                    }
                }
            }
        }
    }

    async fn send_line(&self, line: &str, dest: Destination) -> Result<(), TransportError> {
        if line.len() > UDP_BUFSIZE {
            return Err(TransportError::TooLarge(line.len()));
        }
        let addr = self.resolve(dest).await;
        self.socket
            .send_to(line.as_bytes(), addr)
            .await
            .map_err(TransportError::Send)?;
        Ok(())
    }

    /// Send a message with the configured ack window and retry budget.
    pub async fn send(&self, msg: &Message, dest: Destination) -> SendReport {
        self.send_with(msg, dest, self.config.ack_timeout, self.config.max_tries)
            .await
    }

    /// Send a message with an explicit ack window and retry budget. For
    /// ack-required messages this waits up to `ack_timeout` per attempt
    /// and resends up to `max_tries` times; a correlated ACK of *any*
    /// info code ends the wait (the info code is the application's
    /// business, not the transport's).
    pub async fn send_with(
        &self,
        msg: &Message,
        dest: Destination,
        ack_timeout: Duration,
        max_tries: u32,
    ) -> SendReport {
        let line = msg.serialize();
        if !msg.require_ack {
            let sent_ok = match self.send_line(&line, dest).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "send failed");
                    false
                }
            };
            return SendReport::sent_only(sent_ok);
        }

        let wanted = msg.hash();
        let mut ack_rx = self.ack_tx.subscribe();
        for attempt in 1..=max_tries.max(1) {
            if let Err(e) = self.send_line(&line, dest).await {
                warn!(error = %e, attempt, "send failed");
                return SendReport::sent_only(false);
            }
            if let Some(ack) =
                wait_for_correlated_ack(&mut ack_rx, &wanted, None, ack_timeout).await
            {
                let info = ack.ack_info();
                return SendReport {
                    sent_ok: true,
                    ack_ok: info == AckInfo::Ok,
                    ack_info: info,
                    ack_msg: Some(ack),
                };
            }
            debug!(attempt, hash = %wanted, "no ack, resending");
        }
        SendReport::sent_only(true)
    }

    /// Broadcast shorthand.
    pub async fn broadcast(&self, msg: &Message) -> SendReport {
        self.send(msg, Destination::Broadcast).await
    }

    /// Send to a named peer.
    pub async fn send_to(&self, msg: &Message, peer: NodeName) -> SendReport {
        self.send(msg, Destination::Node(peer)).await
    }

    /// Acknowledge `msg` with `info`, replying to its source address.
    pub async fn acknowledge(&self, msg: &Message, info: AckInfo) {
        let ack = Message::ack(self.node_name, msg, info);
        let dest = match msg.sender_addr {
            Some(addr) => Destination::Addr(addr),
            None => Destination::Node(msg.sender),
        };
        if let Err(e) = self.send_line(&ack.serialize(), dest).await {
            warn!(error = %e, "failed to send ack");
        } else {
            debug!(to = %msg.sender, info = %info, "acknowledged");
        }
    }

    /// Wait on an already-open subscription for the first message passing
    /// `filter`. Subscribe *before* sending a request so the reply cannot
    /// race the wait.
    pub async fn wait_on(
        rx: &mut broadcast::Receiver<Message>,
        filter: impl Fn(&Message) -> bool,
        wait: Duration,
    ) -> Option<Message> {
        timeout(wait, async {
            loop {
                match rx.recv().await {
                    Ok(msg) if filter(&msg) => return Some(msg),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "message feed lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Subscribe-and-wait convenience for unsolicited messages.
    pub async fn wait_for_message(
        &self,
        filter: impl Fn(&Message) -> bool,
        wait: Duration,
    ) -> Option<Message> {
        let mut rx = self.subscribe();
        Self::wait_on(&mut rx, filter, wait).await
    }

    /// Spawn the periodic presence beacon every node runs.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) {
        let transport = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let beat = Message::heartbeat(transport.node_name);
                        let _ = transport.broadcast(&beat).await;
                    }
                }
            }
        });
    }

    /// Wait for an ACK of `msg`, optionally from a specific sender.
    pub async fn wait_for_ack_of(
        &self,
        msg: &Message,
        from: Option<NodeName>,
        wait: Duration,
    ) -> Option<Message> {
        let mut rx = self.ack_tx.subscribe();
        wait_for_correlated_ack(&mut rx, &msg.hash(), from, wait).await
    }
}

async fn wait_for_correlated_ack(
    rx: &mut broadcast::Receiver<Message>,
    wanted_hash: &str,
    from: Option<NodeName>,
    wait: Duration,
) -> Option<Message> {
    timeout(wait, async {
        loop {
            match rx.recv().await {
                Ok(ack) => {
                    if ack.acked_hash() == Some(wanted_hash)
                        && from.map_or(true, |f| ack.sender == f)
                    {
                        return Some(ack);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "ack feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Bind the shared UDP port with the socket options every node needs.
fn bind_shared_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rfid::RfidLine;

    /// Two transports on loopback, each on its own ephemeral port so the
    /// tests never depend on broadcast delivery.
    async fn pair(a: NodeName, b: NodeName) -> (Arc<Transport>, Arc<Transport>, SocketAddr) {
        let config = |port| TransportConfig {
            port,
            broadcast_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ack_timeout: Duration::from_millis(200),
            max_tries: 2,
        };
        let ta = Transport::bind(a, config(0)).await.unwrap();
        let tb = Transport::bind(b, config(0)).await.unwrap();
        let b_addr = tb.socket.local_addr().unwrap();
        let b_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), b_addr.port());
        (ta, tb, b_addr)
    }

    #[tokio::test]
    async fn test_send_and_ack_roundtrip() {
        let (ta, tb, b_addr) = pair(NodeName::CubeBox(1), NodeName::Master).await;

        // Master-side responder: ack the first app message that arrives.
        let responder = tb.clone();
        let mut rx = tb.subscribe();
        tokio::spawn(async move {
            let msg = rx.recv().await.unwrap();
            responder.acknowledge(&msg, AckInfo::Ok).await;
        });

        let msg = Message::rfid_read(NodeName::CubeBox(1), &RfidLine::new("1234567890", 100.0));
        let report = ta.send(&msg, Destination::Addr(b_addr)).await;

        assert!(report.sent_ok);
        assert!(report.ack_ok);
        assert_eq!(report.ack_info, AckInfo::Ok);
        assert!(report.ack_msg.unwrap().is_ack_of(&msg));

        ta.stop();
        tb.stop();
    }

    #[tokio::test]
    async fn test_negative_ack_is_reported_not_ok() {
        let (ta, tb, b_addr) = pair(NodeName::CubeBox(2), NodeName::Master).await;

        let responder = tb.clone();
        let mut rx = tb.subscribe();
        tokio::spawn(async move {
            let msg = rx.recv().await.unwrap();
            responder.acknowledge(&msg, AckInfo::Denied).await;
        });

        let msg = Message::rfid_read(NodeName::CubeBox(2), &RfidLine::new("9999999999", 1.0));
        let report = ta.send(&msg, Destination::Addr(b_addr)).await;

        assert!(report.sent_ok);
        assert!(!report.ack_ok);
        assert_eq!(report.ack_info, AckInfo::Denied);

        ta.stop();
        tb.stop();
    }

    #[tokio::test]
    async fn test_silence_exhausts_retries() {
        let (ta, tb, b_addr) = pair(NodeName::CubeBox(3), NodeName::Master).await;
        // Nobody acks.
        let msg = Message::button_press(NodeName::CubeBox(3), 1.0, 2.0);
        let report = ta.send(&msg, Destination::Addr(b_addr)).await;

        assert!(report.sent_ok);
        assert!(!report.ack_ok);
        assert_eq!(report.ack_info, AckInfo::None);
        assert!(report.ack_msg.is_none());

        ta.stop();
        tb.stop();
    }

    #[tokio::test]
    async fn test_receive_updates_node_directory() {
        let (ta, tb, b_addr) = pair(NodeName::Frontdesk, NodeName::Master).await;

        let msg = Message::heartbeat(NodeName::Frontdesk);
        assert!(ta.send(&msg, Destination::Addr(b_addr)).await.sent_ok);

        // Give the receive loop a beat.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let nodes = tb.nodes();
        let nodes = nodes.read().await;
        assert_eq!(nodes.ip_of(NodeName::Frontdesk), Some("127.0.0.1"));

        ta.stop();
        tb.stop();
    }

    #[tokio::test]
    async fn test_who_is_gets_an_i_am_back() {
        let (ta, tb, b_addr) = pair(NodeName::Frontdesk, NodeName::Master).await;

        let ask = Message::who_is(NodeName::Frontdesk, NodeName::Master);
        assert!(ta.send(&ask, Destination::Addr(b_addr)).await.sent_ok);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let nodes = ta.nodes();
        let nodes = nodes.read().await;
        assert_eq!(nodes.ip_of(NodeName::Master), Some("127.0.0.1"));

        ta.stop();
        tb.stop();
    }

    #[tokio::test]
    async fn test_self_origin_messages_are_dropped() {
        let (ta, tb, b_addr) = pair(NodeName::Frontdesk, NodeName::Master).await;

        let mut rx = tb.subscribe();
        // Forged frame claiming to come from the receiver itself.
        let forged = Message::command(NodeName::Master, "Master reset");
        assert!(ta.send_line(&forged.serialize(), Destination::Addr(b_addr)).await.is_ok());
        // And one legitimate message right behind it.
        let real = Message::command(NodeName::Frontdesk, "Master reset");
        assert!(ta.send_line(&real.serialize(), Destination::Addr(b_addr)).await.is_ok());

        let got = Transport::wait_on(&mut rx, |_| true, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.sender, NodeName::Frontdesk);

        ta.stop();
        tb.stop();
    }

    #[tokio::test]
    async fn test_oversized_message_is_refused() {
        let (ta, _tb, b_addr) = pair(NodeName::Frontdesk, NodeName::Master).await;
        let msg = Message::delete_team(NodeName::Frontdesk, &"x".repeat(UDP_BUFSIZE));
        let report = ta.send(&msg, Destination::Addr(b_addr)).await;
        assert!(!report.sent_ok);
        ta.stop();
    }
}
