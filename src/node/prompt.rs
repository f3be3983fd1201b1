//! The `--prompt` interactive console.
//!
//! A thin operator shell shared by the three binaries: it reads stdin
//! lines, answers the built-in queries from the node's state, and
//! broadcasts anything else as a COMMAND so the named target executes it.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::RwLock;

use crate::core::time::{self, format_hms};
use crate::core::nodes::NodeName;
use crate::game::cubebox::CubeboxStatus;
use crate::game::status::GameStatus;
use crate::network::message::Message;
use crate::network::transport::Transport;

/// How long `whois` waits for the I_AM to land in the directory.
const WHOIS_WAIT: Duration = Duration::from_millis(500);

/// What the console can show: the full game view (Master, Frontdesk) or
/// one box's local status (Cubebox).
pub enum PromptView {
    /// Teams plus cubeboxes.
    Game(Arc<RwLock<GameStatus>>),
    /// One cubebox's own status.
    Cubebox(Arc<RwLock<CubeboxStatus>>),
}

/// The console itself.
pub struct Prompt {
    transport: Arc<Transport>,
    view: PromptView,
}

const HELP: &str = "\
commands:
  help                 this text
  quit                 stop the node
  teams                live teams (game view)
  cubeboxes            cubebox states
  netinfo              known peers
  whois <node>         locate a node on the LAN
  <node> <command>     send a command (e.g. `CubeBox3 reset`)";

impl Prompt {
    /// Console over a node's transport and state view.
    pub fn new(transport: Arc<Transport>, view: PromptView) -> Self {
        Self { transport, view }
    }

    /// Read stdin until `quit` or end-of-input.
    pub async fn run(&self) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("{} console; `help` lists commands", self.transport.node_name());
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if !self.handle_line(line.trim()).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    eprintln!("stdin error: {e}");
                    break;
                }
            }
        }
    }

    /// Returns `false` when the console should close.
    pub async fn handle_line(&self, line: &str) -> bool {
        match line {
            "" => {}
            "quit" => return false,
            "help" => println!("{HELP}"),
            "teams" => self.show_teams().await,
            "cubeboxes" => self.show_cubeboxes().await,
            "netinfo" => self.show_netinfo().await,
            _ => {
                if let Some(target) = line.strip_prefix("whois ") {
                    self.whois(target.trim()).await;
                } else {
                    self.inject_command(line).await;
                }
            }
        }
        true
    }

    async fn show_teams(&self) {
        let PromptView::Game(game) = &self.view else {
            println!("no team view on this node");
            return;
        };
        let game = game.read().await;
        if game.teams.is_empty() {
            println!("no live team");
            return;
        }
        let now = time::now();
        for team in game.teams.iter() {
            let cube = team
                .current_cubebox_id
                .map(|id| format!("cube {id}"))
                .unwrap_or_else(|| "-".into());
            let left = team
                .remaining_time(now)
                .map(format_hms)
                .unwrap_or_else(|| "not started".into());
            println!(
                "{:<16} uid={} playing={:<8} done={:<2} left={}",
                team.name,
                team.rfid_uid,
                cube,
                team.completed_cubeboxes.len(),
                left,
            );
        }
    }

    async fn show_cubeboxes(&self) {
        match &self.view {
            PromptView::Game(game) => {
                let game = game.read().await;
                for cube in game.cubeboxes.iter() {
                    println!(
                        "cube {:<2} {:?} team={}",
                        cube.cube_id,
                        cube.state,
                        cube.current_team_name.as_deref().unwrap_or("-"),
                    );
                }
            }
            PromptView::Cubebox(status) => {
                let status = status.read().await;
                println!("{}", status.to_json());
            }
        }
    }

    async fn show_netinfo(&self) {
        let nodes = self.transport.nodes();
        let nodes = nodes.read().await;
        if nodes.is_empty() {
            println!("no peer seen yet");
            return;
        }
        let now = time::now();
        for info in nodes.iter() {
            println!(
                "{:<12} {}:{}  seen {}s ago",
                info.name.to_string(),
                info.ip,
                info.port,
                (now - info.last_seen).max(0.0) as u64,
            );
        }
    }

    async fn whois(&self, target: &str) {
        let Some(name) = NodeName::parse(target) else {
            println!("unknown node name {target:?}");
            return;
        };
        let msg = Message::who_is(self.transport.node_name(), name);
        self.transport.broadcast(&msg).await;
        tokio::time::sleep(WHOIS_WAIT).await;

        let nodes = self.transport.nodes();
        let nodes = nodes.read().await;
        match nodes.get(name) {
            Some(info) => println!("{} is at {}:{}", name, info.ip, info.port),
            None => println!("{name} did not answer"),
        }
    }

    async fn inject_command(&self, line: &str) {
        let msg = Message::command(self.transport.node_name(), line);
        let report = self.transport.broadcast(&msg).await;
        if report.ack_ok {
            println!("ok");
        } else {
            println!("not confirmed (sent={}, info={})", report.sent_ok, report.ack_info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::TransportConfig;
    use std::net::{IpAddr, Ipv4Addr};

    async fn console() -> Prompt {
        let transport = Transport::bind(
            NodeName::Frontdesk,
            TransportConfig {
                port: 0,
                broadcast_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                ack_timeout: Duration::from_millis(50),
                max_tries: 1,
            },
        )
        .await
        .unwrap();
        Prompt::new(transport, PromptView::Game(Default::default()))
    }

    #[tokio::test]
    async fn test_quit_closes_the_console() {
        let prompt = console().await;
        assert!(prompt.handle_line("").await);
        assert!(prompt.handle_line("help").await);
        assert!(prompt.handle_line("teams").await);
        assert!(prompt.handle_line("cubeboxes").await);
        assert!(prompt.handle_line("netinfo").await);
        assert!(!prompt.handle_line("quit").await);
        prompt.transport.stop();
    }

    #[tokio::test]
    async fn test_whois_rejects_bad_names() {
        let prompt = console().await;
        // Not a node name: reported, nothing sent, console stays open.
        assert!(prompt.handle_line("whois Nobody").await);
        prompt.transport.stop();
    }
}
