//! A Cubebox binary: one puzzle station's controller.
//!
//! The box identifies itself from `local_node_name` in the config, or
//! from the digits of the hostname (`cubebox3` boots as `CubeBox3`).
//! Without RFID hardware the box reads badge uids from stdin, one per
//! line, per the keyboard fallback.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cubehall::config::Config;
use cubehall::core::rfid::{RfidFeed, RfidLine};
use cubehall::core::time;
use cubehall::io::button::SimulatedButton;
use cubehall::io::sound::CueSoundPlayer;
use cubehall::node::prompt::{Prompt, PromptView};
use cubehall::node::CubeboxNode;
use cubehall::network::transport::{Transport, TransportConfig};
use cubehall::NodeName;

fn local_node_name(config: &Config) -> anyhow::Result<NodeName> {
    if let Some(name) = &config.local_node_name {
        return NodeName::parse(name)
            .with_context(|| format!("bad local_node_name {name:?} in config"));
    }
    let hostname = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .unwrap_or_default();
    match NodeName::from_hostname_digits(&hostname) {
        Some(name) => Ok(name),
        None => bail!(
            "cannot derive a cubebox id from hostname {hostname:?}; set local_node_name in config"
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let root = Path::new(".");
    // Unlike the Master, a box runs with defaults on a broken config.
    let config = Config::load_from_root(root).unwrap_or_else(|e| {
        warn!(error = %e, "invalid config, running with defaults");
        Config::default()
    });
    let config_path = Config::default_path(root);
    let name = local_node_name(&config)?;

    let transport = Transport::bind(name, TransportConfig::from_config(&config))
        .await
        .context("failed to bind the shared udp port")?;

    let (injector, feed) = RfidFeed::channel(32);
    let button = Arc::new(SimulatedButton::new());
    let node = CubeboxNode::new(
        transport.clone(),
        config,
        Some(config_path),
        Arc::new(CueSoundPlayer),
        button,
        feed,
    )?;
    node.run();

    if std::env::args().any(|arg| arg == "--prompt") {
        let prompt = Prompt::new(transport, PromptView::Cubebox(node.status_handle()));
        let mut shutdown_rx = node.subscribe_shutdown();
        tokio::select! {
            _ = prompt.run() => {}
            _ = shutdown_rx.recv() => {}
        }
    } else {
        // Keyboard fallback: stdin lines are badge reads.
        let mut shutdown_rx = node.subscribe_shutdown();
        let stdin_badges = async {
            use tokio::io::AsyncBufReadExt;
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                injector.inject(RfidLine::new(line.trim(), time::now())).await;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = shutdown_rx.recv() => {}
            _ = stdin_badges => {}
        }
    }

    node.stop();
    if node.reboot_requested() {
        warn!("reboot requested; hand over to the service supervisor");
    }
    Ok(())
}
