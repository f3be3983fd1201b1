//! The Master binary: authoritative coordinator of the attraction.
//!
//! An invalid configuration is fatal here (and only here): the Master
//! refuses to run rather than coordinate the hall with wrong rules.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cubehall::config::Config;
use cubehall::io::archive::{SqliteArchive, TeamArchive};
use cubehall::io::rgb::RgbClient;
use cubehall::io::sound::CueSoundPlayer;
use cubehall::node::prompt::{Prompt, PromptView};
use cubehall::node::MasterNode;
use cubehall::network::transport::{Transport, TransportConfig};
use cubehall::NodeName;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let root = Path::new(".");
    let config = Config::load_from_root(root).context("master refuses to run without a valid config")?;
    let config_path = Config::default_path(root);

    let transport = Transport::bind(NodeName::Master, TransportConfig::from_config(&config))
        .await
        .context("failed to bind the shared udp port")?;

    let archive: Option<Arc<dyn TeamArchive>> = match SqliteArchive::open_from_root(root) {
        Ok(archive) => Some(Arc::new(archive)),
        Err(e) => {
            warn!(error = %e, "running without the team archive");
            None
        }
    };
    let rgb = match RgbClient::connect().await {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(error = %e, "running without the rgb daemon");
            None
        }
    };

    let node = MasterNode::new(
        transport.clone(),
        config,
        Some(config_path),
        Arc::new(CueSoundPlayer),
        archive,
        rgb,
    );
    node.run();

    if std::env::args().any(|arg| arg == "--prompt") {
        let prompt = Prompt::new(transport, PromptView::Game(node.state_handle()));
        let mut shutdown_rx = node.subscribe_shutdown();
        tokio::select! {
            _ = prompt.run() => {}
            _ = shutdown_rx.recv() => {}
        }
    } else {
        let mut shutdown_rx = node.subscribe_shutdown();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = shutdown_rx.recv() => {}
        }
    }

    node.stop();
    if node.reboot_requested() {
        warn!("reboot requested; hand over to the service supervisor");
    }
    Ok(())
}
