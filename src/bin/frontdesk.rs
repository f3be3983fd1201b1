//! The Frontdesk binary: registration desk and mirror of the Master.
//!
//! The GUI collaborator drives the node through
//! [`FrontdeskNode`](cubehall::node::FrontdeskNode)'s operator surface;
//! this binary wires the node up and, with `--prompt`, exposes the
//! console for headless administration.

use std::path::Path;

use anyhow::Context;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cubehall::config::Config;
use cubehall::node::prompt::{Prompt, PromptView};
use cubehall::node::FrontdeskNode;
use cubehall::network::transport::{Transport, TransportConfig};
use cubehall::NodeName;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let root = Path::new(".");
    // Like the boxes, the desk runs with defaults on a broken config.
    let config = Config::load_from_root(root).unwrap_or_else(|e| {
        warn!(error = %e, "invalid config, running with defaults");
        Config::default()
    });
    let config_path = Config::default_path(root);

    let transport = Transport::bind(NodeName::Frontdesk, TransportConfig::from_config(&config))
        .await
        .context("failed to bind the shared udp port")?;

    let node = FrontdeskNode::new(transport.clone(), config, Some(config_path))?;
    node.run();

    if std::env::args().any(|arg| arg == "--prompt") {
        let prompt = Prompt::new(transport, PromptView::Game(node.mirror_handle()));
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
