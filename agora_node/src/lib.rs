//! # Agora node
//! Runs the order-lifecycle engine as a long-lived process. The node:
//! * opens the order store and the node's wallets,
//! * feeds inbound peer messages and wallet transactions to the order processor,
//! * resends unacknowledged messages until their recipients confirm them,
//! * periodically publishes the root hash of its public data.
//!
//! ## Configuration
//! The node is configured via environment variables. See [config](config/index.html) for more information.
pub mod cli;
pub mod config;
pub mod errors;
pub mod node;
pub mod transport;
pub mod workers;

use futures::future::join_all;
use log::*;
use tokio_util::sync::CancellationToken;

use crate::{config::NodeConfig, errors::NodeError, node::AgoraNode};

/// Runs a node until the process receives Ctrl-C.
pub async fn run_node(config: NodeConfig) -> Result<(), NodeError> {
    let mut node = AgoraNode::new(config).await?;
    let shutdown = CancellationToken::new();
    let tasks = node.start_workers(shutdown.clone())?;
    info!("🚀️ Node {} is running. Press Ctrl-C to stop.", node.peer_id());
    tokio::signal::ctrl_c().await?;
    info!("🚀️ Shutting down");
    shutdown.cancel();
    join_all(tasks).await.into_iter().filter_map(Result::err).for_each(|e| warn!("🚀️ A worker failed. {e}"));
    node.close().await;
    Ok(())
}
