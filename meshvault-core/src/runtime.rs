//! Node lifecycle
//!
//! Runs a single file server until Ctrl+C, or a small local mesh for the
//! `demo` subcommand.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::signal;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::config::{Config, DemoConfig};
use crate::crypto::EncryptionKey;
use crate::server::{FileServer, ServerError};

const DEMO_PAYLOAD: &[u8] = b"my big data file here!";

/// How long the demo waits for its nodes to find each other
const DEMO_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Run one file server with the given configuration until Ctrl+C
pub async fn run_node(config: Config) -> Result<(), ServerError> {
    let server = Arc::new(FileServer::new(config.server_opts()?));
    info!("Storage root: {}", server.storage().root().display());

    let stopper = server.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down...");
                stopper.stop();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    server.start().await?;

    info!("Node stopped");
    Ok(())
}

/// Boot a local mesh, then store, delete and re-fetch files through the last node
pub async fn run_demo(demo: DemoConfig) -> Result<(), ServerError> {
    let key = EncryptionKey::generate();

    let mut nodes = Vec::with_capacity(demo.listen_addrs.len());
    let mut handles = Vec::with_capacity(demo.listen_addrs.len());
    for index in 0..demo.listen_addrs.len() {
        let (server, mut handle) = spawn_node(demo.node_config(index, &key))?;
        // Later nodes bootstrap to this one, so it has to be listening first
        tokio::select! {
            _ = server.local_addr() => {}
            result = &mut handle => return Err(exited_early(result)),
        }
        nodes.push(server);
        handles.push(handle);
    }

    let expected = nodes.len() - 1;
    let connected = tokio::time::timeout(DEMO_CONNECT_TIMEOUT, async {
        while nodes.iter().any(|node| node.peer_count() < expected) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if connected.is_err() {
        warn!("Not every demo node connected to every other node; continuing anyway");
    }

    let result = exercise(&nodes, demo.keys).await;

    for node in &nodes {
        node.stop();
    }
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Demo node failed: {}", e),
            Err(e) => error!("Demo node task panicked: {}", e),
        }
    }

    result
}

fn spawn_node(
    config: Config,
) -> Result<(Arc<FileServer>, JoinHandle<Result<(), ServerError>>), ServerError> {
    let server = Arc::new(FileServer::new(config.server_opts()?));
    let runner = server.clone();
    let handle = tokio::spawn(async move { runner.start().await });
    Ok((server, handle))
}

/// Error of a node task that ended before it started listening
fn exited_early(result: Result<Result<(), ServerError>, JoinError>) -> ServerError {
    match result {
        Ok(Err(e)) => e,
        Ok(Ok(())) => ServerError::Io(std::io::Error::other("node exited before listening")),
        Err(e) => ServerError::Io(std::io::Error::other(e.to_string())),
    }
}

async fn exercise(nodes: &[Arc<FileServer>], keys: usize) -> Result<(), ServerError> {
    let Some(node) = nodes.last() else {
        return Ok(());
    };

    for i in 0..keys {
        let key = format!("picture_{}.jpg", i);

        node.store(&key, &mut &DEMO_PAYLOAD[..]).await?;
        node.delete_local(&key).await?;

        let (size, mut file) = node.get(&key).await?;
        let mut contents = Vec::with_capacity(size as usize);
        file.read_to_end(&mut contents).await?;

        info!(
            "[{}] Fetched {} back over the network: {:?}",
            node.listen_addr(),
            key,
            String::from_utf8_lossy(&contents)
        );
    }

    Ok(())
}
