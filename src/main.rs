//! Meshvault - peer-to-peer encrypted content store

use meshvault_core::{run_demo, run_node, Command};
use std::error::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse CLI arguments and build config
    let command = Command::from_cli()?;

    init_logging(command.log_level());

    match command {
        Command::Start(config) => {
            tracing::info!("Starting Meshvault node on {}...", config.listen_addr);
            run_node(config).await?;
        }
        Command::Demo(demo) => {
            tracing::info!("Starting Meshvault demo with {} nodes...", demo.listen_addrs.len());
            run_demo(demo).await?;
        }
    }

    Ok(())
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
