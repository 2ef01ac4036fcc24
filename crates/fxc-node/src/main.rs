//! Fittexxcoin P2P node.
//!
//! Entry point for the fxc-node binary.

use anyhow::Result;
use clap::Parser;
use fxc_network::NetworkType;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod config;
mod node;
mod wire;

use config::NodeConfig;
use node::Node;

/// Fittexxcoin P2P node.
#[derive(Parser, Debug)]
#[command(name = "fxc-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "fxc-node.toml")]
    config: PathBuf,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Network to connect to (mainnet, testnet, regtest)
    #[arg(short, long, default_value = "mainnet")]
    network: NetworkType,

    /// P2P port
    #[arg(long)]
    port: Option<u16>,

    /// Do not accept inbound connections
    #[arg(long)]
    no_listen: bool,

    /// Connect only to this node (repeatable)
    #[arg(long)]
    connect: Vec<String>,

    /// Keep a connection to this node open (repeatable)
    #[arg(long)]
    add_node: Vec<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Fittexxcoin node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load(&args.config, &args)?;
    info!("Network: {:?}", config.network);
    info!("Data directory: {:?}", config.data_dir);

    let node = Node::new(config)?;
    node.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    node.shutdown().await;

    info!("Fittexxcoin node stopped");
    Ok(())
}
