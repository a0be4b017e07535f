use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bitmessage_core::repository::KnownNode;
use bitmessage_node::config::NodeConfig;
use bitmessage_node::node::{Node, Repositories};

#[derive(Parser)]
#[command(name = "bitmessage-node")]
#[command(about = "Bitmessage protocol node", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Data directory path
    #[arg(long)]
    datadir: Option<String>,

    /// Seed peers (host:port, repeatable)
    #[arg(long)]
    connect: Vec<String>,

    /// Do not accept inbound connections
    #[arg(long)]
    no_listen: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let mut config = match &cli.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(datadir) = cli.datadir.clone() {
        config.datadir = datadir;
    }
    if cli.no_listen {
        config.listen = false;
    }

    let repositories = Repositories::open(Path::new(&config.datadir))?;
    seed_registry(&repositories, &config, &cli.connect).await;

    let mut node = Node::new(config, repositories)?;
    node.run_until_shutdown().await
}

/// Feeds `--connect` endpoints into the node registry so the agent has
/// somewhere to dial on first start.
async fn seed_registry(repositories: &Repositories, config: &NodeConfig, seeds: &[String]) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    for seed in seeds {
        let Ok(addr) = seed.parse::<std::net::SocketAddr>() else {
            warn!("ignoring unparsable seed {:?}", seed);
            continue;
        };
        for stream in &config.streams {
            let node = KnownNode {
                ip: addr.ip(),
                port: addr.port(),
                stream: *stream,
                services: 1,
                last_seen: now,
            };
            if let Err(e) = repositories.nodes.offer(std::slice::from_ref(&node)).await {
                warn!("could not seed registry: {}", e);
            }
        }
        info!(peer = %addr, "seeded");
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
