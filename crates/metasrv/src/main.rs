//! Meta server entry point

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use metasrv::config::Config;
use metasrv::MetaSrv;

/// Cluster meta server
#[derive(Parser, Debug)]
#[command(name = "metasrv")]
#[command(about = "Control plane for a distributed time-series database cluster")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the listen address
    #[arg(long)]
    addr: Option<String>,

    /// Override the HTTP port
    #[arg(long)]
    http_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.addr = addr;
    }
    if let Some(http_port) = args.http_port {
        config.http_port = http_port;
    }

    // Initialize logging
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting meta server...");
    info!("  Endpoint: {}", config.endpoint());
    info!("  Default cluster: {}", config.default_cluster_name);
    info!(
        "  Topology: {}, {} shards over {} nodes",
        config.topology_type, config.default_cluster_shard_total, config.default_cluster_node_count
    );

    let srv = MetaSrv::new(config).await?;
    srv.run().await?;

    Ok(())
}
