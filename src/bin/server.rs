//! Server node binary

use clap::{Parser, Subcommand};
use minimeta::common::{Config, ReadPolicy, ServerConfig};
use minimeta::ClusterServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minimeta-server")]
#[command(about = "minimeta cluster server node with Raft consensus")]
#[command(version)]
struct Cli {
    /// Config file (TOML); MINIMETA__* env vars override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a server node
    Serve {
        /// Bind address for the cluster RPC surface
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Host advertised to peers
        #[arg(long)]
        advertise_host: Option<String>,

        /// Data directory
        #[arg(long)]
        data: Option<PathBuf>,

        /// Voting members, this node included (comma-separated host:port)
        #[arg(long, value_delimiter = ',')]
        peers: Vec<String>,

        /// Only the leader answers reads
        #[arg(long)]
        leader_reads: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            bind,
            advertise_host,
            data,
            peers,
            leader_reads,
        } => {
            // CLI arguments take priority over the file
            let mut server_config = config.server.unwrap_or_default();
            if let Some(bind) = bind {
                server_config.bind_addr = bind;
            }
            if advertise_host.is_some() {
                server_config.advertise_host = advertise_host;
            }
            if let Some(data) = data {
                server_config.data_dir = data;
            }
            if !peers.is_empty() {
                server_config.peers = peers;
            }
            if leader_reads {
                server_config.read_policy = ReadPolicy::Leader;
            }
            serve(server_config).await?;
        }
    }

    Ok(())
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let server = ClusterServer::start(config).await?;
    tracing::info!(
        "{} serving as {}",
        minimeta::BUILD_INFO,
        server.cluster_node_name()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    server.shutdown().await;
    Ok(())
}
