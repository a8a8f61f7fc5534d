//! CLI for cluster metadata operations

use anyhow::Context;
use clap::{Parser, Subcommand};
use minimeta::common::{AttrMap, ClientConfig, MetaNamespace, MetaValue};
use minimeta::ClusterClient;

#[derive(Parser)]
#[command(name = "minimeta")]
#[command(about = "minimeta cluster metadata CLI")]
#[command(version)]
struct Cli {
    /// Server nodes (comma-separated host:port)
    #[arg(long, value_delimiter = ',', default_value = "127.0.0.1:6000")]
    server: Vec<String>,

    /// Budget per request, retries included
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge attributes into an entry
    Put {
        /// SERVER_META or PROCESS_META
        namespace: MetaNamespace,
        key: String,
        /// Attributes as name=value
        #[arg(required = true, value_parser = parse_attr)]
        attrs: Vec<(String, MetaValue)>,
    },

    /// Show one entry, or the whole namespace when no key is given
    Get {
        namespace: MetaNamespace,
        key: Option<String>,
    },

    /// Remove an entry
    Delete { namespace: MetaNamespace, key: String },

    /// Raft status of the attached server
    Status,

    /// Online servers, least loaded first
    Servers,

    /// Change cluster membership
    Members {
        #[command(subcommand)]
        action: MemberCommand,
    },
}

#[derive(Subcommand)]
enum MemberCommand {
    /// Add a voter (host:port)
    Add { addr: String },
    /// Remove a voter
    Remove { id: String },
}

fn parse_attr(s: &str) -> Result<(String, MetaValue), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {}", s))?;
    let value = value.parse::<MetaValue>().map_err(|e| e.to_string())?;
    Ok((name.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = ClientConfig {
        request_timeout_ms: cli.timeout_ms,
        ..ClientConfig::new(cli.server)
    };
    let client = ClusterClient::new(config)?;

    match cli.command {
        Commands::Put {
            namespace,
            key,
            attrs,
        } => {
            let attrs: AttrMap = attrs.into_iter().collect();
            let index = client.put_cluster_meta(namespace, &key, attrs).await?;
            println!("OK (index {})", index);
        }

        Commands::Get { namespace, key } => {
            let entries = client
                .get_cluster_meta(namespace, key.as_deref().unwrap_or(""))
                .await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }

        Commands::Delete { namespace, key } => {
            let index = client.delete_cluster_meta(namespace, &key).await?;
            println!("OK (index {})", index);
        }

        Commands::Status => {
            let status = client.cluster_status().await?;
            println!("Node: {} ({})", status.node_name, status.addr);
            println!("  Role: {}", status.raft.role);
            println!("  Term: {}", status.raft.term);
            println!(
                "  Leader: {}",
                status.raft.leader_id.as_deref().unwrap_or("unknown")
            );
            println!("  Commit index: {}", status.raft.commit_index);
            println!("  Last applied: {}", status.raft.last_applied);
            println!("  Snapshot index: {}", status.raft.snapshot_index);
            println!("  Members:");
            for (id, addr) in &status.raft.members {
                println!("    {} -> {}", id, addr);
            }
        }

        Commands::Servers => {
            let online = client.online_servers().await?;
            if let Some((name, _)) = client.idle_server().await? {
                println!("Idle: {}", name);
            }
            for name in online.keys() {
                println!("{}", name);
            }
        }

        Commands::Members { action } => {
            let index = match action {
                MemberCommand::Add { addr } => client
                    .add_voter(addr.clone(), addr)
                    .await
                    .context("add voter")?,
                MemberCommand::Remove { id } => {
                    client.remove_voter(id).await.context("remove voter")?
                }
            };
            println!("OK (index {})", index);
        }
    }

    Ok(())
}
