use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hoard::{telemetry, FileServer};
use hoardconf::{ConfigSources, HoardConfig};
use hoardproto::TcpTransport;
use tokio::io::AsyncWriteExt;

/// Peer-to-peer replicated content store
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file used in place of ./hoard.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a node until interrupted
    Serve {
        /// Address to listen on (e.g. "0.0.0.0:3000")
        #[arg(short, long)]
        listen: Option<String>,

        /// Storage root directory
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Peers to dial at startup; repeatable
        #[arg(short, long)]
        bootstrap: Vec<String>,
    },

    /// Store a file under KEY and replicate it to the bootstrap peers
    Put {
        key: String,

        /// File to read; stdin when omitted
        file: Option<PathBuf>,

        #[arg(short, long)]
        bootstrap: Vec<String>,

        #[arg(short, long)]
        root: Option<PathBuf>,

        #[arg(short, long, default_value = "0.0.0.0:0")]
        listen: String,
    },

    /// Fetch KEY locally or from the bootstrap peers
    Get {
        key: String,

        #[arg(short, long)]
        bootstrap: Vec<String>,

        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Write here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,

        #[arg(short, long, default_value = "0.0.0.0:0")]
        listen: String,
    },

    /// Print the effective configuration and where it came from
    Config,
}

fn apply_cli(
    config: &mut HoardConfig,
    listen: Option<String>,
    root: Option<PathBuf>,
    bootstrap: Vec<String>,
) {
    if let Some(listen) = listen {
        config.infra.bind.listen = listen;
    }
    if let Some(root) = root {
        config.infra.paths.storage_root = root;
    }
    if !bootstrap.is_empty() {
        config.bootstrap.peers = bootstrap;
    }
}

async fn start_node(config: &HoardConfig) -> Result<Arc<FileServer<TcpTransport>>> {
    std::fs::create_dir_all(&config.infra.paths.storage_root).with_context(|| {
        format!(
            "Failed to create storage root {}",
            config.infra.paths.storage_root.display()
        )
    })?;

    let server = FileServer::from_config(config).context("Failed to open store")?;
    server.start().await.context("Failed to start node")?;
    Ok(server)
}

fn print_config(config: &HoardConfig, sources: &ConfigSources) {
    print!("{}", config.to_toml());
    println!("\n# sources");
    for file in &sources.files {
        println!("#   file: {}", file.display());
    }
    for var in &sources.env_overrides {
        println!("#   env:  {}", var);
    }
}

/// Logging is skipped for `config` so its output stays pure TOML.
fn init_logging(config: &HoardConfig, sources: &ConfigSources) -> Result<()> {
    telemetry::init(&config.infra.telemetry.log_level)?;
    for file in &sources.files {
        tracing::debug!("config file: {}", file.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = HoardConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Command::Config => print_config(&config, &sources),

        Command::Serve {
            listen,
            root,
            bootstrap,
        } => {
            init_logging(&config, &sources)?;
            apply_cli(&mut config, listen, root, bootstrap);
            tracing::info!(
                "📦 Storage root: {}",
                config.infra.paths.storage_root.display()
            );

            let server = start_node(&config).await?;
            tracing::info!("   peers: {}", server.peer_count());

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for ctrl-c")?;
            tracing::info!("🛑 Shutting down");
            server.stop().await?;
        }

        Command::Put {
            key,
            file,
            bootstrap,
            root,
            listen,
        } => {
            init_logging(&config, &sources)?;
            apply_cli(&mut config, Some(listen), root, bootstrap);
            let server = start_node(&config).await?;

            let size = match file {
                Some(path) => {
                    let mut reader = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("Failed to open {}", path.display()))?;
                    server.store_data(&key, &mut reader).await?
                }
                None => server.store_data(&key, &mut tokio::io::stdin()).await?,
            };
            tracing::info!("stored {} ({} bytes) on {} peers", key, size, server.peer_count());

            server.stop().await?;
        }

        Command::Get {
            key,
            bootstrap,
            root,
            out,
            listen,
        } => {
            init_logging(&config, &sources)?;
            apply_cli(&mut config, Some(listen), root, bootstrap);
            let server = start_node(&config).await?;

            let (size, mut file) = server.get(&key).await?;
            let copied = match out {
                Some(path) => {
                    let mut dst = tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    let n = tokio::io::copy(&mut file, &mut dst).await?;
                    dst.flush().await?;
                    n
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    let n = tokio::io::copy(&mut file, &mut stdout).await?;
                    stdout.flush().await?;
                    n
                }
            };
            tracing::info!("fetched {} ({} of {} bytes)", key, copied, size);

            server.stop().await?;
        }
    }

    Ok(())
}
