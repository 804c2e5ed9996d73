//! concert-server: WebSocket host for multi-user sessions.

use std::path::{Path, PathBuf};

use clap::Parser;
use log::info;

use concert_sync::{ServerConfig, SessionServer};

#[derive(Parser)]
#[command(name = "concert-server")]
#[command(about = "Multi-user session sync server")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "concert.toml")]
    config: PathBuf,

    /// Listen address (overrides config file)
    #[arg(short, long, env = "CONCERT_BIND_ADDR")]
    bind: Option<String>,

    /// Root for session, archive and blob directories (overrides config file)
    #[arg(short, long, env = "CONCERT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Heartbeat interval in seconds (overrides config file)
    #[arg(long)]
    heartbeat_secs: Option<u64>,
}

fn load_config(cli: &Cli) -> anyhow::Result<ServerConfig> {
    let mut config = if Path::new(&cli.config).exists() {
        ServerConfig::load(&cli.config)?
    } else {
        info!("Config file {} not found, using defaults", cli.config.display());
        ServerConfig::default()
    };

    if let Some(bind) = &cli.bind {
        config.bind_addr = bind.clone();
    }
    if let Some(root) = &cli.data_dir {
        config.working_dir = root.join("sessions");
        config.archive_dir = root.join("archives");
        config.blob_dir = root.join("blobs");
    }
    if let Some(secs) = cli.heartbeat_secs {
        config.heartbeat_interval_secs = secs;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    info!("Starting concert-server");
    info!("Sessions: {}", config.working_dir.display());
    info!("Archives: {}", config.archive_dir.display());

    let server = SessionServer::open(config)?;
    let serving = tokio::spawn(server.clone().run());

    tokio::select! {
        result = serving => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    server.close_all().await;
    Ok(())
}
