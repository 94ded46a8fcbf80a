//! voxlink daemon - spoken conversation with a remote voice agent
//!
//! Runs as a background service. The microphone, barge-in monitor and agent
//! connection are driven from a Unix socket (`connect`, `mic`, `say`, ...).

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use voxlink_agent::PlaybackEngine;
use voxlink_audio::{AudioCapture, AudioPlayer};
use voxlink_daemon::{Daemon, DaemonConfig, IpcServer};

#[derive(Parser, Debug)]
#[command(name = "voxlink-daemon", version, about)]
struct Args {
    /// Configuration file (default: <config dir>/voxlink/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pre-authorized agent URL, overrides the configured one
    #[arg(long)]
    signed_url: Option<String>,

    /// Print audio input devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    if args.list_devices {
        AudioCapture::print_devices().context("Failed to list audio devices")?;
        return Ok(());
    }

    info!("🎙️ Starting voxlink daemon v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => DaemonConfig::load_from(path),
        None => DaemonConfig::load(),
    }
    .context("Failed to load configuration")?;

    if let Some(url) = args.signed_url {
        config.signed_url = Some(url);
    }

    info!("📋 Configuration loaded from {}", config.config_path.display());

    let playback: Option<Arc<dyn PlaybackEngine>> = match AudioPlayer::open() {
        Ok(player) => {
            info!("🔊 Agent audio at {} Hz", player.device_rate());
            Some(Arc::new(player) as Arc<dyn PlaybackEngine>)
        }
        Err(e) => {
            warn!("⚠️ No output device, agent audio will not play: {}", e);
            None
        }
    };

    let daemon = Daemon::new(config.clone(), playback).context("Failed to initialize daemon")?;

    let ipc_server = IpcServer::new(&config.socket_path).context("Failed to start IPC server")?;
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let server = tokio::spawn(async move {
        if let Err(e) = ipc_server.run(requests_tx).await {
            error!("IPC server error: {}", e);
        }
    });

    info!("🚀 voxlink daemon ready on {}", config.socket_path);
    if config.signed_url.is_none() {
        info!("   No signed URL configured; pass one with 'connect <url>'");
    }

    let result = daemon.run(requests_rx).await;

    server.abort();
    info!("👋 voxlink daemon stopped");

    result
}
