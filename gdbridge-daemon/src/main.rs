//! `gdbridge`: serve a debug-probe attached microcontroller to GDB.

use anyhow::{Context, Result};
use clap::Parser;
use gdbridge_core::{Board, GdbServer, ServerConfig, ServerEvent, SimBoard, TransportKind};
use log::{error, info, warn};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host to bind to [default: 127.0.0.1]
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on [default: 3333]
    #[arg(short, long)]
    port: Option<u16>,

    /// Carry RSP inside WebSocket binary messages instead of raw TCP
    #[arg(long)]
    websocket: bool,

    /// Largest packet advertised to the client [default: 2048]
    #[arg(long)]
    packet_size: Option<usize>,

    /// Poll interval in milliseconds while the target runs [default: 10]
    #[arg(long)]
    poll_interval: Option<u64>,

    /// JSON configuration file; flags given on the command line win
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Index of probe to use
    #[arg(long, default_value_t = 0)]
    probe_index: usize,

    /// Target chip name, or "auto" to detect it
    #[arg(long, default_value = "auto")]
    chip: String,

    /// Flash page size in bytes [default: from the flash algorithm]
    #[arg(long)]
    page_size: Option<usize>,

    /// Serve a simulated board (no hardware required)
    #[arg(long)]
    mock: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_json_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.websocket {
            config.transport = TransportKind::WebSocket;
        }
        if let Some(packet_size) = self.packet_size {
            config.packet_size = packet_size;
        }
        if let Some(poll_interval) = self.poll_interval {
            config.poll_interval_ms = poll_interval;
        }
        Ok(config)
    }

    fn board(&self) -> Result<Box<dyn Board>> {
        if self.mock {
            info!("Starting in MOCK mode. No hardware will be accessed.");
            return Ok(Box::new(SimBoard::new()));
        }
        self.hardware_board()
    }

    #[cfg(feature = "hardware")]
    fn hardware_board(&self) -> Result<Box<dyn Board>> {
        use gdbridge_core::{ProbeManager, ProbeRsBoard};

        let probe_manager = ProbeManager::new();
        let probes = probe_manager.list_probes();
        if probes.is_empty() {
            anyhow::bail!("No debug probes found");
        }
        for (index, probe) in probes.iter().enumerate() {
            info!("Probe {index}: {probe}");
        }

        let session = probe_manager.attach(self.probe_index, &self.chip)?;
        Ok(Box::new(ProbeRsBoard::new(session, self.page_size)?))
    }

    #[cfg(not(feature = "hardware"))]
    fn hardware_board(&self) -> Result<Box<dyn Board>> {
        anyhow::bail!("Built without probe support, run with --mock")
    }
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::Listening(Some(addr)) => info!("Waiting for GDB on {addr}"),
        ServerEvent::ClientConnected(peer) => info!("GDB connected from {peer}"),
        ServerEvent::ClientDetached(peer) => info!("GDB at {peer} disconnected"),
        ServerEvent::Halted(signal) => info!("Target stopped ({signal:?})"),
        ServerEvent::FlashProgress { written, total } => info!("Flashing: {written}/{total} bytes"),
        ServerEvent::FlashDone => info!("Flashing finished"),
        ServerEvent::FlashFailed(reason) => warn!("Flashing failed: {reason}"),
        ServerEvent::Listening(None) | ServerEvent::Stopped => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    info!("Starting gdbridge...");
    let config = args.server_config()?;
    let board = args.board()?;

    let server = GdbServer::start(config, board)?;
    let events = server.events();
    let event_logger = tokio::task::spawn_blocking(move || {
        for event in events {
            log_event(&event);
        }
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {err}");
    }
    info!("Shutting down...");
    server.shutdown();
    tokio::task::spawn_blocking(move || server.join())
        .await
        .context("Server join task failed")??;
    event_logger.await.context("Event logger task failed")?;

    Ok(())
}
