//! CLI binary for viva.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use viva::audio::capture::CpalCapture;
use viva::audio::playback::CpalOutput;
use viva::{CpalBackend, RuntimeEvent, VoiceConfig, VoiceSession};

/// Viva: real-time duplex voice conversation.
#[derive(Parser)]
#[command(name = "viva", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Hold one spoken conversation turn with the voice service.
    Talk,

    /// List available audio devices.
    Devices,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Users can override with RUST_LOG=debug to see everything.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("viva=info,tungstenite=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => VoiceConfig::from_file(path)?,
        None => {
            let path = VoiceConfig::default_config_path();
            if path.exists() {
                info!("loading config from {}", path.display());
                VoiceConfig::from_file(&path)?
            } else {
                VoiceConfig::default()
            }
        }
    };

    match cli.command.unwrap_or(Command::Talk) {
        Command::Talk => run_talk(config).await,
        Command::Devices => list_devices(),
    }
}

async fn run_talk(config: VoiceConfig) -> anyhow::Result<()> {
    println!("Viva v{}", env!("CARGO_PKG_VERSION"));

    let (events_tx, mut events_rx) = broadcast::channel::<RuntimeEvent>(256);
    let mut session = VoiceSession::start(config, Arc::new(CpalBackend), Arc::new(events_tx))?;

    tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(RuntimeEvent::StateChanged { from, to }) => println!("[{from} -> {to}]"),
                Ok(RuntimeEvent::Speaking(true)) => println!("(speaking)"),
                Ok(RuntimeEvent::Speaking(false)) => println!("(listening)"),
                Ok(RuntimeEvent::Error(kind)) => eprintln!("session error: {kind}"),
                Ok(RuntimeEvent::Level(_)) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("dropped {n} events"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    println!("\nConnecting... Speak when the interviewer is done. Press Ctrl+C to stop.\n");

    let state = tokio::select! {
        state = session.wait() => state,
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down...");
            session.end().await
        }
    };
    println!("\nSession ended ({state})");

    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalCapture::list_input_devices()? {
        println!("  - {name}");
    }

    println!("\nOutput devices:");
    for name in CpalOutput::list_output_devices()? {
        println!("  - {name}");
    }

    Ok(())
}
