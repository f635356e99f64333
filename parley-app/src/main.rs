//! Parley headless host: live voice conversation from the terminal.
//!
//! ```text
//! parley run [--url ws://host:port/ws] [--no-capture] [--json]
//! parley devices
//! parley config [--write]
//! ```
//!
//! While `run` is active, typed lines are sent as text input. Ctrl-C tears
//! the session down (microphone, speaker, socket) before exiting.

mod console;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::OutputMode;
use parley_core::{
    audio::device::{list_input_devices, list_output_devices},
    CpalDevice, VoiceSession, WebSocketTransport,
};
use settings::{default_settings_path, load_settings, save_settings, AppSettings};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "parley", version)]
#[command(about = "Real-time spoken conversation client")]
struct Cli {
    /// Settings file (defaults to the per-user config directory).
    #[arg(long, global = true, env = "PARLEY_SETTINGS")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, capture and converse until Ctrl-C.
    Run {
        /// Service endpoint, overriding the settings file.
        #[arg(long, env = "PARLEY_URL")]
        url: Option<String>,
        /// Listen only; do not open the microphone.
        #[arg(long)]
        no_capture: bool,
        /// Print session events as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// List audio input and output devices.
    Devices,
    /// Print the effective settings.
    Config {
        /// Also write them back to the settings file.
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=info,parley_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings_path = cli.settings.unwrap_or_else(default_settings_path);
    let settings = load_settings(&settings_path);

    match cli.command {
        Commands::Run {
            url,
            no_capture,
            json,
        } => {
            let mut settings = settings;
            if let Some(url) = url {
                settings.server_url = url;
                settings.normalize();
            }
            let mode = if json {
                OutputMode::Json
            } else {
                OutputMode::Human
            };
            run(settings, !no_capture, mode).await
        }
        Commands::Devices => {
            print_devices();
            Ok(())
        }
        Commands::Config { write } => {
            println!("# {}", settings_path.display());
            println!("{}", serde_json::to_string_pretty(&settings)?);
            if write {
                save_settings(&settings_path, &settings)
                    .with_context(|| format!("writing {}", settings_path.display()))?;
                eprintln!("saved");
            }
            Ok(())
        }
    }
}

async fn run(settings: AppSettings, capture: bool, mode: OutputMode) -> Result<()> {
    info!(url = settings.server_url.as_str(), capture, "parley starting");

    let session = Arc::new(VoiceSession::new(
        settings.session_config(),
        Arc::new(CpalDevice::new()),
        Arc::new(WebSocketTransport::new()),
    ));
    let printer = tokio::spawn(console::print_events(session.subscribe(), mode));

    session.connect();
    if capture {
        let opener = Arc::clone(&session);
        tokio::task::spawn_blocking(move || opener.start())
            .await?
            .context("microphone could not be opened (try --no-capture)")?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    if !session.send_text(text) {
                        warn!("not connected, input dropped");
                    }
                }
                // stdin closed: keep the conversation running on audio alone.
                Ok(None) => {
                    tokio::signal::ctrl_c().await?;
                    break;
                }
                Err(e) => {
                    warn!("stdin read failed: {e}");
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
        }
    }

    let diagnostics = session.diagnostics_snapshot();
    let closer = Arc::clone(&session);
    tokio::task::spawn_blocking(move || closer.shutdown()).await?;
    printer.abort();
    info!(
        frames_forwarded = diagnostics.frames_forwarded,
        frames_skipped = diagnostics.frames_skipped,
        interruptions = diagnostics.interruptions,
        inbound_audio = diagnostics.inbound_audio,
        speech_starts = diagnostics.capture.speech_starts,
        "session ended"
    );
    Ok(())
}

fn print_devices() {
    for (label, devices) in [
        ("input", list_input_devices()),
        ("output", list_output_devices()),
    ] {
        println!("{label} devices:");
        if devices.is_empty() {
            println!("  (none)");
        }
        for device in devices {
            let marker = if device.is_default { "*" } else { " " };
            println!("  {marker} {}", device.name);
        }
    }
}
