//! Session capture and replay tool for smart telescopes.
//!
//! Subcommands:
//! - `record`: Proxy a client to a real device and save the session on Ctrl-C
//!   or after `--duration` seconds
//! - `replay`: Serve a saved session as if it were the device
//! - `probe`: Connect, print system info and a status snapshot, disconnect
//! - `list`: List stored recordings

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hardware::recording::{PlaybackServer, SessionRecorder};
use hardware::seestar::{ClientConfig, ProtocolClient};
use shared::{ConfigStorage, ObservatoryContext};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Smart Telescope Session Tool
#[derive(Parser, Debug)]
#[command(name = "session_tool")]
#[command(about = "Record, replay, and probe smart telescope protocol sessions")]
#[command(version)]
struct Args {
    /// Config directory (defaults to ~/.seestar_config)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Device host (overrides the stored config)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Device port (overrides the stored config)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Relay a client to the device and record every frame until Ctrl-C
    Record {
        /// Recording name under the config recordings directory
        #[arg(short, long)]
        name: String,

        /// Write to this file instead of the recordings directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Free-form device label stored in the metadata
        #[arg(long, default_value = "seestar")]
        label: String,

        /// Description stored in the metadata
        #[arg(short, long, default_value = "")]
        description: String,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Play a recording back on a local port until Ctrl-C
    Replay {
        /// Recording file, or the name of a stored recording
        recording: String,

        /// Local port to listen on (0 picks one)
        #[arg(short = 'l', long, default_value = "0")]
        listen_port: u16,
    },

    /// Query device info and current status
    Probe,

    /// List stored recordings
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    let storage = match &args.config_dir {
        Some(dir) => ConfigStorage::with_path(dir.clone()),
        None => ConfigStorage::new().context("Failed to locate config directory")?,
    };
    let mut context = ObservatoryContext::load(storage).context("Failed to load config")?;
    if let Some(host) = args.host {
        context.config.device.host = host;
    }
    if let Some(port) = args.port {
        context.config.device.port = port;
    }

    match args.command {
        Command::Record {
            name,
            output,
            label,
            description,
            duration,
        } => cmd_record(&context, &name, output, &label, &description, duration).await,
        Command::Replay {
            recording,
            listen_port,
        } => cmd_replay(&context, &recording, listen_port).await,
        Command::Probe => cmd_probe(&context).await,
        Command::List => cmd_list(&context),
    }
}

async fn cmd_record(
    context: &ObservatoryContext,
    name: &str,
    output: Option<PathBuf>,
    label: &str,
    description: &str,
    duration: Option<f64>,
) -> Result<()> {
    let path = match output {
        Some(path) => path,
        None => context.storage.recording_path(name)?,
    };
    let device = &context.config.device;
    let limit = duration.map(recording_limit).transpose()?;

    let mut recorder = SessionRecorder::new(label, description);
    let local = recorder
        .intercept(&device.host, device.port)
        .await
        .context("Failed to start recording proxy")?;

    println!("Recording {}:{} via {local}", device.host, device.port);
    println!("Point the client at {local}; press Ctrl-C to finish");

    match limit {
        Some(limit) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => result?,
                _ = tokio::time::sleep(limit) => {
                    info!("Recording duration of {:.1}s elapsed", limit.as_secs_f64());
                }
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }
    recorder.stop();
    recorder.save(&path)?;

    println!(
        "Saved {} interactions to {}",
        recorder.interactions().len(),
        path.display()
    );
    Ok(())
}

async fn cmd_replay(context: &ObservatoryContext, recording: &str, listen_port: u16) -> Result<()> {
    let direct = PathBuf::from(recording);
    let path = if direct.exists() {
        direct
    } else {
        let stored = context.storage.recording_path(recording)?;
        if !stored.exists() {
            bail!("No recording at {recording} or {}", stored.display());
        }
        stored
    };

    let mut server = PlaybackServer::from_recording(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    let metadata = server.metadata().clone();
    println!(
        "Recording: {} ({}:{}) {:.1}s",
        metadata.device_label, metadata.host, metadata.port, metadata.duration_seconds
    );
    if !metadata.description.is_empty() {
        println!("  {}", metadata.description);
    }
    println!("Methods:   {}", server.methods().join(", "));

    let addr = server.serve_on(listen_port).await?;
    println!("Serving on {addr}; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    server.stop();
    Ok(())
}

async fn cmd_probe(context: &ObservatoryContext) -> Result<()> {
    let device = &context.config.device;
    let mut client = ProtocolClient::new(ClientConfig {
        command_timeout: device.command_timeout(),
        client_name: device.client_name.clone(),
    });

    client
        .connect(&device.host, device.port, device.connect_timeout())
        .await
        .with_context(|| format!("Failed to connect to {}:{}", device.host, device.port))?;
    info!("Connected to {}:{}", device.host, device.port);

    let system_info = client.get_system_info().await?;
    println!("System info:");
    println!("{}", serde_json::to_string_pretty(&system_info)?);

    println!("Status:");
    println!("{}", serde_json::to_string_pretty(&client.status())?);

    client.disconnect().await;
    Ok(())
}

fn cmd_list(context: &ObservatoryContext) -> Result<()> {
    let names = context.storage.list_recordings()?;
    if names.is_empty() {
        println!(
            "No recordings in {}",
            context.storage.recordings_dir().display()
        );
        return Ok(());
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}

/// Recording length from `--duration`; must be positive and representable.
fn recording_limit(secs: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(limit) if !limit.is_zero() => Ok(limit),
        _ => bail!("Invalid duration {secs}"),
    }
}
