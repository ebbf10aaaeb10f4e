//! voxbridge: answer SIP calls with a voice assistant.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, Layer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use voxbridge::config::LoggingConfig;
use voxbridge::voices::VoiceRegistry;
use voxbridge::{BridgeConfig, BridgeServer};

/// voxbridge: real-time telephony voice-AI bridge.
#[derive(Parser)]
#[command(name = "voxbridge", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long, env = "VOXBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Serve SIP and RTP until Ctrl+C.
    Run,

    /// Load and validate the configuration, then exit.
    CheckConfig,

    /// List the synthesis voices the bridge can use.
    Voices,

    /// Write the default configuration to the config path.
    InitConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(BridgeConfig::default_config_path);
    let command = cli.command.unwrap_or(Command::Run);

    if let Command::InitConfig = command {
        BridgeConfig::default()
            .save_to_file(&config_path)
            .with_context(|| format!("writing {}", config_path.display()))?;
        println!("wrote {}", config_path.display());
        return Ok(());
    }

    let config = if config_path.exists() {
        BridgeConfig::from_file(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else if cli.config.is_some() {
        anyhow::bail!("config file {} not found", config_path.display());
    } else {
        BridgeConfig::default()
    };

    let _log_guard = init_logging(&config.logging);

    match command {
        Command::Run => run(config).await,
        Command::CheckConfig => {
            config.validate()?;
            println!(
                "configuration ok: {} scheme(s), {} assistant(s)",
                config.schemes.len(),
                config.assistants.len()
            );
            Ok(())
        }
        Command::Voices => list_voices(&config),
        Command::InitConfig => Ok(()),
    }
}

/// Console logging plus an optional daily-rolling file.
fn init_logging(logging: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter))
    };
    let console = tracing_subscriber::fmt::layer().with_filter(filter());
    match &logging.file_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "voxbridge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            tracing_subscriber::registry().with(console).with(file).init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(console).init();
            None
        }
    }
}

async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    println!("voxbridge v{}", env!("CARGO_PKG_VERSION"));

    let server = BridgeServer::from_config(config)?;
    let bridge = server.start().await?;
    println!(
        "SIP on {}, RTP on {}. Press Ctrl+C to stop.",
        bridge.sip_addr(),
        bridge.media_addr()
    );

    let stop = CancellationToken::new();
    let stop_clone = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            stop_clone.cancel();
        }
    });

    bridge.run_until(stop).await?;
    Ok(())
}

fn list_voices(config: &BridgeConfig) -> anyhow::Result<()> {
    let registry = match &config.voices.file {
        Some(path) => VoiceRegistry::from_file(path)?,
        None => VoiceRegistry::builtin(),
    };
    for voice in registry.iter() {
        println!(
            "  - {:<20} {:<6} {:<12} {}",
            voice.id,
            voice.language,
            voice.dialect.as_deref().unwrap_or("-"),
            voice.name
        );
    }
    Ok(())
}
