//! framepipe daemon
//!
//! Serves producer sessions on the rendezvous socket with the loopback
//! collaborators, for protocol bring-up without a GPU. Ctrl-C stops it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use frameconf::FrameConfig;
use framepipe::loopback::{self, LoopbackBackend};
use framepipe::{EncoderConfig, EncoderService};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file to load in place of ./framepipe.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rendezvous socket path (default: $XDG_RUNTIME_DIR/alvr-ipc)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Log filter, e.g. "info" or "framepipe=trace"
    #[arg(long)]
    log_level: Option<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = FrameConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(socket) = cli.socket {
        config.paths.socket_path = Some(socket);
    }
    if let Some(level) = cli.log_level {
        config.telemetry.log_level = level;
    }

    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let filter = EnvFilter::try_new(&config.telemetry.log_level)
        .with_context(|| format!("Invalid log filter '{}'", config.telemetry.log_level))?;
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("framepipe {} starting", env!("CARGO_PKG_VERSION"));
    for file in &sources.files {
        info!("loaded config from {}", file.display());
    }
    for var in &sources.env_overrides {
        info!("config override from ${}", var);
    }

    let (collaborators, stats, sink) = loopback::collaborators();
    let service = EncoderService::start(
        EncoderConfig::from_config(&config),
        Box::new(LoopbackBackend::new()),
        collaborators,
    )
    .context("Failed to start encoder")?;
    let handle = service.handle();

    let mut encoder = tokio::task::spawn_blocking(move || service.join());

    let finished = tokio::select! {
        joined = &mut encoder => Some(joined),
        _ = tokio::signal::ctrl_c() => None,
    };
    let joined = match finished {
        Some(joined) => joined,
        None => {
            info!("interrupt received");
            handle.stop();
            encoder.await
        }
    };
    joined
        .context("Encoder task failed")?
        .context("Encoder stopped with an error")?;

    info!(
        "framepipe shutdown complete: {} frames encoded, {} units / {} bytes sent",
        stats.outputs(),
        sink.units(),
        sink.bytes()
    );
    Ok(())
}
