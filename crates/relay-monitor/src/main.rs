//! Relay monitor binary
//!
//! Loads an optional env file, parses options from flags and environment,
//! wires the concrete collaborators and runs the monitor until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use saorsa_relay_monitor::config::{self, DEFAULT_ENV_FILES, MonitorArgs};
use saorsa_relay_monitor::logging::{self, LogFormat};
use saorsa_relay_monitor::{
    Collaborators, EventSigner, HttpCapabilityFetcher, InfluxWriter, KeypairSigner, MetricsSink,
    Monitor, WebSocketConnector, WebSocketProbe,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "saorsa-relay-monitor")]
#[command(about = "Measure Nostr relay latency and publish signed measurement events")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    monitor: MonitorArgs,

    /// Env file loaded before options are read [default: ./.monitorlizard.env, then /usr/local/etc/.monitorlizard.env]
    #[arg(long)]
    env_file: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
}

/// Load the env file into the process environment. Variables already set win.
fn load_env_file() -> Result<Option<PathBuf>> {
    let path = match config::env_file_arg(std::env::args()) {
        Some(explicit) => Some(explicit),
        None => config::locate_env_file(DEFAULT_ENV_FILES),
    };
    if let Some(path) = &path {
        dotenvy::from_path(path)
            .with_context(|| format!("Failed to load env file {}", path.display()))?;
    }
    Ok(path)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    // Install the crypto provider before any TLS client is built
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let env_file = load_env_file()?;
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_format)?;

    match &env_file {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => warn!("No env file found, using flags and environment only"),
    }

    let config = cli.monitor.into_config();

    let signer: Option<Arc<dyn EventSigner>> = match config.private_key.as_deref() {
        Some(secret) => Some(Arc::new(
            KeypairSigner::from_hex(secret).context("Invalid NOSTR_PRIVATE_KEY")?,
        )),
        None => None,
    };
    if let Some(signer) = &signer {
        info!(pubkey = %signer.public_key(), "Signing as");
    }

    let sink: Option<Arc<dyn MetricsSink>> = match &config.influx {
        Some(influx) => {
            let (writer, _flusher) =
                InfluxWriter::spawn(influx).context("Failed to start InfluxDB writer")?;
            info!(url = %influx.url, bucket = %influx.bucket, "InfluxDB mirror enabled");
            Some(Arc::new(writer))
        }
        None => {
            warn!("InfluxDB configuration incomplete, mirror disabled");
            None
        }
    };

    let deps = Collaborators {
        fetcher: Arc::new(
            HttpCapabilityFetcher::new(Duration::from_secs(10))
                .context("Failed to build HTTP client")?,
        ),
        probe: Arc::new(
            WebSocketProbe::new(config.timeouts).context("Failed to build latency probe")?,
        ),
        connector: Arc::new(WebSocketConnector::new(
            saorsa_relay_monitor::publisher::CONNECT_TIMEOUT,
            config.write_timeout,
        )),
        signer,
        sink,
    };

    let monitor = Monitor::new(config, deps).context("Invalid configuration")?;

    tokio::select! {
        result = monitor.run() => result.context("Monitor stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
