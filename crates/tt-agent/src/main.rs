//! tether agent
//!
//! Dials `<host:port>` over TLS, authenticates and serves the listener's
//! commands, reconnecting with exponential backoff when the session drops.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tt_agent::{connect_with_retry, ReverseClient, RetryOutcome};
use tt_core::config::{self, AgentConfig};

#[derive(Parser)]
#[command(name = "tether-agent")]
#[command(about = "tether agent: connects to a listener and runs its commands")]
#[command(version)]
struct Args {
    /// Listener address as host:port
    target: Option<String>,

    /// Failed attempts before giving up (0 retries forever)
    max_retries: Option<u32>,

    /// Shared secret (64 hex characters)
    #[arg(long)]
    secret: Option<String>,

    /// Expected SHA-256 fingerprint of the listener certificate
    #[arg(long)]
    fingerprint: Option<String>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Arc::new(load_config(&args)?);
    tracing::info!(
        "tether agent connecting to {} (max retries: {})",
        config.target,
        config.max_retries
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let supervisor = connect_with_retry(
        &config.target,
        config.max_retries,
        &config.backoff,
        || ReverseClient::new(Arc::clone(&config), cancel.child_token()),
        tokio::time::sleep,
    );

    let outcome = tokio::select! {
        outcome = supervisor => outcome,
        _ = cancel.cancelled() => {
            tracing::info!("Agent shutdown complete");
            return Ok(());
        }
    };

    match outcome {
        RetryOutcome::Exited => {
            tracing::info!("Agent exiting at the listener's request");
            Ok(())
        }
        RetryOutcome::GaveUp { attempts } => {
            anyhow::bail!("Could not reach {} after {} attempts", config.target, attempts)
        }
    }
}

/// Defaults, then the config file, then `TETHER_*` variables, then arguments
fn load_config(args: &Args) -> Result<AgentConfig> {
    let mut config: AgentConfig = match &args.config {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => {
            let default_path = config::default_config_dir().join("agent.toml");
            if default_path.exists() {
                config::load_config(&default_path).unwrap_or_else(|e| {
                    tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                    AgentConfig::default()
                })
            } else {
                AgentConfig::default()
            }
        }
    };

    config.apply_env(config::process_env)?;

    if let Some(target) = &args.target {
        config.target = target.clone();
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(secret) = &args.secret {
        config.shared_secret = Some(secret.clone());
    }
    if let Some(fingerprint) = &args.fingerprint {
        config.cert_fingerprint = Some(fingerprint.to_ascii_lowercase());
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, shutting down...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, shutting down...");
            }
        }

        cancel.cancel();
    });
}
