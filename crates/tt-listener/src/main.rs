//! tether listener
//!
//! Accepts agent connections on `<bind-interface>:<port>` and runs the
//! operator console on stdin.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tt_core::config::{self, ListenerConfig};
use tt_core::tls;
use tt_listener::console::Console;
use tt_listener::{Listener, ListenerState};

#[derive(Parser)]
#[command(name = "tether-listener")]
#[command(about = "tether listener: accepts agents over TLS")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Interface address to bind
    bind_interface: IpAddr,

    /// Shared secret agents must present (64 hex characters)
    #[arg(long)]
    secret: Option<String>,

    /// PEM certificate (requires --key; a certificate is generated otherwise)
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

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

    let config = load_config(&args)?;
    let bind_addr = config.bind_address()?;

    let bundle = match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => tls::load_certificate(cert, key)
            .with_context(|| format!("Failed to load certificate from {:?}", cert))?,
        _ => {
            tracing::info!("Generating a self-signed certificate");
            tls::generate_certificate().context("Failed to generate certificate")?
        }
    };
    println!("Certificate fingerprint: {}", bundle.fingerprint);
    if config.shared_secret.is_none() {
        tracing::warn!("No shared secret configured - any agent that connects is admitted");
    }

    let state = Arc::new(ListenerState::new(config));
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let listener = Listener::bind(
        bind_addr,
        tls::server_config(&bundle)?,
        Arc::clone(&state),
        cancel.clone(),
    )
    .await?;
    let server = tokio::spawn(listener.run());

    Console::new(Arc::clone(&state), cancel.clone()).run().await?;
    cancel.cancel();

    server.await.context("Listener task panicked")??;
    tracing::info!("Listener shutdown complete");
    Ok(())
}

/// Defaults, then the config file, then `TETHER_*` variables, then flags
fn load_config(args: &Args) -> Result<ListenerConfig> {
    let mut config: ListenerConfig = match &args.config {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => {
            let default_path = config::default_config_dir().join("listener.toml");
            if default_path.exists() {
                config::load_config(&default_path).unwrap_or_else(|e| {
                    tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                    ListenerConfig::default()
                })
            } else {
                ListenerConfig::default()
            }
        }
    };

    config.apply_env(config::process_env)?;

    config.port = args.port;
    config.interface = args.bind_interface.to_string();
    if let Some(secret) = &args.secret {
        config.shared_secret = Some(secret.clone());
    }
    if let (Some(cert), Some(key)) = (&args.cert, &args.key) {
        config.cert_path = Some(cert.clone());
        config.key_path = Some(key.clone());
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
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
            _ = cancel.cancelled() => return,
        }

        cancel.cancel();
    });
}
