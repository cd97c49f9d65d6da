//! tproxy2socks - Transparent proxy to SOCKS5 gateway
//!
//! This is the main entry point for the tproxy2socks application.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tproxy2socks::config::{load_config, Config};
use tproxy2socks::proxy::run_proxy;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// tproxy2socks - Forward TPROXY-intercepted TCP and UDP through a SOCKS5 server
#[derive(Parser, Debug)]
#[command(name = "tproxy2socks")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TPROXY bind address, may be repeated (e.g. 127.0.0.1:12345)
    #[arg(short, long)]
    tproxy: Vec<String>,

    /// SOCKS5 server address
    #[arg(short, long)]
    socks: Option<String>,

    /// SOCKS5 username
    #[arg(long)]
    user: Option<String>,

    /// SOCKS5 password
    #[arg(long)]
    passwd: Option<String>,

    /// TCP idle timeout in seconds (0 disables it)
    #[arg(long)]
    tcp_idle_timeout: Option<u64>,

    /// UDP idle timeout in seconds (0 disables it)
    #[arg(long)]
    udp_idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    // Load configuration, then let the command line override it
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    info!("tproxy2socks v{}", tproxy2socks::VERSION);
    if let Some(path) = &args.config {
        info!("Configuration loaded from: {:?}", path);
    }
    info!("Bind addresses: {}", config.proxy.bind.join(", "));
    info!("SOCKS5 server: {}", config.socks.server);

    // Setup shutdown signal
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            info!("Received Ctrl+C, shutting down...");
                        }
                        _ = sigterm.recv() => {
                            info!("Received SIGTERM, shutting down...");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to setup SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received Ctrl+C, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down...");
        }

        let _ = shutdown_tx_clone.send(true);
    });

    run_proxy(config, shutdown_rx).await
}

/// Apply command-line values on top of the file configuration
fn apply_overrides(config: &mut Config, args: &Args) {
    if !args.tproxy.is_empty() {
        config.proxy.bind = args.tproxy.clone();
    }
    if let Some(server) = &args.socks {
        config.socks.server = server.clone();
    }
    if let Some(user) = &args.user {
        config.socks.username = Some(user.clone());
    }
    if let Some(passwd) = &args.passwd {
        config.socks.password = Some(passwd.clone());
    }
    if let Some(secs) = args.tcp_idle_timeout {
        config.proxy.tcp_idle_timeout = secs;
    }
    if let Some(secs) = args.udp_idle_timeout {
        config.proxy.udp_idle_timeout = secs;
    }
}

/// Filter directive for our own targets at the requested level
///
/// Unknown levels fall back to `info`; dependencies stay quiet.
fn filter_directive(level: &str) -> String {
    let level = match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    };
    format!("{}={}", tproxy2socks::NAME, level)
}

/// Install the global subscriber; `RUST_LOG` takes precedence over `level`
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(level)));

    let builder = FmtSubscriber::builder().with_env_filter(filter);
    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.with_target(false).finish())?;
    }

    Ok(())
}
