mod breaker;
mod commands;
mod config;
mod error;
mod logbuf;
mod proxy;
mod selector;
mod stats;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use reqwest::Client;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::{
    ProxyConfig, config_file_path, config_warnings, load_config, load_config_file, save_config_to,
    stats_file_path,
};
use crate::proxy::{AppState, ProxyService, RuntimeConfig, router as proxy_router};
use crate::stats::StatsAggregator;

#[derive(Parser, Debug)]
#[command(name = "catfish-agg")]
#[command(about = "Failover proxy aggregating OpenAI-compatible chat backends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub enum CliError {
    /// Errors related to config.toml / config.json
    ProxyConfig(String),
    /// Errors while reading stats.json
    Stats(String),
    /// Generic fallback for other failures
    Other(String),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::ProxyConfig(msg) => write!(f, "Proxy config error: {}", msg),
            CliError::Stats(msg) => write!(f, "Stats error: {}", msg),
            CliError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl From<anyhow::Error> for CliError {
    fn from(e: anyhow::Error) -> Self {
        CliError::Other(format!("{e:#}"))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy server (default)
    Serve {
        /// Listen address (overrides [server].host)
        #[arg(long)]
        host: Option<String>,
        /// Listen port (overrides PORT and [server].port)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Manage the config file
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
    /// Print persisted request statistics
    Stats {
        /// Print the raw snapshot as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Write a commented config.toml template
    Init {
        /// Overwrite an existing config.toml (a .bak copy is kept)
        #[arg(long)]
        force: bool,
    },
    /// Validate the config file and print a summary of schemes and channels
    Check,
}

#[tokio::main]
async fn main() {
    if let Err(err) = real_main().await {
        eprintln!("{}", err.to_string().red());
        std::process::exit(1);
    }
}

async fn real_main() -> CliResult<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
    }) {
        Command::Config { cmd } => {
            let _log_guard = init_tracing(false);
            commands::config::handle_config_cmd(cmd).await?;
        }
        Command::Stats { json } => {
            let _log_guard = init_tracing(false);
            commands::stats::handle_stats_cmd(json).await?;
        }
        Command::Serve { host, port } => {
            let path = config_file_path();
            let (cfg, normalized) = if path.exists() {
                load_config_file(&path)
                    .await
                    .map_err(|e| CliError::ProxyConfig(format!("{e:#}")))?
            } else {
                (
                    load_config()
                        .await
                        .map_err(|e| CliError::ProxyConfig(format!("{e:#}")))?,
                    false,
                )
            };
            let _log_guard = init_tracing(cfg.logging.file);
            if normalized {
                save_config_to(&path, &cfg)
                    .await
                    .map_err(|e| CliError::ProxyConfig(format!("{e:#}")))?;
                tracing::info!("assigned ids to new channels and saved {:?}", path);
            }
            run_server(cfg, host, port).await?;
        }
    }

    Ok(())
}

fn init_tracing(to_file: bool) -> Option<WorkerGuard> {
    // Default to info logs unless the user sets RUST_LOG.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if to_file {
        let log_dir = crate::config::proxy_home_dir().join("logs");
        let _ = std::fs::create_dir_all(&log_dir);

        let file_appender = tracing_appender::rolling::never(&log_dir, "runtime.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(false)
            .with_writer(non_blocking)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(atty::is(atty::Stream::Stdout))
            .init();
        None
    }
}

fn resolve_port(cli_port: Option<u16>, cfg: &ProxyConfig) -> u16 {
    if let Some(p) = cli_port {
        return p;
    }
    if let Ok(v) = std::env::var("PORT")
        && let Ok(p) = v.trim().parse::<u16>()
    {
        return p;
    }
    cfg.server.port
}

async fn run_server(cfg: ProxyConfig, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| cfg.server.host.clone());
    let port = resolve_port(port, &cfg);

    let warnings = config_warnings(&cfg);
    if !warnings.is_empty() {
        tracing::warn!("======== Config warnings ========");
        for w in warnings {
            tracing::warn!("{}", w);
        }
        tracing::warn!("=================================");
    }

    let stats_path = stats_file_path();
    let stats = match StatsAggregator::load_or_new(
        &stats_path,
        cfg.stats.utc_offset_minutes,
        cfg.stats.history_days,
    )
    .await
    {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!("starting with empty stats: {:#}", err);
            StatsAggregator::new(cfg.stats.utc_offset_minutes, cfg.stats.history_days)
        }
    };
    let flush_every = Duration::from_secs(cfg.stats.flush_interval_secs);

    let state = Arc::new(AppState::with_stats(&cfg, stats));
    let runtime = Arc::new(RuntimeConfig::new(Arc::new(cfg), Some(config_file_path())));
    runtime.prime().await;

    let client = Client::builder().build()?;
    let proxy = ProxyService::new(client, runtime, state.clone());
    let app: Router = proxy_router(proxy);

    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;
    tracing::info!(
        "catfish-agg listening on http://{}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| format!("{host}:{port}"))
    );
    state.logs.info(format!("server started on {host}:{port}"));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });
    }

    let flusher = if flush_every.is_zero() {
        None
    } else {
        let state = state.clone();
        let stats_path = stats_path.clone();
        let mut rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = state.stats.save(&stats_path).await {
                            tracing::warn!("failed to write {:?}: {:#}", stats_path, err);
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
        }))
    };

    let server_shutdown = {
        let mut rx = shutdown_rx.clone();
        async move {
            let _ = rx.changed().await;
        }
    };
    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(server_shutdown)
        .await;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = flusher {
        let _ = handle.await;
    }
    state
        .stats
        .save(&stats_path)
        .await
        .with_context(|| format!("failed to write {:?}", stats_path))?;
    tracing::info!("stats saved to {:?}", stats_path);

    served?;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {},
                    _ = sigterm.recv() => {},
                }
            }
            _ => {
                // Fallback: at least handle Ctrl+C.
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_serve() {
        let cli = Cli::try_parse_from(["catfish-agg"]).unwrap();
        assert!(cli.command.is_none());
        let cli = Cli::try_parse_from(["catfish-agg", "serve", "--port", "9000"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Serve {
                port: Some(9000),
                ..
            })
        ));
    }

    #[test]
    fn explicit_port_wins() {
        let cfg = ProxyConfig::default();
        assert_eq!(resolve_port(Some(1234), &cfg), 1234);
    }
}
