//! Intelligent Threshold Engine server
//!
//! Hosts the engine's priority scheduler and auto-refresh controller behind
//! the four-endpoint HTTP surface in §6, backed by a SQLite store and
//! generic JSON-HTTP fetcher/rule-provider adapters.

#[global_allocator]
#[cfg(not(target_os = "windows"))]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use engine::rule_sync::RateLimiter;
use engine::Scheduler;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod api;
mod config;
mod database;
mod providers;

use config::ConfigManager;
use database::Database;
use providers::{HttpFetcher, HttpRuleProvider};

#[derive(Parser, Debug)]
#[command(name = "ite-server")]
#[command(about = "Intelligent Threshold Engine server", long_about = None)]
struct CliArgs {
    /// Path to the server configuration file (server.toml), or a directory containing it.
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the listen address from config file.
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the data directory from config file.
    #[arg(long = "data-dir", value_name = "DIR")]
    data_dir: Option<String>,
}

/// Owns every long-lived handle the server needs to run and shut down
/// cleanly: configuration, scheduler, store, and the background tasks'
/// join handles.
pub struct Server {
    pub config_manager: Arc<Mutex<ConfigManager>>,
    listen_address: SocketAddr,
    store: Option<Arc<Database>>,
    wal_checkpoint_task_handle: Option<JoinHandle<()>>,
    auto_refresh_driver_task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl Server {
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let config_manager = ConfigManager::new(config_path)?;
        let server_config = config_manager.server_config.as_ref().expect("server configuration loaded in ConfigManager::new");

        let listen_address: SocketAddr = server_config.listen_address.parse().map_err(|e| anyhow::anyhow!("Invalid listen address '{}': {}", server_config.listen_address, e))?;

        Ok(Self {
            config_manager: Arc::new(Mutex::new(config_manager)),
            listen_address,
            store: None,
            wal_checkpoint_task_handle: None,
            auto_refresh_driver_task_handle: None,
            shutdown_tx: None,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Starting Intelligent Threshold Engine server");

        let server_config = {
            let config_manager = self.config_manager.lock().await;
            config_manager.server_config.as_ref().expect("server configuration loaded in ConfigManager::new").clone()
        };

        info!(listen_address = %self.listen_address, data_dir = %server_config.data_dir, "server configuration loaded");

        info!("initializing database");
        let store = Arc::new(Database::new(&server_config.data_dir).context("failed to create database manager")?);
        store.initialize().await.context("failed to initialize database")?;
        info!("database initialized");

        let fetcher = Arc::new(HttpFetcher::new(server_config.fetcher_base_url.clone(), Duration::from_secs(server_config.http_client_timeout_seconds)).context("failed to build fetcher client")?);
        let rule_provider: Arc<dyn engine::RuleProvider> =
            Arc::new(HttpRuleProvider::new(server_config.rule_provider_base_url.clone(), Duration::from_secs(server_config.http_client_timeout_seconds)).context("failed to build rule provider client")?);
        let rate_limiter = Arc::new(RateLimiter::new());

        let scheduler = Scheduler::new(fetcher, store.clone() as Arc<dyn engine::Store>, server_config.engine.clone());

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        self.store = Some(store.clone());

        let wal_checkpoint_task_handle = {
            let store = store.clone();
            let interval_secs = server_config.wal_checkpoint_interval_seconds;
            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            match store.checkpoint_wal().await {
                                Ok(frames) => info!(frames, "WAL checkpoint completed"),
                                Err(e) => warn!(error = %e, "WAL checkpoint failed"),
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("WAL checkpoint task received shutdown signal");
                            break;
                        }
                    }
                }
            })
        };

        let auto_refresh_driver_task_handle = {
            let store = store.clone();
            let scheduler = scheduler.clone();
            let rule_provider = rule_provider.clone();
            let rate_limiter = rate_limiter.clone();
            let cfg = server_config.engine.clone();
            let poll_interval_secs = server_config.auto_refresh_poll_interval_seconds;
            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(poll_interval_secs));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = engine::auto_refresh::process(store.as_ref(), &scheduler, rule_provider.as_ref(), rate_limiter.as_ref(), &cfg).await {
                                error!(error = %e, "auto-refresh batch processing failed");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("auto-refresh driver task received shutdown signal");
                            break;
                        }
                    }
                }
            })
        };

        self.wal_checkpoint_task_handle = Some(wal_checkpoint_task_handle);
        self.auto_refresh_driver_task_handle = Some(auto_refresh_driver_task_handle);

        let app_state = api::AppState { scheduler, store, rule_provider, rate_limiter, engine_config: server_config.engine.clone() };
        let app = api::create_router(app_state);

        info!("starting HTTP server on {}", self.listen_address);
        let listener = tokio::net::TcpListener::bind(self.listen_address)
            .await
            .with_context(|| format!("failed to bind TCP listener to {}. Check if the port is already in use (EADDRINUSE) or requires elevated permissions (EACCES)", self.listen_address))?;

        let shutdown_signal = {
            let mut rx = shutdown_tx.subscribe();
            async move {
                let _ = rx.recv().await;
                info!("HTTP server received shutdown signal");
            }
        };

        axum::serve(listener, app).with_graceful_shutdown(shutdown_signal).await.map_err(|e| anyhow::anyhow!("server error: {e}"))?;

        Ok(())
    }

    /// Graceful shutdown: broadcast the signal, wait (bounded) for
    /// background tasks, then close the store.
    pub async fn shutdown(&mut self) {
        info!("shutting down Intelligent Threshold Engine server");

        let shutdown_timeout_secs = {
            let config_manager = self.config_manager.lock().await;
            config_manager.server_config.as_ref().map(|c| c.graceful_shutdown_timeout_seconds).unwrap_or(30)
        };

        if let Some(shutdown_tx) = &self.shutdown_tx {
            if let Err(e) = shutdown_tx.send(()) {
                warn!("failed to send shutdown signal: {e}");
            }
        }

        for (name, handle) in [("WAL checkpoint", self.wal_checkpoint_task_handle.take()), ("auto-refresh driver", self.auto_refresh_driver_task_handle.take())] {
            if let Some(handle) = handle {
                info!("waiting for {name} task to complete (timeout: {shutdown_timeout_secs}s)");
                match tokio::time::timeout(Duration::from_secs(shutdown_timeout_secs), handle).await {
                    Ok(Ok(())) => info!("{name} task completed successfully"),
                    Ok(Err(e)) => warn!("{name} task panicked: {e}"),
                    Err(_) => warn!("{name} task shutdown timeout reached, aborting"),
                }
            }
        }

        if let Some(store) = &self.store {
            info!("closing database connection");
            store.close().await;
            info!("database connection closed");
        }

        info!("server shutdown complete");
    }
}

async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = sigint.recv() => info!("received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("failed to register signal handlers: {e}");
                error!("falling back to Ctrl+C only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("failed to wait for Ctrl+C: {e}");
                } else {
                    info!("received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to receive Ctrl+C signal: {e}");
        } else {
            info!("received Ctrl+C");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let file_appender = tracing_appender::rolling::daily("./logs", "server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("server=info,engine=info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).json().with_current_span(false).with_span_list(false).with_writer(non_blocking).init();

    let cli_args = CliArgs::parse();

    info!("Intelligent Threshold Engine server starting up");
    info!("configuration file: {}", cli_args.config_file.display());

    if cli_args.listen_address.is_some() {
        info!("listen address override provided via command line");
    }
    if cli_args.data_dir.is_some() {
        info!("data directory override provided via command line");
    }

    let mut server = match Server::new(cli_args.config_file) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to initialize server: {e}");
            std::process::exit(1);
        }
    };

    if cli_args.listen_address.is_some() || cli_args.data_dir.is_some() {
        let changed = {
            let mut config_manager = server.config_manager.lock().await;
            match config_manager.override_and_persist_config(cli_args.listen_address, cli_args.data_dir) {
                Ok(changed) => changed,
                Err(e) => {
                    error!("failed to apply configuration overrides: {e}");
                    std::process::exit(1);
                }
            }
        };

        if changed {
            info!("configuration overrides applied and persisted to disk");
            let server_config = {
                let config_manager = server.config_manager.lock().await;
                config_manager.server_config.as_ref().expect("server configuration loaded in ConfigManager::new").clone()
            };
            server.listen_address = server_config
                .listen_address
                .parse()
                .map_err(|e| {
                    error!("invalid listen address after override: {e}");
                    std::process::exit(1);
                })
                .unwrap();
        } else {
            info!("command-line values match existing config, no changes needed");
        }
    }

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("server error: {e}");
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("shutdown signal received, initiating graceful shutdown");
        }
    }

    server.shutdown().await;
    info!("server shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_server_creation() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
listen_address = "127.0.0.1:8787"
data_dir = "/tmp/ite-test-data"
"#
        )
        .unwrap();

        let config_path = temp_file.path().to_path_buf();
        let result = Server::new(config_path);
        assert!(result.is_ok());
    }
}
