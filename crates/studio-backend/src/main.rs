//! # studio-backend
//!
//! Server binary — wires the store, runtime, and HTTP layer together and
//! runs until SIGINT/SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use studio_runtime::ChatOrchestrator;
use studio_server::{ServerConfig, SocketBroadcaster, StudioServer};
use studio_store::StudioStore;
use tracing::{info, warn};

/// Studio backend server.
#[derive(Parser, Debug)]
#[command(name = "studio-backend", about = "Agent chat orchestration server")]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, default_value = "8000")]
    port: u16,

    /// Path to the SQLite database.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Path to the agent settings document.
    #[arg(long)]
    settings_path: Option<PathBuf>,

    /// Public base URL agents post callbacks to. Defaults to the bind address.
    #[arg(long)]
    studio_url: Option<String>,

    /// Directory for uploaded chat files.
    #[arg(long, default_value = "data/chat_files")]
    upload_dir: String,

    /// Shared secret required on agent callback endpoints.
    #[arg(long)]
    callback_secret: Option<String>,

    /// Log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn default_db_path() -> PathBuf {
        PathBuf::from("data").join("studio.db")
    }

    fn default_settings_path() -> PathBuf {
        PathBuf::from("data").join("agent_settings.json")
    }
}

fn ensure_parent_dir(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    studio_core::logging::init_subscriber(&cli.log_level);

    // Metrics recorder, rendered by GET /metrics
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    // Durable store
    let db_path = cli.db_path.clone().unwrap_or_else(Cli::default_db_path);
    ensure_parent_dir(&db_path)?;
    let pool = studio_store::new_file(
        db_path.to_str().context("db path is not valid UTF-8")?,
        &studio_store::ConnectionConfig::default(),
    )?;
    {
        let conn = pool.get()?;
        let version = studio_store::run_migrations(&conn)?;
        info!(db = %db_path.display(), schema_version = version, "database ready");
    }
    let store = StudioStore::new(pool);

    // Agent settings (model config + tool display filter)
    let settings_path = cli
        .settings_path
        .clone()
        .unwrap_or_else(Cli::default_settings_path);
    let settings = studio_runtime::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings: {}", settings_path.display()))?;
    info!(
        provider = settings.llm_provider,
        model = settings.model_name,
        mode = %settings.mode,
        hidden_tools = settings.hidden_tools.len(),
        "agent settings loaded"
    );

    // Orchestration core + socket bus
    let studio_url = cli
        .studio_url
        .clone()
        .unwrap_or_else(|| format!("http://{}:{}", cli.host, cli.port));
    let broadcaster = Arc::new(SocketBroadcaster::new());
    let orchestrator =
        ChatOrchestrator::new(store.clone(), settings, studio_url, broadcaster.clone());

    // HTTP server
    let config = ServerConfig {
        host: cli.host,
        port: cli.port,
        callback_secret: cli.callback_secret,
        upload_dir: cli.upload_dir,
        ..ServerConfig::default()
    };
    let server = StudioServer::new(
        config,
        orchestrator.clone(),
        broadcaster,
        metrics_handle,
    );
    let (addr, server_handle) = server.listen().await?;
    info!(%addr, "studio backend ready");

    // Maintenance: stale upload cleanup daily, expired KV purge hourly
    let storage = server.state().storage.clone();
    server.shutdown().register_task(tokio::spawn({
        let token = server.shutdown().token();
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(24 * 3600));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let _ = storage.cleanup_old_files(7).await;
                    }
                    () = token.cancelled() => break,
                }
            }
        }
    }));
    server.shutdown().register_task(tokio::spawn({
        let token = server.shutdown().token();
        let store = store.clone();
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match store.purge_expired_state() {
                            Ok(0) => {}
                            Ok(purged) => info!(purged, "purged expired reply snapshots"),
                            Err(e) => warn!(error = %e, "kv purge failed"),
                        }
                    }
                    () = token.cancelled() => break,
                }
            }
        }
    }));

    // Wait for SIGINT/SIGTERM
    wait_for_signal().await;
    info!("termination signal received");

    // Stop accepting work, kill children, close streams, then drain tasks
    orchestrator.shutdown().await;
    server
        .shutdown()
        .graceful_shutdown(vec![server_handle], Some(Duration::from_secs(10)))
        .await;

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler, using ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
