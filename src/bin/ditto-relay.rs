use std::path::PathBuf;

use clap::Parser;
use ditto_relay::gateway::config::RelayConfig;
use ditto_relay::gateway::store::open_store;
use ditto_relay::gateway::{FlushOutcome, RelayState, StoreBackend, http};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "ditto-relay", about = "OpenAI-compatible relay with upstream key rotation")]
struct Cli {
    /// TOML settings file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    listen: Option<String>,
    #[arg(long)]
    admin_token: Option<String>,
    /// Read the admin token from this environment variable.
    #[arg(long, conflicts_with = "admin_token")]
    admin_token_env: Option<String>,
    #[arg(long, value_enum)]
    store: Option<StoreBackend>,
    #[arg(long)]
    sqlite: Option<PathBuf>,
    #[arg(long)]
    redis: Option<String>,
    #[arg(long)]
    redis_prefix: Option<String>,
    /// Upstream API base, e.g. `https://api.cerebras.ai/v1`.
    #[arg(long)]
    upstream: Option<String>,
    #[arg(long)]
    json_logs: bool,
    #[arg(long)]
    otel: bool,
    #[arg(long)]
    otel_endpoint: Option<String>,
}

impl Cli {
    fn into_config(self) -> Result<(RelayConfig, bool, Option<String>), Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)?,
            None => RelayConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(token) = self.admin_token {
            config.admin_token = Some(token);
        }
        if let Some(var) = self.admin_token_env {
            let token = std::env::var(&var).map_err(|_| format!("env var {var} is not set"))?;
            config.admin_token = Some(token);
        }
        if let Some(path) = self.sqlite {
            config.store.sqlite_path = Some(path);
            config.store.backend = StoreBackend::Sqlite;
        }
        if let Some(url) = self.redis {
            config.store.redis_url = Some(url);
            config.store.backend = StoreBackend::Redis;
        }
        if let Some(prefix) = self.redis_prefix {
            config.store.redis_prefix = prefix;
        }
        if let Some(backend) = self.store {
            config.store.backend = backend;
        }
        if let Some(base_url) = self.upstream {
            config.upstream.base_url = base_url;
        }
        config.json_logs |= self.json_logs;
        if config.admin_token.as_deref().is_some_and(|token| token.trim().is_empty()) {
            config.admin_token = None;
        }
        Ok((config, self.otel, self.otel_endpoint))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (config, otel_enabled, otel_endpoint) = Cli::parse().into_config()?;
    let _otel_guard = init_observability(&config, otel_enabled, otel_endpoint.as_deref())?;

    let store = open_store(&config.store).await?;
    let listen = config.listen.clone();
    let admin_enabled = config.admin_token.is_some();
    let state = RelayState::new(config, store)?;
    state.bootstrap().await?;

    let flush_task = state.flush.spawn();
    let app = http::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(listen = %listen, admin = admin_enabled, "ditto-relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    flush_task.stop().await;
    if let Some(FlushOutcome::WriteFailed | FlushOutcome::FoldFailed) = state.flush.shutdown().await {
        warn!("unflushed usage counters were lost");
    }
    info!("ditto-relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[cfg(feature = "otel")]
fn init_observability(
    config: &RelayConfig,
    enabled: bool,
    endpoint: Option<&str>,
) -> Result<Option<ditto_relay::gateway::otel::TelemetryGuard>, Box<dyn std::error::Error>> {
    if !enabled {
        ditto_relay::gateway::init_logging(config.json_logs).map_err(|err| err.to_string())?;
        return Ok(None);
    }
    let guard = ditto_relay::gateway::otel::init_tracing(config, endpoint)
        .map_err(|err| err.to_string())?;
    Ok(Some(guard))
}

#[cfg(not(feature = "otel"))]
fn init_observability(
    config: &RelayConfig,
    enabled: bool,
    _endpoint: Option<&str>,
) -> Result<Option<()>, Box<dyn std::error::Error>> {
    if enabled {
        return Err("otel requires `--features otel`".into());
    }
    ditto_relay::gateway::init_logging(config.json_logs).map_err(|err| err.to_string())?;
    Ok(None)
}
