//! Relay core: upstream key rotation, write-back caches and the forwarding pipeline.

pub mod config;
pub mod config_store;
pub mod flush;
pub mod forward;
pub mod http;
pub mod key_pool;
pub mod metrics;
pub mod model_catalog;
pub mod model_rotation;
pub mod probe;
pub mod proxy_keys;
pub mod state;
pub mod store;
pub mod upstream;

#[cfg(feature = "otel")]
pub mod otel;
#[cfg(feature = "store-redis")]
pub mod redis_store;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt as _;

pub use config::{RelayConfig, StoreBackend};
pub use config_store::{ConfigStore, ProxyConfig};
pub use flush::{FlushOutcome, FlushScheduler, FlushTask};
pub use forward::{ForwardOutcome, ForwardRejection, forward_chat_completion};
pub use key_pool::{ApiKey, KeyPool, KeyStatus, SelectedKey};
pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use model_catalog::{CatalogView, ModelCatalog, ModelCatalogManager};
pub use model_rotation::ModelRotation;
pub use proxy_keys::{AuthOutcome, ProxyAuthKey, ProxyKeyCache};
pub use state::RelayState;
pub use store::{KvStore, MemoryStore, StoreError, Versioned};
pub use upstream::UpstreamClient;

#[cfg(feature = "store-redis")]
pub use redis_store::{RedisKvStore, RedisStoreError};
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::{SqliteKvStore, SqliteStoreError};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("incompatible config schema: {detail}; reinitialize the store and restart")]
    IncompatibleSchema { detail: String },
    #[error("config update failed: retry budget exhausted after {attempts} attempts")]
    RetryBudgetExhausted { attempts: u32 },
    #[error("upstream error: {message}")]
    Upstream { message: String },
    #[error("upstream request timed out")]
    UpstreamTimeout,
    #[error("model catalog error: {message}")]
    Catalog { message: String },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("not found: {what}")]
    NotFound { what: String },
    #[error("conflict: {reason}")]
    Conflict { reason: String },
    #[error("limit reached: at most {limit} entries")]
    LimitReached { limit: usize },
    #[error("config error: {message}")]
    Config { message: String },
}

/// Wall-clock source in epoch milliseconds. Injected so cooldowns and TTLs are testable.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0)
    }
}

static ID_SEQ: AtomicU64 = AtomicU64::new(0);

pub(crate) fn generate_id() -> String {
    let mut bytes = [0u8; 8];
    if getrandom::fill(&mut bytes).is_err() {
        let ts_ms = SystemClock.now_millis();
        let seq = ID_SEQ.fetch_add(1, Ordering::Relaxed);
        return format!("{ts_ms:x}{seq:04x}");
    }
    hex_encode(&bytes)
}

pub(crate) fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    if getrandom::fill(&mut bytes).is_err() {
        return SystemClock.now_millis() ^ ID_SEQ.fetch_add(1, Ordering::Relaxed);
    }
    u64::from_le_bytes(bytes)
}

/// `RUST_LOG` when set, otherwise `info`.
pub fn log_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

pub(crate) fn fmt_layer<S>(json_logs: bool) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    let layer = tracing_subscriber::fmt::layer().with_target(false);
    if json_logs {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Installs the plain or JSON fmt subscriber. Returns an error if one is already set.
pub fn init_logging(json_logs: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(log_filter())
        .with(fmt_layer(json_logs))
        .try_init()?;
    Ok(())
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
