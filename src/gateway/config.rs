use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::GatewayError;

/// Process settings for the relay. Loaded from TOML, then overridden by CLI flags.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen: String,
    pub admin_token: Option<String>,
    pub json_logs: bool,
    /// Model id advertised on `/v1/models`; requests are rewritten to a pool model anyway.
    pub external_model_id: String,
    pub upstream: UpstreamConfig,
    pub pool: PoolConfig,
    pub flush: FlushConfig,
    pub catalog: CatalogConfig,
    pub cas: CasConfig,
    pub store: StoreConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8339".to_string(),
            admin_token: None,
            json_logs: false,
            external_model_id: "auto".to_string(),
            upstream: UpstreamConfig::default(),
            pool: PoolConfig::default(),
            flush: FlushConfig::default(),
            catalog: CatalogConfig::default(),
            cas: CasConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("listen", &self.listen)
            .field(
                "admin_token",
                &self.admin_token.as_ref().map(|_| "<redacted>"),
            )
            .field("json_logs", &self.json_logs)
            .field("external_model_id", &self.external_model_id)
            .field("upstream", &self.upstream)
            .field("pool", &self.pool)
            .field("flush", &self.flush)
            .field("catalog", &self.catalog)
            .field("cas", &self.cas)
            .field("store", &self.store)
            .finish()
    }
}

impl RelayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, GatewayError> {
        toml::from_str(raw).map_err(|err| GatewayError::Config {
            message: format!("invalid relay config: {err}"),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| GatewayError::Config {
            message: format!("read {}: {err}", path.display()),
        })?;
        Self::from_toml_str(&raw)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            request_timeout_ms: default_request_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_upstream_base_url() -> String {
    "https://api.cerebras.ai/v1".to_string()
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

fn default_probe_timeout_ms() -> u64 {
    15_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Seed for the model pool when the config record is first created.
    pub default_models: Vec<String>,
    /// Model used by key probes when the pool is empty.
    pub fallback_model: String,
    pub max_model_retries: usize,
    pub default_cooldown_ms: u64,
    pub max_proxy_keys: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_models: vec![
                "llama-3.3-70b".to_string(),
                "qwen-3-32b".to_string(),
                "gpt-oss-120b".to_string(),
            ],
            fallback_model: "llama3.1-8b".to_string(),
            max_model_retries: 3,
            default_cooldown_ms: 2_000,
            max_proxy_keys: 16,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    pub default_interval_ms: u64,
    pub min_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: 15_000,
            min_interval_ms: 1_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub url: String,
    pub source: String,
    pub ttl_ms: u64,
    pub fetch_timeout_ms: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: "https://api.cerebras.ai/public/v1/models".to_string(),
            source: "upstream-public".to_string(),
            ttl_ms: 60 * 60 * 1_000,
            fetch_timeout_ms: 10_000,
        }
    }
}

/// Retry budget for optimistic config updates.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CasConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_base_ms: 10,
            backoff_cap_ms: 500,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
    Redis,
}

impl StoreBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
            Self::Redis => "redis",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub sqlite_path: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub redis_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            sqlite_path: None,
            redis_url: None,
            redis_prefix: "ditto-relay".to_string(),
        }
    }
}
