use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use super::GatewayError;
use super::config::{StoreBackend, StoreConfig};

pub const CONFIG_KEY: &str = "config";
pub const API_KEY_PREFIX: &str = "api_keys/";
pub const PROXY_KEY_PREFIX: &str = "proxy_keys/";
pub const MODEL_CATALOG_KEY: &str = "model_catalog";

pub fn api_key_key(id: &str) -> String {
    format!("{API_KEY_PREFIX}{id}")
}

pub fn proxy_key_key(id: &str) -> String {
    format!("{PROXY_KEY_PREFIX}{id}")
}

/// A stored value together with the store-native version token used for compare-and-set.
#[derive(Clone, Debug, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {message}")]
    Backend { message: String },
    #[error("store json error: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "store-sqlite")]
    #[error(transparent)]
    Sqlite(#[from] super::sqlite_store::SqliteStoreError),
    #[cfg(feature = "store-redis")]
    #[error(transparent)]
    Redis(#[from] super::redis_store::RedisStoreError),
}

/// Transactional key-value store backing every persisted relay record.
///
/// Each successful write assigns the key a fresh version. `compare_and_set` with
/// `expected = None` only succeeds when the key does not exist yet.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned<Value>>, StoreError>;

    async fn set(&self, key: &str, value: Value) -> Result<u64, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Entries whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned<Value>)>, StoreError>;

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> Result<bool, StoreError>;
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(entry) => Ok(Some(serde_json::from_value(entry.value)?)),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize + ?Sized>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<u64, StoreError> {
    store.set(key, serde_json::to_value(value)?).await
}

pub async fn list_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    prefix: &str,
) -> Result<Vec<T>, StoreError> {
    let entries = store.list(prefix).await?;
    let mut out = Vec::with_capacity(entries.len());
    for (_key, entry) in entries {
        out.push(serde_json::from_value(entry.value)?);
    }
    Ok(out)
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: BTreeMap<String, Versioned<Value>>,
    next_version: u64,
}

impl MemoryInner {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

/// Process-local store. Used for tests and single-run deployments without durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned<Value>>, StoreError> {
        Ok(self.inner.lock().await.entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let version = inner.bump();
        inner
            .entries
            .insert(key.to_string(), Versioned { value, version });
        Ok(version)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.entries.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned<Value>)>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let current = inner.entries.get(key).map(|entry| entry.version);
        if current != expected {
            return Ok(false);
        }
        let version = inner.bump();
        inner
            .entries
            .insert(key.to_string(), Versioned { value, version });
        Ok(true)
    }
}

/// Opens the store selected by `config`.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn KvStore>, GatewayError> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "store-sqlite")]
        StoreBackend::Sqlite => {
            let path = config.sqlite_path.clone().ok_or_else(|| GatewayError::Config {
                message: "sqlite store requires a path".to_string(),
            })?;
            let store = super::sqlite_store::SqliteKvStore::new(path);
            store.init().await.map_err(StoreError::from)?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "store-redis")]
        StoreBackend::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| GatewayError::Config {
                message: "redis store requires a url".to_string(),
            })?;
            let store = super::redis_store::RedisKvStore::new(url)
                .map_err(StoreError::from)?
                .with_prefix(config.redis_prefix.clone());
            store.ping().await.map_err(StoreError::from)?;
            Ok(Arc::new(store))
        }
        #[allow(unreachable_patterns)]
        other => Err(GatewayError::Config {
            message: format!("store backend {other:?} is not compiled in"),
        }),
    }
}
