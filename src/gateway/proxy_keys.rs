use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use super::store::{KvStore, PROXY_KEY_PREFIX, get_json, list_json, proxy_key_key, set_json};
use super::{Clock, GatewayError, generate_id, hex_encode};

const PROXY_KEY_PREFIX_TEXT: &str = "sk-relay-";

/// A caller-facing gate key, persisted under `proxy_keys/{id}`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyAuthKey {
    pub id: String,
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub use_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<u64>,
    pub created_at: u64,
}

impl std::fmt::Debug for ProxyAuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyAuthKey")
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .field("name", &self.name)
            .field("use_count", &self.use_count)
            .field("last_used", &self.last_used)
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthOutcome {
    pub authorized: bool,
    pub key_id: Option<String>,
}

impl AuthOutcome {
    fn denied() -> Self {
        Self {
            authorized: false,
            key_id: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct DirtyProxyKeys {
    pub ids: Vec<String>,
    pub records: Vec<ProxyAuthKey>,
}

#[derive(Debug, Default)]
struct ProxyKeyInner {
    keys_by_id: HashMap<String, ProxyAuthKey>,
    dirty: HashSet<String>,
}

/// Cache of proxy keys. Authorization is disabled while no proxy key exists.
pub struct ProxyKeyCache {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    max_keys: usize,
    inner: Mutex<ProxyKeyInner>,
    record_writes: tokio::sync::Mutex<()>,
}

impl ProxyKeyCache {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, max_keys: usize) -> Self {
        Self {
            store,
            clock,
            max_keys,
            inner: Mutex::new(ProxyKeyInner::default()),
            record_writes: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProxyKeyInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serializes writes of `proxy_keys/*` records against the flush scheduler.
    pub async fn lock_record_writes(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.record_writes.lock().await
    }

    pub async fn load_from_store(&self) -> Result<usize, GatewayError> {
        let stored: Vec<ProxyAuthKey> = list_json(self.store.as_ref(), PROXY_KEY_PREFIX).await?;
        let mut inner = self.lock();
        inner.keys_by_id = stored
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        Ok(inner.keys_by_id.len())
    }

    pub fn authorize(&self, token: Option<&str>) -> AuthOutcome {
        let inner = self.lock();
        if inner.keys_by_id.is_empty() {
            return AuthOutcome {
                authorized: true,
                key_id: None,
            };
        }
        let Some(token) = token.map(str::trim).filter(|token| !token.is_empty()) else {
            return AuthOutcome::denied();
        };
        inner
            .keys_by_id
            .values()
            .find(|key| key.key == token)
            .map(|key| AuthOutcome {
                authorized: true,
                key_id: Some(key.id.clone()),
            })
            .unwrap_or_else(AuthOutcome::denied)
    }

    pub fn record_usage(&self, id: &str) {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        let inner = &mut *guard;
        if let Some(entry) = inner.keys_by_id.get_mut(id) {
            entry.use_count = entry.use_count.saturating_add(1);
            entry.last_used = Some(now);
            inner.dirty.insert(id.to_string());
        }
    }

    pub fn take_dirty(&self) -> DirtyProxyKeys {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let ids: Vec<String> = inner.dirty.drain().collect();
        let records = ids
            .iter()
            .filter_map(|id| inner.keys_by_id.get(id).cloned())
            .collect();
        DirtyProxyKeys { ids, records }
    }

    pub fn restore_dirty(&self, ids: &[String]) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        for id in ids {
            if inner.keys_by_id.contains_key(id) {
                inner.dirty.insert(id.clone());
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.lock().dirty.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().keys_by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates a key with a freshly generated secret. Returns the full record once.
    pub async fn create(&self, name: Option<&str>) -> Result<ProxyAuthKey, GatewayError> {
        let record = {
            let inner = self.lock();
            if inner.keys_by_id.len() >= self.max_keys {
                return Err(GatewayError::LimitReached {
                    limit: self.max_keys,
                });
            }
            let name = name
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("key {}", inner.keys_by_id.len() + 1));
            ProxyAuthKey {
                id: generate_id(),
                key: generate_proxy_secret()?,
                name,
                use_count: 0,
                last_used: None,
                created_at: self.clock.now_millis(),
            }
        };

        set_json(self.store.as_ref(), &proxy_key_key(&record.id), &record).await?;
        self.lock()
            .keys_by_id
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    pub async fn delete(&self, id: &str) -> Result<(), GatewayError> {
        let key = proxy_key_key(id);
        let _writes = self.record_writes.lock().await;
        if self.store.get(&key).await?.is_none() {
            return Err(GatewayError::NotFound {
                what: format!("proxy key {id}"),
            });
        }
        self.store.delete(&key).await?;
        let mut inner = self.lock();
        inner.keys_by_id.remove(id);
        inner.dirty.remove(id);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ProxyAuthKey>, GatewayError> {
        if let Some(cached) = self.lock().keys_by_id.get(id).cloned() {
            return Ok(Some(cached));
        }
        let record = get_json::<ProxyAuthKey>(self.store.as_ref(), &proxy_key_key(id)).await?;
        if let Some(record) = &record {
            self.lock()
                .keys_by_id
                .insert(id.to_string(), record.clone());
        }
        Ok(record)
    }

    pub fn list(&self) -> Vec<ProxyAuthKey> {
        let mut keys: Vec<ProxyAuthKey> = self.lock().keys_by_id.values().cloned().collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        keys
    }
}

fn generate_proxy_secret() -> Result<String, GatewayError> {
    let mut bytes = [0u8; 24];
    getrandom::fill(&mut bytes).map_err(|err| GatewayError::Config {
        message: format!("secure random source unavailable: {err}"),
    })?;
    Ok(format!("{PROXY_KEY_PREFIX_TEXT}{}", hex_encode(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::store::MemoryStore;
    use crate::utils::test_support::ManualClock;

    fn cache(store: Arc<dyn KvStore>, max_keys: usize) -> ProxyKeyCache {
        ProxyKeyCache::new(store, Arc::new(ManualClock::new(5_000)), max_keys)
    }

    #[tokio::test]
    async fn no_keys_means_open_access() {
        let proxy_keys = cache(Arc::new(MemoryStore::new()), 4);
        let outcome = proxy_keys.authorize(None);
        assert!(outcome.authorized);
        assert_eq!(outcome.key_id, None);
    }

    #[tokio::test]
    async fn created_key_gates_access() {
        let proxy_keys = cache(Arc::new(MemoryStore::new()), 4);
        let created = proxy_keys.create(None).await.expect("create");
        assert!(created.key.starts_with("sk-relay-"));
        assert_eq!(created.key.len(), "sk-relay-".len() + 48);
        assert_eq!(created.name, "key 1");

        assert!(!proxy_keys.authorize(None).authorized);
        assert!(!proxy_keys.authorize(Some("sk-relay-wrong")).authorized);
        let outcome = proxy_keys.authorize(Some(&created.key));
        assert!(outcome.authorized);
        assert_eq!(outcome.key_id.as_deref(), Some(created.id.as_str()));
    }

    #[tokio::test]
    async fn create_enforces_limit() {
        let proxy_keys = cache(Arc::new(MemoryStore::new()), 2);
        proxy_keys.create(Some("first")).await.expect("create");
        proxy_keys.create(Some("  ")).await.expect("create");
        let err = proxy_keys.create(Some("third")).await.expect_err("limit");
        assert!(matches!(err, GatewayError::LimitReached { limit: 2 }));

        let names: Vec<String> = proxy_keys.list().into_iter().map(|key| key.name).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"first".to_string()));
        assert!(names.contains(&"key 2".to_string()));
    }

    #[tokio::test]
    async fn usage_is_dirty_until_taken() {
        let proxy_keys = cache(Arc::new(MemoryStore::new()), 4);
        let created = proxy_keys.create(None).await.expect("create");

        proxy_keys.record_usage(&created.id);
        proxy_keys.record_usage(&created.id);
        proxy_keys.record_usage("unknown");
        assert!(proxy_keys.is_dirty());

        let dirty = proxy_keys.take_dirty();
        assert_eq!(dirty.ids, vec![created.id.clone()]);
        assert_eq!(dirty.records[0].use_count, 2);
        assert_eq!(dirty.records[0].last_used, Some(5_000));
        assert!(!proxy_keys.is_dirty());

        proxy_keys.restore_dirty(&dirty.ids);
        assert!(proxy_keys.is_dirty());
    }

    #[tokio::test]
    async fn delete_removes_from_store_and_cache() {
        let store = Arc::new(MemoryStore::new());
        let proxy_keys = cache(store.clone(), 4);
        let created = proxy_keys.create(None).await.expect("create");

        proxy_keys.delete(&created.id).await.expect("delete");
        assert!(proxy_keys.is_empty());
        assert!(store.list(PROXY_KEY_PREFIX).await.expect("list").is_empty());
        assert!(matches!(
            proxy_keys.delete(&created.id).await,
            Err(GatewayError::NotFound { .. })
        ));
    }
}
