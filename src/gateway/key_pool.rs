use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::store::{API_KEY_PREFIX, KvStore, api_key_key, get_json, list_json, set_json};
use super::{Clock, GatewayError, generate_id};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Inactive,
    Invalid,
}

impl KeyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Invalid => "invalid",
        }
    }
}

/// An upstream credential as persisted under `api_keys/{id}`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: String,
    pub key: String,
    pub status: KeyStatus,
    #[serde(default)]
    pub use_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<u64>,
    pub created_at: u64,
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .field("status", &self.status)
            .field("use_count", &self.use_count)
            .field("last_used", &self.last_used)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Credential handed to the forwarding pipeline for one upstream call.
#[derive(Clone, PartialEq, Eq)]
pub struct SelectedKey {
    pub id: String,
    pub key: String,
}

impl std::fmt::Debug for SelectedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedKey")
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Snapshot taken by the flush scheduler. The dirty set and config flag are cleared when it is
/// taken; the pending counter is not.
#[derive(Debug, Default)]
pub struct DirtyKeys {
    pub ids: Vec<String>,
    pub records: Vec<ApiKey>,
    pub config_dirty: bool,
    pub pending_requests: u64,
}

#[derive(Debug, Default)]
struct KeyPoolInner {
    keys_by_id: HashMap<String, ApiKey>,
    active_ids: Vec<String>,
    cursor: usize,
    cooldown_until: HashMap<String, u64>,
    dirty: HashSet<String>,
    pending_requests: u64,
    config_dirty: bool,
    last_created_at: u64,
}

impl KeyPoolInner {
    fn rebuild(&mut self) {
        let mut active: Vec<&ApiKey> = self
            .keys_by_id
            .values()
            .filter(|key| key.status == KeyStatus::Active)
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        self.active_ids = active.into_iter().map(|key| key.id.clone()).collect();
        if self.active_ids.is_empty() {
            self.cursor = 0;
        } else {
            self.cursor %= self.active_ids.len();
        }
    }

    fn sorted_keys(&self) -> Vec<ApiKey> {
        let mut keys: Vec<ApiKey> = self.keys_by_id.values().cloned().collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        keys
    }
}

/// In-memory mirror of every upstream key with round-robin selection.
///
/// The pool is the only writer of `api_keys/*` records. Usage fields are written back by the
/// flush scheduler; administrative changes are written immediately.
pub struct KeyPool {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    default_cooldown_ms: u64,
    inner: Mutex<KeyPoolInner>,
    record_writes: tokio::sync::Mutex<()>,
}

impl KeyPool {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, default_cooldown_ms: u64) -> Self {
        Self {
            store,
            clock,
            default_cooldown_ms,
            inner: Mutex::new(KeyPoolInner::default()),
            record_writes: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, KeyPoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn rebuild(&self) {
        self.lock().rebuild();
    }

    /// Serializes writes of `api_keys/*` records.
    ///
    /// The flush scheduler holds this from taking its snapshot until the last record write, so
    /// a stale usage snapshot cannot land on top of an invalidation or a delete.
    pub async fn lock_record_writes(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.record_writes.lock().await
    }

    /// Picks the next active key not in cooldown, starting at the cursor.
    ///
    /// The whole scan, cursor advance and usage bump happen under one lock without awaiting.
    pub fn select_next(&self, now: u64) -> Option<SelectedKey> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let len = inner.active_ids.len();
        for offset in 0..len {
            let idx = (inner.cursor + offset) % len;
            let id = &inner.active_ids[idx];
            if inner.cooldown_until.get(id).is_some_and(|until| *until > now) {
                continue;
            }
            let Some(entry) = inner.keys_by_id.get_mut(id) else {
                continue;
            };
            if entry.status != KeyStatus::Active {
                continue;
            }

            entry.use_count = entry.use_count.saturating_add(1);
            entry.last_used = Some(now);
            let selected = SelectedKey {
                id: entry.id.clone(),
                key: entry.key.clone(),
            };
            inner.cursor = (idx + 1) % len;
            inner.dirty.insert(selected.id.clone());
            inner.pending_requests = inner.pending_requests.saturating_add(1);
            inner.config_dirty = true;
            return Some(selected);
        }
        None
    }

    pub fn has_active_keys(&self) -> bool {
        !self.lock().active_ids.is_empty()
    }

    /// Applies an upstream 429. Only an all-digit `Retry-After` (seconds) is honored.
    pub fn set_cooldown(&self, id: &str, retry_after: Option<&str>, now: u64) -> u64 {
        let delay_ms = retry_after
            .map(str::trim)
            .filter(|raw| !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(|secs| secs.saturating_mul(1_000))
            .unwrap_or(self.default_cooldown_ms);
        let until = now.saturating_add(delay_ms);
        self.lock().cooldown_until.insert(id.to_string(), until);
        until
    }

    pub fn cooldown_until(&self, id: &str) -> Option<u64> {
        self.lock().cooldown_until.get(id).copied()
    }

    pub fn purge_expired_cooldowns(&self, now: u64) -> usize {
        let mut inner = self.lock();
        let before = inner.cooldown_until.len();
        inner.cooldown_until.retain(|_, until| *until >= now);
        before - inner.cooldown_until.len()
    }

    /// Earliest cooldown expiry still in the future among active keys.
    pub fn min_cooldown_until(&self, now: u64) -> Option<u64> {
        let inner = self.lock();
        inner
            .active_ids
            .iter()
            .filter_map(|id| inner.cooldown_until.get(id).copied())
            .filter(|until| *until > now)
            .min()
    }

    /// Marks a key invalid and persists the change right away.
    ///
    /// A failed write leaves the in-memory status in place and re-queues the id for the
    /// flush scheduler.
    pub async fn invalidate(&self, id: &str) {
        let record = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let Some(entry) = inner.keys_by_id.get_mut(id) else {
                return;
            };
            if entry.status == KeyStatus::Invalid {
                return;
            }
            entry.status = KeyStatus::Invalid;
            let record = entry.clone();
            inner.cooldown_until.remove(id);
            inner.dirty.remove(id);
            inner.rebuild();
            record
        };

        info!(key_id = %id, "api key marked invalid");
        let _writes = self.record_writes.lock().await;
        if let Err(err) = set_json(self.store.as_ref(), &api_key_key(id), &record).await {
            self.lock().dirty.insert(id.to_string());
            error!(key_id = %id, error = %err, "immediate write of invalid key failed");
        }
    }

    /// Reconciles the cache with a full scan of the store.
    pub async fn merge_from_store(&self) -> Result<usize, GatewayError> {
        let stored: Vec<ApiKey> = list_json(self.store.as_ref(), API_KEY_PREFIX).await?;
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut adopted = 0;
        for record in stored {
            match inner.keys_by_id.get_mut(&record.id) {
                None => {
                    adopted += 1;
                    inner.keys_by_id.insert(record.id.clone(), record);
                }
                Some(local) if !inner.dirty.contains(&record.id) => *local = record,
                Some(local) => {
                    local.key = record.key;
                    local.created_at = record.created_at;
                    if local.status != KeyStatus::Invalid || record.status == KeyStatus::Invalid {
                        local.status = record.status;
                    }
                    local.use_count = local.use_count.max(record.use_count);
                    local.last_used = local.last_used.max(record.last_used);
                }
            }
        }
        inner.rebuild();
        Ok(adopted)
    }

    /// Cold load: replaces the cache with the store contents.
    pub async fn load_from_store(&self) -> Result<usize, GatewayError> {
        let stored: Vec<ApiKey> = list_json(self.store.as_ref(), API_KEY_PREFIX).await?;
        let mut inner = self.lock();
        inner.keys_by_id = stored
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        inner.last_created_at = inner
            .keys_by_id
            .values()
            .map(|key| key.created_at)
            .max()
            .unwrap_or(0)
            .max(inner.last_created_at);
        inner.rebuild();
        Ok(inner.keys_by_id.len())
    }

    pub fn take_dirty(&self) -> DirtyKeys {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let ids: Vec<String> = inner.dirty.drain().collect();
        let records = ids
            .iter()
            .filter_map(|id| inner.keys_by_id.get(id).cloned())
            .collect();
        let config_dirty = std::mem::replace(&mut inner.config_dirty, false);
        DirtyKeys {
            ids,
            records,
            config_dirty,
            pending_requests: inner.pending_requests,
        }
    }

    /// Re-queues a snapshot whose write failed. Ids deleted in the meantime are dropped.
    pub fn restore_dirty(&self, ids: &[String], config_dirty: bool) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        for id in ids {
            if inner.keys_by_id.contains_key(id) {
                inner.dirty.insert(id.clone());
            }
        }
        if config_dirty {
            inner.config_dirty = true;
        }
    }

    /// Subtracts a folded snapshot from the live counter, keeping increments made since.
    pub fn settle_pending(&self, folded: u64) {
        let mut inner = self.lock();
        inner.pending_requests = inner.pending_requests.saturating_sub(folded);
    }

    pub fn mark_config_dirty(&self) {
        self.lock().config_dirty = true;
    }

    pub fn pending_requests(&self) -> u64 {
        self.lock().pending_requests
    }

    pub fn is_dirty(&self) -> bool {
        let inner = self.lock();
        !inner.dirty.is_empty() || inner.config_dirty
    }

    pub async fn add_key(&self, secret: &str) -> Result<ApiKey, GatewayError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(GatewayError::InvalidRequest {
                reason: "key must not be empty".to_string(),
            });
        }

        let record = {
            let mut inner = self.lock();
            if inner.keys_by_id.values().any(|key| key.key == secret) {
                return Err(GatewayError::Conflict {
                    reason: "key already exists".to_string(),
                });
            }
            let now = self.clock.now_millis();
            let created_at = if now <= inner.last_created_at {
                inner.last_created_at + 1
            } else {
                now
            };
            inner.last_created_at = created_at;
            ApiKey {
                id: generate_id(),
                key: secret.to_string(),
                status: KeyStatus::Active,
                use_count: 0,
                last_used: None,
                created_at,
            }
        };

        set_json(self.store.as_ref(), &api_key_key(&record.id), &record).await?;
        let mut inner = self.lock();
        inner.keys_by_id.insert(record.id.clone(), record.clone());
        inner.rebuild();
        Ok(record)
    }

    pub async fn delete_key(&self, id: &str) -> Result<(), GatewayError> {
        let key = api_key_key(id);
        let _writes = self.record_writes.lock().await;
        if self.store.get(&key).await?.is_none() {
            return Err(GatewayError::NotFound {
                what: format!("api key {id}"),
            });
        }
        self.store.delete(&key).await?;

        let mut inner = self.lock();
        inner.keys_by_id.remove(id);
        inner.cooldown_until.remove(id);
        inner.dirty.remove(id);
        inner.rebuild();
        Ok(())
    }

    /// Explicit status change from an administrative action. Written immediately.
    pub async fn update_status(&self, id: &str, status: KeyStatus) -> Result<ApiKey, GatewayError> {
        let Some(mut record) = self.get(id).await? else {
            return Err(GatewayError::NotFound {
                what: format!("api key {id}"),
            });
        };
        record.status = status;
        let _writes = self.record_writes.lock().await;
        set_json(self.store.as_ref(), &api_key_key(id), &record).await?;

        let mut inner = self.lock();
        match inner.keys_by_id.get_mut(id) {
            Some(local) => local.status = status,
            None => {
                inner.keys_by_id.insert(id.to_string(), record.clone());
            }
        }
        if status == KeyStatus::Invalid {
            inner.cooldown_until.remove(id);
        }
        inner.rebuild();
        Ok(inner.keys_by_id.get(id).cloned().unwrap_or(record))
    }

    /// Cache first, then the store. A store hit is adopted into the cache.
    pub async fn get(&self, id: &str) -> Result<Option<ApiKey>, GatewayError> {
        if let Some(cached) = self.lock().keys_by_id.get(id).cloned() {
            return Ok(Some(cached));
        }
        let Some(record) = get_json::<ApiKey>(self.store.as_ref(), &api_key_key(id)).await? else {
            return Ok(None);
        };
        let mut inner = self.lock();
        inner.keys_by_id.insert(id.to_string(), record.clone());
        inner.rebuild();
        Ok(Some(record))
    }

    pub fn list(&self) -> Vec<ApiKey> {
        self.lock().sorted_keys()
    }

    pub fn first_active(&self) -> Option<SelectedKey> {
        let inner = self.lock();
        inner
            .active_ids
            .first()
            .and_then(|id| inner.keys_by_id.get(id))
            .map(|key| SelectedKey {
                id: key.id.clone(),
                key: key.key.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::store::MemoryStore;
    use crate::utils::test_support::{FlakyStore, ManualClock};

    fn record(id: &str, status: KeyStatus, created_at: u64) -> ApiKey {
        ApiKey {
            id: id.to_string(),
            key: format!("secret-{id}"),
            status,
            use_count: 0,
            last_used: None,
            created_at,
        }
    }

    async fn seeded_pool(store: Arc<dyn KvStore>, keys: &[ApiKey]) -> KeyPool {
        for key in keys {
            set_json(store.as_ref(), &api_key_key(&key.id), key)
                .await
                .expect("seed");
        }
        let pool = KeyPool::new(store, Arc::new(ManualClock::new(1_000)), 2_000);
        pool.load_from_store().await.expect("load");
        pool
    }

    fn pick(pool: &KeyPool, now: u64) -> Option<String> {
        pool.select_next(now).map(|selected| selected.id)
    }

    #[tokio::test]
    async fn round_robin_wraps_around() {
        let pool = seeded_pool(
            Arc::new(MemoryStore::new()),
            &[
                record("a", KeyStatus::Active, 1),
                record("b", KeyStatus::Active, 2),
            ],
        )
        .await;

        assert_eq!(pick(&pool, 10).as_deref(), Some("a"));
        assert_eq!(pick(&pool, 10).as_deref(), Some("b"));
        assert_eq!(pick(&pool, 10).as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn rebuild_filters_and_orders_by_created_at_then_id() {
        let pool = seeded_pool(
            Arc::new(MemoryStore::new()),
            &[
                record("z", KeyStatus::Active, 5),
                record("b", KeyStatus::Active, 1),
                record("a", KeyStatus::Active, 1),
                record("off", KeyStatus::Inactive, 0),
                record("bad", KeyStatus::Invalid, 0),
            ],
        )
        .await;

        let order: Vec<String> = (0..3).filter_map(|_| pick(&pool, 10)).collect();
        assert_eq!(order, vec!["a", "b", "z"]);
        assert_eq!(pick(&pool, 10).as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn cooldown_skips_key_until_expiry() {
        let pool = seeded_pool(
            Arc::new(MemoryStore::new()),
            &[
                record("a", KeyStatus::Active, 1),
                record("b", KeyStatus::Active, 2),
            ],
        )
        .await;

        let t = 100_000;
        pool.set_cooldown("a", Some("10"), t);
        assert_eq!(pool.cooldown_until("a"), Some(t + 10_000));
        assert_eq!(pick(&pool, t).as_deref(), Some("b"));
        assert_eq!(pick(&pool, t + 11_000).as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn cooldown_uses_default_for_non_numeric_retry_after() {
        let pool = seeded_pool(Arc::new(MemoryStore::new()), &[]).await;
        assert_eq!(pool.set_cooldown("a", None, 50), 2_050);
        assert_eq!(pool.set_cooldown("a", Some("1.5"), 50), 2_050);
        assert_eq!(
            pool.set_cooldown("a", Some("Wed, 21 Oct 2015 07:28:00 GMT"), 50),
            2_050
        );
        assert_eq!(pool.set_cooldown("a", Some(" 3 "), 50), 3_050);
    }

    #[tokio::test]
    async fn empty_pool_selection_is_side_effect_free() {
        let pool = seeded_pool(Arc::new(MemoryStore::new()), &[]).await;
        assert!(pool.select_next(10).is_none());
        assert_eq!(pool.pending_requests(), 0);
        assert!(!pool.is_dirty());
    }

    #[tokio::test]
    async fn selections_accumulate_usage_and_pending_counter() {
        let pool = seeded_pool(
            Arc::new(MemoryStore::new()),
            &[
                record("a", KeyStatus::Active, 1),
                record("b", KeyStatus::Active, 2),
                record("c", KeyStatus::Active, 3),
            ],
        )
        .await;

        for step in 0..7 {
            pool.select_next(1_000 + step).expect("selected");
        }
        let total: u64 = pool.list().iter().map(|key| key.use_count).sum();
        assert_eq!(total, 7);
        assert_eq!(pool.pending_requests(), 7);

        let dirty = pool.take_dirty();
        assert!(dirty.config_dirty);
        assert_eq!(dirty.pending_requests, 7);
        assert_eq!(dirty.ids.len(), 3);
        assert!(!pool.is_dirty());

        pool.select_next(2_000).expect("selected");
        pool.settle_pending(dirty.pending_requests);
        assert_eq!(pool.pending_requests(), 1);
    }

    #[tokio::test]
    async fn invalidate_persists_and_removes_from_rotation() {
        let store = Arc::new(MemoryStore::new());
        let pool = seeded_pool(
            store.clone(),
            &[
                record("a", KeyStatus::Active, 1),
                record("b", KeyStatus::Active, 2),
            ],
        )
        .await;
        pool.select_next(10).expect("a");
        pool.set_cooldown("a", None, 10);

        pool.invalidate("a").await;
        let stored: ApiKey = get_json(store.as_ref(), &api_key_key("a"))
            .await
            .expect("get")
            .expect("record");
        assert_eq!(stored.status, KeyStatus::Invalid);
        assert_eq!(pool.cooldown_until("a"), None);
        assert!(!pool.take_dirty().ids.contains(&"a".to_string()));
        assert_eq!(pick(&pool, 100_000).as_deref(), Some("b"));
        assert_eq!(pick(&pool, 100_000).as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn invalidate_requeues_on_write_failure() {
        let store = Arc::new(FlakyStore::new());
        let pool = seeded_pool(store.clone(), &[record("a", KeyStatus::Active, 1)]).await;

        store.set_fail_writes(true);
        pool.invalidate("a").await;
        assert!(!pool.has_active_keys());
        assert_eq!(pool.take_dirty().ids, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn merge_adopts_new_keys_and_never_revives_invalid() {
        let store = Arc::new(MemoryStore::new());
        let pool = seeded_pool(
            store.clone(),
            &[
                record("a", KeyStatus::Active, 1),
                record("b", KeyStatus::Active, 2),
            ],
        )
        .await;

        // a becomes dirty with local usage, then is invalidated locally but the write is lost.
        pool.select_next(500).expect("a");
        {
            let mut inner = pool.lock();
            let entry = inner.keys_by_id.get_mut("a").expect("a");
            entry.status = KeyStatus::Invalid;
            inner.rebuild();
        }

        let mut stale_a = record("a", KeyStatus::Active, 1);
        stale_a.use_count = 9;
        stale_a.last_used = Some(100);
        set_json(store.as_ref(), &api_key_key("a"), &stale_a)
            .await
            .expect("seed");
        set_json(store.as_ref(), &api_key_key("c"), &record("c", KeyStatus::Active, 3))
            .await
            .expect("seed");

        let adopted = pool.merge_from_store().await.expect("merge");
        assert_eq!(adopted, 1);

        let a = pool.get("a").await.expect("get").expect("a");
        assert_eq!(a.status, KeyStatus::Invalid);
        assert_eq!(a.use_count, 9);
        assert_eq!(a.last_used, Some(500));

        let order: Vec<String> = (0..2).filter_map(|_| pick(&pool, 1_000)).collect();
        assert_eq!(order, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn add_key_rejects_duplicates_and_keeps_created_at_monotonic() {
        let store = Arc::new(MemoryStore::new());
        let pool = KeyPool::new(store.clone(), Arc::new(ManualClock::new(1_000)), 2_000);

        let first = pool.add_key("sk-one").await.expect("add");
        let second = pool.add_key("sk-two").await.expect("add");
        assert_eq!(first.created_at, 1_000);
        assert_eq!(second.created_at, 1_001);

        let err = pool.add_key(" sk-one ").await.expect_err("duplicate");
        assert!(matches!(err, GatewayError::Conflict { .. }));
        assert_eq!(store.list(API_KEY_PREFIX).await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn delete_key_clears_cache_state() {
        let store = Arc::new(MemoryStore::new());
        let pool = seeded_pool(store.clone(), &[record("a", KeyStatus::Active, 1)]).await;
        pool.select_next(10).expect("a");
        pool.set_cooldown("a", None, 10);

        pool.delete_key("a").await.expect("delete");
        assert!(pool.list().is_empty());
        assert_eq!(pool.cooldown_until("a"), None);
        assert!(pool.take_dirty().ids.is_empty());

        let err = pool.delete_key("a").await.expect_err("missing");
        assert!(matches!(err, GatewayError::NotFound { .. }));
    }

    #[tokio::test]
    async fn min_cooldown_and_purge() {
        let pool = seeded_pool(
            Arc::new(MemoryStore::new()),
            &[
                record("a", KeyStatus::Active, 1),
                record("b", KeyStatus::Active, 2),
            ],
        )
        .await;
        pool.set_cooldown("a", Some("5"), 0);
        pool.set_cooldown("b", Some("2"), 0);
        assert_eq!(pool.min_cooldown_until(0), Some(2_000));

        assert_eq!(pool.purge_expired_cooldowns(2_000), 0);
        assert_eq!(pool.purge_expired_cooldowns(2_001), 1);
        assert_eq!(pool.min_cooldown_until(2_001), Some(5_000));
    }

    #[test]
    fn debug_redacts_secrets() {
        let rendered = format!("{:?}", record("a", KeyStatus::Active, 1));
        assert!(!rendered.contains("secret-a"));
    }
}
