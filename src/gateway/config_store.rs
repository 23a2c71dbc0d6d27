use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::config::CasConfig;
use super::store::{CONFIG_KEY, KvStore, StoreError, Versioned};
use super::{GatewayError, random_u64};

/// The single global configuration record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub model_pool: Vec<String>,
    pub current_model_index: u64,
    pub total_requests: u64,
    pub kv_flush_interval_ms: u64,
}

impl ProxyConfig {
    pub fn initial(model_pool: &[String], kv_flush_interval_ms: u64) -> Self {
        Self {
            model_pool: normalize_model_pool(model_pool),
            current_model_index: 0,
            total_requests: 0,
            kv_flush_interval_ms,
        }
    }
}

/// Trims names, drops blanks and keeps the first occurrence of each model.
pub fn normalize_model_pool<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for name in raw {
        let name = name.as_ref().trim();
        if name.is_empty() || out.iter().any(|existing| existing == name) {
            continue;
        }
        out.push(name.to_string());
    }
    out
}

/// Clamps an operator-supplied flush interval. Non-finite input falls back to `default_ms`.
pub fn normalize_flush_interval_ms(raw: f64, default_ms: u64, min_ms: u64) -> u64 {
    if !raw.is_finite() {
        return default_ms.max(min_ms);
    }
    let truncated = raw.trunc();
    if truncated < min_ms as f64 {
        return min_ms;
    }
    if truncated >= u64::MAX as f64 {
        return u64::MAX;
    }
    truncated as u64
}

fn incompatible(detail: impl Into<String>) -> GatewayError {
    GatewayError::IncompatibleSchema {
        detail: detail.into(),
    }
}

fn non_negative_integer(raw: &Map<String, Value>, field: &str) -> Result<u64, GatewayError> {
    raw.get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| incompatible(format!("{field} is missing or not a non-negative integer")))
}

/// Structural validation of a persisted record. Never coerces retired or mistyped fields.
pub fn validate_proxy_config(raw: &Value) -> Result<ProxyConfig, GatewayError> {
    let Some(raw) = raw.as_object() else {
        return Err(incompatible("config is not an object"));
    };

    if raw.contains_key("schemaVersion") || raw.contains_key("disabledModels") {
        return Err(incompatible(
            "retired fields schemaVersion/disabledModels are present",
        ));
    }

    let Some(pool) = raw.get("modelPool").and_then(Value::as_array) else {
        return Err(incompatible("modelPool is missing or not an array"));
    };
    let names: Vec<&str> = pool.iter().filter_map(Value::as_str).collect();

    Ok(ProxyConfig {
        model_pool: normalize_model_pool(&names),
        current_model_index: non_negative_integer(raw, "currentModelIndex")?,
        total_requests: non_negative_integer(raw, "totalRequests")?,
        kv_flush_interval_ms: non_negative_integer(raw, "kvFlushIntervalMs")?,
    })
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Capped exponential delay for `attempt`, plus jitter drawn from `[0, delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let cap_ms = self.max_delay.as_millis() as u64;
        let delay_ms = base_ms
            .checked_shl(attempt.min(32))
            .unwrap_or(u64::MAX)
            .min(cap_ms);
        let jitter_ms = if delay_ms == 0 {
            0
        } else {
            random_u64() % delay_ms
        };
        Duration::from_millis(delay_ms.saturating_add(jitter_ms))
    }
}

impl From<&CasConfig> for RetryPolicy {
    fn from(config: &CasConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_cap_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&CasConfig::default())
    }
}

/// Owner of the [`ProxyConfig`] record. All writes go through optimistic compare-and-set.
pub struct ConfigStore {
    store: Arc<dyn KvStore>,
    defaults: ProxyConfig,
    retry: RetryPolicy,
    cached: RwLock<Option<ProxyConfig>>,
}

impl ConfigStore {
    pub fn new(store: Arc<dyn KvStore>, defaults: ProxyConfig) -> Self {
        Self {
            store,
            defaults,
            retry: RetryPolicy::default(),
            cached: RwLock::new(None),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Last record read or written by this process, if any.
    pub fn cached(&self) -> Option<ProxyConfig> {
        self.cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_cached(&self, config: &ProxyConfig) {
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
    }

    async fn ensure_entry(&self) -> Result<Versioned<ProxyConfig>, GatewayError> {
        let mut entry = self.store.get(CONFIG_KEY).await?;
        if entry.is_none() {
            // Losing this race to another writer is fine; the re-read picks up its record.
            let initial = serde_json::to_value(&self.defaults)?;
            self.store
                .compare_and_set(CONFIG_KEY, None, initial)
                .await?;
            entry = self.store.get(CONFIG_KEY).await?;
        }
        let Some(entry) = entry else {
            return Err(GatewayError::Store(StoreError::Backend {
                message: "config record missing after initialization".to_string(),
            }));
        };
        Ok(Versioned {
            value: validate_proxy_config(&entry.value)?,
            version: entry.version,
        })
    }

    /// Current record, creating the default one on first access.
    pub async fn get(&self) -> Result<ProxyConfig, GatewayError> {
        let entry = self.ensure_entry().await?;
        self.set_cached(&entry.value);
        Ok(entry.value)
    }

    /// Read-modify-write under compare-and-set.
    ///
    /// `apply` may run several times and should be a pure function of its input. Returning a
    /// record equal to the input skips the write entirely.
    pub async fn update<F>(&self, mut apply: F) -> Result<ProxyConfig, GatewayError>
    where
        F: FnMut(&ProxyConfig) -> ProxyConfig + Send,
    {
        for attempt in 0..self.retry.max_attempts {
            let entry = self.ensure_entry().await?;
            let next = apply(&entry.value);
            if next == entry.value {
                self.set_cached(&entry.value);
                return Ok(entry.value);
            }

            let validated = validate_proxy_config(&serde_json::to_value(&next)?)?;
            let committed = self
                .store
                .compare_and_set(
                    CONFIG_KEY,
                    Some(entry.version),
                    serde_json::to_value(&validated)?,
                )
                .await?;
            if committed {
                self.set_cached(&validated);
                return Ok(validated);
            }

            debug!(attempt, "config compare-and-set conflict, retrying");
            if attempt + 1 < self.retry.max_attempts {
                tokio::time::sleep(self.retry.delay_for(attempt)).await;
            }
        }

        Err(GatewayError::RetryBudgetExhausted {
            attempts: self.retry.max_attempts,
        })
    }
}
