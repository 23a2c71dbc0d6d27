use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use super::config::CatalogConfig;
use super::store::{KvStore, MODEL_CATALOG_KEY, get_json, set_json};
use super::{Clock, GatewayError};

/// Snapshot of the upstream's published model list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCatalog {
    pub source: String,
    pub fetched_at: u64,
    pub models: Vec<String>,
}

impl ModelCatalog {
    /// Fresh iff `now` falls in `[fetched_at, fetched_at + ttl_ms)`.
    pub fn is_fresh(&self, now: u64, ttl_ms: u64) -> bool {
        now >= self.fetched_at && now - self.fetched_at < ttl_ms
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogView {
    pub catalog: ModelCatalog,
    pub stale: bool,
    pub last_error: Option<String>,
}

impl CatalogView {
    fn fresh(catalog: ModelCatalog) -> Self {
        Self {
            catalog,
            stale: false,
            last_error: None,
        }
    }
}

/// Extracts `data[].id`, skipping malformed entries and keeping first occurrences.
pub fn parse_catalog_models(body: &Value) -> Vec<String> {
    let Some(entries) = body.get("data").and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut models: Vec<String> = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(id) = entry.get("id").and_then(Value::as_str) else {
            continue;
        };
        let id = id.trim();
        if id.is_empty() || models.iter().any(|existing| existing == id) {
            continue;
        }
        models.push(id.to_string());
    }
    models
}

type RefreshOutcome = Result<ModelCatalog, String>;

/// TTL cache over the upstream catalog endpoint with coalesced refreshes.
pub struct ModelCatalogManager {
    store: Arc<dyn KvStore>,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
    settings: CatalogConfig,
    cached: Mutex<Option<ModelCatalog>>,
    refresh_gate: tokio::sync::Mutex<()>,
    completed: AtomicU64,
    last_outcome: Mutex<Option<RefreshOutcome>>,
}

impl ModelCatalogManager {
    pub fn new(
        store: Arc<dyn KvStore>,
        client: reqwest::Client,
        clock: Arc<dyn Clock>,
        settings: CatalogConfig,
    ) -> Self {
        Self {
            store,
            client,
            clock,
            settings,
            cached: Mutex::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
            completed: AtomicU64::new(0),
            last_outcome: Mutex::new(None),
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.settings.ttl_ms
    }

    fn cached_slot(&self) -> MutexGuard<'_, Option<ModelCatalog>> {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cached(&self) -> Option<ModelCatalog> {
        self.cached_slot().clone()
    }

    /// Loads the persisted catalog into memory, if one exists.
    pub async fn load_persisted(&self) -> Result<Option<ModelCatalog>, GatewayError> {
        let persisted: Option<ModelCatalog> =
            get_json(self.store.as_ref(), MODEL_CATALOG_KEY).await?;
        if let Some(catalog) = &persisted {
            *self.cached_slot() = Some(catalog.clone());
        }
        Ok(persisted)
    }

    async fn best_known(&self) -> Option<ModelCatalog> {
        match self.cached() {
            Some(cached) => Some(cached),
            None => self.best_persisted().await,
        }
    }

    /// Fresh catalog if available, otherwise a refresh, otherwise the last known catalog
    /// marked stale.
    pub async fn get_fresh(&self) -> Result<CatalogView, GatewayError> {
        let now = self.clock.now_millis();
        let ttl_ms = self.settings.ttl_ms;

        let mut known = self.cached();
        if !known.as_ref().is_some_and(|catalog| catalog.is_fresh(now, ttl_ms)) {
            if let Some(persisted) = self.best_persisted().await {
                known = Some(persisted);
            }
        }
        if let Some(catalog) = known.as_ref().filter(|catalog| catalog.is_fresh(now, ttl_ms)) {
            return Ok(CatalogView::fresh(catalog.clone()));
        }

        match self.refresh().await {
            Ok(catalog) => Ok(CatalogView::fresh(catalog)),
            Err(err) => match known {
                Some(catalog) => Ok(CatalogView {
                    catalog,
                    stale: true,
                    last_error: Some(err.to_string()),
                }),
                None => Err(err),
            },
        }
    }

    async fn best_persisted(&self) -> Option<ModelCatalog> {
        match get_json::<ModelCatalog>(self.store.as_ref(), MODEL_CATALOG_KEY).await {
            Ok(persisted) => persisted,
            Err(err) => {
                error!(error = %err, "reading persisted model catalog failed");
                None
            }
        }
    }

    /// Refresh regardless of freshness, falling back to the last known catalog on failure.
    pub async fn force_refresh(&self) -> Result<CatalogView, GatewayError> {
        let fallback = self.best_known().await;
        match self.refresh().await {
            Ok(catalog) => Ok(CatalogView::fresh(catalog)),
            Err(err) => match fallback {
                Some(catalog) => Ok(CatalogView {
                    catalog,
                    stale: true,
                    last_error: Some(err.to_string()),
                }),
                None => Err(err),
            },
        }
    }

    /// Fetches the catalog. Callers arriving while a fetch is in flight share its result.
    pub async fn refresh(&self) -> Result<ModelCatalog, GatewayError> {
        let observed = self.completed.load(Ordering::Acquire);
        let _gate = self.refresh_gate.lock().await;

        if self.completed.load(Ordering::Acquire) != observed {
            let shared = self
                .last_outcome
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(outcome) = shared {
                debug!("joined in-flight model catalog refresh");
                return outcome.map_err(|message| GatewayError::Catalog { message });
            }
        }

        let outcome = self.fetch_and_store().await;
        *self
            .last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outcome.clone());
        self.completed.fetch_add(1, Ordering::AcqRel);
        outcome.map_err(|message| GatewayError::Catalog { message })
    }

    async fn fetch_and_store(&self) -> RefreshOutcome {
        let timeout = Duration::from_millis(self.settings.fetch_timeout_ms);
        let models = match tokio::time::timeout(timeout, self.fetch_models()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(format!(
                    "catalog fetch timed out after {}ms",
                    self.settings.fetch_timeout_ms
                ));
            }
        };

        let catalog = ModelCatalog {
            source: self.settings.source.clone(),
            fetched_at: self.clock.now_millis(),
            models,
        };
        *self.cached_slot() = Some(catalog.clone());

        if let Err(err) = set_json(self.store.as_ref(), MODEL_CATALOG_KEY, &catalog).await {
            error!(error = %err, "model catalog save failed");
        }
        Ok(catalog)
    }

    async fn fetch_models(&self) -> Result<Vec<String>, String> {
        let response = self
            .client
            .get(&self.settings.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| format!("catalog fetch failed: {err}"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let suffix = if !text.is_empty() && text.chars().count() <= 200 {
                format!(": {text}")
            } else {
                String::new()
            };
            return Err(format!("HTTP {}{suffix}", status.as_u16()));
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok(parse_catalog_models(&body))
    }
}
