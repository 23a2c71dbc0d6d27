use std::sync::Arc;

use tracing::{info, warn};

use super::config::RelayConfig;
use super::config_store::{ConfigStore, ProxyConfig, RetryPolicy};
use super::flush::FlushScheduler;
use super::key_pool::KeyPool;
use super::metrics::RelayMetrics;
use super::model_catalog::ModelCatalogManager;
use super::model_rotation::ModelRotation;
use super::proxy_keys::ProxyKeyCache;
use super::store::KvStore;
use super::upstream::UpstreamClient;
use super::{Clock, GatewayError, SystemClock};

/// Everything a request handler or background task needs, constructed once at startup.
#[derive(Clone)]
pub struct RelayState {
    pub settings: Arc<RelayConfig>,
    pub store: Arc<dyn KvStore>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<ConfigStore>,
    pub keys: Arc<KeyPool>,
    pub proxy_keys: Arc<ProxyKeyCache>,
    pub models: Arc<ModelRotation>,
    pub catalog: Arc<ModelCatalogManager>,
    pub flush: Arc<FlushScheduler>,
    pub upstream: UpstreamClient,
    pub metrics: Arc<RelayMetrics>,
}

impl RelayState {
    pub fn new(settings: RelayConfig, store: Arc<dyn KvStore>) -> Result<Self, GatewayError> {
        Self::with_clock(settings, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        settings: RelayConfig,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GatewayError> {
        let upstream = UpstreamClient::new(&settings.upstream)?;

        let defaults = ProxyConfig::initial(
            &settings.pool.default_models,
            settings.flush.default_interval_ms,
        );
        let config = Arc::new(
            ConfigStore::new(store.clone(), defaults)
                .with_retry_policy(RetryPolicy::from(&settings.cas)),
        );
        let keys = Arc::new(KeyPool::new(
            store.clone(),
            clock.clone(),
            settings.pool.default_cooldown_ms,
        ));
        let proxy_keys = Arc::new(ProxyKeyCache::new(
            store.clone(),
            clock.clone(),
            settings.pool.max_proxy_keys,
        ));
        let models = Arc::new(ModelRotation::new(config.clone()));
        let catalog = Arc::new(ModelCatalogManager::new(
            store.clone(),
            upstream.http_client().clone(),
            clock.clone(),
            settings.catalog.clone(),
        ));
        let metrics = Arc::new(RelayMetrics::new());
        let flush = Arc::new(FlushScheduler::new(
            store.clone(),
            config.clone(),
            keys.clone(),
            proxy_keys.clone(),
            models.clone(),
            metrics.clone(),
            clock.clone(),
            settings.flush.clone(),
        ));

        Ok(Self {
            settings: Arc::new(settings),
            store,
            clock,
            config,
            keys,
            proxy_keys,
            models,
            catalog,
            flush,
            upstream,
            metrics,
        })
    }

    /// Cold load of every cache from the store.
    pub async fn bootstrap(&self) -> Result<ProxyConfig, GatewayError> {
        let config = self.config.get().await?;
        let keys = self.keys.load_from_store().await?;
        let proxy_keys = self.proxy_keys.load_from_store().await?;
        if let Err(err) = self.catalog.load_persisted().await {
            warn!(error = %err, "persisted model catalog could not be loaded");
        }
        self.models.rebuild(&config);
        let flush_interval_ms = self.flush.apply_interval(&config);

        info!(
            keys,
            proxy_keys,
            models = config.model_pool.len(),
            flush_interval_ms,
            "relay state loaded"
        );
        Ok(config)
    }
}
