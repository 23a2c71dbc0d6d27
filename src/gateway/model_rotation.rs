use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use super::GatewayError;
use super::config_store::{ConfigStore, ProxyConfig, normalize_model_pool};

#[derive(Debug, Default)]
struct RotationInner {
    pool: Vec<String>,
    cursor: usize,
}

/// Round-robin view of the configured model pool.
pub struct ModelRotation {
    config: Arc<ConfigStore>,
    inner: Mutex<RotationInner>,
}

impl ModelRotation {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            config,
            inner: Mutex::new(RotationInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RotationInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-derives the pool from `config`, placing the cursor at the persisted index.
    pub fn rebuild(&self, config: &ProxyConfig) {
        let pool = normalize_model_pool(&config.model_pool);
        let mut inner = self.lock();
        inner.cursor = if pool.is_empty() {
            0
        } else {
            (config.current_model_index % pool.len() as u64) as usize
        };
        inner.pool = pool;
    }

    pub fn select_next(&self) -> Option<String> {
        let mut inner = self.lock();
        if inner.pool.is_empty() {
            return None;
        }
        let idx = inner.cursor % inner.pool.len();
        inner.cursor = (idx + 1) % inner.pool.len();
        Some(inner.pool[idx].clone())
    }

    pub fn cursor(&self) -> usize {
        self.lock().cursor
    }

    pub fn pool(&self) -> Vec<String> {
        self.lock().pool.clone()
    }

    pub fn contains(&self, model: &str) -> bool {
        self.lock().pool.iter().any(|name| name == model)
    }

    /// Removes `model` from the persisted pool and resets rotation to the first model.
    ///
    /// Returns whether the model was present in this process's pool.
    pub async fn evict(&self, model: &str, reason: &str) -> Result<bool, GatewayError> {
        let model = model.trim();
        if model.is_empty() {
            return Ok(false);
        }
        let existed = self.contains(model);

        let next = self
            .config
            .update(|config| {
                let pool = normalize_model_pool(&config.model_pool);
                let remaining: Vec<String> =
                    pool.iter().filter(|name| *name != model).cloned().collect();
                if remaining.len() == pool.len() {
                    return config.clone();
                }
                ProxyConfig {
                    model_pool: remaining,
                    current_model_index: 0,
                    ..config.clone()
                }
            })
            .await?;
        self.rebuild(&next);

        if existed {
            warn!(model = %model, reason = %reason, "model removed from pool");
        }
        Ok(existed)
    }

    /// Administrative pool replacement. Written immediately through the config store.
    pub async fn replace_pool(&self, models: &[String]) -> Result<ProxyConfig, GatewayError> {
        let pool = normalize_model_pool(models);
        let next = self
            .config
            .update(|config| {
                if config.model_pool == pool {
                    return config.clone();
                }
                ProxyConfig {
                    model_pool: pool.clone(),
                    current_model_index: 0,
                    ..config.clone()
                }
            })
            .await?;
        self.rebuild(&next);
        Ok(next)
    }
}
