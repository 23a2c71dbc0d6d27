use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::try_join_all;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::FlushConfig;
use super::config_store::{ConfigStore, ProxyConfig, normalize_flush_interval_ms};
use super::key_pool::{DirtyKeys, KeyPool};
use super::metrics::RelayMetrics;
use super::model_rotation::ModelRotation;
use super::proxy_keys::{DirtyProxyKeys, ProxyKeyCache};
use super::store::{KvStore, api_key_key, proxy_key_key};
use super::{Clock, GatewayError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another flush was already running.
    Skipped,
    /// Nothing was dirty.
    Clean,
    Flushed {
        keys: usize,
        proxy_keys: usize,
        folded_requests: u64,
    },
    /// Record writes failed; every snapshot id was re-queued.
    WriteFailed,
    /// Records were written but the request counter fold did not commit.
    FoldFailed,
}

struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Write-back of usage telemetry: dirty key records and the pending request counter.
pub struct FlushScheduler {
    store: Arc<dyn KvStore>,
    config: Arc<ConfigStore>,
    keys: Arc<KeyPool>,
    proxy_keys: Arc<ProxyKeyCache>,
    models: Arc<ModelRotation>,
    metrics: Arc<RelayMetrics>,
    clock: Arc<dyn Clock>,
    settings: FlushConfig,
    in_progress: AtomicBool,
    interval_tx: watch::Sender<Duration>,
}

impl FlushScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn KvStore>,
        config: Arc<ConfigStore>,
        keys: Arc<KeyPool>,
        proxy_keys: Arc<ProxyKeyCache>,
        models: Arc<ModelRotation>,
        metrics: Arc<RelayMetrics>,
        clock: Arc<dyn Clock>,
        settings: FlushConfig,
    ) -> Self {
        let initial = Duration::from_millis(settings.default_interval_ms.max(settings.min_interval_ms));
        let (interval_tx, _interval_rx) = watch::channel(initial);
        Self {
            store,
            config,
            keys,
            proxy_keys,
            models,
            metrics,
            clock,
            settings,
            in_progress: AtomicBool::new(false),
            interval_tx,
        }
    }

    /// Derives the timer period from `config` and hands it to the running task.
    pub fn apply_interval(&self, config: &ProxyConfig) -> u64 {
        let effective = normalize_flush_interval_ms(
            config.kv_flush_interval_ms as f64,
            self.settings.default_interval_ms,
            self.settings.min_interval_ms,
        );
        self.interval_tx
            .send_replace(Duration::from_millis(effective));
        effective
    }

    pub fn effective_interval_ms(&self) -> u64 {
        self.interval_tx.borrow().as_millis() as u64
    }

    pub async fn flush_once(&self) -> FlushOutcome {
        self.keys.purge_expired_cooldowns(self.clock.now_millis());

        if self.in_progress.swap(true, Ordering::AcqRel) {
            return FlushOutcome::Skipped;
        }
        let _in_progress = InProgress(&self.in_progress);

        if !self.keys.is_dirty() && !self.proxy_keys.is_dirty() {
            return FlushOutcome::Clean;
        }

        let (keys, proxy_keys) = {
            let _key_writes = self.keys.lock_record_writes().await;
            let _proxy_key_writes = self.proxy_keys.lock_record_writes().await;
            let keys = self.keys.take_dirty();
            let proxy_keys = self.proxy_keys.take_dirty();

            if let Err(err) = self.write_snapshot(&keys, &proxy_keys).await {
                self.keys.restore_dirty(&keys.ids, keys.config_dirty);
                self.proxy_keys.restore_dirty(&proxy_keys.ids);
                self.metrics.record_flush(false);
                error!(
                    error = %err,
                    keys = keys.ids.len(),
                    proxy_keys = proxy_keys.ids.len(),
                    "[flush] write failed"
                );
                return FlushOutcome::WriteFailed;
            }
            (keys, proxy_keys)
        };

        let written_keys = keys.records.len();
        let written_proxy_keys = proxy_keys.records.len();
        let pending = keys.pending_requests;
        if !keys.config_dirty || pending == 0 {
            self.metrics.record_flush(true);
            return FlushOutcome::Flushed {
                keys: written_keys,
                proxy_keys: written_proxy_keys,
                folded_requests: 0,
            };
        }

        let cursor = self.models.cursor() as u64;
        let folded = self
            .config
            .update(|config| ProxyConfig {
                total_requests: config.total_requests.saturating_add(pending),
                current_model_index: cursor,
                ..config.clone()
            })
            .await;
        match folded {
            Ok(next) => {
                self.keys.settle_pending(pending);
                if next.model_pool != self.models.pool() {
                    self.models.rebuild(&next);
                }
                self.metrics.record_flush(true);
                debug!(
                    keys = written_keys,
                    proxy_keys = written_proxy_keys,
                    folded_requests = pending,
                    "flush complete"
                );
                FlushOutcome::Flushed {
                    keys: written_keys,
                    proxy_keys: written_proxy_keys,
                    folded_requests: pending,
                }
            }
            Err(err) => {
                self.keys.mark_config_dirty();
                self.metrics.record_flush(false);
                error!(error = %err, pending, "[flush] config fold failed");
                FlushOutcome::FoldFailed
            }
        }
    }

    async fn write_snapshot(
        &self,
        keys: &DirtyKeys,
        proxy_keys: &DirtyProxyKeys,
    ) -> Result<(), GatewayError> {
        let mut entries: Vec<(String, Value)> =
            Vec::with_capacity(keys.records.len() + proxy_keys.records.len());
        for record in &keys.records {
            entries.push((api_key_key(&record.id), serde_json::to_value(record)?));
        }
        for record in &proxy_keys.records {
            entries.push((proxy_key_key(&record.id), serde_json::to_value(record)?));
        }

        let store = self.store.as_ref();
        try_join_all(
            entries
                .into_iter()
                .map(|(key, value)| async move { store.set(&key, value).await }),
        )
        .await?;
        Ok(())
    }

    /// Starts the periodic flush. The period follows [`FlushScheduler::apply_interval`].
    pub fn spawn(self: &Arc<Self>) -> FlushTask {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let scheduler = Arc::clone(self);
        let mut interval_rx = self.interval_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut period = *interval_rx.borrow_and_update();
            let mut ticker = new_ticker(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = interval_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let next = *interval_rx.borrow_and_update();
                        if next != period {
                            debug!(interval_ms = next.as_millis() as u64, "flush interval changed");
                            period = next;
                            ticker = new_ticker(period);
                        }
                    }
                    _ = ticker.tick() => {
                        scheduler.flush_once().await;
                    }
                }
            }
        });

        FlushTask {
            cancel,
            handle: Some(handle),
        }
    }

    /// Final flush before exit, bounded by the configured shutdown timeout.
    pub async fn shutdown(&self) -> Option<FlushOutcome> {
        let timeout = Duration::from_millis(self.settings.shutdown_timeout_ms);
        match tokio::time::timeout(timeout, self.flush_once()).await {
            Ok(outcome) => {
                info!(?outcome, "shutdown flush finished");
                Some(outcome)
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.settings.shutdown_timeout_ms,
                    "shutdown flush timed out"
                );
                None
            }
        }
    }
}

fn new_ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Handle to the periodic flush task. Dropping it aborts the task.
pub struct FlushTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl FlushTask {
    /// Stops the timer and waits for an in-flight flush to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "flush task ended abnormally");
                }
            }
        }
    }
}

impl Drop for FlushTask {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
