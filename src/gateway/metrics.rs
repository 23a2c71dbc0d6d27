use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// How a proxied request ended, from the relay's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyOutcome {
    Success,
    NoKey,
    NoKeyCooldown,
    NoModel,
    Timeout,
    UpstreamError,
}

/// Classification of one upstream attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamOutcome {
    Success,
    Unauthorized,
    Forbidden,
    ModelNotFound,
    RateLimited,
    Other,
    NetworkError,
    Timeout,
}

impl UpstreamOutcome {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            429 => Self::RateLimited,
            _ => Self::Other,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequestCounters {
    pub success: u64,
    pub no_key: u64,
    pub no_key_cooldown: u64,
    pub no_model: u64,
    pub timeout: u64,
    pub upstream_error: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamResponseCounters {
    #[serde(rename = "2xx")]
    pub success: u64,
    #[serde(rename = "401")]
    pub unauthorized: u64,
    #[serde(rename = "403")]
    pub forbidden: u64,
    #[serde(rename = "404_model_not_found")]
    pub model_not_found: u64,
    #[serde(rename = "429")]
    pub rate_limited: u64,
    pub other: u64,
    pub network_error: u64,
    pub timeout: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushCounters {
    pub success: u64,
    pub failure: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub proxy_requests: ProxyRequestCounters,
    pub upstream_responses: UpstreamResponseCounters,
    pub flush: FlushCounters,
}

#[derive(Debug, Default)]
pub struct RelayMetrics {
    snapshot: Mutex<MetricsSnapshot>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<F: FnOnce(&mut MetricsSnapshot)>(&self, apply: F) {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut snapshot);
    }

    pub fn record_proxy(&self, outcome: ProxyOutcome) {
        self.with(|snapshot| {
            let counters = &mut snapshot.proxy_requests;
            let slot = match outcome {
                ProxyOutcome::Success => &mut counters.success,
                ProxyOutcome::NoKey => &mut counters.no_key,
                ProxyOutcome::NoKeyCooldown => &mut counters.no_key_cooldown,
                ProxyOutcome::NoModel => &mut counters.no_model,
                ProxyOutcome::Timeout => &mut counters.timeout,
                ProxyOutcome::UpstreamError => &mut counters.upstream_error,
            };
            *slot = slot.saturating_add(1);
        });
    }

    pub fn record_upstream(&self, outcome: UpstreamOutcome) {
        self.with(|snapshot| {
            let counters = &mut snapshot.upstream_responses;
            let slot = match outcome {
                UpstreamOutcome::Success => &mut counters.success,
                UpstreamOutcome::Unauthorized => &mut counters.unauthorized,
                UpstreamOutcome::Forbidden => &mut counters.forbidden,
                UpstreamOutcome::ModelNotFound => &mut counters.model_not_found,
                UpstreamOutcome::RateLimited => &mut counters.rate_limited,
                UpstreamOutcome::Other => &mut counters.other,
                UpstreamOutcome::NetworkError => &mut counters.network_error,
                UpstreamOutcome::Timeout => &mut counters.timeout,
            };
            *slot = slot.saturating_add(1);
        });
    }

    pub fn record_flush(&self, success: bool) {
        self.with(|snapshot| {
            if success {
                snapshot.flush.success = snapshot.flush.success.saturating_add(1);
            } else {
                snapshot.flush.failure = snapshot.flush.failure.saturating_add(1);
            }
        });
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
