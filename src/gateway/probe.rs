use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info};

use super::GatewayError;
use super::key_pool::KeyStatus;
use super::metrics::UpstreamOutcome;
use super::state::RelayState;
use super::upstream::is_model_not_found_body;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub success: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeResult {
    fn ok(status: &str) -> Self {
        Self {
            success: true,
            status: status.to_string(),
            error: None,
        }
    }

    fn failed(status: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            status: status.to_string(),
            error: Some(error.into()),
        }
    }
}

fn probe_body(model: &str) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": "test"}],
        "max_tokens": 1,
    })
}

enum ProbeResponse {
    Success,
    Denied(u16),
    ModelNotFound,
    Other(u16),
    Failed(String),
}

async fn send_probe(state: &RelayState, api_key: &str, model: &str) -> ProbeResponse {
    let timeout = state.upstream.probe_timeout();
    let response = match state
        .upstream
        .send_chat_completion(api_key, &probe_body(model), timeout)
        .await
    {
        Ok(response) => response,
        Err(GatewayError::UpstreamTimeout) => {
            state.metrics.record_upstream(UpstreamOutcome::Timeout);
            return ProbeResponse::Failed("request timed out".to_string());
        }
        Err(err) => {
            state.metrics.record_upstream(UpstreamOutcome::NetworkError);
            return ProbeResponse::Failed(err.to_string());
        }
    };

    let status = response.status().as_u16();
    if response.status().is_success() {
        state.metrics.record_upstream(UpstreamOutcome::Success);
        return ProbeResponse::Success;
    }
    if status == 404 {
        let body = response.bytes().await.unwrap_or_default();
        if is_model_not_found_body(&body) {
            state.metrics.record_upstream(UpstreamOutcome::ModelNotFound);
            return ProbeResponse::ModelNotFound;
        }
    }
    state.metrics.record_upstream(UpstreamOutcome::from_status(status));
    if status == 401 || status == 403 {
        ProbeResponse::Denied(status)
    } else {
        ProbeResponse::Other(status)
    }
}

async fn evict_probed_model(state: &RelayState, model: &str) {
    if let Err(err) = state.models.evict(model, "model_not_found").await {
        error!(model = %model, error = %err, "model eviction failed");
    }
}

/// Checks an upstream key with a one-token completion and records the resulting status.
pub async fn test_key(state: &RelayState, id: &str) -> Result<ProbeResult, GatewayError> {
    let Some(key) = state.keys.get(id).await? else {
        return Err(GatewayError::NotFound {
            what: format!("api key {id}"),
        });
    };
    let model = state
        .models
        .pool()
        .into_iter()
        .next()
        .unwrap_or_else(|| state.settings.pool.fallback_model.clone());

    let (status, result) = match send_probe(state, &key.key, &model).await {
        ProbeResponse::Success => (KeyStatus::Active, ProbeResult::ok("active")),
        ProbeResponse::ModelNotFound => {
            evict_probed_model(state, &model).await;
            (KeyStatus::Active, ProbeResult::ok("active"))
        }
        ProbeResponse::Denied(code) => (
            KeyStatus::Invalid,
            ProbeResult::failed("invalid", format!("HTTP {code}")),
        ),
        ProbeResponse::Other(code) => (
            KeyStatus::Inactive,
            ProbeResult::failed("inactive", format!("HTTP {code}")),
        ),
        ProbeResponse::Failed(message) => {
            (KeyStatus::Inactive, ProbeResult::failed("inactive", message))
        }
    };

    state.keys.update_status(id, status).await?;
    info!(key_id = %id, status = status.as_str(), "api key tested");
    Ok(result)
}

/// Checks whether `model` is served upstream, using the first active key.
pub async fn test_model(state: &RelayState, model: &str) -> Result<ProbeResult, GatewayError> {
    let model = model.trim();
    if model.is_empty() {
        return Err(GatewayError::InvalidRequest {
            reason: "model name must not be empty".to_string(),
        });
    }
    let key = match state.keys.first_active() {
        Some(key) => Some(key),
        None => {
            state.keys.merge_from_store().await?;
            state.keys.first_active()
        }
    };
    let Some(key) = key else {
        return Ok(ProbeResult::failed("error", "no api keys available"));
    };

    let result = match send_probe(state, &key.key, model).await {
        ProbeResponse::Success => ProbeResult::ok("available"),
        ProbeResponse::ModelNotFound => {
            evict_probed_model(state, model).await;
            ProbeResult::failed("model_not_found", "model_not_found")
        }
        ProbeResponse::Denied(code) => {
            state.keys.invalidate(&key.id).await;
            ProbeResult::failed("unavailable", format!("HTTP {code}"))
        }
        ProbeResponse::Other(code) => ProbeResult::failed("unavailable", format!("HTTP {code}")),
        ProbeResponse::Failed(message) => ProbeResult::failed("error", message),
    };
    Ok(result)
}
