use axum::http::{HeaderMap, StatusCode, header};
use bytes::Bytes;
use serde_json::Value;
use tracing::{error, warn};

use super::GatewayError;
use super::key_pool::SelectedKey;
use super::metrics::{ProxyOutcome, UpstreamOutcome};
use super::state::RelayState;
use super::upstream::is_model_not_found_body;

/// Result of one pass through the forwarding pipeline.
pub enum ForwardOutcome {
    /// Upstream response whose body has not been read yet.
    Upstream(reqwest::Response),
    /// Upstream response whose body was consumed while classifying it.
    Buffered(BufferedResponse),
    /// The relay answered on its own.
    Rejected(ForwardRejection),
}

impl std::fmt::Debug for ForwardOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upstream(response) => f
                .debug_tuple("Upstream")
                .field(&response.status())
                .finish(),
            Self::Buffered(buffered) => f.debug_tuple("Buffered").field(buffered).finish(),
            Self::Rejected(rejection) => f.debug_tuple("Rejected").field(rejection).finish(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BufferedResponse {
    /// Drops framing headers that no longer describe the buffered body.
    fn without_framing(mut self) -> Self {
        self.headers.remove(header::CONTENT_ENCODING);
        self.headers.remove(header::CONTENT_LENGTH);
        self.headers.remove(header::TRANSFER_ENCODING);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardRejection {
    pub status: StatusCode,
    pub message: String,
    pub retry_after_secs: Option<u64>,
}

impl ForwardRejection {
    fn new(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            message: message.to_string(),
            retry_after_secs: None,
        }
    }
}

/// Accepts only a JSON object carrying a non-empty `messages` array.
pub fn validate_chat_request(body: &Value) -> Result<(), ForwardRejection> {
    let has_messages = body
        .as_object()
        .and_then(|object| object.get("messages"))
        .and_then(Value::as_array)
        .is_some_and(|messages| !messages.is_empty());
    if has_messages {
        Ok(())
    } else {
        Err(ForwardRejection::new(
            StatusCode::BAD_REQUEST,
            "request body must contain a non-empty messages array",
        ))
    }
}

async fn select_key(state: &RelayState) -> Result<SelectedKey, ForwardRejection> {
    if let Some(selected) = state.keys.select_next(state.clock.now_millis()) {
        return Ok(selected);
    }

    // Keys added by an admin since the cold load only show up after a merge.
    if let Err(err) = state.keys.merge_from_store().await {
        warn!(error = %err, "api key merge failed");
    }
    let now = state.clock.now_millis();
    if let Some(selected) = state.keys.select_next(now) {
        return Ok(selected);
    }

    if state.keys.has_active_keys() {
        state.metrics.record_proxy(ProxyOutcome::NoKeyCooldown);
        let retry_after_secs = state
            .keys
            .min_cooldown_until(now)
            .map(|until| (until - now).div_ceil(1_000))
            .filter(|secs| *secs > 0);
        return Err(ForwardRejection {
            retry_after_secs,
            ..ForwardRejection::new(StatusCode::TOO_MANY_REQUESTS, "all api keys are cooling down")
        });
    }

    state.metrics.record_proxy(ProxyOutcome::NoKey);
    Err(ForwardRejection::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "no api keys configured",
    ))
}

/// Runs one chat completion through key selection, model rotation and the upstream call.
///
/// Only "model not found" 404s are retried, each time with the next pool model. Everything
/// else the upstream says is passed through after its side effects on the key pool.
pub async fn forward_chat_completion(state: &RelayState, mut body: Value) -> ForwardOutcome {
    if let Err(rejection) = validate_chat_request(&body) {
        return ForwardOutcome::Rejected(rejection);
    }

    let selected = match select_key(state).await {
        Ok(selected) => selected,
        Err(rejection) => return ForwardOutcome::Rejected(rejection),
    };

    let timeout = state.upstream.request_timeout();
    let mut last_model_not_found: Option<BufferedResponse> = None;

    for _attempt in 0..state.settings.pool.max_model_retries {
        let Some(model) = state.models.select_next() else {
            if last_model_not_found.is_some() {
                break;
            }
            state.metrics.record_proxy(ProxyOutcome::NoModel);
            return ForwardOutcome::Rejected(ForwardRejection::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "no model available",
            ));
        };
        if let Some(object) = body.as_object_mut() {
            object.insert("model".to_string(), Value::String(model.clone()));
        }

        let response = match state
            .upstream
            .send_chat_completion(&selected.key, &body, timeout)
            .await
        {
            Ok(response) => response,
            Err(GatewayError::UpstreamTimeout) => {
                state.metrics.record_upstream(UpstreamOutcome::Timeout);
                state.metrics.record_proxy(ProxyOutcome::Timeout);
                warn!(key_id = %selected.id, model = %model, "upstream request timed out");
                return ForwardOutcome::Rejected(ForwardRejection::new(
                    StatusCode::GATEWAY_TIMEOUT,
                    "upstream request timed out",
                ));
            }
            Err(err) => {
                state.metrics.record_upstream(UpstreamOutcome::NetworkError);
                state.metrics.record_proxy(ProxyOutcome::UpstreamError);
                error!(key_id = %selected.id, model = %model, error = %err, "upstream fetch error");
                return ForwardOutcome::Rejected(ForwardRejection::new(
                    StatusCode::BAD_GATEWAY,
                    "upstream request failed",
                ));
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            let headers = response.headers().clone();
            let body = response.bytes().await.unwrap_or_default();
            let buffered = BufferedResponse {
                status,
                headers,
                body,
            };

            if is_model_not_found_body(&buffered.body) {
                state.metrics.record_upstream(UpstreamOutcome::ModelNotFound);
                last_model_not_found = Some(buffered);
                if let Err(err) = state.models.evict(&model, "model_not_found").await {
                    error!(model = %model, error = %err, "model eviction failed");
                }
                continue;
            }

            state.metrics.record_upstream(UpstreamOutcome::Other);
            state.metrics.record_proxy(ProxyOutcome::Success);
            return ForwardOutcome::Buffered(buffered.without_framing());
        }

        match status.as_u16() {
            429 => {
                let retry_after = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok());
                state
                    .keys
                    .set_cooldown(&selected.id, retry_after, state.clock.now_millis());
            }
            401 | 403 => state.keys.invalidate(&selected.id).await,
            _ => {}
        }

        state
            .metrics
            .record_upstream(UpstreamOutcome::from_status(status.as_u16()));
        state.metrics.record_proxy(ProxyOutcome::Success);
        return ForwardOutcome::Upstream(response);
    }

    if let Some(last) = last_model_not_found {
        state.metrics.record_proxy(ProxyOutcome::NoModel);
        return ForwardOutcome::Buffered(last.without_framing());
    }

    state.metrics.record_proxy(ProxyOutcome::UpstreamError);
    ForwardOutcome::Rejected(ForwardRejection::new(
        StatusCode::BAD_GATEWAY,
        "model unavailable",
    ))
}
