use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{Value, json};
use tracing::Instrument;

use super::{
    ErrorResponse, apply_passthrough_headers, error_response, extract_bearer, extract_header,
};
use crate::gateway::forward::{ForwardOutcome, ForwardRejection, forward_chat_completion};
use crate::gateway::state::RelayState;

pub(super) async fn list_models(State(state): State<RelayState>) -> Json<Value> {
    let created = state.clock.now_millis() / 1_000;
    Json(json!({
        "object": "list",
        "data": [{
            "id": state.settings.external_model_id,
            "object": "model",
            "created": created,
            "owned_by": "ditto-relay",
        }],
    }))
}

fn proxy_token(headers: &HeaderMap) -> Option<String> {
    extract_bearer(headers).or_else(|| extract_header(headers, "x-api-key"))
}

fn rejection_response(rejection: ForwardRejection) -> Response {
    let mut response = (
        rejection.status,
        Json(ErrorResponse {
            error: rejection.message,
        }),
    )
        .into_response();
    if let Some(secs) = rejection.retry_after_secs {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

fn relay_response(status: StatusCode, mut headers: HeaderMap, body: Body) -> Response {
    apply_passthrough_headers(&mut headers);
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn into_response(outcome: ForwardOutcome) -> Response {
    match outcome {
        ForwardOutcome::Upstream(upstream) => {
            let status = upstream.status();
            let headers = upstream.headers().clone();
            relay_response(status, headers, Body::from_stream(upstream.bytes_stream()))
        }
        ForwardOutcome::Buffered(buffered) => {
            relay_response(buffered.status, buffered.headers, Body::from(buffered.body))
        }
        ForwardOutcome::Rejected(rejection) => rejection_response(rejection),
    }
}

pub(super) async fn chat_completions(
    State(state): State<RelayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let span = tracing::info_span!(
        "ditto.relay.proxy",
        proxy_key_id = tracing::field::Empty,
        status = tracing::field::Empty,
    );
    async move {
        let auth = state.proxy_keys.authorize(proxy_token(&headers).as_deref());
        if !auth.authorized {
            return error_response(StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
        if let Some(key_id) = auth.key_id.as_deref() {
            tracing::Span::current().record("proxy_key_id", key_id);
            state.proxy_keys.record_usage(key_id);
        }

        let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
            return error_response(StatusCode::BAD_REQUEST, "request body must be valid json")
                .into_response();
        };

        let response = into_response(forward_chat_completion(&state, payload).await);
        tracing::Span::current().record("status", response.status().as_u16());
        response
    }
    .instrument(span)
    .await
}
