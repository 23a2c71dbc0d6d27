//! axum surface: the OpenAI-compatible proxy endpoints plus the token-gated admin API.

mod admin;
mod proxy;

use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::GatewayError;
use super::state::RelayState;

const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
const CORS_ALLOW_HEADERS: &str = "Content-Type, Authorization, X-Api-Key, X-Admin-Token";
const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Caller-facing mapping. Internal detail is logged, never returned.
fn map_gateway_error(err: GatewayError) -> ApiError {
    match err {
        GatewayError::InvalidRequest { reason } => error_response(StatusCode::BAD_REQUEST, reason),
        GatewayError::NotFound { what } => {
            error_response(StatusCode::NOT_FOUND, format!("{what} not found"))
        }
        GatewayError::Conflict { reason } => error_response(StatusCode::CONFLICT, reason),
        GatewayError::LimitReached { limit } => error_response(
            StatusCode::BAD_REQUEST,
            format!("at most {limit} proxy keys can be created"),
        ),
        GatewayError::Catalog { message } => error_response(StatusCode::BAD_GATEWAY, message),
        GatewayError::UpstreamTimeout => {
            error_response(StatusCode::GATEWAY_TIMEOUT, "upstream request timed out")
        }
        GatewayError::Upstream { message } => {
            error!(error = %message, "upstream error");
            error_response(StatusCode::BAD_GATEWAY, "upstream request failed")
        }
        other => {
            error!(error = %other, "internal error");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())?
        .trim()
        .to_string();
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
}

/// Header overlay for responses relayed from the upstream.
fn apply_passthrough_headers(headers: &mut HeaderMap) {
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::CONNECTION);
    apply_cors(headers);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));
}

async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(response.headers_mut());
        return response;
    }
    let mut response = next.run(request).await;
    apply_cors(response.headers_mut());
    response
}

async fn healthz() -> &'static str {
    "ok"
}

async fn not_found() -> ApiError {
    error_response(StatusCode::NOT_FOUND, "not found")
}

pub fn router(state: RelayState) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/models", get(proxy::list_models))
        .route("/v1/chat/completions", post(proxy::chat_completions));

    if state.settings.admin_token.is_some() {
        router = router.merge(admin::router());
    }

    router
        .fallback(not_found)
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer  sk-1 "));
        assert_eq!(extract_bearer(&headers).as_deref(), Some("sk-1"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer(&headers), None);
    }

    #[test]
    fn passthrough_overlay_replaces_framing_and_cache_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));

        apply_passthrough_headers(&mut headers);
        assert!(!headers.contains_key(header::CONTENT_LENGTH));
        assert!(!headers.contains_key(header::CONNECTION));
        assert_eq!(headers[header::CACHE_CONTROL], NO_CACHE);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
    }

    #[test]
    fn internal_errors_are_not_leaked() {
        let (status, Json(body)) = map_gateway_error(GatewayError::IncompatibleSchema {
            detail: "secret detail".to_string(),
        });
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "internal error");

        let (status, _) = map_gateway_error(GatewayError::Conflict {
            reason: "key already exists".to_string(),
        });
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
