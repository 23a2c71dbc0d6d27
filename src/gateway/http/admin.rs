use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ApiError, error_response, extract_bearer, extract_header, map_gateway_error};
use crate::gateway::config_store::{ProxyConfig, normalize_flush_interval_ms, normalize_model_pool};
use crate::gateway::key_pool::{ApiKey, KeyStatus};
use crate::gateway::metrics::MetricsSnapshot;
use crate::gateway::model_catalog::CatalogView;
use crate::gateway::probe::{ProbeResult, test_key, test_model};
use crate::gateway::proxy_keys::ProxyAuthKey;
use crate::gateway::state::RelayState;

pub(super) fn router() -> Router<RelayState> {
    Router::new()
        .route("/api/keys", get(list_keys).post(add_key))
        .route("/api/keys/batch", post(batch_import_keys))
        .route("/api/keys/export", get(export_keys))
        .route("/api/keys/:id", axum::routing::delete(delete_key))
        .route("/api/keys/:id/export", get(export_key))
        .route("/api/keys/:id/test", post(probe_key))
        .route("/api/proxy-keys", get(list_proxy_keys).post(create_proxy_key))
        .route("/api/proxy-keys/:id", axum::routing::delete(delete_proxy_key))
        .route("/api/proxy-keys/:id/export", get(export_proxy_key))
        .route("/api/models", get(list_model_pool).put(update_model_pool))
        .route("/api/models/catalog", get(get_catalog))
        .route("/api/models/catalog/refresh", post(refresh_catalog))
        .route("/api/models/:name/test", post(probe_model))
        .route("/api/stats", get(stats))
        .route("/api/config", get(get_config).patch(patch_config))
        .route("/api/metrics", get(metrics))
}

fn ensure_admin(state: &RelayState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.settings.admin_token.as_deref() else {
        return Err(error_response(StatusCode::NOT_FOUND, "admin api not configured"));
    };
    let provided = extract_bearer(headers)
        .or_else(|| extract_header(headers, "x-admin-token"))
        .unwrap_or_default();
    if provided == expected {
        Ok(())
    } else {
        Err(error_response(StatusCode::UNAUTHORIZED, "unauthorized"))
    }
}

/// Keeps the first and last four characters of a secret.
pub(super) fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// Splits pasted key material on newlines, commas and whitespace, dropping duplicates.
pub(super) fn parse_batch_input(input: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for token in input.split(|c: char| c == ',' || c.is_whitespace()) {
        let token = token.trim();
        if token.is_empty() || keys.iter().any(|existing| existing == token) {
            continue;
        }
        keys.push(token.to_string());
    }
    keys
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiKeyView {
    id: String,
    key: String,
    status: KeyStatus,
    use_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_used: Option<u64>,
    created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    cooldown_until: Option<u64>,
}

#[derive(Debug, Serialize)]
struct KeyList {
    keys: Vec<ApiKeyView>,
}

async fn list_keys(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Json<KeyList>, ApiError> {
    ensure_admin(&state, &headers)?;
    state.keys.merge_from_store().await.map_err(map_gateway_error)?;
    let now = state.clock.now_millis();
    let keys = state
        .keys
        .list()
        .into_iter()
        .map(|key: ApiKey| ApiKeyView {
            cooldown_until: state.keys.cooldown_until(&key.id).filter(|until| *until > now),
            key: mask_key(&key.key),
            id: key.id,
            status: key.status,
            use_count: key.use_count,
            last_used: key.last_used,
            created_at: key.created_at,
        })
        .collect();
    Ok(Json(KeyList { keys }))
}

#[derive(Debug, Deserialize)]
struct AddKeyRequest {
    #[serde(default)]
    key: String,
}

async fn add_key(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Json(payload): Json<AddKeyRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    ensure_admin(&state, &headers)?;
    let record = state
        .keys
        .add_key(&payload.key)
        .await
        .map_err(map_gateway_error)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "id": record.id })),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BatchInput {
    Text { input: String },
    Keys { keys: Vec<String> },
}

async fn batch_import_keys(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Json(payload): Json<BatchInput>,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    let keys = match payload {
        BatchInput::Text { input } => parse_batch_input(&input),
        BatchInput::Keys { keys } => parse_batch_input(&keys.join("\n")),
    };
    if keys.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "input must not be empty"));
    }

    let mut added: Vec<String> = Vec::new();
    let mut failed: Vec<Value> = Vec::new();
    for key in &keys {
        match state.keys.add_key(key).await {
            Ok(_) => added.push(mask_key(key)),
            Err(err) => {
                let (_, Json(body)) = map_gateway_error(err);
                failed.push(json!({ "key": mask_key(key), "error": body.error }));
            }
        }
    }

    Ok(Json(json!({
        "summary": {
            "total": keys.len(),
            "success": added.len(),
            "failed": failed.len(),
        },
        "results": { "success": added, "failed": failed },
    })))
}

async fn export_keys(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    state.keys.merge_from_store().await.map_err(map_gateway_error)?;
    let keys: Vec<String> = state.keys.list().into_iter().map(|key| key.key).collect();
    Ok(Json(json!({ "keys": keys })))
}

async fn export_key(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    let Some(key) = state.keys.get(&id).await.map_err(map_gateway_error)? else {
        return Err(error_response(StatusCode::NOT_FOUND, format!("api key {id} not found")));
    };
    Ok(Json(json!({ "id": key.id, "key": key.key })))
}

async fn delete_key(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    state.keys.delete_key(&id).await.map_err(map_gateway_error)?;
    Ok(Json(json!({ "success": true })))
}

async fn probe_key(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ProbeResult>, ApiError> {
    ensure_admin(&state, &headers)?;
    test_key(&state, &id).await.map(Json).map_err(map_gateway_error)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProxyKeyView {
    id: String,
    key: String,
    name: String,
    use_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_used: Option<u64>,
    created_at: u64,
}

impl From<ProxyAuthKey> for ProxyKeyView {
    fn from(key: ProxyAuthKey) -> Self {
        Self {
            key: mask_key(&key.key),
            id: key.id,
            name: key.name,
            use_count: key.use_count,
            last_used: key.last_used,
            created_at: key.created_at,
        }
    }
}

async fn list_proxy_keys(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    let keys: Vec<ProxyKeyView> = state
        .proxy_keys
        .list()
        .into_iter()
        .map(ProxyKeyView::from)
        .collect();
    Ok(Json(json!({
        "keys": keys,
        "maxKeys": state.settings.pool.max_proxy_keys,
        "authEnabled": !keys.is_empty(),
    })))
}

#[derive(Debug, Default, Deserialize)]
struct CreateProxyKeyRequest {
    #[serde(default)]
    name: Option<String>,
}

async fn create_proxy_key(
    State(state): State<RelayState>,
    headers: HeaderMap,
    payload: Option<Json<CreateProxyKeyRequest>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    ensure_admin(&state, &headers)?;
    let Json(payload) = payload.unwrap_or_default();
    let created = state
        .proxy_keys
        .create(payload.name.as_deref())
        .await
        .map_err(map_gateway_error)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "id": created.id,
            "key": created.key,
            "name": created.name,
        })),
    ))
}

async fn delete_proxy_key(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    state.proxy_keys.delete(&id).await.map_err(map_gateway_error)?;
    Ok(Json(json!({ "success": true })))
}

async fn export_proxy_key(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    let Some(key) = state.proxy_keys.get(&id).await.map_err(map_gateway_error)? else {
        return Err(error_response(StatusCode::NOT_FOUND, format!("proxy key {id} not found")));
    };
    Ok(Json(json!({ "id": key.id, "key": key.key, "name": key.name })))
}

async fn list_model_pool(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    let config = state.config.get().await.map_err(map_gateway_error)?;
    Ok(Json(json!({ "models": config.model_pool })))
}

#[derive(Debug, Deserialize)]
struct UpdateModelsRequest {
    models: Value,
}

async fn update_model_pool(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Json(payload): Json<UpdateModelsRequest>,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    let Some(raw) = payload.models.as_array() else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "models must be an array of strings",
        ));
    };
    let names: Vec<&str> = raw.iter().filter_map(Value::as_str).collect();
    let models = normalize_model_pool(&names);
    if models.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "model pool must not be empty",
        ));
    }
    let next = state
        .models
        .replace_pool(&models)
        .await
        .map_err(map_gateway_error)?;
    Ok(Json(json!({ "success": true, "models": next.model_pool })))
}

fn catalog_body(state: &RelayState, view: CatalogView) -> Json<Value> {
    let mut body = json!({
        "source": view.catalog.source,
        "fetchedAt": view.catalog.fetched_at,
        "ttlMs": state.catalog.ttl_ms(),
        "stale": view.stale,
        "models": view.catalog.models,
    });
    if let Some(last_error) = view.last_error {
        body["lastError"] = Value::String(last_error);
    }
    Json(body)
}

async fn get_catalog(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    let view = state.catalog.get_fresh().await.map_err(map_gateway_error)?;
    Ok(catalog_body(&state, view))
}

async fn refresh_catalog(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    let view = state
        .catalog
        .force_refresh()
        .await
        .map_err(map_gateway_error)?;
    Ok(catalog_body(&state, view))
}

async fn probe_model(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<ProbeResult>, ApiError> {
    ensure_admin(&state, &headers)?;
    test_model(&state, &name).await.map(Json).map_err(map_gateway_error)
}

async fn stats(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    let config = state.config.get().await.map_err(map_gateway_error)?;
    let keys = state.keys.list();
    let now = state.clock.now_millis();
    let count = |status: KeyStatus| keys.iter().filter(|key| key.status == status).count();
    let cooling_down = keys
        .iter()
        .filter(|key| state.keys.cooldown_until(&key.id).is_some_and(|until| until > now))
        .count();
    let key_usage: Vec<Value> = keys
        .iter()
        .map(|key| {
            json!({
                "id": key.id,
                "maskedKey": mask_key(&key.key),
                "useCount": key.use_count,
                "status": key.status,
            })
        })
        .collect();

    Ok(Json(json!({
        "totalKeys": keys.len(),
        "activeKeys": count(KeyStatus::Active),
        "inactiveKeys": count(KeyStatus::Inactive),
        "invalidKeys": count(KeyStatus::Invalid),
        "coolingDownKeys": cooling_down,
        "totalRequests": config.total_requests.saturating_add(state.keys.pending_requests()),
        "proxyKeys": state.proxy_keys.len(),
        "modelPool": state.models.pool(),
        "keyUsage": key_usage,
    })))
}

fn config_body(state: &RelayState, config: &ProxyConfig) -> Json<Value> {
    Json(json!({
        "modelPool": config.model_pool,
        "currentModelIndex": config.current_model_index,
        "totalRequests": config.total_requests,
        "kvFlushIntervalMs": config.kv_flush_interval_ms,
        "effectiveKvFlushIntervalMs": state.flush.effective_interval_ms(),
        "kvFlushIntervalMinMs": state.settings.flush.min_interval_ms,
    }))
}

async fn get_config(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    let config = state.config.get().await.map_err(map_gateway_error)?;
    Ok(config_body(&state, &config))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchConfigRequest {
    kv_flush_interval_ms: Option<Value>,
}

async fn patch_config(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Json(payload): Json<PatchConfigRequest>,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    let Some(raw) = payload.kv_flush_interval_ms.as_ref().and_then(Value::as_f64) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "kvFlushIntervalMs must be a number",
        ));
    };
    let settings = &state.settings.flush;
    let normalized =
        normalize_flush_interval_ms(raw, settings.default_interval_ms, settings.min_interval_ms);

    let next = state
        .config
        .update(|config| {
            if config.kv_flush_interval_ms == normalized {
                return config.clone();
            }
            ProxyConfig {
                kv_flush_interval_ms: normalized,
                ..config.clone()
            }
        })
        .await
        .map_err(map_gateway_error)?;
    state.flush.apply_interval(&next);
    Ok(config_body(&state, &next))
}

async fn metrics(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Json<MetricsSnapshot>, ApiError> {
    ensure_admin(&state, &headers)?;
    Ok(Json(state.metrics.snapshot()))
}
