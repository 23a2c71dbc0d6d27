use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use ditto_relay::gateway::config::RelayConfig;
use ditto_relay::gateway::{KeyStatus, MemoryStore, RelayState, http};
use ditto_relay::utils::test_support::{ManualClock, should_skip_httpmock};
use httpmock::Method::POST;
use httpmock::MockServer;
use serde_json::{Value, json};
use tower::util::ServiceExt;

fn relay_config(upstream: &MockServer) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.upstream.base_url = upstream.base_url();
    config.pool.default_models = vec!["m1".to_string(), "m2".to_string(), "m3".to_string()];
    config
}

async fn relay_state(config: RelayConfig, clock: Arc<ManualClock>) -> RelayState {
    let state = RelayState::with_clock(config, Arc::new(MemoryStore::new()), clock).expect("state");
    state.bootstrap().await.expect("bootstrap");
    state
}

fn chat_request(token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder
        .body(Body::from(serde_json::to_vec(&body).expect("json")))
        .unwrap()
}

fn hello() -> Value {
    json!({"model": "auto", "messages": [{"role": "user", "content": "hi"}]})
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn requests_rotate_keys_and_rewrite_the_model() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let key_a = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .header("authorization", "Bearer sk-a")
            .body_includes(r#""model":"m1""#);
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"id":"a"}"#);
    });
    let key_b = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .header("authorization", "Bearer sk-b")
            .body_includes(r#""model":"m2""#);
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"id":"b"}"#);
    });

    let clock = Arc::new(ManualClock::new(1_000));
    let state = relay_state(relay_config(&upstream), clock).await;
    state.keys.add_key("sk-a").await.expect("add a");
    state.keys.add_key("sk-b").await.expect("add b");
    let app = http::router(state.clone());

    let response = app.clone().oneshot(chat_request(None, hello())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["cache-control"], "no-cache, no-store, must-revalidate");
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert_eq!(body_json(response).await, json!({"id": "a"}));

    let response = app.oneshot(chat_request(None, hello())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"id": "b"}));

    key_a.assert_calls(1);
    key_b.assert_calls(1);
    assert_eq!(state.keys.pending_requests(), 2);
    assert_eq!(state.metrics.snapshot().proxy_requests.success, 2);
    assert_eq!(state.metrics.snapshot().upstream_responses.success, 2);
}

#[tokio::test]
async fn empty_pool_is_a_server_error() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let state = relay_state(relay_config(&upstream), Arc::new(ManualClock::new(1_000))).await;
    let app = http::router(state.clone());

    let response = app.oneshot(chat_request(None, hello())).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(response).await["error"], "no api keys configured");
    assert_eq!(state.metrics.snapshot().proxy_requests.no_key, 1);
}

#[tokio::test]
async fn empty_model_pool_is_unavailable() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mut config = relay_config(&upstream);
    config.pool.default_models = Vec::new();
    let state = relay_state(config, Arc::new(ManualClock::new(1_000))).await;
    state.keys.add_key("sk-a").await.expect("add");
    let app = http::router(state);

    let response = app.oneshot(chat_request(None, hello())).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["error"], "no model available");
}

#[tokio::test]
async fn rate_limited_key_cools_down_with_retry_after() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let limited = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(429)
            .header("retry-after", "30")
            .header("content-type", "application/json")
            .body(r#"{"error":"slow down"}"#);
    });

    let clock = Arc::new(ManualClock::new(1_000));
    let state = relay_state(relay_config(&upstream), clock.clone()).await;
    let key = state.keys.add_key("sk-a").await.expect("add");
    let app = http::router(state.clone());

    let response = app.clone().oneshot(chat_request(None, hello())).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_json(response).await, json!({"error": "slow down"}));
    assert_eq!(state.keys.cooldown_until(&key.id), Some(31_000));

    clock.advance(10_500);
    let response = app.clone().oneshot(chat_request(None, hello())).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "20");
    assert_eq!(body_json(response).await["error"], "all api keys are cooling down");
    limited.assert_calls(1);

    clock.advance(20_000);
    let _ = app.oneshot(chat_request(None, hello())).await.unwrap();
    limited.assert_calls(2);
    assert_eq!(state.metrics.snapshot().proxy_requests.no_key_cooldown, 1);
}

#[tokio::test]
async fn unauthorized_key_is_invalidated_immediately() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let denied = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .header("authorization", "Bearer sk-bad");
        then.status(401).body(r#"{"error":"bad key"}"#);
    });
    let accepted = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .header("authorization", "Bearer sk-good");
        then.status(200).body(r#"{"id":"ok"}"#);
    });

    let state = relay_state(relay_config(&upstream), Arc::new(ManualClock::new(1_000))).await;
    let bad = state.keys.add_key("sk-bad").await.expect("add bad");
    state.keys.add_key("sk-good").await.expect("add good");
    let app = http::router(state.clone());

    let response = app.clone().oneshot(chat_request(None, hello())).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let stored = state.keys.get(&bad.id).await.expect("get").expect("record");
    assert_eq!(stored.status, KeyStatus::Invalid);

    for _ in 0..2 {
        let response = app.clone().oneshot(chat_request(None, hello())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    denied.assert_calls(1);
    accepted.assert_calls(2);
}

#[tokio::test]
async fn model_not_found_evicts_and_retries_next_model() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let missing = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .body_includes(r#""model":"m1""#);
        then.status(404)
            .header("content-type", "application/json")
            .body(r#"{"error":{"code":"model_not_found","message":"no such model"}}"#);
    });
    let served = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .body_includes(r#""model":"m2""#);
        then.status(200).body(r#"{"id":"m2"}"#);
    });

    let state = relay_state(relay_config(&upstream), Arc::new(ManualClock::new(1_000))).await;
    state.keys.add_key("sk-a").await.expect("add");
    let app = http::router(state.clone());

    let response = app.oneshot(chat_request(None, hello())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"id": "m2"}));
    missing.assert_calls(1);
    served.assert_calls(1);

    assert_eq!(state.models.pool(), vec!["m2", "m3"]);
    let config = state.config.get().await.expect("config");
    assert_eq!(config.model_pool, vec!["m2", "m3"]);
    assert_eq!(state.metrics.snapshot().upstream_responses.model_not_found, 1);
}

#[tokio::test]
async fn exhausted_model_retries_return_the_last_not_found() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let missing = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(404)
            .header("content-type", "application/json")
            .body(r#"{"error":"Model not found"}"#);
    });

    let mut config = relay_config(&upstream);
    config.pool.max_model_retries = 2;
    let state = relay_state(config, Arc::new(ManualClock::new(1_000))).await;
    state.keys.add_key("sk-a").await.expect("add");
    let app = http::router(state.clone());

    let response = app.oneshot(chat_request(None, hello())).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await, json!({"error": "Model not found"}));
    missing.assert_calls(2);
    assert_eq!(state.models.pool(), vec!["m3"]);
    let proxy_requests = state.metrics.snapshot().proxy_requests;
    assert_eq!(proxy_requests.no_model, 1);
    assert_eq!(proxy_requests.success, 0);
}

#[tokio::test]
async fn sole_missing_model_is_evicted_once_and_its_404_returned() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let missing = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(404)
            .header("content-type", "application/json")
            .body(r#"{"error":{"code":"model_not_found","message":"model X is gone"}}"#);
    });

    let mut config = relay_config(&upstream);
    config.pool.default_models = vec!["X".to_string()];
    config.pool.max_model_retries = 3;
    let state = relay_state(config, Arc::new(ManualClock::new(1_000))).await;
    state.keys.add_key("sk-a").await.expect("add");
    let app = http::router(state.clone());

    let response = app.oneshot(chat_request(None, hello())).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        body_json(response).await,
        json!({"error": {"code": "model_not_found", "message": "model X is gone"}})
    );
    missing.assert_calls(1);

    assert!(state.models.pool().is_empty());
    let config = state.config.get().await.expect("config");
    assert!(config.model_pool.is_empty());
    let metrics = state.metrics.snapshot();
    assert_eq!(metrics.upstream_responses.model_not_found, 1);
    assert_eq!(metrics.proxy_requests.no_model, 1);
}

#[tokio::test]
async fn other_not_found_is_passed_through_without_eviction() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let missing = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(404).body(r#"{"error":"route missing"}"#);
    });

    let state = relay_state(relay_config(&upstream), Arc::new(ManualClock::new(1_000))).await;
    state.keys.add_key("sk-a").await.expect("add");
    let app = http::router(state.clone());

    let response = app.oneshot(chat_request(None, hello())).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await, json!({"error": "route missing"}));
    missing.assert_calls(1);
    assert_eq!(state.models.pool().len(), 3);
}

#[tokio::test]
async fn slow_upstream_times_out() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .delay(Duration::from_millis(1_500))
            .body(r#"{"id":"late"}"#);
    });

    let mut config = relay_config(&upstream);
    config.upstream.request_timeout_ms = 100;
    let state = relay_state(config, Arc::new(ManualClock::new(1_000))).await;
    state.keys.add_key("sk-a").await.expect("add");
    let app = http::router(state.clone());

    let response = app.oneshot(chat_request(None, hello())).await.unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body_json(response).await["error"], "upstream request timed out");
    assert_eq!(state.metrics.snapshot().proxy_requests.timeout, 1);
}

#[tokio::test]
async fn proxy_keys_gate_requests_once_created() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let ok = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).body(r#"{"id":"ok"}"#);
    });

    let state = relay_state(relay_config(&upstream), Arc::new(ManualClock::new(1_000))).await;
    state.keys.add_key("sk-a").await.expect("add");
    let proxy_key = state.proxy_keys.create(Some("ci")).await.expect("proxy key");
    let app = http::router(state.clone());

    let response = app.clone().oneshot(chat_request(None, hello())).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let response = app
        .clone()
        .oneshot(chat_request(Some("sk-relay-wrong"), hello()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("x-api-key", proxy_key.key.as_str())
        .body(Body::from(serde_json::to_vec(&hello()).expect("json")))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    ok.assert_calls(1);

    let listed = state.proxy_keys.list();
    assert_eq!(listed[0].use_count, 1);
    assert!(state.proxy_keys.is_dirty());
}

#[tokio::test]
async fn malformed_requests_are_rejected_before_key_selection() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let state = relay_state(relay_config(&upstream), Arc::new(ManualClock::new(1_000))).await;
    state.keys.add_key("sk-a").await.expect("add");
    let app = http::router(state.clone());

    let response = app
        .clone()
        .oneshot(chat_request(None, json!({"model": "auto", "messages": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "request body must be valid json");
    assert_eq!(state.keys.pending_requests(), 0);
}

#[tokio::test]
async fn models_endpoint_and_cors_preflight() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let state = relay_state(relay_config(&upstream), Arc::new(ManualClock::new(5_000))).await;
    let app = http::router(state);

    let request = Request::builder().uri("/v1/models").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["id"], "auto");
    assert_eq!(body["data"][0]["created"], 5);

    let request = Request::builder()
        .method("OPTIONS")
        .uri("/v1/chat/completions")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(response.headers().contains_key("access-control-allow-methods"));

    let request = Request::builder().uri("/nope").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
