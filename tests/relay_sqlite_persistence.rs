#![cfg(feature = "store-sqlite")]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use ditto_relay::gateway::config::RelayConfig;
use ditto_relay::gateway::{FlushOutcome, RelayState, SqliteKvStore, http};
use tower::util::ServiceExt;

async fn open_state(path: &std::path::Path) -> RelayState {
    let store = SqliteKvStore::new(path);
    store.init().await.expect("init");
    let mut config = RelayConfig::default();
    config.admin_token = Some("adm".to_string());
    config.pool.default_models = vec!["m1".to_string(), "m2".to_string()];
    let state = RelayState::new(config, Arc::new(store)).expect("state");
    state.bootstrap().await.expect("bootstrap");
    state
}

#[tokio::test]
async fn usage_and_admin_changes_survive_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("relay.sqlite");

    let state = open_state(&db_path).await;
    let app = http::router(state.clone());
    let request = Request::builder()
        .method("POST")
        .uri("/api/keys")
        .header("authorization", "Bearer adm")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"key":"sk-persisted"}"#))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let request = Request::builder()
        .method("PUT")
        .uri("/api/models")
        .header("authorization", "Bearer adm")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"models":["m9","m1"]}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let now = state.clock.now_millis();
    state.keys.select_next(now).expect("key");
    state.keys.select_next(now).expect("key");
    state.models.select_next().expect("model");
    assert!(matches!(
        state.flush.flush_once().await,
        FlushOutcome::Flushed {
            keys: 1,
            folded_requests: 2,
            ..
        }
    ));
    drop(state);

    let restarted = open_state(&db_path).await;
    let keys = restarted.keys.list();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].key, "sk-persisted");
    assert_eq!(keys[0].use_count, 2);

    let config = restarted.config.get().await.expect("config");
    assert_eq!(config.model_pool, vec!["m9", "m1"]);
    assert_eq!(config.total_requests, 2);
    assert_eq!(config.current_model_index, 1);
    assert_eq!(restarted.models.select_next().as_deref(), Some("m1"));
}
