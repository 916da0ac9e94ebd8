use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{StatusCode, header};
use opalcache::config::OptimizeMode;
use opalcache::core::keygen::KeyGenerator;
use opalcache::core::state::AppState;
use opalcache::core::stats::Stats;
use opalcache::core::storage::fs::FsStore;
use opalcache::core::storage::meta::{CacheMeta, now_unix};
use opalcache::core::storage::{CacheStore, reader_from_bytes};
use opalcache::server::admin;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

const SECRET: &str = "s3cret";

async fn make_app(dir: &tempfile::TempDir) -> (Router, Arc<FsStore>, Arc<AppState>) {
    let store = Arc::new(FsStore::open(dir.path(), 2).await.unwrap());
    let state = Arc::new(AppState {
        enabled: true,
        store: store.clone(),
        varnish: None,
        keygen: KeyGenerator::default(),
        path_gate: vec![],
        default_ttl_secs: 3600,
        max_cache_size: 10 * 1024 * 1024,
        mode: OptimizeMode::Disabled,
        pipeline: None,
        optimizer: None,
        stats: Stats::new(),
        events: None,
        admin_secret: SECRET.into(),
        upstream: "http://127.0.0.1:9".into(),
        http: reqwest::Client::new(),
    });
    (admin::router().with_state(state.clone()), store, state)
}

async fn seed(store: &FsStore, key: &str) {
    let meta = CacheMeta {
        content_type: "text/plain".into(),
        encoding: String::new(),
        size: 0,
        etag: None,
        status_code: 200,
        ttl_secs: 3600,
        cached_at: now_unix(),
        headers: HashMap::new(),
    };
    store
        .put(key, reader_from_bytes(b"body".to_vec()), meta)
        .await
        .unwrap();
}

fn post(uri: &str, body: &str) -> Request {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_with_bearer(uri: &str, secret: &str, body: &str) -> Request {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {secret}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn requests_without_the_secret_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _, _) = make_app(&dir).await;

    let response = app
        .clone()
        .oneshot(post("/_cache/purge", r#"{"key": "ab"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .oneshot(post_with_bearer("/_cache/purge", "wrong", r#"{"key": "ab"}"#))
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn purge_deletes_the_entry() {
    let dir = tempfile::tempdir().unwrap();
    let (app, store, _) = make_app(&dir).await;
    let key = "ab".repeat(32);
    seed(&store, &key).await;

    let response = app
        .oneshot(post_with_bearer(
            "/_cache/purge",
            SECRET,
            &format!(r#"{{"key": "{key}"}}"#),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(store.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn query_secret_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let (app, store, _) = make_app(&dir).await;
    let key = "cd".repeat(32);
    seed(&store, &key).await;

    let response = app
        .oneshot(post(
            &format!("/_cache/purge?secret={SECRET}"),
            &format!(r#"{{"key": "{key}"}}"#),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn malformed_bodies_are_bad_requests() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _, _) = make_app(&dir).await;

    for body in ["not json", "{}", r#"{"wrong": 1}"#] {
        let response = app
            .clone()
            .oneshot(post_with_bearer("/_cache/purge", SECRET, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {body:?}");
    }
}

#[tokio::test]
async fn purge_with_invalid_key_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _, _) = make_app(&dir).await;

    let response = app
        .oneshot(post_with_bearer(
            "/_cache/purge",
            SECRET,
            r#"{"key": "../not-a-key"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn purge_prefix_removes_matching_entries() {
    let dir = tempfile::tempdir().unwrap();
    let (app, store, _) = make_app(&dir).await;
    let victim = format!("1234beef{}", "0".repeat(56));
    let survivor = "77".repeat(32);
    seed(&store, &victim).await;
    seed(&store, &survivor).await;

    let response = app
        .oneshot(post_with_bearer(
            "/_cache/purge-prefix",
            SECRET,
            r#"{"prefix": "1234beef"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(store.get(&victim).await.unwrap().is_none());
    assert!(store.get(&survivor).await.unwrap().is_some());
}

#[tokio::test]
async fn status_reports_configuration_and_counters() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _, state) = make_app(&dir).await;
    state.stats.record_hit();
    state.stats.record_miss();
    state.stats.record_miss();

    let request = Request::builder()
        .method("GET")
        .uri(format!("/_cache/status?secret={SECRET}"))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["enabled"], true);
    assert_eq!(body["backend"], "fs");
    assert_eq!(body["mode"], "disabled");
    assert_eq!(body["ttl_secs"], 3600);
    assert_eq!(body["stats"]["hits"], 1);
    assert_eq!(body["stats"]["misses"], 2);
    let rate = body["stats"]["hit_rate"].as_f64().unwrap();
    assert!((rate - 1.0 / 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn ban_requires_the_varnish_backend() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _, _) = make_app(&dir).await;

    let response = app
        .oneshot(post_with_bearer(
            "/_cache/ban",
            SECRET,
            r#"{"expression": "req.url ~ /x"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn wrong_methods_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _, _) = make_app(&dir).await;

    let get_purge = Request::builder()
        .method("GET")
        .uri(format!("/_cache/purge?secret={SECRET}"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(get_purge).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let post_status = post_with_bearer("/_cache/status", SECRET, "");
    let response = app.oneshot(post_status).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}
