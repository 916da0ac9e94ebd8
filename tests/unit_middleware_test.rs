use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::from_fn_with_state;
use axum::response::Html;
use axum::routing::{get, post};
use opalcache::config::OptimizeMode;
use opalcache::core::errors::CacheError;
use opalcache::core::keygen::KeyGenerator;
use opalcache::core::middleware::cache_middleware;
use opalcache::core::pipeline::minify::MinifyTransform;
use opalcache::core::pipeline::Pipeline;
use opalcache::core::state::AppState;
use opalcache::core::stats::Stats;
use opalcache::core::storage::fs::FsStore;
use opalcache::core::storage::meta::{CacheMeta, now_unix};
use opalcache::core::storage::{BodyReader, CacheStore, read_body, reader_from_bytes};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

fn make_state(
    store: Arc<dyn CacheStore>,
    mode: OptimizeMode,
    pipeline: Option<Pipeline>,
    path_patterns: &[&str],
    max_cache_size: u64,
    enabled: bool,
) -> Arc<AppState> {
    Arc::new(AppState {
        enabled,
        store,
        varnish: None,
        keygen: KeyGenerator::default(),
        path_gate: path_patterns
            .iter()
            .map(|p| regex::Regex::new(p).unwrap())
            .collect(),
        default_ttl_secs: 3600,
        max_cache_size,
        mode,
        pipeline: pipeline.map(Arc::new),
        optimizer: None,
        stats: Stats::new(),
        events: None,
        admin_secret: String::new(),
        upstream: "http://127.0.0.1:9".into(),
        http: reqwest::Client::new(),
    })
}

fn wrap(state: Arc<AppState>, inner: Router<Arc<AppState>>) -> Router {
    inner
        .layer(from_fn_with_state(state.clone(), cache_middleware))
        .with_state(state)
}

fn request(method: &str, uri: &str) -> Request {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::HOST, "example.com")
        .body(Body::empty())
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn miss_then_hit() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsStore::open(dir.path(), 2).await.unwrap());
    let state = make_state(store, OptimizeMode::Disabled, None, &[], 1 << 20, true);
    let app = wrap(
        state.clone(),
        Router::new().route("/page", get(|| async { "hello world" })),
    );

    let first = app.clone().oneshot(request("GET", "/page")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers().get("x-cache").unwrap(), "MISS");
    assert_eq!(body_bytes(first).await, b"hello world");

    let second = app.clone().oneshot(request("GET", "/page")).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers().get("x-cache").unwrap(), "HIT");
    assert!(second.headers().contains_key(header::AGE));
    let cache_control = second
        .headers()
        .get(header::CACHE_CONTROL)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(cache_control.starts_with("public, max-age="));
    assert_eq!(body_bytes(second).await, b"hello world");

    let stats = state.stats.snapshot();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.puts, 1);
    assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn hit_replays_stored_headers() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsStore::open(dir.path(), 2).await.unwrap());
    let state = make_state(
        store.clone(),
        OptimizeMode::Disabled,
        None,
        &[],
        1 << 20,
        true,
    );

    // Seed the exact entry the request below will look up.
    let key = state
        .keygen
        .key("http", "example.com", "/path", None, &HeaderMap::new());
    let mut preserved = HashMap::new();
    preserved.insert("Last-Modified".to_string(), "Tue, 01 Jan 2030 00:00:00 GMT".to_string());
    let meta = CacheMeta {
        content_type: "text/html".into(),
        encoding: "br".into(),
        size: 0,
        etag: Some("\"abc\"".into()),
        status_code: 200,
        ttl_secs: 3600,
        cached_at: now_unix() - 123,
        headers: preserved,
    };
    store
        .put(&key, reader_from_bytes(b"compressed-bytes".to_vec()), meta)
        .await
        .unwrap();

    let app = wrap(
        state,
        Router::new().route("/path", get(|| async { "should not be called" })),
    );
    let response = app.oneshot(request("GET", "/path")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers.get("x-cache").unwrap(), "HIT");
    assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "text/html");
    assert_eq!(headers.get(header::CONTENT_ENCODING).unwrap(), "br");
    assert_eq!(headers.get(header::ETAG).unwrap(), "\"abc\"");
    assert_eq!(
        headers.get(header::LAST_MODIFIED).unwrap(),
        "Tue, 01 Jan 2030 00:00:00 GMT"
    );

    // One second may tick between seeding and serving.
    let age: u64 = headers.get(header::AGE).unwrap().to_str().unwrap().parse().unwrap();
    assert!((123..=124).contains(&age), "age was {age}");
    let cache_control = headers.get(header::CACHE_CONTROL).unwrap().to_str().unwrap();
    let max_age: u64 = cache_control
        .strip_prefix("public, max-age=")
        .unwrap()
        .parse()
        .unwrap();
    assert!((3476..=3477).contains(&max_age), "max-age was {max_age}");

    assert_eq!(body_bytes(response).await, b"compressed-bytes");
}

#[tokio::test]
async fn post_bypasses_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsStore::open(dir.path(), 2).await.unwrap());
    let state = make_state(store, OptimizeMode::Disabled, None, &[], 1 << 20, true);
    let app = wrap(
        state.clone(),
        Router::new().route("/submit", post(|| async { "created" })),
    );

    let response = app.oneshot(request("POST", "/submit")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-cache").is_none());

    let stats = state.stats.snapshot();
    assert_eq!(stats.bypasses, 1);
    assert_eq!(stats.misses, 0);
    assert_eq!(stats.puts, 0);
}

#[tokio::test]
async fn oversized_response_is_served_but_not_stored() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsStore::open(dir.path(), 2).await.unwrap());
    let state = make_state(store, OptimizeMode::Disabled, None, &[], 10_000, true);
    let app = wrap(
        state.clone(),
        Router::new().route("/big", get(|| async { vec![b'x'; 10_001] })),
    );

    let response = app.oneshot(request("GET", "/big")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await.len(), 10_001);

    let stats = state.stats.snapshot();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.puts, 0);
}

#[tokio::test]
async fn exactly_at_the_limit_is_stored() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsStore::open(dir.path(), 2).await.unwrap());
    let state = make_state(store, OptimizeMode::Disabled, None, &[], 10_000, true);
    let app = wrap(
        state.clone(),
        Router::new().route("/fits", get(|| async { vec![b'x'; 10_000] })),
    );

    let response = app.oneshot(request("GET", "/fits")).await.unwrap();
    assert_eq!(body_bytes(response).await.len(), 10_000);
    assert_eq!(state.stats.snapshot().puts, 1);
}

#[tokio::test]
async fn set_cookie_response_is_not_stored() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsStore::open(dir.path(), 2).await.unwrap());
    let state = make_state(store, OptimizeMode::Disabled, None, &[], 1 << 20, true);
    let app = wrap(
        state.clone(),
        Router::new().route(
            "/login",
            get(|| async { ([(header::SET_COOKIE, "sid=1")], "welcome") }),
        ),
    );

    let response = app.oneshot(request("GET", "/login")).await.unwrap();
    assert_eq!(response.headers().get("x-cache").unwrap(), "MISS");
    assert_eq!(body_bytes(response).await, b"welcome");

    let stats = state.stats.snapshot();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.puts, 0);
}

#[tokio::test]
async fn sync_pipeline_stores_optimized_bytes_but_serves_original() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsStore::open(dir.path(), 2).await.unwrap());
    let pipeline =
        Pipeline::new().with_stage(Box::new(MinifyTransform::new(true, false, false, false, false, false)));
    let state = make_state(
        store.clone(),
        OptimizeMode::Sync,
        Some(pipeline),
        &[],
        1 << 20,
        true,
    );

    let original = "<html>\n  <body>\n    <p>  Hi  </p>\n  </body>\n</html>";
    let app = wrap(
        state.clone(),
        Router::new().route("/page", get(move || async move { Html(original) })),
    );

    let response = app.clone().oneshot(request("GET", "/page")).await.unwrap();
    // The client sees exactly what upstream produced.
    assert_eq!(body_bytes(response).await, original.as_bytes());

    // The store holds the minified rendition.
    let key = state
        .keygen
        .key("http", "example.com", "/page", None, &HeaderMap::new());
    let (reader, meta) = store.get(&key).await.unwrap().expect("stored entry");
    let stored = read_body(reader, None).await.unwrap();
    assert!(stored.len() < original.len());
    assert!(String::from_utf8(stored.clone()).unwrap().contains("Hi"));
    assert_eq!(meta.size, stored.len() as u64);
}

#[tokio::test]
async fn path_gate_limits_caching() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsStore::open(dir.path(), 2).await.unwrap());
    let state = make_state(
        store,
        OptimizeMode::Disabled,
        None,
        &["^/static/"],
        1 << 20,
        true,
    );
    let app = wrap(
        state.clone(),
        Router::new().fallback(|| async { "content" }),
    );

    let outside = app.clone().oneshot(request("GET", "/other")).await.unwrap();
    assert_eq!(outside.status(), StatusCode::OK);
    assert_eq!(state.stats.snapshot().bypasses, 1);
    assert_eq!(state.stats.snapshot().puts, 0);

    let inside = app
        .clone()
        .oneshot(request("GET", "/static/app.css"))
        .await
        .unwrap();
    assert_eq!(inside.status(), StatusCode::OK);
    assert_eq!(state.stats.snapshot().puts, 1);
}

#[tokio::test]
async fn disabled_middleware_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsStore::open(dir.path(), 2).await.unwrap());
    let state = make_state(store, OptimizeMode::Disabled, None, &[], 1 << 20, false);
    let app = wrap(
        state.clone(),
        Router::new().route("/page", get(|| async { "hello" })),
    );

    let response = app.oneshot(request("GET", "/page")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-cache").is_none());

    let stats = state.stats.snapshot();
    assert_eq!(stats.hits + stats.misses + stats.puts + stats.bypasses, 0);
}

/// A store whose lookups always fail, for exercising the bypass-on-error path.
struct FailingStore;

#[async_trait]
impl CacheStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<(BodyReader, CacheMeta)>, CacheError> {
        Err(CacheError::InvalidState("backend down".into()))
    }
    async fn put(
        &self,
        _key: &str,
        _body: BodyReader,
        _meta: CacheMeta,
    ) -> Result<(), CacheError> {
        Err(CacheError::InvalidState("backend down".into()))
    }
    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }
    async fn purge_prefix(&self, _prefix: &str) -> Result<(), CacheError> {
        Ok(())
    }
    async fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }
    fn backend_name(&self) -> &'static str {
        "failing"
    }
}

#[tokio::test]
async fn store_failure_is_invisible_to_the_client() {
    let state = make_state(
        Arc::new(FailingStore),
        OptimizeMode::Disabled,
        None,
        &[],
        1 << 20,
        true,
    );
    let app = wrap(
        state.clone(),
        Router::new().route("/page", get(|| async { "still works" })),
    );

    let response = app.oneshot(request("GET", "/page")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"still works");
    assert_eq!(state.stats.snapshot().errors, 1);
}

#[tokio::test]
async fn head_hit_serves_headers_without_body() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsStore::open(dir.path(), 2).await.unwrap());
    let state = make_state(
        store.clone(),
        OptimizeMode::Disabled,
        None,
        &[],
        1 << 20,
        true,
    );

    let key = state
        .keygen
        .key("http", "example.com", "/doc", None, &HeaderMap::new());
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
        .put(&key, reader_from_bytes(b"cached body".to_vec()), meta)
        .await
        .unwrap();

    let app = wrap(state, Router::new().route("/doc", get(|| async { "x" })));
    let response = app.oneshot(request("HEAD", "/doc")).await.unwrap();
    assert_eq!(response.headers().get("x-cache").unwrap(), "HIT");
    assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "text/plain");
    assert!(body_bytes(response).await.is_empty());
}
