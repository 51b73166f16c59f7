//! Gate behavior backed by Redis.
//!
//! Ignored tests need a live server at `REDIS_ADDR`; they flush the selected
//! database and sleep on the wall clock. Run with `cargo test -- --ignored`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use tollgate::config::TollgateConfig;
use tollgate::http::{router, AdmissionState, API_KEY_HEADER, REJECTION_BODY};
use tollgate::ratelimit::{RateDecisionEngine, RedisStore};

async fn app_with(ip_limit: u64, token_limit: u64, block_secs: u64) -> Router {
    let mut config = TollgateConfig::default();
    config.apply_env();
    config.rate_limiting.ip_limit = ip_limit;
    config.rate_limiting.token_limit = token_limit;
    config.rate_limiting.block_duration_secs = block_secs;

    let store = RedisStore::connect(&config.store.addr, config.store.password.as_deref())
        .await
        .unwrap();
    store.flush().await.unwrap();

    let engine = RateDecisionEngine::new(Arc::new(store));
    router(AdmissionState::new(config.rate_limiting.resolver(), engine))
}

async fn status(app: &Router, token: Option<&str>, peer: &str) -> StatusCode {
    let mut builder = Request::get("/");
    if let Some(token) = token {
        builder = builder.header(API_KEY_HEADER, token);
    }
    let mut request = builder.body(Body::empty()).unwrap();
    let addr: SocketAddr = peer.parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));

    app.clone().oneshot(request).await.unwrap().status()
}

#[tokio::test]
async fn test_unreachable_redis_rejects_requests() {
    let config = TollgateConfig::default();
    // Nothing listens on port 1.
    let store = RedisStore::new("127.0.0.1:1", None).unwrap();
    let engine = RateDecisionEngine::new(Arc::new(store));
    let app = router(AdmissionState::new(config.rate_limiting.resolver(), engine));

    let mut request = Request::get("/").body(Body::empty()).unwrap();
    let addr: SocketAddr = "10.0.0.1:1234".parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], REJECTION_BODY.as_bytes());

    // The ungated health check stays up while the store is down.
    let health = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
}

// One test function: every scenario flushes the shared database first.
#[tokio::test]
#[ignore]
async fn test_gate_against_redis() {
    token_blocking_duration().await;
    ip_only_limit().await;
}

async fn token_blocking_duration() {
    let app = app_with(1000, 3, 2).await;
    let token = Some("token-block-test");

    for _ in 0..3 {
        assert_eq!(status(&app, token, "10.0.0.1:1234").await, StatusCode::OK);
    }
    assert_eq!(
        status(&app, token, "10.0.0.1:1234").await,
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(
        status(&app, token, "10.0.0.1:1234").await,
        StatusCode::TOO_MANY_REQUESTS
    );

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(status(&app, token, "10.0.0.1:1234").await, StatusCode::OK);
}

async fn ip_only_limit() {
    let app = app_with(3, 10, 3).await;

    for _ in 0..3 {
        assert_eq!(status(&app, None, "127.0.0.1:1111").await, StatusCode::OK);
    }
    for _ in 0..2 {
        assert_eq!(
            status(&app, None, "127.0.0.1:1111").await,
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
