//! Shared fixtures for server integration tests.
//!
//! Each test binary compiles this module separately, so not every helper
//! is used everywhere.
#![allow(dead_code)]

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::ConnectInfo;
use axum::http::{Method, Request, Response};
use depot_core::config::{AppConfig, DatabaseConfig};
use depot_server::{AppState, EventBus, create_router, expirer_router};
use depot_storage::ShardedStore;
use http_body_util::BodyExt;
use std::net::SocketAddr;
use tempfile::TempDir;
use tower::ServiceExt;

/// Default client address for test requests.
pub const CLIENT_ADDR: &str = "198.51.100.10:40000";

pub struct TestApp {
    pub temp: TempDir,
    pub state: AppState,
    pub router: Router,
    pub gc_router: Router,
}

pub async fn test_app() -> TestApp {
    test_app_with(|_| {}).await
}

pub async fn test_app_with(mutate: impl FnOnce(&mut AppConfig)) -> TestApp {
    depot_server::metrics::register_metrics();

    let temp = TempDir::new().unwrap();
    let mut config = AppConfig::for_testing();
    config.storage.base_path = temp.path().join("data");
    config.database = DatabaseConfig::Sqlite {
        dsn: temp
            .path()
            .join("metadata.db")
            .to_string_lossy()
            .into_owned(),
    };
    mutate(&mut config);

    let metadata = depot_metadata::from_config(&config.database, &config.expiration)
        .await
        .unwrap();
    let store = ShardedStore::new(&config.storage, &config.expiration, metadata.clone());
    let events = EventBus::new();
    let state = AppState::new(config, store, metadata, events);

    TestApp {
        temp,
        router: create_router(state.clone()),
        gc_router: expirer_router(state.clone()),
        state,
    }
}

impl TestApp {
    /// Dispatch a request through the public router.
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        match self.router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

/// Build a request annotated with a socket address, as the real server
/// does via `into_make_service_with_connect_info`.
pub fn request(
    method: Method,
    uri: &str,
    addr: &str,
    headers: &[(&str, &str)],
    body: Body,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Tus-Resumable", "1.0.0");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let mut request = builder.body(body).unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(addr.parse::<SocketAddr>().unwrap()));
    request
}

/// Create an upload and return its id (from the Location header).
pub async fn create_upload(
    app: &TestApp,
    addr: &str,
    headers: &[(&str, &str)],
) -> String {
    let response = app
        .send(request(Method::POST, "/files", addr, headers, Body::empty()))
        .await;
    assert_eq!(response.status(), 201, "create failed");
    location_id(&response)
}

pub fn location_id(response: &Response<Body>) -> String {
    let location = response
        .headers()
        .get("location")
        .and_then(|v| v.to_str().ok())
        .expect("missing Location header");
    location.rsplit('/').next().unwrap().to_string()
}

/// PATCH a chunk at `offset`.
pub async fn patch_upload(
    app: &TestApp,
    id: &str,
    offset: i64,
    data: &'static [u8],
) -> Response<Body> {
    app.send(request(
        Method::PATCH,
        &format!("/files/{id}"),
        CLIENT_ADDR,
        &[
            ("Content-Type", "application/offset+octet-stream"),
            ("Content-Length", &data.len().to_string()),
            ("Upload-Offset", &offset.to_string()),
        ],
        Body::from(data),
    ))
    .await
}

pub async fn head_upload(app: &TestApp, id: &str) -> Response<Body> {
    app.send(request(
        Method::HEAD,
        &format!("/files/{id}"),
        CLIENT_ADDR,
        &[],
        Body::empty(),
    ))
    .await
}

pub fn header<'a>(response: &'a Response<Body>, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

/// Sign an HS256 token the identity middleware will accept.
pub fn sign_token(secret: &str, issuer: &str, nick: &str, account: &str) -> String {
    #[derive(serde::Serialize)]
    struct Claims<'a> {
        iss: &'a str,
        sub: &'a str,
        account: &'a str,
        exp: i64,
    }
    let claims = Claims {
        iss: issuer,
        sub: nick,
        account,
        exp: time::OffsetDateTime::now_utc().unix_timestamp() + 3600,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}
