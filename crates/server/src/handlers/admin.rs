//! Admin control panel: session login and the read-only upload listing,
//! plus forced termination.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Response};
use axum::{Json, middleware, routing::get, routing::post};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::Cookie;
use dashmap::DashMap;
use depot_core::hash::ContentHash;
use depot_metadata::UploadSummary;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;

const SESSION_COOKIE: &str = "depot_session";

/// Admin sessions expire after this long even without a logout.
const SESSION_TTL_SECS: i64 = 12 * 3600;

/// Admin session store.
///
/// The cookie value is a short HS256 token signed with the configured
/// `admin.session_secret`; rotating that secret invalidates every admin
/// session and touches nothing else — in-flight uploads never see this
/// key. A live-token set keyed by token id makes logout revoke
/// immediately instead of waiting for expiry.
pub struct AdminSessions {
    encoding: EncodingKey,
    decoding: DecodingKey,
    live: DashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    jti: String,
    exp: i64,
}

impl AdminSessions {
    /// Build from the configured secret. An empty secret gets a random
    /// per-process value, so admin sessions then rotate on restart.
    pub fn new(secret: &str) -> Self {
        let secret = if secret.is_empty() {
            tracing::warn!(
                "admin.session_secret not configured, using an ephemeral secret; \
                 admin sessions will not survive a restart"
            );
            random_hex()
        } else {
            secret.to_string()
        };
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            live: DashMap::new(),
        }
    }

    /// Issue a signed session token for a logged-in user.
    fn issue(&self, username: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let jti = random_hex();
        let claims = SessionClaims {
            sub: username.to_string(),
            jti: jti.clone(),
            exp: OffsetDateTime::now_utc().unix_timestamp() + SESSION_TTL_SECS,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        self.live.insert(jti, username.to_string());
        Ok(token)
    }

    /// Check signature, expiry and liveness; returns the username.
    fn verify(&self, token: &str) -> Option<String> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<SessionClaims>(token, &self.decoding, &validation).ok()?;
        if !self.live.contains_key(&data.claims.jti) {
            return None;
        }
        Some(data.claims.sub)
    }

    /// Drop a session; its token fails verification afterwards.
    fn revoke(&self, token: &str) {
        let validation = Validation::new(Algorithm::HS256);
        if let Ok(data) = decode::<SessionClaims>(token, &self.decoding, &validation) {
            self.live.remove(&data.claims.jti);
        }
    }
}

fn random_hex() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

const CONTROL_PAGE: &str = "<!doctype html>\n<html>\n<head><title>depot admin</title></head>\n\
<body><h1>depot admin</h1>\
<p>JSON endpoints: POST /admin/login, GET /admin/get, POST /admin/del, GET /admin/logout</p>\
</body>\n</html>\n";

/// Routes under `/admin`. Everything except the page and login requires
/// a live session.
pub fn router(state: AppState) -> axum::Router<AppState> {
    let protected = axum::Router::new()
        .route("/get", get(list_uploads))
        .route("/del", post(terminate_uploads))
        .route("/logout", get(logout))
        .route_layer(middleware::from_fn_with_state(state, auth_middleware));

    axum::Router::new()
        .route("/", get(control_page))
        .route("/login", post(login))
        .merge(protected)
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    jar: CookieJar,
    req: Request,
    next: Next,
) -> Response {
    let authed = jar
        .get(SESSION_COOKIE)
        .and_then(|cookie| state.admin_sessions.verify(cookie.value()))
        .is_some();
    if !authed {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        )
            .into_response();
    }
    next.run(req).await
}

pub async fn control_page() -> Html<&'static str> {
    Html(CONTROL_PAGE)
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<LoginRequest>,
) -> ApiResult<(CookieJar, StatusCode)> {
    let given = ContentHash::compute(body.password.as_bytes()).to_hex();
    let ok = state
        .config
        .admin
        .users
        .get(&body.username)
        .is_some_and(|expected| expected.eq_ignore_ascii_case(&given));
    if !ok {
        return Err(ApiError::Unauthorized("authentication failed".to_string()));
    }

    let token = state
        .admin_sessions
        .issue(&body.username)
        .map_err(|e| ApiError::Internal(format!("failed to issue session token: {e}")))?;

    let cookie = Cookie::build((SESSION_COOKIE, token))
        .path("/admin")
        .http_only(true)
        .build();
    Ok((jar.add(cookie), StatusCode::OK))
}

pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Response) {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.admin_sessions.revoke(cookie.value());
    }
    let jar = jar.remove(Cookie::build(SESSION_COOKIE).path("/admin").build());
    (jar, Json(json!({"message": "logged out"})).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    filter: String,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_per_page")]
    per_page: u32,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    50
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    uploads: Vec<UploadSummary>,
    pages: i64,
}

pub async fn list_uploads(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<ListResponse>> {
    let page = query.page.max(1);
    let per_page = query.per_page.clamp(1, 500);

    let uploads = state
        .metadata
        .list_uploads(&query.filter, page, per_page)
        .await?;
    let total = state.metadata.count_uploads(&query.filter).await?;

    Ok(Json(ListResponse {
        uploads,
        pages: total / i64::from(per_page),
    }))
}

#[derive(Debug, Deserialize)]
pub struct TerminateRequest {
    #[serde(default)]
    terminate: Vec<String>,
}

pub async fn terminate_uploads(
    State(state): State<AppState>,
    Json(body): Json<TerminateRequest>,
) -> Response {
    let mut failed = Vec::new();
    for id in &body.terminate {
        if let Err(e) = state.store.terminate_id(id).await {
            tracing::error!(%id, error = %e, "admin terminate failed");
            failed.push(id.clone());
        }
    }

    if failed.is_empty() {
        StatusCode::OK.into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": format!("failed to terminate ids: {}", failed.join(", "))
            })),
        )
            .into_response()
    }
}
