//! Identity annotation middleware.
//!
//! POST and DELETE requests need the caller's identity. Inbound
//! `K-Remote-IP` and `K-Jwt-*` headers are stripped so clients cannot
//! forge them, then repopulated: the remote IP from the socket address
//! (honouring `X-Forwarded-For` only from trusted reverse proxies), and
//! the claims from a verified `Authorization` token. Token failures are
//! non-fatal; the request simply proceeds as anonymous.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use ipnet::IpNet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};

/// Validated client IP.
pub const HEADER_REMOTE_IP: &str = "k-remote-ip";
/// Nick claim (`sub`) of a verified token.
pub const HEADER_JWT_NICK: &str = "k-jwt-nick";
/// Account claim of a verified token.
pub const HEADER_JWT_ACCOUNT: &str = "k-jwt-account";
/// Issuer claim (`iss`) of a verified token.
pub const HEADER_JWT_ISSUER: &str = "k-jwt-issuer";

#[derive(Debug, Deserialize)]
struct ExtJwtClaims {
    sub: Option<String>,
    iss: Option<String>,
    account: Option<String>,
}

pub async fn identity_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    // Identity is only required for creation and deletion.
    if req.method() != Method::POST && req.method() != Method::DELETE {
        return next.run(req).await;
    }

    let headers = req.headers_mut();
    headers.remove(HEADER_REMOTE_IP);
    headers.remove(HEADER_JWT_NICK);
    headers.remove(HEADER_JWT_ACCOUNT);
    headers.remove(HEADER_JWT_ISSUER);

    let remote_ip = match resolve_remote_ip(&state, &req) {
        Ok(ip) => ip,
        Err(e) => return e.into_response(),
    };
    match HeaderValue::from_str(&remote_ip.to_string()) {
        Ok(value) => {
            req.headers_mut().insert(HEADER_REMOTE_IP, value);
        }
        Err(e) => {
            return ApiError::Internal(format!("invalid remote ip header: {e}")).into_response();
        }
    }

    if let Err(reason) = annotate_claims(&state, &mut req) {
        // Token failures are non-fatal; the upload is treated as anonymous.
        tracing::warn!(error = %reason, "failed to process authorization token");
    }

    next.run(req).await
}

fn resolve_remote_ip(state: &AppState, req: &Request) -> Result<IpAddr, ApiError> {
    let direct = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .ok_or_else(|| ApiError::Internal("missing connection info".to_string()))?;

    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if is_trusted_proxy(&state.config.server.trusted_reverse_proxy_ranges, direct) {
            // Intermediary proxies are not checked against the allowlist:
            // a trusted proxy forwarding the header it received expresses
            // trust we honour transitively. The first element is the
            // original client.
            let client = forwarded.split(',').next().unwrap_or("").trim();
            return client.parse().map_err(|_| {
                tracing::error!(%client, remote_ip = %direct, "could not use trusted X-Forwarded-For header");
                ApiError::Malformed(format!("invalid X-Forwarded-For address: {client:?}"))
            });
        }
        tracing::warn!(
            forwarded_for = forwarded,
            remote_ip = %direct,
            "untrusted remote attempted to override stored IP"
        );
    }

    Ok(direct)
}

fn is_trusted_proxy(ranges: &[IpNet], ip: IpAddr) -> bool {
    ranges.iter().any(|net| net.contains(&ip))
}

fn annotate_claims(state: &AppState, req: &mut Request) -> Result<(), String> {
    let auth = req
        .headers()
        .get(AUTHORIZATION)
        .ok_or_else(|| "no authorization header".to_string())?
        .to_str()
        .map_err(|e| e.to_string())?;
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    let issuer = peek_issuer(token)?;
    let secrets = &state.config.server.jwt_secrets_by_issuer;
    let secret = match secrets.get(&issuer) {
        Some(secret) => secret,
        None => {
            let fallback = secrets
                .get("*")
                .ok_or_else(|| format!("issuer {issuer:?} not configured"))?;
            tracing::warn!(%issuer, "issuer not configured, used fallback secret");
            fallback
        }
    };

    let mut validation = Validation::new(Algorithm::HS256);
    // exp is validated when present but tokens without one are accepted.
    validation.required_spec_claims = Default::default();

    let data = decode::<ExtJwtClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| e.to_string())?;

    let headers = req.headers_mut();
    if let Some(nick) = data.claims.sub
        && let Ok(value) = HeaderValue::from_str(&nick)
    {
        headers.insert(HEADER_JWT_NICK, value);
    }
    if let Some(issuer) = data.claims.iss
        && let Ok(value) = HeaderValue::from_str(&issuer)
    {
        headers.insert(HEADER_JWT_ISSUER, value);
    }
    if let Some(account) = data.claims.account
        && let Ok(value) = HeaderValue::from_str(&account)
    {
        headers.insert(HEADER_JWT_ACCOUNT, value);
    }

    Ok(())
}

/// Read the unverified issuer claim so the right secret can be selected
/// for verification.
fn peek_issuer(token: &str) -> Result<String, String> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| "malformed token".to_string())?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| e.to_string())?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
    claims
        .get("iss")
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| "issuer field 'iss' missing from token".to_string())
}
