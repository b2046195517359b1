//! CORS handling for the upload routes.
//!
//! The request Origin is echoed back when it appears in the configured
//! allowlist, or unconditionally when the allowlist contains "*". Every
//! response carries `Vary: Origin` so browser caches behave.

use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, header};
use axum::middleware::Next;
use axum::response::Response;

const ALLOW_METHODS: &str = "POST, HEAD, PATCH, OPTIONS, GET, DELETE";
const ALLOW_HEADERS: &str = "Authorization, Origin, X-Requested-With, Content-Type, \
    Upload-Length, Upload-Offset, Tus-Resumable, Upload-Metadata, \
    Upload-Defer-Length, Upload-Concat";
const EXPOSE_HEADERS: &str = "Upload-Offset, Location, Upload-Length, Tus-Version, \
    Tus-Resumable, Tus-Max-Size, Tus-Extension, Upload-Metadata, \
    Upload-Defer-Length, Upload-Concat";

pub async fn cors_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_default();
    let method = req.method().clone();

    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    let origins = &state.config.server.cors_origins;
    let allow_all = origins.iter().any(|o| o == "*");
    let allowed =
        !origin.is_empty() && (allow_all || origins.iter().any(|o| o == &origin));

    if allowed {
        if let Ok(value) = HeaderValue::from_str(&origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
            if method == Method::OPTIONS {
                headers.insert(
                    header::ACCESS_CONTROL_ALLOW_METHODS,
                    HeaderValue::from_static(ALLOW_METHODS),
                );
                headers.insert(
                    header::ACCESS_CONTROL_ALLOW_HEADERS,
                    HeaderValue::from_static(ALLOW_HEADERS),
                );
                headers.insert(
                    header::ACCESS_CONTROL_MAX_AGE,
                    HeaderValue::from_static("86400"),
                );
            } else {
                headers.insert(
                    header::ACCESS_CONTROL_EXPOSE_HEADERS,
                    HeaderValue::from_static(EXPOSE_HEADERS),
                );
            }
        }
    } else if !origin.is_empty() && method != Method::GET && method != Method::HEAD {
        // Don't log unknown origins for read-only requests.
        tracing::warn!(%origin, "unknown cors origin");
    }

    headers.append(header::VARY, HeaderValue::from_static("Origin"));
    response
}
