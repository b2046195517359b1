//! Tus 1.0 protocol handlers.
//!
//! Routes are mounted under the configured base path:
//! `POST /` creates an upload, `HEAD`/`PATCH`/`GET`/`DELETE /{id}` drive
//! it through its lifecycle, and `OPTIONS` advertises the supported
//! protocol extensions. The optional trailing `/{filename}` path segment
//! is cosmetic and ignored.

use crate::error::{ApiError, ApiResult};
use crate::ident;
use crate::metrics;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use depot_core::event::EventKind;
use depot_core::id::UploadId;
use depot_core::info::UploadInfo;
use depot_metadata::NewUpload;
use futures::TryStreamExt;
use std::collections::HashMap;
use tokio::io::AsyncReadExt;
use tokio_util::io::{ReaderStream, StreamReader};

pub const TUS_RESUMABLE: &str = "Tus-Resumable";
pub const TUS_VERSION: &str = "1.0.0";

const UPLOAD_OFFSET: &str = "Upload-Offset";
const UPLOAD_LENGTH: &str = "Upload-Length";
const UPLOAD_METADATA: &str = "Upload-Metadata";
const UPLOAD_DEFER_LENGTH: &str = "Upload-Defer-Length";
const UPLOAD_CONCAT: &str = "Upload-Concat";
const TUS_EXTENSIONS: &str = "creation,creation-defer-length,termination,concatenation,expiration";
const PATCH_CONTENT_TYPE: &str = "application/offset+octet-stream";

/// The route prefix uploads are served under, without a trailing slash.
pub fn route_prefix(base_path: &str) -> String {
    base_path.trim_end_matches('/').to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn check_tus_version(headers: &HeaderMap) -> ApiResult<()> {
    match header_str(headers, TUS_RESUMABLE) {
        Some(version) if version != TUS_VERSION => Err(ApiError::Malformed(format!(
            "unsupported tus version: {version}"
        ))),
        _ => Ok(()),
    }
}

fn build(builder: axum::http::response::Builder, body: Body) -> ApiResult<Response> {
    builder
        .body(body)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Decode `Upload-Metadata`: comma-separated `key base64value` pairs,
/// value optional.
fn parse_upload_metadata(raw: &str) -> ApiResult<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.split_whitespace();
        let Some(key) = parts.next() else { continue };
        let value = match parts.next() {
            Some(encoded) => {
                let bytes = BASE64.decode(encoded).map_err(|e| {
                    ApiError::Malformed(format!("invalid base64 in Upload-Metadata: {e}"))
                })?;
                String::from_utf8(bytes).map_err(|e| {
                    ApiError::Malformed(format!("invalid utf-8 in Upload-Metadata: {e}"))
                })?
            }
            None => String::new(),
        };
        if parts.next().is_some() {
            return Err(ApiError::Malformed(
                "unexpected token in Upload-Metadata pair".to_string(),
            ));
        }
        metadata.insert(key.to_string(), value);
    }
    Ok(metadata)
}

fn encode_upload_metadata(metadata: &HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = metadata
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.clone()
            } else {
                format!("{key} {}", BASE64.encode(value))
            }
        })
        .collect();
    pairs.sort();
    pairs.join(",")
}

/// Extract part ids from `final;/files/a /files/b`.
fn parse_concat_parts(raw: &str) -> Vec<String> {
    raw.split_whitespace()
        .filter_map(|url| url.rsplit('/').next())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

/// `OPTIONS` — advertise protocol version, extensions and size limit.
pub async fn options_info(State(state): State<AppState>) -> ApiResult<Response> {
    build(
        Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header("Tus-Version", TUS_VERSION)
            .header("Tus-Extension", TUS_EXTENSIONS)
            .header("Tus-Max-Size", state.config.storage.max_upload_size.to_string()),
        Body::empty(),
    )
}

/// `POST /` — create a new upload.
pub async fn create_upload(State(state): State<AppState>, req: Request) -> ApiResult<Response> {
    let headers = req.headers();
    check_tus_version(headers)?;

    let remote_ip = header_str(headers, ident::HEADER_REMOTE_IP)
        .unwrap_or_default()
        .to_string();
    let nick = header_str(headers, ident::HEADER_JWT_NICK)
        .unwrap_or_default()
        .to_string();
    let account = header_str(headers, ident::HEADER_JWT_ACCOUNT)
        .unwrap_or_default()
        .to_string();
    let issuer = header_str(headers, ident::HEADER_JWT_ISSUER)
        .unwrap_or_default()
        .to_string();

    if state.config.server.require_jwt_account && account.is_empty() {
        return Err(ApiError::Unauthorized("account required".to_string()));
    }

    let concat = header_str(headers, UPLOAD_CONCAT).unwrap_or_default();
    let is_partial = concat == "partial";
    let final_parts = concat.strip_prefix("final;").map(parse_concat_parts);

    let defer_length = header_str(headers, UPLOAD_DEFER_LENGTH) == Some("1");
    let length = match header_str(headers, UPLOAD_LENGTH) {
        Some(raw) => Some(raw.parse::<i64>().ok().filter(|len| *len >= 0).ok_or_else(
            || ApiError::Malformed(format!("invalid Upload-Length: {raw:?}")),
        )?),
        None => None,
    };

    let max_size = state.config.storage.max_upload_size as i64;

    if final_parts.is_none() {
        match (length, defer_length) {
            (Some(_), false) | (None, true) => {}
            _ => {
                return Err(ApiError::Malformed(
                    "exactly one of Upload-Length and Upload-Defer-Length is required"
                        .to_string(),
                ));
            }
        }
    }
    if let Some(len) = length
        && len > max_size
    {
        return Err(ApiError::TooLarge(format!(
            "declared length {len} exceeds maximum upload size {max_size}"
        )));
    }

    let mut metadata = match header_str(headers, UPLOAD_METADATA) {
        Some(raw) => parse_upload_metadata(raw)?,
        None => HashMap::new(),
    };
    let file_name = metadata.get("filename").cloned().unwrap_or_default();
    let file_type = metadata.get("filetype").cloned().unwrap_or_default();
    if !account.is_empty() {
        metadata.insert(depot_core::METADATA_IDENTIFIED.to_string(), "1".to_string());
    }

    let id = UploadId::new().to_string();
    let mut info = UploadInfo::new(id.clone());
    if let Some(len) = length {
        info.size = len;
        info.size_is_deferred = false;
    }
    info.is_partial = is_partial;
    info.metadata = metadata;

    // Validate and load concatenation parts before creating anything.
    let mut parts = Vec::new();
    if let Some(part_ids) = &final_parts {
        if part_ids.is_empty() {
            return Err(ApiError::Malformed("Upload-Concat names no parts".to_string()));
        }
        let mut total = 0i64;
        for part_id in part_ids {
            let part = state.store.get_upload(part_id).await.map_err(|e| match e {
                depot_storage::StorageError::NotFound(_) => {
                    ApiError::Malformed(format!("unknown partial upload: {part_id}"))
                }
                other => ApiError::Storage(other),
            })?;
            let part_info = part.info();
            if !part_info.is_partial {
                return Err(ApiError::Malformed(format!(
                    "upload {part_id} is not a partial upload"
                )));
            }
            if part_info.size_is_deferred || part_info.offset < part_info.size {
                return Err(ApiError::Malformed(format!(
                    "partial upload {part_id} is not complete"
                )));
            }
            total += part_info.size;
            parts.push(part);
        }
        if total > max_size {
            return Err(ApiError::TooLarge(format!(
                "concatenated size {total} exceeds maximum upload size {max_size}"
            )));
        }
        info.size = total;
        info.size_is_deferred = false;
        info.is_final = true;
        info.partial_uploads = part_ids.clone();
    }

    state
        .metadata
        .new_upload(&NewUpload {
            id: id.clone(),
            uploader_ip: remote_ip,
            file_name,
            file_type,
            jwt_nick: nick,
            jwt_account: account,
            jwt_issuer: issuer,
        })
        .await?;

    let mut upload = state.store.new_upload(info).await?;
    metrics::UPLOADS_CREATED.inc();
    state
        .events
        .publish(EventKind::PostCreate, upload.info().clone())
        .await;

    if !parts.is_empty() {
        upload.concat_uploads(&parts).await?;
        upload.finish().await?;
        record_finish(&state, &id).await;
        state
            .events
            .publish(EventKind::PostFinish, upload.info().clone())
            .await;
    }

    let location = format!("{}/{id}", route_prefix(&state.config.server.base_path));
    build(
        Response::builder()
            .status(StatusCode::CREATED)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header(header::LOCATION, location),
        Body::empty(),
    )
}

/// `HEAD /{id}` — report offset, length and metadata.
pub async fn head_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    head_inner(state, id).await
}

pub async fn head_upload_named(
    State(state): State<AppState>,
    Path((id, _filename)): Path<(String, String)>,
) -> ApiResult<Response> {
    head_inner(state, id).await
}

async fn head_inner(state: AppState, id: String) -> ApiResult<Response> {
    let upload = state.store.get_upload(&id).await?;
    let info = upload.info();

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(TUS_RESUMABLE, TUS_VERSION)
        .header(header::CACHE_CONTROL, "no-store")
        .header(UPLOAD_OFFSET, info.offset.to_string());

    if info.size_is_deferred {
        builder = builder.header(UPLOAD_DEFER_LENGTH, "1");
    } else {
        builder = builder.header(UPLOAD_LENGTH, info.size.to_string());
    }
    if !info.metadata.is_empty() {
        builder = builder.header(UPLOAD_METADATA, encode_upload_metadata(&info.metadata));
    }
    if info.is_partial {
        builder = builder.header(UPLOAD_CONCAT, "partial");
    } else if info.is_final {
        let prefix = route_prefix(&state.config.server.base_path);
        let parts: Vec<String> = info
            .partial_uploads
            .iter()
            .map(|part| format!("{prefix}/{part}"))
            .collect();
        builder = builder.header(UPLOAD_CONCAT, format!("final;{}", parts.join(" ")));
    }

    build(builder, Body::empty())
}

/// `PATCH /{id}` — append a chunk at the current offset.
pub async fn patch_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Request,
) -> ApiResult<Response> {
    patch_inner(state, id, req).await
}

pub async fn patch_upload_named(
    State(state): State<AppState>,
    Path((id, _filename)): Path<(String, String)>,
    req: Request,
) -> ApiResult<Response> {
    patch_inner(state, id, req).await
}

async fn patch_inner(state: AppState, id: String, req: Request) -> ApiResult<Response> {
    let headers = req.headers();
    check_tus_version(headers)?;

    if header_str(headers, header::CONTENT_TYPE.as_str()) != Some(PATCH_CONTENT_TYPE) {
        return Err(ApiError::Malformed(format!(
            "PATCH requires content type {PATCH_CONTENT_TYPE}"
        )));
    }

    let offset: i64 = header_str(headers, UPLOAD_OFFSET)
        .and_then(|raw| raw.parse().ok())
        .filter(|offset| *offset >= 0)
        .ok_or_else(|| ApiError::Malformed("missing or invalid Upload-Offset".to_string()))?;

    let declared_length = match header_str(headers, UPLOAD_LENGTH) {
        Some(raw) => Some(raw.parse::<i64>().ok().filter(|len| *len >= 0).ok_or_else(
            || ApiError::Malformed(format!("invalid Upload-Length: {raw:?}")),
        )?),
        None => None,
    };

    let content_length: Option<i64> = header_str(headers, header::CONTENT_LENGTH.as_str())
        .and_then(|raw| raw.parse().ok());

    let mut upload = state.store.get_upload(&id).await?;

    if upload.info().is_final {
        return Err(ApiError::Conflict(
            "a concatenated upload cannot be patched".to_string(),
        ));
    }
    if offset != upload.info().offset {
        return Err(ApiError::Conflict(format!(
            "upload is at offset {}, request says {offset}",
            upload.info().offset
        )));
    }

    let max_size = state.config.storage.max_upload_size as i64;

    // A deferred-length upload declares its final size on PATCH.
    if let Some(len) = declared_length {
        if !upload.info().size_is_deferred {
            return Err(ApiError::Conflict("length already declared".to_string()));
        }
        if len > max_size {
            return Err(ApiError::TooLarge(format!(
                "declared length {len} exceeds maximum upload size {max_size}"
            )));
        }
        upload.declare_length(len).await?;
    }

    if upload.info().is_complete() {
        return Err(ApiError::Conflict("upload is already complete".to_string()));
    }

    let remaining = if upload.info().size_is_deferred {
        max_size - offset
    } else {
        upload.info().size - offset
    };
    if remaining <= 0 {
        return Err(ApiError::TooLarge(format!(
            "upload already holds the maximum of {max_size} bytes"
        )));
    }
    if let Some(len) = content_length
        && len > remaining
    {
        return Err(ApiError::TooLarge(format!(
            "chunk of {len} bytes exceeds the {remaining} bytes remaining"
        )));
    }

    // Cap the reader so a chunked body can never write past the limit.
    let body = req.into_body().into_data_stream();
    let reader = StreamReader::new(body.map_err(std::io::Error::other));
    let mut limited = reader.take(remaining as u64);
    let written = upload.write_chunk(offset, &mut limited).await?;
    metrics::BYTES_UPLOADED.inc_by(written as u64);

    state
        .events
        .publish(EventKind::PostReceive, upload.info().clone())
        .await;

    if upload.info().is_complete() {
        upload.finish().await?;
        record_finish(&state, &id).await;
        // Partial uploads are promoted but only announced once their
        // final concatenation completes.
        if !upload.info().is_partial {
            state
                .events
                .publish(EventKind::PostFinish, upload.info().clone())
                .await;
        }
    }

    build(
        Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header(UPLOAD_OFFSET, upload.info().offset.to_string()),
        Body::empty(),
    )
}

/// `GET /{id}` — stream the blob.
pub async fn get_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    get_inner(state, id).await
}

pub async fn get_upload_named(
    State(state): State<AppState>,
    Path((id, _filename)): Path<(String, String)>,
) -> ApiResult<Response> {
    get_inner(state, id).await
}

async fn get_inner(state: AppState, id: String) -> ApiResult<Response> {
    let upload = state.store.get_upload(&id).await?;
    let info = upload.info();
    let file = upload.reader().await?;

    build(
        Response::builder()
            .status(StatusCode::OK)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header(header::CONTENT_LENGTH, info.offset.to_string())
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(
                header::CONTENT_DISPOSITION,
                content_disposition(info.metadata.get("filename").map(String::as_str)),
            ),
        Body::from_stream(ReaderStream::new(file)),
    )
}

/// Build a safe attachment disposition from an untrusted filename.
fn content_disposition(filename: Option<&str>) -> String {
    let name = filename
        .and_then(|name| name.rsplit(['/', '\\']).next())
        .map(|name| {
            name.chars()
                .filter(|c| !c.is_control() && *c != '"')
                .collect::<String>()
        })
        .unwrap_or_default();
    if name.is_empty() {
        "attachment".to_string()
    } else {
        format!("attachment; filename=\"{name}\"")
    }
}

/// `DELETE /{id}` — terminate, restricted to the upload's owner.
pub async fn delete_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Request,
) -> ApiResult<Response> {
    delete_inner(state, id, req).await
}

pub async fn delete_upload_named(
    State(state): State<AppState>,
    Path((id, _filename)): Path<(String, String)>,
    req: Request,
) -> ApiResult<Response> {
    delete_inner(state, id, req).await
}

async fn delete_inner(state: AppState, id: String, req: Request) -> ApiResult<Response> {
    check_tus_version(req.headers())?;

    let row = state
        .metadata
        .fetch_upload(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(id.clone()))?;

    let headers = req.headers();
    let account = header_str(headers, ident::HEADER_JWT_ACCOUNT).unwrap_or_default();
    let issuer = header_str(headers, ident::HEADER_JWT_ISSUER).unwrap_or_default();
    let remote_ip = header_str(headers, ident::HEADER_REMOTE_IP).unwrap_or_default();

    if row.is_identified() {
        if row.jwt_account != account || row.jwt_issuer != issuer {
            return Err(ApiError::Unauthorized(
                "upload belongs to another account".to_string(),
            ));
        }
    } else if row.uploader_ip.is_empty() || row.uploader_ip != remote_ip {
        return Err(ApiError::Unauthorized(
            "upload belongs to another address".to_string(),
        ));
    }

    terminate_inner(&state, &id).await
}

/// Internal `DELETE /{id}` used by the expirer; no ownership check.
pub async fn expire_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    terminate_inner(&state, &id).await
}

/// Count a finished upload, noting whether its blob was already stored.
async fn record_finish(state: &AppState, id: &str) {
    metrics::UPLOADS_FINISHED.inc();
    match state.metadata.fetch_duplicate_count(id).await {
        Ok(count) if count > 0 => metrics::UPLOADS_DEDUPLICATED.inc(),
        Ok(_) => {}
        Err(e) => tracing::debug!(%id, error = %e, "failed to query duplicate count"),
    }
}

async fn terminate_inner(state: &AppState, id: &str) -> ApiResult<Response> {
    let upload = state.store.get_upload(id).await?;
    upload.terminate().await?;
    metrics::UPLOADS_TERMINATED.inc();
    state
        .events
        .publish(EventKind::PostTerminate, upload.info().clone())
        .await;

    build(
        Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(TUS_RESUMABLE, TUS_VERSION),
        Body::empty(),
    )
}
