//! HTTP handlers for upload, download, and object management.
//! Streams bodies in both directions and delegates all storage and session
//! concerns to the services layer.

use crate::{
    errors::AppError,
    identity,
    models::object::StoredObject,
    services::{
        abuse::FAILURE_THRESHOLD,
        session::UploadSession,
        store::StoreError,
        transfer::{self, RangeRequest, Transfer},
    },
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, Form, Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{Duration, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

/// How long an uploaded object lives.
const OBJECT_TTL_HOURS: i64 = 48;

/// Media type prefixes that may be forced to display inline via the `.i`
/// URL suffix; everything else keeps the safe default.
const FORCED_INLINE_TYPES: &[&str] = &["video/"];

/// Form body for `POST /preupload`.
#[derive(Debug, Deserialize)]
pub struct ReserveForm {
    pub size: Option<i64>,
}

/// Form body for `POST /delete`.
#[derive(Debug, Deserialize)]
pub struct DeleteForm {
    #[serde(rename = "fileId")]
    pub file_id: Option<String>,
}

/// POST `/preupload` — reserve an upload slot with a declared size, so a
/// download link can be shared before the first byte is sent.
pub async fn reserve_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<ReserveForm>,
) -> Response {
    let Some(size) = form.size else {
        return Json(json!({ "success": false })).into_response();
    };
    let client = identity::client_identity(&headers);
    let session = state.sessions.reserve(client.identity, size.max(-1));

    let link = format!("{}/{}", server_location(&headers), session.id());
    let mut response = Json(json!({
        "success": true,
        "token": client.token,
        "fileId": session.id(),
        "link": link,
    }))
    .into_response();
    identity::set_token_cookie(response.headers_mut(), &client.token);
    response
}

/// POST `/upload` — multipart upload. An optional `fileId` field attaches to
/// a previous reservation; the `file` field carries the payload and is
/// streamed to disk chunk by chunk, advancing the session cursor as it goes.
pub async fn upload_object(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let client = identity::client_identity(&headers);
    let mut reserved_id: Option<String> = None;
    let mut stored: Option<StoredObject> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(err.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "fileId" => {
                reserved_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|err| AppError::bad_request(err.to_string()))?,
                );
            }
            "file" => {
                let session = resolve_session(&state, reserved_id.take(), client.identity)?;
                let object = StoredObject {
                    id: session.id().to_string(),
                    display_name: field.file_name().unwrap_or("file").to_string(),
                    media_type: field
                        .content_type()
                        .unwrap_or("application/octet-stream")
                        .to_string(),
                    expires_at: Utc::now() + Duration::hours(OBJECT_TTL_HOURS),
                    owner_address: addr.ip().to_string(),
                    owner_identity: client.identity,
                };
                // The record goes down first so the object is resolvable the
                // moment the first byte lands.
                state.store.write_record(&object).await?;

                let mut writer = state.store.begin_blob(Arc::clone(&session)).await?;
                loop {
                    match field.chunk().await {
                        Ok(Some(chunk)) => {
                            writer.write(&chunk).await?;
                        }
                        Ok(None) => break,
                        Err(err) => {
                            writer.abort();
                            return Err(AppError::bad_request(err.to_string()));
                        }
                    }
                }
                writer.finish().await?;
                stored = Some(object);
            }
            // Unknown fields (json, timezone, ...) are accepted and ignored.
            _ => {}
        }
    }

    let object = stored.ok_or_else(|| AppError::bad_request("missing file field"))?;
    let link = format!("{}/{}", server_location(&headers), object.id);
    Ok(Json(json!({
        "file": object.display_name,
        "fileId": object.id,
        "link": link,
        "expiry": object.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        "epochExpiry": object.expires_at.timestamp_millis(),
    }))
    .into_response())
}

/// GET `/{file_id}` — stream an object. A trailing `.i` asks for inline
/// display; a `Range` header asks for a partial response. Both are honored
/// only when safe.
pub async fn fetch_object(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let (id, force_inline) = match file_id.strip_suffix(".i") {
        Some(stripped) => (stripped.to_string(), true),
        None => (file_id, false),
    };

    let ip = addr.ip();
    if state.abuse.current_count(ip) >= FAILURE_THRESHOLD {
        state.abuse.record_failure(ip);
        return Err(AppError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "too many requests",
        ));
    }

    let range = parse_range_header(&headers);
    let transfer = match transfer::serve(&state.store, &state.sessions, &id, range).await {
        Ok(transfer) => transfer,
        Err(StoreError::NotFound) => {
            state.abuse.record_failure(ip);
            return Err(AppError::not_found("no such file"));
        }
        Err(err) => return Err(err.into()),
    };

    let Transfer {
        object,
        content_length,
        is_partial,
        content_range,
        stream,
    } = transfer;

    let mut display = if object.media_type.starts_with("image/") {
        "inline"
    } else {
        "attachment"
    };
    if force_inline && allows_forced_inline(&object.media_type) {
        display = "inline";
    }

    let mut response = Response::new(Body::from_stream(stream));
    if is_partial {
        *response.status_mut() = StatusCode::PARTIAL_CONTENT;
    }
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&object.media_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Some(length) = content_length {
        response_headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from(length.max(0) as u64),
        );
    }
    if let Some(range) = content_range {
        let value = format!("bytes {}-{}/{}", range.start, range.last, range.total);
        if let Ok(value) = HeaderValue::from_str(&value) {
            response_headers.insert(header::CONTENT_RANGE, value);
        }
    }
    let disposition = format!(
        "{display}; filename=\"{}\"",
        encode_disposition_filename(&object.display_name)
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        response_headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

/// POST `/delete` — owner-authorized delete. Cancels any live upload session
/// for the object so in-flight downloads abort promptly.
pub async fn delete_object(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<DeleteForm>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Some(file_id) = form.file_id else {
        return Err(AppError::bad_request("missing fileId"));
    };
    let client = identity::client_identity(&headers);
    state.store.delete_owned(&file_id, client.identity).await?;
    state.sessions.cancel(&file_id);
    Ok(Json(json!({ "success": true })))
}

/// GET `/uploads` — the caller's live objects, soonest expiry first.
pub async fn list_uploads(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<serde_json::Value>>, AppError> {
    let client = identity::client_identity(&headers);
    let location = server_location(&headers);
    let objects = state.store.list_owned(client.identity).await?;
    let entries = objects
        .into_iter()
        .map(|object| {
            json!({
                "file": object.display_name,
                "fileId": object.id,
                "link": format!("{}/{}", location, object.id),
                "expiry": object.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                "epochExpiry": object.expires_at.timestamp_millis(),
            })
        })
        .collect();
    Ok(Json(entries))
}

/// Attach to a reservation when the caller owns it and nothing has been
/// written yet; otherwise start a fresh session with unknown size.
fn resolve_session(
    state: &AppState,
    reserved: Option<String>,
    identity: Uuid,
) -> Result<Arc<UploadSession>, AppError> {
    if let Some(id) = reserved {
        if let Some(session) = state.sessions.lookup(&id) {
            if session.owner() != identity {
                return Err(AppError::new(StatusCode::FORBIDDEN, "not authorized"));
            }
            if session.available() == 0 && !session.is_complete() && !session.is_cancelled() {
                return Ok(session);
            }
        }
    }
    Ok(state.sessions.reserve(identity, -1))
}

fn allows_forced_inline(media_type: &str) -> bool {
    FORCED_INLINE_TYPES
        .iter()
        .any(|prefix| media_type.starts_with(prefix))
}

/// Parse a `Range: bytes=a-b` header. Anything unparseable (including
/// multi-range requests) reads as no range at all.
fn parse_range_header(headers: &HeaderMap) -> Option<RangeRequest> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    let (left, right) = spec.split_once('-')?;
    let start = left.trim().parse::<i64>().ok()?;
    let end = match right.trim() {
        "" => None,
        raw => Some(raw.parse::<i64>().ok()?),
    };
    Some(RangeRequest { start, end })
}

/// External scheme/host for building shareable links, honoring reverse-proxy
/// forwarding headers.
fn server_location(headers: &HeaderMap) -> String {
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{proto}://{host}")
}

/// Percent-encode a filename for a quoted Content-Disposition parameter.
fn encode_disposition_filename(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'_' | b' ' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range_headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn range_header_forms_are_parsed() {
        let range = parse_range_header(&range_headers("bytes=5-9")).unwrap();
        assert_eq!((range.start, range.end), (5, Some(9)));

        let range = parse_range_header(&range_headers("bytes=100-")).unwrap();
        assert_eq!((range.start, range.end), (100, None));

        assert!(parse_range_header(&range_headers("bytes=a-b")).is_none());
        assert!(parse_range_header(&range_headers("bytes=0-1,5-9")).is_none());
        assert!(parse_range_header(&range_headers("items=0-1")).is_none());
        assert!(parse_range_header(&HeaderMap::new()).is_none());
    }

    #[test]
    fn forced_inline_is_allow_listed() {
        assert!(allows_forced_inline("video/mp4"));
        assert!(!allows_forced_inline("text/html"));
        assert!(!allows_forced_inline("application/pdf"));
    }

    #[test]
    fn disposition_filenames_are_escaped() {
        assert_eq!(
            encode_disposition_filename("report v2.pdf"),
            "report v2.pdf"
        );
        assert_eq!(
            encode_disposition_filename("we\"ird\\name"),
            "we%22ird%5Cname"
        );
    }
}
