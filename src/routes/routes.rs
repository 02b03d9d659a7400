//! Defines routes for the ephemeral object store API.
//!
//! ## Structure
//! - **Upload endpoints**
//!   - `POST /preupload` — reserve an identifier with a declared size
//!   - `POST /upload`    — multipart upload (streams to disk)
//!
//! - **Object endpoints**
//!   - `GET  /{file_id}` — download; `.i` suffix forces inline display,
//!     `Range` requests partial content
//!   - `POST /delete`    — owner-authorized delete
//!   - `GET  /uploads`   — caller's live objects
//!
//! Exact routes take precedence over the `/{file_id}` capture, so the health
//! probes stay reachable.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{
            delete_object, fetch_object, list_uploads, reserve_upload, upload_object,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build and return the router for the full API surface.
///
/// The router carries shared state (`AppState`) to all handlers. The upload
/// route drops the default body limit since payloads stream to disk.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // upload & management endpoints
        .route("/preupload", post(reserve_upload))
        .route(
            "/upload",
            post(upload_object).layer(DefaultBodyLimit::disable()),
        )
        .route("/uploads", get(list_uploads))
        .route("/delete", post(delete_object))
        // object download
        .route("/{file_id}", get(fetch_object))
}
