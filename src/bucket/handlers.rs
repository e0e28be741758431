use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::sync::Arc;

use super::protocol::*;
use super::store::BlobStore;
use crate::digest::ContentDigest;
use crate::directory::handlers::handle_version;
use crate::directory::protocol::ENDPOINT_VERSION;

/// Assembles the bucket node's router.
pub fn router(store: Arc<BlobStore>) -> Router {
    Router::new()
        .route(ENDPOINT_RESERVE, post(handle_reserve))
        .route(ENDPOINT_UPLOAD, post(handle_upload))
        .route("/blob/:digest", get(handle_get_blob))
        .route(ENDPOINT_USAGE, get(handle_usage))
        .route(ENDPOINT_VERSION, get(handle_version))
        .layer(Extension(store))
}

pub async fn handle_reserve(
    Extension(store): Extension<Arc<BlobStore>>,
    Json(req): Json<ReserveRequest>,
) -> StatusCode {
    store.reserve(req.lease_token, req.digest, req.size);
    StatusCode::OK
}

pub async fn handle_upload(
    Extension(store): Extension<Arc<BlobStore>>,
    Json(req): Json<UploadRequest>,
) -> (StatusCode, Json<UploadResponse>) {
    let verified = store.upload(&req.lease_token, &req.digest, req.bytes);

    // A failed verification is still a well-formed exchange; the caller
    // forwards the verdict to the directory either way.
    (StatusCode::OK, Json(UploadResponse { verified }))
}

pub async fn handle_get_blob(
    Extension(store): Extension<Arc<BlobStore>>,
    Path(digest_str): Path<String>,
) -> Response {
    let digest: ContentDigest = match digest_str.parse() {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("Failed to parse digest: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match store.retrieve(&digest) {
        Some(bytes) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn handle_usage(
    Extension(store): Extension<Arc<BlobStore>>,
) -> (StatusCode, Json<UsageResponse>) {
    (
        StatusCode::OK,
        Json(UsageResponse {
            bucket_id: store.id().clone(),
            capacity: store.capacity(),
            bytes_used: store.bytes_used(),
            blob_count: store.blob_count(),
        }),
    )
}
