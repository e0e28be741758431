use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;

use super::error::DirectoryError;
use super::index::{BUCKET_OFFLINE_TIMEOUT, Directory};
use super::protocol::*;
use super::types::UserId;
use crate::digest::ContentDigest;

/// Assembles the index node's router.
pub fn router(directory: Arc<Directory>) -> Router {
    Router::new()
        .route(ENDPOINT_ALLOCATE, post(handle_allocate))
        .route(ENDPOINT_FINALIZE, post(handle_finalize))
        .route(ENDPOINT_USER, post(handle_add_user))
        .route("/user/:user_id", get(handle_get_user))
        .route("/locate/:digest", get(handle_locate))
        .route(ENDPOINT_REGISTER_BUCKET, post(handle_register_bucket))
        .route(ENDPOINT_HEARTBEAT, post(handle_heartbeat))
        .route(ENDPOINT_BUCKETS, get(handle_list_buckets))
        .route(ENDPOINT_RECLAIM, post(handle_reclaim))
        .route(ENDPOINT_VERSION, get(handle_version))
        .layer(Extension(directory))
}

fn status_for(error: &DirectoryError) -> StatusCode {
    match error {
        DirectoryError::UserNotFound | DirectoryError::NotFound => StatusCode::NOT_FOUND,
        DirectoryError::UserAlreadyExists => StatusCode::CONFLICT,
        DirectoryError::CapacityExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
        DirectoryError::QuotaExceeded { .. } => StatusCode::FORBIDDEN,
        DirectoryError::HashMismatch => StatusCode::BAD_REQUEST,
        DirectoryError::LeaseExpired => StatusCode::GONE,
    }
}

pub async fn handle_allocate(
    Extension(directory): Extension<Arc<Directory>>,
    Json(req): Json<AllocateRequest>,
) -> (StatusCode, Json<AllocateResponse>) {
    if req.size == 0 {
        tracing::error!("Rejected zero-size allocate for digest {}", req.digest);
        return (
            StatusCode::BAD_REQUEST,
            Json(AllocateResponse {
                assignment: None,
                error: None,
            }),
        );
    }

    match directory.allocate(&req.user_id, req.digest, req.size).await {
        Ok(assignment) => (
            StatusCode::OK,
            Json(AllocateResponse {
                assignment: Some(assignment),
                error: None,
            }),
        ),
        Err(e) => (
            status_for(&e),
            Json(AllocateResponse {
                assignment: None,
                error: Some(e),
            }),
        ),
    }
}

pub async fn handle_finalize(
    Extension(directory): Extension<Arc<Directory>>,
    Json(req): Json<FinalizeRequest>,
) -> (StatusCode, Json<FinalizeResponse>) {
    match directory
        .finalize(&req.lease_token, req.digest, req.size, req.verified)
        .await
    {
        Ok(_) => (
            StatusCode::OK,
            Json(FinalizeResponse {
                success: true,
                error: None,
            }),
        ),
        Err(e) => (
            status_for(&e),
            Json(FinalizeResponse {
                success: false,
                error: Some(e),
            }),
        ),
    }
}

pub async fn handle_add_user(
    Extension(directory): Extension<Arc<Directory>>,
    Json(req): Json<AddUserRequest>,
) -> (StatusCode, Json<AddUserResponse>) {
    match directory.add_user(req.user_id, req.byte_limit).await {
        Ok(_) => (
            StatusCode::OK,
            Json(AddUserResponse {
                success: true,
                error: None,
            }),
        ),
        Err(e) => (
            status_for(&e),
            Json(AddUserResponse {
                success: false,
                error: Some(e),
            }),
        ),
    }
}

pub async fn handle_get_user(
    Extension(directory): Extension<Arc<Directory>>,
    Path(user_id): Path<String>,
) -> (StatusCode, Json<Option<UserResponse>>) {
    let user_id = UserId(user_id);

    match directory.get_user(&user_id).await {
        Some(account) => (
            StatusCode::OK,
            Json(Some(UserResponse {
                user_id,
                byte_limit: account.byte_limit,
                bytes_used: account.bytes_used,
            })),
        ),
        None => (StatusCode::NOT_FOUND, Json(None)),
    }
}

pub async fn handle_locate(
    Extension(directory): Extension<Arc<Directory>>,
    Path(digest_str): Path<String>,
) -> (StatusCode, Json<Option<LocateResponse>>) {
    let digest: ContentDigest = match digest_str.parse() {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("Failed to parse digest: {}", e);
            return (StatusCode::BAD_REQUEST, Json(None));
        }
    };

    match directory.locate(&digest).await {
        Some((bucket_id, bucket_addr)) => (
            StatusCode::OK,
            Json(Some(LocateResponse {
                bucket_id,
                bucket_addr,
            })),
        ),
        None => (StatusCode::NOT_FOUND, Json(None)),
    }
}

pub async fn handle_register_bucket(
    Extension(directory): Extension<Arc<Directory>>,
    Json(req): Json<RegisterBucketRequest>,
) -> StatusCode {
    directory
        .register_bucket(req.bucket_id, req.addr, req.capacity, req.version)
        .await;
    StatusCode::OK
}

pub async fn handle_heartbeat(
    Extension(directory): Extension<Arc<Directory>>,
    Json(req): Json<HeartbeatRequest>,
) -> StatusCode {
    if directory.heartbeat(&req.bucket_id, req.version).await {
        StatusCode::OK
    } else {
        // Unknown bucket: tell it to re-register.
        StatusCode::NOT_FOUND
    }
}

pub async fn handle_list_buckets(
    Extension(directory): Extension<Arc<Directory>>,
) -> (StatusCode, Json<Vec<BucketSummary>>) {
    let buckets = directory
        .list_buckets()
        .await
        .into_iter()
        .map(|b| BucketSummary {
            online: b.is_online(BUCKET_OFFLINE_TIMEOUT),
            bucket_id: b.id,
            addr: b.addr,
            capacity: b.capacity,
            reserved: b.reserved,
            committed: b.committed,
            version: b.version,
        })
        .collect();

    (StatusCode::OK, Json(buckets))
}

pub async fn handle_reclaim(
    Extension(directory): Extension<Arc<Directory>>,
) -> (StatusCode, Json<ReclaimResponse>) {
    let reclaimed = directory.reclaim_expired().await;
    (StatusCode::OK, Json(ReclaimResponse { reclaimed }))
}

/// Shared by both node roles: the upgrade orchestrator calls this before and
/// after a code swap to confirm the running version.
pub async fn handle_version() -> (StatusCode, Json<VersionResponse>) {
    (
        StatusCode::OK,
        Json(VersionResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}
