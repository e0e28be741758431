//! Directory Network Protocol
//!
//! Defines the API endpoints and Data Transfer Objects (DTOs) the index node
//! exposes to clients, bucket nodes, and administrative tooling.
//!
//! These structures are serialized as JSON and sent over HTTP. Rejections
//! carry the exact `DirectoryError` variant in the body so callers can match
//! on the reason after the round trip.

use super::error::DirectoryError;
use super::types::{Assignment, BucketId, LeaseToken, UserId};
use crate::digest::ContentDigest;
use serde::{Deserialize, Serialize};

// --- API Endpoints ---

/// Client entry point: request a storage assignment for a digest.
pub const ENDPOINT_ALLOCATE: &str = "/allocate";
/// Client entry point: settle a reservation with the upload verdict.
pub const ENDPOINT_FINALIZE: &str = "/finalize";
/// Admin: provision a user account. GET under the same path reads one back.
pub const ENDPOINT_USER: &str = "/user";
/// Resolve the bucket holding a committed digest.
pub const ENDPOINT_LOCATE: &str = "/locate";
/// Bucket nodes announce themselves here at startup.
pub const ENDPOINT_REGISTER_BUCKET: &str = "/bucket/register";
/// Bucket liveness signal.
pub const ENDPOINT_HEARTBEAT: &str = "/bucket/heartbeat";
/// Operator view of every registered bucket.
pub const ENDPOINT_BUCKETS: &str = "/buckets";
/// On-demand sweep of expired leases.
pub const ENDPOINT_RECLAIM: &str = "/reclaim";
/// Build version report, used by the upgrade orchestrator on every node.
pub const ENDPOINT_VERSION: &str = "/version";

// --- Data Transfer Objects ---

#[derive(Debug, Serialize, Deserialize)]
pub struct AllocateRequest {
    pub user_id: UserId,
    pub digest: ContentDigest,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AllocateResponse {
    /// The assignment on success, absent on rejection.
    pub assignment: Option<Assignment>,
    pub error: Option<DirectoryError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub lease_token: LeaseToken,
    pub digest: ContentDigest,
    pub size: u64,
    /// The bucket's digest verification verdict, forwarded verbatim.
    pub verified: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FinalizeResponse {
    pub success: bool,
    pub error: Option<DirectoryError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddUserRequest {
    pub user_id: UserId,
    pub byte_limit: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddUserResponse {
    pub success: bool,
    pub error: Option<DirectoryError>,
}

/// Read-only snapshot of one user account.
#[derive(Debug, Serialize, Deserialize)]
pub struct UserResponse {
    pub user_id: UserId,
    pub byte_limit: u64,
    pub bytes_used: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LocateResponse {
    pub bucket_id: BucketId,
    pub bucket_addr: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterBucketRequest {
    pub bucket_id: BucketId,
    /// Address clients reach the bucket's HTTP server on.
    pub addr: String,
    pub capacity: u64,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub bucket_id: BucketId,
    pub version: String,
}

/// One row of the operator bucket listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct BucketSummary {
    pub bucket_id: BucketId,
    pub addr: String,
    pub capacity: u64,
    pub reserved: u64,
    pub committed: u64,
    pub version: String,
    pub online: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReclaimResponse {
    pub reclaimed: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
}
