//! Bucket Network Protocol
//!
//! Endpoints and DTOs for the bucket node's HTTP surface: advisory
//! reservations, verified uploads, and blob reads. Blob bytes travel inside
//! JSON bodies for uploads and as a raw octet stream for reads.

use crate::digest::ContentDigest;
use crate::directory::types::{BucketId, LeaseToken};
use serde::{Deserialize, Serialize};

// --- API Endpoints ---

/// Advisory reservation announcement ahead of an upload.
pub const ENDPOINT_RESERVE: &str = "/reserve";
/// Verified upload of one object's bytes.
pub const ENDPOINT_UPLOAD: &str = "/upload";
/// Raw blob read, keyed by digest.
pub const ENDPOINT_BLOB: &str = "/blob";
/// Usage report (capacity, bytes stored, blob count).
pub const ENDPOINT_USAGE: &str = "/usage";

// --- Data Transfer Objects ---

#[derive(Debug, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub lease_token: LeaseToken,
    pub digest: ContentDigest,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadRequest {
    pub lease_token: LeaseToken,
    /// The digest the uploader claims; the bucket recomputes and compares.
    pub digest: ContentDigest,
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Whether the bytes matched the claimed digest and were persisted.
    pub verified: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UsageResponse {
    pub bucket_id: BucketId,
    pub capacity: u64,
    pub bytes_used: u64,
    pub blob_count: usize,
}
