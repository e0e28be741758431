use crate::digest::ContentDigest;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId(pub String);

impl BucketId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Opaque handle for one pending reservation.
///
/// Wrapper around a UUID string. Issued by `allocate`, consumed by `finalize`;
/// retired once the allocation commits, rolls back, or expires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LeaseToken(pub String);

impl LeaseToken {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Per-user quota accounting. Only the directory mutates this.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserAccount {
    /// Quota ceiling in bytes.
    pub byte_limit: u64,
    /// Logical bytes charged to this user, including quota holds for
    /// reservations still pending.
    pub bytes_used: u64,
}

/// Directory-side view of one bucket node.
///
/// Invariant: `reserved + committed <= capacity` at all times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketRecord {
    pub id: BucketId,
    /// HTTP address clients upload to, e.g. "127.0.0.1:7101".
    pub addr: String,
    pub capacity: u64,
    /// Sum of outstanding lease reservations.
    pub reserved: u64,
    /// Sum of finalized allocations.
    pub committed: u64,
    /// Version string the bucket last reported.
    pub version: String,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl BucketRecord {
    pub fn free(&self) -> u64 {
        self.capacity - self.reserved - self.committed
    }

    /// A bucket that has not heartbeated within `timeout` is not considered
    /// for new allocations. Restored snapshots start with no `last_seen` and
    /// come back online on the first heartbeat.
    pub fn is_online(&self, timeout: std::time::Duration) -> bool {
        self.last_seen.map(|seen| seen.elapsed() <= timeout).unwrap_or(false)
    }
}

/// Lifecycle state of an allocation entry.
///
/// Expired entries are not represented: reclaim removes them outright, and a
/// later allocate for the same digest starts over with a fresh entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AllocationState {
    /// Reserved, awaiting upload confirmation.
    Pending,
    /// Bytes verified and persisted on the assigned bucket.
    Committed,
}

/// One entry per distinct content digest the directory has seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationEntry {
    pub digest: ContentDigest,
    pub bucket: BucketId,
    pub size: u64,
    pub state: AllocationState,
    /// The user whose allocate created this entry (and holds the quota
    /// charge while it is pending).
    pub owner: UserId,
    /// Every user whose quota has been charged for this digest. Starts as
    /// `{owner}`; deduplicated allocations by other users add to it, so a
    /// retried dedup allocate never charges twice.
    pub charged_users: HashSet<UserId>,
    pub lease_token: LeaseToken,
    /// Timestamp (ms) when the reservation lapses. `None` once committed.
    pub lease_expires: Option<u64>,
}

/// What `allocate` hands back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub bucket_id: BucketId,
    pub bucket_addr: String,
    pub digest: ContentDigest,
    pub size: u64,
    /// `None` when the content is already stored and no upload is needed.
    pub lease_token: Option<LeaseToken>,
    /// Lease expiry (ms). `None` when the content is already stored.
    pub expires_at: Option<u64>,
    pub already_stored: bool,
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
