//! Index Directory Core
//!
//! The authoritative node state: digest -> bucket assignments, per-bucket
//! capacity accounting and per-user quotas, plus the lease lifecycle that
//! keeps abandoned uploads from pinning capacity forever.
//!
//! ## Concurrency
//! All tables live behind a single async mutex. Every operation runs as one
//! critical section against them, so multi-step accounting (reserve bucket
//! bytes + charge user quota + create entry) is atomic by construction and
//! the `reserved + committed <= capacity` invariant holds between any two
//! operations. Cross-node callers retry freely: allocate is idempotent for
//! pending and committed digests, and finalize of an already-settled lease
//! fails with `NotFound` instead of double-crediting.

use super::error::DirectoryError;
use super::selection;
use super::types::*;
use crate::digest::ContentDigest;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Buckets that have not heartbeated within this window are skipped by the
/// selection policy.
pub const BUCKET_OFFLINE_TIMEOUT: Duration = Duration::from_secs(15);

/// The directory node.
pub struct Directory {
    data: Mutex<DirectoryData>,
    lease_timeout: Duration,
}

/// The serializable state: this is what a snapshot persists across a node
/// upgrade, so no in-flight allocation is lost over a code swap.
#[derive(Default, Clone, Serialize, Deserialize)]
pub struct DirectoryData {
    users: HashMap<UserId, UserAccount>,
    buckets: BTreeMap<BucketId, BucketRecord>,
    allocations: HashMap<ContentDigest, AllocationEntry>,
    /// Side table for finalize lookup by token.
    leases: HashMap<LeaseToken, ContentDigest>,
}

impl Directory {
    pub fn new(lease_timeout: Duration) -> Self {
        Self::restore(DirectoryData::default(), lease_timeout)
    }

    /// Rebuilds a directory from snapshotted state. Restored buckets stay
    /// offline for selection until their first heartbeat.
    pub fn restore(data: DirectoryData, lease_timeout: Duration) -> Self {
        Self {
            data: Mutex::new(data),
            lease_timeout,
        }
    }

    /// Clones the current state for snapshotting.
    pub async fn snapshot(&self) -> DirectoryData {
        self.data.lock().await.clone()
    }

    pub async fn add_user(&self, user_id: UserId, byte_limit: u64) -> Result<(), DirectoryError> {
        let mut data = self.data.lock().await;

        if data.users.contains_key(&user_id) {
            return Err(DirectoryError::UserAlreadyExists);
        }

        data.users.insert(
            user_id.clone(),
            UserAccount {
                byte_limit,
                bytes_used: 0,
            },
        );

        tracing::info!("Added user {:?} with byte limit {}", user_id, byte_limit);
        Ok(())
    }

    pub async fn get_user(&self, user_id: &UserId) -> Option<UserAccount> {
        self.data.lock().await.users.get(user_id).cloned()
    }

    /// Idempotent upsert called by a bucket node at startup.
    ///
    /// Re-registration after a restart or upgrade refreshes address, capacity
    /// and version but never resets the directory's accounting for the
    /// bucket.
    pub async fn register_bucket(&self, id: BucketId, addr: String, capacity: u64, version: String) {
        let mut data = self.data.lock().await;

        match data.buckets.get_mut(&id) {
            Some(bucket) => {
                if capacity < bucket.reserved + bucket.committed {
                    tracing::warn!(
                        "Bucket {:?} re-registered with capacity {} below {} already accounted; keeping {}",
                        id,
                        capacity,
                        bucket.reserved + bucket.committed,
                        bucket.capacity
                    );
                } else {
                    bucket.capacity = capacity;
                }
                bucket.addr = addr;
                bucket.version = version;
                bucket.last_seen = Some(Instant::now());
                tracing::info!("Bucket {:?} re-registered", id);
            }
            None => {
                tracing::info!("Bucket {:?} registered at {} (capacity {})", id, addr, capacity);
                data.buckets.insert(
                    id.clone(),
                    BucketRecord {
                        id,
                        addr,
                        capacity,
                        reserved: 0,
                        committed: 0,
                        version,
                        last_seen: Some(Instant::now()),
                    },
                );
            }
        }
    }

    /// Liveness signal from a bucket node. Returns false for unknown buckets,
    /// which tells the bucket to re-register.
    pub async fn heartbeat(&self, id: &BucketId, version: String) -> bool {
        let mut data = self.data.lock().await;

        if let Some(bucket) = data.buckets.get_mut(id) {
            bucket.last_seen = Some(Instant::now());
            bucket.version = version;
            true
        } else {
            false
        }
    }

    pub async fn list_buckets(&self) -> Vec<BucketRecord> {
        self.data.lock().await.buckets.values().cloned().collect()
    }

    /// Resolves the bucket holding a committed digest, for readers.
    pub async fn locate(&self, digest: &ContentDigest) -> Option<(BucketId, String)> {
        let data = self.data.lock().await;

        let entry = data.allocations.get(digest)?;
        if entry.state != AllocationState::Committed {
            return None;
        }
        let addr = data.buckets.get(&entry.bucket).map(|b| b.addr.clone())?;
        Some((entry.bucket.clone(), addr))
    }

    /// Assigns (or re-resolves) storage for one digest.
    ///
    /// Committed digest: returns the existing location with
    /// `already_stored = true`, charging the requesting user's logical quota
    /// at most once per digest. Pending digest: returns the in-flight
    /// assignment unchanged, so retries never double-reserve. Otherwise a
    /// fresh reservation is made against the bucket with the most free
    /// capacity.
    pub async fn allocate(
        &self,
        user_id: &UserId,
        digest: ContentDigest,
        size: u64,
    ) -> Result<Assignment, DirectoryError> {
        let now = now_ms();
        let mut data = self.data.lock().await;

        // Stale reservations must never starve capacity, so expired leases
        // are swept before every allocation pass.
        Self::reclaim_locked(&mut data, now);

        if !data.users.contains_key(user_id) {
            return Err(DirectoryError::UserNotFound);
        }

        // Copy the existing entry's facts out so the tables are free to
        // mutate below.
        let existing = data.allocations.get(&digest).map(|entry| {
            (
                entry.state.clone(),
                entry.bucket.clone(),
                entry.size,
                entry.charged_users.contains(user_id),
                entry.lease_token.clone(),
                entry.lease_expires,
            )
        });

        if let Some((state, bucket_id, entry_size, already_charged, lease_token, lease_expires)) =
            existing
        {
            let bucket_addr = data
                .buckets
                .get(&bucket_id)
                .map(|b| b.addr.clone())
                .unwrap_or_default();

            match state {
                AllocationState::Committed => {
                    if !already_charged {
                        let Some(account) = data.users.get_mut(user_id) else {
                            return Err(DirectoryError::UserNotFound);
                        };
                        if account.bytes_used + entry_size > account.byte_limit {
                            return Err(DirectoryError::QuotaExceeded {
                                byte_limit: account.byte_limit,
                                bytes_used: account.bytes_used,
                                requested: entry_size,
                            });
                        }
                        account.bytes_used += entry_size;
                        if let Some(entry) = data.allocations.get_mut(&digest) {
                            entry.charged_users.insert(user_id.clone());
                        }
                    }

                    tracing::debug!("Digest {} already stored on bucket {:?}", digest, bucket_id);
                    return Ok(Assignment {
                        bucket_id,
                        bucket_addr,
                        digest,
                        size: entry_size,
                        lease_token: None,
                        expires_at: None,
                        already_stored: true,
                    });
                }
                AllocationState::Pending => {
                    // Still within its lease (expired ones were just swept):
                    // hand back the same reservation.
                    tracing::debug!("Digest {} has an in-flight reservation", digest);
                    return Ok(Assignment {
                        bucket_id,
                        bucket_addr,
                        digest,
                        size: entry_size,
                        lease_token: Some(lease_token),
                        expires_at: lease_expires,
                        already_stored: false,
                    });
                }
            }
        }

        // Fresh reservation. Quota is checked before any mutation so a
        // rejection leaves every table untouched.
        let Some(account) = data.users.get(user_id) else {
            return Err(DirectoryError::UserNotFound);
        };
        if account.bytes_used + size > account.byte_limit {
            return Err(DirectoryError::QuotaExceeded {
                byte_limit: account.byte_limit,
                bytes_used: account.bytes_used,
                requested: size,
            });
        }

        let Some(bucket_id) = selection::select_bucket(&data.buckets, size, BUCKET_OFFLINE_TIMEOUT)
        else {
            return Err(DirectoryError::CapacityExceeded { requested: size });
        };

        let lease_token = LeaseToken::new();
        let expires_at = now + self.lease_timeout.as_millis() as u64;

        let Some(bucket) = data.buckets.get_mut(&bucket_id) else {
            return Err(DirectoryError::CapacityExceeded { requested: size });
        };
        bucket.reserved += size;
        let bucket_addr = bucket.addr.clone();

        if let Some(account) = data.users.get_mut(user_id) {
            account.bytes_used += size;
        }

        data.allocations.insert(
            digest,
            AllocationEntry {
                digest,
                bucket: bucket_id.clone(),
                size,
                state: AllocationState::Pending,
                owner: user_id.clone(),
                charged_users: HashSet::from([user_id.clone()]),
                lease_token: lease_token.clone(),
                lease_expires: Some(expires_at),
            },
        );
        data.leases.insert(lease_token.clone(), digest);

        tracing::info!(
            "Reserved {} bytes on bucket {:?} for digest {} (lease {})",
            size,
            bucket_id,
            digest,
            lease_token.0
        );

        Ok(Assignment {
            bucket_id,
            bucket_addr,
            digest,
            size,
            lease_token: Some(lease_token),
            expires_at: Some(expires_at),
            already_stored: false,
        })
    }

    /// Settles a pending reservation with the bucket's verification verdict.
    ///
    /// `verified = false` rolls everything back and fails with `HashMismatch`.
    /// A lease that lapsed but has not been swept yet is reclaimed here and
    /// reported as `LeaseExpired`; anything else that does not line up with a
    /// live pending entry is `NotFound` (benign for late or duplicate
    /// signals).
    pub async fn finalize(
        &self,
        lease_token: &LeaseToken,
        digest: ContentDigest,
        size: u64,
        verified: bool,
    ) -> Result<(), DirectoryError> {
        let now = now_ms();
        let mut data = self.data.lock().await;

        match data.leases.get(lease_token) {
            Some(d) if *d == digest => {}
            _ => return Err(DirectoryError::NotFound),
        }

        let expired = {
            let Some(entry) = data.allocations.get(&digest) else {
                return Err(DirectoryError::NotFound);
            };
            if entry.state != AllocationState::Pending
                || entry.lease_token != *lease_token
                || entry.size != size
            {
                return Err(DirectoryError::NotFound);
            }
            entry.lease_expires.map(|at| now >= at).unwrap_or(false)
        };

        if expired {
            tracing::warn!("Finalize for digest {} arrived after lease expiry", digest);
            Self::release_pending(&mut data, &digest);
            return Err(DirectoryError::LeaseExpired);
        }

        if !verified {
            tracing::warn!("Upload for digest {} failed verification, rolling back", digest);
            Self::release_pending(&mut data, &digest);
            return Err(DirectoryError::HashMismatch);
        }

        let Some(entry) = data.allocations.get_mut(&digest) else {
            return Err(DirectoryError::NotFound);
        };
        entry.state = AllocationState::Committed;
        entry.lease_expires = None;
        let bucket_id = entry.bucket.clone();
        let entry_size = entry.size;

        if let Some(bucket) = data.buckets.get_mut(&bucket_id) {
            bucket.reserved = bucket.reserved.saturating_sub(entry_size);
            bucket.committed += entry_size;
        }
        data.leases.remove(lease_token);

        tracing::info!("Committed {} bytes for digest {} on bucket {:?}", entry_size, digest, bucket_id);
        Ok(())
    }

    /// Sweeps pending entries whose lease has lapsed, returning reserved
    /// bytes to their buckets and quota holds to their owners. Runs in the
    /// background loop, before every allocate, and on demand.
    pub async fn reclaim_expired(&self) -> usize {
        let now = now_ms();
        let mut data = self.data.lock().await;
        Self::reclaim_locked(&mut data, now)
    }

    fn reclaim_locked(data: &mut DirectoryData, now: u64) -> usize {
        let expired: Vec<ContentDigest> = data
            .allocations
            .iter()
            .filter(|(_, entry)| {
                entry.state == AllocationState::Pending
                    && entry.lease_expires.map(|at| now >= at).unwrap_or(false)
            })
            .map(|(digest, _)| *digest)
            .collect();

        for digest in &expired {
            tracing::info!("Reclaiming expired lease for digest {}", digest);
            Self::release_pending(data, digest);
        }

        expired.len()
    }

    /// Drops a pending entry and undoes its accounting: bucket reservation,
    /// quota holds, lease token.
    fn release_pending(data: &mut DirectoryData, digest: &ContentDigest) {
        if let Some(entry) = data.allocations.remove(digest) {
            if let Some(bucket) = data.buckets.get_mut(&entry.bucket) {
                bucket.reserved = bucket.reserved.saturating_sub(entry.size);
            }
            for user in &entry.charged_users {
                if let Some(account) = data.users.get_mut(user) {
                    account.bytes_used = account.bytes_used.saturating_sub(entry.size);
                }
            }
            data.leases.remove(&entry.lease_token);
        }
    }
}
