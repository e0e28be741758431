use crate::digest::{ContentDigest, digest_bytes};
use crate::directory::types::{BucketId, LeaseToken, now_ms};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// The bucket node's object store.
///
/// Passive by design: it verifies uploaded bytes against their claimed digest
/// and persists them keyed by digest, but never touches the directory's
/// accounting. Identical content lands on the same key, so a second upload of
/// bytes the bucket already holds is a no-op.
pub struct BlobStore {
    id: BucketId,
    capacity: u64,
    blobs: DashMap<ContentDigest, Vec<u8>>,
    /// Advisory reservations announced by the directory. Purely bookkeeping:
    /// an upload is judged by its digest, with or without a reservation.
    pending: DashMap<LeaseToken, Reservation>,
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub digest: ContentDigest,
    pub size: u64,
    pub created_at: u64,
}

/// On-disk form of the store, written on graceful shutdown and loaded at
/// startup so a code upgrade never loses committed bytes. The stable bucket
/// id lives here too, so a restarted node re-registers as itself.
#[derive(Serialize, Deserialize)]
pub struct BlobStoreSnapshot {
    pub bucket_id: BucketId,
    pub blobs: Vec<BlobEntry>,
}

#[derive(Serialize, Deserialize)]
pub struct BlobEntry {
    pub digest: ContentDigest,
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

impl BlobStore {
    pub fn new(id: BucketId, capacity: u64) -> Self {
        Self {
            id,
            capacity,
            blobs: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    pub fn from_snapshot(snapshot: BlobStoreSnapshot, capacity: u64) -> Self {
        let store = Self::new(snapshot.bucket_id, capacity);
        for entry in snapshot.blobs {
            store.blobs.insert(entry.digest, entry.bytes);
        }
        store
    }

    pub fn snapshot(&self) -> BlobStoreSnapshot {
        BlobStoreSnapshot {
            bucket_id: self.id.clone(),
            blobs: self
                .blobs
                .iter()
                .map(|entry| BlobEntry {
                    digest: *entry.key(),
                    bytes: entry.value().clone(),
                })
                .collect(),
        }
    }

    pub fn id(&self) -> &BucketId {
        &self.id
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Records the directory's hint that bytes for this lease are incoming.
    pub fn reserve(&self, lease_token: LeaseToken, digest: ContentDigest, size: u64) {
        tracing::debug!("Reservation {} for digest {} ({} bytes)", lease_token.0, digest, size);
        self.pending.insert(
            lease_token,
            Reservation {
                digest,
                size,
                created_at: now_ms(),
            },
        );
    }

    /// Verifies and persists an upload. Returns the verification verdict the
    /// client forwards to the directory's finalize.
    pub fn upload(&self, lease_token: &LeaseToken, claimed: &ContentDigest, bytes: Vec<u8>) -> bool {
        let reserved_digest = self.pending.get(lease_token).map(|r| r.digest);
        if let Some(digest) = reserved_digest
            && digest != *claimed
        {
            tracing::warn!(
                "Upload for lease {} claims {} but the reservation was for {}",
                lease_token.0,
                claimed,
                digest
            );
            self.pending.remove(lease_token);
            return false;
        }

        let actual = digest_bytes(&bytes);
        if actual != *claimed {
            tracing::warn!("Upload for digest {} hashed to {}; discarding", claimed, actual);
            self.pending.remove(lease_token);
            return false;
        }

        let size = bytes.len();
        // Keyed by digest, first write wins: true dedup across uploaders.
        self.blobs.entry(*claimed).or_insert(bytes);
        self.pending.remove(lease_token);

        tracing::info!("Stored blob {} ({} bytes)", claimed, size);
        true
    }

    pub fn retrieve(&self, digest: &ContentDigest) -> Option<Vec<u8>> {
        self.blobs.get(digest).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, digest: &ContentDigest) -> bool {
        self.blobs.contains_key(digest)
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    pub fn bytes_used(&self) -> u64 {
        self.blobs.iter().map(|entry| entry.value().len() as u64).sum()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
