//! Directory Module Tests
//!
//! Validates the allocation protocol against the directory's own tables:
//! idempotent retries, deduplication, capacity and quota accounting, lease
//! expiry reclaim, and rollback on failed verification.
//!
//! *Note: everything here drives the `Directory` directly; the HTTP layer on
//! top of it is exercised end-to-end in the client module's tests.*

#[cfg(test)]
mod tests {
    use crate::digest::{ContentDigest, digest_bytes};
    use crate::directory::error::DirectoryError;
    use crate::directory::index::Directory;
    use crate::directory::types::{BucketId, LeaseToken, UserId};
    use std::time::Duration;

    const LEASE: Duration = Duration::from_secs(300);

    fn user(name: &str) -> UserId {
        UserId(name.to_string())
    }

    fn digest(label: &str) -> ContentDigest {
        digest_bytes(label.as_bytes())
    }

    async fn directory_with_bucket(capacity: u64) -> Directory {
        let directory = Directory::new(LEASE);
        directory
            .register_bucket(
                BucketId("bucket-1".to_string()),
                "127.0.0.1:7101".to_string(),
                capacity,
                "0.1.0".to_string(),
            )
            .await;
        directory
    }

    async fn bucket_state(directory: &Directory, id: &str) -> (u64, u64) {
        let bucket = directory
            .list_buckets()
            .await
            .into_iter()
            .find(|b| b.id.0 == id)
            .expect("bucket should be registered");
        (bucket.reserved, bucket.committed)
    }

    // ============================================================
    // ALLOCATE
    // ============================================================

    #[tokio::test]
    async fn test_allocate_rejects_unknown_user() {
        let directory = directory_with_bucket(1000).await;

        let result = directory.allocate(&user("ghost"), digest("a"), 100).await;
        assert_eq!(result.unwrap_err(), DirectoryError::UserNotFound);
    }

    #[tokio::test]
    async fn test_allocate_reserves_capacity_and_quota() {
        let directory = directory_with_bucket(1000).await;
        directory.add_user(user("u1"), 10_000).await.unwrap();

        let assignment = directory
            .allocate(&user("u1"), digest("a"), 600)
            .await
            .unwrap();

        assert!(!assignment.already_stored);
        assert!(assignment.lease_token.is_some());
        assert_eq!(assignment.bucket_id.0, "bucket-1");
        assert_eq!(assignment.bucket_addr, "127.0.0.1:7101");

        assert_eq!(bucket_state(&directory, "bucket-1").await, (600, 0));
        assert_eq!(directory.get_user(&user("u1")).await.unwrap().bytes_used, 600);
    }

    #[tokio::test]
    async fn test_allocate_without_buckets_is_capacity_exceeded() {
        let directory = Directory::new(LEASE);
        directory.add_user(user("u1"), 10_000).await.unwrap();

        let result = directory.allocate(&user("u1"), digest("a"), 100).await;
        assert_eq!(
            result.unwrap_err(),
            DirectoryError::CapacityExceeded { requested: 100 }
        );
    }

    #[tokio::test]
    async fn test_allocate_prefers_most_free_bucket() {
        let directory = directory_with_bucket(1000).await;
        directory
            .register_bucket(
                BucketId("bucket-2".to_string()),
                "127.0.0.1:7102".to_string(),
                5000,
                "0.1.0".to_string(),
            )
            .await;
        directory.add_user(user("u1"), 100_000).await.unwrap();

        let assignment = directory
            .allocate(&user("u1"), digest("a"), 100)
            .await
            .unwrap();
        assert_eq!(assignment.bucket_id.0, "bucket-2");
    }

    // ============================================================
    // IDEMPOTENT RETRY (pending digest)
    // ============================================================

    #[tokio::test]
    async fn test_allocate_twice_returns_same_reservation() {
        let directory = directory_with_bucket(1000).await;
        directory.add_user(user("u1"), 10_000).await.unwrap();

        let first = directory
            .allocate(&user("u1"), digest("a"), 400)
            .await
            .unwrap();
        let second = directory
            .allocate(&user("u1"), digest("a"), 400)
            .await
            .unwrap();

        assert_eq!(first.lease_token, second.lease_token);
        assert_eq!(first.expires_at, second.expires_at);
        assert_eq!(first.bucket_id, second.bucket_id);

        // No double reservation, no double quota charge.
        assert_eq!(bucket_state(&directory, "bucket-1").await, (400, 0));
        assert_eq!(directory.get_user(&user("u1")).await.unwrap().bytes_used, 400);
    }

    #[tokio::test]
    async fn test_pending_digest_shared_with_second_user() {
        let directory = directory_with_bucket(1000).await;
        directory.add_user(user("u1"), 10_000).await.unwrap();
        directory.add_user(user("u2"), 10_000).await.unwrap();

        let first = directory
            .allocate(&user("u1"), digest("a"), 400)
            .await
            .unwrap();
        let second = directory
            .allocate(&user("u2"), digest("a"), 400)
            .await
            .unwrap();

        // The in-flight reservation is handed back as-is; only the creator
        // holds a quota charge while it is pending.
        assert_eq!(first.lease_token, second.lease_token);
        assert_eq!(directory.get_user(&user("u2")).await.unwrap().bytes_used, 0);
    }

    // ============================================================
    // FINALIZE & DEDUP
    // ============================================================

    #[tokio::test]
    async fn test_finalize_commits_reservation() {
        let directory = directory_with_bucket(1000).await;
        directory.add_user(user("u1"), 10_000).await.unwrap();

        let assignment = directory
            .allocate(&user("u1"), digest("a"), 600)
            .await
            .unwrap();
        let token = assignment.lease_token.unwrap();

        directory
            .finalize(&token, digest("a"), 600, true)
            .await
            .unwrap();

        assert_eq!(bucket_state(&directory, "bucket-1").await, (0, 600));
        let located = directory.locate(&digest("a")).await.unwrap();
        assert_eq!(located.0 .0, "bucket-1");
    }

    #[tokio::test]
    async fn test_dedup_second_user_same_bucket_no_second_copy() {
        let directory = directory_with_bucket(1000).await;
        directory.add_user(user("u1"), 10_000).await.unwrap();
        directory.add_user(user("u2"), 10_000).await.unwrap();

        let assignment = directory
            .allocate(&user("u1"), digest("a"), 100)
            .await
            .unwrap();
        directory
            .finalize(&assignment.lease_token.unwrap(), digest("a"), 100, true)
            .await
            .unwrap();

        let dedup = directory
            .allocate(&user("u2"), digest("a"), 100)
            .await
            .unwrap();

        assert!(dedup.already_stored);
        assert!(dedup.lease_token.is_none());
        assert_eq!(dedup.bucket_id.0, "bucket-1");

        // Physical accounting unchanged, logical quota charged to u2.
        assert_eq!(bucket_state(&directory, "bucket-1").await, (0, 100));
        assert_eq!(directory.get_user(&user("u2")).await.unwrap().bytes_used, 100);
    }

    #[tokio::test]
    async fn test_dedup_same_user_charged_once() {
        let directory = directory_with_bucket(1000).await;
        directory.add_user(user("u1"), 10_000).await.unwrap();

        let assignment = directory
            .allocate(&user("u1"), digest("a"), 100)
            .await
            .unwrap();
        directory
            .finalize(&assignment.lease_token.unwrap(), digest("a"), 100, true)
            .await
            .unwrap();

        for _ in 0..3 {
            let dedup = directory
                .allocate(&user("u1"), digest("a"), 100)
                .await
                .unwrap();
            assert!(dedup.already_stored);
        }

        assert_eq!(directory.get_user(&user("u1")).await.unwrap().bytes_used, 100);
    }

    #[tokio::test]
    async fn test_dedup_rejects_user_over_quota() {
        let directory = directory_with_bucket(1000).await;
        directory.add_user(user("u1"), 10_000).await.unwrap();
        directory.add_user(user("tiny"), 50).await.unwrap();

        let assignment = directory
            .allocate(&user("u1"), digest("a"), 100)
            .await
            .unwrap();
        directory
            .finalize(&assignment.lease_token.unwrap(), digest("a"), 100, true)
            .await
            .unwrap();

        let result = directory.allocate(&user("tiny"), digest("a"), 100).await;
        assert!(matches!(
            result.unwrap_err(),
            DirectoryError::QuotaExceeded { .. }
        ));
        assert_eq!(directory.get_user(&user("tiny")).await.unwrap().bytes_used, 0);
    }

    #[tokio::test]
    async fn test_finalize_unknown_token_not_found() {
        let directory = directory_with_bucket(1000).await;

        let result = directory
            .finalize(&LeaseToken::new(), digest("a"), 100, true)
            .await;
        assert_eq!(result.unwrap_err(), DirectoryError::NotFound);
    }

    #[tokio::test]
    async fn test_double_finalize_not_found() {
        let directory = directory_with_bucket(1000).await;
        directory.add_user(user("u1"), 10_000).await.unwrap();

        let assignment = directory
            .allocate(&user("u1"), digest("a"), 100)
            .await
            .unwrap();
        let token = assignment.lease_token.unwrap();

        directory
            .finalize(&token, digest("a"), 100, true)
            .await
            .unwrap();

        // Late or duplicate signal: benign failure, no double credit.
        let result = directory.finalize(&token, digest("a"), 100, true).await;
        assert_eq!(result.unwrap_err(), DirectoryError::NotFound);
        assert_eq!(bucket_state(&directory, "bucket-1").await, (0, 100));
    }

    #[tokio::test]
    async fn test_finalize_size_mismatch_not_found() {
        let directory = directory_with_bucket(1000).await;
        directory.add_user(user("u1"), 10_000).await.unwrap();

        let assignment = directory
            .allocate(&user("u1"), digest("a"), 100)
            .await
            .unwrap();
        let token = assignment.lease_token.unwrap();

        let result = directory.finalize(&token, digest("a"), 99, true).await;
        assert_eq!(result.unwrap_err(), DirectoryError::NotFound);

        // The reservation itself is untouched and can still settle.
        directory
            .finalize(&token, digest("a"), 100, true)
            .await
            .unwrap();
    }

    // ============================================================
    // MISMATCH ROLLBACK
    // ============================================================

    #[tokio::test]
    async fn test_failed_verification_rolls_back_fully() {
        let directory = directory_with_bucket(1000).await;
        directory.add_user(user("u1"), 10_000).await.unwrap();

        let assignment = directory
            .allocate(&user("u1"), digest("a"), 600)
            .await
            .unwrap();
        let token = assignment.lease_token.unwrap();

        let result = directory.finalize(&token, digest("a"), 600, false).await;
        assert_eq!(result.unwrap_err(), DirectoryError::HashMismatch);

        // Everything back to pre-allocate values, entry deleted.
        assert_eq!(bucket_state(&directory, "bucket-1").await, (0, 0));
        assert_eq!(directory.get_user(&user("u1")).await.unwrap().bytes_used, 0);
        assert!(directory.locate(&digest("a")).await.is_none());

        // The old lease is dead; a retry starts fresh with a new token.
        let retry = directory
            .allocate(&user("u1"), digest("a"), 600)
            .await
            .unwrap();
        assert_ne!(retry.lease_token.unwrap(), token);
    }

    // ============================================================
    // LEASE EXPIRY & RECLAIM
    // ============================================================

    #[tokio::test]
    async fn test_finalize_after_expiry_is_lease_expired() {
        let directory = Directory::new(Duration::ZERO);
        directory
            .register_bucket(
                BucketId("bucket-1".to_string()),
                "127.0.0.1:7101".to_string(),
                1000,
                "0.1.0".to_string(),
            )
            .await;
        directory.add_user(user("u1"), 10_000).await.unwrap();

        let assignment = directory
            .allocate(&user("u1"), digest("a"), 100)
            .await
            .unwrap();
        let token = assignment.lease_token.unwrap();

        // Entry still visible pending reclaim: distinguished from NotFound.
        let result = directory.finalize(&token, digest("a"), 100, true).await;
        assert_eq!(result.unwrap_err(), DirectoryError::LeaseExpired);

        // The expired entry was reclaimed on the way out.
        let result = directory.finalize(&token, digest("a"), 100, true).await;
        assert_eq!(result.unwrap_err(), DirectoryError::NotFound);
        assert_eq!(bucket_state(&directory, "bucket-1").await, (0, 0));
    }

    #[tokio::test]
    async fn test_reclaim_returns_capacity_and_quota() {
        let directory = Directory::new(Duration::ZERO);
        directory
            .register_bucket(
                BucketId("bucket-1".to_string()),
                "127.0.0.1:7101".to_string(),
                1000,
                "0.1.0".to_string(),
            )
            .await;
        directory.add_user(user("u1"), 10_000).await.unwrap();

        directory
            .allocate(&user("u1"), digest("a"), 700)
            .await
            .unwrap();

        let reclaimed = directory.reclaim_expired().await;
        assert_eq!(reclaimed, 1);
        assert_eq!(bucket_state(&directory, "bucket-1").await, (0, 0));
        assert_eq!(directory.get_user(&user("u1")).await.unwrap().bytes_used, 0);

        // The digest behaves as if never seen: a fresh reservation succeeds.
        let retry = directory
            .allocate(&user("u1"), digest("a"), 700)
            .await
            .unwrap();
        assert!(!retry.already_stored);
        assert_eq!(bucket_state(&directory, "bucket-1").await, (700, 0));
    }

    // ============================================================
    // CAPACITY & QUOTA SCENARIOS
    // ============================================================

    #[tokio::test]
    async fn test_capacity_fill_and_release_scenario() {
        let directory = directory_with_bucket(1000).await;
        directory.add_user(user("u1"), 100_000).await.unwrap();

        let a = directory
            .allocate(&user("u1"), digest("a"), 600)
            .await
            .unwrap();
        assert_eq!(bucket_state(&directory, "bucket-1").await, (600, 0));

        // Only 400 free: a 500-byte reservation must be refused.
        let refused = directory.allocate(&user("u1"), digest("b"), 500).await;
        assert_eq!(
            refused.unwrap_err(),
            DirectoryError::CapacityExceeded { requested: 500 }
        );

        directory
            .finalize(&a.lease_token.unwrap(), digest("a"), 600, true)
            .await
            .unwrap();
        assert_eq!(bucket_state(&directory, "bucket-1").await, (0, 600));

        // Still only 400 free; committed bytes hold their ground.
        let refused = directory.allocate(&user("u1"), digest("b"), 500).await;
        assert!(matches!(
            refused.unwrap_err(),
            DirectoryError::CapacityExceeded { .. }
        ));

        let b = directory
            .allocate(&user("u1"), digest("b"), 400)
            .await
            .unwrap();
        assert!(!b.already_stored);
        assert_eq!(bucket_state(&directory, "bucket-1").await, (400, 600));
    }

    #[tokio::test]
    async fn test_quota_exceeded_leaves_state_untouched() {
        let directory = directory_with_bucket(10_000).await;
        directory.add_user(user("u1"), 500).await.unwrap();

        let result = directory.allocate(&user("u1"), digest("a"), 600).await;
        assert_eq!(
            result.unwrap_err(),
            DirectoryError::QuotaExceeded {
                byte_limit: 500,
                bytes_used: 0,
                requested: 600,
            }
        );

        assert_eq!(bucket_state(&directory, "bucket-1").await, (0, 0));
        assert_eq!(directory.get_user(&user("u1")).await.unwrap().bytes_used, 0);
    }

    #[tokio::test]
    async fn test_capacity_invariant_over_mixed_sequence() {
        let directory = directory_with_bucket(1000).await;
        directory
            .register_bucket(
                BucketId("bucket-2".to_string()),
                "127.0.0.1:7102".to_string(),
                800,
                "0.1.0".to_string(),
            )
            .await;
        directory.add_user(user("u1"), 100_000).await.unwrap();

        let mut tokens = Vec::new();
        for i in 0..8 {
            if let Ok(assignment) = directory
                .allocate(&user("u1"), digest(&format!("blob-{}", i)), 300)
                .await
            {
                tokens.push((assignment.lease_token.unwrap(), assignment.digest));
            }

            for bucket in directory.list_buckets().await {
                assert!(
                    bucket.reserved + bucket.committed <= bucket.capacity,
                    "invariant violated on {:?}: {} + {} > {}",
                    bucket.id,
                    bucket.reserved,
                    bucket.committed,
                    bucket.capacity
                );
            }
        }

        // Settle half, fail the rest; invariant must survive both paths.
        for (i, (token, digest)) in tokens.into_iter().enumerate() {
            let verified = i % 2 == 0;
            let _ = directory.finalize(&token, digest, 300, verified).await;

            for bucket in directory.list_buckets().await {
                assert!(bucket.reserved + bucket.committed <= bucket.capacity);
            }
        }
    }

    // ============================================================
    // SNAPSHOT / RESTORE
    // ============================================================

    #[tokio::test]
    async fn test_snapshot_restore_preserves_state() {
        let directory = directory_with_bucket(1000).await;
        directory.add_user(user("u1"), 10_000).await.unwrap();

        let assignment = directory
            .allocate(&user("u1"), digest("a"), 250)
            .await
            .unwrap();
        directory
            .finalize(&assignment.lease_token.unwrap(), digest("a"), 250, true)
            .await
            .unwrap();

        let snapshot = directory.snapshot().await;
        let encoded = bincode::serialize(&snapshot).unwrap();
        let decoded = bincode::deserialize(&encoded).unwrap();
        let restored = Directory::restore(decoded, LEASE);

        // Accounts, assignments and accounting all survive the round trip.
        let account = restored.get_user(&user("u1")).await.unwrap();
        assert_eq!(account.bytes_used, 250);
        assert_eq!(restored.locate(&digest("a")).await.unwrap().0 .0, "bucket-1");
        assert_eq!(bucket_state(&restored, "bucket-1").await, (0, 250));

        // Restored buckets are offline until they heartbeat again.
        let refused = restored.allocate(&user("u1"), digest("b"), 100).await;
        assert!(matches!(
            refused.unwrap_err(),
            DirectoryError::CapacityExceeded { .. }
        ));

        restored
            .heartbeat(&BucketId("bucket-1".to_string()), "0.2.0".to_string())
            .await;
        let retry = restored.allocate(&user("u1"), digest("b"), 100).await;
        assert!(retry.is_ok());
    }
}
