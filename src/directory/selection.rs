use super::types::{BucketId, BucketRecord};
use std::collections::BTreeMap;
use std::time::Duration;

/// Picks the bucket a new reservation goes to.
///
/// Policy: among online buckets whose free capacity (capacity - reserved -
/// committed) is at least `size`, choose the one with the most free capacity.
/// Ties break towards the lowest bucket id, so repeated runs over the same
/// state are deterministic.
pub fn select_bucket(
    buckets: &BTreeMap<BucketId, BucketRecord>,
    size: u64,
    online_within: Duration,
) -> Option<BucketId> {
    let mut best: Option<(&BucketId, u64)> = None;

    // BTreeMap iterates in id order, so keeping only strictly-better
    // candidates leaves the lowest id as the winner on ties.
    for (id, bucket) in buckets.iter() {
        if !bucket.is_online(online_within) {
            continue;
        }
        let free = bucket.free();
        if free < size {
            continue;
        }
        match best {
            Some((_, best_free)) if best_free >= free => {}
            _ => best = Some((id, free)),
        }
    }

    best.map(|(id, _)| id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn bucket(id: &str, capacity: u64, reserved: u64, committed: u64) -> BucketRecord {
        BucketRecord {
            id: BucketId(id.to_string()),
            addr: format!("127.0.0.1:0/{}", id),
            capacity,
            reserved,
            committed,
            version: "0.1.0".to_string(),
            last_seen: Some(Instant::now()),
        }
    }

    fn map(records: Vec<BucketRecord>) -> BTreeMap<BucketId, BucketRecord> {
        records.into_iter().map(|b| (b.id.clone(), b)).collect()
    }

    const ONLINE: Duration = Duration::from_secs(60);

    #[test]
    fn picks_most_free_capacity() {
        let buckets = map(vec![
            bucket("a", 1000, 200, 300), // free 500
            bucket("b", 1000, 0, 100),   // free 900
        ]);

        let chosen = select_bucket(&buckets, 100, ONLINE).unwrap();
        assert_eq!(chosen.0, "b");
    }

    #[test]
    fn ties_break_to_lowest_id() {
        let buckets = map(vec![
            bucket("c", 1000, 0, 500),
            bucket("a", 1000, 0, 500),
            bucket("b", 1000, 0, 500),
        ]);

        let chosen = select_bucket(&buckets, 100, ONLINE).unwrap();
        assert_eq!(chosen.0, "a");
    }

    #[test]
    fn skips_buckets_without_room() {
        let buckets = map(vec![
            bucket("a", 1000, 600, 0), // free 400
            bucket("b", 1000, 0, 700), // free 300
        ]);

        let chosen = select_bucket(&buckets, 350, ONLINE).unwrap();
        assert_eq!(chosen.0, "a");

        assert!(select_bucket(&buckets, 500, ONLINE).is_none());
    }

    #[test]
    fn skips_offline_buckets() {
        let mut stale = bucket("a", 1000, 0, 0);
        stale.last_seen = None;
        let buckets = map(vec![stale, bucket("b", 500, 0, 0)]);

        let chosen = select_bucket(&buckets, 100, ONLINE).unwrap();
        assert_eq!(chosen.0, "b");
    }

    #[test]
    fn exact_fit_qualifies() {
        let buckets = map(vec![bucket("a", 1000, 400, 100)]); // free 500

        assert!(select_bucket(&buckets, 500, ONLINE).is_some());
        assert!(select_bucket(&buckets, 501, ONLINE).is_none());
    }
}
