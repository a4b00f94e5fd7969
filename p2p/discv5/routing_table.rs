//! The Kademlia routing table, per spec §4.5.
//!
//! `num_buckets = 256` buckets; bucket `i` holds node-ids at log-distance `i + 1` from
//! the local node-id. Each bucket is an LRU sequence of at most `k` entries (head = most
//! recently seen) with a parallel replacement cache of the same shape, fed whenever the
//! bucket itself is full.

use ethereum_types::H256;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::time::Instant;

use crate::utils::{bucket_index, log_distance};

/// `k` in the Kademlia literature: max live entries (and max replacement-cache entries)
/// per bucket.
pub const BUCKET_SIZE: usize = 16;
pub const NUM_BUCKETS: usize = 256;

#[derive(Debug, Clone)]
struct Bucket {
    /// Head = most recently updated.
    entries: VecDeque<H256>,
    replacements: VecDeque<H256>,
    /// When this bucket last saw any liveness activity (insert, MRU touch, or
    /// replacement-cache push). Used to find the globally stalest bucket.
    last_touched: Instant,
}

impl Default for Bucket {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            replacements: VecDeque::new(),
            last_touched: Instant::now(),
        }
    }
}

/// The result of inserting or refreshing a node-id in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The node-id is now the bucket's head; nothing was evicted.
    Inserted,
    /// The bucket is full; `node_id` was pushed to the replacement cache instead, and the
    /// bucket's current tail is returned as a liveness-check candidate.
    BucketFull { stale_candidate: H256 },
}

/// The Kademlia table described in spec §4.5: 256 LRU buckets plus replacement caches,
/// keyed by log-distance from `local_node_id`.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    local_node_id: H256,
    buckets: Vec<Bucket>,
    members: FxHashSet<H256>,
}

impl RoutingTable {
    pub fn new(local_node_id: H256) -> Self {
        Self {
            local_node_id,
            buckets: vec![Bucket::default(); NUM_BUCKETS],
            members: FxHashSet::default(),
        }
    }

    pub fn local_node_id(&self) -> H256 {
        self.local_node_id
    }

    fn bucket_for(&self, node_id: &H256) -> Option<usize> {
        let distance = log_distance(&self.local_node_id, node_id);
        (distance > 0).then(|| bucket_index(distance))
    }

    /// Inserts or refreshes `node_id`. Ignored (returns `None`) if `node_id == local`.
    ///
    /// - Already present: moved to the bucket head (MRU), returns `Inserted`.
    /// - Bucket has room: pushed to the head, returns `Inserted`.
    /// - Bucket full: pushed to the replacement cache head, returns `BucketFull` carrying
    ///   the bucket's current tail — the liveness loop's cue to ping it.
    pub fn update(&mut self, node_id: H256) -> Option<UpdateOutcome> {
        let idx = self.bucket_for(&node_id)?;
        let bucket = &mut self.buckets[idx];
        bucket.last_touched = Instant::now();

        if let Some(pos) = bucket.entries.iter().position(|id| *id == node_id) {
            bucket.entries.remove(pos);
            bucket.entries.push_front(node_id);
            return Some(UpdateOutcome::Inserted);
        }

        if bucket.entries.len() < BUCKET_SIZE {
            bucket.entries.push_front(node_id);
            self.members.insert(node_id);
            remove_from_replacements(bucket, &node_id);
            return Some(UpdateOutcome::Inserted);
        }

        if let Some(pos) = bucket.replacements.iter().position(|id| *id == node_id) {
            bucket.replacements.remove(pos);
        }
        bucket.replacements.push_front(node_id);
        if bucket.replacements.len() > BUCKET_SIZE {
            bucket.replacements.pop_back();
        }
        let stale_candidate = *bucket
            .entries
            .back()
            .expect("bucket reported full, so it has a tail");
        Some(UpdateOutcome::BucketFull { stale_candidate })
    }

    /// Removes `node_id` from its bucket. If the bucket's replacement cache is
    /// non-empty, its head is promoted into the vacated bucket tail.
    pub fn remove(&mut self, node_id: &H256) {
        let Some(idx) = self.bucket_for(node_id) else {
            return;
        };
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.entries.iter().position(|id| id == node_id) else {
            return;
        };
        bucket.entries.remove(pos);
        bucket.last_touched = Instant::now();
        self.members.remove(node_id);
        if let Some(promoted) = bucket.replacements.pop_front() {
            bucket.entries.push_back(promoted);
            self.members.insert(promoted);
        }
    }

    pub fn contains(&self, node_id: &H256) -> bool {
        self.members.contains(node_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// All node-ids at the given log-distance (`1..=256`), head-first (most recent
    /// first). Used to answer FIND_NODES.
    pub fn nodes_at_distance(&self, distance: u16) -> Vec<H256> {
        if distance == 0 || distance > NUM_BUCKETS as u16 {
            return vec![];
        }
        self.buckets[bucket_index(distance)]
            .entries
            .iter()
            .copied()
            .collect()
    }

    /// Every entry in the table, ordered by increasing XOR distance to `reference`.
    pub fn iter_nodes_around(&self, reference: &H256) -> Vec<H256> {
        let mut all: Vec<H256> = self.buckets.iter().flat_map(|b| b.entries.iter().copied()).collect();
        all.sort_by_key(|id| xor_distance(reference, id));
        all
    }

    /// Every entry in the table, each exactly once, in an arbitrary (insertion-biased)
    /// order — "random" in the sense of not being distance- or recency-ordered. Callers
    /// needing cryptographic randomness should shuffle the result themselves.
    pub fn iter_all_random(&self) -> Vec<H256> {
        self.buckets.iter().flat_map(|b| b.entries.iter().copied()).collect()
    }

    /// The log-distance of the globally oldest non-empty bucket's tail, i.e. the
    /// liveness loop's next ping candidate. `None` if the table is empty.
    pub fn least_recently_updated(&self) -> Option<(u16, H256)> {
        self.buckets
            .iter()
            .enumerate()
            .filter_map(|(idx, bucket)| bucket.entries.back().map(|tail| (idx, bucket.last_touched, tail)))
            .min_by_key(|(_, last_touched, _)| *last_touched)
            .map(|(idx, _, tail)| ((idx + 1) as u16, tail))
    }
}

fn remove_from_replacements(bucket: &mut Bucket, node_id: &H256) {
    if let Some(pos) = bucket.replacements.iter().position(|id| id == node_id) {
        bucket.replacements.remove(pos);
    }
}

fn xor_distance(a: &H256, b: &H256) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte0: u8) -> H256 {
        let mut bytes = [0u8; 32];
        bytes[0] = byte0;
        H256::from(bytes)
    }

    #[test]
    fn update_twice_leaves_single_entry_at_head() {
        let mut table = RoutingTable::new(H256::zero());
        let n = id(0x80); // distance 256 from zero -> bucket 255
        assert_eq!(table.update(n), Some(UpdateOutcome::Inserted));
        assert_eq!(table.update(n), Some(UpdateOutcome::Inserted));
        let nodes = table.nodes_at_distance(256);
        assert_eq!(nodes, vec![n]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn self_update_is_ignored() {
        let local = id(0x01);
        let mut table = RoutingTable::new(local);
        assert_eq!(table.update(local), None);
        assert!(table.is_empty());
    }

    #[test]
    fn bucket_overflow_routes_to_replacement_cache() {
        let local = H256::zero();
        let mut table = RoutingTable::new(local);

        // 16 distinct node-ids, all at log-distance 256 (top bit set, rest varies).
        let mut filled = vec![];
        for i in 0..BUCKET_SIZE {
            let mut bytes = [0u8; 32];
            bytes[0] = 0x80;
            bytes[31] = i as u8;
            let n = H256::from(bytes);
            filled.push(n);
            assert_eq!(table.update(n), Some(UpdateOutcome::Inserted));
        }
        let original_tail = *filled.first().unwrap(); // pushed first -> now at the tail

        let mut overflow_bytes = [0u8; 32];
        overflow_bytes[0] = 0x80;
        overflow_bytes[31] = 0xff;
        let overflow = H256::from(overflow_bytes);

        match table.update(overflow) {
            Some(UpdateOutcome::BucketFull { stale_candidate }) => {
                assert_eq!(stale_candidate, original_tail);
            }
            other => panic!("expected BucketFull, got {other:?}"),
        }
        assert_eq!(table.nodes_at_distance(256).len(), BUCKET_SIZE);
        assert!(!table.contains(&overflow));
    }

    #[test]
    fn remove_promotes_replacement_cache_head() {
        let local = H256::zero();
        let mut table = RoutingTable::new(local);
        let mut filled = vec![];
        for i in 0..BUCKET_SIZE {
            let mut bytes = [0u8; 32];
            bytes[0] = 0x80;
            bytes[31] = i as u8;
            let n = H256::from(bytes);
            filled.push(n);
            table.update(n);
        }
        let mut repl_bytes = [0u8; 32];
        repl_bytes[0] = 0x80;
        repl_bytes[31] = 0xee;
        let replacement = H256::from(repl_bytes);
        table.update(replacement);

        let to_remove = filled[5];
        table.remove(&to_remove);
        assert!(!table.contains(&to_remove));
        assert!(table.contains(&replacement));
        assert_eq!(table.nodes_at_distance(256).len(), BUCKET_SIZE);
    }

    #[test]
    fn least_recently_updated_tracks_global_tail() {
        let local = H256::zero();
        let mut table = RoutingTable::new(local);
        let a = id(0x80);
        let mut b_bytes = [0u8; 32];
        b_bytes[0] = 0x40; // distance 255 -> bucket 254
        let b = H256::from(b_bytes);
        table.update(a);
        table.update(b);
        // `a`'s bucket was touched first, so it is globally stalest despite bucket 254
        // (holding `b`) having a lower array index.
        assert_eq!(table.least_recently_updated(), Some((256, a)));
    }

    #[test]
    fn iter_nodes_around_orders_by_xor_distance() {
        let local = H256::zero();
        let mut table = RoutingTable::new(local);
        let far = id(0x80);
        let near = id(0x01);
        table.update(far);
        table.update(near);
        let ordered = table.iter_nodes_around(&local);
        assert_eq!(ordered, vec![near, far]);
    }
}
