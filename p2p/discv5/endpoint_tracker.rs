//! Endpoint vote accumulation, per spec §4.7.
//!
//! A plain value type, not an actor: the routing-table manager owns one and feeds it
//! `(source_node_id, observed_endpoint)` pairs as PONGs arrive, the same way it owns the
//! [`crate::discv5::routing_table::RoutingTable`] directly rather than through another
//! actor hop.

use ethereum_types::H256;
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};

use crate::types::Endpoint;

/// How long a single vote stays live before it no longer counts toward the threshold.
/// Matches the liveness pinger's tick so a full revalidation pass can always produce a
/// decision one way or another.
pub const ENDPOINT_VOTE_WINDOW: Duration = Duration::from_secs(300);

/// Accumulates endpoint votes and reports a winner once `threshold` distinct peers agree
/// on the same `(ip, udp_port)` within `window`.
pub struct EndpointTracker {
    threshold: usize,
    window: Duration,
    votes: FxHashMap<Endpoint, FxHashMap<H256, Instant>>,
}

impl EndpointTracker {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold,
            window,
            votes: FxHashMap::default(),
        }
    }

    /// Records a vote for `endpoint` from `source`, pruning expired votes for it first.
    /// Returns `Some(endpoint)` the moment this vote brings it to `threshold` distinct
    /// voters; after that the caller is expected to act on it (and may call
    /// [`EndpointTracker::clear`] to avoid re-reporting the same winner every tick).
    pub fn record_vote(&mut self, source: H256, endpoint: Endpoint) -> Option<Endpoint> {
        let now = Instant::now();
        let voters = self.votes.entry(endpoint).or_default();
        voters.retain(|_, cast_at| now.duration_since(*cast_at) < self.window);
        voters.insert(source, now);

        if voters.len() >= self.threshold {
            Some(endpoint)
        } else {
            None
        }
    }

    /// Drops every recorded vote for `endpoint`, e.g. once it has been acted on.
    pub fn clear(&mut self, endpoint: &Endpoint) {
        self.votes.remove(endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new(IpAddr::from([203, 0, 113, 1]), port)
    }

    fn node(byte0: u8) -> H256 {
        let mut bytes = [0u8; 32];
        bytes[0] = byte0;
        H256::from(bytes)
    }

    #[test]
    fn threshold_reached_only_after_enough_distinct_voters() {
        let mut tracker = EndpointTracker::new(4, Duration::from_secs(60));
        let target = endpoint(30303);
        assert_eq!(tracker.record_vote(node(1), target), None);
        assert_eq!(tracker.record_vote(node(2), target), None);
        assert_eq!(tracker.record_vote(node(3), target), None);
        assert_eq!(tracker.record_vote(node(4), target), Some(target));
    }

    #[test]
    fn repeat_votes_from_the_same_source_do_not_count_twice() {
        let mut tracker = EndpointTracker::new(2, Duration::from_secs(60));
        let target = endpoint(30303);
        assert_eq!(tracker.record_vote(node(1), target), None);
        assert_eq!(tracker.record_vote(node(1), target), None);
        assert_eq!(tracker.record_vote(node(1), target), None);
    }

    #[test]
    fn votes_for_different_endpoints_do_not_mix() {
        let mut tracker = EndpointTracker::new(2, Duration::from_secs(60));
        assert_eq!(tracker.record_vote(node(1), endpoint(1)), None);
        assert_eq!(tracker.record_vote(node(2), endpoint(2)), None);
    }

    #[test]
    fn clear_resets_accumulated_votes() {
        let mut tracker = EndpointTracker::new(2, Duration::from_secs(60));
        let target = endpoint(30303);
        tracker.record_vote(node(1), target);
        tracker.record_vote(node(2), target);
        tracker.clear(&target);
        assert_eq!(tracker.record_vote(node(3), target), None);
    }
}
