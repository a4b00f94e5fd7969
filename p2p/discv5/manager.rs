//! The routing-table manager, per spec §4.6.
//!
//! Owns the Kademlia [`RoutingTable`], the [`EndpointTracker`], and a handle to the
//! local [`EnrManager`], and drives three cooperative jobs as one `GenServer` actor —
//! serializing every table mutation the same way `session_layer::SessionLayer`
//! serializes handshake state by being a single actor processing one cast at a time:
//!
//! - a jittered liveness pinger, revalidating the globally stalest bucket tail
//! - a jittered iterative discovery lookup toward a random target
//! - a server answering inbound PING and FIND_NODES requests
//!
//! Concrete shape (the jittered `send_after` self-rescheduling, the request-handler
//! subscriptions forwarded into the actor's mailbox by a plain owning task) follows the
//! teacher's own `discv5::server::DiscoveryServer`.

use ethereum_types::H256;
use rand::RngCore;
use rustc_hash::{FxHashMap, FxHashSet};
use spawned_concurrency::{
    messages::Unused,
    tasks::{CastResponse, GenServer, GenServerHandle, send_after},
};
use std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use tracing::{trace, warn};

use super::dispatcher::{Dispatcher, OutboundSink, RequestSubscription};
use super::endpoint_tracker::{EndpointTracker, ENDPOINT_VOTE_WINDOW};
use super::messages::{FindNode, Message, Nodes, Ping, Pong, FINDNODE_ID, MAX_NODES_MESSAGE_TOTAL, PING_ID};
use super::routing_table::RoutingTable;
use super::session_layer::{self, SessionLayer, SessionLayerSink};
use crate::config::DiscoveryConfig;
use crate::enr_manager::EnrManager;
use crate::enr_store::EnrStore;
use crate::error::{DiscoveryError, Result};
use crate::metrics::METRICS;
use crate::types::{Endpoint, Node, NodeRecord};
use crate::utils::log_distance;

/// Fractional jitter applied to [`DiscoveryConfig::routing_table_keep_alive`] so every
/// node in a swarm doesn't re-ping its stalest contact in lockstep.
const REVALIDATE_JITTER_FRACTION: f64 = 0.1;
/// How often a discovery lookup toward a random target is kicked off. Not named by the
/// protocol as a fixed constant; chosen to run noticeably more often than the liveness
/// pinger so the table fills in quickly after a cold start.
const LOOKUP_INTERVAL: Duration = Duration::from_secs(60);
const LOOKUP_JITTER_FRACTION: f64 = 0.1;
/// Bounds how many ENRs a single NODES fragment carries, mirroring the teacher's own
/// `MAX_ENRS_PER_MESSAGE` in `discv5/server.rs`.
const MAX_ENRS_PER_NODES_FRAGMENT: usize = 3;

#[derive(Clone)]
pub enum InMessage {
    Revalidate,
    Lookup,
    /// An inbound PING addressed to us, carrying the peer and the datagram's observed
    /// source address (needed to answer with the peer's true endpoint).
    Ping(H256, SocketAddr, Message),
    /// An inbound FIND_NODES addressed to us.
    FindNode(H256, SocketAddr, Message),
    /// Seeds the table with a set of already-resolved bootstrap nodes.
    Bootstrap(Vec<Node>),
}

#[derive(Debug, Clone)]
pub enum OutMessage {
    Done,
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// The actor described in spec §4.6.
pub struct RoutingTableManager {
    local_node_id: H256,
    config: DiscoveryConfig,
    routing_table: RoutingTable,
    endpoint_tracker: EndpointTracker,
    /// Addressing info for every node-id the manager has ever learned of, whether or
    /// not it currently holds a routing-table slot. The table itself only stores bare
    /// node-ids (see [`RoutingTable`]'s doc comment); this is where the rest lives.
    known_nodes: FxHashMap<H256, Node>,
    enr_manager: Arc<EnrManager>,
    enr_store: Arc<dyn EnrStore>,
    dispatcher: Arc<Dispatcher>,
    session_handle: GenServerHandle<SessionLayer>,
}

impl RoutingTableManager {
    #[allow(clippy::too_many_arguments)]
    pub async fn spawn(
        local_node_id: H256,
        config: DiscoveryConfig,
        enr_manager: Arc<EnrManager>,
        enr_store: Arc<dyn EnrStore>,
        dispatcher: Arc<Dispatcher>,
        session_handle: GenServerHandle<SessionLayer>,
        bootnodes: Vec<Node>,
    ) -> Result<GenServerHandle<Self>> {
        let ping_subscription = dispatcher.add_request_handler(PING_ID)?;
        let find_node_subscription = dispatcher.add_request_handler(FINDNODE_ID)?;
        let routing_table_keep_alive = config.routing_table_keep_alive;
        let endpoint_vote_threshold = config.endpoint_vote_threshold;

        let state = Self {
            local_node_id,
            config,
            routing_table: RoutingTable::new(local_node_id),
            endpoint_tracker: EndpointTracker::new(endpoint_vote_threshold, ENDPOINT_VOTE_WINDOW),
            known_nodes: FxHashMap::default(),
            enr_manager,
            enr_store,
            dispatcher,
            session_handle,
        };
        let handle = state.start();

        spawn_request_forwarder(ping_subscription, handle.clone(), InMessage::Ping);
        spawn_request_forwarder(find_node_subscription, handle.clone(), InMessage::FindNode);

        send_after(
            jittered(routing_table_keep_alive, REVALIDATE_JITTER_FRACTION),
            handle.clone(),
            InMessage::Revalidate,
        );
        send_after(
            jittered(LOOKUP_INTERVAL, LOOKUP_JITTER_FRACTION),
            handle.clone(),
            InMessage::Lookup,
        );

        if !bootnodes.is_empty() {
            let _ = handle.clone().cast(InMessage::Bootstrap(bootnodes)).await;
        }

        Ok(handle)
    }

    /// Pings the globally stalest routing-table tail. Evicts it on failure (promoting
    /// its bucket's replacement-cache head); on success refreshes it and feeds the
    /// observed endpoint into the vote tracker.
    async fn revalidate(&mut self) {
        let Some((_, node_id)) = self.routing_table.least_recently_updated() else {
            return;
        };
        let Some(node) = self.known_nodes.get(&node_id).cloned() else {
            self.routing_table.remove(&node_id);
            return;
        };
        let Ok(request_id) = self.dispatcher.get_free_request_id(node_id) else {
            return;
        };

        let enr_seq = self.enr_manager.current().await.seq;
        let ping = Message::Ping(Ping { request_id, enr_seq });
        let sink = SessionLayerSink(self.session_handle.clone());
        METRICS.pings_sent.inc();

        match self.dispatcher.request(&sink, node_id, ping).await {
            Ok(Message::Pong(pong)) => {
                METRICS.pongs_received.inc();
                self.routing_table.update(node_id);
                let endpoint = Endpoint::new(pong.packet_ip, pong.packet_port);
                if let Some(winner) = self.endpoint_tracker.record_vote(node_id, endpoint) {
                    if let Err(err) = self.enr_manager.update_endpoint(winner.ip, winner.udp_port).await {
                        warn!(%err, "failed to persist voted endpoint");
                    }
                    self.endpoint_tracker.clear(&winner);
                }
            }
            _ => {
                trace!(%node_id, "liveness ping failed, evicting");
                self.routing_table.remove(&node_id);
                self.known_nodes.remove(&node_id);
            }
        }
        METRICS.routing_table_size.set(self.routing_table.len() as i64);
    }

    /// Iterative Kademlia lookup toward `target`: each round queries up to
    /// `lookup_concurrency` of the closest not-yet-queried known node-ids concurrently,
    /// for the distances `[d-1, d, d+1]` relative to *that peer's own id* (a FIND_NODES
    /// request asks a peer for entries in its own buckets, not the caller's), and
    /// recurses until a round turns up no node not already known.
    async fn lookup(&mut self, target: H256) {
        METRICS.record_lookup().await;
        let mut queried: FxHashSet<H256> = FxHashSet::default();

        loop {
            let ordered = self.routing_table.iter_nodes_around(&target);
            let candidates: Vec<H256> = ordered
                .into_iter()
                .filter(|id| !queried.contains(id))
                .take(self.config.lookup_concurrency.max(1))
                .collect();
            if candidates.is_empty() {
                break;
            }
            for id in &candidates {
                queried.insert(*id);
            }

            let sink = SessionLayerSink(self.session_handle.clone());
            let dispatcher = self.dispatcher.clone();
            let requests = candidates.iter().map(|&peer| {
                let sink = sink.clone();
                let dispatcher = dispatcher.clone();
                async move {
                    let distance = log_distance(&peer, &target).max(1);
                    let distances = neighbor_distances(distance);
                    let request_id = dispatcher.get_free_request_id(peer).ok()?;
                    let msg = Message::FindNode(FindNode { request_id, distances });
                    dispatcher.request_nodes(&sink, peer, msg).await.ok()
                }
            });
            let results = futures::future::join_all(requests).await;

            let mut discovered_new = false;
            for nodes in results.into_iter().flatten() {
                for enr in nodes.enrs {
                    let Some(node_id) = enr.node_id() else { continue };
                    if node_id == self.local_node_id {
                        continue;
                    }
                    // Never let a replayed/stale ENR regress a node-id's record to a
                    // lower sequence number than one we've already seen.
                    if let Some(current) = self.enr_store.get(&node_id).await {
                        if enr.seq <= current.seq {
                            continue;
                        }
                    }
                    self.enr_store.set(enr.clone()).await;
                    let Ok(node) = Node::from_enr(&enr) else { continue };
                    let is_new = !self.known_nodes.contains_key(&node_id);
                    self.known_nodes.insert(node_id, node.clone());
                    let _ = self
                        .session_handle
                        .clone()
                        .cast(session_layer::InMessage::NoteNode(node))
                        .await;
                    if self.routing_table.update(node_id).is_some() && is_new {
                        discovered_new = true;
                    }
                }
            }
            if !discovered_new {
                break;
            }
        }
        METRICS.routing_table_size.set(self.routing_table.len() as i64);
    }

    /// Answers an inbound PING with our current ENR sequence number and the peer's
    /// observed `(ip, port)`, feeding the endpoint-vote mechanism of spec §4.7 on the
    /// requester's side once enough peers agree.
    async fn handle_ping(&self, peer: H256, from: SocketAddr, ping: Ping) -> Result<()> {
        let enr_seq = self.enr_manager.current().await.seq;
        let pong = Message::Pong(Pong {
            request_id: ping.request_id,
            enr_seq,
            packet_ip: from.ip(),
            packet_port: from.port(),
        });
        SessionLayerSink(self.session_handle.clone()).send_message(peer, pong).await
    }

    /// Answers an inbound FIND_NODES. Distance `0` means "the local ENR"; any other
    /// distance returns our routing-table entries at that log-distance. Fragments the
    /// reply into multiple NODES messages sharing `request_id` and `total` when the
    /// collected ENRs don't fit in one, bounded by [`MAX_ENRS_PER_NODES_FRAGMENT`].
    async fn handle_find_node(&self, peer: H256, find_node: FindNode) -> Result<()> {
        let mut enrs = Vec::new();
        for distance in find_node.distances {
            if distance == 0 {
                enrs.push(self.enr_manager.current().await);
                continue;
            }
            for node_id in self.routing_table.nodes_at_distance(distance) {
                if let Some(record) = self.enr_store.get(&node_id).await {
                    enrs.push(record);
                }
            }
        }

        let fragments: Vec<Vec<NodeRecord>> = if enrs.is_empty() {
            vec![vec![]]
        } else {
            enrs.chunks(MAX_ENRS_PER_NODES_FRAGMENT).map(<[NodeRecord]>::to_vec).collect()
        };
        let total = fragments.len() as u64;
        if total > MAX_NODES_MESSAGE_TOTAL {
            warn!(%peer, total, "dropping excess NODES fragments beyond MAX_NODES_MESSAGE_TOTAL");
        }
        let bounded_total = total.min(MAX_NODES_MESSAGE_TOTAL);

        let sink = SessionLayerSink(self.session_handle.clone());
        for fragment in fragments.into_iter().take(MAX_NODES_MESSAGE_TOTAL as usize) {
            let nodes = Message::Nodes(Nodes {
                request_id: find_node.request_id.clone(),
                total: bounded_total,
                enrs: fragment,
            });
            sink.send_message(peer, nodes).await?;
        }
        Ok(())
    }

    async fn bootstrap(&mut self, nodes: Vec<Node>) {
        for node in nodes {
            let node_id = node.node_id();
            self.known_nodes.insert(node_id, node.clone());
            self.routing_table.update(node_id);
            let _ = self
                .session_handle
                .clone()
                .cast(session_layer::InMessage::NoteNode(node))
                .await;
        }
        METRICS.routing_table_size.set(self.routing_table.len() as i64);
    }
}

/// Spawns a plain owning task draining `subscription` into `handle`, forwarding every
/// `(peer, from, message)` through `wrap`. Not `spawn_listener`: [`RequestSubscription`]
/// implements `Drop`, so its `receiver` field can't be partially moved out on its own —
/// the whole subscription has to be owned by whatever drains it, the same way
/// `session_layer::SessionLayer::spawn_receive_loop` owns the raw UDP socket.
fn spawn_request_forwarder(
    mut subscription: RequestSubscription,
    handle: GenServerHandle<RoutingTableManager>,
    wrap: fn(H256, SocketAddr, Message) -> InMessage,
) {
    tokio::spawn(async move {
        while let Some((peer, from, message)) = subscription.receiver.recv().await {
            if handle.clone().cast(wrap(peer, from, message)).await.is_err() {
                return;
            }
        }
    });
}

/// The distances a FIND_NODES should request of a peer at log-distance `d` from the
/// lookup target: `d` itself plus its immediate neighbors, clipped to the valid
/// `1..=256` range.
fn neighbor_distances(d: u16) -> Vec<u16> {
    let mut distances = Vec::with_capacity(3);
    if d > 1 {
        distances.push(d - 1);
    }
    distances.push(d);
    if d < 256 {
        distances.push(d + 1);
    }
    distances
}

fn random_target() -> H256 {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    H256::from(bytes)
}

fn jittered(base: Duration, fraction: f64) -> Duration {
    let jitter: f64 = rand::Rng::gen_range(&mut rand::thread_rng(), -1.0..=1.0);
    let delta = base.as_secs_f64() * fraction * jitter;
    Duration::from_secs_f64((base.as_secs_f64() + delta).max(1.0))
}

impl GenServer for RoutingTableManager {
    type CallMsg = Unused;
    type CastMsg = InMessage;
    type OutMsg = OutMessage;
    type Error = ManagerError;

    async fn handle_cast(&mut self, message: Self::CastMsg, handle: &GenServerHandle<Self>) -> CastResponse {
        match message {
            InMessage::Revalidate => {
                self.revalidate().await;
                send_after(
                    jittered(self.config.routing_table_keep_alive, REVALIDATE_JITTER_FRACTION),
                    handle.clone(),
                    InMessage::Revalidate,
                );
            }
            InMessage::Lookup => {
                self.lookup(random_target()).await;
                send_after(
                    jittered(LOOKUP_INTERVAL, LOOKUP_JITTER_FRACTION),
                    handle.clone(),
                    InMessage::Lookup,
                );
            }
            InMessage::Ping(peer, from, message) => {
                if let Message::Ping(ping) = message {
                    let _ = self
                        .handle_ping(peer, from, ping)
                        .await
                        .inspect_err(|e| trace!(err = %e, "error answering PING"));
                }
            }
            InMessage::FindNode(peer, _from, message) => {
                if let Message::FindNode(find_node) = message {
                    let _ = self
                        .handle_find_node(peer, find_node)
                        .await
                        .inspect_err(|e| trace!(err = %e, "error answering FIND_NODES"));
                }
            }
            InMessage::Bootstrap(nodes) => self.bootstrap(nodes).await,
        }
        CastResponse::NoReply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbor_distances_clip_to_valid_range() {
        assert_eq!(neighbor_distances(1), vec![1, 2]);
        assert_eq!(neighbor_distances(256), vec![255, 256]);
        assert_eq!(neighbor_distances(128), vec![127, 128, 129]);
    }

    #[test]
    fn jittered_stays_within_the_requested_fraction() {
        let base = Duration::from_secs(300);
        for _ in 0..100 {
            let got = jittered(base, 0.1);
            assert!(got.as_secs_f64() >= 270.0 && got.as_secs_f64() <= 330.0);
        }
    }

    #[test]
    fn jittered_never_collapses_to_zero() {
        let got = jittered(Duration::from_millis(1), 1.0);
        assert!(got.as_secs_f64() >= 1.0);
    }
}
