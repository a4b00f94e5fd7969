//! The session layer (the "Packer"), per spec §4.3.
//!
//! Owns every per-peer session and in-flight handshake, and is the only component that
//! ever touches a [`DatagramTransport`] directly. Runs as a single `GenServer` actor so
//! two packets from the same peer can never race through the handshake state machine —
//! the same per-peer-serialization property the teacher's own `discv5::server::DiscoveryServer`
//! gets from being a single actor processing one cast at a time.

use bytes::Bytes;
use ethereum_types::H256;
use rand::RngCore;
use rustc_hash::FxHashMap;
use secp256k1::{PublicKey, SecretKey};
use spawned_concurrency::{
    messages::Unused,
    tasks::{CastResponse, GenServer, GenServerHandle, send_interval},
};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::{debug, error, trace};

use super::codec::Packet;
use super::dispatcher::{Dispatcher, OutboundSink};
use super::handshake::{self, SessionKeys};
use super::messages::Message;
use crate::error::{DiscoveryError, Result};
use crate::metrics::METRICS;
use crate::socket::DatagramTransport;
use crate::types::{Node, NodeRecord};

/// How long a session may sit unused before the idle sweep evicts it.
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(15);
/// How long a half-open handshake (either side) may remain pending before it is
/// abandoned.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Minimum spacing between WHOAREYOU challenges sent to the same source IP, to keep this
/// node from being used as a UDP amplifier against a spoofed victim address.
const WHOAREYOU_RATE_LIMIT: Duration = Duration::from_secs(1);

struct Session {
    keys: SessionKeys,
    addr: SocketAddr,
    last_activity: Instant,
}

struct PendingInitiator {
    token: [u8; 12],
    node: Node,
    buffered_message: Message,
    deadline: Instant,
}

struct PendingRecipient {
    id_nonce: [u8; 32],
    addr: SocketAddr,
    known_enr_seq: u64,
    deadline: Instant,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionLayerError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

#[derive(Clone)]
pub enum InMessage {
    /// A raw datagram arrived from `from`.
    Inbound { from: SocketAddr, data: Bytes },
    /// Make `node` known to the session layer so it can be addressed by node-id alone
    /// (the routing-table manager calls this as it learns of peers).
    NoteNode(Node),
    /// Send `message` to `peer`, opening a session (via a handshake) if none exists yet.
    SendRequest { peer: H256, message: Message },
    SweepIdle,
}

#[derive(Debug, Clone)]
pub enum OutMessage {
    Done,
}

pub struct SessionLayer {
    local_node_id: H256,
    signer: SecretKey,
    local_record: Arc<Mutex<NodeRecord>>,
    transport: Arc<dyn DatagramTransport>,
    dispatcher: Arc<Dispatcher>,

    known_nodes: FxHashMap<H256, Node>,
    sessions: FxHashMap<H256, Session>,
    pending_initiators: FxHashMap<H256, PendingInitiator>,
    pending_recipients: FxHashMap<H256, PendingRecipient>,
    pending_by_token: FxHashMap<[u8; 12], H256>,
    whoareyou_rate_limit: FxHashMap<IpAddr, Instant>,
}

impl SessionLayer {
    pub async fn spawn(
        local_node_id: H256,
        signer: SecretKey,
        local_record: Arc<Mutex<NodeRecord>>,
        transport: Arc<dyn DatagramTransport>,
        dispatcher: Arc<Dispatcher>,
    ) -> GenServerHandle<Self> {
        let state = Self {
            local_node_id,
            signer,
            local_record,
            transport,
            dispatcher,
            known_nodes: FxHashMap::default(),
            sessions: FxHashMap::default(),
            pending_initiators: FxHashMap::default(),
            pending_recipients: FxHashMap::default(),
            pending_by_token: FxHashMap::default(),
            whoareyou_rate_limit: FxHashMap::default(),
        };
        let handle = state.start();
        send_interval(SESSION_SWEEP_INTERVAL, handle.clone(), InMessage::SweepIdle);
        handle
    }

    /// Spawns the UDP receive loop feeding `handle` with [`InMessage::Inbound`] casts.
    /// Kept separate from `spawn` so the caller controls when the socket starts being
    /// drained (mirrors the teacher's `handle_listens` pattern, minus the per-packet
    /// task-per-connection fan-out: here one actor handles every peer).
    pub fn spawn_receive_loop(transport: Arc<dyn DatagramTransport>, handle: GenServerHandle<Self>) {
        tokio::spawn(async move {
            let mut buf = crate::socket::new_recv_buffer();
            loop {
                match transport.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        let data = Bytes::copy_from_slice(&buf[..len]);
                        if handle.clone().cast(InMessage::Inbound { from, data }).await.is_err() {
                            debug!("session layer actor gone, stopping receive loop");
                            return;
                        }
                    }
                    Err(err) => {
                        error!(%err, "UDP receive error");
                    }
                }
            }
        });
    }

    async fn handle_inbound(&mut self, from: SocketAddr, data: Bytes) -> Result<()> {
        let packet = Packet::decode(&self.local_node_id, &data)
            .map_err(|e| DiscoveryError::PacketDecodeFailure(e.to_string()))?;
        match packet {
            Packet::AuthTag { tag, auth_tag, encrypted_message } => {
                self.handle_auth_tag(tag, auth_tag, encrypted_message, from).await
            }
            Packet::WhoAreYou(challenge) => {
                self.handle_who_are_you(challenge, from).await
            }
            Packet::AuthHeader {
                tag,
                auth_tag,
                id_nonce,
                ephemeral_pubkey,
                encrypted_auth_response,
                encrypted_message,
            } => {
                self.handle_auth_header(
                    tag,
                    auth_tag,
                    id_nonce,
                    ephemeral_pubkey,
                    encrypted_auth_response,
                    encrypted_message,
                    from,
                )
                .await
            }
        }
    }

    async fn handle_auth_tag(
        &mut self,
        tag: H256,
        auth_tag: [u8; 12],
        encrypted_message: Bytes,
        from: SocketAddr,
    ) -> Result<()> {
        let source_node_id = super::codec::source_from_tag(&self.local_node_id, &tag);

        if let Some(session) = self.sessions.get_mut(&source_node_id) {
            match handshake::decrypt_message(&session.keys.decryption_key, &tag, &auth_tag, &encrypted_message) {
                Ok(plaintext) => {
                    session.last_activity = Instant::now();
                    return self.deliver(source_node_id, from, &plaintext).await;
                }
                Err(_) => {
                    trace!(peer = %source_node_id, "decryption under existing session failed, re-challenging");
                }
            }
        }

        // Simultaneous-initiate: we've already sent our own random AuthTag to this
        // peer (i.e. we're mid-initiation too) when its random AuthTag arrives here.
        // Per §4.2, the initiation from the numerically smaller node-id wins; the
        // other side discards its own initiation and adopts the winner's handshake.
        if self.pending_initiators.contains_key(&source_node_id) {
            if self.local_node_id < source_node_id {
                trace!(peer = %source_node_id, "simultaneous initiate: our initiation wins, ignoring theirs");
                return Ok(());
            }
            trace!(peer = %source_node_id, "simultaneous initiate: their initiation wins, discarding ours");
            if let Some(pending) = self.pending_initiators.remove(&source_node_id) {
                self.pending_by_token.remove(&pending.token);
            }
        }

        self.send_who_are_you(source_node_id, auth_tag, from).await
    }

    async fn send_who_are_you(&mut self, source_node_id: H256, token: [u8; 12], from: SocketAddr) -> Result<()> {
        let ip = from.ip();
        let now = Instant::now();
        if let Some(last_sent) = self.whoareyou_rate_limit.get(&ip) {
            if now.duration_since(*last_sent) < WHOAREYOU_RATE_LIMIT {
                trace!(%ip, "rate limiting WHOAREYOU");
                return Ok(());
            }
        }
        self.whoareyou_rate_limit.insert(ip, now);

        let mut id_nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut id_nonce);

        // The session layer doesn't hold ENRs itself (that's the routing-table
        // manager's `EnrStore`), so it always declares "no known record" and lets the
        // initiator decide whether to attach its own.
        let known_enr_seq = 0;
        let packet = super::codec::Packet::encode_who_are_you(&source_node_id, token, id_nonce, known_enr_seq)
            .map_err(|e| DiscoveryError::PacketDecodeFailure(e.to_string()))?;
        self.transport.send_to(&packet, from).await?;

        self.pending_recipients.insert(
            source_node_id,
            PendingRecipient {
                id_nonce,
                addr: from,
                known_enr_seq,
                deadline: now + HANDSHAKE_TIMEOUT,
            },
        );
        Ok(())
    }

    async fn handle_who_are_you(&mut self, challenge: super::codec::WhoAreYouChallenge, from: SocketAddr) -> Result<()> {
        let Some(peer) = self.pending_by_token.remove(&challenge.token) else {
            trace!("unexpected WHOAREYOU, ignoring");
            return Ok(());
        };
        let Some(pending) = self.pending_initiators.remove(&peer) else {
            return Ok(());
        };

        let local_record = self.local_record.lock().await.clone();
        let remote_pubkey = uncompressed_pubkey(&pending.node.public_key).ok_or_else(|| {
            DiscoveryError::HandshakeFailure {
                node_id: format!("{peer:#x}"),
                reason: "invalid known public key".into(),
            }
        })?;

        let plaintext_message = pending.buffered_message.encode_to_vec();
        let (auth_tag, id_nonce, ephemeral_pubkey, encrypted_auth_response, encrypted_message, keys) =
            handshake::initiator_complete(
                &self.signer,
                &self.local_node_id,
                &peer,
                &remote_pubkey,
                &challenge.id_nonce,
                challenge.enr_seq,
                local_record.seq,
                &local_record,
                &plaintext_message,
            )?;

        let packet = super::codec::Packet::encode_auth_header(
            &peer,
            &self.local_node_id,
            auth_tag,
            id_nonce,
            ephemeral_pubkey,
            &encrypted_auth_response,
            &encrypted_message,
        )
        .map_err(|e| DiscoveryError::PacketDecodeFailure(e.to_string()))?;
        self.transport.send_to(&packet, from).await?;

        self.sessions.insert(
            peer,
            Session {
                keys,
                addr: from,
                last_activity: Instant::now(),
            },
        );
        METRICS.handshakes_completed.inc();
        METRICS.active_sessions.set(self.sessions.len() as i64);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_auth_header(
        &mut self,
        tag: H256,
        auth_tag: [u8; 12],
        id_nonce: [u8; 32],
        ephemeral_pubkey: [u8; 33],
        encrypted_auth_response: Bytes,
        encrypted_message: Bytes,
        from: SocketAddr,
    ) -> Result<()> {
        let source_node_id = super::codec::source_from_tag(&self.local_node_id, &tag);
        let Some(pending) = self.pending_recipients.remove(&source_node_id) else {
            trace!(peer = %source_node_id, "unexpected AUTHHEADER, ignoring");
            return Ok(());
        };
        if pending.id_nonce != id_nonce {
            trace!(peer = %source_node_id, "AUTHHEADER id_nonce mismatch, ignoring");
            return Ok(());
        }

        let known_pubkey = self
            .known_nodes
            .get(&source_node_id)
            .and_then(|node| uncompressed_pubkey(&node.public_key));

        let (keys, record, plaintext) = handshake::recipient_complete(
            &self.signer,
            &self.local_node_id,
            &source_node_id,
            &id_nonce,
            &ephemeral_pubkey,
            &encrypted_auth_response,
            &auth_tag,
            &encrypted_message,
            known_pubkey.as_ref(),
            pending.known_enr_seq,
        )?;

        if let Some(record) = record {
            if let Ok(node) = Node::from_enr(&record) {
                self.known_nodes.insert(source_node_id, node);
            }
        }

        self.sessions.insert(
            source_node_id,
            Session {
                keys,
                addr: from,
                last_activity: Instant::now(),
            },
        );
        METRICS.handshakes_completed.inc();
        METRICS.active_sessions.set(self.sessions.len() as i64);
        self.deliver(source_node_id, from, &plaintext).await
    }

    async fn deliver(&self, peer: H256, from: SocketAddr, plaintext: &[u8]) -> Result<()> {
        let message = Message::decode(plaintext)?;
        self.dispatcher.dispatch_inbound(peer, from, message).await;
        Ok(())
    }

    async fn send_request(&mut self, peer: H256, message: Message) -> Result<()> {
        if let Some(session) = self.sessions.get_mut(&peer) {
            let Some(node) = self.known_nodes.get(&peer) else {
                return Err(DiscoveryError::UnknownPeer(format!("{peer:#x}")));
            };
            let tag = super::codec::tag(&peer, &self.local_node_id);
            let mut auth_tag = [0u8; 12];
            rand::thread_rng().fill_bytes(&mut auth_tag);
            let plaintext = message.encode_to_vec();
            let encrypted = handshake::encrypt_message(&session.keys.encryption_key, &tag, &auth_tag, &plaintext)?;
            let packet = super::codec::Packet::encode_random_auth_tag(&peer, &self.local_node_id, auth_tag, &encrypted)
                .map_err(|e| DiscoveryError::PacketDecodeFailure(e.to_string()))?;
            self.transport.send_to(&packet, node.udp_addr()).await?;
            session.last_activity = Instant::now();
            return Ok(());
        }

        let Some(node) = self.known_nodes.get(&peer).cloned() else {
            return Err(DiscoveryError::UnknownPeer(format!("{peer:#x}")));
        };
        let mut token = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut token);
        let body = handshake::random_auth_tag_body();
        let packet = super::codec::Packet::encode_random_auth_tag(&peer, &self.local_node_id, token, &body)
            .map_err(|e| DiscoveryError::PacketDecodeFailure(e.to_string()))?;
        self.transport.send_to(&packet, node.udp_addr()).await?;

        self.pending_by_token.insert(token, peer);
        self.pending_initiators.insert(
            peer,
            PendingInitiator {
                token,
                node,
                buffered_message: message,
                deadline: Instant::now() + HANDSHAKE_TIMEOUT,
            },
        );
        METRICS.handshakes_initiated.inc();
        Ok(())
    }

    fn sweep_idle(&mut self) {
        let now = Instant::now();
        self.sessions.retain(|peer, session| {
            let keep = now.duration_since(session.last_activity) < SESSION_IDLE_TIMEOUT;
            if !keep {
                trace!(%peer, "evicting idle session");
            }
            keep
        });
        self.pending_initiators.retain(|_, p| p.deadline > now);
        self.pending_recipients.retain(|_, p| p.deadline > now);
        self.pending_by_token
            .retain(|_, peer| self.pending_initiators.contains_key(peer));
        self.whoareyou_rate_limit.retain(|_, t| now.duration_since(*t) < WHOAREYOU_RATE_LIMIT * 4);
        METRICS.active_sessions.set(self.sessions.len() as i64);
    }
}

/// `Node::public_key` stores the 64-byte uncompressed key without its `0x04` prefix;
/// secp256k1 wants that prefix back on to parse it.
fn uncompressed_pubkey(public_key: &ethereum_types::H512) -> Option<PublicKey> {
    let mut uncompressed = [0u8; 65];
    uncompressed[0] = 0x04;
    uncompressed[1..].copy_from_slice(public_key.as_bytes());
    PublicKey::from_slice(&uncompressed).ok()
}

impl GenServer for SessionLayer {
    type CallMsg = Unused;
    type CastMsg = InMessage;
    type OutMsg = OutMessage;
    type Error = SessionLayerError;

    async fn handle_cast(&mut self, message: Self::CastMsg, _handle: &GenServerHandle<Self>) -> CastResponse {
        match message {
            InMessage::Inbound { from, data } => {
                let _ = self.handle_inbound(from, data).await.inspect_err(|e| {
                    if matches!(e, DiscoveryError::HandshakeFailure { .. }) {
                        METRICS.handshakes_failed.inc();
                    }
                    trace!(err = %e, "error handling inbound datagram");
                });
            }
            InMessage::NoteNode(node) => {
                self.known_nodes.insert(node.node_id(), node);
            }
            InMessage::SendRequest { peer, message } => {
                let _ = self
                    .send_request(peer, message)
                    .await
                    .inspect_err(|e| trace!(err = %e, "error sending request"));
            }
            InMessage::SweepIdle => self.sweep_idle(),
        }
        CastResponse::NoReply
    }
}

/// Adapts a [`GenServerHandle<SessionLayer>`] to the [`OutboundSink`] the dispatcher
/// expects.
#[derive(Clone)]
pub struct SessionLayerSink(pub GenServerHandle<SessionLayer>);

#[async_trait::async_trait]
impl OutboundSink for SessionLayerSink {
    async fn send_message(&self, peer: H256, message: Message) -> Result<()> {
        self.0
            .clone()
            .cast(InMessage::SendRequest { peer, message })
            .await
            .map_err(|e| DiscoveryError::Internal(format!("session layer actor unreachable: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_timeout_constants_are_sane() {
        assert!(SESSION_SWEEP_INTERVAL < SESSION_IDLE_TIMEOUT);
        assert!(HANDSHAKE_TIMEOUT < SESSION_IDLE_TIMEOUT);
    }
}
