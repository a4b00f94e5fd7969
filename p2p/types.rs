use bytes::{BufMut, Bytes};
use discv5_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use ethereum_types::{H256, H264, H512};
use secp256k1::{PublicKey, SecretKey, ecdsa::Signature};
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::OnceLock,
};
use thiserror::Error;

use crate::utils::{keccak, node_id};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error(transparent)]
    RLPDecodeError(#[from] RLPDecodeError),
    #[error("Missing field: {0}")]
    MissingField(String),
    #[error("Signature error: {0}")]
    SignatureError(String),
}

/// Bounded by the maximum datagram an ENR is ever allowed to occupy once wrapped in a
/// NODES message, see the `DISCOVERY_MAX_PACKET_SIZE` note in [`crate::discv5::codec`].
const MAX_NODE_RECORD_ENCODED_SIZE: usize = 300;

/// An (ip, udp-port) pair as exchanged in PONG messages and endpoint votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp_port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, udp_port: u16) -> Self {
        Self { ip, udp_port }
    }
}

/// A peer as known to the routing table: its network location plus the identity
/// public key that `node_id()` is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub public_key: H512,
    node_id: OnceLock<H256>,
}

impl Node {
    pub fn new(ip: IpAddr, udp_port: u16, tcp_port: u16, public_key: H512) -> Self {
        Self {
            ip,
            udp_port,
            tcp_port,
            public_key,
            node_id: OnceLock::new(),
        }
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip.to_canonical(), self.udp_port)
    }

    pub fn node_id(&self) -> H256 {
        *self.node_id.get_or_init(|| node_id(&self.public_key))
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.ip, self.udp_port)
    }

    /// Builds a `Node` from a validated ENR. Fails if the record carries no public key
    /// or no ip/port pair.
    pub fn from_enr(record: &NodeRecord) -> Result<Self, NodeError> {
        let pairs = record.pairs();
        let public_key_bytes = pairs.secp256k1.ok_or(NodeError::MissingField(
            "public key not found in record".into(),
        ))?;
        let verifying_key = PublicKey::from_slice(public_key_bytes.as_bytes())
            .map_err(|_| NodeError::ParseError("invalid public key bytes".into()))?;
        let uncompressed = verifying_key.serialize_uncompressed();
        let public_key = H512::from_slice(&uncompressed[1..]);

        let ip: IpAddr = match (pairs.ip, pairs.ip6) {
            (None, None) => {
                return Err(NodeError::MissingField("no ip found in record".into()));
            }
            (Some(ipv4), _) => IpAddr::from(ipv4),
            (None, Some(ipv6)) => IpAddr::from(ipv6),
        };

        let udp_port = pairs
            .udp_port
            .or(pairs.tcp_port)
            .ok_or(NodeError::MissingField("no port found in record".into()))?;
        let tcp_port = pairs.tcp_port.or(pairs.udp_port).unwrap_or(udp_port);

        Ok(Self::new(ip, udp_port, tcp_port, public_key))
    }
}

impl RLPEncode for Node {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.ip)
            .encode_field(&self.udp_port)
            .encode_field(&self.tcp_port)
            .encode_field(&self.public_key)
            .finish();
    }
}

impl RLPDecode for Node {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (ip, decoder) = decoder.decode_field("ip")?;
        let (udp_port, decoder) = decoder.decode_field("udp_port")?;
        let (tcp_port, decoder) = decoder.decode_field("tcp_port")?;
        let (public_key, decoder) = decoder.decode_field("public_key")?;
        let remaining = decoder.finish()?;
        Ok((Node::new(ip, udp_port, tcp_port, public_key), remaining))
    }
}

/// The key/value pairs carried in an ENR, per
/// <https://github.com/ethereum/devp2p/blob/master/enr.md#record-structure>.
///
/// Only the fields discv5's core routing and handshake logic consume are kept: a
/// content-routing ENR entry such as `eth`/`snap` belongs to a layer above this crate.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct NodeRecordPairs {
    /// Identity scheme, always `"v4"` (secp256k1 + keccak256).
    pub id: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub ip6: Option<Ipv6Addr>,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    pub secp256k1: Option<H264>,
}

impl NodeRecordPairs {
    pub fn try_from_raw_pairs(pairs: &[(Bytes, Bytes)]) -> Result<Self, RLPDecodeError> {
        let mut decoded = Self::default();
        for (key, value) in pairs {
            match key.as_ref() {
                b"id" => decoded.id = Some(String::decode(value)?),
                b"ip" => decoded.ip = Some(Ipv4Addr::decode(value)?),
                b"ip6" => decoded.ip6 = Some(Ipv6Addr::decode(value)?),
                b"tcp" => decoded.tcp_port = Some(u16::decode(value)?),
                b"udp" => decoded.udp_port = Some(u16::decode(value)?),
                b"secp256k1" => decoded.secp256k1 = Some(H264(<[u8; 33]>::decode(value)?)),
                // unrecognized keys are ignored, per the ENR spec
                _ => {}
            }
        }
        Ok(decoded)
    }

    fn encode(&self, buf: &mut dyn BufMut) {
        // keys must be sorted lexicographically, per the ENR spec.
        if let Some(id) = &self.id {
            Bytes::from_static(b"id").encode(buf);
            id.encode(buf);
        }
        if let Some(ip) = &self.ip {
            Bytes::from_static(b"ip").encode(buf);
            ip.encode(buf);
        }
        if let Some(ip6) = &self.ip6 {
            Bytes::from_static(b"ip6").encode(buf);
            ip6.encode(buf);
        }
        if let Some(secp256k1) = &self.secp256k1 {
            Bytes::from_static(b"secp256k1").encode(buf);
            secp256k1.encode(buf);
        }
        if let Some(tcp) = self.tcp_port {
            Bytes::from_static(b"tcp").encode(buf);
            tcp.encode(buf);
        }
        if let Some(udp) = self.udp_port {
            Bytes::from_static(b"udp").encode(buf);
            udp.encode(buf);
        }
    }
}

/// A signed Ethereum Node Record. `seq` is monotonic: the record with the higher
/// sequence number always wins when two are compared for the same node-id.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct NodeRecord {
    pub signature: H512,
    pub seq: u64,
    pairs: NodeRecordPairs,
}

impl NodeRecord {
    pub fn pairs(&self) -> &NodeRecordPairs {
        &self.pairs
    }

    pub fn node_id(&self) -> Option<H256> {
        let pubkey_bytes = self.pairs.secp256k1?;
        let pubkey = PublicKey::from_slice(pubkey_bytes.as_bytes()).ok()?;
        let uncompressed = pubkey.serialize_uncompressed();
        Some(node_id(&H512::from_slice(&uncompressed[1..])))
    }

    pub fn from_node(node: &Node, seq: u64, signer: &SecretKey) -> Result<Self, NodeError> {
        let mut pairs = NodeRecordPairs {
            id: Some("v4".to_string()),
            secp256k1: Some(H264::from_slice(
                &PublicKey::from_secret_key(secp256k1::SECP256K1, signer).serialize(),
            )),
            tcp_port: Some(node.tcp_port),
            udp_port: Some(node.udp_port),
            ..Default::default()
        };
        match node.ip.to_canonical() {
            IpAddr::V4(ip) => pairs.ip = Some(ip),
            IpAddr::V6(ip) => pairs.ip6 = Some(ip),
        }

        let mut record = NodeRecord {
            signature: H512::zero(),
            seq,
            pairs,
        };
        record.signature = record.sign_record(signer)?;
        Ok(record)
    }

    /// Replaces `ip`/`udp_port` (e.g. after an endpoint vote), bumping `seq` and
    /// re-signing. No-op (no seq bump) if the values are unchanged.
    pub fn update_endpoint(
        &mut self,
        ip: IpAddr,
        udp_port: u16,
        signer: &SecretKey,
    ) -> Result<bool, NodeError> {
        let changed = match ip {
            IpAddr::V4(v4) => self.pairs.ip != Some(v4) || self.pairs.udp_port != Some(udp_port),
            IpAddr::V6(v6) => self.pairs.ip6 != Some(v6) || self.pairs.udp_port != Some(udp_port),
        };
        if !changed {
            return Ok(false);
        }
        match ip {
            IpAddr::V4(v4) => self.pairs.ip = Some(v4),
            IpAddr::V6(v6) => self.pairs.ip6 = Some(v6),
        }
        self.pairs.udp_port = Some(udp_port);
        self.seq += 1;
        self.signature = self.sign_record(signer)?;
        Ok(true)
    }

    fn sign_record(&self, signer: &SecretKey) -> Result<H512, NodeError> {
        let digest = self.signature_digest();
        let msg = secp256k1::Message::from_digest_slice(&digest)
            .map_err(|_| NodeError::SignatureError("invalid message digest".into()))?;
        let (_recovery_id, signature_bytes) = secp256k1::SECP256K1
            .sign_ecdsa_recoverable(&msg, signer)
            .serialize_compact();
        Ok(H512::from_slice(&signature_bytes))
    }

    fn signature_digest(&self) -> [u8; 32] {
        let mut rlp = vec![];
        Encoder::new(&mut rlp)
            .encode_field(&self.seq)
            .finish_with(|buf| self.pairs.encode(buf));
        keccak(&rlp).0
    }

    /// Verifies the embedded signature against the embedded public key.
    pub fn verify_signature(&self) -> bool {
        let Some(pubkey_bytes) = self.pairs.secp256k1 else {
            return false;
        };
        let Ok(pubkey) = PublicKey::from_slice(pubkey_bytes.as_bytes()) else {
            return false;
        };
        let digest = self.signature_digest();
        let Ok(message) = secp256k1::Message::from_digest_slice(&digest) else {
            return false;
        };
        let Ok(signature) = Signature::from_compact(&self.signature.0) else {
            return false;
        };
        secp256k1::SECP256K1
            .verify_ecdsa(&message, &signature, &pubkey)
            .is_ok()
    }
}

impl RLPEncode for NodeRecord {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.signature)
            .encode_field(&self.seq)
            .finish_with(|buf| self.pairs.encode(buf));
    }
}

impl RLPDecode for NodeRecord {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        if decoder.payload_len() > MAX_NODE_RECORD_ENCODED_SIZE {
            return Err(RLPDecodeError::invalid_length());
        }
        let (signature, decoder) = decoder.decode_field("signature")?;
        let (seq, decoder) = decoder.decode_field("seq")?;
        let (raw_pairs, decoder) = decode_pairs(vec![], decoder)?;
        let remaining = decoder.finish()?;

        if !raw_pairs.iter().any(|(k, _)| k.as_ref() == b"id") {
            return Err(RLPDecodeError::Custom(
                "invalid node record: 'id' field missing".into(),
            ));
        }
        let pairs = NodeRecordPairs::try_from_raw_pairs(&raw_pairs)?;
        Ok((
            NodeRecord {
                signature,
                seq,
                pairs,
            },
            remaining,
        ))
    }
}

/// The optional fields of an ENR are encoded as a flat list of alternating key/value
/// items; this walks the list pulling out each key as a string and each value as the
/// still-encoded RLP item, so unknown keys can be skipped without needing to know
/// their type.
fn decode_pairs(
    mut pairs: Vec<(Bytes, Bytes)>,
    decoder: Decoder,
) -> Result<(Vec<(Bytes, Bytes)>, Decoder), RLPDecodeError> {
    let (key, decoder): (Option<Bytes>, Decoder) = decoder.decode_optional_field();
    match key {
        Some(key) => {
            let (value, decoder) = decoder.get_encoded_item()?;
            pairs.push((key, Bytes::from(value)));
            decode_pairs(pairs, decoder)
        }
        None => Ok((pairs, decoder)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> SecretKey {
        SecretKey::from_slice(&[
            16, 125, 177, 238, 167, 212, 168, 215, 239, 165, 77, 224, 199, 143, 55, 205, 9, 194,
            87, 139, 92, 46, 30, 191, 74, 37, 68, 242, 38, 225, 104, 246,
        ])
        .expect("valid key")
    }

    fn sample_node(signer: &SecretKey) -> Node {
        let public_key = {
            let pk = PublicKey::from_secret_key(secp256k1::SECP256K1, signer);
            let encoded = pk.serialize_uncompressed();
            H512::from_slice(&encoded[1..])
        };
        Node::new("127.0.0.1".parse().unwrap(), 30303, 30303, public_key)
    }

    #[test]
    fn from_node_round_trips_through_enr() {
        let signer = signer();
        let node = sample_node(&signer);
        let record = NodeRecord::from_node(&node, 1, &signer).unwrap();
        assert!(record.verify_signature());

        let encoded = record.encode_to_vec();
        let decoded = NodeRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);

        let rebuilt = Node::from_enr(&decoded).unwrap();
        assert_eq!(rebuilt.node_id(), node.node_id());
    }

    #[test]
    fn update_endpoint_bumps_seq_and_resigns() {
        let signer = signer();
        let node = sample_node(&signer);
        let mut record = NodeRecord::from_node(&node, 1, &signer).unwrap();
        let seq_before = record.seq;

        let changed = record
            .update_endpoint("1.2.3.4".parse().unwrap(), 9999, &signer)
            .unwrap();
        assert!(changed);
        assert_eq!(record.seq, seq_before + 1);
        assert!(record.verify_signature());

        // Setting the same value again is a no-op.
        let changed_again = record
            .update_endpoint("1.2.3.4".parse().unwrap(), 9999, &signer)
            .unwrap();
        assert!(!changed_again);
        assert_eq!(record.seq, seq_before + 1);
    }

    #[test]
    fn tampered_signature_fails_verification() {
        let signer = signer();
        let node = sample_node(&signer);
        let mut record = NodeRecord::from_node(&node, 1, &signer).unwrap();
        record.signature = H512::zero();
        assert!(!record.verify_signature());
    }

    #[test]
    fn higher_seq_wins() {
        let signer = signer();
        let node = sample_node(&signer);
        let a = NodeRecord::from_node(&node, 1, &signer).unwrap();
        let mut b = a.clone();
        b.update_endpoint("5.6.7.8".parse().unwrap(), 1234, &signer)
            .unwrap();
        assert!(b.seq > a.seq);
    }
}
