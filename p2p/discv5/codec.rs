//! Packet codec: wire framing for discv5 v5.0, per spec §4.1.
//!
//! Three packet shapes share a UDP datagram:
//!
//! * `WhoAreYou`  = `sha256(dest_node_id || "WHOAREYOU") || rlp([token, id_nonce, enr_seq])`
//! * `AuthTag`    = `tag || rlp(auth_tag) || encrypted_message`
//! * `AuthHeader` = `tag || rlp([auth_tag, id_nonce, "gcm", ephemeral_pubkey, enc_auth_response]) || encrypted_message`
//!
//! where `tag = sha256(dest_node_id) XOR source_node_id`.
//!
//! A receiver with no a-priori knowledge of which shape arrived decodes by: comparing the
//! first 32 bytes against the expected WHOAREYOU magic for the local node-id; if that
//! doesn't match, peeking whether the first RLP item following the tag is a list (an
//! AuthHeader) or a 12-byte string (a bare AuthTag).

use bytes::{Bytes, BytesMut};
use discv5_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use ethereum_types::H256;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Maximum size of a single discv5 UDP datagram.
pub const DISCOVERY_MAX_PACKET_SIZE: usize = 1280;

#[derive(Debug, Error)]
pub enum PacketCodecError {
    #[error("packet too short")]
    TooShort,
    #[error("packet exceeds DISCOVERY_MAX_PACKET_SIZE")]
    TooLarge,
    #[error(transparent)]
    Rlp(#[from] RLPDecodeError),
    #[error("malformed auth-tag: expected exactly 12 bytes")]
    MalformedAuthTag,
}

fn whoareyou_magic(dest_node_id: &H256) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(dest_node_id.as_bytes());
    hasher.update(b"WHOAREYOU");
    hasher.finalize().into()
}

pub fn tag(dest_node_id: &H256, source_node_id: &H256) -> H256 {
    let mut hasher = Sha256::new();
    hasher.update(dest_node_id.as_bytes());
    let dest_hash: [u8; 32] = hasher.finalize().into();
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = dest_hash[i] ^ source_node_id[i];
    }
    H256::from(out)
}

/// Recovers the claimed source node-id from a received packet's tag, given the local
/// (destination) node-id.
pub fn source_from_tag(local_node_id: &H256, tag: &H256) -> H256 {
    let mut hasher = Sha256::new();
    hasher.update(local_node_id.as_bytes());
    let dest_hash: [u8; 32] = hasher.finalize().into();
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = dest_hash[i] ^ tag[i];
    }
    H256::from(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoAreYouChallenge {
    pub token: [u8; 12],
    pub id_nonce: [u8; 32],
    pub enr_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    WhoAreYou(WhoAreYouChallenge),
    AuthTag {
        tag: H256,
        auth_tag: [u8; 12],
        encrypted_message: Bytes,
    },
    AuthHeader {
        tag: H256,
        auth_tag: [u8; 12],
        id_nonce: [u8; 32],
        ephemeral_pubkey: [u8; 33],
        encrypted_auth_response: Bytes,
        encrypted_message: Bytes,
    },
}

impl Packet {
    pub fn encode_random_auth_tag(
        dest_node_id: &H256,
        source_node_id: &H256,
        auth_tag: [u8; 12],
        encrypted_message: &[u8],
    ) -> Result<BytesMut, PacketCodecError> {
        let tag_value = tag(dest_node_id, source_node_id);
        let mut buf = BytesMut::with_capacity(32 + 16 + encrypted_message.len());
        buf.extend_from_slice(tag_value.as_bytes());
        Encoder::new(&mut buf).encode_field(&auth_tag).finish();
        buf.extend_from_slice(encrypted_message);
        check_size(&buf)?;
        Ok(buf)
    }

    pub fn encode_who_are_you(
        dest_node_id: &H256,
        token: [u8; 12],
        id_nonce: [u8; 32],
        enr_seq: u64,
    ) -> Result<BytesMut, PacketCodecError> {
        let mut buf = BytesMut::with_capacity(32 + 64);
        buf.extend_from_slice(&whoareyou_magic(dest_node_id));
        Encoder::new(&mut buf)
            .encode_field(&token)
            .encode_field(&id_nonce)
            .encode_field(&enr_seq)
            .finish();
        check_size(&buf)?;
        Ok(buf)
    }

    pub fn encode_auth_header(
        dest_node_id: &H256,
        source_node_id: &H256,
        auth_tag: [u8; 12],
        id_nonce: [u8; 32],
        ephemeral_pubkey: [u8; 33],
        encrypted_auth_response: &[u8],
        encrypted_message: &[u8],
    ) -> Result<BytesMut, PacketCodecError> {
        let tag_value = tag(dest_node_id, source_node_id);
        let mut buf = BytesMut::with_capacity(
            32 + 16 + 48 + 40 + encrypted_auth_response.len() + encrypted_message.len(),
        );
        buf.extend_from_slice(tag_value.as_bytes());
        Encoder::new(&mut buf)
            .encode_field(&auth_tag)
            .encode_field(&id_nonce)
            .encode_field(&"gcm")
            .encode_field(&ephemeral_pubkey)
            .encode_bytes(encrypted_auth_response)
            .finish();
        buf.extend_from_slice(encrypted_message);
        check_size(&buf)?;
        Ok(buf)
    }

    /// Decodes a raw datagram. `local_node_id` is needed to recognize the WHOAREYOU magic.
    pub fn decode(local_node_id: &H256, data: &[u8]) -> Result<Self, PacketCodecError> {
        check_size(data)?;
        if data.len() < 32 {
            return Err(PacketCodecError::TooShort);
        }
        let (head, rest) = data.split_at(32);

        if head == whoareyou_magic(local_node_id) {
            let decoder = Decoder::new(rest)?;
            let (token, decoder) = decoder.decode_field::<[u8; 12]>("token")?;
            let (id_nonce, decoder) = decoder.decode_field::<[u8; 32]>("id_nonce")?;
            let (enr_seq, decoder) = decoder.decode_field("enr_seq")?;
            decoder.finish()?;
            return Ok(Packet::WhoAreYou(WhoAreYouChallenge {
                token,
                id_nonce,
                enr_seq,
            }));
        }

        let tag_value = H256::from_slice(head);
        let (is_list, payload, body_rest) = discv5_rlp::decode::decode_rlp_item(rest)?;

        if is_list {
            let decoder = Decoder::new(rest)?;
            let (auth_tag, decoder) = decoder.decode_field::<[u8; 12]>("auth_tag")?;
            let (id_nonce, decoder) = decoder.decode_field::<[u8; 32]>("id_nonce")?;
            let (scheme, decoder) = decoder.decode_field::<String>("scheme")?;
            if scheme != "gcm" {
                return Err(PacketCodecError::Rlp(RLPDecodeError::Custom(
                    "unsupported auth-header scheme".into(),
                )));
            }
            let (ephemeral_pubkey, decoder) =
                decoder.decode_field::<[u8; 33]>("ephemeral_pubkey")?;
            let (encrypted_auth_response, decoder) =
                decoder.decode_field::<bytes::Bytes>("encrypted_auth_response")?;
            let remaining = decoder.finish()?;

            Ok(Packet::AuthHeader {
                tag: tag_value,
                auth_tag,
                id_nonce,
                ephemeral_pubkey,
                encrypted_auth_response,
                encrypted_message: Bytes::copy_from_slice(remaining),
            })
        } else {
            let auth_tag: [u8; 12] = payload
                .try_into()
                .map_err(|_| PacketCodecError::MalformedAuthTag)?;
            Ok(Packet::AuthTag {
                tag: tag_value,
                auth_tag,
                encrypted_message: Bytes::copy_from_slice(body_rest),
            })
        }
    }
}

fn check_size(data: &[u8]) -> Result<(), PacketCodecError> {
    if data.len() > DISCOVERY_MAX_PACKET_SIZE {
        Err(PacketCodecError::TooLarge)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trips_to_source_node_id() {
        let dest = H256::from_low_u64_be(1);
        let source = H256::from_low_u64_be(2);
        let t = tag(&dest, &source);
        assert_eq!(source_from_tag(&dest, &t), source);
    }

    #[test]
    fn auth_tag_packet_round_trips() {
        let dest = H256::from_low_u64_be(1);
        let source = H256::from_low_u64_be(2);
        let msg = b"hello world, this is an encrypted message";
        let encoded =
            Packet::encode_random_auth_tag(&dest, &source, [5u8; 12], msg).unwrap();

        let decoded = Packet::decode(&dest, &encoded).unwrap();
        match decoded {
            Packet::AuthTag {
                tag: decoded_tag,
                auth_tag,
                encrypted_message,
            } => {
                assert_eq!(decoded_tag, tag(&dest, &source));
                assert_eq!(auth_tag, [5u8; 12]);
                assert_eq!(&encrypted_message[..], msg);
            }
            other => panic!("expected AuthTag packet, got {other:?}"),
        }
    }

    #[test]
    fn who_are_you_is_recognized_by_magic() {
        let dest = H256::from_low_u64_be(42);
        let encoded = Packet::encode_who_are_you(&dest, [1u8; 12], [2u8; 32], 9).unwrap();
        let decoded = Packet::decode(&dest, &encoded).unwrap();
        match decoded {
            Packet::WhoAreYou(challenge) => {
                assert_eq!(challenge.token, [1u8; 12]);
                assert_eq!(challenge.id_nonce, [2u8; 32]);
                assert_eq!(challenge.enr_seq, 9);
            }
            other => panic!("expected WhoAreYou packet, got {other:?}"),
        }
    }

    #[test]
    fn auth_header_round_trips() {
        let dest = H256::from_low_u64_be(1);
        let source = H256::from_low_u64_be(2);
        let auth_response = b"encrypted-auth-response";
        let msg = b"encrypted-message-body";
        let encoded = Packet::encode_auth_header(
            &dest,
            &source,
            [3u8; 12],
            [4u8; 32],
            [9u8; 33],
            auth_response,
            msg,
        )
        .unwrap();

        let decoded = Packet::decode(&dest, &encoded).unwrap();
        match decoded {
            Packet::AuthHeader {
                auth_tag,
                id_nonce,
                ephemeral_pubkey,
                encrypted_auth_response,
                encrypted_message,
                ..
            } => {
                assert_eq!(auth_tag, [3u8; 12]);
                assert_eq!(id_nonce, [4u8; 32]);
                assert_eq!(ephemeral_pubkey, [9u8; 33]);
                assert_eq!(&encrypted_auth_response[..], auth_response);
                assert_eq!(&encrypted_message[..], msg);
            }
            other => panic!("expected AuthHeader packet, got {other:?}"),
        }
    }

    #[test]
    fn packet_over_max_size_is_rejected() {
        let dest = H256::from_low_u64_be(1);
        let source = H256::from_low_u64_be(2);
        let huge = vec![0u8; DISCOVERY_MAX_PACKET_SIZE];
        assert!(Packet::encode_random_auth_tag(&dest, &source, [0u8; 12], &huge).is_err());
    }
}
