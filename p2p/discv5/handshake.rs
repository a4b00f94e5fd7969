//! The handshake state machine, per spec §4.2.
//!
//! This module holds the pure crypto/encoding steps of each transition; the
//! [`super::session_layer::SessionLayer`] owns the actual per-peer state (which state a
//! handshake is in, and the timers that expire it) and calls into these functions.
//!
//! Initiator: `SENT_RANDOM -> AWAIT_WHO_ARE_YOU -> COMPLETE`.
//! Recipient: `IDLE -> SENT_WHO_ARE_YOU -> COMPLETE`.
//!
//! Any failure aborts back to `IDLE` without a reply: this protects against using the
//! handshake itself as a UDP amplification vector.

use aes_gcm::{
    Aes128Gcm, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use bytes::Bytes;
use discv5_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    structs::{Decoder, Encoder},
};
use ethereum_types::H256;
use rand::RngCore;
use secp256k1::{PublicKey, SecretKey, ecdsa::Signature};

use crate::discv5::session::{
    HandshakeKeys, compressed_shared_secret, create_id_nonce_signature, derive_handshake_keys,
    verify_id_nonce_signature,
};
use crate::error::{DiscoveryError, Result};
use crate::types::NodeRecord;

/// A completed session: one key to encrypt outbound traffic, one to decrypt inbound.
#[derive(Clone)]
pub struct SessionKeys {
    pub encryption_key: [u8; 16],
    pub decryption_key: [u8; 16],
}

/// `auth-response` plaintext: `[version, id_nonce_signature, enr_or_empty]`.
struct AuthResponse {
    id_nonce_signature: [u8; 64],
    record: Option<NodeRecord>,
}

const AUTH_RESPONSE_VERSION: u8 = 5;

impl RLPEncode for AuthResponse {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&AUTH_RESPONSE_VERSION)
            .encode_field(&self.id_nonce_signature)
            .encode_optional_field(&self.record)
            .finish();
    }
}

impl RLPDecode for AuthResponse {
    fn decode_unfinished(rlp: &[u8]) -> std::result::Result<(Self, &[u8]), discv5_rlp::error::RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (_version, decoder) = decoder.decode_field::<u8>("version")?;
        let (id_nonce_signature, decoder) = decoder.decode_field::<[u8; 64]>("id_nonce_signature")?;
        let (record, decoder) = decoder.decode_optional_field::<NodeRecord>();
        let remaining = decoder.finish()?;
        Ok((
            AuthResponse {
                id_nonce_signature,
                record,
            },
            remaining,
        ))
    }
}

fn aes_encrypt(key: &[u8; 16], nonce: &[u8; 12], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| DiscoveryError::Internal("AES-GCM encryption failed".into()))
}

fn aes_decrypt(key: &[u8; 16], nonce: &[u8; 12], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| DiscoveryError::DecryptionError {
            node_id: String::new(),
        })
}

/// Generates the 44-byte random ciphertext sent as the body of the initial AuthTag
/// packet, before any session exists.
pub fn random_auth_tag_body() -> Vec<u8> {
    let mut body = vec![0u8; 44];
    rand::thread_rng().fill_bytes(&mut body);
    body
}

/// Initiator side: having received a WHOAREYOU challenge, completes the handshake and
/// produces the AuthHeader packet body plus the resulting session keys.
#[allow(clippy::too_many_arguments)]
pub fn initiator_complete(
    local_signer: &SecretKey,
    local_node_id: &H256,
    remote_node_id: &H256,
    remote_pubkey: &PublicKey,
    id_nonce: &[u8; 32],
    remote_enr_seq: u64,
    local_enr_seq: u64,
    local_record: &NodeRecord,
    plaintext_message: &[u8],
) -> Result<(
    [u8; 12],
    [u8; 32],
    [u8; 33],
    Vec<u8>,
    Vec<u8>,
    SessionKeys,
)> {
    let ephemeral_key = SecretKey::new(&mut rand::thread_rng());
    let ephemeral_pubkey = ephemeral_key.public_key(secp256k1::SECP256K1).serialize();

    let shared_secret = compressed_shared_secret(&ephemeral_key, remote_pubkey);
    let HandshakeKeys {
        initiator_key,
        recipient_key,
        auth_response_key,
    } = derive_handshake_keys(&shared_secret, id_nonce, local_node_id, remote_node_id);

    let signature = create_id_nonce_signature(local_signer, id_nonce, &ephemeral_pubkey);

    let record = (remote_enr_seq < local_enr_seq).then(|| local_record.clone());
    let auth_response = AuthResponse {
        id_nonce_signature: signature.serialize_compact(),
        record,
    };
    let auth_response_plaintext = auth_response.encode_to_vec();

    // The auth-response is encrypted under a zero nonce: it is only ever used once,
    // keyed by a fresh `auth_response_key` derived per-handshake.
    let encrypted_auth_response =
        aes_encrypt(&auth_response_key, &[0u8; 12], &[], &auth_response_plaintext)?;

    let mut auth_tag = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut auth_tag);
    let encrypted_message = aes_encrypt(&initiator_key, &auth_tag, id_nonce, plaintext_message)?;

    Ok((
        auth_tag,
        *id_nonce,
        ephemeral_pubkey,
        encrypted_auth_response,
        encrypted_message,
        SessionKeys {
            encryption_key: initiator_key,
            decryption_key: recipient_key,
        },
    ))
}

/// Recipient side: having sent a WHOAREYOU challenge and received the resulting
/// AuthHeader, validates it and derives the session. Returns the session plus the
/// decrypted inner message on success.
#[allow(clippy::too_many_arguments)]
pub fn recipient_complete(
    local_signer: &SecretKey,
    local_node_id: &H256,
    remote_node_id: &H256,
    id_nonce: &[u8; 32],
    ephemeral_pubkey_bytes: &[u8; 33],
    encrypted_auth_response: &[u8],
    auth_tag: &[u8; 12],
    encrypted_message: &[u8],
    remote_static_pubkey: Option<&PublicKey>,
    known_enr_seq: u64,
) -> Result<(SessionKeys, Option<NodeRecord>, Bytes)> {
    let ephemeral_pubkey = PublicKey::from_slice(ephemeral_pubkey_bytes).map_err(|_| {
        DiscoveryError::HandshakeFailure {
            node_id: format!("{remote_node_id:#x}"),
            reason: "invalid ephemeral public key".into(),
        }
    })?;

    let shared_secret = compressed_shared_secret(local_signer, &ephemeral_pubkey);
    let HandshakeKeys {
        initiator_key,
        recipient_key,
        auth_response_key,
    } = derive_handshake_keys(&shared_secret, id_nonce, remote_node_id, local_node_id);

    let auth_response_plaintext = aes_decrypt(&auth_response_key, &[0u8; 12], &[], encrypted_auth_response)
        .map_err(|_| DiscoveryError::HandshakeFailure {
            node_id: format!("{remote_node_id:#x}"),
            reason: "failed to decrypt auth-response".into(),
        })?;
    let auth_response = AuthResponse::decode(&auth_response_plaintext).map_err(|e| {
        DiscoveryError::HandshakeFailure {
            node_id: format!("{remote_node_id:#x}"),
            reason: format!("malformed auth-response: {e}"),
        }
    })?;

    let record = match (&auth_response.record, remote_static_pubkey) {
        (Some(record), _) => {
            if !record.verify_signature() {
                return Err(DiscoveryError::HandshakeFailure {
                    node_id: format!("{remote_node_id:#x}"),
                    reason: "ENR signature invalid".into(),
                });
            }
            let claimed_id = record.node_id().ok_or_else(|| DiscoveryError::HandshakeFailure {
                node_id: format!("{remote_node_id:#x}"),
                reason: "ENR missing public key".into(),
            })?;
            if claimed_id != *remote_node_id {
                return Err(DiscoveryError::HandshakeFailure {
                    node_id: format!("{remote_node_id:#x}"),
                    reason: "ENR node-id mismatch".into(),
                });
            }
            if record.seq <= known_enr_seq && known_enr_seq != 0 {
                return Err(DiscoveryError::HandshakeFailure {
                    node_id: format!("{remote_node_id:#x}"),
                    reason: "ENR sequence number did not advance".into(),
                });
            }
            Some(record.clone())
        }
        (None, Some(_)) => None,
        (None, None) => {
            return Err(DiscoveryError::HandshakeFailure {
                node_id: format!("{remote_node_id:#x}"),
                reason: "no ENR available and none embedded in handshake".into(),
            });
        }
    };

    let static_pubkey = match (&record, remote_static_pubkey) {
        (Some(record), _) => record
            .pairs()
            .secp256k1
            .and_then(|pk| PublicKey::from_slice(pk.as_bytes()).ok())
            .ok_or_else(|| DiscoveryError::HandshakeFailure {
                node_id: format!("{remote_node_id:#x}"),
                reason: "ENR missing secp256k1 key".into(),
            })?,
        (None, Some(pk)) => *pk,
        (None, None) => unreachable!("handled above"),
    };

    let signature = Signature::from_compact(&auth_response.id_nonce_signature).map_err(|_| {
        DiscoveryError::HandshakeFailure {
            node_id: format!("{remote_node_id:#x}"),
            reason: "malformed id-nonce signature".into(),
        }
    })?;
    if !verify_id_nonce_signature(&static_pubkey, id_nonce, ephemeral_pubkey_bytes, &signature) {
        return Err(DiscoveryError::HandshakeFailure {
            node_id: format!("{remote_node_id:#x}"),
            reason: "invalid id-nonce signature".into(),
        });
    }

    let plaintext = aes_decrypt(&initiator_key, auth_tag, id_nonce, encrypted_message).map_err(|_| {
        DiscoveryError::HandshakeFailure {
            node_id: format!("{remote_node_id:#x}"),
            reason: "failed to decrypt message under new session".into(),
        }
    })?;

    Ok((
        SessionKeys {
            encryption_key: recipient_key,
            decryption_key: initiator_key,
        },
        record,
        Bytes::from(plaintext),
    ))
}

/// Encrypts a message for an established session's outbound key.
pub fn encrypt_message(key: &[u8; 16], tag: &H256, auth_tag: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>> {
    aes_encrypt(key, auth_tag, tag.as_bytes(), plaintext)
}

/// Decrypts a message received under an established session's inbound key.
pub fn decrypt_message(key: &[u8; 16], tag: &H256, auth_tag: &[u8; 12], ciphertext: &[u8]) -> Result<Bytes> {
    aes_decrypt(key, auth_tag, tag.as_bytes(), ciphertext).map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Node;
    use rand::rngs::OsRng;

    #[test]
    fn full_handshake_round_trips_session_keys() {
        let initiator_signer = SecretKey::new(&mut OsRng);
        let recipient_signer = SecretKey::new(&mut OsRng);
        let initiator_pubkey = {
            let pk = PublicKey::from_secret_key(secp256k1::SECP256K1, &initiator_signer);
            ethereum_types::H512::from_slice(&pk.serialize_uncompressed()[1..])
        };
        let recipient_pubkey = {
            let pk = PublicKey::from_secret_key(secp256k1::SECP256K1, &recipient_signer);
            ethereum_types::H512::from_slice(&pk.serialize_uncompressed()[1..])
        };
        let initiator_node_id = crate::utils::node_id(&initiator_pubkey);
        let recipient_node_id = crate::utils::node_id(&recipient_pubkey);

        let recipient_node = Node::new("127.0.0.1".parse().unwrap(), 9000, 9000, recipient_pubkey);
        let recipient_record = NodeRecord::from_node(&recipient_node, 1, &recipient_signer).unwrap();
        let initiator_node = Node::new("127.0.0.1".parse().unwrap(), 9001, 9001, initiator_pubkey);
        let initiator_record = NodeRecord::from_node(&initiator_node, 1, &initiator_signer).unwrap();

        let id_nonce = [42u8; 32];
        let recipient_static_pubkey = PublicKey::from_secret_key(secp256k1::SECP256K1, &recipient_signer);

        let message = b"ping";
        let (auth_tag, _id_nonce, ephemeral_pubkey, encrypted_auth_response, encrypted_message, initiator_keys) =
            initiator_complete(
                &initiator_signer,
                &initiator_node_id,
                &recipient_node_id,
                &recipient_static_pubkey,
                &id_nonce,
                0,
                initiator_record.seq,
                &initiator_record,
                message,
            )
            .unwrap();

        let (recipient_keys, record, plaintext) = recipient_complete(
            &recipient_signer,
            &recipient_node_id,
            &initiator_node_id,
            &id_nonce,
            &ephemeral_pubkey,
            &encrypted_auth_response,
            &auth_tag,
            &encrypted_message,
            None,
            0,
        )
        .unwrap();

        assert_eq!(&plaintext[..], message);
        assert!(record.is_none());
        assert_eq!(initiator_keys.encryption_key, recipient_keys.decryption_key);
        assert_eq!(initiator_keys.decryption_key, recipient_keys.encryption_key);

        let _ = recipient_record;
    }

    #[test]
    fn tampered_id_nonce_signature_is_rejected() {
        let initiator_signer = SecretKey::new(&mut OsRng);
        let recipient_signer = SecretKey::new(&mut OsRng);
        let initiator_pubkey = {
            let pk = PublicKey::from_secret_key(secp256k1::SECP256K1, &initiator_signer);
            ethereum_types::H512::from_slice(&pk.serialize_uncompressed()[1..])
        };
        let recipient_pubkey = {
            let pk = PublicKey::from_secret_key(secp256k1::SECP256K1, &recipient_signer);
            ethereum_types::H512::from_slice(&pk.serialize_uncompressed()[1..])
        };
        let initiator_node_id = crate::utils::node_id(&initiator_pubkey);
        let recipient_node_id = crate::utils::node_id(&recipient_pubkey);
        let initiator_node = Node::new("127.0.0.1".parse().unwrap(), 9001, 9001, initiator_pubkey);
        let initiator_record = NodeRecord::from_node(&initiator_node, 1, &initiator_signer).unwrap();

        let id_nonce = [1u8; 32];
        let recipient_static_pubkey = PublicKey::from_secret_key(secp256k1::SECP256K1, &recipient_signer);
        let (auth_tag, _n, ephemeral_pubkey, encrypted_auth_response, encrypted_message, _keys) =
            initiator_complete(
                &initiator_signer,
                &initiator_node_id,
                &recipient_node_id,
                &recipient_static_pubkey,
                &id_nonce,
                0,
                initiator_record.seq,
                &initiator_record,
                b"ping",
            )
            .unwrap();

        // A different id_nonce than the one actually used to challenge breaks verification.
        let wrong_nonce = [2u8; 32];
        let result = recipient_complete(
            &recipient_signer,
            &recipient_node_id,
            &initiator_node_id,
            &wrong_nonce,
            &ephemeral_pubkey,
            &encrypted_auth_response,
            &auth_tag,
            &encrypted_message,
            None,
            0,
        );
        assert!(result.is_err());
    }
}
