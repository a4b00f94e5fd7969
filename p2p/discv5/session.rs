//! Cryptographic primitives used by the handshake state machine.
//!
//! All key derivation here follows the discv5 v5.0 wire format: the HKDF salt is the
//! `id_nonce` from the WHOAREYOU challenge directly (not a `masking_iv || static_header
//! || authdata` "challenge data" blob, which belongs to the later v5.1 wire format).

use ethereum_types::H256;
use hkdf::Hkdf;
use secp256k1::{PublicKey, Secp256k1, SecretKey, ecdsa::Signature};
use sha2::{Digest, Sha256};

const KEY_AGREEMENT_INFO: &[u8] = b"discovery v5 key agreement";
const ID_SIGNATURE_PREFIX: &[u8] = b"discovery v5 identity proof";

/// The three 16-byte AES-128 keys derived from a single handshake, per
/// `discovery v5 key agreement`.
#[derive(Clone)]
pub struct HandshakeKeys {
    pub initiator_key: [u8; 16],
    pub recipient_key: [u8; 16],
    pub auth_response_key: [u8; 16],
}

/// Computes the 33-byte compressed ECDH shared secret point between `local_key` and
/// `remote_pubkey`.
pub fn compressed_shared_secret(local_key: &SecretKey, remote_pubkey: &PublicKey) -> [u8; 33] {
    let point = secp256k1::ecdh::shared_secret_point(remote_pubkey, local_key);
    let mut out = [0u8; 33];
    out.copy_from_slice(&point[..33]);
    out
}

/// Derives the three session keys from an ECDH shared secret.
///
/// `id_nonce` is the WHOAREYOU challenge nonce (used as the HKDF salt); `init_node_id`
/// and `recip_node_id` are the initiator's and recipient's node-ids respectively,
/// regardless of which side is calling this function.
pub fn derive_handshake_keys(
    shared_secret: &[u8],
    id_nonce: &[u8; 32],
    init_node_id: &H256,
    recip_node_id: &H256,
) -> HandshakeKeys {
    let mut info = Vec::with_capacity(KEY_AGREEMENT_INFO.len() + 64);
    info.extend_from_slice(KEY_AGREEMENT_INFO);
    info.extend_from_slice(init_node_id.as_bytes());
    info.extend_from_slice(recip_node_id.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(id_nonce), shared_secret);
    let mut okm = [0u8; 48];
    // Safe to expect: 48 bytes is well within SHA256's 255*32-byte HKDF expand limit.
    hk.expand(&info, &mut okm)
        .expect("48-byte okm is within HKDF-SHA256 expand limits");

    let mut initiator_key = [0u8; 16];
    let mut recipient_key = [0u8; 16];
    let mut auth_response_key = [0u8; 16];
    initiator_key.copy_from_slice(&okm[0..16]);
    recipient_key.copy_from_slice(&okm[16..32]);
    auth_response_key.copy_from_slice(&okm[32..48]);

    HandshakeKeys {
        initiator_key,
        recipient_key,
        auth_response_key,
    }
}

/// Signs `sha256("discovery v5 identity proof" || id_nonce || ephemeral_pubkey_compressed)`
/// with the local static identity key, producing the `id_nonce_signature` carried in the
/// auth-response.
pub fn create_id_nonce_signature(
    signer: &SecretKey,
    id_nonce: &[u8; 32],
    ephemeral_pubkey_compressed: &[u8; 33],
) -> Signature {
    let digest = id_nonce_signature_digest(id_nonce, ephemeral_pubkey_compressed);
    let msg = secp256k1::Message::from_digest(digest);
    secp256k1::SECP256K1.sign_ecdsa(&msg, signer)
}

pub fn verify_id_nonce_signature(
    pubkey: &PublicKey,
    id_nonce: &[u8; 32],
    ephemeral_pubkey_compressed: &[u8; 33],
    signature: &Signature,
) -> bool {
    let digest = id_nonce_signature_digest(id_nonce, ephemeral_pubkey_compressed);
    let Ok(msg) = secp256k1::Message::from_digest_slice(&digest) else {
        return false;
    };
    Secp256k1::verification_only()
        .verify_ecdsa(&msg, signature, pubkey)
        .is_ok()
}

fn id_nonce_signature_digest(id_nonce: &[u8; 32], ephemeral_pubkey_compressed: &[u8; 33]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(ID_SIGNATURE_PREFIX);
    hasher.update(id_nonce);
    hasher.update(ephemeral_pubkey_compressed);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn handshake_keys_are_reproducible_and_distinct() {
        let shared_secret = [7u8; 32];
        let id_nonce = [9u8; 32];
        let a = H256::from_low_u64_be(1);
        let b = H256::from_low_u64_be(2);

        let k1 = derive_handshake_keys(&shared_secret, &id_nonce, &a, &b);
        let k2 = derive_handshake_keys(&shared_secret, &id_nonce, &a, &b);
        assert_eq!(k1.initiator_key, k2.initiator_key);
        assert_ne!(k1.initiator_key, k1.recipient_key);
        assert_ne!(k1.recipient_key, k1.auth_response_key);
    }

    #[test]
    fn handshake_keys_are_role_order_sensitive() {
        let shared_secret = [7u8; 32];
        let id_nonce = [9u8; 32];
        let a = H256::from_low_u64_be(1);
        let b = H256::from_low_u64_be(2);

        let ab = derive_handshake_keys(&shared_secret, &id_nonce, &a, &b);
        let ba = derive_handshake_keys(&shared_secret, &id_nonce, &b, &a);
        assert_ne!(ab.initiator_key, ba.initiator_key);
    }

    #[test]
    fn id_nonce_signature_round_trips() {
        let signer = SecretKey::new(&mut OsRng);
        let pubkey = PublicKey::from_secret_key(secp256k1::SECP256K1, &signer);
        let ephemeral = SecretKey::new(&mut OsRng);
        let ephemeral_pub = PublicKey::from_secret_key(secp256k1::SECP256K1, &ephemeral).serialize();
        let id_nonce = [3u8; 32];

        let sig = create_id_nonce_signature(&signer, &id_nonce, &ephemeral_pub);
        assert!(verify_id_nonce_signature(&pubkey, &id_nonce, &ephemeral_pub, &sig));

        let wrong_nonce = [4u8; 32];
        assert!(!verify_id_nonce_signature(&pubkey, &wrong_nonce, &ephemeral_pub, &sig));
    }

    #[test]
    fn ecdh_shared_secret_is_symmetric() {
        let a = SecretKey::new(&mut OsRng);
        let b = SecretKey::new(&mut OsRng);
        let a_pub = PublicKey::from_secret_key(secp256k1::SECP256K1, &a);
        let b_pub = PublicKey::from_secret_key(secp256k1::SECP256K1, &b);

        let secret_ab = compressed_shared_secret(&a, &b_pub);
        let secret_ba = compressed_shared_secret(&b, &a_pub);
        assert_eq!(secret_ab, secret_ba);
    }
}
