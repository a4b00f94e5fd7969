use ethereum_types::{H256, H512};
use sha3::{Digest, Keccak256};

/// Computes the node-id from a 64-byte uncompressed public key (no `0x04` prefix),
/// i.e. the Keccak256 hash of the given public key.
pub fn node_id(public_key: &H512) -> H256 {
    keccak(public_key.as_bytes())
}

pub fn keccak(data: impl AsRef<[u8]>) -> H256 {
    H256::from_slice(&Keccak256::digest(data.as_ref()))
}

/// The log-distance between two node-ids, as defined by the discv5 spec:
/// `256 - leading_zero_bits(a XOR b)`, which is `0` iff `a == b`.
///
/// This is the raw distance metric used to address buckets conceptually
/// (bucket `i` holds nodes at log-distance `i + 1`); use [`bucket_index`] to
/// convert a log-distance into an index into the 256-entry bucket array.
pub fn log_distance(a: &H256, b: &H256) -> u16 {
    let mut xor = [0u8; 32];
    for i in 0..32 {
        xor[i] = a[i] ^ b[i];
    }
    let leading_zero_bits = xor
        .iter()
        .enumerate()
        .find(|(_, byte)| **byte != 0)
        .map(|(i, byte)| i * 8 + byte.leading_zeros() as usize)
        .unwrap_or(256);
    (256 - leading_zero_bits) as u16
}

/// Converts a log-distance (`1..=256`) into a bucket index (`0..=255`).
///
/// Panics if called with a log-distance of `0` (i.e. identical node-ids), since those
/// never belong in the routing table.
pub fn bucket_index(distance: u16) -> usize {
    assert!(distance >= 1 && distance <= 256, "invalid log-distance: {distance}");
    (distance - 1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_to_self_is_zero() {
        let id = H256::from_low_u64_be(42);
        assert_eq!(log_distance(&id, &id), 0);
    }

    #[test]
    fn distance_to_bit_flip_is_256() {
        let a = H256::zero();
        let mut b_bytes = [0u8; 32];
        b_bytes[0] = 0x80;
        let b = H256::from(b_bytes);
        assert_eq!(log_distance(&a, &b), 256);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = H256::from_low_u64_be(7);
        let b = H256::from_low_u64_be(19823);
        assert_eq!(log_distance(&a, &b), log_distance(&b, &a));
    }

    #[test]
    fn bucket_index_is_distance_minus_one() {
        assert_eq!(bucket_index(1), 0);
        assert_eq!(bucket_index(256), 255);
    }
}
