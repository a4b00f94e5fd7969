//! The `EnrStore` trait seam: a place to persist discovered ENRs by node-id, consumed by
//! the routing-table manager but never implemented against a real database here — that
//! (LevelDB, per the original client) lives in a host binary, same as `ethrex`'s `Store`
//! trait being implemented by a separate storage crate and only consumed by `p2p`.

use ethereum_types::H256;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;

use crate::types::NodeRecord;

#[async_trait::async_trait]
pub trait EnrStore: Send + Sync {
    async fn get(&self, node_id: &H256) -> Option<NodeRecord>;
    /// Overwrites any previously stored record for `record.node_id()`. Callers are
    /// expected to have already checked the new `seq` is higher.
    async fn set(&self, record: NodeRecord);
    async fn delete(&self, node_id: &H256);
}

/// An in-memory [`EnrStore`], sufficient for tests and for a node willing to forget
/// every peer's ENR on restart.
#[derive(Default)]
pub struct InMemoryEnrStore {
    records: Mutex<FxHashMap<H256, NodeRecord>>,
}

#[async_trait::async_trait]
impl EnrStore for InMemoryEnrStore {
    async fn get(&self, node_id: &H256) -> Option<NodeRecord> {
        self.records.lock().await.get(node_id).cloned()
    }

    async fn set(&self, record: NodeRecord) {
        let Some(node_id) = record.node_id() else {
            return;
        };
        self.records.lock().await.insert(node_id, record);
    }

    async fn delete(&self, node_id: &H256) {
        self.records.lock().await.remove(node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Node;
    use secp256k1::{PublicKey, SecretKey};

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let signer = SecretKey::new(&mut rand::thread_rng());
        let public_key = {
            let pk = PublicKey::from_secret_key(secp256k1::SECP256K1, &signer);
            ethereum_types::H512::from_slice(&pk.serialize_uncompressed()[1..])
        };
        let node = Node::new("127.0.0.1".parse().unwrap(), 9000, 9000, public_key);
        let record = NodeRecord::from_node(&node, 1, &signer).unwrap();
        let node_id = record.node_id().unwrap();

        let store = InMemoryEnrStore::default();
        store.set(record.clone()).await;
        assert_eq!(store.get(&node_id).await, Some(record));

        store.delete(&node_id).await;
        assert_eq!(store.get(&node_id).await, None);
    }
}
