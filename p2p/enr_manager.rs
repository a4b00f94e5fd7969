//! The local ENR owner, per spec §4.8.
//!
//! Guards the local [`NodeRecord`] and its signer behind a `tokio::sync::Mutex`, the way
//! `discv4/server.rs` guards its `local_node_record: Arc<Mutex<NodeRecord>>`. `update`
//! applies key/value edits transactionally: only if something actually changed does the
//! sequence number bump and the record get re-signed and persisted.

use std::net::IpAddr;
use std::sync::Arc;

use secp256k1::SecretKey;
use tokio::sync::Mutex;

use crate::enr_store::EnrStore;
use crate::error::Result;
use crate::types::NodeRecord;

pub struct EnrManager {
    signer: SecretKey,
    record: Mutex<NodeRecord>,
    store: Arc<dyn EnrStore>,
}

impl EnrManager {
    pub fn new(signer: SecretKey, record: NodeRecord, store: Arc<dyn EnrStore>) -> Self {
        Self {
            signer,
            record: Mutex::new(record),
            store,
        }
    }

    pub async fn current(&self) -> NodeRecord {
        self.record.lock().await.clone()
    }

    /// Updates the advertised endpoint if it differs from the current one, bumping the
    /// sequence number and re-signing. A no-op (no seq bump, no persist) if the endpoint
    /// is already current — the same short-circuit `NodeRecord::update_endpoint` applies
    /// internally.
    pub async fn update_endpoint(&self, ip: IpAddr, udp_port: u16) -> Result<bool> {
        let mut record = self.record.lock().await;
        let changed = record.update_endpoint(ip, udp_port, &self.signer)?;
        if changed {
            self.store.set(record.clone()).await;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enr_store::InMemoryEnrStore;
    use crate::types::Node;

    fn signer_and_record() -> (SecretKey, NodeRecord) {
        let signer = SecretKey::new(&mut rand::thread_rng());
        let public_key = {
            let pk = secp256k1::PublicKey::from_secret_key(secp256k1::SECP256K1, &signer);
            ethereum_types::H512::from_slice(&pk.serialize_uncompressed()[1..])
        };
        let node = Node::new("127.0.0.1".parse().unwrap(), 9000, 9000, public_key);
        let record = NodeRecord::from_node(&node, 1, &signer).unwrap();
        (signer, record)
    }

    #[tokio::test]
    async fn endpoint_update_bumps_seq_and_persists() {
        let (signer, record) = signer_and_record();
        let store = Arc::new(InMemoryEnrStore::default());
        let manager = EnrManager::new(signer, record.clone(), store.clone());

        let changed = manager.update_endpoint("10.0.0.1".parse().unwrap(), 30303).await.unwrap();
        assert!(changed);

        let updated = manager.current().await;
        assert_eq!(updated.seq, record.seq + 1);
        assert_eq!(store.get(&updated.node_id().unwrap()).await, Some(updated));
    }

    #[tokio::test]
    async fn unchanged_endpoint_is_a_no_op() {
        let (signer, record) = signer_and_record();
        let store = Arc::new(InMemoryEnrStore::default());
        let manager = EnrManager::new(signer, record.clone(), store);

        let ip = IpAddr::V4(record.pairs().ip.expect("seeded record has an ip"));
        let port = record.pairs().udp_port.expect("seeded record has a udp port");
        let changed = manager.update_endpoint(ip, port).await.unwrap();
        assert!(!changed);
        assert_eq!(manager.current().await.seq, record.seq);
    }
}
