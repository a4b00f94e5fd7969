//! The crate's public entry point: wires the session layer, dispatcher, routing-table
//! manager and ENR manager into a single running discv5 node, the way the teacher's own
//! `networking::p2p` crate root assembles `DiscoveryServer` + `KademliaTable` + the RLPx
//! side into one `P2PContext`.

use std::net::SocketAddr;
use std::sync::Arc;

use ethereum_types::{H256, H512};
use secp256k1::{PublicKey, SecretKey};
use spawned_concurrency::tasks::GenServerHandle;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::DiscoveryConfig;
use crate::discv5::dispatcher::Dispatcher;
use crate::discv5::manager::RoutingTableManager;
use crate::discv5::session_layer::SessionLayer;
use crate::enr_manager::EnrManager;
use crate::enr_store::EnrStore;
use crate::error::{DiscoveryError, Result};
use crate::socket::UdpTransport;
use crate::types::{Node, NodeRecord};

/// A fully wired discv5 node: owns nothing directly (every component is an actor or an
/// `Arc`-shared value) but is the single handle a host binary holds onto.
pub struct Discv5Service {
    pub local_node_id: H256,
    pub session_handle: GenServerHandle<SessionLayer>,
    pub manager_handle: GenServerHandle<RoutingTableManager>,
    pub enr_manager: Arc<EnrManager>,
}

impl Discv5Service {
    /// Binds the UDP socket, builds the local ENR from `identity`, and spawns the
    /// session layer and routing-table manager actors. `config.bootnodes` entries are
    /// parsed as `enode://<128-hex-pubkey>@<ip>:<udp_port>` URLs.
    pub async fn start(identity: SecretKey, config: DiscoveryConfig, enr_store: Arc<dyn EnrStore>) -> Result<Self> {
        let public_key = {
            let pk = PublicKey::from_secret_key(secp256k1::SECP256K1, &identity);
            H512::from_slice(&pk.serialize_uncompressed()[1..])
        };
        let local_node = Node::new(config.bind_addr, config.udp_port, config.udp_port, public_key);
        let local_node_id = local_node.node_id();
        let local_record = NodeRecord::from_node(&local_node, 1, &identity)
            .map_err(|e| DiscoveryError::HandshakeFailure {
                node_id: format!("{local_node_id:#x}"),
                reason: e.to_string(),
            })?;

        let transport = Arc::new(UdpTransport::bind(SocketAddr::new(config.bind_addr, config.udp_port)).await?);
        let dispatcher = Arc::new(Dispatcher::new());
        let enr_manager = Arc::new(EnrManager::new(identity.clone(), local_record.clone(), enr_store.clone()));

        let session_handle = SessionLayer::spawn(
            local_node_id,
            identity,
            Arc::new(AsyncMutex::new(local_record)),
            transport.clone(),
            dispatcher.clone(),
        )
        .await;
        SessionLayer::spawn_receive_loop(transport, session_handle.clone());

        let bootnodes = parse_bootnodes(&config.bootnodes);
        let manager_handle = RoutingTableManager::spawn(
            local_node_id,
            config,
            enr_manager.clone(),
            enr_store,
            dispatcher,
            session_handle.clone(),
            bootnodes,
        )
        .await?;

        Ok(Self {
            local_node_id,
            session_handle,
            manager_handle,
            enr_manager,
        })
    }
}

/// Parses `enode://<128-hex-char-pubkey>@<ip>:<udp_port>` bootnode strings, skipping (and
/// logging) any that don't parse rather than failing startup over one bad entry.
fn parse_bootnodes(raw: &[String]) -> Vec<Node> {
    raw.iter()
        .filter_map(|entry| match parse_enode_url(entry) {
            Ok(node) => Some(node),
            Err(err) => {
                tracing::warn!(%entry, %err, "skipping unparseable bootnode entry");
                None
            }
        })
        .collect()
}

fn parse_enode_url(entry: &str) -> Result<Node> {
    let without_scheme = entry
        .strip_prefix("enode://")
        .ok_or_else(|| DiscoveryError::PacketDecodeFailure("bootnode entry missing enode:// scheme".into()))?;
    let (pubkey_hex, host_part) = without_scheme
        .split_once('@')
        .ok_or_else(|| DiscoveryError::PacketDecodeFailure("bootnode entry missing '@'".into()))?;
    let pubkey_bytes = hex::decode(pubkey_hex)
        .map_err(|e| DiscoveryError::PacketDecodeFailure(format!("invalid bootnode pubkey hex: {e}")))?;
    if pubkey_bytes.len() != 64 {
        return Err(DiscoveryError::PacketDecodeFailure(
            "bootnode pubkey must be 64 bytes uncompressed (no 0x04 prefix)".into(),
        ));
    }
    let public_key = H512::from_slice(&pubkey_bytes);

    let addr: SocketAddr = host_part
        .parse()
        .map_err(|e| DiscoveryError::PacketDecodeFailure(format!("invalid bootnode host:port: {e}")))?;
    Ok(Node::new(addr.ip(), addr.port(), addr.port(), public_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_enode_url() {
        let pubkey_hex = "a".repeat(128);
        let entry = format!("enode://{pubkey_hex}@127.0.0.1:30303");
        let node = parse_enode_url(&entry).unwrap();
        assert_eq!(node.udp_port, 30303);
        assert_eq!(node.ip, "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(parse_enode_url("127.0.0.1:30303").is_err());
    }

    #[test]
    fn rejects_short_pubkey() {
        let entry = "enode://abcd@127.0.0.1:30303";
        assert!(parse_enode_url(entry).is_err());
    }

    #[test]
    fn skips_bad_entries_without_failing_the_whole_list() {
        let raw = vec!["not-an-enode".to_string()];
        assert!(parse_bootnodes(&raw).is_empty());
    }
}
