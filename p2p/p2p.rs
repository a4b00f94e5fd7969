//! A standalone implementation of the Discovery v5 (discv5) protocol core: the packet
//! codec and handshake state machine, the per-peer session layer, the message
//! dispatcher, the Kademlia routing table and its revalidation/lookup machinery, the
//! local ENR manager, and the endpoint-vote tracker that lets a node learn its own
//! externally-visible address from its peers.
//!
//! [`discovery::Discv5Service`] is the top-level entry point a host binary drives;
//! everything else is exposed for composing a different wiring (e.g. swapping
//! [`enr_store::EnrStore`] for a persistent backend, or driving [`socket::DatagramTransport`]
//! over something other than a real UDP socket in tests).

pub mod config;
pub mod discovery;
pub mod discv5;
pub mod enr_manager;
pub mod enr_store;
pub mod error;
pub mod metrics;
pub mod socket;
pub mod types;
pub mod utils;

pub use discovery::Discv5Service;
pub use error::{DiscoveryError, Result};
