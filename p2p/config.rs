//! Ambient configuration layer for the tunables named throughout the routing table,
//! session layer and lookup logic as fixed constants.
//!
//! [`DiscoveryConfig`] can be built three ways, cheapest first: [`DiscoveryConfig::default`]
//! (the protocol defaults), [`DiscoveryConfig::from_file`] (a TOML/JSON/YAML file via the
//! `config` crate, falling back to defaults for anything unset), or parsed straight off the
//! command line with [`DiscoveryArgs`] (`clap`), the way `ethrex`'s own node binary builds
//! its `Options`.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::discv5::routing_table::BUCKET_SIZE;

/// `alpha` in the Kademlia literature: how many peers a single lookup round queries in
/// parallel.
pub const LOOKUP_CONCURRENCY: usize = 3;

pub const ROUTING_TABLE_KEEP_ALIVE: Duration = Duration::from_secs(300);
pub const REQUEST_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const ENDPOINT_VOTE_THRESHOLD: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub bind_addr: IpAddr,
    pub udp_port: u16,
    pub bucket_size: usize,
    pub lookup_concurrency: usize,
    pub routing_table_keep_alive: Duration,
    pub request_response_timeout: Duration,
    pub session_idle_timeout: Duration,
    pub endpoint_vote_threshold: usize,
    pub bootnodes: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            udp_port: 9000,
            bucket_size: BUCKET_SIZE,
            lookup_concurrency: LOOKUP_CONCURRENCY,
            routing_table_keep_alive: ROUTING_TABLE_KEEP_ALIVE,
            request_response_timeout: REQUEST_RESPONSE_TIMEOUT,
            session_idle_timeout: SESSION_IDLE_TIMEOUT,
            endpoint_vote_threshold: ENDPOINT_VOTE_THRESHOLD,
            bootnodes: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    /// Layers a config file (any format `config-rs` recognizes by extension) over the
    /// protocol defaults. Missing keys fall back to [`DiscoveryConfig::default`].
    pub fn from_file(path: &PathBuf) -> Result<Self, config::ConfigError> {
        let defaults = config::Config::try_from(&Self::default())?;
        let merged = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::from(path.as_path()))
            .build()?;
        merged.try_deserialize()
    }

    pub fn from_args(args: &DiscoveryArgs) -> Self {
        let mut config = Self::default();
        if let Some(addr) = args.bind_addr {
            config.bind_addr = addr;
        }
        if let Some(port) = args.udp_port {
            config.udp_port = port;
        }
        if !args.bootnodes.is_empty() {
            config.bootnodes = args.bootnodes.clone();
        }
        config
    }
}

/// Command-line overlay for [`DiscoveryConfig`], following the flattenable `Options`
/// shape `ethrex`'s own CLI uses.
#[derive(Debug, Parser)]
#[command(name = "discv5", about = "Discovery v5 core node options")]
pub struct DiscoveryArgs {
    #[arg(long = "discovery.addr", value_name = "ADDRESS", help_heading = "P2P options")]
    pub bind_addr: Option<IpAddr>,
    #[arg(long = "discovery.port", value_name = "UDP_PORT", help_heading = "P2P options")]
    pub udp_port: Option<u16>,
    #[arg(
        long = "bootnodes",
        value_name = "ENR_LIST",
        value_delimiter = ',',
        num_args = 1..,
        help_heading = "P2P options"
    )]
    pub bootnodes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.bucket_size, BUCKET_SIZE);
        assert_eq!(config.lookup_concurrency, LOOKUP_CONCURRENCY);
        assert_eq!(config.routing_table_keep_alive, ROUTING_TABLE_KEEP_ALIVE);
    }

    #[test]
    fn args_override_only_set_fields() {
        let args = DiscoveryArgs {
            bind_addr: None,
            udp_port: Some(30303),
            bootnodes: vec![],
        };
        let config = DiscoveryConfig::from_args(&args);
        assert_eq!(config.udp_port, 30303);
        assert_eq!(config.bind_addr, DiscoveryConfig::default().bind_addr);
    }
}
