//! P2P network configuration.

use crate::message::ServiceFlags;

/// Configuration of the p2p server
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Path of the persisted address book; empty disables persistence
    pub addr_book_file_path: String,
    /// Listen address in `tcp://host:port` form (required)
    pub listen_address: String,
    /// Maximum number of outbound peers
    pub max_conn_out_bound: usize,
    /// Maximum number of inbound peers
    pub max_conn_in_bound: usize,
    /// Comma-separated `tcp://host:port` endpoints retried forever
    pub persistent_peers: String,
    /// Comma-separated seed endpoints; ignored when persistent peers are
    /// configured or DNS seeding is disabled
    pub dns_seeds: String,
    /// Disable DNS seeding for peers
    pub disable_dns_seed: bool,
    /// Run as a DNS seed: answer with addresses, then disconnect
    pub seed_mode: bool,
    /// Services supported by this node; the handshake demands equality
    pub service: ServiceFlags,
    /// NAT port-mapping mechanism (`""` or `"upnp"`)
    pub nat: String,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            addr_book_file_path: String::new(),
            listen_address: "tcp://0.0.0.0:8888".to_string(),
            max_conn_out_bound: 4,
            max_conn_in_bound: 8,
            persistent_peers: String::new(),
            dns_seeds: String::new(),
            disable_dns_seed: false,
            seed_mode: false,
            service: ServiceFlags::default(),
            nat: String::new(),
        }
    }
}
