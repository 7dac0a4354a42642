//! UPnP NAT traversal.
//!
//! Maps the listen port on the internet gateway and keeps the mapping
//! alive until the server shuts down. Gateway operations are blocking, so
//! they run on the blocking thread pool.

use crate::addrman::routed_local_ip;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Lease requested for the port mapping (seconds)
const MAPPING_LEASE: u32 = 20 * 60;

/// How often the mapping is refreshed
const MAPPING_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Description attached to the mapping on the gateway
const MAPPING_DESCRIPTION: &str = "chain-p2p port mapping";

#[derive(Error, Debug)]
pub enum UpnpError {
    #[error("UPnP gateway not found")]
    GatewayNotFound,
    #[error("no routable local address")]
    NoLocalAddress,
    #[error("failed to add port mapping: {0}")]
    AddMapping(String),
}

/// Map the port, refresh the lease periodically, and remove the mapping
/// when cancelled.
pub async fn map_port(port: u16, cancel: CancellationToken) {
    match add_mapping(port).await {
        Ok(()) => log::info!("mapped network port {}", port),
        Err(err) => log::warn!("couldn't add port mapping: {}", err),
    }
    loop {
        tokio::select! {
            _ = tokio::time::sleep(MAPPING_REFRESH_INTERVAL) => {
                log::debug!("refreshing port mapping");
                if let Err(err) = add_mapping(port).await {
                    log::warn!("couldn't refresh port mapping: {}", err);
                }
            }
            _ = cancel.cancelled() => {
                log::debug!("deleting port mapping");
                remove_mapping(port).await;
                return;
            }
        }
    }
}

async fn add_mapping(port: u16) -> Result<(), UpnpError> {
    tokio::task::spawn_blocking(move || {
        use igd_next::{search_gateway, PortMappingProtocol};

        let gateway = search_gateway(Default::default()).map_err(|_| UpnpError::GatewayNotFound)?;
        log::debug!("found UPnP gateway: {}", gateway.addr);
        let local_ip = routed_local_ip().ok_or(UpnpError::NoLocalAddress)?;
        gateway
            .add_port(
                PortMappingProtocol::TCP,
                port,
                SocketAddr::new(local_ip, port),
                MAPPING_LEASE,
                MAPPING_DESCRIPTION,
            )
            .map_err(|err| UpnpError::AddMapping(err.to_string()))
    })
    .await
    .map_err(|_| UpnpError::GatewayNotFound)?
}

async fn remove_mapping(port: u16) {
    let _ = tokio::task::spawn_blocking(move || {
        use igd_next::{search_gateway, PortMappingProtocol};

        if let Ok(gateway) = search_gateway(Default::default()) {
            let _ = gateway.remove_port(PortMappingProtocol::TCP, port);
            log::info!("removed UPnP port mapping for port {}", port);
        }
    })
    .await;
}
