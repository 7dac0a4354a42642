//! Peer-to-peer networking substrate for a blockchain node.
//!
//! This crate provides the concurrent networking core a node builds on:
//! - TCP sessions with a framed, checksummed wire codec
//! - Symmetric version handshake with service-flag negotiation
//! - Bounded inbound/outbound peer tables with stall-based eviction
//! - Address management with a persisted book and dial-candidate selection
//! - Broadcast with per-peer recency deduplication and request gathering
//! - DNS-seed deployment mode (answer with addresses, then disconnect)
//!
//! # Example
//!
//! ```no_run
//! use chain_p2p::{FixedHeight, NullEventSink, P2pConfig, Server};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), chain_p2p::ServerError> {
//! let config = P2pConfig {
//!     listen_address: "tcp://0.0.0.0:8888".to_string(),
//!     ..Default::default()
//! };
//! let server = Arc::new(Server::new(
//!     config,
//!     Arc::new(NullEventSink),
//!     Arc::new(FixedHeight(0)),
//! )?);
//! server.clone().start().await?;
//! let mut messages = server.take_messages().await.expect("message channel");
//! while let Some(msg) = messages.recv().await {
//!     println!("received {:?} from {}", msg.payload, msg.from);
//! }
//! # Ok(())
//! # }
//! ```

pub mod addrman;
pub mod codec;
pub mod config;
pub mod conn;
pub mod events;
pub mod height;
pub mod message;
pub mod net_address;
pub mod peer;
pub mod ring_buffer;
pub mod server;
pub mod stall;
pub mod upnp;

pub use addrman::AddressManager;
pub use codec::{MessageCodec, WireError, MAX_FRAME_SIZE};
pub use config::P2pConfig;
pub use events::{Event, EventSink, NullEventSink};
pub use height::{CachedHeight, FixedHeight, HeightProvider};
pub use message::{Message, MessageKind, MsgId, ServiceFlags, PROTOCOL_VERSION};
pub use net_address::{NetAddress, Protocol};
pub use peer::{InternalMsg, Payload, Peer, PeerError, PeerInfo};
pub use ring_buffer::RingBuffer;
pub use server::{Server, ServerError};
