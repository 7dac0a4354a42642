//! Address manager for peer discovery.
//!
//! Maintains the universe of known remote endpoints with attempt metadata,
//! selects dial candidates biased toward never-tried addresses, and
//! persists the book as JSON across restarts.

use crate::net_address::NetAddress;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;

// =============================================================================
// Constants
// =============================================================================

/// Below this many known addresses the node keeps gossiping for more
const NEED_ADDRESS_THRESHOLD: usize = 100;

/// Maximum addresses advertised in one Addr message
const MAX_ADDR_PER_MESSAGE: usize = 1000;

// =============================================================================
// Errors
// =============================================================================

/// Address book persistence errors
#[derive(Error, Debug)]
pub enum AddressBookError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// =============================================================================
// Address Entry
// =============================================================================

/// A known address with its attempt metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressEntry {
    pub addr: NetAddress,
    /// Number of failed connection attempts since the last success
    #[serde(default)]
    pub attempts: u32,
    /// Unix timestamp of the last connection attempt
    #[serde(default)]
    pub last_attempt: Option<u64>,
    /// Unix timestamp of the last successful handshake
    #[serde(default)]
    pub last_success: Option<u64>,
}

impl AddressEntry {
    fn new(addr: NetAddress) -> Self {
        Self {
            addr,
            attempts: 0,
            last_attempt: None,
            last_success: None,
        }
    }

    /// Selection weight: never-tried addresses carry full weight, repeated
    /// failures decay it, a past success boosts it.
    fn chance(&self) -> f64 {
        let mut chance = 1.0;
        if self.attempts > 0 && self.last_success.is_none() {
            chance *= 0.5_f64.powi(self.attempts.min(16) as i32);
        }
        if self.last_success.is_some() {
            chance *= 2.0;
        }
        chance.max(0.001)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AddressBook {
    addresses: Vec<AddressEntry>,
}

// =============================================================================
// Address Manager
// =============================================================================

#[derive(Default)]
struct Inner {
    addresses: HashMap<String, AddressEntry>,
    local: HashSet<String>,
}

/// The set of known network endpoints and the local-address filter
pub struct AddressManager {
    book_path: Option<PathBuf>,
    inner: RwLock<Inner>,
}

impl AddressManager {
    /// Create a manager; an empty path disables persistence.
    pub fn new(book_path: &str) -> Self {
        let book_path = if book_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(book_path))
        };
        Self {
            book_path,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Load the persisted address book, if any.
    pub async fn start(&self) {
        if let Err(err) = self.load().await {
            log::warn!("failed to load address book: {}", err);
        }
    }

    /// Flush the address book to disk.
    pub async fn stop(&self) {
        if let Err(err) = self.save().await {
            log::error!("failed to save address book: {}", err);
        }
    }

    /// Record our own reachable endpoints so they are never dialed or
    /// stored as remote peers: the configured listen address, loopback,
    /// and the routed local interface address.
    pub async fn add_local_address(&self, listen: &NetAddress) {
        let mut locals = vec![
            listen.clone(),
            NetAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), listen.port),
        ];
        if let Some(ip) = routed_local_ip() {
            locals.push(NetAddress::new(ip, listen.port));
        }
        let mut inner = self.inner.write().await;
        for local in locals {
            let key = local.to_string();
            inner.addresses.remove(&key);
            inner.local.insert(key);
        }
    }

    /// Membership in the local set
    pub async fn is_our_address(&self, addr: &NetAddress) -> bool {
        self.inner.read().await.local.contains(&addr.to_string())
    }

    /// Merge one address into the known set, skipping locals and
    /// duplicates. Returns true if the address was new.
    pub async fn add(&self, addr: NetAddress) -> bool {
        let key = addr.to_string();
        let mut inner = self.inner.write().await;
        if inner.local.contains(&key) || inner.addresses.contains_key(&key) {
            return false;
        }
        inner.addresses.insert(key, AddressEntry::new(addr));
        true
    }

    /// Merge many addresses; returns how many were new.
    pub async fn add_many(&self, addrs: &[NetAddress]) -> usize {
        let mut added = 0;
        for addr in addrs {
            if self.add(addr.clone()).await {
                added += 1;
            }
        }
        added
    }

    /// Record a connection attempt
    pub async fn update_attempt(&self, addr: &NetAddress) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.addresses.get_mut(&addr.to_string()) {
            entry.attempts += 1;
            entry.last_attempt = Some(now_secs());
        }
    }

    /// Zero the attempt counter after a successful handshake
    pub async fn reset_attempt(&self, addr: &NetAddress) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.addresses.get_mut(&addr.to_string()) {
            entry.attempts = 0;
            entry.last_success = Some(now_secs());
        }
    }

    /// Weighted random dial candidate, biased toward addresses we have
    /// never tried or that have worked before. Never returns a local
    /// address (locals are not stored in the known set).
    pub async fn get(&self) -> Option<NetAddress> {
        let inner = self.inner.read().await;
        if inner.addresses.is_empty() {
            return None;
        }

        let entries: Vec<&AddressEntry> = inner.addresses.values().collect();
        let total: f64 = entries.iter().map(|entry| entry.chance()).sum();
        let mut target = rand::thread_rng().gen::<f64>() * total;
        for entry in &entries {
            target -= entry.chance();
            if target <= 0.0 {
                return Some(entry.addr.clone());
            }
        }
        entries.first().map(|entry| entry.addr.clone())
    }

    /// Snapshot of every known address
    pub async fn get_all(&self) -> Vec<NetAddress> {
        self.inner
            .read()
            .await
            .addresses
            .values()
            .map(|entry| entry.addr.clone())
            .collect()
    }

    /// Snapshot for an Addr advertisement, shuffled and capped
    pub async fn get_addresses(&self) -> Vec<NetAddress> {
        let mut addrs = self.get_all().await;
        let mut rng = rand::thread_rng();
        for i in (1..addrs.len()).rev() {
            let j = rng.gen_range(0..=i);
            addrs.swap(i, j);
        }
        addrs.truncate(MAX_ADDR_PER_MESSAGE);
        addrs
    }

    /// Number of known addresses
    pub async fn count(&self) -> usize {
        self.inner.read().await.addresses.len()
    }

    /// True while the known set is below the low-water threshold
    pub async fn need_more_addrs(&self) -> bool {
        self.count().await < NEED_ADDRESS_THRESHOLD
    }

    async fn load(&self) -> Result<(), AddressBookError> {
        let Some(path) = &self.book_path else {
            return Ok(());
        };
        if !path.exists() {
            log::info!("address book {} does not exist yet", path.display());
            return Ok(());
        }
        let data = std::fs::read(path)?;
        let book: AddressBook = serde_json::from_slice(&data)?;
        let mut inner = self.inner.write().await;
        for entry in book.addresses {
            let key = entry.addr.to_string();
            if inner.local.contains(&key) {
                continue;
            }
            inner.addresses.entry(key).or_insert(entry);
        }
        log::info!(
            "loaded {} addresses from {}",
            inner.addresses.len(),
            path.display()
        );
        Ok(())
    }

    // The book is rewritten atomically: write a temp file, then rename.
    async fn save(&self) -> Result<(), AddressBookError> {
        let Some(path) = &self.book_path else {
            return Ok(());
        };
        let addresses: Vec<AddressEntry> =
            self.inner.read().await.addresses.values().cloned().collect();
        let book = AddressBook { addresses };
        let data = serde_json::to_vec_pretty(&book)?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, data)?;
        std::fs::rename(&temp_path, path)?;
        log::debug!(
            "saved {} addresses to {}",
            book.addresses.len(),
            path.display()
        );
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Local IP on the default route, determined by the UDP connect trick
/// (no packet is actually sent).
pub fn routed_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    Some(socket.local_addr().ok()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> NetAddress {
        NetAddress::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_add_and_duplicates() {
        let mgr = AddressManager::new("");
        assert!(mgr.add(addr("tcp://8.8.8.8:8333")).await);
        assert!(!mgr.add(addr("tcp://8.8.8.8:8333")).await);
        assert_eq!(mgr.count().await, 1);
    }

    #[tokio::test]
    async fn test_local_addresses_are_excluded() {
        let mgr = AddressManager::new("");
        let listen = addr("tcp://0.0.0.0:8888");
        mgr.add_local_address(&listen).await;

        assert!(mgr.is_our_address(&listen).await);
        assert!(mgr.is_our_address(&addr("tcp://127.0.0.1:8888")).await);
        assert!(!mgr.add(addr("tcp://127.0.0.1:8888")).await);
        assert!(mgr.get_all().await.is_empty());
        assert!(mgr.get().await.is_none());
    }

    #[tokio::test]
    async fn test_adding_local_removes_existing_entry() {
        let mgr = AddressManager::new("");
        mgr.add(addr("tcp://127.0.0.1:9000")).await;
        mgr.add_local_address(&addr("tcp://127.0.0.1:9000")).await;
        assert_eq!(mgr.count().await, 0);
    }

    #[tokio::test]
    async fn test_attempt_metadata() {
        let mgr = AddressManager::new("");
        let a = addr("tcp://8.8.8.8:8333");
        mgr.add(a.clone()).await;

        mgr.update_attempt(&a).await;
        mgr.update_attempt(&a).await;
        {
            let inner = mgr.inner.read().await;
            let entry = &inner.addresses[&a.to_string()];
            assert_eq!(entry.attempts, 2);
            assert!(entry.last_attempt.is_some());
        }

        mgr.reset_attempt(&a).await;
        {
            let inner = mgr.inner.read().await;
            let entry = &inner.addresses[&a.to_string()];
            assert_eq!(entry.attempts, 0);
            assert!(entry.last_success.is_some());
        }
    }

    #[tokio::test]
    async fn test_get_returns_known_address() {
        let mgr = AddressManager::new("");
        mgr.add(addr("tcp://1.1.1.1:8333")).await;
        mgr.add(addr("tcp://8.8.8.8:8333")).await;

        let selected = mgr.get().await.unwrap();
        assert!(mgr.get_all().await.contains(&selected));
    }

    #[tokio::test]
    async fn test_need_more_addrs() {
        let mgr = AddressManager::new("");
        assert!(mgr.need_more_addrs().await);
        for i in 0..NEED_ADDRESS_THRESHOLD {
            mgr.add(NetAddress::parse(&format!("tcp://10.0.{}.{}:8333", i / 256, i % 256)).unwrap())
                .await;
        }
        assert!(!mgr.need_more_addrs().await);
    }

    #[tokio::test]
    async fn test_book_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("address_book.json");
        let path_str = path.to_str().unwrap();

        let mgr = AddressManager::new(path_str);
        mgr.start().await;
        mgr.add(addr("tcp://1.1.1.1:8333")).await;
        mgr.add(addr("tcp://8.8.8.8:8333")).await;
        mgr.update_attempt(&addr("tcp://1.1.1.1:8333")).await;
        mgr.stop().await;

        assert!(path.exists());

        let reloaded = AddressManager::new(path_str);
        reloaded.start().await;
        assert_eq!(reloaded.count().await, 2);
        let inner = reloaded.inner.read().await;
        assert_eq!(inner.addresses["tcp://1.1.1.1:8333"].attempts, 1);
    }

    #[tokio::test]
    async fn test_corrupt_book_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("address_book.json");
        std::fs::write(&path, b"not json").unwrap();

        let mgr = AddressManager::new(path.to_str().unwrap());
        mgr.start().await;
        assert_eq!(mgr.count().await, 0);
    }

    #[tokio::test]
    async fn test_get_addresses_capped() {
        let mgr = AddressManager::new("");
        for i in 0..20 {
            mgr.add(NetAddress::parse(&format!("tcp://10.1.0.{}:8333", i)).unwrap())
                .await;
        }
        let addrs = mgr.get_addresses().await;
        assert_eq!(addrs.len(), 20);
    }
}
