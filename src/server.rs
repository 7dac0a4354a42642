//! The p2p server: accepts and dials peers under inbound/outbound caps,
//! routes incoming traffic, evicts stalled peers, and exposes broadcast
//! and gather primitives to the embedding application.

use crate::addrman::AddressManager;
use crate::codec::WireError;
use crate::config::P2pConfig;
use crate::events::{Event, EventSink};
use crate::height::HeightProvider;
use crate::message::{AddrMsg, Message, PingMsg, PongMsg, PROTOCOL_VERSION};
use crate::net_address::{AddressError, NetAddress};
use crate::peer::{InternalMsg, Payload, Peer, PeerError, PeerInfo};
use crate::stall::{StallDetector, StallEvent};
use crate::upnp;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

const PERSISTENT_PEER_RETRY_INTERVAL: Duration = Duration::from_secs(60);
const STALL_TICK_INTERVAL: Duration = Duration::from_secs(15);
const STALL_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);
const HEART_BEAT_INTERVAL: Duration = Duration::from_secs(10);
const RECONNECT_INTERVAL: Duration = Duration::from_secs(2 * 60);
const ADDRESS_RETRY_INTERVAL: Duration = Duration::from_secs(30);
const SEND_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Biased dial attempts per missing outbound slot and connect tick
const DIAL_ATTEMPT_MULTIPLIER: usize = 30;

/// Predicate over a peer's reported height, used by [`Server::gather`]
pub type PeerFilter = fn(u64) -> bool;

/// Server-level errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("invalid listen address: {0}")]
    InvalidListenAddress(#[from] AddressError),
    #[error("failed to bind listener on {0}: {1}")]
    BindFailed(NetAddress, #[source] std::io::Error),
    #[error("p2p server already started")]
    AlreadyRunning,
    #[error("p2p server have not been started yet")]
    NotRunning,
    #[error("no active peer with address {0}")]
    NoActivePeer(NetAddress),
    #[error("no suitable peer")]
    NoSuitablePeer,
    #[error("send to peer {0} timed out")]
    SendTimeout(NetAddress),
    #[error("peer {0} already registered")]
    DuplicatePeer(NetAddress),
    #[error("write to peer failed: {0}")]
    WriteFailed(#[from] WireError),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// The p2p service
pub struct Server {
    config: P2pConfig,
    info: RwLock<PeerInfo>,
    addr_manager: Arc<AddressManager>,
    pending_peers: RwLock<HashMap<String, Arc<Peer>>>,
    inbound_peers: RwLock<HashMap<String, Arc<Peer>>>,
    outbound_peers: RwLock<HashMap<String, Arc<Peer>>>,
    internal_tx: mpsc::Sender<InternalMsg>,
    internal_rx: Mutex<Option<mpsc::Receiver<InternalMsg>>>,
    msg_tx: mpsc::Sender<InternalMsg>,
    msg_rx: Mutex<Option<mpsc::Receiver<InternalMsg>>>,
    stall_tx: mpsc::Sender<StallEvent>,
    stall_rx: Mutex<Option<mpsc::Receiver<StallEvent>>>,
    evict_tx: mpsc::Sender<NetAddress>,
    evict_rx: Mutex<Option<mpsc::Receiver<NetAddress>>>,
    events: Arc<dyn EventSink>,
    height: Arc<dyn HeightProvider>,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl Server {
    /// Create a p2p server from its configuration and collaborators.
    pub fn new(
        config: P2pConfig,
        events: Arc<dyn EventSink>,
        height: Arc<dyn HeightProvider>,
    ) -> Result<Self, ServerError> {
        let listen = NetAddress::parse(&config.listen_address)?;
        let addr_manager = Arc::new(AddressManager::new(&config.addr_book_file_path));
        let (internal_tx, internal_rx) = mpsc::channel(1);
        let (msg_tx, msg_rx) = mpsc::channel(1);
        let (stall_tx, stall_rx) = mpsc::channel(1);
        let (evict_tx, evict_rx) = mpsc::channel(1);
        let info = PeerInfo {
            version: PROTOCOL_VERSION.to_string(),
            addr: listen,
            services: config.service,
            height: 0,
        };
        Ok(Self {
            config,
            info: RwLock::new(info),
            addr_manager,
            pending_peers: RwLock::new(HashMap::new()),
            inbound_peers: RwLock::new(HashMap::new()),
            outbound_peers: RwLock::new(HashMap::new()),
            internal_tx,
            internal_rx: Mutex::new(Some(internal_rx)),
            msg_tx,
            msg_rx: Mutex::new(Some(msg_rx)),
            stall_tx,
            stall_rx: Mutex::new(Some(stall_rx)),
            evict_tx,
            evict_rx: Mutex::new(Some(evict_rx)),
            events,
            height,
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
        })
    }

    /// Start the service: load the address book, bind the listener, and
    /// spawn every long-running task.
    pub async fn start(self: Arc<Self>) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            log::error!("p2p server already started");
            return Err(ServerError::AlreadyRunning);
        }
        log::info!("begin starting p2p server");

        self.addr_manager.start().await;

        let listen = self.local_address().await;
        let listener = match TcpListener::bind(listen.socket_addr()).await {
            Ok(listener) => listener,
            Err(err) => {
                log::error!("failed to create listener with address {}: {}", listen, err);
                self.running.store(false, Ordering::SeqCst);
                return Err(ServerError::BindFailed(listen, err));
            }
        };
        // the configured port may be 0; advertise what we actually bound
        if let Ok(bound) = listener.local_addr() {
            self.info.write().await.addr.port = bound.port();
        }
        let local = self.local_address().await;
        self.addr_manager.add_local_address(&local).await;
        log::info!("p2p server listening on {}", local);

        // a stopped server cannot be restarted; its task channels are gone
        let taken = (
            self.internal_rx.lock().await.take(),
            self.stall_rx.lock().await.take(),
            self.evict_rx.lock().await.take(),
        );
        let (Some(internal_rx), Some(stall_rx), Some(evict_rx)) = taken else {
            self.running.store(false, Ordering::SeqCst);
            return Err(ServerError::AlreadyRunning);
        };

        tokio::spawn(self.clone().accept_loop(listener));
        if self.config.nat == "upnp" {
            tokio::spawn(upnp::map_port(local.port, self.cancel.clone()));
        }
        tokio::spawn(self.clone().recv_handler(internal_rx));
        tokio::spawn(
            StallDetector::new(STALL_TICK_INTERVAL, STALL_RESPONSE_TIMEOUT).run(
                stall_rx,
                self.evict_tx.clone(),
                self.cancel.clone(),
            ),
        );
        tokio::spawn(self.clone().evict_handler(evict_rx));
        tokio::spawn(self.clone().connect_peers());
        tokio::spawn(self.clone().address_handler());
        tokio::spawn(self.clone().heart_beat_handler());

        Ok(())
    }

    /// Stop the service: cancel every task, stop every peer, flush the
    /// address book. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            log::error!("p2p server already stopped");
            return;
        }
        log::info!("stopping p2p server");
        self.cancel.cancel();

        let mut peers: Vec<Arc<Peer>> = Vec::new();
        peers.extend(self.pending_peers.write().await.drain().map(|(_, p)| p));
        peers.extend(self.inbound_peers.write().await.drain().map(|(_, p)| p));
        peers.extend(self.outbound_peers.write().await.drain().map(|(_, p)| p));
        for peer in peers {
            peer.stop().await;
        }

        self.addr_manager.stop().await;
    }

    /// Our own advertised address
    pub async fn local_address(&self) -> NetAddress {
        self.info.read().await.addr.clone()
    }

    /// The stream of data-plane messages the core does not handle itself.
    /// Can be taken once.
    pub async fn take_messages(&self) -> Option<mpsc::Receiver<InternalMsg>> {
        self.msg_rx.lock().await.take()
    }

    /// The address manager owning the known-peer universe
    pub fn address_manager(&self) -> Arc<AddressManager> {
        self.addr_manager.clone()
    }

    async fn local_info(&self) -> PeerInfo {
        self.info.read().await.clone()
    }

    // =========================================================================
    // Inbound path
    // =========================================================================

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, remote) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        log::error!("encounter error when accepting the new connection: {}", err);
                        break;
                    }
                },
                _ = self.cancel.cancelled() => break,
            };
            log::debug!("accept a new connection from {}", remote);

            if self.inbound_peers.read().await.len() >= self.config.max_conn_in_bound {
                drop(stream);
                continue;
            }

            let addr = NetAddress::from_socket_addr(remote);
            let peer = Arc::new(Peer::inbound(
                self.local_info().await,
                addr,
                self.internal_tx.clone(),
                stream,
            ));
            if let Err(err) = self.add_pending_peer(&peer).await {
                log::debug!("failed to add peer to pending queue: {}", err);
                continue;
            }
            tokio::spawn(self.clone().init_inbound_peer(peer));
        }
    }

    async fn init_inbound_peer(self: Arc<Self>, peer: Arc<Peer>) {
        if let Err(err) = peer.clone().start().await {
            log::info!("failed to start inbound peer: {}", err);
            self.remove_pending_peer(&peer).await;
            return;
        }
        // the handshake adopted the advertised listen port
        let addr = peer.addr().await;
        self.addr_manager.add(addr.clone()).await;
        self.addr_manager.reset_attempt(&addr).await;
        self.remove_pending_peer(&peer).await;

        if self.config.seed_mode {
            // a seed answers with its address book and hangs up
            let addrs = self.addr_manager.get_addresses().await;
            if let Err(err) = self
                .send_sync(&peer, Message::Addr(AddrMsg { addresses: addrs }))
                .await
            {
                log::error!("failed to send address message to peer {}: {}", addr, err);
            }
            peer.stop().await;
        } else if let Err(err) = self.add_peer(true, peer.clone()).await {
            log::debug!("{}", err);
            peer.stop().await;
        }
    }

    // =========================================================================
    // Outbound path
    // =========================================================================

    async fn connect_peers(self: Arc<Self>) {
        self.clone().connect_persistent_peers().await;
        if self.config.persistent_peers.is_empty() && !self.config.disable_dns_seed {
            self.clone().connect_dns_seeds().await;
        }
        self.connect_normal_peers().await;
    }

    async fn connect_persistent_peers(self: Arc<Self>) {
        if self.config.persistent_peers.is_empty() {
            return;
        }
        for part in self.config.persistent_peers.split(',') {
            let addr = match NetAddress::parse(part.trim()) {
                Ok(addr) => addr,
                Err(_) => {
                    log::warn!("invalid persistent peer address {}", part);
                    continue;
                }
            };
            if self.addr_manager.is_our_address(&addr).await {
                continue;
            }
            self.addr_manager.add(addr.clone()).await;
            let peer = Arc::new(Peer::outbound(
                self.local_info().await,
                addr,
                true,
                self.internal_tx.clone(),
            ));
            tokio::spawn(self.clone().connect_peer(peer));
        }
    }

    async fn connect_dns_seeds(self: Arc<Self>) {
        if self.config.dns_seeds.is_empty() {
            return;
        }
        log::info!("connect to dns seeds");
        for part in self.config.dns_seeds.split(',') {
            let addr = match NetAddress::parse(part.trim()) {
                Ok(addr) => addr,
                Err(_) => {
                    log::warn!("invalid dns seed address {}", part);
                    continue;
                }
            };
            if self.addr_manager.is_our_address(&addr).await {
                continue;
            }
            let peer = Arc::new(Peer::outbound(
                self.local_info().await,
                addr,
                false,
                self.internal_tx.clone(),
            ));
            tokio::spawn(self.clone().connect_peer(peer));
        }
    }

    async fn connect_normal_peers(self: Arc<Self>) {
        log::info!("start connection to normal peers");
        loop {
            let out_count = self.outbound_peers.read().await.len();
            let in_count = self.inbound_peers.read().await.len();
            log::debug!(
                "start to connect to normal peers, current peer num: inbound-{}, outbound-{}",
                in_count,
                out_count
            );

            if self
                .addr_manager
                .count()
                .await
                .saturating_sub(self.peer_count().await)
                < self.config.max_conn_out_bound
            {
                // few known addresses: try everyone we are not talking to
                for addr in self.addr_manager.get_all().await {
                    if self.contains_peer(&addr).await {
                        log::debug!("peer with addr {} already in our neighbor list", addr);
                        continue;
                    }
                    log::info!("start connecting to peer {}", addr);
                    self.addr_manager.update_attempt(&addr).await;
                    let peer = Arc::new(Peer::outbound(
                        self.local_info().await,
                        addr,
                        false,
                        self.internal_tx.clone(),
                    ));
                    tokio::spawn(self.clone().connect_peer(peer));
                }
            } else {
                let missing = self
                    .config
                    .max_conn_out_bound
                    .saturating_sub(out_count);
                for _ in 0..DIAL_ATTEMPT_MULTIPLIER * missing {
                    let out_now = self.outbound_peers.read().await.len();
                    if out_now >= self.config.max_conn_out_bound
                        || self.addr_manager.count().await <= out_now
                    {
                        break;
                    }
                    let Some(addr) = self.addr_manager.get().await else {
                        break;
                    };
                    if self.contains_peer(&addr).await {
                        continue;
                    }
                    log::info!("start connecting to peer {}", addr);
                    self.addr_manager.update_attempt(&addr).await;
                    let peer = Arc::new(Peer::outbound(
                        self.local_info().await,
                        addr,
                        false,
                        self.internal_tx.clone(),
                    ));
                    tokio::spawn(self.clone().connect_peer(peer));
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    async fn connect_peer(self: Arc<Self>, mut peer: Arc<Peer>) {
        loop {
            if let Err(err) = self.add_pending_peer(&peer).await {
                log::debug!("failed to add peer to pending list: {}", err);
                return;
            }
            match peer.clone().start().await {
                Ok(()) => {
                    if self.config.seed_mode {
                        // a seed immediately asks a fresh peer for its neighbors
                        self.send_async(&peer, Message::AddrReq).await;
                    }
                    self.remove_pending_peer(&peer).await;
                    if let Err(err) = self.add_peer(false, peer.clone()).await {
                        log::debug!("{}", err);
                        peer.stop().await;
                    }
                    return;
                }
                Err(err) => {
                    self.remove_pending_peer(&peer).await;
                    let addr = peer.addr().await;
                    log::info!("failed to connect to peer {}: {}", addr, err);
                    if !peer.is_persistent() {
                        return;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(PERSISTENT_PEER_RETRY_INTERVAL) => {
                            peer = Arc::new(Peer::outbound(
                                self.local_info().await,
                                addr,
                                true,
                                self.internal_tx.clone(),
                            ));
                        }
                        _ = self.cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    // =========================================================================
    // Peer tables
    // =========================================================================

    // At most one in-flight dial per remote ip.
    async fn add_pending_peer(&self, peer: &Arc<Peer>) -> Result<(), ServerError> {
        let addr = peer.addr().await;
        let ip = addr.ip.to_string();
        log::debug!("add peer {} to pending queue", ip);
        let mut pending = self.pending_peers.write().await;
        if pending.contains_key(&ip) {
            return Err(ServerError::DuplicatePeer(addr));
        }
        pending.insert(ip, peer.clone());
        Ok(())
    }

    async fn remove_pending_peer(&self, peer: &Peer) {
        let ip = peer.addr().await.ip.to_string();
        log::debug!("remove peer {} from pending queue", ip);
        self.pending_peers.write().await.remove(&ip);
    }

    async fn add_peer(&self, inbound: bool, peer: Arc<Peer>) -> Result<(), ServerError> {
        let addr = peer.addr().await;
        let key = addr.to_string();
        let table = if inbound {
            &self.inbound_peers
        } else {
            &self.outbound_peers
        };
        {
            let mut guard = table.write().await;
            if guard.contains_key(&key) {
                return Err(ServerError::DuplicatePeer(addr));
            }
            guard.insert(key, peer.clone());
        }
        log::info!(
            "add a new {} peer {}",
            if inbound { "inbound" } else { "outbound" },
            addr
        );
        self.events.notify(Event::AddPeer(addr));
        Ok(())
    }

    async fn contains_peer(&self, addr: &NetAddress) -> bool {
        if self
            .pending_peers
            .read()
            .await
            .contains_key(&addr.ip.to_string())
        {
            return true;
        }
        let key = addr.to_string();
        self.outbound_peers.read().await.contains_key(&key)
            || self.inbound_peers.read().await.contains_key(&key)
    }

    /// Stop the peer with this address wherever it is registered.
    pub async fn stop_peer(&self, addr: &NetAddress) {
        let ip = addr.ip.to_string();
        let pending = self.pending_peers.write().await.remove(&ip);
        if let Some(peer) = pending {
            peer.stop().await;
            self.events.notify(Event::RemovePeer(addr.clone()));
        }
        let key = addr.to_string();
        let inbound = self.inbound_peers.write().await.remove(&key);
        if let Some(peer) = inbound {
            peer.stop().await;
            self.events.notify(Event::RemovePeer(addr.clone()));
        }
        let outbound = self.outbound_peers.write().await.remove(&key);
        if let Some(peer) = outbound {
            peer.stop().await;
            self.events.notify(Event::RemovePeer(addr.clone()));
        }
        self.stall_send(StallEvent::Clear { addr: addr.clone() }).await;
    }

    /// All handshaken peers, outbound first
    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<Arc<Peer>> =
            self.outbound_peers.read().await.values().cloned().collect();
        peers.extend(self.inbound_peers.read().await.values().cloned());
        peers
    }

    /// Look up a handshaken peer by its address
    pub async fn peer_by_address(&self, addr: &NetAddress) -> Option<Arc<Peer>> {
        let key = addr.to_string();
        if let Some(peer) = self.inbound_peers.read().await.get(&key) {
            return Some(peer.clone());
        }
        self.outbound_peers.read().await.get(&key).cloned()
    }

    pub async fn inbound_count(&self) -> usize {
        self.inbound_peers.read().await.len()
    }

    pub async fn outbound_count(&self) -> usize {
        self.outbound_peers.read().await.len()
    }

    async fn peer_count(&self) -> usize {
        self.inbound_count().await + self.outbound_count().await
    }

    // =========================================================================
    // Incoming routing
    // =========================================================================

    async fn recv_handler(self: Arc<Self>, mut rx: mpsc::Receiver<InternalMsg>) {
        loop {
            let msg = tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => return,
                },
                _ = self.cancel.cancelled() => return,
            };
            log::debug!("server receive a message from {}", msg.from);

            // let the stall detector cancel the matching pending response
            let stall_event = match &msg.payload {
                Payload::Wire(wire) => StallEvent::Received {
                    from: msg.from.clone(),
                    kind: wire.kind(),
                },
                Payload::Disconnect(_) => StallEvent::Clear {
                    addr: msg.from.clone(),
                },
            };
            if !self.stall_send(stall_event).await {
                return;
            }

            let InternalMsg {
                from,
                to,
                payload,
                resp,
            } = msg;
            match payload {
                Payload::Disconnect(reason) => {
                    log::info!("peer {} disconnected: {}", from, reason);
                    self.stop_peer(&from).await;
                }
                Payload::Wire(Message::Ping(_)) => {
                    if let Some(peer) = self.peer_by_address(&from).await {
                        let pong = Message::Pong(PongMsg {
                            state: self.height.local_height(),
                        });
                        self.send_async(&peer, pong).await;
                    }
                }
                Payload::Wire(Message::Pong(pong)) => {
                    if let Some(peer) = self.peer_by_address(&from).await {
                        peer.set_state(pong.state).await;
                    }
                }
                Payload::Wire(Message::AddrReq) => {
                    if let Some(peer) = self.peer_by_address(&from).await {
                        let addrs = self.addr_manager.get_addresses().await;
                        self.send_async(&peer, Message::Addr(AddrMsg { addresses: addrs }))
                            .await;
                    }
                }
                Payload::Wire(Message::Addr(addr_msg)) => {
                    self.addr_manager.add_many(&addr_msg.addresses).await;
                    if self.config.seed_mode {
                        // a seed has no use for the session once addresses flowed
                        self.stop_peer(&from).await;
                    }
                }
                Payload::Wire(other) => {
                    let forward = InternalMsg {
                        from,
                        to,
                        payload: Payload::Wire(other),
                        resp,
                    };
                    tokio::select! {
                        result = self.msg_tx.send(forward) => {
                            if result.is_err() {
                                return;
                            }
                        }
                        _ = self.cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    async fn evict_handler(self: Arc<Self>, mut rx: mpsc::Receiver<NetAddress>) {
        loop {
            tokio::select! {
                addr = rx.recv() => match addr {
                    Some(addr) => {
                        log::warn!("evicting stalled peer {}", addr);
                        self.stop_peer(&addr).await;
                    }
                    None => return,
                },
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    // =========================================================================
    // Periodic tasks
    // =========================================================================

    // Ask a random neighbor for more addresses while the book is thin.
    async fn address_handler(self: Arc<Self>) {
        loop {
            if self.addr_manager.need_more_addrs().await {
                let peers = self.peers().await;
                if !peers.is_empty() {
                    let index = rand::thread_rng().gen_range(0..peers.len());
                    let peer = peers[index].clone();
                    self.send_async(&peer, Message::AddrReq).await;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(ADDRESS_RETRY_INTERVAL) => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    async fn heart_beat_handler(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEART_BEAT_INTERVAL) => {
                    self.broadcast(Message::Ping(PingMsg { state: 1 })).await;
                }
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    // =========================================================================
    // Send primitives
    // =========================================================================

    /// Send a message to every neighbor that does not already know it.
    /// For any message id and peer, transmission is attempted at most once.
    pub async fn broadcast(&self, msg: Message) {
        log::debug!(
            "broadcast {} message (id: {}) to neighbors",
            msg.kind(),
            msg.id_hex()
        );
        let local = self.local_address().await;
        for peer in self.peers().await {
            if peer.known_msg(&msg).await {
                continue;
            }
            tokio::spawn(Self::send_async_to(
                peer,
                msg.clone(),
                local.clone(),
                self.stall_tx.clone(),
                self.cancel.clone(),
            ));
        }
    }

    /// Send a message to the peer with this address.
    pub async fn send_msg(&self, addr: &NetAddress, msg: Message) -> Result<(), ServerError> {
        let peer = self
            .peer_by_address(addr)
            .await
            .ok_or_else(|| {
                log::error!("no active peer with address {}", addr);
                ServerError::NoActivePeer(addr.clone())
            })?;
        self.send_async(&peer, msg).await;
        Ok(())
    }

    /// Fan a request out to every peer whose reported height satisfies the
    /// filter. Responses arrive on the upward message channel.
    pub async fn gather<F>(&self, filter: F, req: Message) -> Result<(), ServerError>
    where
        F: Fn(u64) -> bool,
    {
        if !self.running.load(Ordering::SeqCst) {
            log::error!("p2p server have not been started yet");
            return Err(ServerError::NotRunning);
        }
        let mut matching: Vec<Arc<Peer>> = Vec::new();
        for peer in self.peers().await {
            if filter(peer.state().await) {
                matching.push(peer);
            }
        }
        if matching.is_empty() {
            return Err(ServerError::NoSuitablePeer);
        }
        for peer in &matching {
            self.send_async(peer, req.clone()).await;
        }
        Ok(())
    }

    async fn send_async(&self, peer: &Arc<Peer>, msg: Message) {
        Self::send_async_to(
            peer.clone(),
            msg,
            self.local_address().await,
            self.stall_tx.clone(),
            self.cancel.clone(),
        )
        .await;
    }

    // Fire-and-forget: enqueue the message and register the expected
    // response; a failed enqueue means the peer died and the router will
    // observe its Disconnect.
    async fn send_async_to(
        peer: Arc<Peer>,
        msg: Message,
        local: NetAddress,
        stall_tx: mpsc::Sender<StallEvent>,
        cancel: CancellationToken,
    ) {
        let to = peer.addr().await;
        log::debug!("send {} message to peer {}", msg.kind(), to);
        let expect = msg.response_kind();
        let envelope = InternalMsg {
            from: local,
            to: to.clone(),
            payload: Payload::Wire(msg),
            resp: None,
        };
        if peer.send_msg(envelope).await.is_err() {
            return;
        }
        if let Some(expect) = expect {
            tokio::select! {
                _ = stall_tx.send(StallEvent::Sent { to, expect }) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    /// Send and wait for the write outcome, up to the sync-send timeout.
    async fn send_sync(&self, peer: &Arc<Peer>, msg: Message) -> Result<(), ServerError> {
        let to = peer.addr().await;
        log::debug!("send {} message to peer {}", msg.kind(), to);
        let expect = msg.response_kind();
        let (resp_tx, resp_rx) = oneshot::channel();
        let envelope = InternalMsg {
            from: self.local_address().await,
            to: to.clone(),
            payload: Payload::Wire(msg),
            resp: Some(resp_tx),
        };
        peer.send_msg(envelope).await?;
        if let Some(expect) = expect {
            self.stall_send(StallEvent::Sent {
                to: to.clone(),
                expect,
            })
            .await;
        }
        match tokio::time::timeout(SEND_SYNC_TIMEOUT, resp_rx).await {
            Err(_) => Err(ServerError::SendTimeout(to)),
            Ok(Err(_)) => Err(ServerError::Peer(PeerError::Stopped(to))),
            Ok(Ok(result)) => result.map_err(ServerError::from),
        }
    }

    async fn stall_send(&self, event: StallEvent) -> bool {
        tokio::select! {
            result = self.stall_tx.send(event) => result.is_ok(),
            _ = self.cancel.cancelled() => false,
        }
    }
}
