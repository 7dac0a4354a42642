//! Peer lifecycle: version handshake, post-handshake receive/send loops,
//! and the known-message cache that backs broadcast deduplication.
//!
//! A peer owns exactly one connection session. Control-plane traffic
//! (handshake, reject) terminates here; everything else is forwarded to
//! the server as an [`InternalMsg`].

use crate::codec::WireError;
use crate::conn::{PeerConn, SessionEvent};
use crate::message::{Message, MessageKind, RejectMsg, ServiceFlags, VersionMsg};
use crate::net_address::NetAddress;
use crate::ring_buffer::RingBuffer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Deadline for each individual handshake frame read
pub const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the per-peer known-message cache
pub const KNOWN_MSG_CACHE_SIZE: usize = 1024;

/// Local node identity copied into each peer and into the handshake
/// greeting.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Protocol version string
    pub version: String,
    /// Our own listen address
    pub addr: NetAddress,
    /// Services we support
    pub services: ServiceFlags,
    /// Our last known chain height
    pub height: u64,
}

/// Payload of an [`InternalMsg`]: either real wire traffic or a synthetic
/// in-process signal. The synthetic variants can never be serialized to
/// the wire.
#[derive(Debug)]
pub enum Payload {
    Wire(Message),
    /// The peer's session died for the given reason
    Disconnect(String),
}

/// Envelope passed between peers and the server
#[derive(Debug)]
pub struct InternalMsg {
    pub from: NetAddress,
    pub to: NetAddress,
    pub payload: Payload,
    /// Present on synchronous sends: receives the write outcome
    pub resp: Option<oneshot::Sender<Result<(), WireError>>>,
}

/// Peer-level errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("failed to dial peer {0}: {1}")]
    ConnectionFailed(NetAddress, #[source] std::io::Error),
    #[error("peer {0} has already been started")]
    AlreadyStarted(NetAddress),
    #[error("peer {0} has stopped")]
    Stopped(NetAddress),
    #[error("no established connection for inbound peer {0}")]
    NoConnection(NetAddress),
    #[error("read {1} message from peer {0} timed out")]
    HandshakeTimeout(NetAddress, MessageKind),
    #[error("incompatible service flags from peer {0}")]
    IncompatibleService(NetAddress),
    #[error("unexpected {actual} message from peer {addr}, expected {expected}")]
    ProtocolViolation {
        addr: NetAddress,
        expected: MessageKind,
        actual: MessageKind,
    },
    #[error("session error with peer {0}: {1}")]
    Session(NetAddress, #[source] WireError),
}

/// A remote node we have (or are establishing) a session with
pub struct Peer {
    info: PeerInfo,
    addr: RwLock<NetAddress>,
    outbound: bool,
    persistent: bool,
    state: RwLock<u64>,
    running: AtomicBool,
    conn: Mutex<Option<Arc<PeerConn>>>,
    session_tx: mpsc::Sender<SessionEvent>,
    session_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    send_tx: mpsc::Sender<InternalMsg>,
    send_rx: Mutex<Option<mpsc::Receiver<InternalMsg>>>,
    recv_tx: mpsc::Sender<InternalMsg>,
    known_msgs: RingBuffer,
    cancel: CancellationToken,
}

impl Peer {
    /// A peer that dialed us; the accepted stream is handed over here.
    pub fn inbound(
        info: PeerInfo,
        addr: NetAddress,
        recv_tx: mpsc::Sender<InternalMsg>,
        stream: TcpStream,
    ) -> Self {
        let mut peer = Self::new(info, addr, false, false, recv_tx);
        let conn = Arc::new(PeerConn::new(stream, peer.session_tx.clone()));
        peer.conn = Mutex::new(Some(conn));
        peer
    }

    /// A peer we will dial when started.
    pub fn outbound(
        info: PeerInfo,
        addr: NetAddress,
        persistent: bool,
        recv_tx: mpsc::Sender<InternalMsg>,
    ) -> Self {
        Self::new(info, addr, true, persistent, recv_tx)
    }

    fn new(
        info: PeerInfo,
        addr: NetAddress,
        outbound: bool,
        persistent: bool,
        recv_tx: mpsc::Sender<InternalMsg>,
    ) -> Self {
        let (session_tx, session_rx) = mpsc::channel(1);
        let (send_tx, send_rx) = mpsc::channel(1);
        Self {
            info,
            addr: RwLock::new(addr),
            outbound,
            persistent,
            state: RwLock::new(0),
            running: AtomicBool::new(false),
            conn: Mutex::new(None),
            session_tx,
            session_rx: Mutex::new(Some(session_rx)),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            recv_tx,
            known_msgs: RingBuffer::new(KNOWN_MSG_CACHE_SIZE),
            cancel: CancellationToken::new(),
        }
    }

    /// Establish the session (dialing first for outbound peers), run the
    /// handshake, then spawn the receive and send loops.
    pub async fn start(self: Arc<Self>) -> Result<(), PeerError> {
        let addr = self.addr().await;
        if self.running.swap(true, Ordering::SeqCst) {
            log::error!("peer {} has already been started", addr);
            return Err(PeerError::AlreadyStarted(addr));
        }
        let mut session_rx = self
            .session_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| PeerError::AlreadyStarted(addr.clone()))?;

        let conn = if self.outbound {
            log::info!("start outbound peer {}", addr);
            let conn = self.dial().await?;
            *self.conn.lock().await = Some(conn.clone());
            conn.start().await;
            if let Err(err) = self.handshake_outbound(&mut session_rx, &conn).await {
                log::info!("failed to hand shake with outbound peer {}: {}", addr, err);
                conn.stop().await;
                return Err(err);
            }
            conn
        } else {
            log::info!("start inbound peer {}", addr);
            let conn = self
                .conn
                .lock()
                .await
                .clone()
                .ok_or_else(|| PeerError::NoConnection(addr.clone()))?;
            conn.start().await;
            if let Err(err) = self.handshake_inbound(&mut session_rx, &conn).await {
                log::info!("failed to hand shake with inbound peer {}: {}", addr, err);
                conn.stop().await;
                return Err(err);
            }
            conn
        };

        let send_rx = self
            .send_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| PeerError::AlreadyStarted(addr))?;
        tokio::spawn(Self::recv_loop(self.clone(), conn.clone(), session_rx));
        tokio::spawn(Self::send_loop(self.clone(), conn, send_rx));
        Ok(())
    }

    /// Idempotent; safe to call from any task.
    pub async fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        log::info!("stop peer {}", self.addr().await);
        let conn = self.conn.lock().await.clone();
        if let Some(conn) = conn {
            conn.stop().await;
        }
        self.cancel.cancel();
    }

    /// Enqueue an outbound envelope onto the send loop.
    pub async fn send_msg(&self, msg: InternalMsg) -> Result<(), PeerError> {
        let addr = self.addr().await;
        tokio::select! {
            result = self.send_tx.send(msg) => {
                result.map_err(|_| PeerError::Stopped(addr.clone()))
            }
            _ = self.cancel.cancelled() => Err(PeerError::Stopped(addr)),
        }
    }

    pub async fn addr(&self) -> NetAddress {
        self.addr.read().await.clone()
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Last height reported by the remote
    pub async fn state(&self) -> u64 {
        *self.state.read().await
    }

    pub async fn set_state(&self, state: u64) {
        *self.state.write().await = state;
    }

    /// Whether this peer already knows the given message
    pub async fn known_msg(&self, msg: &Message) -> bool {
        match msg.msg_id() {
            Some(id) => self.known_msgs.exists(&id).await,
            None => false,
        }
    }

    async fn dial(&self) -> Result<Arc<PeerConn>, PeerError> {
        let addr = self.addr().await;
        log::debug!("start init the connection to peer {}", addr);
        let stream = TcpStream::connect(addr.socket_addr())
            .await
            .map_err(|err| PeerError::ConnectionFailed(addr.clone(), err))?;
        Ok(Arc::new(PeerConn::new(stream, self.session_tx.clone())))
    }

    // Outbound leads: send Version, read Version, send ack, read ack.
    async fn handshake_outbound(
        &self,
        rx: &mut mpsc::Receiver<SessionEvent>,
        conn: &PeerConn,
    ) -> Result<(), PeerError> {
        self.send_version(conn).await?;
        self.read_version(rx).await?;
        self.send_version_ack(conn).await?;
        self.read_version_ack(rx).await
    }

    // Inbound mirrors the outbound order.
    async fn handshake_inbound(
        &self,
        rx: &mut mpsc::Receiver<SessionEvent>,
        conn: &PeerConn,
    ) -> Result<(), PeerError> {
        self.read_version(rx).await?;
        self.send_version(conn).await?;
        self.read_version_ack(rx).await?;
        self.send_version_ack(conn).await
    }

    async fn send_version(&self, conn: &PeerConn) -> Result<(), PeerError> {
        let addr = self.addr().await;
        let msg = Message::Version(VersionMsg {
            version: self.info.version.clone(),
            port: self.info.addr.port,
            services: self.info.services,
        });
        conn.send(msg)
            .await
            .map_err(|err| PeerError::Session(addr, err))
    }

    async fn send_version_ack(&self, conn: &PeerConn) -> Result<(), PeerError> {
        let addr = self.addr().await;
        conn.send(Message::VersionAck)
            .await
            .map_err(|err| PeerError::Session(addr, err))
    }

    async fn read_version(&self, rx: &mut mpsc::Receiver<SessionEvent>) -> Result<(), PeerError> {
        let msg = self.read_message_with_kind(rx, MessageKind::Version).await?;
        if let Message::Version(version) = msg {
            if version.services != self.info.services {
                return Err(PeerError::IncompatibleService(self.addr().await));
            }
            if !self.outbound {
                // the dialing side's source port is ephemeral; adopt the
                // advertised listen port as the canonical remote address
                self.addr.write().await.port = version.port;
            }
        }
        Ok(())
    }

    async fn read_version_ack(
        &self,
        rx: &mut mpsc::Receiver<SessionEvent>,
    ) -> Result<(), PeerError> {
        self.read_message_with_kind(rx, MessageKind::VersionAck)
            .await?;
        Ok(())
    }

    async fn read_message_with_kind(
        &self,
        rx: &mut mpsc::Receiver<SessionEvent>,
        kind: MessageKind,
    ) -> Result<Message, PeerError> {
        let addr = self.addr().await;
        match tokio::time::timeout(HANDSHAKE_READ_TIMEOUT, rx.recv()).await {
            Err(_) => {
                log::warn!("read {} message from peer {} timed out", kind, addr);
                Err(PeerError::HandshakeTimeout(addr, kind))
            }
            Ok(None) => Err(PeerError::Session(addr, WireError::Closed)),
            Ok(Some(SessionEvent::Disconnected(err))) => Err(PeerError::Session(addr, err)),
            Ok(Some(SessionEvent::Message(msg))) => {
                if msg.kind() == kind {
                    Ok(msg)
                } else {
                    log::warn!(
                        "error type message received from peer {}, expected: {}, actual: {}",
                        addr,
                        kind,
                        msg.kind()
                    );
                    Err(PeerError::ProtocolViolation {
                        addr,
                        expected: kind,
                        actual: msg.kind(),
                    })
                }
            }
        }
    }

    async fn recv_loop(
        peer: Arc<Peer>,
        conn: Arc<PeerConn>,
        mut rx: mpsc::Receiver<SessionEvent>,
    ) {
        // the remote address is stable once the handshake adopted the port
        let addr = peer.addr().await;
        loop {
            let event = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
                _ = peer.cancel.cancelled() => return,
            };
            let msg = match event {
                SessionEvent::Message(msg) => msg,
                SessionEvent::Disconnected(err) => {
                    peer.disconnect_notify(&err.to_string()).await;
                    return;
                }
            };

            log::debug!("receive {} message from peer {}", msg.kind(), addr);
            if let Some(id) = msg.msg_id() {
                peer.known_msgs.add(id).await;
            }

            let kind = msg.kind();
            match msg {
                Message::Version(_) | Message::VersionAck => {
                    let reject = Message::Reject(RejectMsg {
                        reason: format!("invalid message, as {} messages can only be sent once", kind),
                    });
                    let _ = conn.send(reject).await;
                    peer.disconnect_notify("received an invalid message from remote")
                        .await;
                    return;
                }
                Message::Reject(reject) => {
                    log::error!(
                        "receive a reject message from peer {}, reject reason: {}",
                        addr,
                        reject.reason
                    );
                    peer.disconnect_notify(&reject.reason).await;
                    return;
                }
                other => {
                    let imsg = InternalMsg {
                        from: addr.clone(),
                        to: peer.info.addr.clone(),
                        payload: Payload::Wire(other),
                        resp: None,
                    };
                    if !peer.forward(imsg).await {
                        return;
                    }
                }
            }
        }
    }

    async fn send_loop(peer: Arc<Peer>, conn: Arc<PeerConn>, mut rx: mpsc::Receiver<InternalMsg>) {
        let addr = peer.addr().await;
        loop {
            let msg = tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => return,
                },
                _ = peer.cancel.cancelled() => return,
            };
            let InternalMsg { payload, resp, .. } = msg;
            if let Payload::Wire(wire) = payload {
                if let Some(id) = wire.msg_id() {
                    peer.known_msgs.add(id).await;
                }
                let result = conn.send(wire).await;
                if let Err(err) = &result {
                    log::error!("failed to send message to peer {}: {}", addr, err);
                }
                if let Some(resp) = resp {
                    let _ = resp.send(result);
                }
            }
        }
    }

    /// Push a message toward the server, giving up if the peer stops first.
    async fn forward(&self, msg: InternalMsg) -> bool {
        tokio::select! {
            result = self.recv_tx.send(msg) => result.is_ok(),
            _ = self.cancel.cancelled() => {
                log::warn!("peer {} have been closed", self.addr().await);
                false
            }
        }
    }

    async fn disconnect_notify(&self, reason: &str) {
        let addr = self.addr().await;
        log::debug!("call disconnect notify for {}: {}", addr, reason);
        let msg = InternalMsg {
            from: addr,
            to: self.info.addr.clone(),
            payload: Payload::Disconnect(reason.to_string()),
            resp: None,
        };
        self.forward(msg).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{BlockMsg, PingMsg, ServiceFlags, PROTOCOL_VERSION};
    use std::net::IpAddr;

    fn local_info(port: u16) -> PeerInfo {
        PeerInfo {
            version: PROTOCOL_VERSION.to_string(),
            addr: NetAddress::new("127.0.0.1".parse::<IpAddr>().unwrap(), port),
            services: ServiceFlags::TX_RELAY,
            height: 0,
        }
    }

    #[tokio::test]
    async fn test_outbound_peer_state() {
        let (recv_tx, _recv_rx) = mpsc::channel(1);
        let addr = NetAddress::parse("tcp://10.0.0.1:9000").unwrap();
        let peer = Peer::outbound(local_info(8000), addr.clone(), true, recv_tx);

        assert!(peer.is_outbound());
        assert!(peer.is_persistent());
        assert_eq!(peer.addr().await, addr);
        assert_eq!(peer.state().await, 0);
        peer.set_state(42).await;
        assert_eq!(peer.state().await, 42);
    }

    #[tokio::test]
    async fn test_known_msg_tracks_only_ids() {
        let (recv_tx, _recv_rx) = mpsc::channel(1);
        let addr = NetAddress::parse("tcp://10.0.0.1:9000").unwrap();
        let peer = Peer::outbound(local_info(8000), addr, false, recv_tx);

        let ping = Message::Ping(PingMsg { state: 1 });
        assert!(!peer.known_msg(&ping).await);

        let block = Message::Block(BlockMsg {
            id: [5u8; 32],
            height: 1,
            body: vec![],
        });
        assert!(!peer.known_msg(&block).await);
        peer.known_msgs.add([5u8; 32]).await;
        assert!(peer.known_msg(&block).await);
        // id-less messages are never "known"
        assert!(!peer.known_msg(&ping).await);
    }

    #[tokio::test]
    async fn test_dial_failure_is_reported() {
        let (recv_tx, _recv_rx) = mpsc::channel(1);
        // nothing listens on this port
        let addr = NetAddress::parse("tcp://127.0.0.1:1").unwrap();
        let peer = Arc::new(Peer::outbound(local_info(8000), addr, false, recv_tx));
        let err = peer.clone().start().await.unwrap_err();
        assert!(matches!(err, PeerError::ConnectionFailed(_, _)));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (recv_tx, _recv_rx) = mpsc::channel(1);
        let addr = NetAddress::parse("tcp://10.0.0.1:9000").unwrap();
        let peer = Peer::outbound(local_info(8000), addr, false, recv_tx);
        peer.stop().await;
        peer.stop().await;
    }
}
