//! Connection session: one TCP socket with a framed reader task and a
//! deadline-bounded writer.
//!
//! The session does not serialize writes itself beyond making them safe;
//! the owning peer's send loop is the only steady-state writer.

use crate::codec::{MessageCodec, WireError};
use crate::message::Message;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// Deadline applied to every frame write
pub const WRITE_DEADLINE: Duration = Duration::from_secs(60);

/// What the reader delivers to the owning peer
#[derive(Debug)]
pub enum SessionEvent {
    /// A decoded frame
    Message(Message),
    /// The reader terminated; no further events will follow
    Disconnected(WireError),
}

/// A framed TCP session to one remote peer
pub struct PeerConn {
    remote: String,
    reader: Mutex<Option<FramedRead<OwnedReadHalf, MessageCodec>>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, MessageCodec>>,
    event_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl PeerConn {
    pub fn new(stream: TcpStream, event_tx: mpsc::Sender<SessionEvent>) -> Self {
        let remote = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read_half, write_half) = stream.into_split();
        Self {
            remote,
            reader: Mutex::new(Some(FramedRead::new(read_half, MessageCodec))),
            writer: Mutex::new(FramedWrite::new(write_half, MessageCodec)),
            event_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the frame reader. Any decode or read error terminates the
    /// reader after it delivers a final `Disconnected` event.
    pub async fn start(&self) {
        let reader = self.reader.lock().await.take();
        let Some(reader) = reader else {
            return;
        };
        tokio::spawn(read_loop(
            reader,
            self.event_tx.clone(),
            self.cancel.clone(),
            self.remote.clone(),
        ));
    }

    /// Write one frame with the session write deadline.
    pub async fn send(&self, msg: Message) -> Result<(), WireError> {
        log::debug!(
            "send {} message (id: {}) to remote {}",
            msg.kind(),
            msg.id_hex(),
            self.remote
        );
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(WRITE_DEADLINE, writer.send(msg)).await {
            Ok(result) => result,
            Err(_) => Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write deadline exceeded",
            ))),
        }
    }

    /// Idempotent: cancels the reader and closes the socket.
    pub async fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }
}

async fn read_loop(
    mut reader: FramedRead<OwnedReadHalf, MessageCodec>,
    event_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    remote: String,
) {
    loop {
        let frame = tokio::select! {
            frame = reader.next() => frame,
            _ = cancel.cancelled() => return,
        };
        let event = match frame {
            Some(Ok(msg)) => SessionEvent::Message(msg),
            Some(Err(err)) => {
                log::error!("failed to read message from remote {}: {}", remote, err);
                SessionEvent::Disconnected(err)
            }
            None => SessionEvent::Disconnected(WireError::Closed),
        };
        let terminal = matches!(event, SessionEvent::Disconnected(_));
        tokio::select! {
            result = event_tx.send(event) => {
                if result.is_err() {
                    return;
                }
            }
            _ = cancel.cancelled() => return,
        }
        if terminal {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PingMsg;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_send_and_receive_one_frame() {
        let (a, b) = socket_pair().await;
        let (tx_a, _rx_a) = mpsc::channel(1);
        let (tx_b, mut rx_b) = mpsc::channel(1);

        let conn_a = PeerConn::new(a, tx_a);
        let conn_b = PeerConn::new(b, tx_b);
        conn_b.start().await;

        conn_a.send(Message::Ping(PingMsg { state: 3 })).await.unwrap();

        match rx_b.recv().await.unwrap() {
            SessionEvent::Message(Message::Ping(ping)) => assert_eq!(ping.state, 3),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_close_delivers_disconnect() {
        let (a, b) = socket_pair().await;
        let (tx_a, _rx_a) = mpsc::channel(1);
        let (tx_b, mut rx_b) = mpsc::channel(1);

        let conn_a = PeerConn::new(a, tx_a);
        let conn_b = PeerConn::new(b, tx_b);
        conn_b.start().await;

        conn_a.stop().await;

        match rx_b.recv().await.unwrap() {
            SessionEvent::Disconnected(_) => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (a, _b) = socket_pair().await;
        let (tx, _rx) = mpsc::channel(1);
        let conn = PeerConn::new(a, tx);
        conn.stop().await;
        conn.stop().await;
    }
}
