//! Stall detection for unanswered requests.
//!
//! The detector owns a single table of pending responses keyed by remote
//! address and expected response kind. Requests that declare a response
//! kind register a deadline; matching inbound traffic cancels it; expired
//! deadlines ask the server to evict the peer.

use crate::message::MessageKind;
use crate::net_address::NetAddress;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Input events of the stall detector
#[derive(Debug, Clone)]
pub enum StallEvent {
    /// We sent a request that expects a response of the given kind
    Sent {
        to: NetAddress,
        expect: MessageKind,
    },
    /// We received a message of the given kind from the given peer
    Received {
        from: NetAddress,
        kind: MessageKind,
    },
    /// Drop every pending entry for the given peer
    Clear { addr: NetAddress },
}

/// Per-destination pending-response table with deadline enforcement.
/// The table is owned by the detector task; there is no locking.
pub struct StallDetector {
    tick: Duration,
    timeout: Duration,
    pending: HashMap<NetAddress, HashMap<MessageKind, Instant>>,
}

impl StallDetector {
    pub fn new(tick: Duration, timeout: Duration) -> Self {
        Self {
            tick,
            timeout,
            pending: HashMap::new(),
        }
    }

    /// Consume events and scan for expired deadlines until cancelled.
    /// Peers with an expired entry are reported on `evict_tx`.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<StallEvent>,
        evict_tx: mpsc::Sender<NetAddress>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.apply(event),
                    None => return,
                },
                _ = ticker.tick() => {
                    for addr in self.expired(Instant::now()) {
                        log::error!("pending response from peer {} timed out", addr);
                        tokio::select! {
                            result = evict_tx.send(addr) => {
                                if result.is_err() {
                                    return;
                                }
                            }
                            _ = cancel.cancelled() => return,
                        }
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    fn apply(&mut self, event: StallEvent) {
        match event {
            StallEvent::Sent { to, expect } => {
                log::debug!("stall handler registers a {} response from peer {}", expect, to);
                let deadline = Instant::now() + self.timeout;
                // earliest deadline wins; never overwrite
                self.pending
                    .entry(to)
                    .or_default()
                    .entry(expect)
                    .or_insert(deadline);
            }
            StallEvent::Received { from, kind } => {
                if let Some(kinds) = self.pending.get_mut(&from) {
                    kinds.remove(&kind);
                    if kinds.is_empty() {
                        self.pending.remove(&from);
                    }
                }
            }
            StallEvent::Clear { addr } => {
                log::debug!("stall handler clears {}'s pending responses", addr);
                self.pending.remove(&addr);
            }
        }
    }

    // One eviction per peer per scan: the peer's whole entry goes with it.
    fn expired(&mut self, now: Instant) -> Vec<NetAddress> {
        let mut timed_out = Vec::new();
        self.pending.retain(|addr, kinds| {
            if kinds.values().any(|deadline| *deadline <= now) {
                timed_out.push(addr.clone());
                false
            } else {
                true
            }
        });
        timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn addr(s: &str) -> NetAddress {
        NetAddress::parse(s).unwrap()
    }

    fn spawn_detector() -> (
        mpsc::Sender<StallEvent>,
        mpsc::Receiver<NetAddress>,
        CancellationToken,
    ) {
        let detector = StallDetector::new(Duration::from_secs(1), Duration::from_secs(5));
        let (event_tx, event_rx) = mpsc::channel(1);
        let (evict_tx, evict_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        tokio::spawn(detector.run(event_rx, evict_tx, cancel.clone()));
        (event_tx, evict_rx, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_evicts_peer() {
        let (event_tx, mut evict_rx, _cancel) = spawn_detector();
        let peer = addr("tcp://10.0.0.1:9000");

        event_tx
            .send(StallEvent::Sent {
                to: peer.clone(),
                expect: MessageKind::Block,
            })
            .await
            .unwrap();

        let evicted = evict_rx.recv().await.unwrap();
        assert_eq!(evicted, peer);

        // the entry is dropped with the eviction; no repeat
        assert!(timeout(Duration::from_secs(30), evict_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_response_cancels_deadline() {
        let (event_tx, mut evict_rx, _cancel) = spawn_detector();
        let peer = addr("tcp://10.0.0.1:9000");

        event_tx
            .send(StallEvent::Sent {
                to: peer.clone(),
                expect: MessageKind::Pong,
            })
            .await
            .unwrap();
        event_tx
            .send(StallEvent::Received {
                from: peer.clone(),
                kind: MessageKind::Pong,
            })
            .await
            .unwrap();

        assert!(timeout(Duration::from_secs(30), evict_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrelated_response_does_not_cancel() {
        let (event_tx, mut evict_rx, _cancel) = spawn_detector();
        let peer = addr("tcp://10.0.0.1:9000");

        event_tx
            .send(StallEvent::Sent {
                to: peer.clone(),
                expect: MessageKind::Block,
            })
            .await
            .unwrap();
        event_tx
            .send(StallEvent::Received {
                from: peer.clone(),
                kind: MessageKind::Pong,
            })
            .await
            .unwrap();

        assert_eq!(evict_rx.recv().await.unwrap(), peer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_all_pending_entries() {
        let (event_tx, mut evict_rx, _cancel) = spawn_detector();
        let peer = addr("tcp://10.0.0.1:9000");

        event_tx
            .send(StallEvent::Sent {
                to: peer.clone(),
                expect: MessageKind::Block,
            })
            .await
            .unwrap();
        event_tx
            .send(StallEvent::Sent {
                to: peer.clone(),
                expect: MessageKind::Pong,
            })
            .await
            .unwrap();
        event_tx
            .send(StallEvent::Clear { addr: peer.clone() })
            .await
            .unwrap();

        assert!(timeout(Duration::from_secs(30), evict_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_detector() {
        let (event_tx, _evict_rx, cancel) = spawn_detector();
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // the detector is gone; its receiver is dropped
        assert!(event_tx
            .send(StallEvent::Clear {
                addr: addr("tcp://10.0.0.1:9000"),
            })
            .await
            .is_err());
    }
}
