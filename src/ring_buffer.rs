//! Bounded recency cache of message identifiers.
//!
//! Used by every peer to suppress rebroadcast loops: an id that was already
//! sent to (or received from) the peer is never transmitted again, until it
//! falls off the least-recent end of the cache.

use crate::message::MsgId;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

struct Inner {
    entries: HashMap<MsgId, u64>,
    order: BTreeMap<u64, MsgId>,
    next_seq: u64,
}

/// Fixed-capacity insertion-ordered id set with move-to-front on re-add
pub struct RingBuffer {
    inner: RwLock<Inner>,
    limit: usize,
}

impl RingBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
            limit,
        }
    }

    /// Insert an id, moving it to most-recent if already present. Evicts
    /// the least-recent id when the cache overflows.
    pub async fn add(&self, id: MsgId) {
        let mut inner = self.inner.write().await;
        if let Some(seq) = inner.entries.get(&id).copied() {
            inner.order.remove(&seq);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, id);
        inner.entries.insert(id, seq);
        if inner.entries.len() > self.limit {
            let oldest = inner.order.iter().next().map(|(seq, id)| (*seq, *id));
            if let Some((seq, id)) = oldest {
                inner.order.remove(&seq);
                inner.entries.remove(&id);
            }
        }
    }

    pub async fn exists(&self, id: &MsgId) -> bool {
        self.inner.read().await.entries.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u16) -> MsgId {
        let mut id = [0u8; 32];
        id[..2].copy_from_slice(&n.to_be_bytes());
        id
    }

    #[tokio::test]
    async fn test_add_and_exists() {
        let ring = RingBuffer::new(4);
        ring.add(id(1)).await;
        assert!(ring.exists(&id(1)).await);
        assert!(!ring.exists(&id(2)).await);
        assert_eq!(ring.len().await, 1);
    }

    #[tokio::test]
    async fn test_readd_does_not_grow() {
        let ring = RingBuffer::new(4);
        ring.add(id(1)).await;
        ring.add(id(1)).await;
        assert_eq!(ring.len().await, 1);
    }

    #[tokio::test]
    async fn test_overflow_evicts_least_recent() {
        let ring = RingBuffer::new(2);
        ring.add(id(1)).await;
        ring.add(id(2)).await;
        ring.add(id(3)).await;
        assert!(!ring.exists(&id(1)).await);
        assert!(ring.exists(&id(2)).await);
        assert!(ring.exists(&id(3)).await);
    }

    #[tokio::test]
    async fn test_readd_moves_to_most_recent() {
        let ring = RingBuffer::new(2);
        ring.add(id(1)).await;
        ring.add(id(2)).await;
        ring.add(id(1)).await; // id 2 is now the least recent
        ring.add(id(3)).await;
        assert!(ring.exists(&id(1)).await);
        assert!(!ring.exists(&id(2)).await);
        assert!(ring.exists(&id(3)).await);
    }

    #[tokio::test]
    async fn test_capacity_bound_holds_over_many_inserts() {
        let ring = RingBuffer::new(1024);
        for n in 0..1025u16 {
            ring.add(id(n)).await;
        }
        assert_eq!(ring.len().await, 1024);
        assert!(!ring.exists(&id(0)).await);
        for n in 1..1025u16 {
            assert!(ring.exists(&id(n)).await, "id {} must survive", n);
        }
    }
}
