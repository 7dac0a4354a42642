//! Local chain height lookup.
//!
//! The server answers Ping with the node's current height. The source of
//! that height is injected so the substrate never reaches into the state
//! layer directly.

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of the local chain height
pub trait HeightProvider: Send + Sync {
    fn local_height(&self) -> u64;
}

/// A constant height; used by seed nodes and tests
pub struct FixedHeight(pub u64);

impl HeightProvider for FixedHeight {
    fn local_height(&self) -> u64 {
        self.0
    }
}

/// Wraps a fallible height source and falls back to the last value it
/// managed to read when the source is unreachable.
pub struct CachedHeight<F> {
    source: F,
    last_known: AtomicU64,
}

impl<F> CachedHeight<F>
where
    F: Fn() -> Option<u64> + Send + Sync,
{
    pub fn new(source: F) -> Self {
        Self {
            source,
            last_known: AtomicU64::new(0),
        }
    }
}

impl<F> HeightProvider for CachedHeight<F>
where
    F: Fn() -> Option<u64> + Send + Sync,
{
    fn local_height(&self) -> u64 {
        match (self.source)() {
            Some(height) => {
                self.last_known.store(height, Ordering::Relaxed);
                height
            }
            None => self.last_known.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_fixed_height() {
        assert_eq!(FixedHeight(7).local_height(), 7);
    }

    #[test]
    fn test_cached_height_falls_back_to_last_known() {
        let reachable = AtomicBool::new(true);
        let provider = CachedHeight::new(|| {
            if reachable.load(Ordering::Relaxed) {
                Some(99)
            } else {
                None
            }
        });

        assert_eq!(provider.local_height(), 99);
        reachable.store(false, Ordering::Relaxed);
        assert_eq!(provider.local_height(), 99);
    }

    #[test]
    fn test_cached_height_defaults_to_zero() {
        let provider = CachedHeight::new(|| None);
        assert_eq!(provider.local_height(), 0);
    }
}
