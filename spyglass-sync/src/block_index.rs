//! Chain-wide registry of block hashes currently downloading

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use bitcoin::BlockHash;

/// Deduplication registry shared by every subchain of one chain.
///
/// A hash is inserted when its height enters a download queue and removed
/// when the block is received. Keyed by hash, not height, because a reorg can
/// change which hash occupies a height. Constructed by the chain owner and
/// handed to each subchain; the lock is short-held and guards no business
/// logic.
#[derive(Debug, Clone, Default)]
pub struct BlockIndex {
    inner: Arc<Mutex<HashSet<BlockHash>>>,
}

impl BlockIndex {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a hash for download. Returns `false` if it is already
    /// reserved, in which case the caller must not schedule another request.
    pub fn try_reserve(&self, hash: &BlockHash) -> bool {
        self.inner
            .lock()
            .expect("block index lock poisoned")
            .insert(*hash)
    }

    /// Releases a hash once its block has been received or abandoned.
    pub fn release(&self, hash: &BlockHash) {
        self.inner
            .lock()
            .expect("block index lock poisoned")
            .remove(hash);
    }

    /// Whether a hash is currently reserved.
    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.inner
            .lock()
            .expect("block index lock poisoned")
            .contains(hash)
    }

    /// Number of reserved hashes.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("block index lock poisoned").len()
    }

    /// Whether no hash is reserved.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn reservation_is_exclusive_until_release() {
        let index = BlockIndex::new();
        let hash = BlockHash::from_byte_array([42; 32]);

        assert!(index.try_reserve(&hash));
        assert!(!index.try_reserve(&hash));
        assert!(index.contains(&hash));

        index.release(&hash);
        assert!(!index.contains(&hash));
        assert!(index.try_reserve(&hash));
    }

    #[test]
    fn concurrent_reservations_admit_exactly_one() {
        let index = BlockIndex::new();
        let hash = BlockHash::from_byte_array([42; 32]);

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let index = index.clone();
                    scope.spawn(move || usize::from(index.try_reserve(&hash)))
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).sum()
        });

        assert_eq!(winners, 1);
        assert_eq!(index.len(), 1);
    }
}
