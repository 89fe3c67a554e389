//! Block memory: shard-owned regions holding sealed chunk bytes.
//!
//! Sealed chunks of one chunk set are copied into a single contiguous
//! allocation ([`Block`]) accounted against the owning shard's budget.
//! Readers hold [`BlockRef`]s, shared ownership of the block tied to the
//! reader's lifetime; the block's memory returns to the budget only when
//! the last reference drops.

use observability_deps::tracing::debug;
use snafu::{ensure, Snafu};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Block allocation errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum BlockError {
    #[snafu(display(
        "block memory exhausted: need {} bytes, {} of {} in use",
        need,
        used,
        budget
    ))]
    Exhausted {
        need: usize,
        used: usize,
        budget: usize,
    },
}

#[derive(Debug)]
struct Accounting {
    used: AtomicUsize,
    budget: usize,
}

/// One contiguous region of sealed chunk bytes.
#[derive(Debug)]
pub struct Block {
    data: Box<[u8]>,
    accounting: Arc<Accounting>,
}

impl Drop for Block {
    fn drop(&mut self) {
        self.accounting
            .used
            .fetch_sub(self.data.len(), Ordering::Relaxed);
    }
}

/// Shared handle to a byte range inside a [`Block`].
#[derive(Debug, Clone)]
pub struct BlockRef {
    block: Arc<Block>,
    offset: usize,
    len: usize,
}

impl BlockRef {
    /// The referenced bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.block.data[self.offset..self.offset + self.len]
    }

    /// Length of the referenced range.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Wrap loose bytes that are not owned by any block manager. Used for
    /// bytes freshly read from the remote store and in tests.
    pub fn unmanaged(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            block: Arc::new(Block {
                data: bytes.into_boxed_slice(),
                accounting: Arc::new(Accounting {
                    used: AtomicUsize::new(0),
                    budget: usize::MAX,
                }),
            }),
            offset: 0,
            len,
        }
    }
}

/// Allocates blocks for one shard under a fixed byte budget.
#[derive(Debug)]
pub struct BlockManager {
    accounting: Arc<Accounting>,
}

impl BlockManager {
    /// A manager enforcing `budget` total resident bytes.
    pub fn new(budget: usize) -> Self {
        Self {
            accounting: Arc::new(Accounting {
                used: AtomicUsize::new(0),
                budget,
            }),
        }
    }

    /// Copy the encoded columns of one chunk set into a single block,
    /// returning one [`BlockRef`] per column. Fails when the budget cannot
    /// hold the copy, which callers treat as eviction pressure.
    pub fn store(&self, columns: &[Vec<u8>]) -> Result<Vec<BlockRef>, BlockError> {
        let total: usize = columns.iter().map(|c| c.len()).sum();
        let used = self.accounting.used.load(Ordering::Relaxed);
        ensure!(
            used + total <= self.accounting.budget,
            ExhaustedSnafu {
                need: total,
                used,
                budget: self.accounting.budget,
            }
        );
        self.accounting.used.fetch_add(total, Ordering::Relaxed);

        let mut data = Vec::with_capacity(total);
        let mut ranges = Vec::with_capacity(columns.len());
        for col in columns {
            ranges.push((data.len(), col.len()));
            data.extend_from_slice(col);
        }
        let block = Arc::new(Block {
            data: data.into_boxed_slice(),
            accounting: Arc::clone(&self.accounting),
        });
        debug!(bytes = total, "stored chunk set in block memory");

        Ok(ranges
            .into_iter()
            .map(|(offset, len)| BlockRef {
                block: Arc::clone(&block),
                offset,
                len,
            })
            .collect())
    }

    /// Bytes currently resident.
    pub fn used_bytes(&self) -> usize {
        self.accounting.used.load(Ordering::Relaxed)
    }

    /// The configured budget.
    pub fn budget_bytes(&self) -> usize {
        self.accounting.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_store_and_read_back() {
        let manager = BlockManager::new(1024);
        let refs = manager
            .store(&[vec![1, 2, 3], vec![], vec![4, 5]])
            .unwrap();
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].as_slice(), &[1, 2, 3]);
        assert!(refs[1].is_empty());
        assert_eq!(refs[2].as_slice(), &[4, 5]);
        assert_eq!(manager.used_bytes(), 5);
    }

    #[test]
    fn test_budget_enforced_and_released() {
        let manager = BlockManager::new(10);
        let refs = manager.store(&[vec![0u8; 8]]).unwrap();
        assert_matches!(
            manager.store(&[vec![0u8; 4]]),
            Err(BlockError::Exhausted { need: 4, used: 8, budget: 10 })
        );

        // all refs to the block dropped: memory returns to the budget
        drop(refs);
        assert_eq!(manager.used_bytes(), 0);
        manager.store(&[vec![0u8; 4]]).unwrap();
    }

    #[test]
    fn test_refs_keep_block_alive() {
        let manager = BlockManager::new(100);
        let refs = manager.store(&[vec![9u8; 10], vec![7u8; 10]]).unwrap();
        let keep = refs[1].clone();
        drop(refs);
        // one column ref still alive holds the whole block
        assert_eq!(manager.used_bytes(), 20);
        assert_eq!(keep.as_slice(), &[7u8; 10]);
        drop(keep);
        assert_eq!(manager.used_bytes(), 0);
    }
}
