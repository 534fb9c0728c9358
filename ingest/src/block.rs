//! Buffer out-of-order results into fixed-size, contiguous blocks.
//!
//! # Blocks
//!
//! A block of size `B` is identified by the smallest multiple of `B` that is greater than or equal to
//! every index it holds (see [block_id]) and covers the range `(block_id - B, block_id]`. Block ranges
//! partition the indices into contiguous windows that never overlap.
//!
//! # Completion
//!
//! Each live block tracks the indices of its range that have not been recorded yet. The insertion
//! that records the last missing index completes the block: the block is removed from the [Store]
//! and handed to a [Flush] exactly once. [crate::RESERVED_INDEX] and any index below the start index
//! of the [Store] are never waited on.
//!
//! # Concurrency
//!
//! Live blocks are spread over independently locked partitions and each block has its own lock, so
//! insertions into different blocks do not wait on each other beyond a short map lookup. The
//! completion check of a block runs under that block's lock only.

use crate::{gaps::Tracker, Block, Error, Flush, Metrics, RESERVED_INDEX};
use std::{
    collections::{BTreeSet, HashMap},
    mem,
    num::NonZeroU64,
    sync::{Arc, Mutex},
};
use tracing::{debug, warn};

/// Number of independently locked partitions of live blocks.
const PARTITIONS: usize = 16;

/// Identifier of the block that holds `index`.
pub fn block_id(index: u64, block_size: NonZeroU64) -> u64 {
    let remainder = index % block_size;
    if remainder == 0 {
        return index;
    }
    index + (block_size.get() - remainder)
}

/// Exclusive start and inclusive end of the block identified by `block_id`.
///
/// The start is clamped at zero.
pub fn range(block_id: u64, block_size: NonZeroU64) -> (u64, u64) {
    (block_id.saturating_sub(block_size.get()), block_id)
}

/// Outcome of a successful [Store::insert].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Insertion {
    /// The block still has missing indices.
    Pending(u64),
    /// The insertion completed the block, which was handed off for flushing.
    Completed(u64),
}

impl Insertion {
    /// Identifier of the block the index was recorded in.
    pub fn block_id(&self) -> u64 {
        match self {
            Self::Pending(block_id) | Self::Completed(block_id) => *block_id,
        }
    }

    /// Whether the insertion completed its block.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// A block that is still filling.
struct Pending<P> {
    tracker: Tracker,
    entries: Vec<(u64, Option<P>)>,
    reserved: bool,
    flushed: bool,
}

/// Blocks that were already flushed.
///
/// Every block at or below `floor` is done; out-of-order completions above it are kept until the
/// blocks in between complete.
struct Completed {
    block_size: u64,
    floor: u64,
    above: BTreeSet<u64>,
}

impl Completed {
    fn contains(&self, block_id: u64) -> bool {
        block_id <= self.floor || self.above.contains(&block_id)
    }

    fn insert(&mut self, block_id: u64) {
        self.above.insert(block_id);
        while self.above.remove(&(self.floor + self.block_size)) {
            self.floor += self.block_size;
        }
    }
}

type Partition<P> = HashMap<u64, Arc<Mutex<Pending<P>>>>;

/// Tracks live blocks and hands completed ones to a [Flush].
pub struct Store<P, F: Flush<P>> {
    block_size: NonZeroU64,
    start: u64,
    partitions: Vec<Mutex<Partition<P>>>,
    completed: Mutex<Completed>,
    flusher: F,
    metrics: Metrics,
}

impl<P: Send + 'static, F: Flush<P>> Store<P, F> {
    /// Create a store for blocks of `block_size` indices, beginning at index `start`.
    ///
    /// Indices below `start` are considered accounted for (and rejected if inserted). The
    /// smallest supported start is 1.
    pub fn new(block_size: NonZeroU64, start: u64, flusher: F, metrics: Metrics) -> Self {
        let start = start.max(1);
        let floor = block_id(start, block_size) - block_size.get();
        Self {
            block_size,
            start,
            partitions: (0..PARTITIONS).map(|_| Mutex::default()).collect(),
            completed: Mutex::new(Completed {
                block_size: block_size.get(),
                floor,
                above: BTreeSet::new(),
            }),
            flusher,
            metrics,
        }
    }

    /// Lowest index accepted by the store.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Record the result fetched for `index`.
    ///
    /// If this supplies the last missing index of its block, the block is removed from the store
    /// and flushed. Exactly one insertion per block observes [Insertion::Completed].
    pub fn insert(&self, index: u64, result: Option<P>) -> Result<Insertion, Error> {
        let inserted = self.record(index, result);
        if let Err(err) = &inserted {
            warn!(index, ?err, "rejected insertion");
            self.metrics.rejected.inc();
        }
        inserted
    }

    fn record(&self, index: u64, result: Option<P>) -> Result<Insertion, Error> {
        if index < self.start {
            return Err(Error::BelowStart {
                index,
                start: self.start,
            });
        }
        let block_id = block_id(index, self.block_size);
        let pending = self
            .live(block_id)
            .ok_or(Error::Stale { index, block_id })?;

        // Record the result and check for completion
        let entries = {
            let mut pending = pending.lock().unwrap();
            if pending.flushed {
                return Err(Error::Stale { index, block_id });
            }
            if !pending.tracker.observe(index) {
                if index != RESERVED_INDEX || pending.reserved {
                    return Err(Error::Duplicate { index, block_id });
                }
                pending.reserved = true;
            }
            pending.entries.push((index, result));
            if !pending.tracker.is_complete() {
                return Ok(Insertion::Pending(block_id));
            }
            pending.flushed = true;
            mem::take(&mut pending.entries)
        };

        // Forget the block before handing it off
        {
            let mut partition = self.partition(block_id).lock().unwrap();
            partition.remove(&block_id);
            self.completed.lock().unwrap().insert(block_id);
        }
        self.metrics.pending_blocks.dec();
        self.metrics.completed_blocks.inc();
        debug!(block_id, entries = entries.len(), "block completed");
        self.flusher.flush(Block {
            id: block_id,
            entries,
        });
        Ok(Insertion::Completed(block_id))
    }

    /// Fetch the live block `block_id`, creating it if it was never seen.
    ///
    /// Returns `None` if the block was already flushed.
    fn live(&self, block_id: u64) -> Option<Arc<Mutex<Pending<P>>>> {
        let mut partition = self.partition(block_id).lock().unwrap();
        if let Some(pending) = partition.get(&block_id) {
            return Some(pending.clone());
        }
        if self.completed.lock().unwrap().contains(block_id) {
            return None;
        }
        let (range_start, range_end) = range(block_id, self.block_size);
        let range_start = range_start.max(self.start - 1);
        let pending = Arc::new(Mutex::new(Pending {
            tracker: Tracker::new(range_start, range_end, &[RESERVED_INDEX]),
            entries: Vec::new(),
            reserved: false,
            flushed: false,
        }));
        partition.insert(block_id, pending.clone());
        self.metrics.pending_blocks.inc();
        Some(pending)
    }

    fn partition(&self, block_id: u64) -> &Mutex<Partition<P>> {
        let slot = (block_id / self.block_size) as usize % PARTITIONS;
        &self.partitions[slot]
    }

    /// Identifiers of the blocks that are still filling, in ascending order.
    pub fn pending(&self) -> Vec<u64> {
        let mut pending: Vec<u64> = self
            .partitions
            .iter()
            .flat_map(|partition| partition.lock().unwrap().keys().copied().collect::<Vec<_>>())
            .collect();
        pending.sort_unstable();
        pending
    }

    /// Number of blocks that are still filling.
    pub fn len(&self) -> usize {
        self.partitions
            .iter()
            .map(|partition| partition.lock().unwrap().len())
            .sum()
    }

    /// Whether no block is filling.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices still missing from the live block `block_id`.
    pub fn missing(&self, block_id: u64) -> Option<BTreeSet<u64>> {
        let pending = self.partition(block_id).lock().unwrap().get(&block_id)?.clone();
        let missing = pending.lock().unwrap().tracker.missing().clone();
        Some(missing)
    }

    /// Whether the block `block_id` was already flushed.
    pub fn is_flushed(&self, block_id: u64) -> bool {
        self.completed.lock().unwrap().contains(block_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mocks::Collector, NZU64};
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
    use std::{sync::mpsc, thread, time::Duration};
    use test_case::test_case;

    fn store(block_size: u64, start: u64) -> (Store<u64, Collector<u64>>, Collector<u64>) {
        let collector = Collector::default();
        let store = Store::new(
            NZU64!(block_size),
            start,
            collector.clone(),
            Metrics::default(),
        );
        (store, collector)
    }

    #[test_case(1, 4; "first_index")]
    #[test_case(3, 4; "inside")]
    #[test_case(4, 4; "multiple")]
    #[test_case(5, 8; "next_block")]
    #[test_case(0, 0; "zero")]
    #[test_case(4001, 8000; "large")]
    fn test_block_id(index: u64, expected: u64) {
        assert_eq!(block_id(index, NZU64!(4)), expected);
    }

    #[test]
    fn test_blocks_partition_indices() {
        let size = NZU64!(7);
        for index in 1..200u64 {
            let id = block_id(index, size);
            let (start, end) = range(id, size);
            assert_eq!(id % 7, 0);
            assert!(index > start && index <= end);
        }
        assert_eq!(range(4, NZU64!(4)), (0, 4));
        assert_eq!(range(0, NZU64!(4)), (0, 0));
    }

    #[test]
    fn test_completes_on_last_index() {
        let (store, collector) = store(4, 2);
        assert_eq!(store.insert(2, Some(2)).unwrap(), Insertion::Pending(4));
        assert_eq!(store.insert(4, None).unwrap(), Insertion::Pending(4));
        assert!(collector.blocks().is_empty());
        assert_eq!(store.insert(3, Some(3)).unwrap(), Insertion::Completed(4));

        let blocks = collector.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].id, 4);
        assert_eq!(blocks[0].entries, vec![(2, Some(2)), (4, None), (3, Some(3))]);
        assert!(store.is_empty());
        assert!(store.is_flushed(4));
    }

    #[test]
    fn test_reserved_index_never_missing() {
        let (store, collector) = store(4, 1);
        store.insert(2, Some(2)).unwrap();
        let missing = store.missing(4).unwrap();
        assert_eq!(missing.into_iter().collect::<Vec<_>>(), vec![3, 4]);

        store.insert(3, Some(3)).unwrap();
        assert!(store.insert(4, Some(4)).unwrap().is_completed());
        assert_eq!(collector.blocks().len(), 1);
    }

    #[test]
    fn test_reserved_index_may_be_recorded_once() {
        let (store, collector) = store(4, 1);
        store.insert(1, None).unwrap();
        assert!(matches!(
            store.insert(1, None),
            Err(Error::Duplicate { index: 1, block_id: 4 })
        ));
        store.insert(2, Some(2)).unwrap();
        store.insert(3, Some(3)).unwrap();
        assert!(store.insert(4, Some(4)).unwrap().is_completed());
        assert_eq!(collector.blocks()[0].entries.len(), 4);
    }

    #[test]
    fn test_resume_inside_block() {
        // Indices below the start were persisted before a restart
        let (store, collector) = store(4, 7);
        assert!(store.insert(6, Some(6)).is_err());
        assert!(store.insert(7, Some(7)).unwrap().block_id() == 8);
        assert!(store.insert(8, Some(8)).unwrap().is_completed());
        assert_eq!(collector.blocks()[0].entries, vec![(7, Some(7)), (8, Some(8))]);
    }

    #[test]
    fn test_rejects_stale_and_duplicate() {
        let (store, collector) = store(4, 2);
        store.insert(5, Some(5)).unwrap();
        assert!(matches!(
            store.insert(5, Some(5)),
            Err(Error::Duplicate { index: 5, block_id: 8 })
        ));

        for index in 2..=4 {
            store.insert(index, Some(index)).unwrap();
        }
        assert!(matches!(
            store.insert(3, Some(3)),
            Err(Error::Stale { index: 3, block_id: 4 })
        ));
        assert!(matches!(
            store.insert(1, None),
            Err(Error::BelowStart { index: 1, start: 2 })
        ));

        // The stale insertion did not resurrect the block
        assert_eq!(store.pending(), vec![8]);
        assert_eq!(collector.blocks().len(), 1);
    }

    #[test]
    fn test_out_of_order_blocks() {
        let (store, collector) = store(4, 2);
        for index in (5..=12).rev() {
            store.insert(index, None).unwrap();
        }
        assert_eq!(collector.blocks().len(), 2);
        assert_eq!(store.pending(), Vec::<u64>::new());
        assert!(store.is_flushed(8) && store.is_flushed(12));
        assert!(!store.is_flushed(4));

        for index in 2..=4 {
            store.insert(index, None).unwrap();
        }
        assert!(store.is_flushed(4));
        assert_eq!(store.completed.lock().unwrap().floor, 12);
        assert!(store.completed.lock().unwrap().above.is_empty());
    }

    #[test]
    fn test_concurrent_insertions_complete_once() {
        const BLOCK: u64 = 64;
        let (store, collector) = store(BLOCK, 2);
        let store = Arc::new(store);

        // Fill three blocks from many threads in a shuffled order
        let mut indices: Vec<u64> = (2..=3 * BLOCK).collect();
        indices.shuffle(&mut StdRng::seed_from_u64(3));
        let handles: Vec<_> = indices
            .chunks(13)
            .map(|chunk| {
                let store = store.clone();
                let chunk = chunk.to_vec();
                thread::spawn(move || {
                    chunk
                        .into_iter()
                        .map(|index| (index, store.insert(index, Some(index)).unwrap()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<(u64, Insertion)> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();

        // Exactly one completion per block, on the insertion that supplied the last index
        let blocks = collector.blocks();
        assert_eq!(blocks.len(), 3);
        for block in blocks {
            let completions: Vec<_> = results
                .iter()
                .filter(|(_, insertion)| *insertion == Insertion::Completed(block.id))
                .collect();
            assert_eq!(completions.len(), 1);
            let last = block.entries.last().unwrap().0;
            assert_eq!(completions[0].0, last);

            let expected = if block.id == BLOCK { BLOCK - 1 } else { BLOCK };
            assert_eq!(block.entries.len() as u64, expected);
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_blocks_do_not_contend() {
        let (store, collector) = store(4, 2);
        let store = Arc::new(store);

        // Hold the lock of block 4
        store.insert(2, Some(2)).unwrap();
        let held = store.partition(4).lock().unwrap().get(&4).cloned().unwrap();
        let guard = held.lock().unwrap();

        // Block 8 completes while block 4 is locked
        let (sender, receiver) = mpsc::channel();
        let writer = store.clone();
        let handle = thread::spawn(move || {
            for index in 5..=8 {
                sender.send(writer.insert(index, Some(index)).unwrap()).unwrap();
            }
        });
        let mut last = None;
        for _ in 5..=8 {
            last = Some(receiver.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        assert_eq!(last, Some(Insertion::Completed(8)));
        handle.join().unwrap();
        assert_eq!(collector.blocks().len(), 1);

        drop(guard);
        store.insert(3, Some(3)).unwrap();
        assert!(store.insert(4, Some(4)).unwrap().is_completed());
    }
}
