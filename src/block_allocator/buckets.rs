use super::Strategy;
use crate::block::Blocks;
use crate::bucket::{Bucket, CHUNK_LINK_SIZE};
use crate::config::BlockConfig;
use crate::region::ValidatedOffset;

use core::alloc::Layout;

/// Keep free blocks in size-class lists.
///
/// There are `NUM_BUCKETS` buckets with chunk sizes of `MIN_CHUNK`,
/// `2 * MIN_CHUNK`, `4 * MIN_CHUNK` and so on. The last bucket holds blocks of
/// any size. A free block is kept in the smallest bucket whose chunk size is at
/// least its inner size. Blocks too small to hold the list links are not kept
/// in any bucket; they are recovered when merged with a neighbor.
///
/// Allocations are placed at the end of the chosen block, so that no new free
/// block is ever created behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buckets<const MIN_CHUNK: usize = 32, const NUM_BUCKETS: usize = 5> {
    buckets: [Bucket; NUM_BUCKETS],
}
impl<const MIN_CHUNK: usize, const NUM_BUCKETS: usize> Buckets<MIN_CHUNK, NUM_BUCKETS> {
    /// Create the empty size-class lists.
    ///
    /// # Panics
    /// This function panics if there are no buckets or if the chunk sizes
    /// overflow.
    pub const fn new() -> Self {
        assert!(NUM_BUCKETS > 0, "at least one bucket is required");
        assert!(MIN_CHUNK > 0, "minimum chunk size must not be zero");
        assert!(
            NUM_BUCKETS - 1 < usize::BITS as usize
                && (MIN_CHUNK << (NUM_BUCKETS - 1)) >> (NUM_BUCKETS - 1) == MIN_CHUNK,
            "chunk sizes overflow"
        );
        let mut buckets = [const { Bucket::unbounded() }; NUM_BUCKETS];
        let mut i = 0;
        while i + 1 < NUM_BUCKETS {
            buckets[i] = Bucket::new(MIN_CHUNK << i);
            i += 1;
        }
        Self { buckets }
    }

    /// The size-class lists, from the smallest to the unbounded one.
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Find the bucket a free block is kept in.
    pub fn bucket_index_of<C: BlockConfig>(
        &self,
        blocks: &Blocks<'_, C>,
        block: ValidatedOffset,
    ) -> Option<usize> {
        let chunk = blocks.usable_offset(block);
        self.buckets
            .iter()
            .position(|bucket| bucket.contains(blocks.region(), chunk))
    }

    /// The smallest bucket for chunks of the given size.
    fn index_for(&self, size: usize) -> usize {
        self.buckets
            .iter()
            .position(|bucket| size <= bucket.chunk_size())
            .unwrap_or(NUM_BUCKETS - 1)
    }
}

impl<const MIN_CHUNK: usize, const NUM_BUCKETS: usize> Default for Buckets<MIN_CHUNK, NUM_BUCKETS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: BlockConfig, const MIN_CHUNK: usize, const NUM_BUCKETS: usize> Strategy<C>
    for Buckets<MIN_CHUNK, NUM_BUCKETS>
{
    const INIT: Self = Self::new();

    // the list links live in the usable space of free blocks
    const SUPPORTS_POISONING: bool = false;

    fn init(&mut self, blocks: &mut Blocks<'_, C>) {
        *self = Self::new();
        let mut cursor = Some(blocks.first());
        while let Some(block) = cursor {
            cursor = blocks.next(block);
            if !blocks.is_used(block) {
                self.recycle_block(blocks, block);
            }
        }
    }

    fn choose_block(
        &mut self,
        blocks: &mut Blocks<'_, C>,
        layout: Layout,
    ) -> Option<ValidatedOffset> {
        // the block has to be able to hold the links once it is freed again
        let layout =
            Layout::from_size_align(layout.size().max(CHUNK_LINK_SIZE), layout.align()).ok()?;

        let first = self.index_for(layout.size());
        for index in first..NUM_BUCKETS {
            let chunk = self.buckets[index].iter(blocks.region()).find(|&chunk| {
                let block = ValidatedOffset::new(chunk - Blocks::<C>::OVERHEAD);
                blocks.can_alloc_last(block, layout).is_ok()
            });
            let chunk = match chunk {
                Some(chunk) => chunk,
                None => continue,
            };
            self.buckets[index].remove(blocks.region_mut(), chunk);

            let block = ValidatedOffset::new(chunk - Blocks::<C>::OVERHEAD);
            let (block, alloc_type) = match blocks.alloc_last(block, layout) {
                Ok(allocated) => allocated,
                Err(_) => {
                    self.recycle_block(blocks, block);
                    return None;
                }
            };
            if alloc_type.has_new_prev() {
                if let Some(prev) = blocks.prev(block) {
                    self.recycle_block(blocks, prev);
                }
            }
            if alloc_type.has_new_next() {
                if let Some(next) = blocks.next(block) {
                    self.recycle_block(blocks, next);
                }
            }
            return Some(block);
        }
        None
    }

    fn reserve_block(&mut self, blocks: &mut Blocks<'_, C>, block: ValidatedOffset) {
        let size = blocks.inner_size(block);
        if size < CHUNK_LINK_SIZE {
            return;
        }
        let chunk = blocks.usable_offset(block);
        let index = self.index_for(size);
        self.buckets[index].remove(blocks.region_mut(), chunk);
    }

    fn recycle_block(&mut self, blocks: &mut Blocks<'_, C>, block: ValidatedOffset) {
        let size = blocks.inner_size(block);
        if size < CHUNK_LINK_SIZE {
            return;
        }
        let chunk = blocks.usable_offset(block);
        let index = self.index_for(size);
        self.buckets[index].add(blocks.region_mut(), chunk);
    }
}
