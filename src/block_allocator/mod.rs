//! The generic block allocator and its placement strategies.
//!
//! A [`BlockAllocator`] manages a [`Region`] as a chain of [`Blocks`]. Which
//! free block serves an allocation is decided by a [`Strategy`]; splitting,
//! merging, poisoning and all queries are shared by every strategy.
use crate::block::Blocks;
use crate::capability::Capabilities;
use crate::config::{BlockConfig, Config};
use crate::region::{Region, ValidatedOffset};
use crate::{Allocator, Error};

use core::alloc::Layout;
use core::ptr::NonNull;

mod buckets;
mod fit;

pub use buckets::Buckets;
pub use fit::{BestFit, DualFirstFit, FirstFit, LastFit, WorstFit};

/// The policy of a [`BlockAllocator`] for choosing free blocks.
///
/// Strategies, that keep their own bookkeeping of free blocks (e.g. free
/// lists), are notified whenever a free block enters or leaves the pool of
/// free blocks. Blocks are always merged with their free neighbors before they
/// are [recycled](Self::recycle_block), so a strategy only ever sees maximal
/// free blocks.
pub trait Strategy<C: BlockConfig>: Sized {
    /// The initial state of the strategy.
    const INIT: Self;

    /// Whether freed blocks may be poisoned.
    ///
    /// Strategies storing data inside free blocks must not allow this.
    const SUPPORTS_POISONING: bool = true;

    /// Set up the strategy for a new chain of blocks.
    fn init(&mut self, blocks: &mut Blocks<'_, C>) {
        let _ = blocks;
    }

    /// Choose a free block for the given layout and allocate from it.
    ///
    /// Implementations allocate using [`Blocks::alloc_first()`] or
    /// [`Blocks::alloc_last()`] and return the now used block. Any free block
    /// created by that has to be recycled by the strategy itself.
    fn choose_block(
        &mut self,
        blocks: &mut Blocks<'_, C>,
        layout: Layout,
    ) -> Option<ValidatedOffset>;

    /// A free block is about to be merged or grown into and therefore leaves
    /// the pool of free blocks.
    fn reserve_block(&mut self, blocks: &mut Blocks<'_, C>, block: ValidatedOffset) {
        let _ = (blocks, block);
    }

    /// A free block enters the pool of free blocks.
    fn recycle_block(&mut self, blocks: &mut Blocks<'_, C>, block: ValidatedOffset) {
        let _ = (blocks, block);
    }
}

/// A measure for the fragmentation of the free memory.
///
/// Both values are computed from the inner sizes of the free blocks in units
/// of the block alignment. A fragmentation metric can be derived as
/// `1 - sqrt(sum_of_squares) / sum`: it is 0 for a single free block and
/// approaches 1 for many small free blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fragmentation {
    /// The sum of the squared sizes.
    pub sum_of_squares: u128,
    /// The sum of the sizes.
    pub sum: usize,
}

/// A memory allocator over a chain of blocks.
///
/// The allocator is created uninitialized (possibly in a `const` context) and
/// gets its memory by a call to [`init()`](Self::init):
/// ```
/// use blockalloc::{Allocator, Buffer, FirstFitAllocator};
/// use core::alloc::Layout;
///
/// let mut buffer = Buffer::<4096>::new();
/// let mut allocator = FirstFitAllocator::new();
/// allocator.init(buffer.region()).unwrap();
///
/// let ptr = allocator.allocate(Layout::new::<u64>()).unwrap();
/// unsafe { allocator.deallocate(ptr) };
/// ```
/// Without memory, every allocation fails.
///
/// Every 'n'-th freed block is poisoned if the configuration sets a poisoning
/// interval and the strategy supports it.
pub struct BlockAllocator<'a, S, C: BlockConfig = Config> {
    blocks: Option<Blocks<'a, C>>,
    strategy: S,
    unpoisoned: u16,
}

/// A [`BlockAllocator`] using the first free block that fits.
pub type FirstFitAllocator<'a, C = Config> = BlockAllocator<'a, FirstFit, C>;
/// A [`BlockAllocator`] using the last free block that fits.
pub type LastFitAllocator<'a, C = Config> = BlockAllocator<'a, LastFit, C>;
/// A [`BlockAllocator`] using the smallest free block that fits.
pub type BestFitAllocator<'a, C = Config> = BlockAllocator<'a, BestFit, C>;
/// A [`BlockAllocator`] using the largest free block that fits.
pub type WorstFitAllocator<'a, C = Config> = BlockAllocator<'a, WorstFit, C>;
/// A [`BlockAllocator`] placing small and large allocations at opposite ends.
pub type DualFirstFitAllocator<'a, C = Config> = BlockAllocator<'a, DualFirstFit, C>;
/// A [`BlockAllocator`] keeping free blocks in size-class lists.
pub type BucketAllocator<'a, const MIN_CHUNK: usize = 32, const NUM_BUCKETS: usize = 5, C = Config> =
    BlockAllocator<'a, Buckets<MIN_CHUNK, NUM_BUCKETS>, C>;

impl<'a, S: Strategy<Config>> BlockAllocator<'a, S> {
    /// Create an uninitialized allocator with the default configuration.
    ///
    /// This function is a `const fn`, therefore the allocator can be placed in
    /// a `static`.
    pub const fn new() -> Self {
        Self::with_strategy(S::INIT)
    }

    /// Create an allocator with the default configuration managing `region`.
    ///
    /// # Errors
    /// See [`init()`](Self::init).
    pub fn from_region(region: Region<'a>) -> Result<Self, Error> {
        let mut allocator = Self::new();
        allocator.init(region)?;
        Ok(allocator)
    }
}

impl<'a, S: Strategy<C>, C: BlockConfig> BlockAllocator<'a, S, C> {
    /// Create an uninitialized allocator with a given strategy.
    pub const fn with_strategy(strategy: S) -> Self {
        Self {
            blocks: None,
            strategy,
            unpoisoned: 0,
        }
    }

    /// Hand a memory region to the allocator.
    ///
    /// # Errors
    /// - [`Error::FailedPrecondition`] if the allocator is initialized already.
    /// - the errors of [`Blocks::init()`] for unusable regions.
    pub fn init(&mut self, region: Region<'a>) -> Result<(), Error> {
        if self.blocks.is_some() {
            return Err(Error::FailedPrecondition);
        }
        self.init_with_blocks(Blocks::init(region)?)
    }

    /// Hand an existing chain of blocks to the allocator.
    ///
    /// The chain might already contain used blocks, which can be freed using
    /// the allocator afterwards.
    ///
    /// # Errors
    /// [`Error::FailedPrecondition`] if the allocator is initialized already.
    pub fn init_with_blocks(&mut self, mut blocks: Blocks<'a, C>) -> Result<(), Error> {
        if self.blocks.is_some() {
            return Err(Error::FailedPrecondition);
        }
        self.strategy.init(&mut blocks);
        self.unpoisoned = 0;
        self.blocks = Some(blocks);
        Ok(())
    }

    /// Return the allocator to the uninitialized state and give back its
    /// memory region.
    ///
    /// # Panics
    /// This function panics if there are outstanding allocations.
    pub fn reset(&mut self) -> Option<Region<'a>> {
        let blocks = self.blocks.take()?;
        blocks.crash_if_allocated();
        log::debug!("reset block allocator of {} bytes", blocks.capacity());
        Some(blocks.into_region())
    }

    /// The chain of blocks, if the allocator is initialized.
    pub fn blocks(&self) -> Option<&Blocks<'a, C>> {
        self.blocks.as_ref()
    }

    /// The placement strategy.
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// The placement strategy, e.g. to adjust its parameters.
    pub fn strategy_mut(&mut self) -> &mut S {
        &mut self.strategy
    }

    /// Measure the fragmentation of the free memory.
    pub fn fragmentation(&self) -> Fragmentation {
        let mut fragmentation = Fragmentation::default();
        if let Some(blocks) = &self.blocks {
            for block in blocks.iter().filter(|&block| !blocks.is_used(block)) {
                let units = blocks.inner_size(block) / Blocks::<C>::ALIGNMENT;
                fragmentation.sum += units;
                fragmentation.sum_of_squares += (units as u128) * (units as u128);
            }
        }
        fragmentation
    }

    /// Find the used block of an allocation by walking the chain.
    fn used_block(&self, ptr: NonNull<u8>) -> Result<(&Blocks<'a, C>, ValidatedOffset), Error> {
        let blocks = self.blocks.as_ref().ok_or(Error::NotFound)?;
        let block = blocks.find(ptr).map_err(|_| Error::NotFound)?;
        if !blocks.is_used(block) {
            return Err(Error::FailedPrecondition);
        }
        Ok((blocks, block))
    }
}

impl<S: Strategy<C>, C: BlockConfig> Default for BlockAllocator<'_, S, C> {
    fn default() -> Self {
        Self::with_strategy(S::INIT)
    }
}

impl<S: Strategy<C>, C: BlockConfig> Allocator for BlockAllocator<'_, S, C> {
    fn capabilities(&self) -> Capabilities {
        Capabilities::BLOCK_ALLOCATOR
    }

    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }
        let blocks = self.blocks.as_mut()?;
        match self.strategy.choose_block(blocks, layout) {
            Some(block) => {
                log::trace!("allocated {:?} at offset {}", layout, block.get());
                Some(blocks.usable_space(block))
            }
            None => {
                log::trace!("failed to allocate {:?}", layout);
                None
            }
        }
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let blocks = match self.blocks.as_mut() {
            Some(blocks) => blocks,
            None => {
                log::warn!("ignoring deallocation of {:p} by an uninitialized allocator", ptr);
                return;
            }
        };
        // SAFETY: forwarded from the caller
        let block = match unsafe { blocks.from_usable_space(ptr) } {
            Ok(block) => block,
            Err(error) => {
                log::warn!("ignoring deallocation of foreign pointer {:p}: {}", ptr, error);
                return;
            }
        };

        // free neighbors are merged below, so they leave the free pool first
        if let Some(prev) = blocks.prev(block).filter(|&prev| !blocks.is_used(prev)) {
            self.strategy.reserve_block(blocks, prev);
        }
        if let Some(next) = blocks.next(block).filter(|&next| !blocks.is_used(next)) {
            self.strategy.reserve_block(blocks, next);
        }
        let block = blocks.free(block);

        if S::SUPPORTS_POISONING && C::POISON_INTERVAL != 0 {
            self.unpoisoned += 1;
            if self.unpoisoned >= C::POISON_INTERVAL {
                blocks.poison(block);
                self.unpoisoned = 0;
            }
        }
        self.strategy.recycle_block(blocks, block);
        log::trace!("freed block at offset {}", block.get());
    }

    unsafe fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> bool {
        if new_size == 0 {
            return false;
        }
        let blocks = match self.blocks.as_mut() {
            Some(blocks) => blocks,
            None => return false,
        };
        // SAFETY: forwarded from the caller
        let block = match unsafe { blocks.from_usable_space(ptr) } {
            Ok(block) => block,
            Err(error) => {
                log::warn!("ignoring resize of foreign pointer {:p}: {}", ptr, error);
                return false;
            }
        };

        if let Some(next) = blocks.next(block).filter(|&next| !blocks.is_used(next)) {
            self.strategy.reserve_block(blocks, next);
        }
        let result = blocks.resize(block, new_size);
        if let Some(next) = blocks.next(block).filter(|&next| !blocks.is_used(next)) {
            self.strategy.recycle_block(blocks, next);
        }
        result.is_ok()
    }

    fn requested_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        let (blocks, block) = self.used_block(ptr)?;
        Layout::from_size_align(blocks.requested_size(block), blocks.alignment(block))
            .map_err(|_| Error::NotFound)
    }

    fn usable_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        let (blocks, block) = self.used_block(ptr)?;
        Layout::from_size_align(blocks.inner_size(block), blocks.alignment(block))
            .map_err(|_| Error::NotFound)
    }

    fn allocated_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        let (blocks, block) = self.used_block(ptr)?;
        Layout::from_size_align(blocks.outer_size(block), blocks.alignment(block))
            .map_err(|_| Error::NotFound)
    }

    fn capacity(&self) -> Result<usize, Error> {
        Ok(self.blocks.as_ref().map_or(0, Blocks::capacity))
    }

    fn query(&self, ptr: NonNull<u8>) -> Result<(), Error> {
        let blocks = self.blocks.as_ref().ok_or(Error::OutOfRange)?;
        blocks.find(ptr).map(|_| ()).map_err(|_| Error::OutOfRange)
    }
}
