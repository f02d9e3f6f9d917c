//! Block-based memory allocators for embedded systems
//!
//! This crate provides a family of allocators managing a single, fixed region
//! of memory, e.g. a `static` buffer on a `#![no_std]`-target. All of them
//! implement the [`Allocator`]-trait of this crate. Wrapped into a
//! [`SynchronizedAllocator`], every one of them implements the
//! [`core::alloc::GlobalAlloc`]-trait as well, which is required to use the
//! [`alloc`-crate][alloc] on `#![no_std]`-targets.
//!
//! The allocators available are:
//! - [`FirstFitAllocator`], [`LastFitAllocator`], [`BestFitAllocator`],
//!   [`WorstFitAllocator`] and [`DualFirstFitAllocator`]: a linear scan over
//!   the blocks of the region, differing only in which free block is chosen.
//! - [`BucketAllocator`]: free blocks are kept in lists sorted by size, so that
//!   a suitable block is found without scanning the whole region.
//! - [`BuddyAllocator`]: power-of-two chunks, which are split into halves and
//!   merged with their "buddy" again.
//!
//! Two decorators can be stacked on top of any allocator: the
//! [`TrackingAllocator`] collects [`Metrics`] and the [`SynchronizedAllocator`]
//! serializes all calls with a lock.
//!
//! # Usage
//! The allocator needs a region of memory before it can hand out any of it.
//! A [`Buffer`] is the simplest way to get one. Adjust the number of bytes of
//! the heap as necessary (here 4K):
//! ```no_run
//! use blockalloc::{Buffer, FirstFitAllocator, SpinLock, SynchronizedAllocator};
//! use core::ptr::addr_of_mut;
//!
//! static mut HEAP: Buffer<4096> = Buffer::new();
//!
//! #[global_allocator]
//! static ALLOCATOR: SynchronizedAllocator<FirstFitAllocator<'static>, SpinLock> =
//!     SynchronizedAllocator::new(FirstFitAllocator::new());
//!
//! extern crate alloc;
//!
//! fn main() {
//!     // SAFETY: this is the only reference ever created to the heap
//!     let heap = unsafe { &mut *addr_of_mut!(HEAP) };
//!     ALLOCATOR.lock().init(heap.region()).unwrap();
//!
//!     let mut numbers = alloc::vec::Vec::new();
//!     numbers.push(42);
//! }
//! ```
//! Initialize the allocator before the first allocation: until then, every
//! allocation fails. Afterwards you can just `use alloc::vec::Vec` or even
//! `use alloc::collections::BTreeMap`, i.e. every fancy collection which is
//! normally provided by the `std`.
//!
//! The allocators can be used without the global allocator machinery as well:
//! ```
//! use blockalloc::{Allocator, BestFitAllocator, Buffer};
//! use core::alloc::Layout;
//!
//! let mut buffer = Buffer::<1024>::new();
//! let mut allocator = BestFitAllocator::from_region(buffer.region()).unwrap();
//! let ptr = allocator.allocate(Layout::new::<u64>()).unwrap();
//! assert_eq!(allocator.requested_layout(ptr), Ok(Layout::new::<u64>()));
//! unsafe { allocator.deallocate(ptr) };
//! ```
//!
//! Note to users with things like `MPU`s, `MMU`s, etc.: your device might
//! support things like memory remapping or memory protection with setting
//! read/write/execution rights. This crate _doesn't use_ those features at all!
//! If that is desired, you should take the address of the buffer and use that
//! along with its size to protect the heap memory.
//!
//! # Implementation
//! The block allocators divide the region into a sequence of blocks. Every
//! block starts with a small header, which stores the distance to the
//! previous and the next block along with some flags. The blocks always cover
//! the whole region without gaps. The basic algorithm is as follows:
//! 1.  We start with an empty region.
//!     ```text
//!     hhhh 0000 0000 0000 0000 0000 0000 0000
//!     ^--- ^---------------------------------
//!     FREE size = 28
//!     ```
//!     There is a single block, which spans all the remaining bytes (after the
//!     header itself).
//! 2.  A block of 8 is allocated.
//!     ```text
//!     hhhh 0000 0000 hhhh 0000 0000 0000 0000
//!     ^--- ^-------- ^--- ^------------------
//!     USED size = 8  FREE size = 16
//!     ```
//!     The free block is split into two. Note, that the total number of
//!     "usable" bytes shrunk from 28 to 24 bytes, since there is now an
//!     additional header.
//! 3.  A block of 16 is requested. There is no free block of that size,
//!     therefore the allocation fails.
//! 4.  The first block is freed.
//!     ```text
//!     hhhh 0000 0000 hhhh 0000 0000 0000 0000
//!     ^--- ^-------- ^--- ^------------------
//!     FREE size = 8  FREE size = 16
//!     ```
//!     Two free blocks are never left next to each other, so they are merged
//!     into a single block of 28 again.
//!
//! Allocations with a large alignment either shift the start of the block
//! (donating the skipped bytes to the previous block) or split off a new free
//! block in front of it. Which free block is used for an allocation is decided
//! by a [`Strategy`].
//!
//! Freed blocks can be "poisoned" by configuring a
//! [`POISON_INTERVAL`](BlockConfig::POISON_INTERVAL): their contents are
//! overwritten with [`POISON_BYTE`] and checked again, when the block is
//! reused. This detects writes to memory after it was freed.
//!
//! [alloc]: https://doc.rust-lang.org/alloc/
#![cfg_attr(not(test), no_std)]

mod allocator;
mod block;
mod block_allocator;
mod bucket;
mod buddy;
mod capability;
mod config;
mod error;
mod region;
mod synchronized;
mod tracking;

#[cfg(test)]
mod testing;

pub use allocator::Allocator;
pub use block::{AllocType, Blocks, Corruption, Iter, ReverseIter, POISON_BYTE};
pub use block_allocator::{
    BestFit, BestFitAllocator, BlockAllocator, BucketAllocator, Buckets, DualFirstFit,
    DualFirstFitAllocator, FirstFit, FirstFitAllocator, Fragmentation, LastFit, LastFitAllocator,
    Strategy, WorstFit, WorstFitAllocator,
};
pub use bucket::{Bucket, CHUNK_LINK_SIZE};
pub use buddy::BuddyAllocator;
pub use capability::{Capabilities, Capability};
pub use config::{BlockConfig, Config, Offset, DEFAULT_ALIGNMENT, MAX_ALIGNMENT};
pub use error::Error;
pub use region::{Buffer, Region, ValidatedOffset};
pub use synchronized::{NoLock, SpinLock, SynchronizedAllocator, UniquePtr};
pub use tracking::{Metrics, TrackingAllocator};
