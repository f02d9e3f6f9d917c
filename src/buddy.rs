//! A buddy allocator with power-of-two size classes.
//!
//! The region is split into chunks of `MIN_CHUNK << class` bytes. Every chunk
//! has a "buddy" of the same size: the other half of the chunk of the next
//! class both were split from. A freed chunk is merged with its buddy if that
//! is free as well, so that memory recombines into the largest chunks
//! possible.
//!
//! The class of an allocated chunk is stored in a single byte directly in
//! front of it, which is the last byte of the previous chunk. The class of the
//! first chunk is stored in the last byte of the region. Every allocation
//! therefore reserves one byte, which is never handed out to the caller.
use crate::block::{align_down, align_up};
use crate::bucket::{Bucket, CHUNK_LINK_SIZE};
use crate::capability::{Capabilities, Capability};
use crate::region::Region;
use crate::{Allocator, Error};

use core::alloc::Layout;
use core::ptr::NonNull;

/// An allocator handing out power-of-two sized chunks.
///
/// Allocations of up to `MIN_CHUNK << (NUM_BUCKETS - 1)` bytes (including the
/// reserved byte) with an alignment of at most `MIN_CHUNK` are supported. The
/// region is used from the first address aligned to `MIN_CHUNK` on.
///
/// In debug builds, dropping the allocator panics if there are outstanding
/// allocations.
pub struct BuddyAllocator<'a, const MIN_CHUNK: usize = 32, const NUM_BUCKETS: usize = 16> {
    region: Option<Region<'a>>,
    buckets: [Bucket; NUM_BUCKETS],
}

impl<'a, const MIN_CHUNK: usize, const NUM_BUCKETS: usize> BuddyAllocator<'a, MIN_CHUNK, NUM_BUCKETS> {
    const CAPABILITIES: Capabilities = Capabilities::NONE
        .with(Capability::UsableLayout)
        .with(Capability::AllocatedLayout)
        .with(Capability::Capacity)
        .with(Capability::Recognizes);

    /// Create an uninitialized allocator.
    ///
    /// # Panics
    /// This function panics (at compile time if used in a `const`) if the
    /// minimum chunk size is no power of two or cannot hold the free list
    /// links, or if the number of size classes is not in `1..=256`.
    pub const fn new() -> Self {
        assert!(MIN_CHUNK.is_power_of_two(), "minimum chunk size must be a power of two");
        assert!(
            MIN_CHUNK > CHUNK_LINK_SIZE,
            "minimum chunk size must exceed the free list links"
        );
        assert!(
            NUM_BUCKETS > 0 && NUM_BUCKETS <= 256,
            "number of size classes must be in 1..=256"
        );
        assert!(
            NUM_BUCKETS - 1 < usize::BITS as usize
                && (MIN_CHUNK << (NUM_BUCKETS - 1)) >> (NUM_BUCKETS - 1) == MIN_CHUNK,
            "chunk sizes overflow"
        );
        Self {
            region: None,
            buckets: Self::empty_buckets(),
        }
    }

    const fn empty_buckets() -> [Bucket; NUM_BUCKETS] {
        let mut buckets = [const { Bucket::unbounded() }; NUM_BUCKETS];
        let mut i = 0;
        while i < NUM_BUCKETS {
            buckets[i] = Bucket::new(MIN_CHUNK << i);
            i += 1;
        }
        buckets
    }

    /// Create an allocator managing `region`.
    ///
    /// # Errors
    /// See [`init()`](Self::init).
    pub fn from_region(region: Region<'a>) -> Result<Self, Error> {
        let mut allocator = Self::new();
        allocator.init(region)?;
        Ok(allocator)
    }

    /// Hand a memory region to the allocator.
    ///
    /// Leading bytes up to the first address aligned to `MIN_CHUNK` and
    /// trailing bytes not forming a whole minimum chunk are not used.
    ///
    /// # Errors
    /// - [`Error::FailedPrecondition`] if the allocator is initialized already.
    /// - [`Error::InvalidArgument`] if the region cannot hold a single chunk.
    pub fn init(&mut self, mut region: Region<'a>) -> Result<(), Error> {
        if self.region.is_some() {
            return Err(Error::FailedPrecondition);
        }
        let skipped = align_up(region.addr(), MIN_CHUNK) - region.addr();
        if region.len() < skipped + MIN_CHUNK {
            return Err(Error::InvalidArgument);
        }
        region.advance(skipped);
        let len = align_down(region.len(), MIN_CHUNK);
        region.truncate(len);
        region.fill(0, len, 0);
        log::debug!(
            "initialized buddy allocator with {} bytes in {} size classes",
            len,
            NUM_BUCKETS
        );

        self.buckets = Self::empty_buckets();
        self.region = Some(region);
        // build up the free chunks by freeing (and thus merging) all minimum
        // sized chunks
        for chunk in (0..len).step_by(MIN_CHUNK) {
            self.release(chunk, 0);
        }
        Ok(())
    }

    /// Return the allocator to the uninitialized state and give back its
    /// memory region.
    ///
    /// # Panics
    /// This function panics if there are outstanding allocations.
    pub fn reset(&mut self) -> Option<Region<'a>> {
        self.crash_if_allocated();
        let region = self.region.take()?;
        log::debug!("reset buddy allocator of {} bytes", region.len());
        Some(region)
    }

    /// The size of the chunks of a size class.
    pub const fn chunk_size(class: usize) -> usize {
        MIN_CHUNK << class
    }

    /// The number of free chunks of a size class.
    pub fn free_chunks(&self, class: usize) -> usize {
        self.region
            .as_ref()
            .map_or(0, |region| self.buckets[class].count(region))
    }

    /// Panic if any chunk is allocated.
    ///
    /// # Panics
    /// This function panics with the number of bytes still in use.
    pub fn crash_if_allocated(&self) {
        let Some(region) = &self.region else {
            return;
        };
        let free: usize = self
            .buckets
            .iter()
            .map(|bucket| bucket.chunk_size() * bucket.count(region))
            .sum();
        assert!(
            free == region.len(),
            "{} bytes were still in use when the allocator was released",
            region.len() - free
        );
    }

    /// The offset of the byte storing the class of a chunk.
    fn class_offset(region: &Region<'_>, chunk: usize) -> usize {
        if chunk == 0 {
            region.len() - 1
        } else {
            chunk - 1
        }
    }

    /// The offset of the chunk starting at `ptr`.
    fn chunk_of(&self, ptr: NonNull<u8>) -> Result<usize, Error> {
        let region = self.region.as_ref().ok_or(Error::OutOfRange)?;
        let chunk = region.offset_of(ptr).ok_or(Error::OutOfRange)?;
        if chunk % MIN_CHUNK != 0 {
            return Err(Error::OutOfRange);
        }
        Ok(chunk)
    }

    /// The class of the allocated chunk starting at `chunk`.
    ///
    /// The chunk tree is walked from the largest class downwards, so that a
    /// stale class byte is never mistaken for an allocation.
    ///
    /// # Errors
    /// - [`Error::FailedPrecondition`] if `chunk` lies in free memory.
    /// - [`Error::NotFound`] if `chunk` lies inside an allocated chunk.
    /// - [`Error::InvalidArgument`] if the class byte of the minimum chunk at
    ///   `chunk` is corrupted.
    fn live_class(&self, chunk: usize) -> Result<usize, Error> {
        let region = self.region.as_ref().ok_or(Error::NotFound)?;
        for class in (0..NUM_BUCKETS).rev() {
            let size = Self::chunk_size(class);
            let base = align_down(chunk, size);
            if base + size > region.len() {
                continue;
            }
            if self.buckets[class].contains(region, base) {
                return Err(Error::FailedPrecondition);
            }
            // SAFETY: the whole region is initialized by `init()`.
            let stored = unsafe { region.read::<u8>(Self::class_offset(region, base)).assume_init() };
            let split = (0..class).any(|smaller| self.buckets[smaller].contains(region, base));
            if usize::from(stored) == class && !split {
                return if base == chunk { Ok(class) } else { Err(Error::NotFound) };
            }
        }
        // every minimum chunk is either free or part of an allocation
        Err(Error::InvalidArgument)
    }

    /// Remove a free chunk of the given class, splitting larger chunks if
    /// necessary.
    fn take(&mut self, class: usize) -> Option<usize> {
        let region = self.region.as_mut()?;
        if let Some(chunk) = self.buckets[class].remove_first(region) {
            return Some(chunk);
        }
        if class + 1 >= NUM_BUCKETS {
            return None;
        }
        let chunk = self.take(class + 1)?;
        let region = self.region.as_mut()?;
        self.buckets[class].add(region, chunk + Self::chunk_size(class));
        Some(chunk)
    }

    /// Give a chunk back and merge it with its free buddies.
    fn release(&mut self, mut chunk: usize, mut class: usize) {
        let Some(region) = self.region.as_mut() else {
            return;
        };
        while class + 1 < NUM_BUCKETS {
            let size = Self::chunk_size(class);
            let buddy = if chunk % (2 * size) == 0 {
                chunk + size
            } else {
                chunk - size
            };
            if buddy + size > region.len() {
                // the merged chunk would not fit into the region
                break;
            }
            if self.buckets[class]
                .remove_if(region, |other| other == buddy)
                .is_none()
            {
                break;
            }
            chunk = chunk.min(buddy);
            class += 1;
        }
        self.buckets[class].add(region, chunk);
    }
}

impl<const MIN_CHUNK: usize, const NUM_BUCKETS: usize> Default for BuddyAllocator<'_, MIN_CHUNK, NUM_BUCKETS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const MIN_CHUNK: usize, const NUM_BUCKETS: usize> Drop for BuddyAllocator<'_, MIN_CHUNK, NUM_BUCKETS> {
    fn drop(&mut self) {
        if cfg!(debug_assertions) {
            self.crash_if_allocated();
        }
    }
}

impl<const MIN_CHUNK: usize, const NUM_BUCKETS: usize> Allocator for BuddyAllocator<'_, MIN_CHUNK, NUM_BUCKETS> {
    fn capabilities(&self) -> Capabilities {
        Self::CAPABILITIES
    }

    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 || layout.align() > MIN_CHUNK {
            return None;
        }
        // reserve a byte for the size class
        let needed = layout.size().checked_add(1)?;
        let class = (0..NUM_BUCKETS).find(|&class| needed <= Self::chunk_size(class))?;
        let Some(chunk) = self.take(class) else {
            log::trace!("failed to allocate {:?}", layout);
            return None;
        };

        let region = self.region.as_mut()?;
        #[allow(clippy::cast_possible_truncation)] // there are at most 256 classes
        region.write(Self::class_offset(region, chunk), class as u8);
        log::trace!("allocated {:?} as chunk of class {} at offset {}", layout, class, chunk);
        Some(region.ptr_at(chunk))
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let chunk = match self.chunk_of(ptr) {
            Ok(chunk) => chunk,
            Err(error) => {
                log::warn!("ignoring deallocation of foreign pointer {:p}: {}", ptr, error);
                return;
            }
        };
        match self.live_class(chunk) {
            Ok(class) => {
                self.release(chunk, class);
                log::trace!("freed chunk of class {} at offset {}", class, chunk);
            }
            Err(Error::FailedPrecondition) => panic!("double free of chunk at offset {}", chunk),
            Err(Error::InvalidArgument) => panic!("corrupted size class of chunk at offset {}", chunk),
            Err(error) => log::warn!("ignoring deallocation of interior pointer {:p}: {}", ptr, error),
        }
    }

    unsafe fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> bool {
        if new_size == 0 {
            return false;
        }
        self.chunk_of(ptr)
            .and_then(|chunk| self.live_class(chunk))
            .is_ok_and(|class| new_size < Self::chunk_size(class))
    }

    fn usable_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        let size = self.allocated_layout(ptr)?.size() - 1;
        Layout::from_size_align(size, MIN_CHUNK).map_err(|_| Error::NotFound)
    }

    fn allocated_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        let chunk = self.chunk_of(ptr).map_err(|_| Error::NotFound)?;
        let class = self.live_class(chunk).map_err(|_| Error::NotFound)?;
        Layout::from_size_align(Self::chunk_size(class), MIN_CHUNK).map_err(|_| Error::NotFound)
    }

    fn capacity(&self) -> Result<usize, Error> {
        Ok(self.region.as_ref().map_or(0, Region::len))
    }

    fn query(&self, ptr: NonNull<u8>) -> Result<(), Error> {
        let chunk = self.chunk_of(ptr)?;
        self.live_class(chunk).map(|_| ()).map_err(|_| Error::OutOfRange)
    }
}
