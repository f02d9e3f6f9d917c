//! The chain of blocks tiling a memory region.
//!
//! Every block starts with a small [header](header::Header) followed by its
//! usable space. The header only stores sizes: the outer size of the block
//! itself and the outer size of its predecessor. The neighbors of a block are
//! therefore found by adding or subtracting those sizes from the block's
//! offset.
//! ```text
//! +--------+----------------+--------+--------------------------+
//! | header | usable space   | header | usable space             |
//! +--------+----------------+--------+--------------------------+
//! ^--- block 0 (USED) ------^--- block 1 (FREE, last) ----------^
//! ```
//! The blocks always tile the whole region: there are neither gaps between
//! them nor do they overlap. Two adjacent blocks are never both free after a
//! public operation completed.
//!
//! Blocks are referred to by [`ValidatedOffset`]s into the region. Operations
//! that hand out or take back memory keep the chain consistent: they either
//! complete fully or return an [`Error`] before touching any header. Detected
//! corruption of the chain is fatal and causes a panic.
use crate::config::{BlockConfig, Config, Offset, MAX_ALIGNMENT};
use crate::region::{Region, ValidatedOffset};
use crate::Error;

use core::alloc::Layout;
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr::NonNull;

pub(crate) mod header;
mod iter;

use header::{Header, Info};
pub use iter::{Iter, ReverseIter};

/// The byte pattern written into the usable space of poisoned free blocks.
pub const POISON_BYTE: u8 = 0xf7;

/// Round `value` up to the next multiple of `align`, which is a power of two.
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to the previous multiple of `align`, which is a power of
/// two.
pub(crate) const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// How an allocation changed the blocks around the allocated one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocType {
    /// The block was used as-is.
    Exact,
    /// A new free block was split off in front of the allocated one.
    NewPrev,
    /// A new free block was split off behind the allocated one.
    NewNext,
    /// New free blocks were split off on both sides.
    NewPrevAndNewNext,
    /// A few leading bytes were given to the (used) previous block.
    ShiftToPrev,
    /// Leading bytes were given to the previous block and a new free block was
    /// split off behind the allocated one.
    ShiftToPrevAndNewNext,
}
impl AllocType {
    /// Whether a new free block precedes the allocated one.
    pub const fn has_new_prev(self) -> bool {
        matches!(self, Self::NewPrev | Self::NewPrevAndNewNext)
    }

    /// Whether a new free block follows the allocated one.
    pub const fn has_new_next(self) -> bool {
        matches!(
            self,
            Self::NewNext | Self::NewPrevAndNewNext | Self::ShiftToPrevAndNewNext
        )
    }

    const fn with_new_next(self) -> Self {
        match self {
            Self::Exact | Self::NewNext => Self::NewNext,
            Self::NewPrev | Self::NewPrevAndNewNext => Self::NewPrevAndNewNext,
            Self::ShiftToPrev | Self::ShiftToPrevAndNewNext => Self::ShiftToPrevAndNewNext,
        }
    }
}

/// A structural defect found in a block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// The block does not start at a multiple of the alignment.
    Misaligned,
    /// The size of the block does not agree with the following block.
    NextMismatched,
    /// The size of the previous block does not agree with this block.
    PrevMismatched,
    /// The poison pattern of a free block was overwritten.
    PoisonCorrupted,
}
impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Misaligned => "block is misaligned",
            Self::NextMismatched => "next block does not point back to this block",
            Self::PrevMismatched => "previous block does not point to this block",
            Self::PoisonCorrupted => "poisoned memory was modified after being freed",
        })
    }
}

/// A chain of blocks covering a whole [`Region`].
///
/// This type implements the block-level algorithms all block allocators
/// share. It is usually not used directly, but through a
/// [`BlockAllocator`](crate::BlockAllocator).
pub struct Blocks<'a, C: BlockConfig = Config> {
    region: Region<'a>,
    last: usize,
    _config: PhantomData<C>,
}

impl<'a, C: BlockConfig> Blocks<'a, C> {
    /// The alignment of every block and of every usable space.
    pub const ALIGNMENT: usize = {
        assert!(C::ALIGN.is_power_of_two(), "block alignment must be a power of two");
        assert!(C::ALIGN <= MAX_ALIGNMENT, "block alignment is too large");
        C::ALIGN
    };

    /// The number of bytes in front of every usable space.
    pub const OVERHEAD: usize = align_up(mem::size_of::<Header<C::Offset>>(), Self::ALIGNMENT);

    /// Create a chain consisting of a single free block spanning the region.
    ///
    /// Trailing bytes of the region, that do not form a multiple of the
    /// alignment, are left unused.
    ///
    /// # Errors
    /// - [`Error::InvalidArgument`] if the region does not start at a multiple
    ///   of the alignment or is too small to hold a single header.
    /// - [`Error::OutOfRange`] if the region is too large for the offset type.
    pub fn init(mut region: Region<'a>) -> Result<Self, Error> {
        if region.addr() % Self::ALIGNMENT != 0 {
            return Err(Error::InvalidArgument);
        }
        let len = align_down(region.len(), Self::ALIGNMENT);
        if len < Self::OVERHEAD {
            return Err(Error::InvalidArgument);
        }
        if len / Self::ALIGNMENT > C::Offset::MAX {
            return Err(Error::OutOfRange);
        }
        region.truncate(len);

        let mut blocks = Self {
            region,
            last: 0,
            _config: PhantomData,
        };
        let mut header = Header::free(0, len / Self::ALIGNMENT);
        header.info = header.info.with_last(true);
        blocks.set_header(0, header);
        log::debug!(
            "initialized block chain of {} bytes at {:#x}",
            len,
            blocks.region.addr()
        );
        Ok(blocks)
    }

    fn header(&self, block: ValidatedOffset) -> Header<C::Offset> {
        // SAFETY: the `ValidatedOffset` marks the read valid (safety invariant
        // of that type)
        unsafe { self.region.read::<Header<C::Offset>>(block.get()).assume_init() }
    }

    fn set_header(&mut self, offset: usize, header: Header<C::Offset>) {
        if header.info.is_last() {
            self.last = offset;
        }
        self.region.write(offset, header);
    }

    fn update_info(&mut self, block: ValidatedOffset, f: impl FnOnce(Info) -> Info) {
        let mut header = self.header(block);
        header.info = f(header.info);
        self.set_header(block.get(), header);
    }

    /// The number of bytes covered by the chain.
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    pub(crate) fn region(&self) -> &Region<'a> {
        &self.region
    }

    /// The region the blocks live in.
    pub(crate) fn region_mut(&mut self) -> &mut Region<'a> {
        &mut self.region
    }

    /// Give up the chain and return the region.
    pub(crate) fn into_region(self) -> Region<'a> {
        self.region
    }

    /// The first block of the chain.
    pub const fn first(&self) -> ValidatedOffset {
        ValidatedOffset::new(0)
    }

    /// The last block of the chain.
    pub const fn last(&self) -> ValidatedOffset {
        ValidatedOffset::new(self.last)
    }

    /// The block following the given one, if any.
    pub fn next(&self, block: ValidatedOffset) -> Option<ValidatedOffset> {
        let header = self.header(block);
        if header.info.is_last() {
            return None;
        }
        let next = Self::span(header.next)
            .and_then(|outer| block.get().checked_add(outer))
            .unwrap_or_else(|| Self::crash(block, Corruption::NextMismatched));
        Some(ValidatedOffset::new(next))
    }

    /// The block preceding the given one, if any.
    pub fn prev(&self, block: ValidatedOffset) -> Option<ValidatedOffset> {
        let prev = self.header(block).prev.to_usize();
        (prev != 0).then(|| ValidatedOffset::new(block.get() - prev * Self::ALIGNMENT))
    }

    /// Iterate over all blocks from the first to the last one.
    pub fn iter(&self) -> Iter<'_, 'a, C> {
        Iter::new(self)
    }

    /// Iterate over all blocks from the last to the first one.
    pub fn iter_rev(&self) -> ReverseIter<'_, 'a, C> {
        ReverseIter::new(self)
    }

    /// The size of the block including its header.
    pub fn outer_size(&self, block: ValidatedOffset) -> usize {
        Self::span(self.header(block).next).unwrap_or_else(|| Self::crash(block, Corruption::NextMismatched))
    }

    /// The size of the usable space of the block.
    pub fn inner_size(&self, block: ValidatedOffset) -> usize {
        self.outer_size(block) - Self::OVERHEAD
    }

    /// The number of bytes originally requested for a used block.
    pub fn requested_size(&self, block: ValidatedOffset) -> usize {
        let header = self.header(block);
        header.next.to_usize() * Self::ALIGNMENT - Self::OVERHEAD - usize::from(header.padding)
    }

    /// The alignment originally requested for a used block.
    pub fn alignment(&self, block: ValidatedOffset) -> usize {
        self.header(block).info.alignment()
    }

    /// Whether the block is in use.
    pub fn is_used(&self, block: ValidatedOffset) -> bool {
        self.header(block).info.is_used()
    }

    /// Whether the block is the last one of the chain.
    pub fn is_last(&self, block: ValidatedOffset) -> bool {
        self.header(block).info.is_last()
    }

    /// Whether the usable space of the block holds the poison pattern.
    pub fn is_poisoned(&self, block: ValidatedOffset) -> bool {
        self.header(block).info.is_poisoned()
    }

    /// The offset of the usable space of a block.
    pub(crate) fn usable_offset(&self, block: ValidatedOffset) -> usize {
        block.get() + Self::OVERHEAD
    }

    /// A pointer to the usable space of a block.
    pub fn usable_space(&self, block: ValidatedOffset) -> NonNull<u8> {
        self.region.ptr_at(self.usable_offset(block))
    }

    /// Search the chain for the block whose usable space starts at `ptr`.
    ///
    /// This walks the whole chain and never reads memory, that is not a block
    /// header.
    ///
    /// # Errors
    /// - [`Error::OutOfRange`] if the pointer is outside of the region.
    /// - [`Error::NotFound`] if no usable space starts at the pointer.
    pub fn find(&self, ptr: NonNull<u8>) -> Result<ValidatedOffset, Error> {
        let offset = self.region.offset_of(ptr).ok_or(Error::OutOfRange)?;
        self.iter()
            .take_while(|block| block.get() < offset)
            .find(|&block| self.usable_offset(block) == offset)
            .ok_or(Error::NotFound)
    }

    /// Compute the block owning the usable space at `ptr`.
    ///
    /// This is a constant time operation: the header position is computed from
    /// the pointer and the header is validated afterwards.
    ///
    /// # Errors
    /// - [`Error::OutOfRange`] if the pointer is outside of the region.
    /// - [`Error::NotFound`] if the pointer is not aligned like a usable space.
    ///
    /// # Safety
    /// If the pointer is inside the region, it must be the start of the usable
    /// space of a block in this chain.
    ///
    /// # Panics
    /// This function panics if the computed block is corrupted.
    pub unsafe fn from_usable_space(&self, ptr: NonNull<u8>) -> Result<ValidatedOffset, Error> {
        let offset = self.region.offset_of(ptr).ok_or(Error::OutOfRange)?;
        let block = offset.checked_sub(Self::OVERHEAD).ok_or(Error::OutOfRange)?;
        if block % Self::ALIGNMENT != 0 {
            return Err(Error::NotFound);
        }
        let block = ValidatedOffset::new(block);
        self.crash_if_invalid(block);
        Ok(block)
    }

    /// Check the header of a block against its neighbors.
    ///
    /// # Errors
    /// The first defect found is returned as a [`Corruption`].
    pub fn check_status(&self, block: ValidatedOffset) -> Result<(), Corruption> {
        let offset = block.get();
        if offset % Self::ALIGNMENT != 0 {
            return Err(Corruption::Misaligned);
        }
        let header = self.header(block);
        let outer = Self::span(header.next).ok_or(Corruption::NextMismatched)?;
        if outer < Self::OVERHEAD || outer > self.capacity() - offset {
            return Err(Corruption::NextMismatched);
        }
        if header.info.is_last() {
            if offset + outer != self.capacity() {
                return Err(Corruption::NextMismatched);
            }
        } else {
            if offset + outer + Self::OVERHEAD > self.capacity() {
                return Err(Corruption::NextMismatched);
            }
            let next = self.header(ValidatedOffset::new(offset + outer));
            if next.prev != header.next {
                return Err(Corruption::NextMismatched);
            }
        }

        let prev_outer = Self::span(header.prev).ok_or(Corruption::PrevMismatched)?;
        if prev_outer != 0 {
            if prev_outer > offset {
                return Err(Corruption::PrevMismatched);
            }
            let prev = self.header(ValidatedOffset::new(offset - prev_outer));
            if prev.next != header.prev || prev.info.is_last() {
                return Err(Corruption::PrevMismatched);
            }
        } else if offset != 0 {
            return Err(Corruption::PrevMismatched);
        }

        if header.info.is_poisoned() && !header.info.is_used() {
            // SAFETY: the poisoned flag is only set after filling the usable
            // space with the pattern.
            let intact = unsafe {
                self.region.is_filled_with(
                    offset + Self::OVERHEAD,
                    outer - Self::OVERHEAD,
                    POISON_BYTE,
                )
            };
            if !intact {
                return Err(Corruption::PoisonCorrupted);
            }
        }
        Ok(())
    }

    /// Panic if the block is corrupted.
    ///
    /// # Panics
    /// This function panics with a description of the defect, if
    /// [`check_status()`](Self::check_status) reports one.
    pub fn crash_if_invalid(&self, block: ValidatedOffset) {
        if let Err(corruption) = self.check_status(block) {
            Self::crash(block, corruption);
        }
    }

    fn crash(block: ValidatedOffset, corruption: Corruption) -> ! {
        panic!("invalid block at offset {}: {}", block.get(), corruption);
    }

    /// The number of bytes covered by a `prev` or `next` field.
    fn span(units: C::Offset) -> Option<usize> {
        units.to_usize().checked_mul(Self::ALIGNMENT)
    }

    /// Panic if any block of the chain is in use.
    ///
    /// # Panics
    /// This function panics with the offset and size of the first used block.
    pub fn crash_if_allocated(&self) {
        if let Some(block) = self.iter().find(|&block| self.is_used(block)) {
            panic!(
                "outstanding allocation of {} bytes at offset {}",
                self.inner_size(block),
                block.get()
            );
        }
    }

    /// Fill the usable space of a free block with the poison pattern.
    ///
    /// Used blocks are left untouched. The pattern is verified when the block
    /// is checked the next time, e.g. when allocating from it.
    pub fn poison(&mut self, block: ValidatedOffset) {
        if self.is_used(block) {
            return;
        }
        let len = self.inner_size(block);
        let offset = self.usable_offset(block);
        self.region.fill(offset, len, POISON_BYTE);
        self.update_info(block, |info| info.with_poisoned(true));
    }

    /// Split a free block into two.
    ///
    /// The block is shrunk to the smallest aligned size able to hold `inner_size`
    /// bytes. If the remaining bytes can hold another block, a new free block
    /// is created from them and returned. Otherwise they stay part of the
    /// original block and `None` is returned.
    ///
    /// # Errors
    /// - [`Error::FailedPrecondition`] if the block is in use.
    /// - [`Error::OutOfRange`] if the block is smaller than `inner_size`.
    pub fn split(
        &mut self,
        block: ValidatedOffset,
        inner_size: usize,
    ) -> Result<Option<ValidatedOffset>, Error> {
        if self.is_used(block) {
            return Err(Error::FailedPrecondition);
        }
        let inner = self.inner_size(block);
        if inner_size > inner {
            return Err(Error::OutOfRange);
        }
        let inner_size = align_up(inner_size, Self::ALIGNMENT);
        Ok((inner_size + Self::OVERHEAD <= inner).then(|| self.split_unchecked(block, inner_size)))
    }

    /// Split a block at the aligned `inner_size`, which must leave room for a
    /// trailing block.
    fn split_unchecked(&mut self, block: ValidatedOffset, inner_size: usize) -> ValidatedOffset {
        debug_assert_eq!(inner_size % Self::ALIGNMENT, 0);
        let header = self.header(block);
        let outer = header.next.to_usize() * Self::ALIGNMENT;
        let outer1 = inner_size + Self::OVERHEAD;
        debug_assert!(outer1 + Self::OVERHEAD <= outer);
        let outer2 = outer - outer1;

        let is_last = header.info.is_last();
        let poisoned = header.info.is_poisoned() && !header.info.is_used();

        let first = Header {
            prev: header.prev,
            next: C::Offset::from_usize(outer1 / Self::ALIGNMENT),
            info: header.info.with_last(false),
            padding: header.padding,
        };
        let mut second = Header::free(outer1 / Self::ALIGNMENT, outer2 / Self::ALIGNMENT);
        second.info = second.info.with_last(is_last).with_poisoned(poisoned);

        let trailing = block.get() + outer1;
        self.set_header(block.get(), first);
        self.set_header(trailing, second);
        let trailing = ValidatedOffset::new(trailing);
        if !is_last {
            self.set_prev_of_next(trailing);
        }
        trailing
    }

    /// Make the block following `block` agree with the size of `block`.
    fn set_prev_of_next(&mut self, block: ValidatedOffset) {
        let outer = self.header(block).next;
        let next = block.get() + outer.to_usize() * Self::ALIGNMENT;
        let mut header = self.header(ValidatedOffset::new(next));
        header.prev = outer;
        self.set_header(next, header);
    }

    /// Merge a free block with its free successor.
    ///
    /// # Panics
    /// This function panics if the block is the last one or if either of the
    /// two blocks is in use.
    pub fn merge_next(&mut self, block: ValidatedOffset) {
        let next = self
            .next(block)
            .unwrap_or_else(|| panic!("cannot merge the last block at offset {}", block.get()));
        assert!(
            !self.is_used(block) && !self.is_used(next),
            "cannot merge used blocks at offsets {} and {}",
            block.get(),
            next.get()
        );
        self.merge_unchecked(block, next);
    }

    /// Merge the block with its successor, if both are free.
    fn try_merge_next(&mut self, block: ValidatedOffset) -> bool {
        match self.next(block) {
            Some(next) if !self.is_used(block) && !self.is_used(next) => {
                self.merge_unchecked(block, next);
                true
            }
            _ => false,
        }
    }

    fn merge_unchecked(&mut self, block: ValidatedOffset, next: ValidatedOffset) {
        let header = self.header(block);
        let next_header = self.header(next);
        let outer = header.next.to_usize() + next_header.next.to_usize();
        let mut merged = Header::free(header.prev.to_usize(), outer);
        merged.info = merged.info.with_last(next_header.info.is_last());
        self.set_header(block.get(), merged);
        if !next_header.info.is_last() {
            self.set_prev_of_next(block);
        }
    }

    fn mark_used(&mut self, block: ValidatedOffset, layout: Layout) {
        let mut header = self.header(block);
        let inner = header.next.to_usize() * Self::ALIGNMENT - Self::OVERHEAD;
        header.info = header
            .info
            .with_used(true)
            .with_poisoned(false)
            .with_alignment(layout.align());
        header.padding = Self::padding(inner, layout.size());
        self.set_header(block.get(), header);
    }

    fn mark_free(&mut self, block: ValidatedOffset) {
        self.update_info(block, |info| info.with_used(false).with_poisoned(false));
    }

    #[allow(clippy::cast_possible_truncation)] // checked by the debug assertion
    fn padding(inner: usize, requested: usize) -> u16 {
        let padding = inner - requested;
        debug_assert!(padding <= usize::from(u16::MAX), "padding too large");
        padding.min(usize::from(u16::MAX)) as u16
    }

    /// Check whether `alloc_first()` would succeed and how much padding it
    /// would put in front of the allocation.
    fn first_padding(&self, block: ValidatedOffset, layout: Layout) -> Result<usize, Error> {
        if layout.size() == 0 {
            return Err(Error::InvalidArgument);
        }
        self.crash_if_invalid(block);
        if self.is_used(block) {
            return Err(Error::FailedPrecondition);
        }
        if layout.align() > MAX_ALIGNMENT {
            return Err(Error::ResourceExhausted);
        }
        let inner = self.inner_size(block);
        if inner < layout.size() {
            return Err(Error::OutOfRange);
        }

        let alignment = layout.align().max(Self::ALIGNMENT);
        let addr = self.usable_space(block).as_ptr() as usize;
        let mut pad = align_up(addr, alignment) - addr;
        if pad > 0 && pad <= Self::OVERHEAD && self.prev(block).is_none() {
            // nothing to shift the padding into: make it large enough for a
            // leading free block
            pad += align_up(Self::OVERHEAD, alignment);
        }

        let inner_size = align_up(layout.size(), Self::ALIGNMENT);
        if inner < pad + inner_size {
            return Err(Error::ResourceExhausted);
        }
        Ok(pad)
    }

    /// Allocate from the start of a free block.
    ///
    /// The usable space is aligned by moving the block start forward. The
    /// skipped bytes either form a new free block in front or, if they are too
    /// few for that, are given to the previous block. Bytes not needed at the
    /// end of the block become a new free block, if they are enough for one.
    ///
    /// Returns the allocated block, which might be at a different offset than
    /// the given one.
    ///
    /// # Errors
    /// - [`Error::InvalidArgument`] if the requested size is zero.
    /// - [`Error::FailedPrecondition`] if the block is in use.
    /// - [`Error::OutOfRange`] if the block is smaller than the request.
    /// - [`Error::ResourceExhausted`] if the block is too small once aligned.
    pub fn alloc_first(
        &mut self,
        block: ValidatedOffset,
        layout: Layout,
    ) -> Result<(ValidatedOffset, AllocType), Error> {
        let pad = self.first_padding(block, layout)?;
        let inner_size = align_up(layout.size(), Self::ALIGNMENT);
        let (block, mut alloc_type) = self.shift(block, pad);
        if inner_size + Self::OVERHEAD <= self.inner_size(block) {
            self.split_unchecked(block, inner_size);
            alloc_type = alloc_type.with_new_next();
        }
        self.mark_used(block, layout);
        Ok((block, alloc_type))
    }

    /// Check whether `alloc_last()` would succeed and return the number of
    /// leading bytes it would shift or split off.
    ///
    /// # Errors
    /// Same as [`alloc_last()`](Self::alloc_last).
    pub fn can_alloc_last(&self, block: ValidatedOffset, layout: Layout) -> Result<usize, Error> {
        if layout.size() == 0 {
            return Err(Error::InvalidArgument);
        }
        if self.is_used(block) {
            return Err(Error::FailedPrecondition);
        }
        self.crash_if_invalid(block);
        if layout.align() > MAX_ALIGNMENT {
            return Err(Error::ResourceExhausted);
        }
        let inner = self.inner_size(block);
        if inner < layout.size() {
            return Err(Error::OutOfRange);
        }

        let addr = self.usable_space(block).as_ptr() as usize;
        let alignment = layout.align().max(Self::ALIGNMENT);
        let next = align_down(addr + (inner - layout.size()), alignment);
        if next < addr {
            return Err(Error::ResourceExhausted);
        }
        let extra = next - addr;
        if extra > Self::OVERHEAD || self.prev(block).is_some() {
            // either a new block fits in front or the bytes go to the previous
            return Ok(extra);
        }
        if extra % alignment == 0 {
            // the start is aligned already, use the whole block
            return Ok(0);
        }
        Err(Error::ResourceExhausted)
    }

    /// Allocate from the end of a free block.
    ///
    /// The usable space is placed as close to the end of the block as the
    /// alignment allows. The bytes in front either form a new free block or
    /// are given to the previous block. This never creates a trailing block.
    ///
    /// # Errors
    /// - [`Error::InvalidArgument`] if the requested size is zero.
    /// - [`Error::FailedPrecondition`] if the block is in use.
    /// - [`Error::OutOfRange`] if the block is smaller than the request.
    /// - [`Error::ResourceExhausted`] if the block is too small once aligned.
    pub fn alloc_last(
        &mut self,
        block: ValidatedOffset,
        layout: Layout,
    ) -> Result<(ValidatedOffset, AllocType), Error> {
        let pad = self.can_alloc_last(block, layout)?;
        let (block, alloc_type) = self.shift(block, pad);
        self.mark_used(block, layout);
        Ok((block, alloc_type))
    }

    /// Move the start of a free block forward by `pad` bytes.
    fn shift(&mut self, block: ValidatedOffset, pad: usize) -> (ValidatedOffset, AllocType) {
        if pad == 0 {
            return (block, AllocType::Exact);
        }
        if pad > Self::OVERHEAD {
            let shifted = self.split_unchecked(block, pad - Self::OVERHEAD);
            return (shifted, AllocType::NewPrev);
        }

        let prev = self
            .prev(block)
            .unwrap_or_else(|| panic!("no block in front of offset {} to shift into", block.get()));
        let units = pad / Self::ALIGNMENT;

        let mut prev_header = self.header(prev);
        prev_header.next = C::Offset::from_usize(prev_header.next.to_usize() + units);
        if prev_header.info.is_used() {
            prev_header.padding = prev_header
                .padding
                .saturating_add(u16::try_from(pad).unwrap_or(u16::MAX));
        }
        self.set_header(prev.get(), prev_header);

        let header = self.header(block);
        let shifted = Header {
            prev: prev_header.next,
            next: C::Offset::from_usize(header.next.to_usize() - units),
            info: header.info,
            padding: 0,
        };
        let shifted_offset = block.get() + pad;
        self.set_header(shifted_offset, shifted);
        let shifted_block = ValidatedOffset::new(shifted_offset);
        if !header.info.is_last() {
            self.set_prev_of_next(shifted_block);
        }
        (shifted_block, AllocType::ShiftToPrev)
    }

    /// Free a used block and merge it with its free neighbors.
    ///
    /// If the previous block is in use and holds padding shifted into it by an
    /// earlier allocation, that padding is given back to the freed block.
    ///
    /// Returns the resulting free block.
    ///
    /// # Panics
    /// This function panics if the block is already free.
    pub fn free(&mut self, block: ValidatedOffset) -> ValidatedOffset {
        assert!(self.is_used(block), "double free of block at offset {}", block.get());
        self.mark_free(block);
        self.try_merge_next(block);

        let prev = match self.prev(block) {
            Some(prev) => prev,
            None => return block,
        };
        if !self.is_used(prev) {
            self.merge_unchecked(prev, block);
            return prev;
        }
        if usize::from(self.header(prev).padding) >= Self::ALIGNMENT {
            let requested = self.requested_size(prev);
            if self.resize(prev, requested).is_ok() {
                if let Some(freed) = self.next(prev) {
                    return freed;
                }
            }
        }
        block
    }

    /// Change the size of a used block in place.
    ///
    /// Shrinking gives the freed bytes to a following free block or creates a
    /// new one, if they are enough for a block. Growing takes bytes from a
    /// following free block.
    ///
    /// # Errors
    /// - [`Error::FailedPrecondition`] if the block is free.
    /// - [`Error::OutOfRange`] if the block cannot grow to the new size. The
    ///   chain is unchanged in that case.
    pub fn resize(&mut self, block: ValidatedOffset, new_size: usize) -> Result<(), Error> {
        let header = self.header(block);
        if !header.info.is_used() {
            return Err(Error::FailedPrecondition);
        }
        if new_size > self.capacity() {
            return Err(Error::OutOfRange);
        }
        let alignment = header.info.alignment();
        let old_inner = self.inner_size(block);
        let new_inner = align_up(new_size, Self::ALIGNMENT);
        let restore = Layout::from_size_align(old_inner - usize::from(header.padding), alignment)
            .map_err(|_| Error::InvalidArgument)?;
        let resized =
            Layout::from_size_align(new_size, alignment).map_err(|_| Error::InvalidArgument)?;

        if new_inner == old_inner {
            self.mark_used(block, resized);
            return Ok(());
        }

        let next_poisoned = match self.next(block) {
            Some(next) if !self.is_used(next) && self.is_poisoned(next) => {
                self.crash_if_invalid(next);
                true
            }
            _ => false,
        };

        // treat the block as free to combine it with a free successor
        self.mark_free(block);
        self.try_merge_next(block);

        // a trailing block behind the old end only covers the poisoned bytes
        let inner = self.inner_size(block);
        let result = if inner < new_inner {
            if inner != old_inner {
                let trailing = self.split_unchecked(block, old_inner);
                self.update_info(trailing, |info| info.with_poisoned(next_poisoned));
            }
            Err(Error::OutOfRange)
        } else {
            if new_inner + Self::OVERHEAD <= inner {
                let trailing = self.split_unchecked(block, new_inner);
                let poisoned = next_poisoned && new_inner > old_inner;
                self.update_info(trailing, |info| info.with_poisoned(poisoned));
            }
            Ok(())
        };
        match result {
            Ok(()) => self.mark_used(block, resized),
            Err(_) => self.mark_used(block, restore),
        }
        result
    }
}

impl<C: BlockConfig> fmt::Debug for Blocks<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for block in self.iter() {
            list.entry(&format_args!(
                "{}@{}+{}",
                if self.is_used(block) { "USED" } else { "FREE" },
                block.get(),
                self.outer_size(block)
            ));
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{AllocType, Blocks, Corruption, POISON_BYTE};
    use crate::config::{BlockConfig, Config};
    use crate::region::Buffer;
    use crate::Error;
    use core::alloc::Layout;

    type C = Config<u16, 8>;
    type B<'a> = Blocks<'a, C>;
    const OVERHEAD: usize = Blocks::<'static, C>::OVERHEAD;

    fn layout(size: usize, align: usize) -> Layout {
        Layout::from_size_align(size, align).unwrap()
    }

    fn assert_tiled(blocks: &B<'_>) {
        let mut total = 0;
        for block in blocks.iter() {
            blocks.crash_if_invalid(block);
            assert_eq!(block.get(), total);
            total += blocks.outer_size(block);
        }
        assert_eq!(total, blocks.capacity());
    }

    #[test]
    fn header_overhead() {
        assert_eq!(OVERHEAD, 8);
        assert_eq!(Blocks::<Config<u32, 4>>::OVERHEAD, 12);
        assert_eq!(<C as BlockConfig>::ALIGN, 8);
    }

    #[test]
    fn init() {
        let mut buffer = Buffer::<1028>::new();
        let blocks = B::init(buffer.region()).unwrap();
        assert_eq!(blocks.capacity(), 1024);
        assert_eq!(blocks.first(), blocks.last());
        assert_eq!(blocks.outer_size(blocks.first()), 1024);
        assert_eq!(blocks.inner_size(blocks.first()), 1024 - OVERHEAD);
        assert!(blocks.is_last(blocks.first()));
        assert!(!blocks.is_used(blocks.first()));
        assert_eq!(blocks.next(blocks.first()), None);
        assert_eq!(blocks.prev(blocks.first()), None);
    }

    #[test]
    fn init_too_small() {
        let mut buffer = Buffer::<4>::new();
        assert_eq!(B::init(buffer.region()).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn init_misaligned() {
        let mut buffer = Buffer::<64>::new();
        let mut region = buffer.region();
        let ptr = region.ptr_at(4);
        drop(region);
        region = unsafe { crate::Region::from_raw_parts(ptr, 60) };
        assert_eq!(B::init(region).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn init_too_large_for_offset() {
        let mut buffer = Buffer::<{ 0x10000 * 8 }>::new();
        assert_eq!(B::init(buffer.region()).unwrap_err(), Error::OutOfRange);
    }

    #[test]
    fn split_and_merge() {
        let mut buffer = Buffer::<256>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        let first = blocks.first();
        let second = blocks.split(first, 60).unwrap().unwrap();
        assert_eq!(blocks.outer_size(first), OVERHEAD + 64);
        assert_eq!(second.get(), OVERHEAD + 64);
        assert_eq!(blocks.next(first), Some(second));
        assert_eq!(blocks.prev(second), Some(first));
        assert!(blocks.is_last(second));
        assert_eq!(blocks.last(), second);
        assert_tiled(&blocks);

        blocks.merge_next(first);
        assert_eq!(blocks.outer_size(first), 256);
        assert!(blocks.is_last(first));
        assert_tiled(&blocks);
    }

    #[test]
    fn split_absorbs_small_remainder() {
        let mut buffer = Buffer::<64>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        let first = blocks.first();
        assert_eq!(blocks.split(first, 56 - 4).unwrap(), None);
        assert_eq!(blocks.outer_size(first), 64);
        assert_eq!(blocks.split(first, 100), Err(Error::OutOfRange));
    }

    #[test]
    #[should_panic(expected = "cannot merge used blocks")]
    fn merging_used_blocks_is_fatal() {
        let mut buffer = Buffer::<256>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        let (block, _) = blocks.alloc_first(blocks.first(), layout(16, 1)).unwrap();
        blocks.merge_next(block);
    }

    #[test]
    fn alloc_first_exact_and_new_next() {
        let mut buffer = Buffer::<256>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        let (block, alloc_type) = blocks.alloc_first(blocks.first(), layout(20, 4)).unwrap();
        assert_eq!(alloc_type, AllocType::NewNext);
        assert_eq!(block, blocks.first());
        assert!(blocks.is_used(block));
        assert_eq!(blocks.inner_size(block), 24);
        assert_eq!(blocks.requested_size(block), 20);
        assert_eq!(blocks.alignment(block), 4);
        assert_tiled(&blocks);
    }

    #[test]
    fn alloc_first_with_large_alignment() {
        let mut buffer = Buffer::<1024>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        let (block, alloc_type) = blocks.alloc_first(blocks.first(), layout(32, 256)).unwrap();
        assert_eq!(alloc_type, AllocType::NewPrevAndNewNext);
        assert_eq!(blocks.usable_space(block).as_ptr() as usize % 256, 0);
        assert!(!blocks.is_used(blocks.first()));
        assert_tiled(&blocks);
    }

    #[test]
    fn alloc_first_failures() {
        let mut buffer = Buffer::<64>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        let first = blocks.first();
        assert_eq!(blocks.alloc_first(first, layout(0, 1)), Err(Error::InvalidArgument));
        assert_eq!(blocks.alloc_first(first, layout(57, 1)), Err(Error::OutOfRange));
        // the usable space is never 32-aligned, padding leaves too few bytes
        assert_eq!(blocks.alloc_first(first, layout(48, 32)), Err(Error::ResourceExhausted));
        blocks.alloc_first(first, layout(8, 1)).unwrap();
        assert_eq!(blocks.alloc_first(first, layout(8, 1)), Err(Error::FailedPrecondition));
    }

    #[test]
    fn alloc_last_places_at_end() {
        let mut buffer = Buffer::<256>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        let (block, alloc_type) = blocks.alloc_last(blocks.first(), layout(32, 8)).unwrap();
        assert_eq!(alloc_type, AllocType::NewPrev);
        assert_eq!(block, blocks.last());
        assert_eq!(blocks.inner_size(block), 32);
        assert!(!blocks.is_used(blocks.first()));
        assert_tiled(&blocks);
    }

    #[test]
    fn alloc_last_shifts_into_previous() {
        let mut buffer = Buffer::<256>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        let (used, _) = blocks.alloc_first(blocks.first(), layout(16, 8)).unwrap();
        let free = blocks.next(used).unwrap();
        // leave exactly 8 bytes in front, which is too small for a block
        let size = blocks.inner_size(free) - 8;
        let (block, alloc_type) = blocks.alloc_last(free, layout(size, 8)).unwrap();
        assert_eq!(alloc_type, AllocType::ShiftToPrev);
        assert_eq!(blocks.inner_size(used), 24);
        assert_eq!(blocks.requested_size(used), 16);
        assert_eq!(blocks.next(used), Some(block));
        assert_tiled(&blocks);

        // freeing the block gives the shifted bytes back
        let freed = blocks.free(block);
        assert_eq!(blocks.inner_size(used), 16);
        assert_eq!(blocks.next(used), Some(freed));
        assert_eq!(blocks.outer_size(freed), 256 - OVERHEAD - 16);
        assert_tiled(&blocks);
    }

    #[test]
    fn alloc_last_never_creates_trailing_block() {
        let mut buffer = Buffer::<512>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        for (size, align) in [(1, 1), (24, 8), (13, 32), (100, 64), (7, 128)] {
            let free = blocks.iter_rev().find(|&block| !blocks.is_used(block)).unwrap();
            if let Ok((block, alloc_type)) = blocks.alloc_last(free, layout(size, align)) {
                assert!(!alloc_type.has_new_next());
                assert!(blocks.next(block).map_or(true, |next| blocks.is_used(next)));
                assert_eq!(blocks.usable_space(block).as_ptr() as usize % align, 0);
            }
            assert_tiled(&blocks);
        }
    }

    #[test]
    fn free_merges_neighbors() {
        let mut buffer = Buffer::<256>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        let (a, _) = blocks.alloc_first(blocks.first(), layout(16, 8)).unwrap();
        let (b, _) = blocks.alloc_first(blocks.next(a).unwrap(), layout(16, 8)).unwrap();
        let (c, _) = blocks.alloc_first(blocks.next(b).unwrap(), layout(16, 8)).unwrap();
        assert_eq!(blocks.iter().count(), 4);

        blocks.free(a);
        blocks.free(c);
        assert_eq!(blocks.iter().count(), 3);
        let merged = blocks.free(b);
        assert_eq!(merged, blocks.first());
        assert_eq!(blocks.iter().count(), 1);
        assert_tiled(&blocks);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let mut buffer = Buffer::<256>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        let (a, _) = blocks.alloc_first(blocks.first(), layout(16, 8)).unwrap();
        blocks.free(a);
        blocks.free(a);
    }

    #[test]
    fn resize() {
        let mut buffer = Buffer::<256>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        let (a, _) = blocks.alloc_first(blocks.first(), layout(32, 8)).unwrap();

        blocks.resize(a, 32).unwrap();
        assert_eq!(blocks.inner_size(a), 32);

        blocks.resize(a, 64).unwrap();
        assert_eq!(blocks.inner_size(a), 64);
        assert_tiled(&blocks);

        blocks.resize(a, 8).unwrap();
        assert_eq!(blocks.inner_size(a), 8);
        assert_eq!(blocks.requested_size(a), 8);
        assert_tiled(&blocks);

        assert_eq!(blocks.resize(a, 1024), Err(Error::OutOfRange));
        assert_eq!(blocks.resize(a, 250), Err(Error::OutOfRange));
        assert_eq!(blocks.inner_size(a), 8);
        assert_eq!(blocks.alignment(a), 8);
        assert_tiled(&blocks);

        let free = blocks.next(a).unwrap();
        assert_eq!(blocks.resize(free, 8), Err(Error::FailedPrecondition));
    }

    #[test]
    fn poisoning() {
        let mut buffer = Buffer::<256>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        let first = blocks.first();
        blocks.poison(first);
        assert!(blocks.is_poisoned(first));
        assert_eq!(blocks.check_status(first), Ok(()));

        let second = blocks.split(first, 64).unwrap().unwrap();
        assert!(blocks.is_poisoned(second));
        assert_eq!(blocks.check_status(second), Ok(()));

        let offset = blocks.usable_offset(second) + 3;
        blocks.region_mut().write(offset, !POISON_BYTE);
        assert_eq!(blocks.check_status(second), Err(Corruption::PoisonCorrupted));
    }

    #[test]
    #[should_panic(expected = "poisoned memory was modified")]
    fn allocating_corrupted_poisoned_block_is_fatal() {
        let mut buffer = Buffer::<256>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        let first = blocks.first();
        blocks.poison(first);
        let offset = blocks.usable_offset(first);
        blocks.region_mut().write(offset, 0u8);
        let _ = blocks.alloc_first(first, layout(8, 8));
    }

    #[test]
    fn resize_keeps_the_poison_of_the_next_block() {
        let mut buffer = Buffer::<256>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        let (a, _) = blocks.alloc_first(blocks.first(), layout(64, 8)).unwrap();
        let next = blocks.next(a).unwrap();
        blocks.poison(next);

        // the merged block is too small, the chain is restored
        assert_eq!(blocks.resize(a, 256 - OVERHEAD + 1), Err(Error::OutOfRange));
        let next = blocks.next(a).unwrap();
        assert!(blocks.is_poisoned(next));
        assert_eq!(blocks.check_status(next), Ok(()));

        blocks.resize(a, 96).unwrap();
        let next = blocks.next(a).unwrap();
        assert!(blocks.is_poisoned(next));
        assert_eq!(blocks.check_status(next), Ok(()));
        assert_tiled(&blocks);

        // the bytes given back by shrinking were never poisoned
        blocks.resize(a, 8).unwrap();
        let next = blocks.next(a).unwrap();
        assert!(!blocks.is_poisoned(next));
        assert_tiled(&blocks);
    }

    #[test]
    #[should_panic(expected = "poisoned memory was modified")]
    fn resizing_into_corrupted_poisoned_block_is_fatal() {
        let mut buffer = Buffer::<256>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        let (a, _) = blocks.alloc_first(blocks.first(), layout(64, 8)).unwrap();
        let next = blocks.next(a).unwrap();
        blocks.poison(next);
        let offset = blocks.usable_offset(next) + 40;
        blocks.region_mut().write(offset, !POISON_BYTE);
        let _ = blocks.resize(a, 96);
    }

    #[test]
    fn detects_broken_links() {
        let mut buffer = Buffer::<256>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        let first = blocks.first();
        // initialize the usable space, the corrupted header points into it
        blocks.poison(first);
        let second = blocks.split(first, 64).unwrap().unwrap();
        // corrupt the `prev` field of the second block
        blocks.region_mut().write(second.get(), 3u16);
        assert_eq!(blocks.check_status(first), Err(Corruption::NextMismatched));
        assert_eq!(blocks.check_status(second), Err(Corruption::PrevMismatched));
    }

    #[test]
    fn detects_overflowing_sizes() {
        let mut buffer = Buffer::<256>::new();
        let mut blocks = Blocks::<'_, Config>::init(buffer.region()).unwrap();
        let first = blocks.first();
        // the `next` field follows the `prev` field
        let next = first.get() + core::mem::size_of::<usize>();
        blocks.region_mut().write(next, usize::MAX / 2);
        assert_eq!(blocks.check_status(first), Err(Corruption::NextMismatched));

        blocks.region_mut().write(first.get(), usize::MAX / 2);
        blocks.region_mut().write(next, 256 / Blocks::<'_, Config>::ALIGNMENT);
        assert_eq!(blocks.check_status(first), Err(Corruption::PrevMismatched));
    }

    #[test]
    #[should_panic(expected = "next block does not point back")]
    fn overflowing_size_is_fatal() {
        let mut buffer = Buffer::<256>::new();
        let mut blocks = Blocks::<'_, Config>::init(buffer.region()).unwrap();
        let first = blocks.first();
        blocks.region_mut().write(first.get() + core::mem::size_of::<usize>(), usize::MAX);
        let _ = blocks.outer_size(first);
    }

    #[test]
    fn find_and_from_usable_space() {
        let mut buffer = Buffer::<256>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        let (a, _) = blocks.alloc_first(blocks.first(), layout(16, 8)).unwrap();
        let (b, _) = blocks.alloc_first(blocks.next(a).unwrap(), layout(16, 8)).unwrap();
        let ptr = blocks.usable_space(b);
        assert_eq!(blocks.find(ptr), Ok(b));
        assert_eq!(unsafe { blocks.from_usable_space(ptr) }, Ok(b));

        let offset = blocks.usable_offset(b) + 4;
        let inside = blocks.region_mut().ptr_at(offset);
        assert_eq!(blocks.find(inside), Err(Error::NotFound));
        let outside = core::ptr::NonNull::dangling();
        assert_eq!(blocks.find(outside), Err(Error::OutOfRange));
    }

    #[test]
    fn reverse_iteration() {
        let mut buffer = Buffer::<256>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        let first = blocks.first();
        let second = blocks.split(first, 32).unwrap().unwrap();
        let third = blocks.split(second, 32).unwrap().unwrap();
        let forward: std::vec::Vec<_> = blocks.iter().collect();
        let mut backward: std::vec::Vec<_> = blocks.iter_rev().collect();
        backward.reverse();
        assert_eq!(forward, [first, second, third]);
        assert_eq!(forward, backward);
    }

    #[test]
    #[should_panic(expected = "outstanding allocation")]
    fn crash_if_allocated() {
        let mut buffer = Buffer::<256>::new();
        let mut blocks = B::init(buffer.region()).unwrap();
        blocks.alloc_first(blocks.first(), layout(16, 8)).unwrap();
        blocks.crash_if_allocated();
    }
}
