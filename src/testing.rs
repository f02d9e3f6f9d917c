//! Helpers for building block chains in a known state and scenarios shared by
//! the tests of all block strategies.
use crate::block::{align_up, Blocks};
use crate::block_allocator::{BlockAllocator, Strategy};
use crate::config::BlockConfig;
use crate::region::Region;
use crate::Allocator;

use core::alloc::Layout;
use core::ptr::NonNull;
use std::vec::Vec;

/// An outer size covering all bytes left in the region.
pub const REMAINING: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Used,
    Free,
}

/// One block of a preallocated chain.
#[derive(Debug, Clone, Copy)]
pub struct Preallocation {
    pub outer_size: usize,
    pub state: State,
}
impl Preallocation {
    pub const fn new(outer_size: usize, state: State) -> Self {
        Self { outer_size, state }
    }
}

/// Build a chain of blocks with the given sizes and states.
///
/// Used blocks are marked as holding an allocation of their whole inner size.
pub fn preallocate<'a, C: BlockConfig>(
    region: Region<'a>,
    preallocations: &[Preallocation],
) -> Blocks<'a, C> {
    let mut blocks = Blocks::<C>::init(region).unwrap();
    let mut cursor = Some(blocks.first());
    for preallocation in preallocations {
        let block = cursor.expect("preallocations exceed the region");
        let outer = blocks.outer_size(block);
        let wanted = if preallocation.outer_size == REMAINING {
            outer
        } else {
            preallocation.outer_size
        };
        assert!(wanted <= outer, "preallocations exceed the region");
        if wanted < outer {
            blocks.split(block, wanted - Blocks::<C>::OVERHEAD).unwrap();
        }
        assert_eq!(blocks.outer_size(block), wanted, "unsplittable preallocation");

        if preallocation.state == State::Used {
            let inner = blocks.inner_size(block);
            let layout = Layout::from_size_align(inner, Blocks::<C>::ALIGNMENT).unwrap();
            blocks.alloc_first(block, layout).unwrap();
        }
        cursor = blocks.next(block);
    }
    blocks
}

/// Create an allocator managing a preallocated chain of blocks.
pub fn preallocated<'a, S: Strategy<C>, C: BlockConfig>(
    region: Region<'a>,
    strategy: S,
    preallocations: &[Preallocation],
) -> BlockAllocator<'a, S, C> {
    let mut allocator = BlockAllocator::with_strategy(strategy);
    allocator
        .init_with_blocks(preallocate(region, preallocations))
        .unwrap();
    allocator
}

/// Free every used block and check that a single free block remains.
pub fn release_all<S: Strategy<C>, C: BlockConfig>(allocator: &mut BlockAllocator<'_, S, C>) {
    loop {
        let blocks = allocator.blocks().unwrap();
        let used = blocks.iter().find(|&block| blocks.is_used(block));
        let ptr = match used {
            Some(block) => blocks.usable_space(block),
            None => break,
        };
        unsafe { allocator.deallocate(ptr) };
    }
    assert_eq!(allocator.blocks().unwrap().iter().count(), 1);
}

/// Check that the blocks tile the region and that no two free blocks are
/// adjacent.
pub fn check_chain<C: BlockConfig>(blocks: &Blocks<'_, C>) {
    let mut total = 0;
    let mut prev_free = false;
    for block in blocks.iter() {
        blocks.crash_if_invalid(block);
        assert_eq!(block.get(), total, "gap or overlap in front of block");
        total += blocks.outer_size(block);
        let free = !blocks.is_used(block);
        assert!(!(free && prev_free), "adjacent free blocks at offset {}", block.get());
        prev_free = free;
    }
    assert_eq!(total, blocks.capacity());
    assert!(blocks.is_last(blocks.last()));
}

fn layout(size: usize, align: usize) -> Layout {
    Layout::from_size_align(size, align).unwrap()
}

/// Allocate and free objects of various sizes and alignments.
pub fn allocate_and_free<A: Allocator>(allocator: &mut A) {
    let capacity = allocator.capacity().unwrap();
    let mut ptrs: Vec<(NonNull<u8>, Layout)> = Vec::new();
    for (size, align) in [(1, 1), (24, 8), (100, 4), (64, 64), (13, 16), (200, 8)] {
        let layout = layout(size, align);
        let ptr = allocator.allocate(layout).expect("allocation failed");
        assert_eq!(ptr.as_ptr() as usize % align, 0);
        unsafe { ptr.as_ptr().write_bytes(0xab, size) };
        ptrs.push((ptr, layout));
    }
    for &(ptr, layout) in &ptrs {
        let reported = allocator.get_layout(ptr).unwrap();
        assert!(reported.size() >= layout.size());
        assert_eq!(reported.align(), layout.align());
        assert!(allocator.recognizes(ptr));
    }
    // free every other allocation first
    for (ptr, _) in ptrs.iter().step_by(2).chain(ptrs.iter().skip(1).step_by(2)) {
        unsafe { allocator.deallocate(*ptr) };
    }
    assert_eq!(allocator.capacity(), Ok(capacity));
    let whole = layout(capacity / 2, 8);
    let ptr = allocator.allocate(whole).expect("memory was lost");
    unsafe { allocator.deallocate(ptr) };
}

/// Grow and shrink an allocation in place and by moving it.
pub fn resize_and_reallocate<A: Allocator>(allocator: &mut A) {
    let first = allocator.allocate(layout(32, 8)).unwrap();
    unsafe {
        first.as_ptr().write_bytes(0x11, 32);
        assert!(allocator.resize(first, 32));
        assert!(allocator.resize(first, 16));
        assert!(allocator.resize(first, 32));
        assert_eq!(*first.as_ptr().add(15), 0x11);
    }

    let blocker = allocator.allocate(layout(8, 8)).unwrap();
    let moved = unsafe { allocator.reallocate(Some(first), layout(512, 8)) }.unwrap();
    unsafe {
        for i in 0..16 {
            assert_eq!(*moved.as_ptr().add(i), 0x11);
        }
        allocator.deallocate(blocker);
        allocator.deallocate(moved);
    }

    let fresh = unsafe { allocator.reallocate(None, layout(8, 8)) }.unwrap();
    unsafe { allocator.deallocate(fresh) };
}

/// Exhaust the memory with small allocations and give it all back.
pub fn exhaust<A: Allocator>(allocator: &mut A) {
    let mut ptrs = Vec::new();
    while let Some(ptr) = allocator.allocate(layout(16, 8)) {
        ptrs.push(ptr);
    }
    assert!(!ptrs.is_empty());
    for ptr in ptrs.into_iter().rev() {
        unsafe { allocator.deallocate(ptr) };
    }
    let ptr = allocator.allocate(layout(64, 8)).expect("memory was lost");
    unsafe { allocator.deallocate(ptr) };
}

/// Fail aligned requests in an unaligned gap between used blocks, then fit
/// smaller aligned requests into the same gap.
pub fn allocate_alignment_failure<S: Strategy<C>, C: BlockConfig>(region: Region<'_>, strategy: S) {
    const GAP: usize = 1024;
    let overhead = Blocks::<C>::OVERHEAD;
    // the usable space of the gap starts 8 bytes past a multiple of 128
    let addr = region.addr();
    let first = align_up(addr + overhead + 64, 128) + 8 - overhead - addr;
    let mut allocator = preallocated(
        region,
        strategy,
        &[
            Preallocation::new(first, State::Used),
            Preallocation::new(GAP, State::Free),
            Preallocation::new(REMAINING, State::Used),
        ],
    );
    let gap = GAP - overhead;
    assert_eq!(allocator.allocate(layout(gap, 128)), None);
    assert_eq!(allocator.allocate(layout(gap, 64)), None);
    assert_eq!(allocator.allocate(layout(gap - 32, 64)), None);
    check_chain(allocator.blocks().unwrap());

    for _ in 0..2 {
        let ptr = allocator.allocate(layout(128, 64)).expect("aligned gap not found");
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        assert_eq!(allocator.get_layout(ptr).unwrap().align(), 64);
        unsafe { ptr.as_ptr().write_bytes(0x5a, 128) };
    }
    check_chain(allocator.blocks().unwrap());
    release_all(&mut allocator);
}
