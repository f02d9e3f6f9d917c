//! Strategies scanning the chain of blocks linearly.
use super::Strategy;
use crate::block::Blocks;
use crate::config::BlockConfig;
use crate::region::ValidatedOffset;

use core::alloc::Layout;

/// Use the first free block from the start of the region that fits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirstFit;

/// Use the last free block from the end of the region that fits.
///
/// Allocations are placed at the end of the chosen block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LastFit;

/// Use the smallest free block that fits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BestFit;

/// Use the largest free block that fits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorstFit;

/// Place large allocations first-fit from the start of the region and small
/// ones last-fit from its end.
///
/// Requests of at least [`threshold()`](Self::threshold) bytes count as large.
/// Keeping both kinds apart reduces fragmentation for workloads mixing
/// short-lived small objects with long-lived large buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DualFirstFit {
    threshold: usize,
}
impl DualFirstFit {
    /// Create the strategy with the given size threshold.
    pub const fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    /// The smallest size of a large allocation.
    pub const fn threshold(&self) -> usize {
        self.threshold
    }

    /// Change the size threshold.
    pub fn set_threshold(&mut self, threshold: usize) {
        self.threshold = threshold;
    }
}

fn first_fit<C: BlockConfig>(blocks: &mut Blocks<'_, C>, layout: Layout) -> Option<ValidatedOffset> {
    let mut cursor = Some(blocks.first());
    while let Some(block) = cursor {
        if !blocks.is_used(block) {
            if let Ok((block, _)) = blocks.alloc_first(block, layout) {
                return Some(block);
            }
        }
        cursor = blocks.next(block);
    }
    None
}

fn last_fit<C: BlockConfig>(blocks: &mut Blocks<'_, C>, layout: Layout) -> Option<ValidatedOffset> {
    let mut cursor = Some(blocks.last());
    while let Some(block) = cursor {
        if !blocks.is_used(block) {
            if let Ok((block, _)) = blocks.alloc_last(block, layout) {
                return Some(block);
            }
        }
        cursor = blocks.prev(block);
    }
    None
}

/// Allocate from the end of the free block, whose outer size is preferred
/// over all others by `prefer(candidate, chosen)`. Ties keep the block closer
/// to the end of the region.
fn fit_by<C: BlockConfig>(
    blocks: &mut Blocks<'_, C>,
    layout: Layout,
    prefer: impl Fn(usize, usize) -> bool,
) -> Option<ValidatedOffset> {
    let mut chosen: Option<(ValidatedOffset, usize)> = None;
    for block in blocks.iter_rev() {
        if blocks.is_used(block) || blocks.can_alloc_last(block, layout).is_err() {
            continue;
        }
        let size = blocks.outer_size(block);
        if chosen.map_or(true, |(_, chosen_size)| prefer(size, chosen_size)) {
            chosen = Some((block, size));
        }
    }
    let (block, _) = chosen?;
    blocks.alloc_last(block, layout).ok().map(|(block, _)| block)
}

impl<C: BlockConfig> Strategy<C> for FirstFit {
    const INIT: Self = Self;

    fn choose_block(
        &mut self,
        blocks: &mut Blocks<'_, C>,
        layout: Layout,
    ) -> Option<ValidatedOffset> {
        first_fit(blocks, layout)
    }
}

impl<C: BlockConfig> Strategy<C> for LastFit {
    const INIT: Self = Self;

    fn choose_block(
        &mut self,
        blocks: &mut Blocks<'_, C>,
        layout: Layout,
    ) -> Option<ValidatedOffset> {
        last_fit(blocks, layout)
    }
}

impl<C: BlockConfig> Strategy<C> for BestFit {
    const INIT: Self = Self;

    fn choose_block(
        &mut self,
        blocks: &mut Blocks<'_, C>,
        layout: Layout,
    ) -> Option<ValidatedOffset> {
        fit_by(blocks, layout, |size, chosen| size < chosen)
    }
}

impl<C: BlockConfig> Strategy<C> for WorstFit {
    const INIT: Self = Self;

    fn choose_block(
        &mut self,
        blocks: &mut Blocks<'_, C>,
        layout: Layout,
    ) -> Option<ValidatedOffset> {
        fit_by(blocks, layout, |size, chosen| size > chosen)
    }
}

impl<C: BlockConfig> Strategy<C> for DualFirstFit {
    const INIT: Self = Self::new(0);

    fn choose_block(
        &mut self,
        blocks: &mut Blocks<'_, C>,
        layout: Layout,
    ) -> Option<ValidatedOffset> {
        if layout.size() < self.threshold {
            last_fit(blocks, layout)
        } else {
            first_fit(blocks, layout)
        }
    }
}
