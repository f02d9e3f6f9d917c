use super::Blocks;
use crate::config::BlockConfig;
use crate::region::ValidatedOffset;

/// Iterator over the blocks of a chain, from the first to the last one.
pub struct Iter<'b, 'a, C: BlockConfig> {
    blocks: &'b Blocks<'a, C>,
    next: Option<ValidatedOffset>,
}
impl<'b, 'a, C: BlockConfig> Iter<'b, 'a, C> {
    pub(super) fn new(blocks: &'b Blocks<'a, C>) -> Self {
        Self {
            blocks,
            next: Some(blocks.first()),
        }
    }
}
impl<C: BlockConfig> Iterator for Iter<'_, '_, C> {
    type Item = ValidatedOffset;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next?;
        self.next = self.blocks.next(block);
        Some(block)
    }
}

/// Iterator over the blocks of a chain, from the last to the first one.
pub struct ReverseIter<'b, 'a, C: BlockConfig> {
    blocks: &'b Blocks<'a, C>,
    next: Option<ValidatedOffset>,
}
impl<'b, 'a, C: BlockConfig> ReverseIter<'b, 'a, C> {
    pub(super) fn new(blocks: &'b Blocks<'a, C>) -> Self {
        Self {
            blocks,
            next: Some(blocks.last()),
        }
    }
}
impl<C: BlockConfig> Iterator for ReverseIter<'_, '_, C> {
    type Item = ValidatedOffset;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next?;
        self.next = self.blocks.prev(block);
        Some(block)
    }
}
