//! The in-band header in front of every block.
use crate::config::Offset;

/// Packed state bits of a block.
///
/// Bit layout:
/// - bit 0: the block is in use
/// - bit 1: the usable space of the (free) block is poisoned
/// - bit 2: the block is the last one of the region
/// - bits 8..13: log2 of the alignment requested for a used block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub(crate) struct Info(u16);
impl Info {
    const USED: u16 = 1 << 0;
    const POISONED: u16 = 1 << 1;
    const LAST: u16 = 1 << 2;
    const ALIGN_SHIFT: u16 = 8;
    const ALIGN_MASK: u16 = 0x1f << Self::ALIGN_SHIFT;

    pub const fn free() -> Self {
        Self(0)
    }

    pub const fn is_used(self) -> bool {
        self.0 & Self::USED != 0
    }

    pub const fn is_poisoned(self) -> bool {
        self.0 & Self::POISONED != 0
    }

    pub const fn is_last(self) -> bool {
        self.0 & Self::LAST != 0
    }

    pub const fn alignment(self) -> usize {
        1 << ((self.0 & Self::ALIGN_MASK) >> Self::ALIGN_SHIFT)
    }

    pub const fn with_used(self, used: bool) -> Self {
        self.with(Self::USED, used)
    }

    pub const fn with_poisoned(self, poisoned: bool) -> Self {
        self.with(Self::POISONED, poisoned)
    }

    pub const fn with_last(self, last: bool) -> Self {
        self.with(Self::LAST, last)
    }

    /// Store an alignment, which must be a power of two.
    #[allow(clippy::cast_possible_truncation)] // a `usize` has at most 128 bits
    pub const fn with_alignment(self, alignment: usize) -> Self {
        let shift = alignment.trailing_zeros() as u16;
        Self((self.0 & !Self::ALIGN_MASK) | ((shift << Self::ALIGN_SHIFT) & Self::ALIGN_MASK))
    }

    const fn with(self, bit: u16, set: bool) -> Self {
        if set {
            Self(self.0 | bit)
        } else {
            Self(self.0 & !bit)
        }
    }
}

/// The header of a block.
///
/// The header does not store any addresses. `prev` is the outer size of the
/// preceding block and `next` is the outer size of this block, both in units
/// of the block alignment. A `prev` of zero marks the first block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct Header<O> {
    pub prev: O,
    pub next: O,
    pub info: Info,
    /// The number of bytes between the requested size and the inner size of a
    /// used block.
    pub padding: u16,
}
impl<O: Offset> Header<O> {
    /// Create a header of a free block.
    pub fn free(prev_outer_units: usize, outer_units: usize) -> Self {
        Self {
            prev: O::from_usize(prev_outer_units),
            next: O::from_usize(outer_units),
            info: Info::free(),
            padding: 0,
        }
    }
}
