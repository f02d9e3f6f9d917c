//! Compile-time configuration of the block allocators.
//!
//! All knobs are part of the allocator's type, so they are fixed at
//! construction time and cost nothing at runtime:
//! - the integer width used to store block sizes ([`Offset`]),
//! - the alignment floor of every block,
//! - the poisoning interval (0 disables poisoning).
use core::fmt;
use core::marker::PhantomData;

/// The default alignment of all blocks: the alignment of a `usize`.
pub const DEFAULT_ALIGNMENT: usize = core::mem::align_of::<usize>();

/// The largest alignment a block allocator can honor.
///
/// Larger alignments are rejected as unsatisfiable.
pub const MAX_ALIGNMENT: usize = 1 << 14;

mod sealed {
    pub trait Sealed {}
}

/// An unsigned integer type used to store block sizes inside the headers.
///
/// Sizes are stored in units of the configured alignment, so the largest
/// region a block allocator can manage is `Offset::MAX * alignment` bytes.
/// Smaller types reduce the per-block overhead.
pub trait Offset: sealed::Sealed + Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// The largest value representable, saturated to `usize`.
    const MAX: usize;

    /// Convert from a `usize`, which must not exceed [`Offset::MAX`].
    fn from_usize(value: usize) -> Self;

    /// Convert into a `usize`.
    fn to_usize(self) -> usize;
}

macro_rules! impl_offset {
    ($($ty:ty),*) => {$(
        impl sealed::Sealed for $ty {}
        impl Offset for $ty {
            const MAX: usize = {
                let max = <$ty>::MAX as u128;
                if max > usize::MAX as u128 {
                    usize::MAX
                } else {
                    max as usize
                }
            };

            #[allow(clippy::cast_possible_truncation)] // range checked by caller
            fn from_usize(value: usize) -> Self {
                debug_assert!(value <= <Self as Offset>::MAX, "offset out of range");
                value as $ty
            }

            #[allow(clippy::cast_possible_truncation)] // values never exceed `MAX`
            fn to_usize(self) -> usize {
                self as usize
            }
        }
    )*};
}
impl_offset!(u16, u32, u64, usize);

/// The configuration of a block-based allocator.
///
/// Use [`Config`] instead of implementing this trait manually.
pub trait BlockConfig: 'static {
    /// The integer type used for block sizes.
    type Offset: Offset;
    /// The alignment floor of every block. Must be a power of two.
    const ALIGN: usize;
    /// Poison every n-th freed block. 0 disables poisoning.
    const POISON_INTERVAL: u16;
}

/// The standard [`BlockConfig`].
///
/// ```
/// use blockalloc::Config;
///
/// // the default: `usize`-sized offsets, `usize`-alignment, no poisoning
/// type Standard = Config;
/// // compact headers for small heaps with every 4th freed block poisoned
/// type Compact = Config<u16, 8, 4>;
/// ```
pub struct Config<O = usize, const ALIGN: usize = { DEFAULT_ALIGNMENT }, const POISON_INTERVAL: u16 = 0>(
    PhantomData<O>,
);
impl<O: Offset, const ALIGN: usize, const POISON_INTERVAL: u16> BlockConfig
    for Config<O, ALIGN, POISON_INTERVAL>
{
    type Offset = O;
    const ALIGN: usize = ALIGN;
    const POISON_INTERVAL: u16 = POISON_INTERVAL;
}
