//! The memory region managed by an allocator and its support types.
//!
//! A [`Region`] is a borrowed span of raw bytes. Every access to the managed
//! memory goes through it: callers address the memory by byte offsets, which
//! are bounds-checked, instead of doing pointer arithmetic themselves.
use core::marker::PhantomData;
use core::mem::{self, MaybeUninit};
use core::ptr::{self, NonNull};

/// An offset into a [`Region`], that is validated and known to be safe.
///
/// Block allocators use this type to refer to a block header: the offset is
/// in bounds and there is an initialized header stored at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValidatedOffset(usize);
impl ValidatedOffset {
    /// Mark an offset as valid.
    ///
    /// The caller must make sure, that the offset actually points to an
    /// initialized header. This is not `unsafe`, since reading the header
    /// still goes through the bounds checks of the [`Region`].
    pub(crate) const fn new(offset: usize) -> Self {
        Self(offset)
    }

    /// The raw byte offset from the start of the region.
    pub const fn get(self) -> usize {
        self.0
    }
}

/// Statically sized backing memory for an allocator.
///
/// This buffer is meant to be placed in a `static`, so that it ends up in the
/// `.bss`-section without being initialized at startup. It is aligned to 32
/// bytes, which satisfies the default alignment of every allocator in this
/// crate.
/// ```
/// use blockalloc::{Buffer, FirstFitAllocator};
///
/// let mut buffer = Buffer::<1024>::new();
/// let mut allocator = FirstFitAllocator::new();
/// allocator.init(buffer.region()).unwrap();
/// ```
#[repr(C, align(32))]
pub struct Buffer<const N: usize>([MaybeUninit<u8>; N]);
impl<const N: usize> Buffer<N> {
    /// Create a new, uninitialized buffer.
    pub const fn new() -> Self {
        Self([MaybeUninit::uninit(); N])
    }

    /// Borrow the whole buffer as a [`Region`].
    pub fn region(&mut self) -> Region<'_> {
        Region::uninit(&mut self.0)
    }
}
impl<const N: usize> Default for Buffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A contiguous span of memory exclusively borrowed by an allocator.
///
/// The region behaves like a `&'a mut [MaybeUninit<u8>]`: its contents may be
/// uninitialized and it is never freed or grown by the allocator.
#[derive(Debug)]
pub struct Region<'a> {
    base: NonNull<u8>,
    len: usize,
    _memory: PhantomData<&'a mut [MaybeUninit<u8>]>,
}
// SAFETY: a region is an exclusive borrow of plain bytes, just like a
// `&mut [u8]`, which is `Send` as well.
unsafe impl Send for Region<'_> {}

impl<'a> Region<'a> {
    /// Manage initialized memory.
    pub fn new(memory: &'a mut [u8]) -> Self {
        let len = memory.len();
        Self {
            base: NonNull::from(memory).cast(),
            len,
            _memory: PhantomData,
        }
    }

    /// Manage possibly uninitialized memory.
    pub fn uninit(memory: &'a mut [MaybeUninit<u8>]) -> Self {
        let len = memory.len();
        Self {
            base: NonNull::from(memory).cast(),
            len,
            _memory: PhantomData,
        }
    }

    /// Manage memory given by a raw pointer and a length.
    ///
    /// # Safety
    /// The memory `ptr..ptr + len` must be valid for reads and writes for the
    /// lifetime `'a` and must not be accessed by anything else in that time.
    pub const unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            base: ptr,
            len,
            _memory: PhantomData,
        }
    }

    /// The address of the first byte.
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// The length of the region in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the region contains no bytes at all.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Forget about every byte after `len`.
    ///
    /// # Panics
    /// This function panics if `len` exceeds the current length.
    pub(crate) fn truncate(&mut self, len: usize) {
        assert!(len <= self.len, "cannot grow a region");
        self.len = len;
    }

    /// Forget about the first `count` bytes.
    ///
    /// # Panics
    /// This function panics if `count` exceeds the current length.
    pub(crate) fn advance(&mut self, count: usize) {
        self.base = self.ptr_at(count);
        self.len -= count;
    }

    /// Obtain a pointer to the byte at `offset`.
    ///
    /// The one-past-the-end offset is allowed.
    ///
    /// # Panics
    /// This function panics if the offset is past the end of the region.
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset <= self.len, "offset out of bounds");
        // SAFETY: the offset is in bounds of the allocation (or one past its
        // end), so the pointer arithmetic cannot wrap around and the result
        // is non-null, since the base is non-null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Compute the offset of a pointer into this region.
    ///
    /// Returns `None` if the pointer does not point inside the region.
    pub(crate) fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.addr())?;
        (offset < self.len).then_some(offset)
    }

    /// Read a value of type `T` at the given offset.
    ///
    /// The memory might not contain a valid `T`, which is why a
    /// [`MaybeUninit<T>`] is returned: the caller has to use an `unsafe` block
    /// when assuming, that the value is initialized. The read does not need to
    /// be aligned.
    ///
    /// # Panics
    /// This function panics if the value would be read past the end of the
    /// region.
    pub(crate) fn read<T: Copy>(&self, offset: usize) -> MaybeUninit<T> {
        assert!(
            offset.checked_add(mem::size_of::<T>()).is_some_and(|end| end <= self.len),
            "read out of bounds"
        );

        // SAFETY: the bounds are checked above and the read is unaligned.
        // Reading a `MaybeUninit` is fine for uninitialized memory as well.
        unsafe {
            ptr::read_unaligned(
                self.base
                    .as_ptr()
                    .add(offset)
                    .cast::<MaybeUninit<T>>()
                    .cast_const(),
            )
        }
    }

    /// Write a value of type `T` at the given offset.
    ///
    /// # Panics
    /// This function panics if the value would be written past the end of the
    /// region.
    pub(crate) fn write<T: Copy>(&mut self, offset: usize, value: T) {
        assert!(
            offset.checked_add(mem::size_of::<T>()).is_some_and(|end| end <= self.len),
            "write out of bounds"
        );

        // SAFETY: the bounds are checked above and the write is unaligned.
        unsafe { ptr::write_unaligned(self.base.as_ptr().add(offset).cast::<T>(), value) }
    }

    /// Set `len` bytes starting at `offset` to `byte`.
    ///
    /// # Panics
    /// This function panics if the range exceeds the region.
    pub(crate) fn fill(&mut self, offset: usize, len: usize, byte: u8) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "fill out of bounds"
        );

        // SAFETY: the bounds are checked above.
        unsafe { ptr::write_bytes(self.base.as_ptr().add(offset), byte, len) }
    }

    /// Check whether every byte of `offset..offset + len` equals `byte`.
    ///
    /// # Safety
    /// The bytes must have been initialized before, e.g. using
    /// [`fill()`](Self::fill).
    ///
    /// # Panics
    /// This function panics if the range exceeds the region.
    pub(crate) unsafe fn is_filled_with(&self, offset: usize, len: usize, byte: u8) -> bool {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "read out of bounds"
        );

        // SAFETY: the bounds are checked above, initialization is guaranteed
        // by the caller.
        let bytes = unsafe { core::slice::from_raw_parts(self.base.as_ptr().add(offset), len) };
        bytes.iter().all(|&b| b == byte)
    }
}
