//! The interface shared by every allocator of this crate.
use crate::capability::{Capabilities, Capability};
use crate::Error;

use core::alloc::Layout;
use core::ptr::{self, NonNull};

/// A memory allocator.
///
/// Allocation failures are ordinary return values: `None` for a failed
/// allocation or `false` for a failed resize. The allocator state is left
/// unchanged in that case.
///
/// Besides the required methods, an allocator might support a set of optional
/// queries. Which ones are supported is reported by
/// [`capabilities()`](Self::capabilities); the default implementations return
/// [`Error::Unimplemented`].
///
/// The trait is object safe, so allocators can be used as
/// `&mut dyn Allocator`.
pub trait Allocator {
    /// The optional queries this allocator supports.
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    /// Check whether the allocator supports a given capability.
    fn has(&self, capability: Capability) -> bool {
        self.capabilities().has(capability)
    }

    /// Allocate memory for the given layout.
    ///
    /// Returns `None` if the request cannot be satisfied or if the requested
    /// size is zero.
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>>;

    /// Release memory previously allocated by this allocator.
    ///
    /// # Safety
    /// The pointer must have been returned by this allocator and must not
    /// have been released before.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>);

    /// Change the size of an allocation without moving it.
    ///
    /// Returns `false` and leaves the allocation unchanged, if that is not
    /// possible. The default implementation never resizes.
    ///
    /// # Safety
    /// The pointer must be a live allocation of this allocator.
    unsafe fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> bool {
        let _ = (ptr, new_size);
        false
    }

    /// Change the layout of an allocation, moving it if necessary.
    ///
    /// A `None` pointer is a fresh allocation. Otherwise the allocation is
    /// resized in place if possible. If not, a new allocation is made, the
    /// contents are copied and the old allocation is released. If that fails,
    /// `None` is returned and the old allocation stays untouched.
    ///
    /// Moving an allocation requires the allocator to know its size, i.e. to
    /// support [`Capability::UsableLayout`] or [`Capability::RequestedLayout`].
    ///
    /// # Safety
    /// A given pointer must be a live allocation of this allocator. It must
    /// not be used anymore if a different pointer is returned.
    unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_layout: Layout,
    ) -> Option<NonNull<u8>> {
        let ptr = match ptr {
            Some(ptr) => ptr,
            None => return self.allocate(new_layout),
        };
        let aligned = ptr.as_ptr() as usize % new_layout.align() == 0;
        // SAFETY: forwarded from the caller
        if aligned && unsafe { self.resize(ptr, new_layout.size()) } {
            return Some(ptr);
        }

        let old_size = self
            .usable_layout(ptr)
            .or_else(|_| self.get_layout(ptr))
            .ok()?
            .size();
        let new_ptr = self.allocate(new_layout)?;
        // SAFETY: both allocations are live and distinct, and each of them is
        // at least as large as the number of bytes copied.
        unsafe {
            ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                new_ptr.as_ptr(),
                old_size.min(new_layout.size()),
            );
            self.deallocate(ptr);
        }
        Some(new_ptr)
    }

    /// The layout originally requested for an allocation.
    ///
    /// # Errors
    /// [`Error::Unimplemented`] unless [`Capability::RequestedLayout`] is
    /// supported, [`Error::NotFound`] for unknown pointers.
    fn requested_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        let _ = ptr;
        Err(Error::Unimplemented)
    }

    /// The layout actually usable by the caller of an allocation.
    ///
    /// # Errors
    /// [`Error::Unimplemented`] unless [`Capability::UsableLayout`] is
    /// supported, [`Error::NotFound`] for unknown pointers.
    fn usable_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        let _ = ptr;
        Err(Error::Unimplemented)
    }

    /// The layout of an allocation including the allocator's own overhead.
    ///
    /// # Errors
    /// [`Error::Unimplemented`] unless [`Capability::AllocatedLayout`] is
    /// supported, [`Error::NotFound`] for unknown pointers.
    fn allocated_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        let _ = ptr;
        Err(Error::Unimplemented)
    }

    /// The layout of an allocation: its size is at least the requested one
    /// and its alignment is the requested one.
    ///
    /// Uses the requested layout if known and the usable layout otherwise.
    ///
    /// # Errors
    /// [`Error::NotFound`] for unknown pointers.
    fn get_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        match self.requested_layout(ptr) {
            Err(Error::Unimplemented) => self.usable_layout(ptr),
            result => result,
        }
    }

    /// The total number of bytes managed by this allocator.
    ///
    /// # Errors
    /// [`Error::Unimplemented`] unless [`Capability::Capacity`] is supported.
    fn capacity(&self) -> Result<usize, Error> {
        Err(Error::Unimplemented)
    }

    /// Check whether the pointer belongs to this allocator.
    ///
    /// # Errors
    /// [`Error::OutOfRange`] if the pointer does not belong to this allocator
    /// or [`Error::Unimplemented`] unless [`Capability::Recognizes`] is
    /// supported.
    fn query(&self, ptr: NonNull<u8>) -> Result<(), Error> {
        let _ = ptr;
        Err(Error::Unimplemented)
    }

    /// Shorthand for a successful [`query()`](Self::query).
    fn recognizes(&self, ptr: NonNull<u8>) -> bool {
        self.query(ptr).is_ok()
    }

    /// Allocate memory for a `T` and move the value into it.
    ///
    /// Returns `None` (dropping the value) if the allocation failed.
    fn new_object<T>(&mut self, value: T) -> Option<NonNull<T>>
    where
        Self: Sized,
    {
        let layout = Layout::new::<T>();
        let layout = Layout::from_size_align(layout.size().max(1), layout.align()).ok()?;
        let ptr = self.allocate(layout)?.cast::<T>();
        // SAFETY: the memory is freshly allocated for the layout of `T`.
        unsafe { ptr.as_ptr().write(value) };
        Some(ptr)
    }

    /// Drop an object created by [`new_object()`](Self::new_object) and
    /// release its memory.
    ///
    /// # Safety
    /// The pointer must have been returned by `new_object()` of this allocator
    /// and must not have been deleted before.
    unsafe fn delete_object<T>(&mut self, ptr: NonNull<T>)
    where
        Self: Sized,
    {
        // SAFETY: forwarded from the caller
        unsafe {
            ptr::drop_in_place(ptr.as_ptr());
            self.deallocate(ptr.cast());
        }
    }
}

impl<A: Allocator + ?Sized> Allocator for &mut A {
    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        unsafe { (**self).deallocate(ptr) }
    }

    unsafe fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> bool {
        unsafe { (**self).resize(ptr, new_size) }
    }

    unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_layout: Layout,
    ) -> Option<NonNull<u8>> {
        unsafe { (**self).reallocate(ptr, new_layout) }
    }

    fn requested_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        (**self).requested_layout(ptr)
    }

    fn usable_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        (**self).usable_layout(ptr)
    }

    fn allocated_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        (**self).allocated_layout(ptr)
    }

    fn get_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        (**self).get_layout(ptr)
    }

    fn capacity(&self) -> Result<usize, Error> {
        (**self).capacity()
    }

    fn query(&self, ptr: NonNull<u8>) -> Result<(), Error> {
        (**self).query(ptr)
    }
}
