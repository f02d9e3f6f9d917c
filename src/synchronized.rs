//! An allocator decorator serializing all calls with a lock.
//!
//! This is also the bridge to the [`GlobalAlloc`]-trait: any allocator of
//! this crate can become the global allocator of a `#![no_std]` binary once
//! it is wrapped into a [`SynchronizedAllocator`] with a thread-safe lock.
use crate::capability::Capabilities;
use crate::{Allocator, Error};

use core::alloc::{GlobalAlloc, Layout};
use core::cell::Cell;
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};
use lock_api::{GuardNoSend, Mutex, MutexGuard, RawMutex};

/// A lock for single-threaded use.
///
/// It does not synchronize anything, but detects re-entrant calls (e.g. from
/// an interrupt handler interrupting an allocation) and panics on them. It is
/// not `Sync`, so an allocator using it cannot be shared between threads.
#[derive(Debug)]
pub struct NoLock {
    locked: Cell<bool>,
}
// SAFETY: the lock cannot be shared between threads (it is not `Sync`) and
// taking it twice panics.
unsafe impl RawMutex for NoLock {
    #[allow(clippy::declare_interior_mutable_const)] // used as initializer only
    const INIT: Self = Self {
        locked: Cell::new(false),
    };

    type GuardMarker = GuardNoSend;

    fn lock(&self) {
        assert!(self.try_lock(), "re-entrant call into a single-threaded allocator");
    }

    fn try_lock(&self) -> bool {
        !self.locked.replace(true)
    }

    unsafe fn unlock(&self) {
        self.locked.set(false);
    }

    fn is_locked(&self) -> bool {
        self.locked.get()
    }
}

/// A spinning lock usable without an operating system.
pub type SpinLock = spin::Mutex<()>;

/// Wraps an allocator and takes a lock for the duration of every call.
///
/// The allocator is used through a shared reference: [`Allocator`] is
/// implemented for `&SynchronizedAllocator`. With a thread-safe lock like
/// [`SpinLock`], the allocator can serve as the global allocator:
/// ```
/// use blockalloc::{Buffer, FirstFitAllocator, SpinLock, SynchronizedAllocator};
/// use core::ptr::addr_of_mut;
///
/// static mut HEAP: Buffer<4096> = Buffer::new();
///
/// // #[global_allocator]
/// static ALLOCATOR: SynchronizedAllocator<FirstFitAllocator<'static>, SpinLock> =
///     SynchronizedAllocator::new(FirstFitAllocator::new());
///
/// // SAFETY: the heap is only ever borrowed here
/// let heap = unsafe { &mut *addr_of_mut!(HEAP) };
/// ALLOCATOR.lock().init(heap.region()).unwrap();
/// ```
pub struct SynchronizedAllocator<A, R: RawMutex = NoLock> {
    allocator: Mutex<R, A>,
}
impl<A: Allocator, R: RawMutex> SynchronizedAllocator<A, R> {
    /// Wrap an allocator.
    ///
    /// This function is a `const fn`, therefore the allocator can be placed in
    /// a `static`.
    pub const fn new(allocator: A) -> Self {
        Self {
            allocator: Mutex::const_new(R::INIT, allocator),
        }
    }

    /// Take the lock and access the wrapped allocator, e.g. to initialize it.
    pub fn lock(&self) -> MutexGuard<'_, R, A> {
        self.allocator.lock()
    }

    /// Return the wrapped allocator.
    pub fn into_inner(self) -> A {
        self.allocator.into_inner()
    }

    /// Allocate and initialize an object, which is freed again when the
    /// returned pointer is dropped.
    ///
    /// Returns `None` (dropping the value) if the allocation failed.
    pub fn make_unique<T>(&self, value: T) -> Option<UniquePtr<'_, T, A, R>> {
        let mut allocator = self;
        let ptr = allocator.new_object(value)?;
        Some(UniquePtr {
            ptr,
            allocator: self,
        })
    }
}

impl<A: Allocator, R: RawMutex> Allocator for &SynchronizedAllocator<A, R> {
    fn capabilities(&self) -> Capabilities {
        self.lock().capabilities()
    }

    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        self.lock().allocate(layout)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        // SAFETY: forwarded from the caller
        unsafe { self.lock().deallocate(ptr) }
    }

    unsafe fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> bool {
        // SAFETY: forwarded from the caller
        unsafe { self.lock().resize(ptr, new_size) }
    }

    unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_layout: Layout,
    ) -> Option<NonNull<u8>> {
        // SAFETY: forwarded from the caller
        unsafe { self.lock().reallocate(ptr, new_layout) }
    }

    fn requested_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        self.lock().requested_layout(ptr)
    }

    fn usable_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        self.lock().usable_layout(ptr)
    }

    fn allocated_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        self.lock().allocated_layout(ptr)
    }

    fn get_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        self.lock().get_layout(ptr)
    }

    fn capacity(&self) -> Result<usize, Error> {
        self.lock().capacity()
    }

    fn query(&self, ptr: NonNull<u8>) -> Result<(), Error> {
        self.lock().query(ptr)
    }
}

unsafe impl<A: Allocator, R: RawMutex> GlobalAlloc for SynchronizedAllocator<A, R> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.lock()
            .allocate(layout)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // SAFETY: the caller passes a pointer returned by `alloc()`
            unsafe { self.lock().deallocate(ptr) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return ptr::null_mut();
        };
        // SAFETY: the caller passes a pointer returned by `alloc()`
        unsafe { self.lock().reallocate(NonNull::new(ptr), new_layout) }
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}

/// An owning pointer to an object allocated by a [`SynchronizedAllocator`].
///
/// The object is dropped and its memory freed when the pointer is dropped.
pub struct UniquePtr<'s, T, A: Allocator, R: RawMutex> {
    ptr: NonNull<T>,
    allocator: &'s SynchronizedAllocator<A, R>,
}
impl<T, A: Allocator, R: RawMutex> UniquePtr<'_, T, A, R> {
    /// The address of the object.
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }
}
impl<T, A: Allocator, R: RawMutex> Deref for UniquePtr<'_, T, A, R> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the object is initialized and owned by this pointer
        unsafe { self.ptr.as_ref() }
    }
}
impl<T, A: Allocator, R: RawMutex> DerefMut for UniquePtr<'_, T, A, R> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the object is initialized and owned by this pointer
        unsafe { self.ptr.as_mut() }
    }
}
impl<T, A: Allocator, R: RawMutex> Drop for UniquePtr<'_, T, A, R> {
    fn drop(&mut self) {
        let mut allocator = self.allocator;
        // SAFETY: the object was created by `new_object()` of this allocator
        // and is deleted exactly once.
        unsafe { allocator.delete_object(self.ptr) };
    }
}
