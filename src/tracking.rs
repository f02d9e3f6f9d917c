//! An allocator decorator collecting usage metrics.
use crate::capability::Capabilities;
use crate::{Allocator, Error};

use core::alloc::Layout;
use core::ptr::NonNull;

/// Usage statistics of an allocator.
///
/// Requested bytes are the sizes reported by [`Allocator::get_layout()`],
/// i.e. the usable size for allocators not recording the requested one.
/// Allocated bytes include the overhead of the allocator and are only tracked
/// for allocators supporting [`Allocator::allocated_layout()`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    /// Bytes currently requested.
    pub requested_bytes: usize,
    /// The maximum of `requested_bytes` so far.
    pub peak_requested_bytes: usize,
    /// Bytes requested in total, never decreasing.
    pub cumulative_requested_bytes: usize,
    /// Bytes currently allocated.
    pub allocated_bytes: usize,
    /// The maximum of `allocated_bytes` so far.
    pub peak_allocated_bytes: usize,
    /// Successful allocations.
    pub num_allocations: usize,
    /// Deallocations.
    pub num_deallocations: usize,
    /// Successful in-place resizes.
    pub num_resizes: usize,
    /// Successful reallocations.
    pub num_reallocations: usize,
    /// Failed allocations, resizes and reallocations.
    pub num_failures: usize,
    /// Bytes asked for by failed requests.
    pub unrequested_bytes: usize,
}
impl Metrics {
    /// All metrics by name.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, usize)> {
        [
            ("requested_bytes", self.requested_bytes),
            ("peak_requested_bytes", self.peak_requested_bytes),
            ("cumulative_requested_bytes", self.cumulative_requested_bytes),
            ("allocated_bytes", self.allocated_bytes),
            ("peak_allocated_bytes", self.peak_allocated_bytes),
            ("num_allocations", self.num_allocations),
            ("num_deallocations", self.num_deallocations),
            ("num_resizes", self.num_resizes),
            ("num_reallocations", self.num_reallocations),
            ("num_failures", self.num_failures),
            ("unrequested_bytes", self.unrequested_bytes),
        ]
        .into_iter()
    }

    /// Write all metrics to the log.
    pub fn dump(&self) {
        log::info!("allocator metrics:");
        for (name, value) in self.iter() {
            log::info!("  {}: {}", name, value);
        }
    }

    fn update_requested(&mut self, old: usize, new: usize) {
        self.requested_bytes = self.requested_bytes.saturating_sub(old) + new;
        self.peak_requested_bytes = self.peak_requested_bytes.max(self.requested_bytes);
        self.cumulative_requested_bytes += new.saturating_sub(old);
    }

    fn update_allocated(&mut self, old: usize, new: usize) {
        self.allocated_bytes = self.allocated_bytes.saturating_sub(old) + new;
        self.peak_allocated_bytes = self.peak_allocated_bytes.max(self.allocated_bytes);
    }

    fn record_failure(&mut self, requested: usize) {
        self.num_failures += 1;
        self.unrequested_bytes += requested;
    }
}

/// The sizes of an allocation as seen by the metrics.
#[derive(Clone, Copy)]
struct Sizes {
    requested: usize,
    allocated: usize,
}

/// Wraps an allocator and records [`Metrics`] for every call.
///
/// All calls are forwarded unchanged.
#[derive(Debug, Default)]
pub struct TrackingAllocator<A> {
    allocator: A,
    metrics: Metrics,
}
impl<A: Allocator> TrackingAllocator<A> {
    /// Start tracking an allocator.
    pub const fn new(allocator: A) -> Self {
        Self {
            allocator,
            metrics: Metrics {
                requested_bytes: 0,
                peak_requested_bytes: 0,
                cumulative_requested_bytes: 0,
                allocated_bytes: 0,
                peak_allocated_bytes: 0,
                num_allocations: 0,
                num_deallocations: 0,
                num_resizes: 0,
                num_reallocations: 0,
                num_failures: 0,
                unrequested_bytes: 0,
            },
        }
    }

    /// The metrics recorded so far.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// The wrapped allocator.
    pub fn inner(&self) -> &A {
        &self.allocator
    }

    /// The wrapped allocator.
    ///
    /// Calls made directly to it are not tracked.
    pub fn inner_mut(&mut self) -> &mut A {
        &mut self.allocator
    }

    /// Stop tracking and return the wrapped allocator.
    pub fn into_inner(self) -> A {
        self.allocator
    }

    fn sizes(&self, ptr: NonNull<u8>) -> Sizes {
        Sizes {
            requested: self.allocator.get_layout(ptr).map_or(0, |layout| layout.size()),
            allocated: self
                .allocator
                .allocated_layout(ptr)
                .map_or(0, |layout| layout.size()),
        }
    }

    fn record_change(&mut self, old: Sizes, new: Sizes) {
        self.metrics.update_requested(old.requested, new.requested);
        self.metrics.update_allocated(old.allocated, new.allocated);
    }
}

impl<A: Allocator> Allocator for TrackingAllocator<A> {
    fn capabilities(&self) -> Capabilities {
        self.allocator.capabilities()
    }

    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let Some(ptr) = self.allocator.allocate(layout) else {
            self.metrics.record_failure(layout.size());
            return None;
        };
        let sizes = self.sizes(ptr);
        self.record_change(Sizes { requested: 0, allocated: 0 }, sizes);
        self.metrics.num_allocations += 1;
        Some(ptr)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let sizes = self.sizes(ptr);
        // SAFETY: forwarded from the caller
        unsafe { self.allocator.deallocate(ptr) };
        self.metrics.requested_bytes = self.metrics.requested_bytes.saturating_sub(sizes.requested);
        self.metrics.allocated_bytes = self.metrics.allocated_bytes.saturating_sub(sizes.allocated);
        self.metrics.num_deallocations += 1;
    }

    unsafe fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> bool {
        let old = self.sizes(ptr);
        // SAFETY: forwarded from the caller
        if !unsafe { self.allocator.resize(ptr, new_size) } {
            self.metrics.record_failure(new_size);
            return false;
        }
        let new = self.sizes(ptr);
        self.record_change(old, new);
        self.metrics.num_resizes += 1;
        true
    }

    unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_layout: Layout,
    ) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.allocate(new_layout);
        };
        let old = self.sizes(ptr);
        // SAFETY: forwarded from the caller
        let Some(new_ptr) = (unsafe { self.allocator.reallocate(Some(ptr), new_layout) }) else {
            self.metrics.record_failure(new_layout.size());
            return None;
        };
        let new = self.sizes(new_ptr);
        self.record_change(old, new);
        self.metrics.num_reallocations += 1;
        Some(new_ptr)
    }

    fn requested_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        self.allocator.requested_layout(ptr)
    }

    fn usable_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        self.allocator.usable_layout(ptr)
    }

    fn allocated_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        self.allocator.allocated_layout(ptr)
    }

    fn get_layout(&self, ptr: NonNull<u8>) -> Result<Layout, Error> {
        self.allocator.get_layout(ptr)
    }

    fn capacity(&self) -> Result<usize, Error> {
        self.allocator.capacity()
    }

    fn query(&self, ptr: NonNull<u8>) -> Result<(), Error> {
        self.allocator.query(ptr)
    }
}
