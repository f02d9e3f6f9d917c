//! Intrusive free lists of memory chunks.
//!
//! A [`Bucket`] does not own any memory. The chunks it tracks are free memory
//! of a [`Region`] and the list links are stored inside the chunks themselves:
//! every chunk starts with the offsets of its predecessor and successor in
//! the list. A chunk therefore has to be at least [`CHUNK_LINK_SIZE`] bytes.
use crate::region::Region;

use core::mem;

/// The number of bytes a chunk needs to hold its list links.
pub const CHUNK_LINK_SIZE: usize = 2 * mem::size_of::<usize>();

/// Marks the end of the list.
const NONE: usize = usize::MAX;

/// A doubly-linked list of free chunks of at most a given size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    chunk_size: usize,
    head: Option<usize>,
}
impl Bucket {
    /// Create an empty bucket for chunks of up to `chunk_size` bytes.
    pub const fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            head: None,
        }
    }

    /// Create an empty bucket for chunks of any size.
    pub const fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// The maximum size of the chunks in this bucket.
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Whether there are no chunks in this bucket.
    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn links(region: &Region<'_>, chunk: usize) -> [usize; 2] {
        // SAFETY: only chunks of this list are read and each of them got its
        // links written when it was added.
        unsafe { region.read::<[usize; 2]>(chunk).assume_init() }
    }

    fn set_prev(region: &mut Region<'_>, chunk: usize, prev: usize) {
        let [_, next] = Self::links(region, chunk);
        region.write(chunk, [prev, next]);
    }

    fn set_next(region: &mut Region<'_>, chunk: usize, next: usize) {
        let [prev, _] = Self::links(region, chunk);
        region.write(chunk, [prev, next]);
    }

    /// Add the chunk at the given region offset to the front of the list.
    pub(crate) fn add(&mut self, region: &mut Region<'_>, chunk: usize) {
        let next = self.head.unwrap_or(NONE);
        region.write(chunk, [NONE, next]);
        if next != NONE {
            Self::set_prev(region, next, chunk);
        }
        self.head = Some(chunk);
    }

    /// Unlink a chunk, which has to be part of this list.
    pub(crate) fn remove(&mut self, region: &mut Region<'_>, chunk: usize) {
        let [prev, next] = Self::links(region, chunk);
        if prev == NONE {
            debug_assert_eq!(self.head, Some(chunk), "chunk is not part of this bucket");
            self.head = (next != NONE).then_some(next);
        } else {
            Self::set_next(region, prev, next);
        }
        if next != NONE {
            Self::set_prev(region, next, prev);
        }
    }

    /// Remove and return the first chunk.
    pub(crate) fn remove_first(&mut self, region: &mut Region<'_>) -> Option<usize> {
        let chunk = self.head?;
        self.remove(region, chunk);
        Some(chunk)
    }

    /// Remove and return the first chunk matching the predicate.
    pub(crate) fn remove_if(
        &mut self,
        region: &mut Region<'_>,
        mut predicate: impl FnMut(usize) -> bool,
    ) -> Option<usize> {
        let chunk = self.iter(region).find(|&chunk| predicate(chunk))?;
        self.remove(region, chunk);
        Some(chunk)
    }

    /// Whether the chunk at the given offset is part of this list.
    pub(crate) fn contains(&self, region: &Region<'_>, chunk: usize) -> bool {
        self.iter(region).any(|c| c == chunk)
    }

    /// The number of chunks in this bucket.
    pub fn count(&self, region: &Region<'_>) -> usize {
        self.iter(region).count()
    }

    /// Iterate over the region offsets of all chunks.
    pub(crate) fn iter<'r>(&self, region: &'r Region<'r>) -> Chunks<'r> {
        Chunks {
            region,
            next: self.head.unwrap_or(NONE),
        }
    }
}

/// Iterator over the chunks of a [`Bucket`].
pub(crate) struct Chunks<'r> {
    region: &'r Region<'r>,
    next: usize,
}
impl Iterator for Chunks<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.next == NONE {
            return None;
        }
        let chunk = self.next;
        self.next = Bucket::links(self.region, chunk)[1];
        Some(chunk)
    }
}
