//! Variable-size first-fit allocation over an address-ordered chunk list.

use core::fmt;
use core::ptr::NonNull;

use crate::chunk::{self, ChunkList, Placement, Stats, Validity, CHUNK_ALIGN, MIN_CHUNK_SIZE};
use crate::num::PowerOfTwo;
use crate::resource::{Leftovers, MemoryResource};
use crate::view::View;

/// A general purpose allocator: any size, any alignment up to
/// [`max_alignment`](Self::max_alignment).
///
/// Free chunks are kept in address order. Allocation takes the first chunk
/// that fits and splits off what it does not need; deallocation puts the
/// chunk back in order and merges it with free neighbours on both sides.
/// Both are O(n) in the number of free chunks.
///
/// Not thread-safe on its own; see
/// [`AtomicResource`](crate::decorators::AtomicResource).
pub struct IntrusiveChainFirstFit {
    chunks: ChunkList,
}

// The allocator owns every chunk it links.
unsafe impl Send for IntrusiveChainFirstFit {}

impl Default for IntrusiveChainFirstFit {
    fn default() -> Self {
        IntrusiveChainFirstFit::new()
    }
}

impl fmt::Display for IntrusiveChainFirstFit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IntrusiveChainFirstFit({})", self.chunks)
    }
}

impl IntrusiveChainFirstFit {
    /// An allocator with no memory; give it some with
    /// [`utilize`](Self::utilize).
    pub const fn new() -> Self {
        IntrusiveChainFirstFit {
            chunks: ChunkList::new(),
        }
    }

    /// # Safety
    ///
    /// See [`utilize`](Self::utilize).
    pub unsafe fn with_region(region: View<u8>) -> Self {
        let allocator = IntrusiveChainFirstFit::new();
        allocator.utilize(region);
        allocator
    }

    pub fn max_alignment() -> usize {
        chunk::MAX_ALIGNMENT
    }

    pub fn allocate(&self, size: usize, align: PowerOfTwo) -> Option<NonNull<u8>> {
        let (prev, chunk, placement) = self
            .chunks
            .first_fit(|c| Placement::plan(c.addr(), c.size(), size, align))?;
        Some(unsafe { self.chunks.carve(prev, chunk, placement) })
    }

    /// # Safety
    ///
    /// `ptr` must come from `allocate(size, align)` on this allocator and must
    /// not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: PowerOfTwo) {
        let region = chunk::reclaim(ptr, size, align);
        self.chunks.insert_ordered(region);
    }

    /// Add `region` as a free chunk.
    ///
    /// Both ends are trimmed to the chunk alignment; a region too small to
    /// hold a chunk is returned whole.
    ///
    /// # Safety
    ///
    /// See [`MemoryResource::utilize_bytes`]. The region must not overlap
    /// memory this allocator already manages.
    pub unsafe fn utilize(&self, region: View<u8>) -> Leftovers {
        let (before, aligned) = match region.align_to(CHUNK_ALIGN) {
            Some(parts) => parts,
            None => return Leftovers::all(region),
        };
        let usable = CHUNK_ALIGN.align_down(aligned.len());
        if usable < MIN_CHUNK_SIZE {
            return Leftovers::all(region);
        }
        let (usable, after) = match aligned.split_at(usable) {
            Some(parts) => parts,
            None => return Leftovers::all(region),
        };

        self.chunks.insert_ordered(usable);
        Leftovers { before, after }
    }

    /// Forget every free chunk.
    pub fn reset(&self) {
        self.chunks.clear();
    }

    /// Number of free bytes, chunk headers included.
    pub fn free_bytes(&self) -> usize {
        self.stats().1.size
    }

    /// The free chunks, in address order.
    pub fn free_chunks(&self) -> impl Iterator<Item = View<u8>> + '_ {
        self.chunks.iter().map(|(_, c)| c.as_view())
    }

    /// Get statistics on this allocator, and verify validity of the chunk list.
    pub fn stats(&self) -> (Validity, Stats) {
        self.chunks.stats()
    }
}

impl MemoryResource for IntrusiveChainFirstFit {
    fn allocate_bytes(&self, size: usize, align: PowerOfTwo) -> Option<NonNull<u8>> {
        self.allocate(size, align)
    }

    unsafe fn deallocate_bytes(&self, ptr: NonNull<u8>, size: usize, align: PowerOfTwo) {
        self.deallocate(ptr, size, align)
    }

    unsafe fn utilize_bytes(&self, region: View<u8>) {
        // Fragments too small for a chunk are lost.
        self.utilize(region);
    }

    fn yield_bytes(&self, size: usize, align: PowerOfTwo) -> Option<View<u8>> {
        let (prev, chunk, offset) = self
            .chunks
            .first_fit(|c| Placement::plan_exact(c.addr(), c.size(), size, align))?;
        let (region, _dropped) = unsafe { self.chunks.cut(prev, chunk, offset, size) };
        Some(region)
    }
}
