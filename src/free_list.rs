//! Best-fit allocation with running statistics.

use core::cell::Cell;
use core::fmt;
use core::ptr::NonNull;

use crate::chunk::{self, ChunkList, Placement, Stats, Validity, CHUNK_ALIGN, MIN_CHUNK_SIZE};
use crate::num::PowerOfTwo;
use crate::resource::{Leftovers, MemoryResource};
use crate::view::View;

/// Byte counters kept by a [`FreeList`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FreeListStats {
    /// Usable bytes under management, free or not.
    pub managed: usize,
    /// Bytes currently handed out, as requested by callers.
    pub in_use: usize,
    /// Bytes ever allocated. Never decreases.
    pub total_allocated: usize,
    /// Bytes ever deallocated. Never decreases.
    pub total_deallocated: usize,
}

/// A chunk allocator that picks the smallest free chunk that fits.
///
/// Chunks and allocation headers are laid out exactly as for
/// [`IntrusiveChainFirstFit`](crate::first_fit::IntrusiveChainFirstFit), but
/// the list is not kept in address order: a freed chunk with no free
/// neighbour becomes the new head. Freed chunks still merge with free
/// neighbours on either side, wherever those sit in the list.
///
/// Not thread-safe on its own.
pub struct FreeList {
    chunks: ChunkList,
    stats: Cell<FreeListStats>,
}

// The allocator owns every chunk it links.
unsafe impl Send for FreeList {}

impl Default for FreeList {
    fn default() -> Self {
        FreeList::new()
    }
}

impl fmt::Display for FreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.stats.get();
        write!(
            f,
            "FreeList(managed: {}, in use: {}, {})",
            s.managed, s.in_use, self.chunks
        )
    }
}

impl FreeList {
    pub const fn new() -> Self {
        FreeList {
            chunks: ChunkList::new(),
            stats: Cell::new(FreeListStats {
                managed: 0,
                in_use: 0,
                total_allocated: 0,
                total_deallocated: 0,
            }),
        }
    }

    pub fn max_alignment() -> usize {
        chunk::MAX_ALIGNMENT
    }

    fn record<F: FnOnce(&mut FreeListStats)>(&self, f: F) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    pub fn allocate(&self, size: usize, align: PowerOfTwo) -> Option<NonNull<u8>> {
        let (prev, chunk, placement) = self
            .chunks
            .best_fit(|c| Placement::plan(c.addr(), c.size(), size, align))?;
        let ptr = unsafe { self.chunks.carve(prev, chunk, placement) };
        self.record(|s| {
            s.in_use += size;
            s.total_allocated += size;
        });
        Some(ptr)
    }

    /// # Safety
    ///
    /// `ptr` must come from `allocate(size, align)` on this allocator and must
    /// not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: PowerOfTwo) {
        let region = chunk::reclaim(ptr, size, align);
        self.chunks.insert_unordered(region);
        self.record(|s| {
            debug_assert!(s.in_use >= size, "deallocating more than was allocated");
            s.in_use -= size;
            s.total_deallocated += size;
        });
    }

    /// Add `region` as a free chunk. Trimming works as for
    /// [`IntrusiveChainFirstFit::utilize`](crate::first_fit::IntrusiveChainFirstFit::utilize).
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

        self.chunks.insert_unordered(usable);
        self.record(|s| s.managed += usable.len());
        Leftovers { before, after }
    }

    /// Forget every free chunk. Cumulative counters are kept.
    pub fn reset(&self) {
        self.chunks.clear();
        self.record(|s| {
            s.managed = 0;
            s.in_use = 0;
        });
    }

    pub fn counters(&self) -> FreeListStats {
        self.stats.get()
    }

    /// Number of free bytes, chunk headers included.
    pub fn free_bytes(&self) -> usize {
        self.stats().1.size
    }

    /// The free chunks, in list order.
    pub fn free_chunks(&self) -> impl Iterator<Item = View<u8>> + '_ {
        self.chunks.iter().map(|(_, c)| c.as_view())
    }

    /// Get statistics on the chunk list, and verify its validity. The list is
    /// unordered, so check [`Validity::is_valid_unordered`].
    pub fn stats(&self) -> (Validity, Stats) {
        self.chunks.stats_unordered()
    }
}

impl MemoryResource for FreeList {
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
            .best_fit(|c| Placement::plan_exact(c.addr(), c.size(), size, align))?;
        let (region, dropped) = unsafe { self.chunks.cut(prev, chunk, offset, size) };
        self.record(|s| s.managed -= size + dropped);
        Some(region)
    }
}
