//! Free chunks and the intrusive list that links them.
//!
//! A free chunk starts with a [`Chunk`] header holding its size (including
//! the header) and a link to the next free chunk. Chunk starts and sizes are
//! always multiples of [`CHUNK_ALIGN`], and no chunk is smaller than
//! [`MIN_CHUNK_SIZE`], so a header always fits.
//!
//! When a chunk (or the front of one) is handed out, a two-byte [`BitHeader`]
//! is written just before the user's pointer:
//!
//! ```text
//!  chunk start                  user ptr            user end      consumed end
//!  |<------ bytes_before ------>|<------ size ------>|<- bytes_after ->|
//!  |  padding ...  | BitHeader  |      payload       |    slack        | next free chunk?
//! ```
//!
//! `deallocate` rebuilds the chunk from the user pointer, `size` and the
//! header, which is why callers must pass back the size they asked for.

use core::cell::Cell;
use core::fmt;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::node::NodeRef;
use crate::num::PowerOfTwo;
use crate::view::View;

/// Header of a free chunk, stored at the chunk's first byte.
#[derive(Copy, Clone)]
#[repr(C)]
pub(crate) struct Chunk {
    size: usize,
    next: Option<ChunkRef>,
}

pub(crate) type ChunkRef = NodeRef<Chunk>;

/// Padding record written immediately before every allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct BitHeader {
    /// Distance from the chunk start to the user pointer. Includes the header.
    pub bytes_before: u8,
    /// Distance from the end of the user region to the end of the bytes the
    /// allocation consumed.
    pub bytes_after: u8,
}

/// Alignment of every chunk start and size.
pub const CHUNK_ALIGN: PowerOfTwo = PowerOfTwo::of::<Chunk>();
/// Smallest chunk that can be tracked on its own.
pub const MIN_CHUNK_SIZE: usize = core::mem::size_of::<Chunk>();
pub const BIT_HEADER_SIZE: usize = core::mem::size_of::<BitHeader>();
/// Largest alignment a chunk allocator accepts; `bytes_before` is one byte.
pub const MAX_ALIGNMENT: usize = u8::MAX as usize;

const_assert!(MIN_CHUNK_SIZE % CHUNK_ALIGN.get() == 0);
const_assert!(BIT_HEADER_SIZE < MIN_CHUNK_SIZE);
const_assert!(core::mem::align_of::<BitHeader>() == 1);
// Worst case `bytes_before` is the header plus a full alignment step.
const_assert!(BIT_HEADER_SIZE + (MAX_ALIGNMENT + 1) / 2 - 1 <= u8::MAX as usize);

impl NodeRef<Chunk> {
    pub(crate) fn size(self) -> usize {
        unsafe { self.load().size }
    }

    pub(crate) fn next(self) -> Option<ChunkRef> {
        unsafe { self.load().next }
    }

    pub(crate) fn end_addr(self) -> usize {
        self.addr() + self.size()
    }

    pub(crate) fn as_view(self) -> View<u8> {
        unsafe { View::from_raw_parts(self.as_non_null(), self.size()) }
    }

    unsafe fn set_size(self, size: usize) {
        self.update(|c| c.size = size)
    }

    unsafe fn set_next(self, next: Option<ChunkRef>) {
        self.update(|c| c.next = next)
    }
}

/// How two address ranges are ordered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

impl Relation {
    /// How `a` relates to `b`.
    pub fn of(a: &View<u8>, b: &View<u8>) -> Relation {
        if a.end_addr() < b.addr() {
            Relation::Before
        } else if a.end_addr() == b.addr() {
            Relation::AdjacentBefore
        } else if a.addr() < b.end_addr() {
            Relation::Overlapping
        } else if a.addr() == b.end_addr() {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }
}

/// Where an allocation goes inside a free chunk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    /// Offset of the user pointer from the chunk start.
    pub before: usize,
    /// Bytes from the end of the user region to the end of `consumed`.
    pub after: usize,
    /// Bytes of the chunk, counted from its start, that the allocation takes.
    /// Whatever is left is large enough to be a chunk of its own.
    pub consumed: usize,
}

impl Placement {
    /// Plan an allocation of `size` bytes at `align` inside the free chunk
    /// `chunk_addr..chunk_addr + chunk_size`.
    ///
    /// The user pointer is the first `align`-aligned address that leaves room
    /// for a [`BitHeader`]. A tail too short to hold a chunk header is
    /// absorbed into the allocation's `bytes_after`.
    pub fn plan(
        chunk_addr: usize,
        chunk_size: usize,
        size: usize,
        align: PowerOfTwo,
    ) -> Option<Placement> {
        if align.get() > MAX_ALIGNMENT {
            return None;
        }
        let user = align.align_up(chunk_addr.checked_add(BIT_HEADER_SIZE)?)?;
        let user_end = user.checked_add(size)?;
        let chunk_end = chunk_addr + chunk_size;
        if user_end > chunk_end {
            return None;
        }

        let used_end = core::cmp::max(
            CHUNK_ALIGN.align_up(user_end)?,
            chunk_addr + MIN_CHUNK_SIZE,
        );
        let consumed = if chunk_end - used_end >= MIN_CHUNK_SIZE {
            used_end - chunk_addr
        } else {
            chunk_size
        };

        Some(Placement {
            before: user - chunk_addr,
            after: chunk_addr + consumed - user_end,
            consumed,
        })
    }

    pub fn header(&self) -> BitHeader {
        debug_assert!(self.before <= u8::MAX as usize && self.after <= u8::MAX as usize);
        BitHeader {
            bytes_before: self.before as u8,
            bytes_after: self.after as u8,
        }
    }

    /// Plan a yield of exactly `size` bytes at `align`.
    ///
    /// Returns the offset of the yielded region. No header is written, so the
    /// region may start at the chunk start; otherwise the bytes in front must
    /// form a chunk of their own.
    pub fn plan_exact(
        chunk_addr: usize,
        chunk_size: usize,
        size: usize,
        align: PowerOfTwo,
    ) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let mut start = align.align_up(chunk_addr)?;
        if start != chunk_addr && start - chunk_addr < MIN_CHUNK_SIZE {
            start = align.align_up(chunk_addr + MIN_CHUNK_SIZE)?;
        }
        if start.checked_add(size)? > chunk_addr + chunk_size {
            return None;
        }
        Some(start - chunk_addr)
    }
}

/// Rebuild the chunk an allocation was carved from.
///
/// # Safety
///
/// `ptr` must be a live allocation of `size` bytes from a chunk list.
pub(crate) unsafe fn reclaim(ptr: NonNull<u8>, size: usize, align: PowerOfTwo) -> View<u8> {
    debug_assert!(align.is_aligned(ptr.as_ptr() as usize), "pointer does not match its alignment");
    let header_at = NonNull::new_unchecked(ptr.as_ptr().sub(BIT_HEADER_SIZE));
    let header_ref = NodeRef::<BitHeader>::from_addr(header_at);
    let header = header_ref.load();
    header_ref.release();

    let before = header.bytes_before as usize;
    let start = NonNull::new_unchecked(ptr.as_ptr().sub(before));
    let chunk_size = before + size + header.bytes_after as usize;
    debug_assert!(
        CHUNK_ALIGN.is_aligned(start.as_ptr() as usize)
            && CHUNK_ALIGN.is_aligned(chunk_size)
            && chunk_size >= MIN_CHUNK_SIZE,
        "corrupt allocation header, or size does not match the allocation"
    );
    View::from_raw_parts(start, chunk_size)
}

/// Validity contains a representation of all invalid states found in a
/// chunk list.
#[derive(Default, Debug)]
pub struct Validity {
    /// Number of chunks overlapping other chunks.
    ///
    /// This likely indicates corruption.
    pub overlaps: usize,
    /// Number of chunks that are directly adjacent to each other, and not
    /// merged.
    pub adjacents: usize,
    /// Number of chunks that do not have an address less than their next.
    pub out_of_orders: usize,
}

impl Validity {
    /// True if no problem of any kind was found.
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0 && self.adjacents == 0 && self.out_of_orders == 0
    }

    /// As `is_valid`, for lists that are not kept in address order.
    pub fn is_valid_unordered(&self) -> bool {
        self.overlaps == 0 && self.adjacents == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, PartialEq, Eq)]
pub struct Stats {
    /// Number of free chunks.
    pub length: usize,
    /// Free bytes, headers included.
    pub size: usize,
}

/// An intrusive singly linked list of free chunks.
///
/// Each chunk is owned by the list while linked; it may be split or merged
/// internally. Whether the list is kept in address order is up to the
/// allocator using it: [`insert_ordered`](Self::insert_ordered) preserves
/// order, [`insert_unordered`](Self::insert_unordered) does not.
pub(crate) struct ChunkList {
    head: Cell<Option<ChunkRef>>,
}

pub(crate) struct ChunkIter {
    prev: Option<ChunkRef>,
    next: Option<ChunkRef>,
}

impl Iterator for ChunkIter {
    /// A chunk and the chunk linking to it.
    type Item = (Option<ChunkRef>, ChunkRef);

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = current.next();
        let prev = self.prev.replace(current);
        Some((prev, current))
    }
}

impl fmt::Display for ChunkList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkList(")?;
        let mut start = true;
        for (_, chunk) in self.iter() {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "Chunk({:?}, {})", chunk, chunk.size())?;
        }

        write!(f, ")")
    }
}

impl ChunkList {
    pub const fn new() -> ChunkList {
        ChunkList {
            head: Cell::new(None),
        }
    }

    pub fn iter(&self) -> ChunkIter {
        ChunkIter {
            prev: None,
            next: self.head.get(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.get().is_none()
    }

    /// Forget every chunk. The memory is not touched.
    pub fn clear(&self) {
        self.head.set(None);
    }

    /// Point `prev` (or the head, if `None`) at `next`.
    unsafe fn link(&self, prev: Option<ChunkRef>, next: Option<ChunkRef>) {
        match prev {
            Some(p) => p.set_next(next),
            None => self.head.set(next),
        }
    }

    /// First chunk, in list order, for which `plan` succeeds.
    pub fn first_fit<P, F>(&self, mut plan: F) -> Option<(Option<ChunkRef>, ChunkRef, P)>
    where
        F: FnMut(ChunkRef) -> Option<P>,
    {
        self.iter()
            .find_map(|(prev, chunk)| plan(chunk).map(|p| (prev, chunk, p)))
    }

    /// Smallest chunk for which `plan` succeeds; the first one found wins a
    /// tie.
    pub fn best_fit<P, F>(&self, mut plan: F) -> Option<(Option<ChunkRef>, ChunkRef, P)>
    where
        F: FnMut(ChunkRef) -> Option<P>,
    {
        let mut best: Option<(Option<ChunkRef>, ChunkRef, P)> = None;
        for (prev, chunk) in self.iter() {
            if let Some((_, b, _)) = &best {
                if chunk.size() >= b.size() {
                    continue;
                }
            }
            if let Some(p) = plan(chunk) {
                best = Some((prev, chunk, p));
            }
        }
        best
    }

    /// Write a chunk header at `at` and make it the head of the list.
    ///
    /// # Safety
    ///
    /// `at..at + size` must be free memory owned by the list from now on.
    pub unsafe fn push_front(&self, at: NonNull<u8>, size: usize) -> ChunkRef {
        let chunk = NodeRef::place(
            at,
            Chunk {
                size,
                next: self.head.get(),
            },
        );
        self.head.set(Some(chunk));
        chunk
    }

    /// Insert `region` in address order, merging it with the chunks just
    /// before and after it when they touch.
    ///
    /// # Safety
    ///
    /// The list must be in address order; `region` must be free memory owned
    /// by the list from now on, aligned and sized per the module invariants,
    /// and must not overlap any chunk already in the list.
    pub unsafe fn insert_ordered(&self, region: View<u8>) -> ChunkRef {
        let mut prev: Option<ChunkRef> = None;
        let mut next = self.head.get();
        while let Some(n) = next {
            if n.addr() > region.addr() {
                break;
            }
            prev = Some(n);
            next = n.next();
        }

        debug_assert!(
            prev.map_or(true, |p| p.end_addr() <= region.addr())
                && next.map_or(true, |n| region.end_addr() <= n.addr()),
            "Overlapping memory chunks"
        );

        let merged = match prev {
            Some(p) if p.end_addr() == region.addr() => {
                p.set_size(p.size() + region.len());
                p
            }
            _ => {
                let chunk = NodeRef::place(
                    region.as_non_null(),
                    Chunk {
                        size: region.len(),
                        next,
                    },
                );
                self.link(prev, Some(chunk));
                chunk
            }
        };

        if let Some(n) = next {
            if merged.end_addr() == n.addr() {
                merged.update(|c| {
                    c.size += n.size();
                    c.next = n.next();
                });
                n.release();
            }
        }

        merged
    }

    /// Give `region` back to an unordered list. A chunk ending where `region`
    /// starts absorbs it; a chunk starting where it ends is absorbed into it.
    /// Without a neighbour the region becomes the new head.
    ///
    /// # Safety
    ///
    /// As [`insert_ordered`](Self::insert_ordered), without the ordering
    /// requirement.
    pub unsafe fn insert_unordered(&self, region: View<u8>) -> ChunkRef {
        let mut size = region.len();

        let following = self.iter().find(|(_, c)| c.addr() == region.end_addr());
        if let Some((prev, chunk)) = following {
            self.link(prev, chunk.next());
            size += chunk.size();
            chunk.release();
        }

        let preceding = self.iter().find(|(_, c)| c.end_addr() == region.addr());
        if let Some((_, chunk)) = preceding {
            chunk.set_size(chunk.size() + size);
            return chunk;
        }

        self.push_front(region.as_non_null(), size)
    }

    /// Hand out the front of `chunk` according to `placement` and return the
    /// user pointer. Any remainder takes the chunk's place in the list.
    ///
    /// # Safety
    ///
    /// `prev` must link to `chunk`, and `placement` must have been planned
    /// for it.
    pub unsafe fn carve(
        &self,
        prev: Option<ChunkRef>,
        chunk: ChunkRef,
        placement: Placement,
    ) -> NonNull<u8> {
        let size = chunk.size();
        let next = chunk.next();

        let replacement = if placement.consumed < size {
            Some(NodeRef::place(
                chunk.byte_add(placement.consumed),
                Chunk {
                    size: size - placement.consumed,
                    next,
                },
            ))
        } else {
            next
        };
        self.link(prev, replacement);
        chunk.release();

        let user = chunk.byte_add(placement.before);
        NodeRef::place(
            NonNull::new_unchecked(user.as_ptr().sub(BIT_HEADER_SIZE)),
            placement.header(),
        );
        user
    }

    /// Cut `size` bytes at `offset` out of `chunk` for good. The pieces in
    /// front and behind stay free if they can hold a chunk header; smaller
    /// pieces are dropped.
    ///
    /// Returns the cut region and the number of bytes dropped.
    ///
    /// # Safety
    ///
    /// `prev` must link to `chunk`, and `offset` must come from
    /// [`Placement::plan_exact`] for it.
    pub unsafe fn cut(
        &self,
        prev: Option<ChunkRef>,
        chunk: ChunkRef,
        offset: usize,
        size: usize,
    ) -> (View<u8>, usize) {
        let chunk_size = chunk.size();
        let next = chunk.next();
        if offset < MIN_CHUNK_SIZE {
            // The header goes before a tail chunk can be placed over it.
            debug_assert_eq!(offset, 0);
            chunk.release();
        }

        // `chunk_size` is a multiple of CHUNK_ALIGN, so this never passes it.
        let tail_start = CHUNK_ALIGN
            .align_up(offset + size)
            .map_or(chunk_size, |t| t.min(chunk_size));
        let tail = chunk_size - tail_start;
        let after = if tail >= MIN_CHUNK_SIZE {
            Some(NodeRef::place(
                chunk.byte_add(tail_start),
                Chunk { size: tail, next },
            ))
        } else {
            next
        };

        let cut = View::from_raw_parts(chunk.byte_add(offset), size);
        let mut dropped = tail_start - (offset + size);
        if tail < MIN_CHUNK_SIZE {
            dropped += tail;
        }

        if offset >= MIN_CHUNK_SIZE {
            chunk.update(|c| {
                c.size = offset;
                c.next = after;
            });
        } else {
            self.link(prev, after);
        }

        (cut, dropped)
    }

    /// Check current size of the list, and whether it is valid.
    ///
    /// Only neighbours in list order are compared, which is enough for an
    /// address-ordered list.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        for (previous, next) in self.iter() {
            match previous.map(|p| Relation::of(&p.as_view(), &next.as_view())) {
                Some(Relation::Before) => {
                    // This is valid, do nothing.
                }
                Some(Relation::AdjacentBefore) => {
                    // Right order, but these should be merged.
                    validity.adjacents += 1;
                }
                Some(Relation::Overlapping) => {
                    // This is really bad.
                    validity.overlaps += 1;
                }
                Some(Relation::AdjacentAfter) => {
                    // Wrong order, and these should be merged.
                    validity.out_of_orders += 1;
                    validity.adjacents += 1;
                }
                Some(Relation::After) => {
                    // Wrong order.
                    validity.out_of_orders += 1;
                }
                None => {
                    // This is the first in the list. Valid, do nothing.
                }
            }

            stats.length += 1;
            stats.size += next.size();
        }

        (validity, stats)
    }

    /// As [`stats`](Self::stats), comparing every pair of chunks.
    pub fn stats_unordered(&self) -> (Validity, Stats) {
        let (mut validity, stats) = self.stats();
        validity.overlaps = 0;
        validity.adjacents = 0;

        for (i, (_, a)) in self.iter().enumerate() {
            for (_, b) in self.iter().skip(i + 1) {
                match Relation::of(&a.as_view(), &b.as_view()) {
                    Relation::Overlapping => validity.overlaps += 1,
                    Relation::AdjacentBefore | Relation::AdjacentAfter => validity.adjacents += 1,
                    Relation::Before | Relation::After => {}
                }
            }
        }

        (validity, stats)
    }
}
