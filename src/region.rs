//! Sources of raw memory regions to seed resources with.
//!
//! ### [`RegionSource`](trait.RegionSource.html)
//!
//! A simple trait meant to abstract over where memory comes from: firmware
//! tables, static buffers, or the OS.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a page-aligned array that can pretend to be a heap, and
//! implements `RegionSource` for such a purpose. It is mainly useful for
//! testing.
//!
//! ### [`LibcPages`](struct.LibcPages.html)
//!
//! Anonymous memory mappings through libc. Only with the `use_libc` feature.

use core::fmt;
#[cfg(feature = "use_libc")]
use core::ptr::{null_mut, NonNull};

#[cfg(feature = "use_libc")]
use errno::Errno;

use crate::resource::MemoryResource;
use crate::view::View;

// Round up value to the nearest multiple of increment
fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    ((value - 1) / increment + 1).checked_mul(increment)
}

pub trait RegionSource {
    type Err;

    /// Produce a fresh region of at least `size` bytes.
    ///
    /// # Safety
    ///
    /// The returned region must be valid for reads and writes and untracked by
    /// any other Rust code. Sources backed by their own storage (such as
    /// [`ToyHeap`]) must not move or be dropped while the region is in use.
    unsafe fn grow(&mut self, size: usize) -> Result<View<u8>, Self::Err>;
}

/// Grow `source` by `size` bytes and hand the new region to `resource`.
/// Returns the number of bytes handed over, which may exceed `size`.
///
/// # Safety
///
/// See [`RegionSource::grow`] and [`MemoryResource::utilize_bytes`].
pub unsafe fn seed<R, S>(resource: &R, source: &mut S, size: usize) -> Result<usize, S::Err>
where
    R: MemoryResource + ?Sized,
    S: RegionSource,
{
    let region = source.grow(size)?;
    log::debug!("Seeding resource with {:?}", region);
    resource.utilize_bytes(region);
    Ok(region.len())
}

/// A fixed buffer that hands itself out a page at a time.
///
/// The buffer starts on a 4096-byte boundary, so two heaps of the same size
/// give the same layout to whatever is placed in them.
#[repr(C, align(4096))]
pub struct ToyHeap<const N: usize> {
    heap: [u8; N],
    size: usize,
    page_size: usize,
}

impl<const N: usize> Default for ToyHeap<N> {
    fn default() -> Self {
        ToyHeap::new()
    }
}

impl<const N: usize> ToyHeap<N> {
    pub const fn new() -> Self {
        ToyHeap {
            heap: [0; N],
            size: 0,
            page_size: 64,
        }
    }

    pub const fn with_page_size(page_size: usize) -> Self {
        ToyHeap {
            heap: [0; N],
            size: 0,
            page_size,
        }
    }

    /// The whole buffer, bypassing [`grow`](RegionSource::grow). Do not mix
    /// the two on one heap.
    pub fn region(&mut self) -> View<u8> {
        View::from_slice(&mut self.heap)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes handed out by `grow` so far.
    pub fn used(&self) -> usize {
        self.size
    }

    pub fn remaining(&self) -> usize {
        N - self.size
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ToyHeapOverflowError {
    pub requested: usize,
    pub remaining: usize,
}

impl fmt::Display for ToyHeapOverflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "toy heap cannot grow by {} bytes, {} remaining",
            self.requested, self.remaining
        )
    }
}

impl<const N: usize> RegionSource for ToyHeap<N> {
    type Err = ToyHeapOverflowError;

    unsafe fn grow(&mut self, size: usize) -> Result<View<u8>, Self::Err> {
        let overflow = ToyHeapOverflowError {
            requested: size,
            remaining: self.remaining(),
        };
        let allocating = round_up(size, self.page_size).ok_or(overflow)?;
        if allocating > self.remaining() {
            return Err(overflow);
        }

        let region = View::from_slice(&mut self.heap)
            .subview(self.size, allocating)
            .ok_or(overflow)?;
        self.size += allocating;
        Ok(region)
    }
}

/// Uses virtual memory to produce regions on request. Regions are never
/// unmapped.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct LibcPages {
    // Just for tracking, not really needed
    pages: usize,
    growths: usize,
}

#[cfg(feature = "use_libc")]
impl LibcPages {
    pub const fn new() -> Self {
        LibcPages {
            pages: 0,
            growths: 0,
        }
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn growths(&self) -> usize {
        self.growths
    }
}

#[cfg(feature = "use_libc")]
impl RegionSource for LibcPages {
    type Err = Errno;

    unsafe fn grow(&mut self, size: usize) -> Result<View<u8>, Self::Err> {
        if size == 0 {
            return Ok(View::empty());
        }
        let pagesize = sysconf::page::pagesize();
        let to_allocate = round_up(size, pagesize).ok_or(Errno(libc::ENOMEM))?;

        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            to_allocate,
            libc::PROT_WRITE | libc::PROT_READ,
            // Not backed by a file, and not shared with any other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))?;

        self.pages += to_allocate / pagesize;
        self.growths += 1;
        log::debug!("Mapped {} pages at {:p}", to_allocate / pagesize, ptr);

        Ok(View::from_raw_parts(ptr, to_allocate))
    }
}
