//! A fixed-size slab allocator.
//!
//! Every slot in an [`IntrusivePool`] has the same size and alignment. Free
//! slots form a LIFO stack whose links live inside the slots themselves, so
//! allocation and deallocation are a pointer pop and push.

use core::cell::Cell;
use core::fmt;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::error::Error;
use crate::node::NodeRef;
use crate::num::{ClampLeast, Least, PowerOfTwo};
use crate::resource::{Leftovers, MemoryResource};
use crate::view::View;

/// The link stored in a free slot.
#[derive(Copy, Clone)]
#[repr(C)]
struct FreeNode {
    next: Option<NodeRef<FreeNode>>,
}

/// Smallest slot a pool can manage.
pub const MIN_OBJECT_SIZE: usize = core::mem::size_of::<FreeNode>();
const MIN_OBJECT_ALIGN: usize = core::mem::align_of::<FreeNode>();

const_assert!(MIN_OBJECT_SIZE == core::mem::size_of::<usize>());

/// A pool of equally sized, equally aligned slots.
///
/// Not thread-safe on its own; see
/// [`AtomicResource`](crate::decorators::AtomicResource).
pub struct IntrusivePool {
    head: Cell<Option<NodeRef<FreeNode>>>,
    free: Cell<usize>,
    object_size: usize,
    object_align: PowerOfTwo,
}

// The pool owns the slots it links; moving it to another thread moves the
// whole stack with it.
unsafe impl Send for IntrusivePool {}

impl fmt::Debug for IntrusivePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntrusivePool")
            .field("object_size", &self.object_size)
            .field("object_align", &self.object_align)
            .field("free", &self.free.get())
            .finish()
    }
}

impl IntrusivePool {
    /// An empty pool for objects of `object_size` bytes at `object_align`.
    ///
    /// The alignment is raised to at least that of a pointer, and the size is
    /// rounded up to a multiple of the alignment so that slots tile a region
    /// without gaps.
    pub fn new(object_size: usize, object_align: PowerOfTwo) -> Result<IntrusivePool, Error> {
        let size = Least::<MIN_OBJECT_SIZE>::new(object_size).ok_or(Error::ObjectTooSmall {
            size: object_size,
            min: MIN_OBJECT_SIZE,
        })?;
        let align = PowerOfTwo::new(ClampLeast::<MIN_OBJECT_ALIGN>::new(object_align.get()).get())
            .ok_or(Error::NotPowerOfTwo(object_align.get()))?;
        let object_size = align.align_up(size.get()).ok_or(Error::ObjectTooLarge {
            size: object_size,
        })?;

        Ok(IntrusivePool {
            head: Cell::new(None),
            free: Cell::new(0),
            object_size,
            object_align: align,
        })
    }

    /// A pool for values of type `T`.
    pub fn for_type<T>() -> Result<IntrusivePool, Error> {
        IntrusivePool::new(core::mem::size_of::<T>(), PowerOfTwo::of::<T>())
    }

    /// A pool seeded with `region`. Unusable parts of the region are dropped.
    ///
    /// # Safety
    ///
    /// See [`utilize`](Self::utilize).
    pub unsafe fn with_region(
        object_size: usize,
        object_align: PowerOfTwo,
        region: View<u8>,
    ) -> Result<IntrusivePool, Error> {
        let pool = IntrusivePool::new(object_size, object_align)?;
        pool.utilize(region);
        Ok(pool)
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn object_align(&self) -> PowerOfTwo {
        self.object_align
    }

    /// Number of slots ready to be handed out.
    pub fn free_slots(&self) -> usize {
        self.free.get()
    }

    pub fn is_empty(&self) -> bool {
        self.head.get().is_none()
    }

    /// Take a slot. Fails if the pool is empty or if the request does not fit
    /// in a slot.
    pub fn allocate(&self, size: usize, align: PowerOfTwo) -> Option<View<u8>> {
        if size > self.object_size || align > self.object_align {
            return None;
        }
        let node = self.head.get()?;
        unsafe {
            self.head.set(node.load().next);
            node.release();
        }
        self.free.set(self.free.get() - 1);
        Some(unsafe { View::from_raw_parts(node.as_non_null(), self.object_size) })
    }

    /// Return a slot.
    ///
    /// # Safety
    ///
    /// `slot` must be a slot from [`allocate`](Self::allocate) on this pool
    /// (or an equivalent, unused, properly aligned piece of memory of exactly
    /// `object_size` bytes), and must not be used afterwards. Returning the
    /// same slot twice corrupts the pool.
    pub unsafe fn deallocate(&self, slot: View<u8>) {
        debug_assert_eq!(slot.len(), self.object_size, "slot size mismatch");
        debug_assert!(
            self.object_align.is_aligned(slot.addr()),
            "slot is not aligned to the pool"
        );
        let node = NodeRef::place(
            slot.as_non_null(),
            FreeNode {
                next: self.head.get(),
            },
        );
        self.head.set(Some(node));
        self.free.set(self.free.get() + 1);
    }

    /// Carve `region` into as many slots as fit and add them to the pool.
    ///
    /// Slots are pushed from the highest address down, so a fresh pool hands
    /// them out in ascending address order.
    ///
    /// # Safety
    ///
    /// See [`MemoryResource::utilize_bytes`].
    pub unsafe fn utilize(&self, region: View<u8>) -> Leftovers {
        let (before, aligned) = match region.align_to(self.object_align) {
            Some(parts) => parts,
            None => return Leftovers::all(region),
        };

        let count = aligned.len() / self.object_size;
        let (slots, after) = match aligned.split_at(count * self.object_size) {
            Some(parts) => parts,
            None => return Leftovers::all(region),
        };

        for index in (0..count).rev() {
            if let Some(slot) = slots.subview(index * self.object_size, self.object_size) {
                self.deallocate(slot);
            }
        }

        Leftovers { before, after }
    }

    /// Forget every free slot, as if the pool had just been created. The
    /// memory is not touched; utilize it again to reuse it.
    pub fn reset(&self) {
        self.head.set(None);
        self.free.set(0);
    }
}

impl MemoryResource for IntrusivePool {
    fn allocate_bytes(&self, size: usize, align: PowerOfTwo) -> Option<NonNull<u8>> {
        self.allocate(size, align).map(|v| v.as_non_null())
    }

    unsafe fn deallocate_bytes(&self, ptr: NonNull<u8>, size: usize, align: PowerOfTwo) {
        debug_assert!(size <= self.object_size && align <= self.object_align);
        self.deallocate(View::from_raw_parts(ptr, self.object_size));
    }

    unsafe fn utilize_bytes(&self, region: View<u8>) {
        // Space that does not fit a whole slot is lost.
        self.utilize(region);
    }

    /// Gives up one slot; the part of it past `size` is lost.
    fn yield_bytes(&self, size: usize, align: PowerOfTwo) -> Option<View<u8>> {
        if size == 0 {
            return None;
        }
        self.allocate(size, align)?.subview(0, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    use crate::region::ToyHeap;

    fn align(n: usize) -> PowerOfTwo {
        PowerOfTwo::new(n).unwrap()
    }

    fn exhaust(pool: &IntrusivePool) -> [usize; 64] {
        let mut addrs = [0usize; 64];
        let mut n = 0;
        while let Some(slot) = pool.allocate(pool.object_size(), pool.object_align()) {
            addrs[n] = slot.addr();
            n += 1;
        }
        addrs
    }

    #[test]
    fn test_new_validates() {
        assert_eq!(
            IntrusivePool::new(1, align(1)).unwrap_err(),
            Error::ObjectTooSmall {
                size: 1,
                min: MIN_OBJECT_SIZE
            }
        );
        let pool = IntrusivePool::new(MIN_OBJECT_SIZE, align(1)).unwrap();
        assert_eq!(pool.object_align().get(), MIN_OBJECT_ALIGN);

        let pool = IntrusivePool::new(24, align(16)).unwrap();
        assert_eq!(pool.object_size(), 32);
        assert_eq!(pool.object_align().get(), 16);
        assert!(pool.is_empty());

        assert!(IntrusivePool::for_type::<[u64; 3]>().is_ok());
    }

    #[test]
    fn test_utilize_and_leftovers() {
        let mut heap = ToyHeap::<4096>::new();
        let region = heap.region().subview(3, 300).unwrap();
        let pool = IntrusivePool::new(32, align(32)).unwrap();

        let leftovers = unsafe { pool.utilize(region) };
        // 3 + 29 = 32; 271 bytes left after alignment: 8 slots, 15 spare.
        assert_eq!(leftovers.before.len(), 29);
        assert_eq!(pool.free_slots(), 8);
        assert_eq!(leftovers.after.len(), 15);
        assert_eq!(leftovers.after.end_addr(), region.end_addr());

        let first = pool.allocate(1, align(1)).unwrap();
        assert_eq!(first.addr(), leftovers.before.end_addr());
        assert_eq!(first.len(), 32);
        let second = pool.allocate(32, align(32)).unwrap();
        assert_eq!(second.addr(), first.addr() + 32);
    }

    #[test]
    fn test_too_small_region() {
        let mut heap = ToyHeap::<4096>::new();
        let region = heap.region().subview(1, 40).unwrap();
        let pool = IntrusivePool::new(64, align(64)).unwrap();
        let leftovers = unsafe { pool.utilize(region) };
        assert_eq!(leftovers.len(), 40);
        assert!(pool.is_empty());
        assert!(pool.allocate(8, align(8)).is_none());
    }

    #[test]
    fn test_rejects_oversize_and_overaligned() {
        let mut heap = ToyHeap::<4096>::new();
        let pool = unsafe { IntrusivePool::with_region(16, align(16), heap.region()) }.unwrap();
        assert!(pool.allocate(17, align(1)).is_none());
        assert!(pool.allocate(8, align(32)).is_none());
        assert!(pool.allocate(16, align(16)).is_some());
    }

    #[test]
    fn test_lifo_reuse() {
        let mut heap = ToyHeap::<4096>::new();
        let pool = unsafe { IntrusivePool::with_region(64, align(8), heap.region()) }.unwrap();
        let a = pool.allocate_bytes(64, align(8)).unwrap();
        let b = pool.allocate_bytes(40, align(8)).unwrap();
        assert_ne!(a, b);

        unsafe { pool.deallocate_bytes(a, 64, align(8)) };
        assert_eq!(pool.allocate_bytes(64, align(8)), Some(a));

        unsafe {
            pool.deallocate_bytes(b, 40, align(8));
            pool.deallocate_bytes(a, 64, align(8));
        }
        assert_eq!(pool.allocate_bytes(8, align(1)), Some(a));
        assert_eq!(pool.allocate_bytes(8, align(1)), Some(b));
    }

    #[test]
    fn test_capacity_boundary() {
        let mut heap = ToyHeap::<4096>::new();
        let pool = IntrusivePool::new(128, align(128)).unwrap();
        let leftovers = unsafe { pool.utilize(heap.region().subview(0, 4 * 128).unwrap()) };
        assert!(leftovers.is_empty());

        for _ in 0..4 {
            assert!(pool.allocate(128, align(128)).is_some());
        }
        assert!(pool.allocate(1, align(1)).is_none());
        assert_eq!(pool.free_slots(), 0);
    }

    #[test]
    fn test_deterministic_rounds() {
        let mut heap = ToyHeap::<4096>::new();
        let region = heap.region().subview(5, 2000).unwrap();
        let pool = IntrusivePool::new(40, align(8)).unwrap();

        unsafe { pool.utilize(region) };
        let first = exhaust(&pool);
        assert!(pool.is_empty());

        pool.reset();
        unsafe { pool.utilize(region) };
        let second = exhaust(&pool);

        assert_eq!(&first[..], &second[..]);
        let count = first.iter().filter(|&&a| a != 0).count();
        assert_eq!(count, 49);
        assert!(first[..count].windows(2).all(|w| w[1] == w[0] + 40));
    }

    #[test]
    fn test_yield() {
        let mut heap = ToyHeap::<4096>::new();
        let pool = unsafe { IntrusivePool::with_region(64, align(16), heap.region()) }.unwrap();
        let before = pool.free_slots();
        let yielded = pool.yield_bytes(48, align(16)).unwrap();
        assert_eq!(yielded.len(), 48);
        assert_eq!(pool.free_slots(), before - 1);
        assert!(pool.yield_bytes(65, align(16)).is_none());
        assert!(pool.yield_bytes(0, align(16)).is_none());
    }
}
