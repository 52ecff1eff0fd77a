//! Non-owning spans over raw memory.
//!
//! A [`View`] is how every allocator in this crate addresses memory: a start
//! pointer and an element count. It does not borrow anything, so it can be
//! handed to a resource and outlive the borrow it was created from; whoever
//! dereferences it is responsible for the memory still being there.

use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::num::PowerOfTwo;

/// A bounds-checked, non-owning span of `len` values of `T` starting at `ptr`.
pub struct View<T> {
    ptr: NonNull<T>,
    len: usize,
}

// Derives would require `T: Copy`.
impl<T> Clone for View<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for View<T> {}

impl<T> PartialEq for View<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr && self.len == other.len
    }
}

impl<T> Eq for View<T> {}

impl<T> fmt::Debug for View<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "View({:?}, {})", self.ptr, self.len)
    }
}

// A View is just an address range; whether it may be dereferenced on another
// thread is decided by whoever owns the memory.
unsafe impl<T> Send for View<T> {}
unsafe impl<T> Sync for View<T> {}

impl<T> View<T> {
    /// A view over the memory of `slice`. The borrow ends here; the view
    /// itself carries no lifetime.
    pub fn from_slice(slice: &mut [T]) -> View<T> {
        View {
            // SAFETY: slice pointers are never null.
            ptr: unsafe { NonNull::new_unchecked(slice.as_mut_ptr()) },
            len: slice.len(),
        }
    }

    /// # Safety
    ///
    /// `ptr..ptr + len` must be a single allocated object (or a part of one)
    /// for as long as the view is dereferenced.
    pub const unsafe fn from_raw_parts(ptr: NonNull<T>, len: usize) -> View<T> {
        View { ptr, len }
    }

    /// A zero-length view at a dangling, well-aligned address.
    pub const fn empty() -> View<T> {
        View {
            ptr: NonNull::dangling(),
            len: 0,
        }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn as_non_null(&self) -> NonNull<T> {
        self.ptr
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Address of the first element.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Address one past the last element.
    pub fn end_addr(&self) -> usize {
        self.addr() + self.len * core::mem::size_of::<T>()
    }

    /// The sub-range `offset..offset + len`, or `None` if it does not fit.
    pub fn subview(&self, offset: usize, len: usize) -> Option<View<T>> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        // SAFETY: `offset <= self.len`, so the pointer stays inside (or one
        // past) the viewed object.
        let ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) };
        Some(View { ptr, len })
    }

    /// Split into `..mid` and `mid..`.
    pub fn split_at(&self, mid: usize) -> Option<(View<T>, View<T>)> {
        let head = self.subview(0, mid)?;
        let tail = self.subview(mid, self.len - mid)?;
        Some((head, tail))
    }

    /// Pointer to element `index`.
    pub fn get(&self, index: usize) -> Option<NonNull<T>> {
        self.subview(index, 1).map(|v| v.ptr)
    }

    pub fn iter(&self) -> Iter<T> {
        Iter {
            view: *self,
            _marker: PhantomData,
        }
    }

    /// Whether `other` lies entirely within this view.
    pub fn contains(&self, other: &View<T>) -> bool {
        self.addr() <= other.addr() && other.end_addr() <= self.end_addr()
    }

    pub fn overlaps(&self, other: &View<T>) -> bool {
        self.addr() < other.end_addr() && other.addr() < self.end_addr()
    }

    /// # Safety
    ///
    /// The memory must be initialized, live for `'a`, and not mutated while
    /// the slice is alive.
    pub unsafe fn as_slice<'a>(&self) -> &'a [T] {
        core::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// # Safety
    ///
    /// As [`as_slice`](Self::as_slice), and no other reference to the memory
    /// may exist while the slice is alive.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [T] {
        core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

impl View<u8> {
    /// Split off the padding needed to bring the start up to `align`.
    ///
    /// Returns `(padding, aligned)`, or `None` if the view is too short to
    /// reach an aligned address.
    pub fn align_to(&self, align: PowerOfTwo) -> Option<(View<u8>, View<u8>)> {
        let padding = align.align_up(self.addr())? - self.addr();
        self.split_at(padding)
    }

    /// Consecutive, non-overlapping sub-views of exactly `size` bytes. A
    /// trailing remainder shorter than `size` is not yielded; see
    /// [`Chunks::remainder`].
    pub fn chunks(&self, size: usize) -> Chunks {
        assert!(size > 0, "chunk size must be non-zero");
        Chunks { rest: *self, size }
    }
}

/// Iterator over element pointers of a [`View`].
pub struct Iter<T> {
    view: View<T>,
    _marker: PhantomData<T>,
}

impl<T> Iterator for Iter<T> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let (first, rest) = self.view.split_at(1)?;
        self.view = rest;
        Some(first.ptr)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.view.len, Some(self.view.len))
    }
}

impl<T> ExactSizeIterator for Iter<T> {}

/// Iterator returned by [`View::chunks`].
pub struct Chunks {
    rest: View<u8>,
    size: usize,
}

impl Chunks {
    /// What is left once the iterator is exhausted.
    pub fn remainder(&self) -> View<u8> {
        self.rest
    }
}

impl Iterator for Chunks {
    type Item = View<u8>;

    fn next(&mut self) -> Option<View<u8>> {
        let (chunk, rest) = self.rest.split_at(self.size)?;
        self.rest = rest;
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[test]
    fn test_subview_bounds() {
        let mut buf = [0u8; 32];
        let view = View::from_slice(&mut buf);
        assert_eq!(view.len(), 32);

        let sub = view.subview(8, 16).unwrap();
        assert_eq!(sub.addr(), view.addr() + 8);
        assert_eq!(sub.end_addr(), view.addr() + 24);
        assert!(view.contains(&sub));

        assert!(view.subview(17, 16).is_none());
        assert!(view.subview(usize::MAX, 2).is_none());
        assert_eq!(view.subview(32, 0).map(|v| v.len()), Some(0));

        let (a, b) = view.split_at(10).unwrap();
        assert_eq!(a.len(), 10);
        assert_eq!(b.len(), 22);
        assert_eq!(a.end_addr(), b.addr());
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&view));
        assert!(view.split_at(33).is_none());
    }

    #[test]
    fn test_iter_and_get() {
        let mut buf = [1u32, 2, 3, 4];
        let view = View::from_slice(&mut buf);
        let sum: u32 = view.iter().map(|p| unsafe { *p.as_ptr() }).sum();
        assert_eq!(sum, 10);
        assert_eq!(view.iter().len(), 4);
        assert_eq!(view.end_addr() - view.addr(), 16);

        let third = view.get(2).unwrap();
        assert_eq!(unsafe { *third.as_ptr() }, 3);
        assert!(view.get(4).is_none());
    }

    #[test]
    fn test_align_and_chunks() {
        #[repr(C, align(64))]
        struct Aligned([u8; 128]);
        let mut buf = Aligned([0; 128]);
        let view = View::from_slice(&mut buf.0).subview(3, 100).unwrap();

        let (padding, aligned) = view.align_to(PowerOfTwo::new(16).unwrap()).unwrap();
        assert_eq!(padding.len(), 13);
        assert_eq!(aligned.addr() % 16, 0);
        assert_eq!(aligned.len(), 87);

        let mut chunks = aligned.chunks(20);
        let collected: usize = chunks.by_ref().map(|c| c.len()).sum();
        assert_eq!(collected, 80);
        assert_eq!(chunks.remainder().len(), 7);

        let tiny = view.subview(0, 2).unwrap();
        assert!(tiny.align_to(PowerOfTwo::new(64).unwrap()).is_none());
    }

    #[test]
    fn test_empty() {
        let view: View<u64> = View::empty();
        assert!(view.is_empty());
        assert!(view.iter().next().is_none());
        assert_eq!(view.addr() % core::mem::align_of::<u64>(), 0);
    }
}
