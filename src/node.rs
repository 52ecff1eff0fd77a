//! Intrusive metadata stored inside managed memory.
//!
//! Free slots and free chunks carry their own bookkeeping: the memory the
//! type system thinks is a user allocation (or nothing at all) holds a
//! `FreeNode`, a `Chunk` or a `BitHeader` while it is not handed out. Every
//! read and write of that metadata goes through [`NodeRef`]; the allocators
//! above this module manipulate handles and never cast raw pointers
//! themselves.

use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;

/// Byte written over metadata that is no longer live, in debug builds.
pub const POISON_BYTE: u8 = 0xA5;

/// A handle to a `T` stored in-place at some address inside a managed region.
///
/// Handles are `Copy` and compare by address. They do not own the memory and
/// do not keep it alive.
pub struct NodeRef<T> {
    ptr: NonNull<u8>,
    _marker: PhantomData<*mut T>,
}

impl<T> Clone for NodeRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for NodeRef<T> {}

impl<T> PartialEq for NodeRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for NodeRef<T> {}

impl<T> fmt::Debug for NodeRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.ptr)
    }
}

impl<T: Copy> NodeRef<T> {
    /// Construct `value` in place at `at`.
    ///
    /// # Safety
    ///
    /// `at` must be valid for writes of `size_of::<T>()` bytes, aligned for
    /// `T`, and not in use by anything else. The returned handle stays valid
    /// until the memory is handed out again.
    #[allow(clippy::cast_ptr_alignment)]
    pub unsafe fn place(at: NonNull<u8>, value: T) -> NodeRef<T> {
        debug_assert_eq!(
            at.as_ptr() as usize % core::mem::align_of::<T>(),
            0,
            "misaligned intrusive node"
        );
        core::ptr::write(at.as_ptr() as *mut T, value);
        NodeRef {
            ptr: at,
            _marker: PhantomData,
        }
    }

    /// Re-attach a handle to a node previously [`place`](Self::place)d at
    /// `at`.
    ///
    /// # Safety
    ///
    /// A live `T` must have been placed at `at`.
    pub unsafe fn from_addr(at: NonNull<u8>) -> NodeRef<T> {
        NodeRef {
            ptr: at,
            _marker: PhantomData,
        }
    }

    /// # Safety
    ///
    /// The node must still be live.
    #[allow(clippy::cast_ptr_alignment)]
    pub unsafe fn load(self) -> T {
        core::ptr::read(self.ptr.as_ptr() as *const T)
    }

    /// # Safety
    ///
    /// The node must still be live.
    #[allow(clippy::cast_ptr_alignment)]
    pub unsafe fn store(self, value: T) {
        core::ptr::write(self.ptr.as_ptr() as *mut T, value)
    }

    /// Load, modify, store.
    ///
    /// # Safety
    ///
    /// The node must still be live.
    pub unsafe fn update<F: FnOnce(&mut T)>(self, f: F) {
        let mut value = self.load();
        f(&mut value);
        self.store(value);
    }

    /// End the node's lifetime. The bytes it occupied are poisoned in debug
    /// builds.
    ///
    /// # Safety
    ///
    /// The node must be live and nothing may refer to it afterwards.
    pub unsafe fn release(self) {
        poison(self.ptr, core::mem::size_of::<T>());
    }
}

impl<T> NodeRef<T> {
    pub fn as_non_null(self) -> NonNull<u8> {
        self.ptr
    }

    pub fn addr(self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Pointer `offset` bytes past this node's address.
    ///
    /// # Safety
    ///
    /// The result must stay within the region the node lives in.
    pub unsafe fn byte_add(self, offset: usize) -> NonNull<u8> {
        NonNull::new_unchecked(self.ptr.as_ptr().add(offset))
    }
}

/// Mark `len` bytes at `at` as logically uninitialized.
///
/// In debug builds this fills them with [`POISON_BYTE`] so that stale reads of
/// released metadata stand out; in release builds it does nothing.
///
/// # Safety
///
/// `at` must be valid for writes of `len` bytes.
#[inline]
pub unsafe fn poison(at: NonNull<u8>, len: usize) {
    if cfg!(debug_assertions) {
        core::ptr::write_bytes(at.as_ptr(), POISON_BYTE, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[derive(Copy, Clone, Debug, PartialEq)]
    struct Pair {
        a: usize,
        b: usize,
    }

    #[test]
    fn test_place_load_store() {
        let mut buf = [0usize; 4];
        let at = NonNull::new(buf.as_mut_ptr() as *mut u8).unwrap();

        unsafe {
            let node = NodeRef::place(at, Pair { a: 1, b: 2 });
            assert_eq!(node.load(), Pair { a: 1, b: 2 });
            node.update(|p| p.b += 40);
            assert_eq!(node.load().b, 42);

            let again: NodeRef<Pair> = NodeRef::from_addr(at);
            assert_eq!(again, node);
            assert_eq!(again.load().a, 1);
            assert_eq!(node.byte_add(16).as_ptr() as usize, node.addr() + 16);

            node.release();
        }

        if cfg!(debug_assertions) {
            let expected = usize::from_ne_bytes([POISON_BYTE; core::mem::size_of::<usize>()]);
            assert_eq!(buf[0], expected);
            assert_eq!(buf[1], expected);
        }
        assert_eq!(buf[2], 0);
    }
}
