//! The memory resource capability shared by every allocator and decorator.

use core::ptr::NonNull;

use crate::num::PowerOfTwo;
use crate::view::View;

/// A source of memory with a three-operation contract.
///
/// - [`allocate_bytes`](Self::allocate_bytes) never panics on exhaustion; it
///   returns `None`.
/// - Every pointer returned by `allocate_bytes` must be handed back to
///   [`deallocate_bytes`](Self::deallocate_bytes) exactly once, on the same
///   resource, with the same `size` and `align`. Allocators use those values
///   to find their bookkeeping, so a mismatch corrupts them. Debug builds
///   assert where they can.
/// - [`utilize_bytes`](Self::utilize_bytes) gives the resource memory to
///   manage.
///
/// All methods take `&self` so that a resource can be shared by reference
/// between handles that allocate from it (see [`Arc`](crate::arc::Arc)). The
/// plain allocators use interior mutability and are therefore not `Sync`;
/// wrap them in [`AtomicResource`](crate::decorators::AtomicResource) to
/// share them between threads.
pub trait MemoryResource {
    /// Allocate `size` bytes aligned to `align`.
    fn allocate_bytes(&self, size: usize, align: PowerOfTwo) -> Option<NonNull<u8>>;

    /// Return an allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate_bytes(size, align)` on this resource and
    /// must not have been deallocated since.
    unsafe fn deallocate_bytes(&self, ptr: NonNull<u8>, size: usize, align: PowerOfTwo);

    /// Hand `region` over to the resource.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes, must stay valid for as
    /// long as the resource (or anything it allocated) is in use, and must not
    /// be accessed by anyone else from now on.
    unsafe fn utilize_bytes(&self, region: View<u8>);

    /// Permanently give up an `align`-aligned region of exactly `size` bytes.
    ///
    /// This is how a [`MemoryEconomy`](crate::economy::MemoryEconomy) asks its
    /// members for memory. Yielded memory leaves the resource's books: it is
    /// never handed out by it again and must not be passed back to
    /// `deallocate_bytes`. Resources only yield when asked.
    fn yield_bytes(&self, size: usize, align: PowerOfTwo) -> Option<View<u8>> {
        let _ = (size, align);
        None
    }
}

impl<'a, R: MemoryResource + ?Sized> MemoryResource for &'a R {
    fn allocate_bytes(&self, size: usize, align: PowerOfTwo) -> Option<NonNull<u8>> {
        (**self).allocate_bytes(size, align)
    }

    unsafe fn deallocate_bytes(&self, ptr: NonNull<u8>, size: usize, align: PowerOfTwo) {
        (**self).deallocate_bytes(ptr, size, align)
    }

    unsafe fn utilize_bytes(&self, region: View<u8>) {
        (**self).utilize_bytes(region)
    }

    fn yield_bytes(&self, size: usize, align: PowerOfTwo) -> Option<View<u8>> {
        (**self).yield_bytes(size, align)
    }
}

/// Typed helpers on top of [`MemoryResource`].
pub trait ResourceExt: MemoryResource {
    /// Uninitialized memory for one `T`.
    fn allocate<T>(&self) -> Option<NonNull<T>> {
        self.allocate_bytes(core::mem::size_of::<T>(), PowerOfTwo::of::<T>())
            .map(NonNull::cast)
    }

    /// Allocate and move `value` into the new memory. On failure the value is
    /// given back.
    fn construct<T>(&self, value: T) -> Result<NonNull<T>, T> {
        match self.allocate::<T>() {
            Some(ptr) => {
                // SAFETY: fresh, suitably sized and aligned memory.
                unsafe { ptr.as_ptr().write(value) };
                Ok(ptr)
            }
            None => Err(value),
        }
    }

    /// Drop the `T` at `ptr` and return its memory.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`construct`](Self::construct) on this resource
    /// and must not be used afterwards.
    unsafe fn destroy<T>(&self, ptr: NonNull<T>) {
        core::ptr::drop_in_place(ptr.as_ptr());
        self.deallocate_bytes(
            ptr.cast(),
            core::mem::size_of::<T>(),
            PowerOfTwo::of::<T>(),
        );
    }
}

impl<R: MemoryResource + ?Sized> ResourceExt for R {}

/// Parts of a region that a resource could not use.
///
/// The resource never touches these; they remain the caller's.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Leftovers {
    pub before: View<u8>,
    pub after: View<u8>,
}

impl Leftovers {
    /// The whole region was unusable.
    pub fn all(region: View<u8>) -> Leftovers {
        Leftovers {
            before: region,
            after: View::empty(),
        }
    }

    pub fn len(&self) -> usize {
        self.before.len() + self.after.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
