//! Resources that wrap other resources.
//!
//! ### [`AtomicResource`](struct.AtomicResource.html)
//!
//! Wraps a resource with a spin lock to make it thread-safe. Every call holds
//! the lock for the duration of the delegated call.
//!
//! ### [`TracingResource`](struct.TracingResource.html)
//!
//! Prints every call, its arguments and its result through a callback, and
//! otherwise stays out of the way.
//!
//! ### [`NullResource`](struct.NullResource.html)
//!
//! Has no memory. Useful as the resource to hand out before a real one
//! exists.

use core::fmt;
use core::ptr::NonNull;

use spin::{Mutex, MutexGuard};

use crate::num::PowerOfTwo;
use crate::resource::MemoryResource;
use crate::view::View;

/// A thread-safe resource, using a spin lock around another resource.
///
/// The lock is a busy-wait spin lock: waiters are not queued, and there is no
/// promise about which waiter goes next. Critical sections are a single call
/// into the inner resource.
///
/// The lock is not reentrant. Nothing called while it is held may allocate
/// from this resource again; when it backs `#[global_allocator]` that rules
/// out logging, so the allocators here never log on their allocation paths.
/// A logging [`TracingResource`] belongs outside the lock, not inside it.
///
/// Only the owned form crosses threads: the allocators keep their state in
/// `Cell`s, so `AtomicResource<&R>` is never `Sync` for them.
pub struct AtomicResource<R> {
    inner: Mutex<R>,
}

impl<R: Default> Default for AtomicResource<R> {
    fn default() -> Self {
        AtomicResource::new(R::default())
    }
}

impl<R> AtomicResource<R> {
    pub fn new(inner: R) -> Self {
        AtomicResource {
            inner: Mutex::new(inner),
        }
    }

    /// Lock the inner resource for direct access, e.g. to read its
    /// statistics.
    ///
    /// All other calls on this resource spin until the guard is dropped.
    pub fn lock(&self) -> MutexGuard<R> {
        self.inner.lock()
    }

    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

impl<R: MemoryResource> MemoryResource for AtomicResource<R> {
    fn allocate_bytes(&self, size: usize, align: PowerOfTwo) -> Option<NonNull<u8>> {
        self.inner.lock().allocate_bytes(size, align)
    }

    unsafe fn deallocate_bytes(&self, ptr: NonNull<u8>, size: usize, align: PowerOfTwo) {
        self.inner.lock().deallocate_bytes(ptr, size, align)
    }

    unsafe fn utilize_bytes(&self, region: View<u8>) {
        self.inner.lock().utilize_bytes(region)
    }

    fn yield_bytes(&self, size: usize, align: PowerOfTwo) -> Option<View<u8>> {
        self.inner.lock().yield_bytes(size, align)
    }
}

/// Formats a possibly null pointer the way C's `%p` does.
struct DisplayPtr(Option<NonNull<u8>>);

impl fmt::Display for DisplayPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(ptr) => write!(f, "{:p}", ptr),
            None => write!(f, "(nil)"),
        }
    }
}

/// A resource that reports every call on its inner resource.
///
/// Each call produces exactly one line, ending in `\n`, passed to `print`
/// after the inner call returns:
///
/// ```text
/// TracingResource::allocate_bytes(69, 16) -> (nil)
/// TracingResource::deallocate_bytes(0x7f..., 69, 16)
/// TracingResource::utilize_bytes(0x7f..., 4096)
/// TracingResource::yield_bytes(64, 8) -> 0x7f...
/// ```
///
/// Results are passed through untouched. `R` may itself be a reference, to
/// trace a resource without taking it over.
pub struct TracingResource<R, P> {
    inner: R,
    print: P,
}

/// Print trace lines through `log::debug!`.
pub fn log_line(line: fmt::Arguments<'_>) {
    log::debug!("{}", line);
}

impl<R: MemoryResource> TracingResource<R, fn(fmt::Arguments<'_>)> {
    /// Trace through the `log` facade.
    pub fn logging(inner: R) -> Self {
        TracingResource {
            inner,
            print: log_line,
        }
    }
}

impl<R, P> TracingResource<R, P>
where
    R: MemoryResource,
    P: Fn(fmt::Arguments<'_>),
{
    pub fn new(inner: R, print: P) -> Self {
        TracingResource { inner, print }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R, P> MemoryResource for TracingResource<R, P>
where
    R: MemoryResource,
    P: Fn(fmt::Arguments<'_>),
{
    fn allocate_bytes(&self, size: usize, align: PowerOfTwo) -> Option<NonNull<u8>> {
        let result = self.inner.allocate_bytes(size, align);
        (self.print)(format_args!(
            "TracingResource::allocate_bytes({}, {}) -> {}\n",
            size,
            align,
            DisplayPtr(result)
        ));
        result
    }

    unsafe fn deallocate_bytes(&self, ptr: NonNull<u8>, size: usize, align: PowerOfTwo) {
        self.inner.deallocate_bytes(ptr, size, align);
        (self.print)(format_args!(
            "TracingResource::deallocate_bytes({:p}, {}, {})\n",
            ptr, size, align
        ));
    }

    unsafe fn utilize_bytes(&self, region: View<u8>) {
        self.inner.utilize_bytes(region);
        (self.print)(format_args!(
            "TracingResource::utilize_bytes({:p}, {})\n",
            region.as_non_null(),
            region.len()
        ));
    }

    fn yield_bytes(&self, size: usize, align: PowerOfTwo) -> Option<View<u8>> {
        let result = self.inner.yield_bytes(size, align);
        (self.print)(format_args!(
            "TracingResource::yield_bytes({}, {}) -> {}\n",
            size,
            align,
            DisplayPtr(result.map(|v| v.as_non_null()))
        ));
        result
    }
}

/// A resource with no memory: allocation always fails, everything else is
/// ignored.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NullResource;

/// A `NullResource` to borrow where a `&'static dyn MemoryResource` is needed.
pub const NULL_RESOURCE: NullResource = NullResource;

impl MemoryResource for NullResource {
    fn allocate_bytes(&self, _size: usize, _align: PowerOfTwo) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn deallocate_bytes(&self, _ptr: NonNull<u8>, _size: usize, _align: PowerOfTwo) {}

    unsafe fn utilize_bytes(&self, _region: View<u8>) {}
}
