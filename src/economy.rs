//! A broker that moves memory between resources.
//!
//! A [`MemoryEconomy`] has no memory of its own. Resources join it as
//! [`Member`]s; an allocation request is passed on to the members as a
//! request to [yield](MemoryResource::yield_bytes) memory, and memory handed
//! back to the economy is passed on to the newest member. Nothing moves unless
//! someone calls into the economy.

use core::fmt;
use core::ptr::NonNull;

use crate::decorators::AtomicResource;
use crate::num::PowerOfTwo;
use crate::resource::MemoryResource;
use crate::view::View;

/// A resource's membership in a [`MemoryEconomy`].
///
/// Members are linked through themselves, so registering does not allocate.
pub struct Member<'a, R: ?Sized + MemoryResource = dyn MemoryResource + 'a> {
    resource: &'a R,
    next: Option<&'a Member<'a, R>>,
}

impl<'a, R: ?Sized + MemoryResource> Member<'a, R> {
    pub fn new(resource: &'a R) -> Self {
        Member {
            resource,
            next: None,
        }
    }

    pub fn resource(&self) -> &'a R {
        self.resource
    }
}

pub struct MemoryEconomy<'a, R: ?Sized + MemoryResource = dyn MemoryResource + 'a> {
    head: Option<&'a Member<'a, R>>,
}

/// An economy shared between threads. Members must be `Sync`, e.g. resources
/// wrapped in an [`AtomicResource`].
pub type AtomicMemoryEconomy<'a> = AtomicResource<MemoryEconomy<'a, dyn MemoryResource + Sync + 'a>>;

impl<'a, R: ?Sized + MemoryResource> Default for MemoryEconomy<'a, R> {
    fn default() -> Self {
        MemoryEconomy::new()
    }
}

impl<'a, R: ?Sized + MemoryResource> fmt::Debug for MemoryEconomy<'a, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryEconomy({} members)", self.len())
    }
}

impl<'a, R: ?Sized + MemoryResource> MemoryEconomy<'a, R> {
    pub const fn new() -> Self {
        MemoryEconomy { head: None }
    }

    /// Add `member` to the economy. It becomes the first to be asked for
    /// memory and the one that receives returned memory.
    pub fn register(&mut self, member: &'a mut Member<'a, R>) {
        member.next = self.head;
        self.head = Some(member);
    }

    /// Members, newest first.
    pub fn members(&self) -> Members<'a, R> {
        Members { next: self.head }
    }

    pub fn len(&self) -> usize {
        self.members().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Ask each member in turn to yield `size` bytes, and take the first
    /// offer.
    fn broadcast(&self, size: usize, align: PowerOfTwo) -> Option<View<u8>> {
        for resource in self.members() {
            if let Some(region) = resource.yield_bytes(size, align) {
                debug_assert_eq!(region.len(), size);
                debug_assert!(align.is_aligned(region.addr()));
                return Some(region);
            }
        }
        None
    }

    fn redistribute(&self, region: View<u8>) {
        // Without members the region is dropped.
        if let Some(member) = self.head {
            // SAFETY: the caller gave up the region.
            unsafe { member.resource.utilize_bytes(region) }
        }
    }
}

impl<'a, R: ?Sized + MemoryResource> MemoryResource for MemoryEconomy<'a, R> {
    fn allocate_bytes(&self, size: usize, align: PowerOfTwo) -> Option<NonNull<u8>> {
        self.broadcast(size, align).map(|region| region.as_non_null())
    }

    unsafe fn deallocate_bytes(&self, ptr: NonNull<u8>, size: usize, _align: PowerOfTwo) {
        // Allocations are yielded regions: exactly `size` bytes at `ptr`.
        self.redistribute(View::from_raw_parts(ptr, size))
    }

    unsafe fn utilize_bytes(&self, region: View<u8>) {
        self.redistribute(region)
    }

    fn yield_bytes(&self, size: usize, align: PowerOfTwo) -> Option<View<u8>> {
        self.broadcast(size, align)
    }
}

pub struct Members<'a, R: ?Sized + MemoryResource> {
    next: Option<&'a Member<'a, R>>,
}

impl<'a, R: ?Sized + MemoryResource> Iterator for Members<'a, R> {
    type Item = &'a R;

    fn next(&mut self) -> Option<&'a R> {
        let member = self.next?;
        self.next = member.next;
        Some(member.resource)
    }
}
