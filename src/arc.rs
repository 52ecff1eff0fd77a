//! A reference-counted handle whose memory comes from a resource.
//!
//! An [`Arc`] makes two allocations from its resource: the payload, and a
//! [`State`] block with two counters. `data_rc` counts handles that can reach
//! the payload; `state_rc` counts handles that can reach the state, which
//! includes [`Disowned`] handles that gave up the payload but may still try
//! to [`upgrade`](Disowned::upgrade). The payload is dropped and freed when
//! `data_rc` hits zero, the state when `state_rc` does.
//!
//! Both allocations have the same size and alignment, the larger of the two
//! requirements, so a single [`IntrusivePool`](crate::pool::IntrusivePool)
//! can serve both.

use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use core::sync::atomic::{self, AtomicUsize, Ordering};

use crate::num::PowerOfTwo;
use crate::resource::MemoryResource;

struct State {
    data_rc: AtomicUsize,
    state_rc: AtomicUsize,
}

// Going past this many references is certainly a leak of handles.
const MAX_REFCOUNT: usize = isize::MAX as usize;

/// Size and alignment of both allocations.
fn block_layout<T>() -> (usize, PowerOfTwo) {
    let size = mem::size_of::<T>().max(mem::size_of::<State>());
    let align = PowerOfTwo::of::<T>().max(PowerOfTwo::of::<State>());
    (size, align)
}

/// A shared, thread-safe reference to a `T` allocated from `R`.
pub struct Arc<'r, T, R: MemoryResource + ?Sized = dyn MemoryResource + 'r> {
    resource: &'r R,
    data: NonNull<T>,
    state: NonNull<State>,
    _owns: PhantomData<T>,
}

unsafe impl<'r, T, R> Send for Arc<'r, T, R>
where
    T: Send + Sync,
    R: MemoryResource + Sync + ?Sized,
{
}

unsafe impl<'r, T, R> Sync for Arc<'r, T, R>
where
    T: Send + Sync,
    R: MemoryResource + Sync + ?Sized,
{
}

impl<'r, T, R: MemoryResource + ?Sized> Arc<'r, T, R> {
    /// Move `value` into memory from `resource`.
    ///
    /// Returns `None`, dropping `value`, if either allocation fails. Nothing
    /// stays allocated in that case.
    pub fn create(resource: &'r R, value: T) -> Option<Self> {
        let (size, align) = block_layout::<T>();
        let data = resource.allocate_bytes(size, align)?;
        let state = match resource.allocate_bytes(size, align) {
            Some(state) => state,
            None => {
                log::debug!("Arc::create failed to allocate its state, releasing payload");
                unsafe { resource.deallocate_bytes(data, size, align) };
                return None;
            }
        };

        let data = data.cast::<T>();
        let state = state.cast::<State>();
        unsafe {
            data.as_ptr().write(value);
            state.as_ptr().write(State {
                data_rc: AtomicUsize::new(1),
                state_rc: AtomicUsize::new(1),
            });
        }
        Some(Arc {
            resource,
            data,
            state,
            _owns: PhantomData,
        })
    }

    fn state(&self) -> &State {
        // SAFETY: this handle holds a state reference.
        unsafe { self.state.as_ref() }
    }

    pub fn resource(this: &Self) -> &'r R {
        this.resource
    }

    pub fn data_count(this: &Self) -> usize {
        this.state().data_rc.load(Ordering::Acquire)
    }

    pub fn state_count(this: &Self) -> usize {
        this.state().state_rc.load(Ordering::Acquire)
    }

    /// Whether both handles point to the same payload.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.data == other.data
    }

    /// Mutable access to the payload if no other handle, disowned or not,
    /// exists.
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        let state = this.state();
        if state.data_rc.load(Ordering::Acquire) == 1 && state.state_rc.load(Ordering::Acquire) == 1
        {
            Some(unsafe { &mut *this.data.as_ptr() })
        } else {
            None
        }
    }

    /// Give up the payload reference but keep the state reference.
    pub fn disown(this: Self) -> Disowned<'r, T, R> {
        let this = mem::ManuallyDrop::new(this);
        unsafe { release_data(this.resource, this.data, this.state) };
        Disowned {
            resource: this.resource,
            data: this.data,
            state: this.state,
            _owns: PhantomData,
        }
    }
}

/// Drop the payload's reference held by one handle.
unsafe fn release_data<T, R: MemoryResource + ?Sized>(
    resource: &R,
    data: NonNull<T>,
    state: NonNull<State>,
) {
    if state.as_ref().data_rc.fetch_sub(1, Ordering::Release) != 1 {
        return;
    }
    atomic::fence(Ordering::Acquire);
    let (size, align) = block_layout::<T>();
    ptr::drop_in_place(data.as_ptr());
    resource.deallocate_bytes(data.cast(), size, align);
}

/// Drop the state reference held by one handle.
unsafe fn release_state<T, R: MemoryResource + ?Sized>(resource: &R, state: NonNull<State>) {
    if state.as_ref().state_rc.fetch_sub(1, Ordering::Release) != 1 {
        return;
    }
    atomic::fence(Ordering::Acquire);
    let (size, align) = block_layout::<T>();
    resource.deallocate_bytes(state.cast(), size, align);
}

impl<'r, T, R: MemoryResource + ?Sized> Clone for Arc<'r, T, R> {
    fn clone(&self) -> Self {
        let state = self.state();
        let old = state.data_rc.fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            panic!("Arc reference count overflow");
        }
        state.state_rc.fetch_add(1, Ordering::Relaxed);
        Arc {
            resource: self.resource,
            data: self.data,
            state: self.state,
            _owns: PhantomData,
        }
    }
}

impl<'r, T, R: MemoryResource + ?Sized> Drop for Arc<'r, T, R> {
    fn drop(&mut self) {
        unsafe {
            release_data(self.resource, self.data, self.state);
            release_state::<T, R>(self.resource, self.state);
        }
    }
}

impl<'r, T, R: MemoryResource + ?Sized> Deref for Arc<'r, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: data_rc is at least one while this handle exists.
        unsafe { self.data.as_ref() }
    }
}

impl<'r, T: fmt::Debug, R: MemoryResource + ?Sized> fmt::Debug for Arc<'r, T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<'r, T: fmt::Display, R: MemoryResource + ?Sized> fmt::Display for Arc<'r, T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

/// A handle that has given up the payload but still holds the state, like a
/// weak reference.
pub struct Disowned<'r, T, R: MemoryResource + ?Sized = dyn MemoryResource + 'r> {
    resource: &'r R,
    data: NonNull<T>,
    state: NonNull<State>,
    _owns: PhantomData<T>,
}

unsafe impl<'r, T, R> Send for Disowned<'r, T, R>
where
    T: Send + Sync,
    R: MemoryResource + Sync + ?Sized,
{
}

unsafe impl<'r, T, R> Sync for Disowned<'r, T, R>
where
    T: Send + Sync,
    R: MemoryResource + Sync + ?Sized,
{
}

impl<'r, T, R: MemoryResource + ?Sized> Disowned<'r, T, R> {
    fn state(&self) -> &State {
        // SAFETY: this handle holds a state reference.
        unsafe { self.state.as_ref() }
    }

    /// A new `Arc` to the payload, if it is still alive.
    pub fn upgrade(&self) -> Option<Arc<'r, T, R>> {
        let state = self.state();
        let mut count = state.data_rc.load(Ordering::Relaxed);
        loop {
            if count == 0 {
                return None;
            }
            if count > MAX_REFCOUNT {
                panic!("Arc reference count overflow");
            }
            match state.data_rc.compare_exchange_weak(
                count,
                count + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(found) => count = found,
            }
        }
        state.state_rc.fetch_add(1, Ordering::Relaxed);
        Some(Arc {
            resource: self.resource,
            data: self.data,
            state: self.state,
            _owns: PhantomData,
        })
    }

    pub fn data_count(&self) -> usize {
        self.state().data_rc.load(Ordering::Acquire)
    }

    pub fn state_count(&self) -> usize {
        self.state().state_rc.load(Ordering::Acquire)
    }
}

impl<'r, T, R: MemoryResource + ?Sized> Clone for Disowned<'r, T, R> {
    fn clone(&self) -> Self {
        self.state().state_rc.fetch_add(1, Ordering::Relaxed);
        Disowned {
            resource: self.resource,
            data: self.data,
            state: self.state,
            _owns: PhantomData,
        }
    }
}

impl<'r, T, R: MemoryResource + ?Sized> Drop for Disowned<'r, T, R> {
    fn drop(&mut self) {
        unsafe { release_state::<T, R>(self.resource, self.state) }
    }
}

impl<'r, T, R: MemoryResource + ?Sized> fmt::Debug for Disowned<'r, T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(Disowned)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::cell::Cell;

    use test_env_log::test;

    use crate::first_fit::IntrusiveChainFirstFit;
    use crate::pool::IntrusivePool;
    use crate::region::ToyHeap;

    struct Droppy<'a> {
        drops: &'a Cell<usize>,
        value: u32,
    }

    impl Drop for Droppy<'_> {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    fn assert_all_free(allocator: &IntrusiveChainFirstFit, size: usize) {
        let (validity, stats) = allocator.stats();
        log::info!("{}", allocator);
        assert!(validity.is_valid());
        assert_eq!(stats.length, 1);
        assert_eq!(stats.size, size);
    }

    #[test]
    fn test_create_and_drop() {
        let mut heap = ToyHeap::<4096>::new();
        let allocator = IntrusiveChainFirstFit::new();
        unsafe { allocator.utilize(heap.region()) };
        let drops = Cell::new(0);

        let arc = Arc::create(&allocator, Droppy { drops: &drops, value: 7 }).unwrap();
        assert_eq!(arc.value, 7);
        assert_eq!(Arc::data_count(&arc), 1);
        assert_eq!(Arc::state_count(&arc), 1);
        assert!(allocator.free_bytes() < 4096);

        drop(arc);
        assert_eq!(drops.get(), 1);
        assert_all_free(&allocator, 4096);
    }

    #[test]
    fn test_clone_counts() {
        let mut heap = ToyHeap::<4096>::new();
        let allocator = IntrusiveChainFirstFit::new();
        unsafe { allocator.utilize(heap.region()) };
        let drops = Cell::new(0);

        let a = Arc::create(&allocator, Droppy { drops: &drops, value: 1 }).unwrap();
        let b = a.clone();
        let c = Arc::create(&allocator, Droppy { drops: &drops, value: 1 }).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(Arc::data_count(&b), 2);
        assert_eq!(Arc::state_count(&b), 2);

        drop(a);
        assert_eq!(drops.get(), 0);
        assert_eq!(Arc::data_count(&b), 1);
        drop(b);
        drop(c);
        assert_eq!(drops.get(), 2);
        assert_all_free(&allocator, 4096);
    }

    #[test]
    fn test_disown_and_upgrade() {
        let mut heap = ToyHeap::<4096>::new();
        let allocator = IntrusiveChainFirstFit::new();
        unsafe { allocator.utilize(heap.region()) };
        let drops = Cell::new(0);

        let a = Arc::create(&allocator, Droppy { drops: &drops, value: 3 }).unwrap();
        let disowned = Arc::disown(a.clone());
        assert_eq!(disowned.data_count(), 1);
        assert_eq!(disowned.state_count(), 2);

        let revived = disowned.upgrade().unwrap();
        assert_eq!(revived.value, 3);
        assert_eq!(disowned.data_count(), 2);
        assert_eq!(disowned.state_count(), 3);

        let other = disowned.clone();
        assert_eq!(other.state_count(), 4);
        assert_eq!(other.data_count(), 2);

        drop(a);
        drop(revived);
        assert_eq!(drops.get(), 1);
        assert!(disowned.upgrade().is_none());
        assert_eq!(disowned.state_count(), 2);

        // The payload is gone, the state is not.
        assert!(allocator.free_bytes() < 4096);
        drop(other);
        drop(disowned);
        assert_all_free(&allocator, 4096);
    }

    #[test]
    fn test_get_mut() {
        let mut heap = ToyHeap::<4096>::new();
        let allocator = IntrusiveChainFirstFit::new();
        unsafe { allocator.utilize(heap.region()) };

        let mut a = Arc::create(&allocator, 10u64).unwrap();
        *Arc::get_mut(&mut a).unwrap() += 1;
        assert_eq!(*a, 11);

        let b = a.clone();
        assert!(Arc::get_mut(&mut a).is_none());
        let disowned = Arc::disown(b);
        assert!(Arc::get_mut(&mut a).is_none());
        drop(disowned);
        assert!(Arc::get_mut(&mut a).is_some());
    }

    #[test]
    fn test_partial_failure_releases_payload() {
        let mut heap = ToyHeap::<4096>::new();
        let pool = IntrusivePool::new(16, PowerOfTwo::new(8).unwrap()).unwrap();
        // Room for exactly one block.
        unsafe { pool.utilize(heap.region().subview(0, 16).unwrap()) };
        assert_eq!(pool.free_slots(), 1);

        assert!(Arc::create(&pool, 5u32).is_none());
        assert_eq!(pool.free_slots(), 1);

        unsafe { pool.utilize(heap.region().subview(16, 16).unwrap()) };
        let arc = Arc::create(&pool, 5u32).unwrap();
        assert_eq!(pool.free_slots(), 0);
        drop(arc);
        assert_eq!(pool.free_slots(), 2);
    }

    #[test]
    fn test_zero_sized_and_dyn_resource() {
        let mut heap = ToyHeap::<4096>::new();
        let allocator = IntrusiveChainFirstFit::new();
        unsafe { allocator.utilize(heap.region()) };
        let resource: &dyn MemoryResource = &allocator;

        let unit: Arc<()> = Arc::create(resource, ()).unwrap();
        let copy = unit.clone();
        assert_eq!(Arc::data_count(&copy), 2);
        drop(unit);
        drop(copy);
        assert_all_free(&allocator, 4096);
    }
}
