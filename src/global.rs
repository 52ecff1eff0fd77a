//! Serving Rust's global allocator from a resource.
//!
//! A [`GlobalResource`] can be created in a `static` before its resource
//! exists; the resource is built with `Default` on first use. Seed it once
//! during startup:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOCATOR: GlobalResource<AtomicResource<IntrusiveChainFirstFit>> = GlobalResource::new();
//!
//! fn init(region: View<u8>) {
//!     unsafe { ALLOCATOR.get().utilize_bytes(region) };
//! }
//! ```

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr::{self, null_mut, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};

use crate::num::PowerOfTwo;
use crate::resource::MemoryResource;

const UNTOUCHED: u8 = 0;
const INITIALIZING: u8 = 1;
const INITIALIZED: u8 = 2;

/// A lazily constructed resource usable as `#[global_allocator]`.
///
/// `R` must be thread-safe, e.g. an
/// [`AtomicResource`](crate::decorators::AtomicResource).
pub struct GlobalResource<R> {
    // Values:
    // - 0: Untouched
    // - 1: Initialization in progress
    // - 2: Initialized
    init: AtomicU8,
    resource: UnsafeCell<MaybeUninit<R>>,
}

unsafe impl<R: Send + Sync> Sync for GlobalResource<R> {}

impl<R> Default for GlobalResource<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> GlobalResource<R> {
    pub const fn new() -> Self {
        GlobalResource {
            init: AtomicU8::new(UNTOUCHED),
            resource: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.init.load(Ordering::SeqCst) == INITIALIZED
    }
}

impl<R: MemoryResource + Sync + Default> GlobalResource<R> {
    /// The resource, constructing it if this is the first use.
    pub fn get(&self) -> &R {
        // The plan:
        // - If initializing hasn't yet started (0):
        //   - Mark it as initializing (1), then initialize, then mark it as fully initialized (2)
        // - If it has started but not completed (1):
        //   - Enter a spin loop until it is fully initialized (2)
        // - If it finished initializing (2):
        //   - Continue
        let state = self.init.compare_exchange(
            UNTOUCHED,
            INITIALIZING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );

        match state {
            Err(INITIALIZED) => {}
            Ok(_) => {
                // SAFETY: only the thread that won the exchange writes.
                unsafe { (*self.resource.get()).as_mut_ptr().write(R::default()) };
                self.init.store(INITIALIZED, Ordering::SeqCst);
            }
            Err(INITIALIZING) => loop {
                core::hint::spin_loop();
                match self.init.load(Ordering::SeqCst) {
                    INITIALIZING => continue,
                    INITIALIZED => break,
                    state => panic!("Unexpected state {}", state),
                }
            },
            Err(state) => panic!("Unexpected state {}", state),
        }

        // SAFETY: initialized above, and never written again.
        unsafe { &*(*self.resource.get()).as_ptr() }
    }
}

impl<R> Drop for GlobalResource<R> {
    fn drop(&mut self) {
        if *self.init.get_mut() == INITIALIZED {
            unsafe { ptr::drop_in_place(self.resource.get_mut().as_mut_ptr()) }
        }
    }
}

unsafe impl<R: MemoryResource + Sync + Default> GlobalAlloc for GlobalResource<R> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let align = match PowerOfTwo::new(layout.align()) {
            Some(align) => align,
            None => return null_mut(),
        };
        self.get()
            .allocate_bytes(layout.size(), align)
            .map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let (Some(ptr), Some(align)) = (NonNull::new(ptr), PowerOfTwo::new(layout.align())) {
            self.get().deallocate_bytes(ptr, layout.size(), align)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    use crate::decorators::AtomicResource;
    use crate::first_fit::IntrusiveChainFirstFit;
    use crate::region::ToyHeap;

    type Global = GlobalResource<AtomicResource<IntrusiveChainFirstFit>>;

    #[test]
    fn test_lazy_init() {
        let global = Global::new();
        assert!(!global.is_initialized());
        // An empty resource just fails.
        let layout = Layout::from_size_align(8, 8).unwrap();
        assert!(unsafe { global.alloc(layout) }.is_null());
        assert!(global.is_initialized());
    }

    #[test]
    fn test_global_alloc() {
        let mut heap = ToyHeap::<4096>::new();
        let global = Global::new();
        unsafe { global.get().utilize_bytes(heap.region()) };

        const BLOCKS: usize = 3;
        let layouts: [Layout; BLOCKS] = [
            Layout::from_size_align(64, 16).unwrap(),
            Layout::from_size_align(64, 16).unwrap(),
            Layout::from_size_align(224, 128).unwrap(),
        ];

        let pointers: [*mut u8; BLOCKS] = unsafe {
            let mut pointers = [null_mut(); BLOCKS];
            for (i, &l) in layouts.iter().enumerate() {
                pointers[i] = global.alloc(l);
                assert!(!pointers[i].is_null());
                assert_eq!(pointers[i] as usize % l.align(), 0);
            }
            pointers
        };

        for (&p, l) in pointers.iter().zip(layouts.iter()) {
            unsafe { global.dealloc(p, *l) };
        }
        let (validity, stats) = global.get().lock().stats();
        assert!(validity.is_valid());
        assert_eq!(stats.length, 1);
        assert_eq!(stats.size, 4096);
    }
}
