//! Installs a `GlobalResource` as the global allocator, seeded with pages
//! from mmap the first time anything allocates.

use std::ptr::NonNull;

use resource_alloc::region::seed;
use resource_alloc::{
    AtomicResource, GlobalResource, IntrusiveChainFirstFit, LibcPages, MemoryResource, PowerOfTwo,
    View,
};

const HEAP_SIZE: usize = 16 * 1024 * 1024;

struct Pages(AtomicResource<IntrusiveChainFirstFit>);

impl Default for Pages {
    fn default() -> Self {
        let resource = AtomicResource::new(IntrusiveChainFirstFit::new());
        let mut source = LibcPages::new();
        // On failure the resource stays empty and every allocation fails.
        let _ = unsafe { seed(&resource, &mut source, HEAP_SIZE) };
        Pages(resource)
    }
}

impl MemoryResource for Pages {
    fn allocate_bytes(&self, size: usize, align: PowerOfTwo) -> Option<NonNull<u8>> {
        self.0.allocate_bytes(size, align)
    }

    unsafe fn deallocate_bytes(&self, ptr: NonNull<u8>, size: usize, align: PowerOfTwo) {
        self.0.deallocate_bytes(ptr, size, align)
    }

    unsafe fn utilize_bytes(&self, region: View<u8>) {
        self.0.utilize_bytes(region)
    }

    fn yield_bytes(&self, size: usize, align: PowerOfTwo) -> Option<View<u8>> {
        self.0.yield_bytes(size, align)
    }
}

#[global_allocator]
static ALLOCATOR: GlobalResource<Pages> = GlobalResource::new();

fn main() {
    let greeting = format!("Hello, {}!", "World");
    let squares: Vec<u64> = (0..1000).map(|n| n * n).collect();
    println!("{} ({} squares)", greeting, squares.len());

    let (validity, stats) = ALLOCATOR.get().0.lock().stats();
    println!("Allocator stats: {:?}", stats);
    assert!(validity.is_valid());
}
