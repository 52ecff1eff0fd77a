use core::ptr::NonNull;

use resource_alloc::{
    FreeList, IntrusiveChainFirstFit, IntrusivePool, MemoryResource, PowerOfTwo, ToyHeap, View,
};

use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use test_env_log::test;

const HEAP_SIZE: usize = 256 * 1024;
const ROUNDS: usize = 1024 * 10;

#[derive(Copy, Clone)]
struct Live {
    ptr: Option<NonNull<u8>>,
    size: usize,
    align: usize,
}

const EMPTY: Live = Live {
    ptr: None,
    size: 0,
    align: 1,
};

fn rng() -> StdRng {
    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    StdRng::seed_from_u64(seed)
}

fn view(live: &Live) -> View<u8> {
    unsafe { View::from_raw_parts(live.ptr.unwrap(), live.size) }
}

fn fill(live: &Live, byte: u8) {
    unsafe { view(live).as_mut_slice().iter_mut().for_each(|b| *b = byte) };
}

fn check_fill(live: &Live, byte: u8) {
    let found = unsafe { view(live).as_slice() };
    assert!(
        found.iter().all(|&b| b == byte),
        "allocation at {:?} was overwritten",
        live.ptr
    );
}

/// Randomly allocate and free through `resource`, checking alignment,
/// overlap and that nobody writes into live allocations. Calls `validate`
/// after every step with the number of bytes currently allocated.
fn stress<R, F>(resource: &R, mut validate: F)
where
    R: MemoryResource,
    F: FnMut(&R, usize),
{
    let mut rng = rng();
    let range = rand::distributions::Uniform::new_inclusive(1usize, 32);

    let mut pointers = [EMPTY; 128];
    let mut in_use = 0;
    let mut failures = 0;

    for _ in 0..ROUNDS {
        let index = rand::distributions::Uniform::new(0, pointers.len()).sample(&mut rng);
        let chosen = pointers[index];
        if chosen.ptr.is_none() {
            let size = range.sample(&mut rng) * range.sample(&mut rng);
            let &align = [1usize, 2, 4, 8, 16, 64, 128].choose(&mut rng).unwrap();
            log::trace!("Allocating {}@{}", size, align);
            let ptr = resource.allocate_bytes(size, PowerOfTwo::new(align).unwrap());
            let ptr = match ptr {
                Some(ptr) => ptr,
                None => {
                    failures += 1;
                    continue;
                }
            };
            let new = Live {
                ptr: Some(ptr),
                size,
                align,
            };
            assert_eq!(ptr.as_ptr() as usize % align, 0);
            for other in pointers.iter().filter(|l| l.ptr.is_some()) {
                assert!(
                    !view(other).overlaps(&view(&new)),
                    "{:?} overlaps {:?}",
                    view(other),
                    view(&new)
                );
            }
            fill(&new, index as u8);
            pointers[index] = new;
            in_use += size;
        } else {
            log::trace!("Deallocating {:?} {}@{}", chosen.ptr, chosen.size, chosen.align);
            check_fill(&chosen, index as u8);
            unsafe {
                resource.deallocate_bytes(
                    chosen.ptr.unwrap(),
                    chosen.size,
                    PowerOfTwo::new(chosen.align).unwrap(),
                )
            };
            pointers[index] = EMPTY;
            in_use -= chosen.size;
        }

        validate(resource, in_use);
    }
    log::info!("{} allocations failed", failures);

    for (index, live) in pointers.iter().enumerate() {
        if let Some(ptr) = live.ptr {
            check_fill(live, index as u8);
            unsafe { resource.deallocate_bytes(ptr, live.size, PowerOfTwo::new(live.align).unwrap()) };
        }
    }
    validate(resource, 0);
}

#[test]
fn test_stress_first_fit() {
    let mut heap = ToyHeap::<HEAP_SIZE>::new();
    let allocator = IntrusiveChainFirstFit::new();
    unsafe { allocator.utilize(heap.region()) };

    stress(&allocator, |allocator, in_use| {
        let (validity, stats) = allocator.stats();
        if !validity.is_valid() {
            log::info!("Chunks: {}", allocator);
        }
        assert!(validity.is_valid(), "{:?}", validity);
        // Headers and padding cost something, never nothing.
        assert!(stats.size + in_use <= HEAP_SIZE);
    });

    let (_, stats) = allocator.stats();
    assert_eq!(stats.length, 1);
    assert_eq!(stats.size, HEAP_SIZE);
}

#[test]
fn test_stress_free_list() {
    let mut heap = ToyHeap::<HEAP_SIZE>::new();
    let allocator = FreeList::new();
    unsafe { allocator.utilize(heap.region()) };

    stress(&allocator, |allocator, in_use| {
        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid_unordered(), "{:?}", validity);
        let counters = allocator.counters();
        assert_eq!(counters.in_use, in_use);
        assert_eq!(
            counters.total_allocated - counters.total_deallocated,
            counters.in_use
        );
        assert!(stats.size + in_use <= counters.managed);
    });

    let (_, stats) = allocator.stats();
    assert_eq!(stats.length, 1);
    assert_eq!(stats.size, HEAP_SIZE);
}

#[test]
fn test_stress_pool() {
    let mut heap = ToyHeap::<HEAP_SIZE>::new();
    let pool = IntrusivePool::new(1024, PowerOfTwo::new(128).unwrap()).unwrap();
    unsafe { pool.utilize(heap.region()) };
    let capacity = pool.free_slots();
    assert_eq!(capacity, HEAP_SIZE / 1024);

    let mut rng = rng();
    let mut slots: Vec<View<u8>> = Vec::new();
    for _ in 0..ROUNDS {
        if rng.next_u32() % 2 == 0 {
            if let Some(slot) = pool.allocate(1 + rng.next_u32() as usize % 1024, PowerOfTwo::ONE)
            {
                assert!(slots.iter().all(|s| !s.overlaps(&slot)));
                slots.push(slot);
            } else {
                assert_eq!(slots.len(), capacity);
            }
        } else if !slots.is_empty() {
            let index = rng.next_u32() as usize % slots.len();
            let slot = slots.swap_remove(index);
            unsafe { pool.deallocate(slot) };
        }
        assert_eq!(pool.free_slots() + slots.len(), capacity);
    }

    for slot in slots.drain(..) {
        unsafe { pool.deallocate(slot) };
    }
    assert_eq!(pool.free_slots(), capacity);
}
