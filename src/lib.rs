#![no_std]

//! Intrusive, alignment-aware memory resources for freestanding code.
//!
//! Every allocator here manages memory it is given through
//! [`MemoryResource::utilize_bytes`], and keeps its bookkeeping inside the
//! free memory itself:
//!
//! - [`IntrusivePool`]: fixed-size slots, O(1) allocation.
//! - [`IntrusiveChainFirstFit`]: variable sizes, address-ordered first fit.
//! - [`FreeList`]: variable sizes, best fit, with byte counters.
//!
//! Decorators wrap a resource and expose the same interface:
//! [`AtomicResource`] (spin lock), [`TracingResource`] (one line per call),
//! [`NullResource`] (no memory) and [`MemoryEconomy`] (a broker between
//! resources). [`Arc`] allocates a reference-counted value from any resource,
//! and [`GlobalResource`] serves `#[global_allocator]` from one.
//!
//! The library does not log on its own; install a logger to see the `log`
//! output.

#[cfg(test)]
extern crate std;

pub mod arc;
pub mod chunk;
pub mod decorators;
pub mod economy;
pub mod error;
pub mod first_fit;
pub mod free_list;
pub mod global;
pub mod node;
pub mod num;
pub mod pool;
pub mod region;
pub mod resource;
pub mod view;

pub use crate::arc::{Arc, Disowned};
pub use crate::decorators::{AtomicResource, NullResource, TracingResource, NULL_RESOURCE};
pub use crate::economy::{AtomicMemoryEconomy, MemoryEconomy, Member};
pub use crate::error::Error;
pub use crate::first_fit::IntrusiveChainFirstFit;
pub use crate::free_list::{FreeList, FreeListStats};
pub use crate::global::GlobalResource;
pub use crate::num::{ClampLeast, Least, PowerOfTwo};
pub use crate::pool::IntrusivePool;
#[cfg(feature = "use_libc")]
pub use crate::region::LibcPages;
pub use crate::region::{RegionSource, ToyHeap, ToyHeapOverflowError};
pub use crate::resource::{Leftovers, MemoryResource, ResourceExt};
pub use crate::view::View;
