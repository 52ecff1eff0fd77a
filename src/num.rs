//! Numeric wrappers that enforce their invariant at construction.
//!
//! Allocators take these instead of bare `usize` so that "alignment is a power
//! of two" and "size meets a minimum" are checked once, at the edge.

use core::fmt;
use core::num::NonZeroUsize;

/// A non-zero power of two, typically an alignment.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PowerOfTwo(NonZeroUsize);

impl PowerOfTwo {
    pub const ONE: PowerOfTwo = PowerOfTwo::of::<u8>();

    /// Returns `None` if `value` is zero or not a power of two.
    pub const fn new(value: usize) -> Option<PowerOfTwo> {
        if value.is_power_of_two() {
            // SAFETY: zero is not a power of two.
            Some(PowerOfTwo(unsafe { NonZeroUsize::new_unchecked(value) }))
        } else {
            None
        }
    }

    /// The alignment of `T`.
    pub const fn of<T>() -> PowerOfTwo {
        // SAFETY: alignments are always non-zero powers of two.
        PowerOfTwo(unsafe { NonZeroUsize::new_unchecked(core::mem::align_of::<T>()) })
    }

    pub const fn get(self) -> usize {
        self.0.get()
    }

    pub const fn mask(self) -> usize {
        self.get() - 1
    }

    pub const fn is_aligned(self, value: usize) -> bool {
        value & self.mask() == 0
    }

    /// Round `value` up to the next multiple of this power of two, or `None`
    /// on overflow.
    pub const fn align_up(self, value: usize) -> Option<usize> {
        match value.checked_add(self.mask()) {
            Some(v) => Some(v & !self.mask()),
            None => None,
        }
    }

    pub const fn align_down(self, value: usize) -> usize {
        value & !self.mask()
    }

    pub fn max(self, other: PowerOfTwo) -> PowerOfTwo {
        core::cmp::max(self, other)
    }
}

impl fmt::Display for PowerOfTwo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

impl From<PowerOfTwo> for usize {
    fn from(p: PowerOfTwo) -> usize {
        p.get()
    }
}

/// A `usize` that is at least `MIN`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Least<const MIN: usize>(usize);

impl<const MIN: usize> Least<MIN> {
    pub const fn new(value: usize) -> Option<Self> {
        if value >= MIN {
            Some(Least(value))
        } else {
            None
        }
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

/// A `usize` raised to at least `MIN`. Unlike [`Least`], construction never
/// fails.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClampLeast<const MIN: usize>(usize);

impl<const MIN: usize> ClampLeast<MIN> {
    pub const fn new(value: usize) -> Self {
        if value >= MIN {
            ClampLeast(value)
        } else {
            ClampLeast(MIN)
        }
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

impl<const MIN: usize> From<Least<MIN>> for ClampLeast<MIN> {
    fn from(l: Least<MIN>) -> Self {
        ClampLeast(l.0)
    }
}
