//! Errors for constructing resources.
//!
//! Running out of memory is not an error here: allocation returns `None`.

use core::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A pool object must be able to hold the free-list link.
    ObjectTooSmall { size: usize, min: usize },
    /// Rounding the object size up to its alignment overflowed.
    ObjectTooLarge { size: usize },
    NotPowerOfTwo(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ObjectTooSmall { size, min } => {
                write!(f, "object size {} is below the minimum of {}", size, min)
            }
            Error::ObjectTooLarge { size } => write!(f, "object size {} is too large", size),
            Error::NotPowerOfTwo(value) => write!(f, "{} is not a power of two", value),
        }
    }
}
