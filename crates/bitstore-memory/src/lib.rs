//! Growable shared memory-mapped file.
//!
//! A [`FileMap`] owns a backing file and a single read/write shared mapping
//! over it. Readers obtain short-lived [`Accessor`] handles that pin the base
//! pointer of the mapping; writers that may need more space obtain an
//! [`Allocator`] from [`FileMap::reserve`], which grows the file and the
//! mapping first and then lets the caller write into the reserved region
//! while further growth is blocked.
//!
//! Two sizes are tracked. The mapped size is the length of the mapping (a
//! multiple of the OS page size, grown in geometric steps). The logical size
//! is the authoritative data length; the file is truncated back to it on
//! [`FileMap::stop`].

mod access;
mod error;
mod map;

pub use access::{Accessor, Allocator};
pub use error::{Error, Result};
pub use map::{FileMap, EXPANSION_DENOMINATOR, EXPANSION_NUMERATOR};
