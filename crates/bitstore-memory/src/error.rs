//! Error types for the memory-mapped file.

/// Errors that can occur while operating the memory-mapped file.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File open, stat, extend, fsync or close failure.
    #[error("file {context} failed: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// mmap, mremap or msync failure. The mapping may be left unusable;
    /// callers are expected to stop the map and shut down.
    #[error("memory map {context} failed: {source}")]
    Map {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// ftruncate failure while growing the file, typically disk exhaustion.
    /// Surfaced from [`crate::FileMap::reserve`] because callers cannot
    /// proceed without the reserved space.
    #[error("failed to grow file to {size} bytes: {source}")]
    Resize {
        size: usize,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
