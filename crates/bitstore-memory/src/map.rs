//! The growable memory-mapped file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};

use crate::access::{Accessor, Allocator};
use crate::error::{Error, Result};

const LOG_TARGET: &str = "bitstore::memory";

/// Growth slack applied by [`FileMap::reserve`]: the mapped size becomes
/// `required * EXPANSION_NUMERATOR / EXPANSION_DENOMINATOR`, rounded up to a
/// page boundary.
pub const EXPANSION_NUMERATOR: usize = 150;
/// Denominator of the expansion ratio. [`FileMap::resize`] uses it as the
/// numerator as well, growing with no slack.
pub const EXPANSION_DENOMINATOR: usize = 100;

/// A single backing file and its shared read/write memory mapping.
///
/// The inner lock is strictly remap-exclusion, not data-exclusion: bytes
/// inside the mapping may be concurrently written by many writers; only the
/// act of possibly relocating the base pointer is serialized. Accessors hold
/// the lock shared for their lifetime, a grower holds it exclusive across
/// ftruncate and remap.
pub struct FileMap {
    path: PathBuf,
    page_size: usize,
    logical_size: AtomicUsize,
    external: Option<Arc<Mutex<()>>>,
    inner: RwLock<MapInner>,
}

pub(crate) struct MapInner {
    file: Option<File>,
    map: Option<MmapMut>,
    size: usize,
    stopped: bool,
}

impl MapInner {
    pub(crate) fn base_ptr(&self) -> *mut u8 {
        let map = self.map.as_ref().expect("mapping is live while not stopped");
        map.as_ptr() as *mut u8
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    fn grow(&mut self, path: &Path, new_size: usize) -> Result<()> {
        tracing::debug!(target: LOG_TARGET, "Resizing: {} [{}]", path.display(), new_size);

        let file = self.file.as_ref().expect("file is open while not stopped");

        // Without mremap the old mapping must be torn down before the file
        // changes length.
        #[cfg(not(target_os = "linux"))]
        {
            self.map = None;
        }

        file.set_len(new_size as u64).map_err(|source| {
            tracing::error!(
                target: LOG_TARGET,
                "Failed to resize {}: {source}",
                path.display()
            );
            Error::Resize { size: new_size, source }
        })?;

        #[cfg(target_os = "linux")]
        {
            let map = self.map.as_mut().expect("mapping is live while not stopped");
            // SAFETY: the exclusive remap lock guarantees no accessor holds
            // the old base pointer while the mapping is relocated.
            unsafe { map.remap(new_size, memmap2::RemapOptions::new().may_move(true)) }.map_err(
                |source| {
                    tracing::error!(
                        target: LOG_TARGET,
                        "Failed to remap {}: {source}",
                        path.display()
                    );
                    Error::Map { context: "mremap", source }
                },
            )?;
        }

        #[cfg(not(target_os = "linux"))]
        {
            // SAFETY: the file is exclusively owned by this map and was just
            // extended to cover the mapped length.
            let map = unsafe { MmapOptions::new().len(new_size).map_mut(file) }.map_err(
                |source| {
                    tracing::error!(
                        target: LOG_TARGET,
                        "Failed to map {}: {source}",
                        path.display()
                    );
                    Error::Map { context: "mmap", source }
                },
            )?;
            self.map = Some(map);
        }

        self.size = new_size;
        Ok(())
    }
}

impl FileMap {
    /// Open an existing file read/write and map it shared.
    ///
    /// The mapped length is the file length rounded up to the OS page size
    /// (the file is extended to match); the logical size keeps the exact
    /// on-disk length. A zero-length file is a programmer error and aborts.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, None)
    }

    /// Same as [`FileMap::open`], additionally coordinating growth with an
    /// external mutex supplied by the embedding layer. The mutex is held
    /// only while the file is truncated and remapped.
    pub fn open_with(path: impl AsRef<Path>, external: Option<Arc<Mutex<()>>>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| {
                tracing::error!(
                    target: LOG_TARGET,
                    "Failed to open {}: {source}",
                    path.display()
                );
                Error::Io { context: "open", source }
            })?;

        let logical_size = file
            .metadata()
            .map_err(|source| Error::Io { context: "stat", source })?
            .len() as usize;
        assert!(logical_size > 0, "file size cannot be 0 bytes: {}", path.display());

        let page_size = page_size();
        let size = align_up(logical_size, page_size);
        if size > logical_size {
            file.set_len(size as u64)
                .map_err(|source| Error::Resize { size, source })?;
        }

        // SAFETY: the file is exclusively owned by this map for its whole
        // lifetime and covers the mapped length.
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file) }.map_err(|source| {
            tracing::error!(
                target: LOG_TARGET,
                "Failed to map {}: {source}",
                path.display()
            );
            Error::Map { context: "mmap", source }
        })?;

        if let Err(error) = map.advise(memmap2::Advice::Random) {
            tracing::error!(
                target: LOG_TARGET,
                "Failed to advise {}: {error}",
                path.display()
            );
        }

        tracing::debug!(
            target: LOG_TARGET,
            "Mapping: {} [{size}] ({page_size})",
            path.display()
        );

        Ok(Self {
            path,
            page_size,
            logical_size: AtomicUsize::new(logical_size),
            external,
            inner: RwLock::new(MapInner {
                file: Some(file),
                map: Some(map),
                size,
                stopped: false,
            }),
        })
    }

    /// Current mapped size (not the logical data length).
    pub fn size(&self) -> usize {
        self.inner.read().size
    }

    /// Authoritative data length; the file is truncated to it on stop.
    pub fn logical_size(&self) -> usize {
        self.logical_size.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> bool {
        self.inner.read().stopped
    }

    /// Pin the mapping and return a handle to its base pointer.
    ///
    /// Blocks only against an in-progress grow.
    pub fn access(&self) -> Accessor<'_> {
        let guard = self.inner.read();
        assert!(!guard.stopped, "file map accessed after stop");
        Accessor::new(guard)
    }

    /// Ensure the mapping covers `size` bytes, growing it with slack, and
    /// set the logical size to `size`.
    ///
    /// The returned [`Allocator`] pins the mapping like an accessor, so the
    /// caller can write into the reserved region while further grows are
    /// blocked. Only one allocator is live at a time.
    pub fn reserve(&self, size: usize) -> Result<Allocator<'_>> {
        self.allocate(size, EXPANSION_NUMERATOR)
    }

    /// Same as [`FileMap::reserve`] but with no growth slack.
    pub fn resize(&self, size: usize) -> Result<Allocator<'_>> {
        self.allocate(size, EXPANSION_DENOMINATOR)
    }

    fn allocate(&self, size: usize, expansion: usize) -> Result<Allocator<'_>> {
        // The upgradable position serializes allocators among themselves
        // while remaining concurrent with plain accessors.
        let mut guard = self.inner.upgradable_read();
        assert!(!guard.stopped, "file map accessed after stop");

        if size > guard.size {
            let new_size = align_up(size * expansion / EXPANSION_DENOMINATOR, self.page_size);
            let mut exclusive = RwLockUpgradableReadGuard::upgrade(guard);
            {
                // Critical section (conditional/external): lets the embedding
                // layer exclude sibling stores while the file moves.
                let _external = self.external.as_ref().map(|mutex| mutex.lock());
                exclusive.grow(&self.path, new_size)?;
            }
            guard = RwLockWriteGuard::downgrade_to_upgradable(exclusive);
        }

        self.logical_size.store(size, Ordering::SeqCst);
        Ok(Allocator::new(guard))
    }

    /// msync the logical region to disk.
    pub fn flush(&self) -> Result<()> {
        let guard = self.inner.read();
        assert!(!guard.stopped, "file map accessed after stop");
        let map = guard.map.as_ref().expect("mapping is live while not stopped");
        map.flush_range(0, self.logical_size())
            .map_err(|source| Error::Map { context: "msync", source })
    }

    /// Idempotent shutdown: msync, munmap, truncate the file to the logical
    /// size, fsync, close. The first failing step is logged and ends the
    /// sequence, returning `false`. After stop only `stop`, `size`,
    /// `logical_size` and `stopped` remain defined.
    pub fn stop(&self) -> bool {
        let mut guard = self.inner.write();
        if guard.stopped {
            return true;
        }
        guard.stopped = true;

        let logical_size = self.logical_size();
        tracing::debug!(
            target: LOG_TARGET,
            "Unmapping: {} [{logical_size}]",
            self.path.display()
        );

        if let Some(map) = guard.map.take() {
            if let Err(error) = map.flush_range(0, logical_size) {
                return self.handle_error("msync", error);
            }
            drop(map);
        }

        let Some(file) = guard.file.take() else {
            return false;
        };
        if let Err(error) = file.set_len(logical_size as u64) {
            return self.handle_error("ftruncate", error);
        }
        if let Err(error) = file.sync_all() {
            return self.handle_error("fsync", error);
        }
        drop(file);

        true
    }

    fn handle_error(&self, context: &str, error: std::io::Error) -> bool {
        tracing::error!(
            target: LOG_TARGET,
            "The file failed to {context}: {}: {error}",
            self.path.display()
        );
        false
    }
}

impl Drop for FileMap {
    fn drop(&mut self) {
        self.stop();
    }
}

fn align_up(value: usize, page_size: usize) -> usize {
    value.div_ceil(page_size) * page_size
}

fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    assert!(size > 0, "page size must be positive");
    size as usize
}
