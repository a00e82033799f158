//! Short-lived handles pinning the mapping.

use parking_lot::{RwLockReadGuard, RwLockUpgradableReadGuard};

use crate::map::MapInner;

/// A live borrow of the mapping's base pointer.
///
/// Holds the remap-exclusion lock shared for its lifetime, so the base
/// pointer cannot move while the accessor exists. Record bytes reached
/// through it may still be concurrently written; callers serialize such
/// writes with their own narrower locks.
pub struct Accessor<'a> {
    guard: RwLockReadGuard<'a, MapInner>,
    ptr: *mut u8,
}

impl<'a> Accessor<'a> {
    pub(crate) fn new(guard: RwLockReadGuard<'a, MapInner>) -> Self {
        let ptr = guard.base_ptr();
        Self { guard, ptr }
    }

    /// Base pointer of the mapping, stable for the accessor's lifetime.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Mapped length reachable from the base pointer.
    pub fn len(&self) -> usize {
        self.guard.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A transient write handle over a freshly reserved region.
///
/// Produced by a reservation that may have grown the mapping; holds the
/// upgradable lock position, so further grows are blocked until it drops
/// while plain accessors proceed concurrently.
pub struct Allocator<'a> {
    guard: RwLockUpgradableReadGuard<'a, MapInner>,
    ptr: *mut u8,
}

impl<'a> Allocator<'a> {
    pub(crate) fn new(guard: RwLockUpgradableReadGuard<'a, MapInner>) -> Self {
        let ptr = guard.base_ptr();
        Self { guard, ptr }
    }

    /// Base pointer of the mapping, stable for the allocator's lifetime.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Mapped length reachable from the base pointer.
    pub fn len(&self) -> usize {
        self.guard.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
