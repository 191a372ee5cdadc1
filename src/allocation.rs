//! Allocation callback plumbing
//!
//! Vulkan lets applications supply `VkAllocationCallbacks`; the loader must
//! route every loader-owned heap allocation on create/enumerate paths
//! through them so that a custom allocator observes symmetric alloc/free
//! counts, including when a call fails part way through. The callbacks are
//! modeled by the [`Allocator`] trait; [`ScopedAllocations`] is the unwind
//! guard that frees everything staged by a partially-completed operation
//! unless it is committed.
//!
//! The loader serializes its own calls into a given allocator per
//! operation, but operations may run on different threads; implementations
//! shared across threads must be internally synchronized.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{LoaderError, Result};

/// Allocation scope, mirroring `VkSystemAllocationScope`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationScope {
    Command,
    Object,
    Cache,
    Device,
    Instance,
}

/// A live loader-owned allocation. Must be returned to the same allocator.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Allocation {
    id: u64,
    size: usize,
    scope: AllocationScope,
}

impl Allocation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn scope(&self) -> AllocationScope {
        self.scope
    }
}

/// Application-supplied allocation callbacks.
pub trait Allocator: Send + Sync {
    /// Stage one loader-owned allocation. Returning an error propagates as
    /// `VK_ERROR_OUT_OF_HOST_MEMORY` after the operation unwinds.
    fn allocate(&self, size: usize, scope: AllocationScope) -> Result<Allocation>;

    fn free(&self, allocation: Allocation);
}

/// Default allocator: hands out tokens, never fails.
#[derive(Debug, Default)]
pub struct SystemAllocator {
    next_id: AtomicU64,
}

impl Allocator for SystemAllocator {
    fn allocate(&self, size: usize, scope: AllocationScope) -> Result<Allocation> {
        Ok(Allocation {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            size,
            scope,
        })
    }

    fn free(&self, _allocation: Allocation) {}
}

/// Allocator that tracks outstanding allocations and can inject a failure
/// at a chosen allocation index, for exercising unwind paths.
#[derive(Debug, Default)]
pub struct TrackingAllocator {
    next_id: AtomicU64,
    calls: AtomicU64,
    fail_at: Mutex<Option<u64>>,
    outstanding: Mutex<HashMap<u64, (usize, AllocationScope)>>,
}

impl TrackingAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the `index`-th allocation call (0-based) and every later one.
    pub fn fail_on_call(&self, index: u64) {
        *self.fail_at.lock() = Some(index);
    }

    pub fn clear_failure(&self) {
        *self.fail_at.lock() = None;
    }

    /// Number of allocations not yet freed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Total allocation calls observed, successful or not.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Allocator for TrackingAllocator {
    fn allocate(&self, size: usize, scope: AllocationScope) -> Result<Allocation> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(fail_at) = *self.fail_at.lock() {
            if call >= fail_at {
                return Err(LoaderError::OutOfHostMemory);
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.outstanding.lock().insert(id, (size, scope));
        Ok(Allocation { id, size, scope })
    }

    fn free(&self, allocation: Allocation) {
        let removed = self.outstanding.lock().remove(&allocation.id);
        debug_assert!(removed.is_some(), "double free of loader allocation");
    }
}

/// Unwind guard for staged allocations.
///
/// Collects every allocation an operation makes; on drop, frees them all
/// unless [`commit`](ScopedAllocations::commit) transferred ownership to
/// the object that survived the operation.
pub struct ScopedAllocations {
    allocator: Arc<dyn Allocator>,
    staged: Vec<Allocation>,
    committed: bool,
}

impl ScopedAllocations {
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        Self {
            allocator,
            staged: Vec::new(),
            committed: false,
        }
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// Stage one allocation; fails without leaking anything staged so far
    /// (the guard still owns it).
    pub fn allocate(&mut self, size: usize, scope: AllocationScope) -> Result<()> {
        let allocation = self.allocator.allocate(size, scope)?;
        self.staged.push(allocation);
        Ok(())
    }

    /// Keep the staged allocations alive past the guard; the returned set
    /// must eventually be released with [`release_all`].
    pub fn commit(mut self) -> CommittedAllocations {
        self.committed = true;
        CommittedAllocations {
            allocator: Arc::clone(&self.allocator),
            allocations: std::mem::take(&mut self.staged),
        }
    }
}

impl Drop for ScopedAllocations {
    fn drop(&mut self) {
        if !self.committed {
            for allocation in self.staged.drain(..) {
                self.allocator.free(allocation);
            }
        }
    }
}

/// Allocations owned by a live loader object (instance or device).
pub struct CommittedAllocations {
    allocator: Arc<dyn Allocator>,
    allocations: Vec<Allocation>,
}

impl CommittedAllocations {
    pub fn release_all(&mut self) {
        for allocation in self.allocations.drain(..) {
            self.allocator.free(allocation);
        }
    }
}

impl Drop for CommittedAllocations {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_unwind_frees_everything() {
        let tracker = TrackingAllocator::new();
        {
            let mut scope = ScopedAllocations::new(tracker.clone() as Arc<dyn Allocator>);
            scope.allocate(64, AllocationScope::Instance).unwrap();
            scope.allocate(32, AllocationScope::Command).unwrap();
            assert_eq!(tracker.outstanding(), 2);
        }
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_commit_keeps_allocations() {
        let tracker = TrackingAllocator::new();
        let committed = {
            let mut scope = ScopedAllocations::new(tracker.clone() as Arc<dyn Allocator>);
            scope.allocate(64, AllocationScope::Instance).unwrap();
            scope.commit()
        };
        assert_eq!(tracker.outstanding(), 1);
        drop(committed);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_failure_injection() {
        let tracker = TrackingAllocator::new();
        tracker.fail_on_call(1);
        let mut scope = ScopedAllocations::new(tracker.clone() as Arc<dyn Allocator>);
        scope.allocate(16, AllocationScope::Object).unwrap();
        assert!(scope.allocate(16, AllocationScope::Object).is_err());
        drop(scope);
        assert_eq!(tracker.outstanding(), 0);
    }
}
