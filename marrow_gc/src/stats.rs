//! Heap statistics.
//!
//! Tracks allocation volume and live usage. The inspection layer reports
//! the live figures alongside every transplant.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about heap activity.
#[derive(Debug)]
pub struct HeapStats {
    // =========================================================================
    // Allocation Statistics
    // =========================================================================
    /// Total bytes allocated since start (after rounding).
    pub bytes_allocated: AtomicU64,
    /// Total objects allocated since start.
    pub objects_allocated: AtomicU64,

    // =========================================================================
    // Release Statistics
    // =========================================================================
    /// Total bytes released since start.
    pub bytes_released: AtomicU64,
    /// Total objects released since start.
    pub objects_released: AtomicU64,
}

impl HeapStats {
    /// Create new empty statistics.
    pub const fn new() -> Self {
        Self {
            bytes_allocated: AtomicU64::new(0),
            objects_allocated: AtomicU64::new(0),
            bytes_released: AtomicU64::new(0),
            objects_released: AtomicU64::new(0),
        }
    }

    /// Record an allocation.
    #[inline]
    pub fn record_allocation(&self, size: usize) {
        self.bytes_allocated
            .fetch_add(size as u64, Ordering::Relaxed);
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a release.
    #[inline]
    pub fn record_release(&self, size: usize) {
        self.bytes_released
            .fetch_add(size as u64, Ordering::Relaxed);
        self.objects_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes currently held by live objects.
    pub fn live_bytes(&self) -> u64 {
        self.bytes_allocated
            .load(Ordering::Relaxed)
            .saturating_sub(self.bytes_released.load(Ordering::Relaxed))
    }

    /// Objects currently live.
    pub fn live_objects(&self) -> u64 {
        self.objects_allocated
            .load(Ordering::Relaxed)
            .saturating_sub(self.objects_released.load(Ordering::Relaxed))
    }
}

impl Default for HeapStats {
    fn default() -> Self {
        Self::new()
    }
}
