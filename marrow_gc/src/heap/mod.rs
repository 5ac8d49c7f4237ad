//! The object heap.
//!
//! Objects are allocated individually from the system allocator and
//! registered by address. The registry is the ground truth for three
//! questions the rest of the system keeps asking:
//!
//! - is this address a live object? ([`ObjectHeap::contains`])
//! - how many bytes does it claim, and how many could it claim?
//!   ([`BlockInfo::requested`], [`BlockInfo::usable`])
//! - which prefix words sit in front of it? ([`BlockInfo::prefix`])
//!
//! Every allocation receives a serial number that is never reused, so an
//! `(address, serial)` pair identifies one object even after its address is
//! recycled.

mod block;

pub use block::{BLOCK_ALIGN, BlockInfo, BlockPrefix, DICT_SLOT_SIZE, GC_HEAD_SIZE};

use block::Block;

use crate::config::{ConfigError, HeapConfig, POISON_BYTE};
use crate::stats::HeapStats;
use crate::{HeapError, Result};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Registry of every live object block.
pub struct ObjectHeap {
    /// Configuration parameters.
    config: HeapConfig,
    /// Map from object address to block metadata.
    blocks: Mutex<FxHashMap<usize, Block>>,
    /// Next allocation serial.
    next_serial: AtomicU64,
    /// Allocation statistics.
    stats: HeapStats,
}

impl ObjectHeap {
    /// Create a new heap with the given configuration.
    pub fn new(config: HeapConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            blocks: Mutex::new(FxHashMap::default()),
            next_serial: AtomicU64::new(1),
            stats: HeapStats::new(),
        })
    }

    /// Heap configuration.
    #[inline]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Allocation statistics.
    #[inline]
    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    /// Allocate a zeroed object body of `size` bytes behind `prefix`.
    ///
    /// Returns the object address (past the prefix).
    pub fn allocate(&self, size: usize, prefix: BlockPrefix) -> Result<NonNull<u8>> {
        if size > self.config.max_object_size {
            return Err(HeapError::TooLarge {
                size,
                max: self.config.max_object_size,
            });
        }
        let usable = self.config.round(size);
        let layout = Layout::from_size_align(prefix.size() + usable, BLOCK_ALIGN)
            .map_err(|_| HeapError::InvalidSize(size))?;

        // Safety: layout has a non-zero size.
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        let base = NonNull::new(base).ok_or(HeapError::OutOfMemory(size))?;

        // Safety: the prefix lies within the allocation.
        let obj = unsafe { NonNull::new_unchecked(base.as_ptr().add(prefix.size())) };
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);

        self.blocks.lock().insert(
            obj.as_ptr() as usize,
            Block {
                base,
                layout,
                prefix,
                requested: size,
                usable,
                serial,
            },
        );
        self.stats.record_allocation(usable);

        if self.config.trace {
            tracing::trace!(
                addr = format_args!("{:#x}", obj.as_ptr() as usize),
                size,
                usable,
                serial,
                "heap allocate"
            );
        }
        Ok(obj)
    }

    /// Return an object's block to the system allocator.
    ///
    /// # Safety
    ///
    /// `addr` must not be used again after this call. Any prefix words must
    /// already be unlinked from whatever structure references them.
    pub unsafe fn release(&self, addr: usize) -> Result<()> {
        let block = self
            .blocks
            .lock()
            .remove(&addr)
            .ok_or(HeapError::UnknownBlock(addr))?;

        if self.config.poison_on_free {
            // Safety: the block is ours and still allocated.
            unsafe { std::ptr::write_bytes(block.base.as_ptr(), POISON_BYTE, block.layout.size()) };
        }
        // Safety: base/layout are exactly what `allocate` used.
        unsafe { std::alloc::dealloc(block.base.as_ptr(), block.layout) };
        self.stats.record_release(block.usable);

        if self.config.trace {
            tracing::trace!(
                addr = format_args!("{addr:#x}"),
                serial = block.serial,
                "heap release"
            );
        }
        Ok(())
    }

    /// Check whether `addr` is the address of a live object.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.blocks.lock().contains_key(&addr)
    }

    /// Bookkeeping snapshot for the object at `addr`.
    #[inline]
    pub fn block(&self, addr: usize) -> Option<BlockInfo> {
        self.blocks.lock().get(&addr).map(|b| b.info(addr))
    }

    /// Bytes available to the object at `addr` after rounding.
    #[inline]
    pub fn usable_size(&self, addr: usize) -> Option<usize> {
        self.blocks.lock().get(&addr).map(|b| b.usable)
    }

    /// Bytes the object at `addr` currently claims.
    #[inline]
    pub fn requested_size(&self, addr: usize) -> Option<usize> {
        self.blocks.lock().get(&addr).map(|b| b.requested)
    }

    /// Allocation serial of the object at `addr`.
    #[inline]
    pub fn serial(&self, addr: usize) -> Option<u64> {
        self.blocks.lock().get(&addr).map(|b| b.serial)
    }

    /// Record that the object at `addr` now claims `size` bytes.
    ///
    /// Used after an object body has been rewritten in place. The new size
    /// must still fit in the block.
    pub fn set_requested(&self, addr: usize, size: usize) -> Result<()> {
        let mut blocks = self.blocks.lock();
        let block = blocks.get_mut(&addr).ok_or(HeapError::UnknownBlock(addr))?;
        if size > block.usable {
            return Err(HeapError::ExceedsBlock {
                size,
                usable: block.usable,
            });
        }
        block.requested = size;
        Ok(())
    }

    /// Number of live blocks.
    pub fn live_blocks(&self) -> usize {
        self.blocks.lock().len()
    }
}

// =============================================================================
// Global Heap Access
// =============================================================================

static GLOBAL_HEAP: OnceLock<ObjectHeap> = OnceLock::new();

/// Get the process-wide object heap.
pub fn heap() -> &'static ObjectHeap {
    GLOBAL_HEAP
        .get_or_init(|| ObjectHeap::new(HeapConfig::default()).expect("default heap config is valid"))
}

/// Install a custom configuration for the process-wide heap.
///
/// Must be called before the first allocation. Returns the configuration
/// back if the heap already exists.
pub fn init_heap(config: HeapConfig) -> std::result::Result<(), HeapConfig> {
    if config.validate().is_err() {
        return Err(config);
    }
    let mut pending = Some(config);
    GLOBAL_HEAP.get_or_init(|| {
        let config = pending.take().unwrap_or_default();
        ObjectHeap::new(config).expect("config validated above")
    });
    match pending {
        Some(config) => Err(config),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_heap() -> ObjectHeap {
        ObjectHeap::new(HeapConfig::default()).expect("valid config")
    }

    #[test]
    fn test_allocate_rounds_to_granule() {
        let heap = test_heap();
        let obj = heap.allocate(41, BlockPrefix::NONE).expect("alloc failed");
        let info = heap.block(obj.as_ptr() as usize).expect("block missing");
        assert_eq!(info.requested, 41);
        assert_eq!(info.usable, 48);
        assert_eq!(info.prefix, BlockPrefix::NONE);
        unsafe { heap.release(info.addr).expect("release failed") };
    }

    #[test]
    fn test_allocate_zeroed_with_prefix() {
        let heap = test_heap();
        let obj = heap.allocate(32, BlockPrefix::GC_WITH_DICT).expect("alloc failed");
        let addr = obj.as_ptr() as usize;
        let info = heap.block(addr).expect("block missing");
        assert_eq!(addr - info.base, 24);
        let bytes = unsafe { std::slice::from_raw_parts((addr - 24) as *const u8, 24 + 32) };
        assert!(bytes.iter().all(|b| *b == 0));
        unsafe { heap.release(addr).expect("release failed") };
    }

    #[test]
    fn test_release_unknown_block() {
        let heap = test_heap();
        let err = unsafe { heap.release(0xdead0) }.unwrap_err();
        assert_eq!(err, HeapError::UnknownBlock(0xdead0));
    }

    #[test]
    fn test_serials_are_unique() {
        let heap = test_heap();
        let a = heap.allocate(16, BlockPrefix::NONE).expect("alloc failed").as_ptr() as usize;
        let b = heap.allocate(16, BlockPrefix::NONE).expect("alloc failed").as_ptr() as usize;
        assert_ne!(heap.serial(a), heap.serial(b));
        unsafe {
            heap.release(a).expect("release failed");
            heap.release(b).expect("release failed");
        }
        assert!(!heap.contains(a));
        assert_eq!(heap.live_blocks(), 0);
    }

    #[test]
    fn test_set_requested_bounded_by_usable() {
        let heap = test_heap();
        let addr = heap.allocate(20, BlockPrefix::NONE).expect("alloc failed").as_ptr() as usize;
        heap.set_requested(addr, 32).expect("fits");
        assert_eq!(heap.requested_size(addr), Some(32));
        assert_eq!(
            heap.set_requested(addr, 33),
            Err(HeapError::ExceedsBlock {
                size: 33,
                usable: 32
            })
        );
        unsafe { heap.release(addr).expect("release failed") };
    }

    #[test]
    fn test_too_large() {
        let heap = ObjectHeap::new(HeapConfig {
            max_object_size: 64,
            ..Default::default()
        })
        .expect("valid config");
        assert_eq!(
            heap.allocate(65, BlockPrefix::NONE).unwrap_err(),
            HeapError::TooLarge { size: 65, max: 64 }
        );
    }
}
