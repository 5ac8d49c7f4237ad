//! Per-object block bookkeeping.
//!
//! Every object lives in its own block. A block may carry a prefix in
//! front of the object address:
//!
//! ```text
//!  base                                 object address
//!   │                                        │
//!   ▼                                        ▼
//!   ┌──────────────┬─────────────────────────┬──────────────────────┐
//!   │ dict slot (8)│ collector head (16)     │ object body          │
//!   └──────────────┴─────────────────────────┴──────────────────────┘
//!     optional       optional                  requested ≤ usable
//! ```
//!
//! The dict slot only exists together with a collector head, so the slot
//! always sits at `object - 24` when present.

use std::alloc::Layout;
use std::ptr::NonNull;

/// Size of the attached-dictionary slot in bytes.
pub const DICT_SLOT_SIZE: usize = size_of::<usize>();

/// Size of the collector head in bytes.
pub const GC_HEAD_SIZE: usize = 2 * size_of::<usize>();

/// Alignment of every block.
pub const BLOCK_ALIGN: usize = 16;

/// Which optional prefix words precede an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct BlockPrefix {
    /// A collector head (`GcHead`) sits immediately before the object.
    pub gc_head: bool,
    /// An attached-dictionary pointer sits before the collector head.
    pub dict_slot: bool,
}

impl BlockPrefix {
    /// No prefix at all.
    pub const NONE: Self = Self {
        gc_head: false,
        dict_slot: false,
    };

    /// Collector head only.
    pub const GC: Self = Self {
        gc_head: true,
        dict_slot: false,
    };

    /// Collector head plus dictionary slot.
    pub const GC_WITH_DICT: Self = Self {
        gc_head: true,
        dict_slot: true,
    };

    /// Total prefix size in bytes.
    #[inline]
    pub const fn size(self) -> usize {
        let mut size = 0;
        if self.gc_head {
            size += GC_HEAD_SIZE;
        }
        if self.dict_slot {
            size += DICT_SLOT_SIZE;
        }
        size
    }

    /// Byte offset of the dictionary slot relative to the object address.
    #[inline]
    pub const fn dict_offset(self) -> Option<isize> {
        if self.dict_slot {
            Some(-((GC_HEAD_SIZE + DICT_SLOT_SIZE) as isize))
        } else {
            None
        }
    }
}

/// A live block tracked by the heap.
pub(crate) struct Block {
    /// Start of the underlying allocation (prefix included).
    pub base: NonNull<u8>,
    /// Layout passed to the system allocator.
    pub layout: Layout,
    pub prefix: BlockPrefix,
    /// Bytes the object currently claims.
    pub requested: usize,
    /// Bytes available for the object after rounding.
    pub usable: usize,
    /// Unique allocation number; never reused.
    pub serial: u64,
}

// Safety: a block is plain bookkeeping; the memory it names is only
// touched through the heap's own API or by callers holding a live object.
unsafe impl Send for Block {}

impl Block {
    #[inline]
    pub fn info(&self, addr: usize) -> BlockInfo {
        BlockInfo {
            addr,
            base: self.base.as_ptr() as usize,
            prefix: self.prefix,
            requested: self.requested,
            usable: self.usable,
            serial: self.serial,
        }
    }
}

/// Snapshot of a block's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Object address.
    pub addr: usize,
    /// Allocation start (prefix included).
    pub base: usize,
    /// Prefix words present before the object.
    pub prefix: BlockPrefix,
    /// Bytes the object currently claims.
    pub requested: usize,
    /// Bytes available for the object after allocator rounding.
    pub usable: usize,
    /// Allocation serial number.
    pub serial: u64,
}

impl BlockInfo {
    /// Address of the dictionary slot, if the block has one.
    #[inline]
    pub fn dict_slot_addr(&self) -> Option<usize> {
        self.prefix
            .dict_offset()
            .map(|off| self.addr.wrapping_add_signed(off))
    }

    /// Address of the collector head, if the block has one.
    #[inline]
    pub fn gc_head_addr(&self) -> Option<usize> {
        self.prefix.gc_head.then(|| self.addr - GC_HEAD_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_sizes() {
        assert_eq!(BlockPrefix::NONE.size(), 0);
        assert_eq!(BlockPrefix::GC.size(), 16);
        assert_eq!(BlockPrefix::GC_WITH_DICT.size(), 24);
    }

    #[test]
    fn test_dict_offset() {
        assert_eq!(BlockPrefix::NONE.dict_offset(), None);
        assert_eq!(BlockPrefix::GC.dict_offset(), None);
        assert_eq!(BlockPrefix::GC_WITH_DICT.dict_offset(), Some(-24));
    }

    #[test]
    fn test_info_prefix_addresses() {
        let info = BlockInfo {
            addr: 0x1000,
            base: 0x1000 - 24,
            prefix: BlockPrefix::GC_WITH_DICT,
            requested: 40,
            usable: 48,
            serial: 1,
        };
        assert_eq!(info.dict_slot_addr(), Some(0x1000 - 24));
        assert_eq!(info.gc_head_addr(), Some(0x1000 - 16));
    }
}
