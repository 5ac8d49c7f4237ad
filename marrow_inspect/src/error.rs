//! Error types for record inspection.

use crate::config::ConfigError;

use marrow_gc::HeapError;
use marrow_runtime::{RuntimeError, SlotSignature};
use thiserror::Error;

/// Malformed field declarations, reported when a layout is finalized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    /// A layout declares a second open array.
    #[error("layout '{layout}' declares a second open array '{field}'")]
    DuplicateOpenArray { layout: String, field: String },

    /// A field follows the open array.
    #[error("layout '{layout}': field '{field}' follows the open array")]
    OpenArrayNotLast { layout: String, field: String },

    /// A field name is declared twice, possibly across base and derived layouts.
    #[error("layout '{layout}' declares '{field}' twice")]
    DuplicateField { layout: String, field: String },

    /// An explicit offset does not satisfy the field's alignment.
    #[error("field '{field}' at offset {offset} is not aligned to {align}")]
    Misaligned {
        field: String,
        offset: usize,
        align: usize,
    },

    /// An explicit offset would overlap earlier fields.
    #[error("field '{field}' at offset {offset} overlaps fields ending at {cursor}")]
    OffsetBackwards {
        field: String,
        offset: usize,
        cursor: usize,
    },

    /// A record alignment that is not a power of two.
    #[error("alignment {0} is not a power of two")]
    BadAlignment(usize),

    /// An open array takes its length from a field that does not exist.
    #[error("open array '{field}' takes its length from unknown field '{source_field}'")]
    UnknownLengthSource { field: String, source_field: String },

    /// A bit-field width of zero, wider than its backing integer, or on a
    /// non-integer backing type.
    #[error("bit-field '{field}' of {bits} bits does not fit its backing type")]
    InvalidBitWidth { field: String, bits: u32 },
}

/// Errors raised by records, views and the move and patch engines.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InspectError {
    /// An unsafe operation outside any capability scope.
    #[error("{0} requires an unsafe context")]
    Capability(String),

    /// A write or move that does not fit the memory available for it.
    #[error("{needed} bytes do not fit in {available} available bytes")]
    OutOfBounds { needed: usize, available: usize },

    /// A non-collector object moved into a collector-tracked one.
    #[error("move of non-gc type '{src}' into gc type '{dst}' requires an unsafe context")]
    GcIncompatible { src: String, dst: String },

    /// An instance dictionary that cannot follow the object it belongs to.
    #[error("instance dict cannot be relocated: {0}")]
    AttachedTable(String),

    /// Access through a view after `drop_ref`.
    #[error("view has been dropped")]
    Dropped,

    /// The view's only lifetime source was a weak reference that died.
    #[error("weak reference to the viewed object has expired")]
    WeakExpired,

    /// The view holds neither a strong nor a weak reference.
    #[error("view holds no reference to its object; enter an unsafe context to reconstruct it")]
    NoReference,

    /// No field of that name in the record's layout.
    #[error("record '{record}' has no field '{field}'")]
    UnknownField { record: String, field: String },

    /// The field may be read but never written.
    #[error("field '{0}' is read-only")]
    ReadOnlyField(String),

    /// A value that cannot be stored in the field.
    #[error("value {value} does not fit field '{field}'")]
    ValueRange { field: String, value: String },

    /// The object is not of the kind an operation expects.
    #[error("expected {expected}, got {found}")]
    KindMismatch { expected: String, found: String },

    /// The name does not map to a protocol slot.
    #[error("'{0}' is not a protocol slot")]
    UnknownSlot(String),

    /// A raw slot function whose shape does not match the slot.
    #[error("slot '{slot}' takes a {expected:?} function, got {found:?}")]
    SlotSignature {
        slot: String,
        expected: SlotSignature,
        found: SlotSignature,
    },

    /// Restore of a name that was never patched.
    #[error("'{name}' of type '{type_name}' has not been patched")]
    NotPatched { type_name: String, name: String },

    /// The address no longer denotes a live object.
    #[error("no live object at {0:#x}")]
    Dangling(usize),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Heap(#[from] HeapError),
}

impl InspectError {
    /// Capability error for `what`.
    #[inline]
    pub fn capability(what: impl Into<String>) -> Self {
        Self::Capability(what.into())
    }

    /// Whether entering a capability scope would let the operation proceed.
    pub fn is_unsafe_gate(&self) -> bool {
        matches!(
            self,
            Self::Capability(_) | Self::GcIncompatible { .. } | Self::AttachedTable(_) | Self::NoReference
        )
    }
}

/// Result type for inspection operations.
pub type Result<T> = std::result::Result<T, InspectError>;
