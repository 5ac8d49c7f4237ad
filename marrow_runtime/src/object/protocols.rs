//! Protocol slot tables.
//!
//! Operator behaviour beyond the main slots is grouped into four optional
//! tables. A type whose table pointer is null simply does not support any
//! operation of that protocol.

use crate::object::type_obj::{
    BinaryFunc, InquiryFunc, LenFunc, ObjObjArgProc, ObjObjProc, SizeArgFunc, SizeObjArgProc,
    TypeObject, UnaryFunc,
};

use std::fmt;
use std::str::FromStr;

/// Numeric operations.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NumberMethods {
    pub nb_add: Option<BinaryFunc>,
    pub nb_subtract: Option<BinaryFunc>,
    pub nb_multiply: Option<BinaryFunc>,
    pub nb_remainder: Option<BinaryFunc>,
    pub nb_negative: Option<UnaryFunc>,
    pub nb_positive: Option<UnaryFunc>,
    pub nb_absolute: Option<UnaryFunc>,
    pub nb_bool: Option<InquiryFunc>,
    pub nb_invert: Option<UnaryFunc>,
    pub nb_int: Option<UnaryFunc>,
    pub nb_float: Option<UnaryFunc>,
    pub nb_floor_divide: Option<BinaryFunc>,
    pub nb_true_divide: Option<BinaryFunc>,
    pub nb_matrix_multiply: Option<BinaryFunc>,
}

/// Sequence operations.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceMethods {
    pub sq_length: Option<LenFunc>,
    pub sq_concat: Option<BinaryFunc>,
    pub sq_item: Option<SizeArgFunc>,
    pub sq_ass_item: Option<SizeObjArgProc>,
    pub sq_contains: Option<ObjObjProc>,
}

/// Mapping operations.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MappingMethods {
    pub mp_length: Option<LenFunc>,
    pub mp_subscript: Option<BinaryFunc>,
    pub mp_ass_subscript: Option<ObjObjArgProc>,
}

/// Awaitable and async-iterator operations.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncMethods {
    pub am_await: Option<UnaryFunc>,
    pub am_aiter: Option<UnaryFunc>,
    pub am_anext: Option<UnaryFunc>,
}

/// A group of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// Slots stored directly in the type object.
    Main,
    /// [`NumberMethods`]
    Number,
    /// [`SequenceMethods`]
    Sequence,
    /// [`MappingMethods`]
    Mapping,
    /// [`AsyncMethods`]
    Async,
}

impl Protocol {
    /// Protocols stored in separately allocated tables.
    pub const TABLES: [Protocol; 4] = [
        Protocol::Number,
        Protocol::Sequence,
        Protocol::Mapping,
        Protocol::Async,
    ];

    /// Name of the field in [`TypeObject`] that points at this table.
    pub const fn field_name(self) -> &'static str {
        match self {
            Protocol::Main => "ob_type",
            Protocol::Number => "tp_as_number",
            Protocol::Sequence => "tp_as_sequence",
            Protocol::Mapping => "tp_as_mapping",
            Protocol::Async => "tp_as_async",
        }
    }

    /// Size of the table in bytes.
    pub const fn table_size(self) -> usize {
        match self {
            Protocol::Main => size_of::<TypeObject>(),
            Protocol::Number => size_of::<NumberMethods>(),
            Protocol::Sequence => size_of::<SequenceMethods>(),
            Protocol::Mapping => size_of::<MappingMethods>(),
            Protocol::Async => size_of::<AsyncMethods>(),
        }
    }

    /// Number of slots in the table.
    pub const fn slot_count(self) -> usize {
        self.table_size() / size_of::<usize>()
    }

    /// Lower-case protocol name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Main => "main",
            Protocol::Number => "number",
            Protocol::Sequence => "sequence",
            Protocol::Mapping => "mapping",
            Protocol::Async => "async",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a protocol name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown protocol {0:?}")]
pub struct UnknownProtocol(pub String);

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" | "type" => Ok(Protocol::Main),
            "number" | "numeric" => Ok(Protocol::Number),
            "sequence" => Ok(Protocol::Sequence),
            "mapping" => Ok(Protocol::Mapping),
            "async" => Ok(Protocol::Async),
            other => Err(UnknownProtocol(other.to_owned())),
        }
    }
}

// =============================================================================
// Table Allocation
// =============================================================================

/// Allocate a zeroed table for `protocol`.
///
/// Returns null for [`Protocol::Main`], which has no separate table.
pub fn alloc_protocol_table(protocol: Protocol) -> *mut u8 {
    match protocol {
        Protocol::Main => std::ptr::null_mut(),
        Protocol::Number => Box::into_raw(Box::<NumberMethods>::default()).cast(),
        Protocol::Sequence => Box::into_raw(Box::<SequenceMethods>::default()).cast(),
        Protocol::Mapping => Box::into_raw(Box::<MappingMethods>::default()).cast(),
        Protocol::Async => Box::into_raw(Box::<AsyncMethods>::default()).cast(),
    }
}

/// Free a table returned by [`alloc_protocol_table`] (or a copy made by
/// [`clone_protocol_table`]).
///
/// # Safety
///
/// `table` must be null or come from one of those functions with the same
/// protocol, and must not be used afterwards.
pub unsafe fn free_protocol_table(protocol: Protocol, table: *mut u8) {
    if table.is_null() {
        return;
    }
    // Safety: caller guarantees provenance.
    unsafe {
        match protocol {
            Protocol::Main => {}
            Protocol::Number => drop(Box::from_raw(table.cast::<NumberMethods>())),
            Protocol::Sequence => drop(Box::from_raw(table.cast::<SequenceMethods>())),
            Protocol::Mapping => drop(Box::from_raw(table.cast::<MappingMethods>())),
            Protocol::Async => drop(Box::from_raw(table.cast::<AsyncMethods>())),
        }
    }
}

/// Copy a table into a fresh allocation.
///
/// # Safety
///
/// `table` must be null or a live table of `protocol`.
pub unsafe fn clone_protocol_table(protocol: Protocol, table: *mut u8) -> *mut u8 {
    if table.is_null() {
        return table;
    }
    // Safety: caller guarantees `table` is live.
    unsafe {
        match protocol {
            Protocol::Main => std::ptr::null_mut(),
            Protocol::Number => Box::into_raw(Box::new(*table.cast::<NumberMethods>())).cast(),
            Protocol::Sequence => Box::into_raw(Box::new(*table.cast::<SequenceMethods>())).cast(),
            Protocol::Mapping => Box::into_raw(Box::new(*table.cast::<MappingMethods>())).cast(),
            Protocol::Async => Box::into_raw(Box::new(*table.cast::<AsyncMethods>())).cast(),
        }
    }
}

/// Whether every slot in a table is null.
///
/// # Safety
///
/// `table` must be a live table of `protocol`.
pub unsafe fn table_is_empty(protocol: Protocol, table: *mut u8) -> bool {
    let words = table.cast::<usize>();
    // Safety: tables consist of pointer-sized optional function pointers.
    (0..protocol.slot_count()).all(|i| unsafe { *words.add(i) } == 0)
}
