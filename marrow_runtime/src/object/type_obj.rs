//! Type objects.
//!
//! A type object is itself an object (its type is `type`) whose body holds
//! sizing information, flags, lifecycle hooks and protocol slots. Slots are
//! plain function pointers; a null slot means the operation is unsupported.
//! The numeric, sequence, mapping and async slots live in separately
//! allocated tables that may be absent altogether.
//!
//! ```text
//!   TypeObject (192 bytes)
//!   ┌──────────────┬────────────────┬─────────────┬─────────────────────┐
//!   │ VarHeader    │ name/sizes/    │ lifecycle + │ protocol tables,    │
//!   │ (24)         │ flags/version  │ main slots  │ base, dict, alloc   │
//!   └──────────────┴────────────────┴─────────────┴─────────────────────┘
//! ```

use crate::error::RtResult;
use crate::object::protocols::{AsyncMethods, MappingMethods, NumberMethods, Protocol, SequenceMethods};
use crate::object::{Obj, ObjectHeader, VarHeader};

use bitflags::bitflags;
use smallvec::SmallVec;
use std::ffi::{CStr, c_char};
use std::ptr::NonNull;

// =============================================================================
// Function Signatures
// =============================================================================

/// `op(self) -> object`
pub type UnaryFunc = fn(&Obj) -> RtResult<Obj>;
/// `op(self, other) -> object`
pub type BinaryFunc = fn(&Obj, &Obj) -> RtResult<Obj>;
/// `op(self) -> bool`
pub type InquiryFunc = fn(&Obj) -> RtResult<bool>;
/// `len(self)`
pub type LenFunc = fn(&Obj) -> RtResult<usize>;
/// `self[index]`
pub type SizeArgFunc = fn(&Obj, isize) -> RtResult<Obj>;
/// `self[index] = value` or `del self[index]`
pub type SizeObjArgProc = fn(&Obj, isize, Option<&Obj>) -> RtResult<()>;
/// `other in self`
pub type ObjObjProc = fn(&Obj, &Obj) -> RtResult<bool>;
/// `self[key] = value` or `del self[key]`
pub type ObjObjArgProc = fn(&Obj, &Obj, Option<&Obj>) -> RtResult<()>;
/// `hash(self)`
pub type HashFunc = fn(&Obj) -> RtResult<i64>;
/// `self(*args)`
pub type CallFunc = fn(&Obj, &[Obj]) -> RtResult<Obj>;

/// Final teardown of an object whose count reached zero.
pub type DeallocFn = unsafe fn(*mut ObjectHeader);
/// Visit every strong reference an object body owns.
pub type TraverseFn = unsafe fn(*mut ObjectHeader, &mut dyn FnMut(*mut ObjectHeader));
/// Release everything an object body owns, leaving the header intact.
pub type ClearFn = unsafe fn(*mut ObjectHeader);
/// Take ownership of everything a freshly copied body refers to.
pub type AdoptFn = unsafe fn(*mut ObjectHeader);
/// Allocate an instance with `nitems` trailing items.
pub type AllocFn = unsafe fn(*mut TypeObject, usize) -> RtResult<Obj>;
/// Return an instance's memory to the heap.
pub type FreeFn = unsafe fn(*mut ObjectHeader);

// =============================================================================
// Type Flags
// =============================================================================

bitflags! {
    /// Type behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeFlags: u64 {
        /// Instances keep their attribute dictionary before the object.
        const MANAGED_DICT = 1 << 4;
        /// Instances may be weakly referenced.
        const WEAKREFABLE = 1 << 5;
        /// Attributes of the type itself cannot be set.
        const IMMUTABLE = 1 << 8;
        /// Type was created at runtime and is reference counted.
        const HEAPTYPE = 1 << 9;
        /// Type may be subclassed.
        const BASETYPE = 1 << 10;
        /// Type is fully initialised.
        const READY = 1 << 12;
        /// Instances are tracked by the cycle collector.
        const HAVE_GC = 1 << 14;
        /// Float kind.
        const FLOAT_SUBCLASS = 1 << 20;
        /// Function kind.
        const FUNCTION_SUBCLASS = 1 << 21;
        /// Int kind.
        const INT_SUBCLASS = 1 << 24;
        /// List kind.
        const LIST_SUBCLASS = 1 << 25;
        /// Tuple kind.
        const TUPLE_SUBCLASS = 1 << 26;
        /// Str kind.
        const STR_SUBCLASS = 1 << 28;
        /// Dict kind.
        const DICT_SUBCLASS = 1 << 29;
        /// Type kind.
        const TYPE_SUBCLASS = 1 << 31;
    }
}

/// `tp_dictoffset` value for types using the managed dictionary convention.
pub const MANAGED_DICT_OFFSET: isize = -1;

// =============================================================================
// Type Object
// =============================================================================

/// A type object.
#[repr(C)]
#[derive(Debug)]
pub struct TypeObject {
    /// Object header; `ob_size` is unused.
    pub ob_base: VarHeader,
    /// NUL-terminated type name.
    pub tp_name: *const c_char,
    /// Size of an instance without items.
    pub tp_basicsize: isize,
    /// Size of each trailing item.
    pub tp_itemsize: isize,
    /// Behaviour flags.
    pub tp_flags: u64,
    /// Attribute-cache version; bumped whenever the type changes.
    pub tp_version_tag: u64,

    pub tp_dealloc: Option<DeallocFn>,
    pub tp_traverse: Option<TraverseFn>,
    pub tp_clear: Option<ClearFn>,
    pub tp_adopt: Option<AdoptFn>,

    pub tp_repr: Option<UnaryFunc>,
    pub tp_hash: Option<HashFunc>,
    pub tp_call: Option<CallFunc>,

    pub tp_as_number: *mut NumberMethods,
    pub tp_as_sequence: *mut SequenceMethods,
    pub tp_as_mapping: *mut MappingMethods,
    pub tp_as_async: *mut AsyncMethods,

    /// Single base type, null only for `object`.
    pub tp_base: *mut TypeObject,
    /// Attribute dictionary (a dict object).
    pub tp_dict: *mut ObjectHeader,
    /// Offset of the instance dictionary pointer: 0 for none, positive for
    /// an inline slot, [`MANAGED_DICT_OFFSET`] for the managed convention.
    pub tp_dictoffset: isize,

    pub tp_alloc: Option<AllocFn>,
    pub tp_free: Option<FreeFn>,
}

const _: () = assert!(size_of::<TypeObject>() == 192);

impl TypeObject {
    /// Type name.
    pub fn name(&self) -> &str {
        if self.tp_name.is_null() {
            return "<anonymous>";
        }
        // Safety: tp_name always points at a NUL-terminated UTF-8 string
        // that lives as long as the type.
        unsafe { CStr::from_ptr(self.tp_name) }
            .to_str()
            .unwrap_or("<invalid>")
    }

    /// Behaviour flags.
    #[inline]
    pub fn flags(&self) -> TypeFlags {
        TypeFlags::from_bits_retain(self.tp_flags)
    }

    /// Check a flag.
    #[inline]
    pub fn has(&self, flag: TypeFlags) -> bool {
        self.flags().contains(flag)
    }

    /// Set or clear a flag.
    #[inline]
    pub fn set_flag(&mut self, flag: TypeFlags, on: bool) {
        let mut flags = self.flags();
        flags.set(flag, on);
        self.tp_flags = flags.bits();
    }

    /// Raw pointer to a protocol table (the type itself for [`Protocol::Main`]).
    #[inline]
    pub fn protocol_table(&self, protocol: Protocol) -> *mut u8 {
        match protocol {
            Protocol::Main => self as *const Self as *mut u8,
            Protocol::Number => self.tp_as_number.cast(),
            Protocol::Sequence => self.tp_as_sequence.cast(),
            Protocol::Mapping => self.tp_as_mapping.cast(),
            Protocol::Async => self.tp_as_async.cast(),
        }
    }

    /// Method resolution order: this type followed by its bases.
    pub fn mro(&self) -> SmallVec<[*mut TypeObject; 8]> {
        let mut out = SmallVec::new();
        let mut tp = self as *const Self as *mut TypeObject;
        while !tp.is_null() {
            out.push(tp);
            // Safety: base chain consists of live types.
            tp = unsafe { (*tp).tp_base };
        }
        out
    }

    /// Whether `self` is `other` or derives from it.
    pub fn is_subtype(&self, other: *const TypeObject) -> bool {
        self.mro().iter().any(|&tp| std::ptr::eq(tp, other))
    }

    /// This type as an object pointer.
    #[inline]
    pub fn as_object(&self) -> *mut ObjectHeader {
        self as *const Self as *mut ObjectHeader
    }

    /// New strong reference to this type.
    #[inline]
    pub fn to_obj(&self) -> Obj {
        // Safety: `self` is a live type object.
        unsafe { Obj::from_borrowed(NonNull::new_unchecked(self.as_object())) }
    }
}
