//! Slot definitions.
//!
//! Maps dunder names onto protocol slots. Each definition knows which table
//! it lives in, its byte offset within that table, its signature, and a
//! trampoline that dispatches back to the dunder through attribute lookup.
//!
//! When a dunder is assigned on a type, [`update_slot`] rewrites the
//! matching slots:
//!
//! - the resolved value is a slot wrapper for the same slot: install the
//!   wrapped native function directly
//! - any other value: install the trampoline
//! - nothing resolves: clear the slot

use crate::error::{RtResult, RuntimeError};
use crate::object::attr::{call_method, type_lookup};
use crate::object::protocols::{AsyncMethods, MappingMethods, NumberMethods, Protocol, SequenceMethods};
use crate::object::type_obj::{
    BinaryFunc, CallFunc, HashFunc, InquiryFunc, LenFunc, ObjObjArgProc, ObjObjProc,
    SizeArgFunc, SizeObjArgProc, TypeObject, UnaryFunc,
};
use crate::object::Obj;
use crate::types::{function, int, none};

use std::mem::offset_of;

// =============================================================================
// Signatures
// =============================================================================

/// Shape of a slot function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotSignature {
    Unary,
    Binary,
    Inquiry,
    Len,
    SizeArg,
    SizeObjArg,
    ObjObj,
    ObjObjArg,
    Hash,
    Call,
}

/// A typed slot function pointer.
#[derive(Clone, Copy)]
pub enum SlotFn {
    Unary(UnaryFunc),
    Binary(BinaryFunc),
    Inquiry(InquiryFunc),
    Len(LenFunc),
    SizeArg(SizeArgFunc),
    SizeObjArg(SizeObjArgProc),
    ObjObj(ObjObjProc),
    ObjObjArg(ObjObjArgProc),
    Hash(HashFunc),
    Call(CallFunc),
}

impl SlotFn {
    /// Signature of this function.
    pub fn signature(&self) -> SlotSignature {
        match self {
            SlotFn::Unary(_) => SlotSignature::Unary,
            SlotFn::Binary(_) => SlotSignature::Binary,
            SlotFn::Inquiry(_) => SlotSignature::Inquiry,
            SlotFn::Len(_) => SlotSignature::Len,
            SlotFn::SizeArg(_) => SlotSignature::SizeArg,
            SlotFn::SizeObjArg(_) => SlotSignature::SizeObjArg,
            SlotFn::ObjObj(_) => SlotSignature::ObjObj,
            SlotFn::ObjObjArg(_) => SlotSignature::ObjObjArg,
            SlotFn::Hash(_) => SlotSignature::Hash,
            SlotFn::Call(_) => SlotSignature::Call,
        }
    }

    /// Raw function address, as stored in a slot.
    pub fn addr(&self) -> usize {
        match *self {
            SlotFn::Unary(f) => f as usize,
            SlotFn::Binary(f) => f as usize,
            SlotFn::Inquiry(f) => f as usize,
            SlotFn::Len(f) => f as usize,
            SlotFn::SizeArg(f) => f as usize,
            SlotFn::SizeObjArg(f) => f as usize,
            SlotFn::ObjObj(f) => f as usize,
            SlotFn::ObjObjArg(f) => f as usize,
            SlotFn::Hash(f) => f as usize,
            SlotFn::Call(f) => f as usize,
        }
    }

    /// Reinterpret a raw slot value.
    ///
    /// # Safety
    ///
    /// `addr` must be zero or the address of a function with signature `sig`.
    pub unsafe fn from_addr(sig: SlotSignature, addr: usize) -> Option<SlotFn> {
        if addr == 0 {
            return None;
        }
        // Safety: caller guarantees the signature matches.
        unsafe {
            Some(match sig {
                SlotSignature::Unary => SlotFn::Unary(std::mem::transmute::<usize, UnaryFunc>(addr)),
                SlotSignature::Binary => SlotFn::Binary(std::mem::transmute::<usize, BinaryFunc>(addr)),
                SlotSignature::Inquiry => SlotFn::Inquiry(std::mem::transmute::<usize, InquiryFunc>(addr)),
                SlotSignature::Len => SlotFn::Len(std::mem::transmute::<usize, LenFunc>(addr)),
                SlotSignature::SizeArg => SlotFn::SizeArg(std::mem::transmute::<usize, SizeArgFunc>(addr)),
                SlotSignature::SizeObjArg => {
                    SlotFn::SizeObjArg(std::mem::transmute::<usize, SizeObjArgProc>(addr))
                }
                SlotSignature::ObjObj => SlotFn::ObjObj(std::mem::transmute::<usize, ObjObjProc>(addr)),
                SlotSignature::ObjObjArg => {
                    SlotFn::ObjObjArg(std::mem::transmute::<usize, ObjObjArgProc>(addr))
                }
                SlotSignature::Hash => SlotFn::Hash(std::mem::transmute::<usize, HashFunc>(addr)),
                SlotSignature::Call => SlotFn::Call(std::mem::transmute::<usize, CallFunc>(addr)),
            })
        }
    }

    /// Call the function with positional arguments, `args[0]` being `self`.
    pub fn invoke(&self, name: &str, args: &[Obj]) -> RtResult<Obj> {
        let arity = match self {
            SlotFn::Unary(_) | SlotFn::Inquiry(_) | SlotFn::Len(_) | SlotFn::Hash(_) => 1..=1,
            SlotFn::Binary(_) | SlotFn::SizeArg(_) | SlotFn::ObjObj(_) => 2..=2,
            SlotFn::SizeObjArg(_) | SlotFn::ObjObjArg(_) => 2..=3,
            SlotFn::Call(_) => 1..=usize::MAX,
        };
        if !arity.contains(&args.len()) {
            return Err(RuntimeError::type_error(format!(
                "{name}() takes {} positional arguments but {} were given",
                arity.start(),
                args.len()
            )));
        }
        match *self {
            SlotFn::Unary(f) => f(&args[0]),
            SlotFn::Binary(f) => f(&args[0], &args[1]),
            SlotFn::Inquiry(f) => f(&args[0]).and_then(int::from_bool),
            SlotFn::Len(f) => f(&args[0]).and_then(|n| int::new(n as i64)),
            SlotFn::SizeArg(f) => f(&args[0], int::index(&args[1])?),
            SlotFn::SizeObjArg(f) => {
                f(&args[0], int::index(&args[1])?, args.get(2)).map(|_| none())
            }
            SlotFn::ObjObj(f) => f(&args[0], &args[1]).and_then(int::from_bool),
            SlotFn::ObjObjArg(f) => f(&args[0], &args[1], args.get(2)).map(|_| none()),
            SlotFn::Hash(f) => f(&args[0]).and_then(int::new),
            SlotFn::Call(f) => f(&args[0], &args[1..]),
        }
    }
}

impl PartialEq for SlotFn {
    fn eq(&self, other: &Self) -> bool {
        self.signature() == other.signature() && self.addr() == other.addr()
    }
}

impl Eq for SlotFn {}

impl std::fmt::Debug for SlotFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SlotFn::{:?}({:#x})", self.signature(), self.addr())
    }
}

// =============================================================================
// Trampolines
// =============================================================================

macro_rules! trampolines {
    ($($fn_name:ident: $sig:ident => $dunder:literal;)*) => {
        $(trampolines!(@one $fn_name $sig $dunder);)*
    };
    (@one $f:ident Unary $d:literal) => {
        fn $f(a: &Obj) -> RtResult<Obj> {
            call_method(a, $d, &[])
        }
    };
    (@one $f:ident Binary $d:literal) => {
        fn $f(a: &Obj, b: &Obj) -> RtResult<Obj> {
            call_method(a, $d, std::slice::from_ref(b))
        }
    };
}

trampolines! {
    tramp_repr: Unary => "__repr__";
    tramp_await: Unary => "__await__";
    tramp_aiter: Unary => "__aiter__";
    tramp_anext: Unary => "__anext__";
    tramp_add: Binary => "__add__";
    tramp_sub: Binary => "__sub__";
    tramp_mul: Binary => "__mul__";
    tramp_mod: Binary => "__mod__";
    tramp_neg: Unary => "__neg__";
    tramp_pos: Unary => "__pos__";
    tramp_abs: Unary => "__abs__";
    tramp_invert: Unary => "__invert__";
    tramp_int: Unary => "__int__";
    tramp_float: Unary => "__float__";
    tramp_floordiv: Binary => "__floordiv__";
    tramp_truediv: Binary => "__truediv__";
    tramp_matmul: Binary => "__matmul__";
    tramp_getitem: Binary => "__getitem__";
}

fn tramp_hash(a: &Obj) -> RtResult<i64> {
    int::value(&call_method(a, "__hash__", &[])?)
}

fn tramp_call(a: &Obj, args: &[Obj]) -> RtResult<Obj> {
    call_method(a, "__call__", args)
}

fn tramp_bool(a: &Obj) -> RtResult<bool> {
    Ok(int::value(&call_method(a, "__bool__", &[])?)? != 0)
}

fn tramp_len(a: &Obj) -> RtResult<usize> {
    let n = int::value(&call_method(a, "__len__", &[])?)?;
    usize::try_from(n).map_err(|_| RuntimeError::value_error("__len__() should return >= 0"))
}

fn tramp_sq_item(a: &Obj, i: isize) -> RtResult<Obj> {
    call_method(a, "__getitem__", &[int::new(i as i64)?])
}

fn tramp_sq_ass_item(a: &Obj, i: isize, v: Option<&Obj>) -> RtResult<()> {
    let index = int::new(i as i64)?;
    match v {
        Some(v) => call_method(a, "__setitem__", &[index, v.clone()]),
        None => call_method(a, "__delitem__", &[index]),
    }
    .map(drop)
}

fn tramp_contains(a: &Obj, b: &Obj) -> RtResult<bool> {
    Ok(int::value(&call_method(a, "__contains__", std::slice::from_ref(b))?)? != 0)
}

fn tramp_mp_ass_subscript(a: &Obj, k: &Obj, v: Option<&Obj>) -> RtResult<()> {
    match v {
        Some(v) => call_method(a, "__setitem__", &[k.clone(), v.clone()]),
        None => call_method(a, "__delitem__", std::slice::from_ref(k)),
    }
    .map(drop)
}

// =============================================================================
// Slot Table
// =============================================================================

/// One dunder-to-slot mapping.
#[derive(Debug)]
pub struct SlotDef {
    /// Dunder name.
    pub name: &'static str,
    /// Slot field name.
    pub field: &'static str,
    /// Table the slot lives in.
    pub protocol: Protocol,
    /// Byte offset within the table (or the type object for `Main`).
    pub offset: usize,
    /// Generic dispatcher installed for non-native implementations.
    pub trampoline: SlotFn,
}

impl SlotDef {
    /// Signature of the slot.
    #[inline]
    pub fn signature(&self) -> SlotSignature {
        self.trampoline.signature()
    }

    /// Index of this definition in [`SLOT_DEFS`].
    pub fn index(&self) -> usize {
        SLOT_DEFS
            .iter()
            .position(|d| std::ptr::eq(d, self))
            .unwrap_or(usize::MAX)
    }

    /// Read the raw slot value from a type (0 if the table is absent).
    ///
    /// # Safety
    ///
    /// `tp` must be a live type object.
    pub unsafe fn read(&self, tp: *mut TypeObject) -> usize {
        // Safety: caller guarantees `tp` is live; offset is within the table.
        unsafe {
            let table = (*tp).protocol_table(self.protocol);
            if table.is_null() {
                0
            } else {
                table.add(self.offset).cast::<usize>().read()
            }
        }
    }

    /// Write a raw slot value. Returns `false` if the table is absent.
    ///
    /// # Safety
    ///
    /// `tp` must be a live type object and `value` zero or a function of
    /// this slot's signature.
    pub unsafe fn write(&self, tp: *mut TypeObject, value: usize) -> bool {
        // Safety: caller guarantees `tp` is live and `value` well-typed.
        unsafe {
            let table = (*tp).protocol_table(self.protocol);
            if table.is_null() {
                return false;
            }
            table.add(self.offset).cast::<usize>().write(value);
        }
        true
    }
}

macro_rules! slot {
    ($name:literal, Main, $field:ident, $tramp:expr) => {
        SlotDef {
            name: $name,
            field: stringify!($field),
            protocol: Protocol::Main,
            offset: offset_of!(TypeObject, $field),
            trampoline: $tramp,
        }
    };
    ($name:literal, $proto:ident, $table:ty, $field:ident, $tramp:expr) => {
        SlotDef {
            name: $name,
            field: stringify!($field),
            protocol: Protocol::$proto,
            offset: offset_of!($table, $field),
            trampoline: $tramp,
        }
    };
}

/// Every slot definition, in lookup order: main, async, number, sequence,
/// mapping.
pub static SLOT_DEFS: &[SlotDef] = &[
    slot!("__repr__", Main, tp_repr, SlotFn::Unary(tramp_repr)),
    slot!("__hash__", Main, tp_hash, SlotFn::Hash(tramp_hash)),
    slot!("__call__", Main, tp_call, SlotFn::Call(tramp_call)),
    slot!("__await__", Async, AsyncMethods, am_await, SlotFn::Unary(tramp_await)),
    slot!("__aiter__", Async, AsyncMethods, am_aiter, SlotFn::Unary(tramp_aiter)),
    slot!("__anext__", Async, AsyncMethods, am_anext, SlotFn::Unary(tramp_anext)),
    slot!("__add__", Number, NumberMethods, nb_add, SlotFn::Binary(tramp_add)),
    slot!("__sub__", Number, NumberMethods, nb_subtract, SlotFn::Binary(tramp_sub)),
    slot!("__mul__", Number, NumberMethods, nb_multiply, SlotFn::Binary(tramp_mul)),
    slot!("__mod__", Number, NumberMethods, nb_remainder, SlotFn::Binary(tramp_mod)),
    slot!("__neg__", Number, NumberMethods, nb_negative, SlotFn::Unary(tramp_neg)),
    slot!("__pos__", Number, NumberMethods, nb_positive, SlotFn::Unary(tramp_pos)),
    slot!("__abs__", Number, NumberMethods, nb_absolute, SlotFn::Unary(tramp_abs)),
    slot!("__bool__", Number, NumberMethods, nb_bool, SlotFn::Inquiry(tramp_bool)),
    slot!("__invert__", Number, NumberMethods, nb_invert, SlotFn::Unary(tramp_invert)),
    slot!("__int__", Number, NumberMethods, nb_int, SlotFn::Unary(tramp_int)),
    slot!("__float__", Number, NumberMethods, nb_float, SlotFn::Unary(tramp_float)),
    slot!("__floordiv__", Number, NumberMethods, nb_floor_divide, SlotFn::Binary(tramp_floordiv)),
    slot!("__truediv__", Number, NumberMethods, nb_true_divide, SlotFn::Binary(tramp_truediv)),
    slot!("__matmul__", Number, NumberMethods, nb_matrix_multiply, SlotFn::Binary(tramp_matmul)),
    slot!("__len__", Sequence, SequenceMethods, sq_length, SlotFn::Len(tramp_len)),
    slot!("__getitem__", Sequence, SequenceMethods, sq_item, SlotFn::SizeArg(tramp_sq_item)),
    slot!("__setitem__", Sequence, SequenceMethods, sq_ass_item, SlotFn::SizeObjArg(tramp_sq_ass_item)),
    slot!("__delitem__", Sequence, SequenceMethods, sq_ass_item, SlotFn::SizeObjArg(tramp_sq_ass_item)),
    slot!("__contains__", Sequence, SequenceMethods, sq_contains, SlotFn::ObjObj(tramp_contains)),
    slot!("__len__", Mapping, MappingMethods, mp_length, SlotFn::Len(tramp_len)),
    slot!("__getitem__", Mapping, MappingMethods, mp_subscript, SlotFn::Binary(tramp_getitem)),
    slot!("__setitem__", Mapping, MappingMethods, mp_ass_subscript, SlotFn::ObjObjArg(tramp_mp_ass_subscript)),
    slot!("__delitem__", Mapping, MappingMethods, mp_ass_subscript, SlotFn::ObjObjArg(tramp_mp_ass_subscript)),
];

/// All definitions for a dunder name.
pub fn slot_defs_named(name: &str) -> impl Iterator<Item = &'static SlotDef> + '_ {
    SLOT_DEFS.iter().filter(move |d| d.name == name)
}

/// First definition for a dunder name, preferring `prefer` when given.
pub fn find_slot(name: &str, prefer: Option<Protocol>) -> Option<&'static SlotDef> {
    if let Some(protocol) = prefer {
        if let Some(def) = slot_defs_named(name).find(|d| d.protocol == protocol) {
            return Some(def);
        }
    }
    slot_defs_named(name).next()
}

/// Whether `name` maps to any slot.
#[inline]
pub fn is_slot_name(name: &str) -> bool {
    slot_defs_named(name).next().is_some()
}

/// Slot definition at `index` in [`SLOT_DEFS`].
#[inline]
pub fn slot_def(index: usize) -> Option<&'static SlotDef> {
    SLOT_DEFS.get(index)
}

/// Recompute the slots behind `name` for a type.
///
/// Tables that are absent are left absent; callers that need a slot
/// installed allocate the table first.
///
/// # Safety
///
/// `tp` must be a live type object.
pub unsafe fn update_slot(tp: *mut TypeObject, name: &str) {
    // Safety: caller guarantees `tp` is live.
    let tp_ref = unsafe { &*tp };
    let resolved = type_lookup(tp_ref, name);
    for def in slot_defs_named(name) {
        let value = match &resolved {
            // `__setitem__` and `__delitem__` share a slot.
            None if SLOT_DEFS.iter().any(|d| {
                d.field == def.field
                    && d.protocol == def.protocol
                    && d.name != name
                    && type_lookup(tp_ref, d.name).is_some()
            }) =>
            {
                def.trampoline.addr()
            }
            None => 0,
            Some(obj) => match function::slot_wrapper_target(obj) {
                Some((wrapped, addr)) if wrapped.field == def.field && wrapped.protocol == def.protocol => addr,
                _ => def.trampoline.addr(),
            },
        };
        // Safety: caller guarantees `tp` is live; value matches the slot.
        unsafe { def.write(tp, value) };
    }
}
