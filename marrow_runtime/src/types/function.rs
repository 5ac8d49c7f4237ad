//! Function objects.
//!
//! Two kinds of callables share one layout:
//!
//! - native functions wrap a Rust `fn(&[Obj]) -> RtResult<Obj>`
//! - slot wrappers expose a type's slot function under its dunder name;
//!   they remember which slot they wrap so that assigning one back to a
//!   type installs the raw function instead of a trampoline
//!
//! ```text
//!   offset 0   ObjectHeader
//!   offset 16  func_name   *mut ObjectHeader (str)
//!   offset 24  func_kind   u32
//!   offset 28  func_slot   u32   index into the slot table
//!   offset 32  func_addr   usize
//! ```

use crate::error::{RtResult, RuntimeError};
use crate::object::lifecycle::alloc_object;
use crate::object::slots::{SlotDef, SlotFn, slot_def};
use crate::object::type_obj::{TypeFlags, TypeObject};
use crate::object::{Obj, ObjectHeader, make_immortal, xdecref};
use crate::types::{Builtins, builtins, string};

/// Signature of native functions.
pub type NativeFn = fn(&[Obj]) -> RtResult<Obj>;

/// `func_kind` of a native function.
pub const KIND_NATIVE: u32 = 0;
/// `func_kind` of a slot wrapper.
pub const KIND_SLOT_WRAPPER: u32 = 1;

/// Function object body.
#[repr(C)]
pub struct FunctionObject {
    pub ob_base: ObjectHeader,
    pub func_name: *mut ObjectHeader,
    pub func_kind: u32,
    pub func_slot: u32,
    pub func_addr: usize,
}

fn alloc_function(b: &Builtins, name: &str, kind: u32, slot: u32, addr: usize) -> RtResult<Obj> {
    let name = string::new_in(b, name)?;
    // Safety: `function` is live and ready.
    let obj = unsafe { alloc_object(b.function_type(), 0)? };
    let body = obj.as_ptr().cast::<FunctionObject>();
    // Safety: fresh function body.
    unsafe {
        (*body).func_name = name.into_raw();
        (*body).func_kind = kind;
        (*body).func_slot = slot;
        (*body).func_addr = addr;
    }
    Ok(obj)
}

/// Create a native function.
pub fn native(name: &str, f: NativeFn) -> RtResult<Obj> {
    alloc_function(builtins(), name, KIND_NATIVE, 0, f as usize)
}

/// Create an immortal slot wrapper exposing `addr` as `def.name`.
pub(crate) fn slot_wrapper_in(b: &Builtins, def: &'static SlotDef, addr: usize) -> RtResult<Obj> {
    let obj = alloc_function(b, def.name, KIND_SLOT_WRAPPER, def.index() as u32, addr)?;
    // Safety: wrappers live in immortal builtin type dictionaries.
    unsafe {
        make_immortal(obj.as_ptr());
        make_immortal((*obj.as_ptr().cast::<FunctionObject>()).func_name);
    }
    Ok(obj)
}

/// Create a slot wrapper.
pub fn slot_wrapper(def: &'static SlotDef, f: SlotFn) -> RtResult<Obj> {
    if f.signature() != def.signature() {
        return Err(RuntimeError::type_error(format!(
            "slot function does not match the signature of {}",
            def.name
        )));
    }
    alloc_function(builtins(), def.name, KIND_SLOT_WRAPPER, def.index() as u32, f.addr())
}

/// Whether `obj` is a function.
#[inline]
pub fn check(obj: &Obj) -> bool {
    obj.type_flags().contains(TypeFlags::FUNCTION_SUBCLASS)
}

/// If `obj` is a slot wrapper, the slot it wraps and the raw function.
pub fn slot_wrapper_target(obj: &Obj) -> Option<(&'static SlotDef, usize)> {
    if !check(obj) {
        return None;
    }
    let body = obj.as_ptr().cast::<FunctionObject>();
    // Safety: checked function body.
    unsafe {
        if (*body).func_kind != KIND_SLOT_WRAPPER {
            return None;
        }
        Some((slot_def((*body).func_slot as usize)?, (*body).func_addr))
    }
}

/// Name of a function.
pub fn name(obj: &Obj) -> RtResult<String> {
    if !check(obj) {
        return Err(RuntimeError::type_error("expected a function"));
    }
    // Safety: checked function body; the name is an owned str reference.
    let name = unsafe { Obj::from_borrowed_ptr((*obj.as_ptr().cast::<FunctionObject>()).func_name) }
        .ok_or_else(|| RuntimeError::value_error("function has no name"))?;
    string::as_str(&name).map(str::to_owned)
}

// =============================================================================
// Slots
// =============================================================================

fn function_call(f: &Obj, args: &[Obj]) -> RtResult<Obj> {
    let body = f.as_ptr().cast::<FunctionObject>();
    // Safety: `tp_call` of `function` only receives function bodies.
    let (kind, slot, addr) = unsafe { ((*body).func_kind, (*body).func_slot, (*body).func_addr) };
    match kind {
        KIND_NATIVE => {
            // Safety: native functions store a `NativeFn` address.
            let native = unsafe { std::mem::transmute::<usize, NativeFn>(addr) };
            native(args)
        }
        KIND_SLOT_WRAPPER => {
            let def = slot_def(slot as usize)
                .ok_or_else(|| RuntimeError::value_error("slot wrapper refers to an unknown slot"))?;
            // Safety: the wrapper was created for a function of this signature.
            let func = unsafe { SlotFn::from_addr(def.signature(), addr) }
                .ok_or_else(|| RuntimeError::value_error("slot wrapper holds a null function"))?;
            func.invoke(def.name, args)
        }
        other => Err(RuntimeError::value_error(format!("unknown function kind {other}"))),
    }
}

unsafe fn function_traverse(op: *mut ObjectHeader, visit: &mut dyn FnMut(*mut ObjectHeader)) {
    // Safety: caller guarantees a live function body.
    let name = unsafe { (*op.cast::<FunctionObject>()).func_name };
    if !name.is_null() {
        visit(name);
    }
}

unsafe fn function_clear(op: *mut ObjectHeader) {
    // Safety: caller guarantees a live function body.
    unsafe {
        let name = std::mem::replace(&mut (*op.cast::<FunctionObject>()).func_name, std::ptr::null_mut());
        xdecref(name);
    }
}

fn function_repr(f: &Obj) -> RtResult<Obj> {
    let label = match slot_wrapper_target(f) {
        Some(_) => "slot wrapper",
        None => "function",
    };
    string::new(&format!("<{} {}>", label, name(f)?))
}

/// Install the function kind's hooks and slots.
pub(crate) fn init_type(t: &mut TypeObject) {
    t.tp_traverse = Some(function_traverse);
    t.tp_clear = Some(function_clear);
    t.tp_repr = Some(function_repr);
    t.tp_call = Some(function_call);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::attr::{call, own_attr};
    use crate::object::slots::find_slot;
    use crate::types::int;

    fn double(args: &[Obj]) -> RtResult<Obj> {
        int::new(int::value(&args[0])? * 2)
    }

    #[test]
    fn test_native_call() {
        let f = native("double", double).unwrap();
        let r = call(&f, &[int::new(21).unwrap()]).unwrap();
        assert_eq!(int::value(&r).unwrap(), 42);
        assert_eq!(name(&f).unwrap(), "double");
        assert!(slot_wrapper_target(&f).is_none());
    }

    #[test]
    fn test_builtin_wrappers_call_slots() {
        let int_type = unsafe { &*builtins().int_type() };
        let add = own_attr(int_type, "__add__").expect("int defines __add__");
        let (def, addr) = slot_wrapper_target(&add).unwrap();
        assert_eq!(def.field, "nb_add");
        assert_eq!(addr, unsafe { def.read(builtins().int_type()) });
        let r = call(&add, &[int::new(2).unwrap(), int::new(3).unwrap()]).unwrap();
        assert_eq!(int::value(&r).unwrap(), 5);
        assert!(add.is_immortal());
    }

    #[test]
    fn test_wrapper_signature_checked() {
        let def = find_slot("__neg__", None).unwrap();
        let int_type = builtins().int_type();
        let add = unsafe { find_slot("__add__", None).unwrap().read(int_type) };
        let f = unsafe { SlotFn::from_addr(crate::object::slots::SlotSignature::Binary, add) }.unwrap();
        assert!(slot_wrapper(def, f).is_err());
    }

    #[test]
    fn test_repr() {
        let f = native("double", double).unwrap();
        assert_eq!(crate::ops::repr(&f).unwrap(), "<function double>");
    }
}
