//! User-defined classes.
//!
//! Classes are heap types: reference-counted type objects allocated at
//! runtime, deriving from `object` or another heap type. Their instances
//! are laid out as:
//!
//! ```text
//! [managed dict slot]   only with DictConvention::Managed
//! [GcHead]              collector-aware classes
//! ObjectHeader          16 bytes
//! base members          8 bytes each
//! own members           8 bytes each
//! [inline dict]         only with DictConvention::Inline
//! ```
//!
//! Every heap type owns private copies of all four protocol tables, so
//! assigning a dunder on a class never touches its base's tables.

use crate::error::{RtResult, RuntimeError};
use crate::object::attr::{call, own_attr, type_lookup};
use crate::object::lifecycle::{alloc_object, generic_alloc, generic_dealloc};
use crate::object::protocols::{Protocol, alloc_protocol_table, clone_protocol_table, free_protocol_table};
use crate::object::registry::{Member, global_registry};
use crate::object::slots::{is_slot_name, update_slot};
use crate::object::type_obj::{MANAGED_DICT_OFFSET, TypeFlags, TypeObject};
use crate::object::{Obj, ObjectHeader, incref, xdecref};
use crate::types::{builtins, dict};

use std::ffi::CString;

const MEMBER_SIZE: usize = size_of::<usize>();

/// Where a class keeps its instance dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DictConvention {
    /// No instance dictionary; only member slots.
    None,
    /// A pointer inside the instance body, after the members.
    #[default]
    Inline,
    /// A pointer in the block prefix, before the object.
    Managed,
}

/// Description of a class to create.
#[derive(Debug, Clone)]
pub struct ClassSpec {
    name: String,
    base: Option<Obj>,
    slots: Vec<Box<str>>,
    dict: DictConvention,
    weakrefs: bool,
    gc: bool,
    attrs: Vec<(Box<str>, Obj)>,
}

impl ClassSpec {
    /// A class deriving from `object` with an inline dictionary.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            slots: Vec::new(),
            dict: DictConvention::default(),
            weakrefs: true,
            gc: true,
            attrs: Vec::new(),
        }
    }

    /// Derive from `base` instead of `object`.
    pub fn base(mut self, base: &Obj) -> Self {
        self.base = Some(base.clone());
        self
    }

    /// Named member slots added by this class.
    pub fn slots(mut self, names: &[&str]) -> Self {
        self.slots.extend(names.iter().map(|n| Box::<str>::from(*n)));
        self
    }

    /// Dictionary convention, when the base does not already fix one.
    pub fn dict(mut self, convention: DictConvention) -> Self {
        self.dict = convention;
        self
    }

    /// Whether instances support weak references.
    pub fn weakrefs(mut self, on: bool) -> Self {
        self.weakrefs = on;
        self
    }

    /// Whether instances are tracked by the collector.
    pub fn gc(mut self, on: bool) -> Self {
        self.gc = on;
        self
    }

    /// Add a class attribute.
    pub fn attr(mut self, name: &str, value: Obj) -> Self {
        self.attrs.push((name.into(), value));
        self
    }
}

/// Create a class.
pub fn new_class(spec: &ClassSpec) -> RtResult<Obj> {
    let b = builtins();
    let base_tp = match &spec.base {
        Some(base) => base
            .as_type_ptr()
            .ok_or_else(|| RuntimeError::type_error("bases must be types"))?,
        None => b.object_type(),
    };
    // Safety: `base_tp` is a live type.
    let base = unsafe { &*base_tp };
    if !base.has(TypeFlags::BASETYPE) {
        return Err(RuntimeError::type_error(format!(
            "type '{}' is not an acceptable base type",
            base.name()
        )));
    }
    if !base.has(TypeFlags::HEAPTYPE) && base_tp != b.object_type() {
        return Err(RuntimeError::type_error(format!(
            "subclassing built-in type '{}' is not supported",
            base.name()
        )));
    }
    let name = CString::new(spec.name.as_str())
        .map_err(|_| RuntimeError::value_error("class name contains a NUL byte"))?;

    // Members: inherited ones keep their offsets, new ones follow the base.
    let mut members = global_registry().members(base_tp);
    let mut offset = base.tp_basicsize as usize;
    for slot in &spec.slots {
        if members.iter().any(|m| m.name == *slot) {
            return Err(RuntimeError::type_error(format!("duplicate member '{slot}'")));
        }
        members.push(Member {
            name: slot.clone(),
            offset,
        });
        offset += MEMBER_SIZE;
    }

    let mut flags = TypeFlags::HEAPTYPE | TypeFlags::BASETYPE | TypeFlags::READY;
    let mut dictoffset = base.tp_dictoffset;
    if base.has(TypeFlags::MANAGED_DICT) {
        flags |= TypeFlags::MANAGED_DICT;
    }
    if dictoffset == 0 {
        match spec.dict {
            DictConvention::None => {}
            DictConvention::Inline => {
                dictoffset = offset as isize;
                offset += MEMBER_SIZE;
            }
            DictConvention::Managed => {
                dictoffset = MANAGED_DICT_OFFSET;
                flags |= TypeFlags::MANAGED_DICT;
            }
        }
    }
    if spec.gc || flags.contains(TypeFlags::MANAGED_DICT) || base.has(TypeFlags::HAVE_GC) {
        flags |= TypeFlags::HAVE_GC;
    }
    if spec.weakrefs || base.has(TypeFlags::WEAKREFABLE) {
        flags |= TypeFlags::WEAKREFABLE;
    }

    // Safety: `type` is live and ready.
    let cls = unsafe { alloc_object(b.type_type(), 0)? };
    let tp = cls.as_ptr().cast::<TypeObject>();
    // Safety: `tp` is a freshly allocated, zeroed type body that we own.
    unsafe {
        let t = &mut *tp;
        t.tp_name = name.into_raw();
        t.tp_basicsize = offset as isize;
        t.tp_itemsize = 0;
        t.tp_flags = flags.bits();
        t.tp_version_tag = global_registry().next_version_tag();
        t.tp_dealloc = None;
        t.tp_traverse = Some(instance_traverse);
        t.tp_clear = Some(instance_clear);
        t.tp_adopt = None;
        t.tp_repr = base.tp_repr;
        t.tp_hash = base.tp_hash;
        t.tp_call = base.tp_call;
        for protocol in Protocol::TABLES {
            let table = match base.protocol_table(protocol) {
                p if p.is_null() => alloc_protocol_table(protocol),
                p => clone_protocol_table(protocol, p),
            };
            set_table(t, protocol, table);
        }
        incref(base_tp.cast());
        t.tp_base = base_tp;
        t.tp_dict = dict::new()?.into_raw();
        t.tp_dictoffset = dictoffset;
        t.tp_alloc = Some(generic_alloc);
        t.tp_free = None;

        global_registry().register(tp, members);

        let d = Obj::from_borrowed_ptr(t.tp_dict).ok_or_else(|| RuntimeError::value_error("class dict"))?;
        for (name, value) in &spec.attrs {
            dict::set_item(&d, name, value)?;
        }
        for (name, _) in &spec.attrs {
            if is_slot_name(name) {
                update_slot(tp, name);
            }
        }
    }
    tracing::debug!(name = %spec.name, base = base.name(), "created class");
    Ok(cls)
}

/// Instantiate a class, running `__init__` if it defines one.
pub fn instantiate(cls: &Obj, args: &[Obj]) -> RtResult<Obj> {
    type_call(cls, args)
}

fn set_table(t: &mut TypeObject, protocol: Protocol, table: *mut u8) {
    match protocol {
        Protocol::Main => {}
        Protocol::Number => t.tp_as_number = table.cast(),
        Protocol::Sequence => t.tp_as_sequence = table.cast(),
        Protocol::Mapping => t.tp_as_mapping = table.cast(),
        Protocol::Async => t.tp_as_async = table.cast(),
    }
}

// =============================================================================
// Instance Hooks
// =============================================================================

/// Pointers owned by an instance body: its members and inline dict.
///
/// # Safety
///
/// `op` must be a live instance of a heap type.
unsafe fn instance_slots(op: *mut ObjectHeader) -> impl Iterator<Item = *mut *mut ObjectHeader> {
    let addr = op as usize;
    // Safety: caller guarantees `op` is live.
    let tp = unsafe { (*op).ob_type };
    let members = global_registry().members(tp);
    // Safety: live type.
    let dictoffset = unsafe { (*tp).tp_dictoffset };
    members
        .into_iter()
        .map(|m| m.offset)
        .chain((dictoffset > 0).then_some(dictoffset as usize))
        .map(move |off| (addr + off) as *mut *mut ObjectHeader)
}

unsafe fn instance_traverse(op: *mut ObjectHeader, visit: &mut dyn FnMut(*mut ObjectHeader)) {
    // Safety: caller guarantees `op` is live.
    for slot in unsafe { instance_slots(op) } {
        // Safety: each slot holds null or an owned reference.
        let child = unsafe { *slot };
        if !child.is_null() {
            visit(child);
        }
    }
}

unsafe fn instance_clear(op: *mut ObjectHeader) {
    // Safety: caller guarantees `op` is live.
    for slot in unsafe { instance_slots(op) } {
        // Safety: each slot holds null or an owned reference.
        unsafe {
            let child = *slot;
            *slot = std::ptr::null_mut();
            xdecref(child);
        }
    }
}

// =============================================================================
// Type Hooks
// =============================================================================

/// `tp_dealloc` of `type`: forget the class, then tear it down.
pub(crate) unsafe fn type_dealloc(op: *mut ObjectHeader) {
    let tp = op.cast::<TypeObject>();
    // Safety: caller guarantees `op` is an unreferenced type.
    unsafe {
        tracing::debug!(name = (*tp).name(), "destroying class");
        global_registry().unregister(tp, (*tp).tp_base);
        generic_dealloc(op);
    }
}

/// `tp_traverse` of `type`.
pub(crate) unsafe fn type_traverse(op: *mut ObjectHeader, visit: &mut dyn FnMut(*mut ObjectHeader)) {
    let tp = op.cast::<TypeObject>();
    // Safety: caller guarantees `op` is a live type.
    unsafe {
        if !(*tp).has(TypeFlags::HEAPTYPE) {
            return;
        }
        if !(*tp).tp_dict.is_null() {
            visit((*tp).tp_dict);
        }
        if !(*tp).tp_base.is_null() {
            visit((*tp).tp_base.cast());
        }
    }
}

/// `tp_clear` of `type`: release what a heap type owns.
pub(crate) unsafe fn type_clear(op: *mut ObjectHeader) {
    let tp = op.cast::<TypeObject>();
    // Safety: caller guarantees `op` is a live type.
    unsafe {
        let t = &mut *tp;
        if !t.has(TypeFlags::HEAPTYPE) {
            return;
        }
        let dict = std::mem::replace(&mut t.tp_dict, std::ptr::null_mut());
        xdecref(dict);
        for protocol in Protocol::TABLES {
            free_protocol_table(protocol, t.protocol_table(protocol));
            set_table(t, protocol, std::ptr::null_mut());
        }
        let base = std::mem::replace(&mut t.tp_base, std::ptr::null_mut());
        xdecref(base.cast());
        let name = std::mem::replace(&mut t.tp_name, std::ptr::null());
        if !name.is_null() {
            drop(CString::from_raw(name.cast_mut()));
        }
    }
}

/// `tp_repr` of `type`.
pub(crate) fn type_repr(obj: &Obj) -> RtResult<Obj> {
    let tp = obj
        .as_type_ptr()
        .ok_or_else(|| RuntimeError::type_error("expected a type"))?;
    // Safety: live type.
    crate::types::string::new(&format!("<class '{}'>", unsafe { (*tp).name() }))
}

/// `tp_call` of `type`: create an instance.
pub(crate) fn type_call(cls: &Obj, args: &[Obj]) -> RtResult<Obj> {
    let tp = cls
        .as_type_ptr()
        .ok_or_else(|| RuntimeError::type_error("expected a type"))?;
    // Safety: live type.
    let t = unsafe { &*tp };
    if !t.has(TypeFlags::HEAPTYPE) && tp != builtins().object_type() {
        return Err(RuntimeError::type_error(format!(
            "cannot create '{}' instances",
            t.name()
        )));
    }
    // Safety: live, ready type.
    let inst = unsafe { alloc_object(tp, 0)? };
    match type_lookup(t, "__init__") {
        Some(init) => {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(inst.clone());
            full.extend_from_slice(args);
            call(&init, &full)?;
        }
        None if !args.is_empty() => {
            return Err(RuntimeError::type_error(format!("{}() takes no arguments", t.name())));
        }
        None => {}
    }
    Ok(inst)
}

/// Whether a class defines `name` itself rather than inheriting it.
pub fn defines(cls: &Obj, name: &str) -> bool {
    cls.as_type_ptr()
        // Safety: live type.
        .is_some_and(|tp| own_attr(unsafe { &*tp }, name).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::attr::{get_attr, set_attr};
    use crate::types::{function, int};

    fn init(args: &[Obj]) -> RtResult<Obj> {
        set_attr(&args[0], "value", &args[1])?;
        Ok(crate::types::none())
    }

    #[test]
    fn test_layout_with_members_and_inline_dict() {
        let cls = new_class(&ClassSpec::new("Point").slots(&["x", "y"])).unwrap();
        let tp = unsafe { &*cls.as_type_ptr().unwrap() };
        assert_eq!(tp.tp_basicsize, 40);
        assert_eq!(tp.tp_dictoffset, 32);
        assert!(tp.has(TypeFlags::HEAPTYPE | TypeFlags::HAVE_GC | TypeFlags::WEAKREFABLE));
        assert!(!tp.tp_as_number.is_null());
    }

    #[test]
    fn test_managed_dict_layout() {
        let cls = new_class(&ClassSpec::new("Managed").dict(DictConvention::Managed)).unwrap();
        let tp = unsafe { &*cls.as_type_ptr().unwrap() };
        assert_eq!(tp.tp_basicsize, 16);
        assert_eq!(tp.tp_dictoffset, MANAGED_DICT_OFFSET);
        assert!(tp.has(TypeFlags::MANAGED_DICT));
    }

    #[test]
    fn test_subclass_inherits_dict_convention() {
        let base = new_class(&ClassSpec::new("DictBase").dict(DictConvention::Managed)).unwrap();
        let derived = new_class(
            &ClassSpec::new("DictDerived")
                .base(&base)
                .dict(DictConvention::Inline)
                .slots(&["z"]),
        )
        .unwrap();
        let tp = unsafe { &*derived.as_type_ptr().unwrap() };
        assert_eq!(tp.tp_dictoffset, MANAGED_DICT_OFFSET);
        assert_eq!(tp.tp_basicsize, 24);
    }

    #[test]
    fn test_builtin_bases_rejected() {
        let int_type = unsafe { &*builtins().int_type() }.to_obj();
        let err = new_class(&ClassSpec::new("MyInt").base(&int_type)).unwrap_err();
        assert_eq!(err.kind(), "TypeError");
    }

    #[test]
    fn test_init_runs_on_call() {
        let f = function::native("__init__", init).unwrap();
        let cls = new_class(&ClassSpec::new("WithInit").attr("__init__", f)).unwrap();
        let inst = call(&cls, &[int::new(9).unwrap()]).unwrap();
        assert_eq!(int::value(&get_attr(&inst, "value").unwrap()).unwrap(), 9);
        assert!(defines(&cls, "__init__"));
    }

    #[test]
    fn test_builtin_types_not_callable() {
        let int_type = unsafe { &*builtins().int_type() }.to_obj();
        assert_eq!(call(&int_type, &[]).unwrap_err().kind(), "TypeError");
    }

    #[test]
    fn test_no_init_rejects_arguments() {
        let cls = new_class(&ClassSpec::new("NoInit")).unwrap();
        assert!(call(&cls, &[int::new(1).unwrap()]).is_err());
    }
}
