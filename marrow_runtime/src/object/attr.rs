//! Attribute access.
//!
//! Implements the generic get/set/delete protocol for instances and types,
//! type-level lookup through the base chain, and the version-tagged lookup
//! cache that sits in front of it.
//!
//! A type's `tp_version_tag` changes whenever the type or any of its bases
//! is modified through [`type_modified`]; cached lookups are only trusted
//! while the tag they were recorded under is current.

use crate::error::{RtResult, RuntimeError};
use crate::object::registry::global_registry;
use crate::object::slots::{is_slot_name, update_slot};
use crate::object::type_obj::{MANAGED_DICT_OFFSET, TypeFlags, TypeObject};
use crate::object::{Obj, ObjectHeader, decref, xdecref};
use crate::types::{dict, string};

use marrow_gc::heap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::ptr::NonNull;
use std::sync::OnceLock;

// =============================================================================
// Lookup Cache
// =============================================================================

struct CachedType {
    version: u64,
    /// Name to value address; 0 records a miss.
    names: FxHashMap<Box<str>, usize>,
}

static LOOKUP_CACHE: OnceLock<Mutex<FxHashMap<usize, CachedType>>> = OnceLock::new();

fn lookup_cache() -> &'static Mutex<FxHashMap<usize, CachedType>> {
    LOOKUP_CACHE.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Look `name` up in the dictionaries of `tp` and its bases, uncached.
pub fn type_lookup_uncached(tp: &TypeObject, name: &str) -> Option<Obj> {
    tp.mro().into_iter().find_map(|t| {
        // Safety: every type in the MRO is live while `tp` is.
        let d = unsafe { (*t).tp_dict };
        dict::get_item_raw(d, name)
    })
}

/// Look `name` up on a type and its bases.
///
/// Results are cached per type under its current version tag.
pub fn type_lookup(tp: &TypeObject, name: &str) -> Option<Obj> {
    let key = tp as *const TypeObject as usize;
    let version = tp.tp_version_tag;
    {
        let cache = lookup_cache().lock();
        if let Some(entry) = cache.get(&key).filter(|e| e.version == version) {
            if let Some(&addr) = entry.names.get(name) {
                // Safety: the value is owned by a dictionary in the MRO and
                // no dictionary in the MRO changed since it was cached.
                return unsafe { Obj::from_borrowed_ptr(addr as *mut ObjectHeader) };
            }
        }
    }

    let found = type_lookup_uncached(tp, name);
    let mut cache = lookup_cache().lock();
    let entry = cache.entry(key).or_insert_with(|| CachedType {
        version,
        names: FxHashMap::default(),
    });
    if entry.version != version {
        entry.version = version;
        entry.names.clear();
    }
    entry
        .names
        .insert(name.into(), found.as_ref().map_or(0, Obj::addr));
    found
}

/// Value of `name` in the type's own dictionary, ignoring bases.
pub fn own_attr(tp: &TypeObject, name: &str) -> Option<Obj> {
    dict::get_item_raw(tp.tp_dict, name)
}

/// Invalidate cached lookups on a type and everything derived from it.
///
/// # Safety
///
/// `tp` must be a live type object.
pub unsafe fn type_modified(tp: *mut TypeObject) {
    let registry = global_registry();
    for t in registry.with_subclasses(tp) {
        // Safety: registered types are live.
        unsafe { (*t).tp_version_tag = registry.next_version_tag() };
    }
}

// =============================================================================
// Instance Dictionaries
// =============================================================================

/// Location of the instance dictionary pointer, if the object has one.
///
/// Managed dictionaries live in the block prefix; if the object's block was
/// allocated without that slot there is no location.
pub fn dict_slot(obj: &Obj) -> Option<*mut *mut ObjectHeader> {
    // Safety: live object, live type.
    let offset = unsafe { (*obj.type_ptr()).tp_dictoffset };
    match offset {
        0 => None,
        MANAGED_DICT_OFFSET => heap()
            .block(obj.addr())?
            .dict_slot_addr()
            .map(|a| a as *mut *mut ObjectHeader),
        off if off > 0 => Some((obj.addr() + off as usize) as *mut *mut ObjectHeader),
        _ => None,
    }
}

/// The instance dictionary, if one has been created.
pub fn instance_dict(obj: &Obj) -> Option<Obj> {
    let slot = dict_slot(obj)?;
    // Safety: the slot holds null or an owned dict reference.
    unsafe { Obj::from_borrowed_ptr(*slot) }
}

/// The instance dictionary, creating an empty one if the object supports
/// a dictionary but has none yet.
pub fn materialize_dict(obj: &Obj) -> RtResult<Option<Obj>> {
    let Some(slot) = dict_slot(obj) else {
        return Ok(None);
    };
    // Safety: the slot holds null or an owned dict reference.
    unsafe {
        if (*slot).is_null() {
            *slot = dict::new()?.into_raw();
        }
        Ok(Obj::from_borrowed_ptr(*slot))
    }
}

/// Replace (or clear) the instance dictionary.
pub fn set_instance_dict(obj: &Obj, value: Option<&Obj>) -> RtResult<()> {
    let slot = dict_slot(obj).ok_or_else(|| no_attribute(obj, "__dict__"))?;
    if let Some(v) = value {
        if !dict::check(v) {
            return Err(RuntimeError::type_error(format!(
                "__dict__ must be set to a dictionary, not a '{}'",
                v.type_name()
            )));
        }
    }
    // Safety: the slot holds null or an owned dict reference.
    unsafe {
        let old = *slot;
        *slot = value.map_or(std::ptr::null_mut(), |v| v.clone().into_raw());
        xdecref(old);
    }
    Ok(())
}

// =============================================================================
// Generic Attribute Protocol
// =============================================================================

fn no_attribute(obj: &Obj, name: &str) -> RuntimeError {
    RuntimeError::attribute_error(format!(
        "'{}' object has no attribute '{}'",
        obj.type_name(),
        name
    ))
}

fn member_slot(obj: &Obj, name: &str) -> Option<*mut *mut ObjectHeader> {
    global_registry()
        .member(obj.type_ptr(), name)
        .map(|m| (obj.addr() + m.offset) as *mut *mut ObjectHeader)
}

/// `getattr(obj, name)`
pub fn get_attr(obj: &Obj, name: &str) -> RtResult<Obj> {
    if let Some(tp) = obj.as_type_ptr() {
        // Safety: `obj` is a live type.
        let tp = unsafe { &*tp };
        if name == "__name__" {
            return string::new(tp.name());
        }
        return type_lookup(tp, name).ok_or_else(|| {
            RuntimeError::attribute_error(format!(
                "type object '{}' has no attribute '{}'",
                tp.name(),
                name
            ))
        });
    }

    match name {
        "__class__" => return Ok(obj.type_obj()),
        "__dict__" => return materialize_dict(obj)?.ok_or_else(|| no_attribute(obj, name)),
        _ => {}
    }

    if let Some(slot) = member_slot(obj, name) {
        // Safety: member slots hold null or an owned reference.
        return unsafe { Obj::from_borrowed_ptr(*slot) }.ok_or_else(|| no_attribute(obj, name));
    }
    if let Some(d) = instance_dict(obj) {
        if let Some(v) = dict::get_item(&d, name) {
            return Ok(v);
        }
    }
    // Safety: live object, live type.
    type_lookup(unsafe { &*obj.type_ptr() }, name).ok_or_else(|| no_attribute(obj, name))
}

/// `setattr(obj, name, value)`
pub fn set_attr(obj: &Obj, name: &str, value: &Obj) -> RtResult<()> {
    if let Some(tp) = obj.as_type_ptr() {
        // Safety: `obj` is a live type.
        unsafe {
            check_mutable(&*tp, name)?;
            type_dict_set(tp, name, Some(value))?;
            after_type_change(tp, name);
        }
        return Ok(());
    }

    match name {
        "__dict__" => return set_instance_dict(obj, Some(value)),
        "__class__" => {
            return Err(RuntimeError::type_error("__class__ assignment is not supported"));
        }
        _ => {}
    }

    if let Some(slot) = member_slot(obj, name) {
        // Safety: member slots hold null or an owned reference.
        unsafe {
            let old = *slot;
            *slot = value.clone().into_raw();
            xdecref(old);
        }
        return Ok(());
    }
    match materialize_dict(obj)? {
        Some(d) => dict::set_item(&d, name, value),
        None => Err(no_attribute(obj, name)),
    }
}

/// `delattr(obj, name)`
pub fn del_attr(obj: &Obj, name: &str) -> RtResult<()> {
    if let Some(tp) = obj.as_type_ptr() {
        // Safety: `obj` is a live type.
        unsafe {
            check_mutable(&*tp, name)?;
            type_dict_set(tp, name, None)?;
            after_type_change(tp, name);
        }
        return Ok(());
    }

    if name == "__dict__" {
        return set_instance_dict(obj, None);
    }
    if let Some(slot) = member_slot(obj, name) {
        // Safety: member slots hold null or an owned reference.
        unsafe {
            let old = *slot;
            if old.is_null() {
                return Err(no_attribute(obj, name));
            }
            *slot = std::ptr::null_mut();
            decref(old);
        }
        return Ok(());
    }
    match instance_dict(obj) {
        Some(d) if dict::del_item(&d, name) => Ok(()),
        _ => Err(no_attribute(obj, name)),
    }
}

/// `hasattr(obj, name)`
pub fn has_attr(obj: &Obj, name: &str) -> bool {
    get_attr(obj, name).is_ok()
}

fn check_mutable(tp: &TypeObject, name: &str) -> RtResult<()> {
    if tp.has(TypeFlags::IMMUTABLE) {
        return Err(RuntimeError::type_error(format!(
            "cannot set '{}' attribute of immutable type '{}'",
            name,
            tp.name()
        )));
    }
    Ok(())
}

/// Set or remove an entry in a type's own dictionary.
///
/// # Safety
///
/// `tp` must be a live type object.
unsafe fn type_dict_set(tp: *mut TypeObject, name: &str, value: Option<&Obj>) -> RtResult<()> {
    // Safety: caller guarantees `tp` is live.
    unsafe {
        if (*tp).tp_dict.is_null() {
            (*tp).tp_dict = dict::new()?.into_raw();
        }
        let d = Obj::from_borrowed(NonNull::new_unchecked((*tp).tp_dict));
        match value {
            Some(v) => dict::set_item(&d, name, v),
            None if dict::del_item(&d, name) => Ok(()),
            None => Err(RuntimeError::attribute_error(format!(
                "type object '{}' has no attribute '{}'",
                (*tp).name(),
                name
            ))),
        }
    }
}

/// Propagate a change of `name` on `tp`: invalidate caches and recompute
/// slots on the type and on subclasses that inherit the name.
///
/// # Safety
///
/// `tp` must be a live type object.
unsafe fn after_type_change(tp: *mut TypeObject, name: &str) {
    // Safety: caller guarantees `tp` is live; subclasses are live.
    unsafe {
        type_modified(tp);
        if !is_slot_name(name) {
            return;
        }
        for t in global_registry().with_subclasses(tp) {
            if t == tp || own_attr(&*t, name).is_none() {
                update_slot(t, name);
            }
        }
    }
}

// =============================================================================
// Calls
// =============================================================================

/// `callable(*args)`
pub fn call(callable: &Obj, args: &[Obj]) -> RtResult<Obj> {
    // Safety: live object, live type.
    let slot = unsafe { (*callable.type_ptr()).tp_call };
    match slot {
        Some(f) => f(callable, args),
        None => Err(RuntimeError::type_error(format!(
            "'{}' object is not callable",
            callable.type_name()
        ))),
    }
}

/// Call the method `name` found on `obj`'s type with `obj` prepended.
pub fn call_method(obj: &Obj, name: &str, args: &[Obj]) -> RtResult<Obj> {
    // Safety: live object, live type.
    let func = type_lookup(unsafe { &*obj.type_ptr() }, name).ok_or_else(|| no_attribute(obj, name))?;
    let mut full = Vec::with_capacity(args.len() + 1);
    full.push(obj.clone());
    full.extend_from_slice(args);
    call(&func, &full)
}

/// Whether `obj` is an instance of `tp` or a subclass.
pub fn is_instance(obj: &Obj, tp: *const TypeObject) -> bool {
    // Safety: live object, live type.
    unsafe { (*obj.type_ptr()).is_subtype(tp) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::class::{ClassSpec, DictConvention, new_class};
    use crate::types::{builtins, function, int};

    fn answer(_args: &[Obj]) -> RtResult<Obj> {
        int::new(42)
    }

    #[test]
    fn test_instance_dict_attributes() {
        let cls = new_class(&ClassSpec::new("AttrPlain")).expect("class");
        let inst = call(&cls, &[]).expect("instance");
        assert!(instance_dict(&inst).is_none());

        set_attr(&inst, "x", &int::new(5).unwrap()).expect("set");
        assert_eq!(int::value(&get_attr(&inst, "x").unwrap()).unwrap(), 5);
        assert!(instance_dict(&inst).is_some());

        del_attr(&inst, "x").expect("del");
        assert_eq!(get_attr(&inst, "x").unwrap_err().kind(), "AttributeError");
    }

    #[test]
    fn test_member_slots() {
        let cls = new_class(
            &ClassSpec::new("AttrSlots")
                .slots(&["a", "b"])
                .dict(DictConvention::None),
        )
        .expect("class");
        let inst = call(&cls, &[]).expect("instance");
        assert_eq!(get_attr(&inst, "a").unwrap_err().kind(), "AttributeError");
        set_attr(&inst, "a", &int::new(1).unwrap()).expect("set");
        assert_eq!(int::value(&get_attr(&inst, "a").unwrap()).unwrap(), 1);
        assert_eq!(
            set_attr(&inst, "zzz", &int::new(1).unwrap()).unwrap_err().kind(),
            "AttributeError"
        );
    }

    #[test]
    fn test_immutable_type_rejects_set() {
        let int_type = builtins().int_type();
        let tp = unsafe { &*int_type }.to_obj();
        let f = function::native("answer", answer).unwrap();
        let err = set_attr(&tp, "answer", &f).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Type("cannot set 'answer' attribute of immutable type 'int'".into())
        );
    }

    #[test]
    fn test_type_lookup_sees_updates() {
        let cls = new_class(&ClassSpec::new("AttrCache")).expect("class");
        let tp = unsafe { &*cls.as_type_ptr().unwrap() };
        assert!(type_lookup(tp, "answer").is_none());

        let f = function::native("answer", answer).unwrap();
        set_attr(&cls, "answer", &f).expect("set");
        assert!(type_lookup(tp, "answer").unwrap().is(&f));

        del_attr(&cls, "answer").expect("del");
        assert!(type_lookup(tp, "answer").is_none());
    }

    #[test]
    fn test_subclass_sees_base_update() {
        let base = new_class(&ClassSpec::new("AttrBase")).expect("class");
        let derived = new_class(&ClassSpec::new("AttrDerived").base(&base)).expect("class");
        let inst = call(&derived, &[]).expect("instance");

        let f = function::native("answer", answer).unwrap();
        set_attr(&base, "answer", &f).expect("set");
        assert_eq!(int::value(&call_method(&inst, "answer", &[]).unwrap()).unwrap(), 42);
    }

    #[test]
    fn test_replace_instance_dict() {
        let cls = new_class(&ClassSpec::new("AttrReplace").dict(DictConvention::Managed)).expect("class");
        let inst = call(&cls, &[]).expect("instance");
        let d = dict::new().unwrap();
        dict::set_item(&d, "k", &int::new(3).unwrap()).unwrap();
        set_attr(&inst, "__dict__", &d).expect("set dict");
        assert!(get_attr(&inst, "__dict__").unwrap().is(&d));
        assert_eq!(int::value(&get_attr(&inst, "k").unwrap()).unwrap(), 3);

        let err = set_attr(&inst, "__dict__", &int::new(1).unwrap()).unwrap_err();
        assert_eq!(err.kind(), "TypeError");
    }
}
