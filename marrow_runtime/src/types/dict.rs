//! Dictionary objects.
//!
//! Keys are strings; the body points at a separately allocated table that
//! owns a reference to every value.
//!
//! ```text
//!   offset 0   ObjectHeader
//!   offset 16  ma_used     isize   number of entries
//!   offset 24  ma_version  u64     bumped on every mutation
//!   offset 32  ma_table    *mut table
//! ```

use crate::error::{RtResult, RuntimeError};
use crate::object::lifecycle::alloc_object;
use crate::object::protocols::{MappingMethods, SequenceMethods};
use crate::object::type_obj::{TypeFlags, TypeObject};
use crate::object::{Obj, ObjectHeader};
use crate::ops;
use crate::types::{Builtins, builtins, string};

use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};

type Table = FxHashMap<Box<str>, Obj>;

/// Dictionary object body.
#[repr(C)]
pub struct DictObject {
    pub ob_base: ObjectHeader,
    pub ma_used: isize,
    pub ma_version: u64,
    pub ma_table: *mut Table,
}

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// Create an empty dictionary.
pub fn new() -> RtResult<Obj> {
    new_in(builtins())
}

pub(crate) fn new_in(b: &Builtins) -> RtResult<Obj> {
    // Safety: `dict` is live and ready.
    let obj = unsafe { alloc_object(b.dict_type(), 0)? };
    let body = obj.as_ptr().cast::<DictObject>();
    // Safety: fresh dict body.
    unsafe {
        (*body).ma_table = Box::into_raw(Box::new(Table::default()));
        (*body).ma_version = NEXT_VERSION.fetch_add(1, Ordering::Relaxed);
    }
    Ok(obj)
}

/// Whether `obj` is a dictionary.
#[inline]
pub fn check(obj: &Obj) -> bool {
    obj.type_flags().contains(TypeFlags::DICT_SUBCLASS)
}

/// Run `f` on the table of the dict at `op`, if it has one.
///
/// # Safety
///
/// `op` must be a live dict body.
unsafe fn with_table<R>(op: *mut ObjectHeader, f: impl FnOnce(&mut Table) -> R) -> Option<R> {
    // Safety: caller guarantees a dict body.
    let table = unsafe { (*op.cast::<DictObject>()).ma_table };
    // Safety: the table is owned by the body and not aliased here.
    (!table.is_null()).then(|| f(unsafe { &mut *table }))
}

fn body_of(obj: &Obj) -> RtResult<*mut DictObject> {
    if !check(obj) {
        return Err(RuntimeError::type_error(format!(
            "expected dict, got {}",
            obj.type_name()
        )));
    }
    Ok(obj.as_ptr().cast())
}

/// Value for `key`.
pub fn get_item(obj: &Obj, key: &str) -> Option<Obj> {
    if !check(obj) {
        return None;
    }
    // Safety: checked dict body.
    unsafe { with_table(obj.as_ptr(), |t| t.get(key).cloned()) }.flatten()
}

/// Value for `key` in a possibly-null dict pointer.
pub fn get_item_raw(op: *mut ObjectHeader, key: &str) -> Option<Obj> {
    if op.is_null() {
        return None;
    }
    // Safety: non-null dict pointers held by types and instances are live.
    let obj = unsafe { Obj::from_borrowed_ptr(op)? };
    get_item(&obj, key)
}

/// Insert or replace `key`.
pub fn set_item(obj: &Obj, key: &str, value: &Obj) -> RtResult<()> {
    let body = body_of(obj)?;
    // Safety: checked dict body.
    let old = unsafe { with_table(obj.as_ptr(), |t| t.insert(key.into(), value.clone())) }
        .ok_or_else(|| RuntimeError::value_error("dict has no table"))?;
    // Safety: checked dict body.
    unsafe { touch(body) };
    drop(old);
    Ok(())
}

/// Remove `key`, returning whether it was present.
pub fn del_item(obj: &Obj, key: &str) -> bool {
    let Ok(body) = body_of(obj) else {
        return false;
    };
    // Safety: checked dict body.
    let old = unsafe { with_table(obj.as_ptr(), |t| t.remove(key)) }.flatten();
    if old.is_none() {
        return false;
    }
    // Safety: checked dict body.
    unsafe { touch(body) };
    drop(old);
    true
}

/// Refresh the cached count and version after a mutation.
unsafe fn touch(body: *mut DictObject) {
    // Safety: caller guarantees a dict body.
    unsafe {
        let used = with_table(body.cast(), |t| t.len()).unwrap_or(0);
        (*body).ma_used = used as isize;
        (*body).ma_version = NEXT_VERSION.fetch_add(1, Ordering::Relaxed);
    }
}

/// Number of entries.
pub fn len(obj: &Obj) -> usize {
    if !check(obj) {
        return 0;
    }
    // Safety: checked dict body.
    unsafe { with_table(obj.as_ptr(), |t| t.len()) }.unwrap_or(0)
}

/// Keys in sorted order.
pub fn keys(obj: &Obj) -> Vec<String> {
    if !check(obj) {
        return Vec::new();
    }
    // Safety: checked dict body.
    let mut keys = unsafe { with_table(obj.as_ptr(), |t| t.keys().map(|k| k.to_string()).collect::<Vec<_>>()) }
        .unwrap_or_default();
    keys.sort_unstable();
    keys
}

/// Entries in key order.
pub fn items(obj: &Obj) -> Vec<(String, Obj)> {
    keys(obj)
        .into_iter()
        .filter_map(|k| get_item(obj, &k).map(|v| (k, v)))
        .collect()
}

/// Mutation counter of a dictionary.
pub fn version(obj: &Obj) -> RtResult<u64> {
    // Safety: checked dict body.
    body_of(obj).map(|b| unsafe { (*b).ma_version })
}

fn key_str(key: &Obj) -> RtResult<&str> {
    if !string::check(key) {
        return Err(RuntimeError::type_error(format!(
            "dict keys must be str, not '{}'",
            key.type_name()
        )));
    }
    string::as_str(key)
}

// =============================================================================
// Slots
// =============================================================================

unsafe fn dict_traverse(op: *mut ObjectHeader, visit: &mut dyn FnMut(*mut ObjectHeader)) {
    // Safety: caller guarantees a live dict body.
    unsafe {
        with_table(op, |t| t.values().for_each(|v| visit(v.as_ptr())));
    }
}

unsafe fn dict_clear(op: *mut ObjectHeader) {
    let body = op.cast::<DictObject>();
    // Safety: caller guarantees a live dict body; the table came from a Box.
    unsafe {
        let table = std::mem::replace(&mut (*body).ma_table, std::ptr::null_mut());
        (*body).ma_used = 0;
        if !table.is_null() {
            drop(Box::from_raw(table));
        }
    }
}

/// A copied dict body shares its table with the original; give it a
/// private copy holding new references.
unsafe fn dict_adopt(op: *mut ObjectHeader) {
    let body = op.cast::<DictObject>();
    // Safety: caller guarantees the body is consistent.
    unsafe {
        let shared = (*body).ma_table;
        let own = if shared.is_null() {
            Table::default()
        } else {
            (*shared).clone()
        };
        (*body).ma_table = Box::into_raw(Box::new(own));
    }
}

fn dict_len(a: &Obj) -> RtResult<usize> {
    Ok(len(a))
}

fn dict_subscript(a: &Obj, key: &Obj) -> RtResult<Obj> {
    let k = key_str(key)?;
    get_item(a, k).ok_or_else(|| RuntimeError::Key(format!("'{k}'")))
}

fn dict_ass_subscript(a: &Obj, key: &Obj, value: Option<&Obj>) -> RtResult<()> {
    let k = key_str(key)?;
    match value {
        Some(v) => set_item(a, k, v),
        None if del_item(a, k) => Ok(()),
        None => Err(RuntimeError::Key(format!("'{k}'"))),
    }
}

fn dict_contains(a: &Obj, key: &Obj) -> RtResult<bool> {
    Ok(get_item(a, key_str(key)?).is_some())
}

fn dict_repr(a: &Obj) -> RtResult<Obj> {
    let parts = items(a)
        .into_iter()
        .map(|(k, v)| Ok(format!("'{}': {}", k, ops::repr(&v)?)))
        .collect::<RtResult<Vec<_>>>()?;
    string::new(&format!("{{{}}}", parts.join(", ")))
}

/// Install the dict kind's hooks and slots.
pub(crate) fn init_type(t: &mut TypeObject) {
    t.tp_traverse = Some(dict_traverse);
    t.tp_clear = Some(dict_clear);
    t.tp_adopt = Some(dict_adopt);
    t.tp_repr = Some(dict_repr);
    t.tp_as_mapping = Box::into_raw(Box::new(MappingMethods {
        mp_length: Some(dict_len),
        mp_subscript: Some(dict_subscript),
        mp_ass_subscript: Some(dict_ass_subscript),
    }));
    t.tp_as_sequence = Box::into_raw(Box::new(SequenceMethods {
        sq_contains: Some(dict_contains),
        ..SequenceMethods::default()
    }));
}
