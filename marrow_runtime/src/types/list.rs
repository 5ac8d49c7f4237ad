//! List objects.
//!
//! The body points at a separately allocated item buffer. `ob_size` is the
//! number of items in use and `allocated` the buffer capacity.
//!
//! ```text
//!   offset 0   VarHeader   (ob_size = len)
//!   offset 24  ob_item     *mut *mut ObjectHeader
//!   offset 32  allocated   isize
//! ```

use crate::error::{RtResult, RuntimeError};
use crate::object::lifecycle::alloc_object;
use crate::object::protocols::SequenceMethods;
use crate::object::type_obj::{TypeFlags, TypeObject};
use crate::object::{Obj, ObjectHeader, VarHeader, incref, xdecref};
use crate::ops;
use crate::types::{builtins, string};

use std::mem::ManuallyDrop;

/// List object body.
#[repr(C)]
pub struct ListObject {
    pub ob_base: VarHeader,
    pub ob_item: *mut *mut ObjectHeader,
    pub allocated: isize,
}

/// Take the item buffer out of a list body, leaving it empty.
///
/// # Safety
///
/// `op` must be a live list body.
unsafe fn take_items(op: *mut ObjectHeader) -> Vec<*mut ObjectHeader> {
    let body = op.cast::<ListObject>();
    // Safety: caller guarantees a list body; the buffer came from a Vec.
    unsafe {
        let ptr = std::mem::replace(&mut (*body).ob_item, std::ptr::null_mut());
        let cap = std::mem::replace(&mut (*body).allocated, 0).max(0) as usize;
        let len = std::mem::replace(&mut (*body).ob_base.ob_size, 0).max(0) as usize;
        if ptr.is_null() {
            Vec::new()
        } else {
            Vec::from_raw_parts(ptr, len.min(cap), cap)
        }
    }
}

/// Install an item buffer into an empty list body.
///
/// # Safety
///
/// `op` must be a live list body whose buffer was taken.
unsafe fn put_items(op: *mut ObjectHeader, items: Vec<*mut ObjectHeader>) {
    let body = op.cast::<ListObject>();
    let mut items = ManuallyDrop::new(items);
    // Safety: caller guarantees a list body.
    unsafe {
        (*body).ob_base.ob_size = items.len() as isize;
        (*body).allocated = items.capacity() as isize;
        (*body).ob_item = if items.capacity() == 0 {
            std::ptr::null_mut()
        } else {
            items.as_mut_ptr()
        };
    }
}

/// Run `f` on a list's item buffer.
fn with_items<R>(obj: &Obj, f: impl FnOnce(&mut Vec<*mut ObjectHeader>) -> R) -> RtResult<R> {
    if !check(obj) {
        return Err(RuntimeError::type_error(format!(
            "expected list, got {}",
            obj.type_name()
        )));
    }
    // Safety: checked list body; the buffer is put back before returning.
    unsafe {
        let mut items = take_items(obj.as_ptr());
        let out = f(&mut items);
        put_items(obj.as_ptr(), items);
        Ok(out)
    }
}

/// Create a list holding new references to `items`.
pub fn new(items: &[Obj]) -> RtResult<Obj> {
    // Safety: `list` is live and ready.
    let obj = unsafe { alloc_object(builtins().list_type(), 0)? };
    let buffer = items.iter().map(|o| o.clone().into_raw()).collect();
    // Safety: fresh list body with no buffer.
    unsafe { put_items(obj.as_ptr(), buffer) };
    Ok(obj)
}

/// Whether `obj` is a list.
#[inline]
pub fn check(obj: &Obj) -> bool {
    obj.type_flags().contains(TypeFlags::LIST_SUBCLASS)
}

/// Number of items.
pub fn len(obj: &Obj) -> usize {
    // Safety: list bodies start with a var header.
    unsafe { (*obj.as_ptr().cast::<VarHeader>()).ob_size.max(0) as usize }
}

/// Append an item.
pub fn append(obj: &Obj, item: &Obj) -> RtResult<()> {
    let raw = item.clone().into_raw();
    with_items(obj, |items| items.push(raw)).inspect_err(|_| {
        // Safety: we own `raw` and it was not stored.
        unsafe { xdecref(raw) };
    })
}

fn normalize(index: isize, len: usize) -> Option<usize> {
    let i = if index < 0 { index + len as isize } else { index };
    usize::try_from(i).ok().filter(|&i| i < len)
}

/// Item at `index` (negative indexes count from the end).
pub fn get(obj: &Obj, index: isize) -> RtResult<Obj> {
    let raw = with_items(obj, |items| normalize(index, items.len()).map(|i| items[i]))?
        .ok_or_else(|| RuntimeError::index_error("list index out of range"))?;
    // Safety: the list owns a reference to every item.
    unsafe { Obj::from_borrowed_ptr(raw) }.ok_or_else(|| RuntimeError::value_error("list slot is empty"))
}

/// Replace the item at `index`.
pub fn set(obj: &Obj, index: isize, item: &Obj) -> RtResult<()> {
    let new = item.as_ptr();
    let old = with_items(obj, |items| {
        normalize(index, items.len()).map(|i| {
            // Safety: `item` is live.
            unsafe { incref(new) };
            std::mem::replace(&mut items[i], new)
        })
    })?
    .ok_or_else(|| RuntimeError::index_error("list assignment index out of range"))?;
    // Safety: the list owned `old`.
    unsafe { xdecref(old) };
    Ok(())
}

/// Remove the item at `index`.
pub fn delete(obj: &Obj, index: isize) -> RtResult<()> {
    let old = with_items(obj, |items| normalize(index, items.len()).map(|i| items.remove(i)))?
        .ok_or_else(|| RuntimeError::index_error("list assignment index out of range"))?;
    // Safety: the list owned `old`.
    unsafe { xdecref(old) };
    Ok(())
}

/// All items.
pub fn items(obj: &Obj) -> RtResult<Vec<Obj>> {
    let raws = with_items(obj, |items| items.clone())?;
    // Safety: the list owns a reference to every item.
    Ok(raws
        .into_iter()
        .filter_map(|p| unsafe { Obj::from_borrowed_ptr(p) })
        .collect())
}

// =============================================================================
// Slots
// =============================================================================

unsafe fn list_traverse(op: *mut ObjectHeader, visit: &mut dyn FnMut(*mut ObjectHeader)) {
    // Safety: caller guarantees a live list body.
    unsafe {
        let items = take_items(op);
        for &child in &items {
            if !child.is_null() {
                visit(child);
            }
        }
        put_items(op, items);
    }
}

unsafe fn list_clear(op: *mut ObjectHeader) {
    // Safety: caller guarantees a live list body.
    let items = unsafe { take_items(op) };
    for child in items {
        // Safety: the list owned each item.
        unsafe { xdecref(child) };
    }
}

/// A copied list body shares its buffer with the original; give it a
/// private buffer holding new references.
unsafe fn list_adopt(op: *mut ObjectHeader) {
    let body = op.cast::<ListObject>();
    // Safety: caller guarantees the body is consistent.
    unsafe {
        let len = (*body).ob_base.ob_size.max(0) as usize;
        let cap = ((*body).allocated.max(0) as usize).max(len);
        let shared = (*body).ob_item;
        let mut own = Vec::with_capacity(cap);
        if !shared.is_null() {
            own.extend_from_slice(std::slice::from_raw_parts(shared, len));
        }
        for &child in &own {
            if !child.is_null() {
                incref(child);
            }
        }
        (*body).ob_item = std::ptr::null_mut();
        put_items(op, own);
    }
}

fn list_len(a: &Obj) -> RtResult<usize> {
    Ok(len(a))
}

fn list_concat(a: &Obj, b: &Obj) -> RtResult<Obj> {
    if !check(b) {
        return Err(RuntimeError::type_error(format!(
            "can only concatenate list (not \"{}\") to list",
            b.type_name()
        )));
    }
    let mut all = items(a)?;
    all.extend(items(b)?);
    new(&all)
}

fn list_item(a: &Obj, index: isize) -> RtResult<Obj> {
    get(a, index)
}

fn list_ass_item(a: &Obj, index: isize, value: Option<&Obj>) -> RtResult<()> {
    match value {
        Some(v) => set(a, index, v),
        None => delete(a, index),
    }
}

fn list_contains(a: &Obj, b: &Obj) -> RtResult<bool> {
    for item in items(a)? {
        if ops::equals(&item, b)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn list_repr(a: &Obj) -> RtResult<Obj> {
    let parts = items(a)?
        .iter()
        .map(ops::repr)
        .collect::<RtResult<Vec<_>>>()?;
    string::new(&format!("[{}]", parts.join(", ")))
}

/// Install the list kind's hooks and slots.
pub(crate) fn init_type(t: &mut TypeObject) {
    t.tp_traverse = Some(list_traverse);
    t.tp_clear = Some(list_clear);
    t.tp_adopt = Some(list_adopt);
    t.tp_repr = Some(list_repr);
    t.tp_as_sequence = Box::into_raw(Box::new(SequenceMethods {
        sq_length: Some(list_len),
        sq_concat: Some(list_concat),
        sq_item: Some(list_item),
        sq_ass_item: Some(list_ass_item),
        sq_contains: Some(list_contains),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::int;

    #[test]
    fn test_append_get_set() {
        let l = new(&[]).unwrap();
        append(&l, &int::new(1).unwrap()).unwrap();
        append(&l, &int::new(2).unwrap()).unwrap();
        assert_eq!(len(&l), 2);
        assert_eq!(int::value(&get(&l, -1).unwrap()).unwrap(), 2);
        set(&l, 0, &int::new(5).unwrap()).unwrap();
        assert_eq!(int::value(&get(&l, 0).unwrap()).unwrap(), 5);
        assert_eq!(get(&l, 2).unwrap_err().kind(), "IndexError");
    }

    #[test]
    fn test_body_size_is_fixed() {
        let l = new(&[]).unwrap();
        assert_eq!(marrow_gc::heap().requested_size(l.addr()), Some(40));
    }

    #[test]
    fn test_delete_releases_item() {
        let item = string::new("x").unwrap();
        let l = new(&[item.clone()]).unwrap();
        assert_eq!(item.refcnt(), 2);
        delete(&l, 0).unwrap();
        assert_eq!(item.refcnt(), 1);
        assert_eq!(len(&l), 0);
    }

    #[test]
    fn test_adopt_gives_private_buffer() {
        let item = string::new("y").unwrap();
        let l = new(&[item.clone()]).unwrap();
        let before = unsafe { (*l.as_ptr().cast::<ListObject>()).ob_item };
        let cap = unsafe { (*l.as_ptr().cast::<ListObject>()).allocated } as usize;
        unsafe { list_adopt(l.as_ptr()) };
        let after = unsafe { (*l.as_ptr().cast::<ListObject>()).ob_item };
        assert_ne!(before, after);
        assert_eq!(item.refcnt(), 3);
        // The original buffer is no longer referenced by any body.
        unsafe {
            for p in Vec::from_raw_parts(before, 1, cap) {
                xdecref(p);
            }
        }
        assert_eq!(item.refcnt(), 2);
    }

    #[test]
    fn test_repr() {
        let l = new(&[int::new(1).unwrap(), string::new("a").unwrap()]).unwrap();
        assert_eq!(ops::repr(&l).unwrap(), "[1, 'a']");
    }
}
