//! Tuple objects.
//!
//! Items are stored inline after a variable-size header; the tuple owns a
//! reference to each.

use crate::error::{RtResult, RuntimeError};
use crate::object::lifecycle::alloc_object;
use crate::object::protocols::SequenceMethods;
use crate::object::type_obj::{TypeFlags, TypeObject};
use crate::object::{Obj, ObjectHeader, VarHeader, xdecref};
use crate::ops;
use crate::types::{builtins, string};

use rustc_hash::FxHasher;
use std::hash::Hasher;

/// Tuple object body.
#[repr(C)]
pub struct TupleObject {
    pub ob_base: VarHeader,
    pub ob_item: [*mut ObjectHeader; 0],
}

/// Create a tuple holding new references to `items`.
pub fn new(items: &[Obj]) -> RtResult<Obj> {
    // Safety: `tuple` is live and ready.
    let obj = unsafe { alloc_object(builtins().tuple_type(), items.len())? };
    let slots = item_ptr(&obj);
    for (i, item) in items.iter().enumerate() {
        // Safety: the block holds `items.len()` slots.
        unsafe { *slots.add(i) = item.clone().into_raw() };
    }
    Ok(obj)
}

/// Whether `obj` is a tuple.
#[inline]
pub fn check(obj: &Obj) -> bool {
    obj.type_flags().contains(TypeFlags::TUPLE_SUBCLASS)
}

#[inline]
fn item_ptr(obj: &Obj) -> *mut *mut ObjectHeader {
    // Safety: tuple bodies start with the header followed by the items.
    unsafe { (&raw mut (*obj.as_ptr().cast::<TupleObject>()).ob_item).cast() }
}

/// Number of items.
pub fn len(obj: &Obj) -> usize {
    // Safety: tuple bodies start with a var header.
    unsafe { (*obj.as_ptr().cast::<VarHeader>()).ob_size.max(0) as usize }
}

/// Item at `index`.
pub fn get(obj: &Obj, index: usize) -> RtResult<Obj> {
    if index >= len(obj) {
        return Err(RuntimeError::index_error("tuple index out of range"));
    }
    // Safety: index is in bounds; slots hold null or owned references.
    unsafe { Obj::from_borrowed_ptr(*item_ptr(obj).add(index)) }
        .ok_or_else(|| RuntimeError::value_error("tuple slot is empty"))
}

/// All items.
pub fn items(obj: &Obj) -> RtResult<Vec<Obj>> {
    (0..len(obj)).map(|i| get(obj, i)).collect()
}

// =============================================================================
// Slots
// =============================================================================

unsafe fn tuple_traverse(op: *mut ObjectHeader, visit: &mut dyn FnMut(*mut ObjectHeader)) {
    // Safety: caller guarantees `op` is a live tuple.
    unsafe {
        let n = (*op.cast::<VarHeader>()).ob_size.max(0) as usize;
        let slots = (&raw mut (*op.cast::<TupleObject>()).ob_item).cast::<*mut ObjectHeader>();
        for i in 0..n {
            let child = *slots.add(i);
            if !child.is_null() {
                visit(child);
            }
        }
    }
}

unsafe fn tuple_clear(op: *mut ObjectHeader) {
    // Safety: caller guarantees `op` is a live tuple.
    unsafe {
        let n = (*op.cast::<VarHeader>()).ob_size.max(0) as usize;
        let slots = (&raw mut (*op.cast::<TupleObject>()).ob_item).cast::<*mut ObjectHeader>();
        for i in 0..n {
            let child = std::mem::replace(&mut *slots.add(i), std::ptr::null_mut());
            xdecref(child);
        }
    }
}

fn tuple_len(a: &Obj) -> RtResult<usize> {
    Ok(len(a))
}

fn tuple_concat(a: &Obj, b: &Obj) -> RtResult<Obj> {
    if !check(b) {
        return Err(RuntimeError::type_error(format!(
            "can only concatenate tuple (not \"{}\") to tuple",
            b.type_name()
        )));
    }
    let mut all = items(a)?;
    all.extend(items(b)?);
    new(&all)
}

fn tuple_item(a: &Obj, index: isize) -> RtResult<Obj> {
    usize::try_from(index)
        .map_err(|_| RuntimeError::index_error("tuple index out of range"))
        .and_then(|i| get(a, i))
}

fn tuple_contains(a: &Obj, b: &Obj) -> RtResult<bool> {
    for item in items(a)? {
        if ops::equals(&item, b)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn tuple_repr(a: &Obj) -> RtResult<Obj> {
    let parts = items(a)?
        .iter()
        .map(ops::repr)
        .collect::<RtResult<Vec<_>>>()?;
    let text = match parts.len() {
        1 => format!("({},)", parts[0]),
        _ => format!("({})", parts.join(", ")),
    };
    string::new(&text)
}

fn tuple_hash(a: &Obj) -> RtResult<i64> {
    let mut hasher = FxHasher::default();
    for item in items(a)? {
        hasher.write_i64(ops::hash(&item)?);
    }
    Ok(match hasher.finish() as i64 {
        -1 => -2,
        h => h,
    })
}

/// Install the tuple kind's hooks and slots.
pub(crate) fn init_type(t: &mut TypeObject) {
    t.tp_traverse = Some(tuple_traverse);
    t.tp_clear = Some(tuple_clear);
    t.tp_repr = Some(tuple_repr);
    t.tp_hash = Some(tuple_hash);
    t.tp_as_sequence = Box::into_raw(Box::new(SequenceMethods {
        sq_length: Some(tuple_len),
        sq_concat: Some(tuple_concat),
        sq_item: Some(tuple_item),
        sq_ass_item: None,
        sq_contains: Some(tuple_contains),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::int;

    #[test]
    fn test_items_and_size() {
        let t = new(&[int::new(1).unwrap(), int::new(2).unwrap()]).unwrap();
        assert_eq!(len(&t), 2);
        assert_eq!(int::value(&get(&t, 1).unwrap()).unwrap(), 2);
        assert_eq!(marrow_gc::heap().requested_size(t.addr()), Some(40));
        assert_eq!(get(&t, 2).unwrap_err().kind(), "IndexError");
    }

    #[test]
    fn test_repr() {
        let one = new(&[int::new(1).unwrap()]).unwrap();
        assert_eq!(ops::repr(&one).unwrap(), "(1,)");
        let two = new(&[int::new(1).unwrap(), string::new("a").unwrap()]).unwrap();
        assert_eq!(ops::repr(&two).unwrap(), "(1, 'a')");
    }

    #[test]
    fn test_contains_and_concat() {
        let a = new(&[int::new(1).unwrap()]).unwrap();
        let b = new(&[int::new(2).unwrap()]).unwrap();
        let c = tuple_concat(&a, &b).unwrap();
        assert_eq!(len(&c), 2);
        assert!(tuple_contains(&c, &int::new(2).unwrap()).unwrap());
        assert!(!tuple_contains(&c, &int::new(3).unwrap()).unwrap());
    }

    #[test]
    fn test_hash_is_structural() {
        let a = new(&[int::new(1).unwrap(), int::new(2).unwrap()]).unwrap();
        let b = new(&[int::new(1).unwrap(), int::new(2).unwrap()]).unwrap();
        assert_eq!(tuple_hash(&a).unwrap(), tuple_hash(&b).unwrap());
    }
}
