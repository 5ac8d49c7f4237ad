//! Generic operations.
//!
//! Every operation dispatches through the slot pointers of the operand's
//! type at the time of the call, so patched slots take effect immediately.

use crate::error::{RtResult, RuntimeError};
use crate::object::attr;
use crate::object::protocols::{MappingMethods, NumberMethods, SequenceMethods};
use crate::object::type_obj::{BinaryFunc, TypeObject, UnaryFunc};
use crate::object::Obj;
use crate::types::int::{self, Num};
use crate::types::{string, tuple};

#[inline]
fn type_of(obj: &Obj) -> &TypeObject {
    // Safety: a live object always has a live type.
    unsafe { &*obj.type_ptr() }
}

#[inline]
fn number(obj: &Obj) -> Option<&NumberMethods> {
    // Safety: table pointers are null or live tables.
    unsafe { type_of(obj).tp_as_number.as_ref() }
}

#[inline]
fn sequence(obj: &Obj) -> Option<&SequenceMethods> {
    // Safety: table pointers are null or live tables.
    unsafe { type_of(obj).tp_as_sequence.as_ref() }
}

#[inline]
fn mapping(obj: &Obj) -> Option<&MappingMethods> {
    // Safety: table pointers are null or live tables.
    unsafe { type_of(obj).tp_as_mapping.as_ref() }
}

// =============================================================================
// Numeric
// =============================================================================

fn binary_op(a: &Obj, b: &Obj, sym: &str, select: fn(&NumberMethods) -> Option<BinaryFunc>) -> RtResult<Obj> {
    match number(a).and_then(select) {
        Some(f) => f(a, b),
        None => Err(int::unsupported(sym, a, b)),
    }
}

fn unary_op(a: &Obj, name: &str, select: fn(&NumberMethods) -> Option<UnaryFunc>) -> RtResult<Obj> {
    match number(a).and_then(select) {
        Some(f) => f(a),
        None => Err(RuntimeError::type_error(format!(
            "bad operand type for {}: '{}'",
            name,
            a.type_name()
        ))),
    }
}

/// `a + b`
pub fn add(a: &Obj, b: &Obj) -> RtResult<Obj> {
    if let Some(f) = number(a).and_then(|n| n.nb_add) {
        return f(a, b);
    }
    match sequence(a).and_then(|s| s.sq_concat) {
        Some(f) => f(a, b),
        None => Err(int::unsupported("+", a, b)),
    }
}

/// `a - b`
pub fn sub(a: &Obj, b: &Obj) -> RtResult<Obj> {
    binary_op(a, b, "-", |n| n.nb_subtract)
}

/// `a * b`
pub fn mul(a: &Obj, b: &Obj) -> RtResult<Obj> {
    binary_op(a, b, "*", |n| n.nb_multiply)
}

/// `a % b`
pub fn rem(a: &Obj, b: &Obj) -> RtResult<Obj> {
    binary_op(a, b, "%", |n| n.nb_remainder)
}

/// `a // b`
pub fn floordiv(a: &Obj, b: &Obj) -> RtResult<Obj> {
    binary_op(a, b, "//", |n| n.nb_floor_divide)
}

/// `a / b`
pub fn truediv(a: &Obj, b: &Obj) -> RtResult<Obj> {
    binary_op(a, b, "/", |n| n.nb_true_divide)
}

/// `a @ b`
pub fn matmul(a: &Obj, b: &Obj) -> RtResult<Obj> {
    binary_op(a, b, "@", |n| n.nb_matrix_multiply)
}

/// `-a`
pub fn neg(a: &Obj) -> RtResult<Obj> {
    unary_op(a, "unary -", |n| n.nb_negative)
}

/// `+a`
pub fn pos(a: &Obj) -> RtResult<Obj> {
    unary_op(a, "unary +", |n| n.nb_positive)
}

/// `abs(a)`
pub fn abs(a: &Obj) -> RtResult<Obj> {
    unary_op(a, "abs()", |n| n.nb_absolute)
}

/// `~a`
pub fn invert(a: &Obj) -> RtResult<Obj> {
    unary_op(a, "unary ~", |n| n.nb_invert)
}

/// `bool(a)`
pub fn truthy(a: &Obj) -> RtResult<bool> {
    if let Some(f) = number(a).and_then(|n| n.nb_bool) {
        return f(a);
    }
    if let Some(f) = mapping(a).and_then(|m| m.mp_length) {
        return Ok(f(a)? > 0);
    }
    if let Some(f) = sequence(a).and_then(|s| s.sq_length) {
        return Ok(f(a)? > 0);
    }
    Ok(true)
}

// =============================================================================
// Containers
// =============================================================================

/// `len(a)`
pub fn len(a: &Obj) -> RtResult<usize> {
    if let Some(f) = sequence(a).and_then(|s| s.sq_length) {
        return f(a);
    }
    match mapping(a).and_then(|m| m.mp_length) {
        Some(f) => f(a),
        None => Err(RuntimeError::type_error(format!(
            "object of type '{}' has no len()",
            a.type_name()
        ))),
    }
}

/// Resolve a negative sequence index against the sequence length.
fn sequence_index(a: &Obj, key: &Obj) -> RtResult<isize> {
    let i = int::index(key)?;
    if i >= 0 {
        return Ok(i);
    }
    match sequence(a).and_then(|s| s.sq_length) {
        Some(f) => Ok(i + f(a)? as isize),
        None => Ok(i),
    }
}

/// `a[key]`
pub fn getitem(a: &Obj, key: &Obj) -> RtResult<Obj> {
    if let Some(f) = mapping(a).and_then(|m| m.mp_subscript) {
        return f(a, key);
    }
    match sequence(a).and_then(|s| s.sq_item) {
        Some(f) if int::check(key) => f(a, sequence_index(a, key)?),
        Some(_) => Err(RuntimeError::type_error(format!(
            "{} indices must be integers, not {}",
            a.type_name(),
            key.type_name()
        ))),
        None => Err(RuntimeError::type_error(format!(
            "'{}' object is not subscriptable",
            a.type_name()
        ))),
    }
}

fn assign_item(a: &Obj, key: &Obj, value: Option<&Obj>) -> RtResult<()> {
    if let Some(f) = mapping(a).and_then(|m| m.mp_ass_subscript) {
        return f(a, key, value);
    }
    match sequence(a).and_then(|s| s.sq_ass_item) {
        Some(f) if int::check(key) => f(a, sequence_index(a, key)?, value),
        _ => Err(RuntimeError::type_error(format!(
            "'{}' object does not support item {}",
            a.type_name(),
            if value.is_some() { "assignment" } else { "deletion" }
        ))),
    }
}

/// `a[key] = value`
pub fn setitem(a: &Obj, key: &Obj, value: &Obj) -> RtResult<()> {
    assign_item(a, key, Some(value))
}

/// `del a[key]`
pub fn delitem(a: &Obj, key: &Obj) -> RtResult<()> {
    assign_item(a, key, None)
}

/// `item in container`
pub fn contains(container: &Obj, item: &Obj) -> RtResult<bool> {
    match sequence(container).and_then(|s| s.sq_contains) {
        Some(f) => f(container, item),
        None => Err(RuntimeError::type_error(format!(
            "argument of type '{}' is not iterable",
            container.type_name()
        ))),
    }
}

// =============================================================================
// Object Protocol
// =============================================================================

/// `repr(a)`
pub fn repr(a: &Obj) -> RtResult<String> {
    let Some(f) = type_of(a).tp_repr else {
        return Ok(format!("<{} object at {:#x}>", a.type_name(), a.addr()));
    };
    let text = f(a)?;
    if !string::check(&text) {
        return Err(RuntimeError::type_error(format!(
            "__repr__ returned non-string (type {})",
            text.type_name()
        )));
    }
    string::as_str(&text).map(str::to_owned)
}

/// `hash(a)`
pub fn hash(a: &Obj) -> RtResult<i64> {
    match type_of(a).tp_hash {
        Some(f) => f(a),
        None => Err(RuntimeError::type_error(format!(
            "unhashable type: '{}'",
            a.type_name()
        ))),
    }
}

/// `a(*args)`
#[inline]
pub fn call(a: &Obj, args: &[Obj]) -> RtResult<Obj> {
    attr::call(a, args)
}

/// Value equality for the built-in kinds, identity for everything else.
pub fn equals(a: &Obj, b: &Obj) -> RtResult<bool> {
    if a.is(b) {
        return Ok(true);
    }
    if let (Some(x), Some(y)) = (Num::of(a), Num::of(b)) {
        return Ok(match (x?, y?) {
            (Num::Int(x), Num::Int(y)) => x == y,
            (x, y) => x.as_f64() == y.as_f64(),
        });
    }
    if string::check(a) && string::check(b) {
        return Ok(string::as_str(a)? == string::as_str(b)?);
    }
    if tuple::check(a) && tuple::check(b) {
        let (xs, ys) = (tuple::items(a)?, tuple::items(b)?);
        if xs.len() != ys.len() {
            return Ok(false);
        }
        for (x, y) in xs.iter().zip(&ys) {
            if !equals(x, y)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{dict, float, list, none};

    #[test]
    fn test_arithmetic_dispatch() {
        let r = add(&int::new(2).unwrap(), &int::new(3).unwrap()).unwrap();
        assert_eq!(int::value(&r).unwrap(), 5);
        let r = mul(&float::new(1.5).unwrap(), &int::new(2).unwrap()).unwrap();
        assert_eq!(float::value(&r).unwrap(), 3.0);
    }

    #[test]
    fn test_unsupported_operands() {
        let err = add(&int::new(1).unwrap(), &string::new("a").unwrap()).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Type("unsupported operand type(s) for +: 'int' and 'str'".into())
        );
        let err = sub(&none(), &int::new(1).unwrap()).unwrap_err();
        assert_eq!(err.kind(), "TypeError");
    }

    #[test]
    fn test_concat_through_sequence() {
        let r = add(&string::new("ab").unwrap(), &string::new("cd").unwrap()).unwrap();
        assert_eq!(string::as_str(&r).unwrap(), "abcd");
    }

    #[test]
    fn test_item_access() {
        let l = list::new(&[int::new(1).unwrap(), int::new(2).unwrap()]).unwrap();
        assert_eq!(int::value(&getitem(&l, &int::new(-1).unwrap()).unwrap()).unwrap(), 2);
        setitem(&l, &int::new(0).unwrap(), &int::new(9).unwrap()).unwrap();
        assert_eq!(int::value(&getitem(&l, &int::new(0).unwrap()).unwrap()).unwrap(), 9);
        delitem(&l, &int::new(0).unwrap()).unwrap();
        assert_eq!(len(&l).unwrap(), 1);

        let d = dict::new().unwrap();
        setitem(&d, &string::new("k").unwrap(), &int::new(1).unwrap()).unwrap();
        assert!(contains(&d, &string::new("k").unwrap()).unwrap());
        assert_eq!(len(&d).unwrap(), 1);
    }

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&int::new(0).unwrap()).unwrap());
        assert!(truthy(&string::new("x").unwrap()).unwrap());
        assert!(!truthy(&list::new(&[]).unwrap()).unwrap());
        assert!(!truthy(&none()).unwrap());
    }

    #[test]
    fn test_hash_and_unhashable() {
        assert_eq!(hash(&int::new(5).unwrap()).unwrap(), 5);
        let err = hash(&list::new(&[]).unwrap()).unwrap_err();
        assert_eq!(err, RuntimeError::Type("unhashable type: 'list'".into()));
    }

    #[test]
    fn test_equals() {
        assert!(equals(&int::new(1).unwrap(), &float::new(1.0).unwrap()).unwrap());
        assert!(equals(&string::new("a").unwrap(), &string::new("a").unwrap()).unwrap());
        assert!(!equals(&string::new("a").unwrap(), &int::new(1).unwrap()).unwrap());
    }

    #[test]
    fn test_matmul_unsupported_on_int() {
        let err = matmul(&int::new(1).unwrap(), &int::new(2).unwrap()).unwrap_err();
        assert_eq!(err.kind(), "TypeError");
    }
}
