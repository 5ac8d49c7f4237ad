//! Float objects.

use crate::error::{RtResult, RuntimeError};
use crate::object::lifecycle::alloc_object;
use crate::object::protocols::NumberMethods;
use crate::object::type_obj::{TypeFlags, TypeObject};
use crate::object::{Obj, ObjectHeader};
use crate::types::int::{self, Num, binary, floor_div_f64, mod_f64, true_div_f64, unsupported};
use crate::types::{builtins, string};

use rustc_hash::FxHasher;
use std::hash::Hasher;

/// Float object body.
#[repr(C)]
pub struct FloatObject {
    pub ob_base: ObjectHeader,
    pub ob_fval: f64,
}

/// Create a float.
pub fn new(value: f64) -> RtResult<Obj> {
    // Safety: `float` is live and ready.
    let obj = unsafe { alloc_object(builtins().float_type(), 0)? };
    // Safety: the block is a float body.
    unsafe { (*obj.as_ptr().cast::<FloatObject>()).ob_fval = value };
    Ok(obj)
}

/// Whether `obj` is a float.
#[inline]
pub fn check(obj: &Obj) -> bool {
    obj.type_flags().contains(TypeFlags::FLOAT_SUBCLASS)
}

/// Value of a float (integers are converted).
pub fn value(obj: &Obj) -> RtResult<f64> {
    if check(obj) {
        // Safety: `obj` is a float body.
        return Ok(unsafe { (*obj.as_ptr().cast::<FloatObject>()).ob_fval });
    }
    if int::check(obj) {
        return Ok(int::value(obj)? as f64);
    }
    Err(RuntimeError::type_error(format!(
        "must be real number, not {}",
        obj.type_name()
    )))
}

/// Text form of a float, always showing a fractional part or exponent.
pub fn format(v: f64) -> String {
    if v.is_nan() {
        "nan".into()
    } else if v.is_infinite() {
        if v > 0.0 { "inf".into() } else { "-inf".into() }
    } else if v.fract() == 0.0 && v.abs() < 1e16 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

// =============================================================================
// Slots
// =============================================================================

fn float_add(a: &Obj, b: &Obj) -> RtResult<Obj> {
    binary(a, b, "+", |x, y| Ok(x.wrapping_add(y)), |x, y| Ok(x + y))
}

fn float_sub(a: &Obj, b: &Obj) -> RtResult<Obj> {
    binary(a, b, "-", |x, y| Ok(x.wrapping_sub(y)), |x, y| Ok(x - y))
}

fn float_mul(a: &Obj, b: &Obj) -> RtResult<Obj> {
    binary(a, b, "*", |x, y| Ok(x.wrapping_mul(y)), |x, y| Ok(x * y))
}

fn float_mod(a: &Obj, b: &Obj) -> RtResult<Obj> {
    float_op(a, b, "%", mod_f64)
}

fn float_floordiv(a: &Obj, b: &Obj) -> RtResult<Obj> {
    float_op(a, b, "//", floor_div_f64)
}

fn float_truediv(a: &Obj, b: &Obj) -> RtResult<Obj> {
    float_op(a, b, "/", true_div_f64)
}

/// Binary operator whose result is always a float.
fn float_op(a: &Obj, b: &Obj, op: &str, f: fn(f64, f64) -> RtResult<f64>) -> RtResult<Obj> {
    match (Num::of(a), Num::of(b)) {
        (Some(x), Some(y)) => new(f(x?.as_f64(), y?.as_f64())?),
        _ => Err(unsupported(op, a, b)),
    }
}

fn float_neg(a: &Obj) -> RtResult<Obj> {
    new(-value(a)?)
}

fn float_pos(a: &Obj) -> RtResult<Obj> {
    new(value(a)?)
}

fn float_abs(a: &Obj) -> RtResult<Obj> {
    new(value(a)?.abs())
}

fn float_bool(a: &Obj) -> RtResult<bool> {
    Ok(value(a)? != 0.0)
}

fn float_int(a: &Obj) -> RtResult<Obj> {
    let v = value(a)?;
    if !v.is_finite() {
        return Err(RuntimeError::Overflow("cannot convert float infinity or NaN to integer".into()));
    }
    let t = v.trunc();
    if t < i64::MIN as f64 || t >= i64::MAX as f64 {
        return Err(RuntimeError::Overflow("float too large to convert".into()));
    }
    int::new(t as i64)
}

fn float_repr(a: &Obj) -> RtResult<Obj> {
    string::new(&format(value(a)?))
}

fn float_hash(a: &Obj) -> RtResult<i64> {
    let v = value(a)?;
    if v.fract() == 0.0 && v.abs() < 9.0e18 {
        return Ok(match v as i64 {
            -1 => -2,
            i => i,
        });
    }
    let mut hasher = FxHasher::default();
    hasher.write_u64(v.to_bits());
    Ok(match hasher.finish() as i64 {
        -1 => -2,
        h => h,
    })
}

/// Install the float kind's hooks and slots.
pub(crate) fn init_type(t: &mut TypeObject) {
    t.tp_repr = Some(float_repr);
    t.tp_hash = Some(float_hash);
    t.tp_as_number = Box::into_raw(Box::new(NumberMethods {
        nb_add: Some(float_add),
        nb_subtract: Some(float_sub),
        nb_multiply: Some(float_mul),
        nb_remainder: Some(float_mod),
        nb_negative: Some(float_neg),
        nb_positive: Some(float_pos),
        nb_absolute: Some(float_abs),
        nb_bool: Some(float_bool),
        nb_invert: None,
        nb_int: Some(float_int),
        nb_float: Some(float_pos),
        nb_floor_divide: Some(float_floordiv),
        nb_true_divide: Some(float_truediv),
        nb_matrix_multiply: None,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_round_trip() {
        let f = new(2.25).unwrap();
        assert_eq!(value(&f).unwrap(), 2.25);
        assert_eq!(marrow_gc::heap().requested_size(f.addr()), Some(24));
    }

    #[test]
    fn test_format() {
        assert_eq!(format(1.0), "1.0");
        assert_eq!(format(0.5), "0.5");
        assert_eq!(format(f64::INFINITY), "inf");
    }

    #[test]
    fn test_hash_matches_int_for_whole_numbers() {
        assert_eq!(float_hash(&new(3.0).unwrap()).unwrap(), 3);
    }

    #[test]
    fn test_int_conversion() {
        assert_eq!(int::value(&float_int(&new(-2.7).unwrap()).unwrap()).unwrap(), -2);
        assert!(float_int(&new(f64::NAN).unwrap()).is_err());
    }

    #[test]
    fn test_division_by_zero() {
        let err = float_truediv(&new(1.0).unwrap(), &new(0.0).unwrap()).unwrap_err();
        assert_eq!(err.kind(), "ZeroDivisionError");
    }
}
