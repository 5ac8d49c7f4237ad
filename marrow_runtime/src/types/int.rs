//! Integer objects.
//!
//! Integers store their magnitude as little-endian 30-bit digits after a
//! variable-size header. The sign lives in `ob_size`: its absolute value is
//! the digit count and zero has no digits at all.
//!
//! ```text
//!   offset 0   VarHeader     (ob_size = ±ndigits)
//!   offset 24  ob_digit[0]   u32, low 30 bits used
//!   offset 28  ob_digit[1]
//!   ...
//! ```
//!
//! Arithmetic is performed on `i64` values and reports overflow instead of
//! growing.

use crate::error::{RtResult, RuntimeError};
use crate::object::lifecycle::alloc_object;
use crate::object::protocols::NumberMethods;
use crate::object::type_obj::{TypeFlags, TypeObject};
use crate::object::{Obj, VarHeader};
use crate::types::{builtins, float, string};

use smallvec::SmallVec;

/// Bits used per digit.
pub const DIGIT_BITS: u32 = 30;
/// Mask selecting the used bits of a digit.
pub const DIGIT_MASK: u32 = (1 << DIGIT_BITS) - 1;

/// Integer object body.
#[repr(C)]
pub struct IntObject {
    pub ob_base: VarHeader,
    pub ob_digit: [u32; 0],
}

/// Create an integer.
pub fn new(value: i64) -> RtResult<Obj> {
    let mut mag = value.unsigned_abs();
    let mut digits: SmallVec<[u32; 3]> = SmallVec::new();
    while mag != 0 {
        digits.push((mag & DIGIT_MASK as u64) as u32);
        mag >>= DIGIT_BITS;
    }
    // Safety: `int` is live and ready.
    let obj = unsafe { alloc_object(builtins().int_type(), digits.len())? };
    let body = obj.as_ptr().cast::<IntObject>();
    // Safety: the block holds `digits.len()` trailing digits.
    unsafe {
        let out = (&raw mut (*body).ob_digit).cast::<u32>();
        std::ptr::copy_nonoverlapping(digits.as_ptr(), out, digits.len());
        if value < 0 {
            (*body).ob_base.ob_size = -(digits.len() as isize);
        }
    }
    Ok(obj)
}

/// Integer for a truth value.
#[inline]
pub fn from_bool(value: bool) -> RtResult<Obj> {
    new(value as i64)
}

/// Whether `obj` is an integer.
#[inline]
pub fn check(obj: &Obj) -> bool {
    obj.type_flags().contains(TypeFlags::INT_SUBCLASS)
}

/// Sign and digits of an integer.
pub fn digits(obj: &Obj) -> (isize, Vec<u32>) {
    let body = obj.as_ptr().cast::<IntObject>();
    // Safety: `obj` is an integer with |ob_size| trailing digits.
    unsafe {
        let size = (*body).ob_base.ob_size;
        let n = size.unsigned_abs();
        let ptr = (&raw const (*body).ob_digit).cast::<u32>();
        (size.signum(), std::slice::from_raw_parts(ptr, n).to_vec())
    }
}

/// Value of an integer.
pub fn value(obj: &Obj) -> RtResult<i64> {
    if !check(obj) {
        return Err(RuntimeError::type_error(format!(
            "an integer is required (got type {})",
            obj.type_name()
        )));
    }
    let (sign, digits) = digits(obj);
    let mut mag: i128 = 0;
    for (i, &d) in digits.iter().enumerate() {
        let shifted = (i as u32)
            .checked_mul(DIGIT_BITS)
            .filter(|&s| s < 96)
            .map(|s| i128::from(d & DIGIT_MASK) << s);
        mag += match shifted {
            Some(v) => v,
            None if d == 0 => 0,
            None => return Err(too_large()),
        };
    }
    i64::try_from(sign as i128 * mag).map_err(|_| too_large())
}

/// Value of an integer as an index.
pub fn index(obj: &Obj) -> RtResult<isize> {
    let v = value(obj)?;
    isize::try_from(v).map_err(|_| too_large())
}

fn too_large() -> RuntimeError {
    RuntimeError::Overflow("Python int too large to convert to C long".into())
}

// =============================================================================
// Numeric Coercion
// =============================================================================

/// An operand of mixed int/float arithmetic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    /// Read an int or float operand; `None` for anything else.
    pub(crate) fn of(obj: &Obj) -> Option<RtResult<Num>> {
        if check(obj) {
            Some(value(obj).map(Num::Int))
        } else if float::check(obj) {
            Some(float::value(obj).map(Num::Float))
        } else {
            None
        }
    }

    #[inline]
    pub(crate) fn as_f64(self) -> f64 {
        match self {
            Num::Int(v) => v as f64,
            Num::Float(v) => v,
        }
    }
}

/// Unsupported operand error for a binary operator.
pub(crate) fn unsupported(op: &str, a: &Obj, b: &Obj) -> RuntimeError {
    RuntimeError::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op,
        a.type_name(),
        b.type_name()
    ))
}

fn overflow(op: &str) -> RuntimeError {
    RuntimeError::Overflow(format!("integer overflow in {op}"))
}

/// Apply a binary operator to two numeric operands.
pub(crate) fn binary(
    a: &Obj,
    b: &Obj,
    op: &str,
    int_op: fn(i64, i64) -> RtResult<i64>,
    float_op: fn(f64, f64) -> RtResult<f64>,
) -> RtResult<Obj> {
    match (Num::of(a), Num::of(b)) {
        (Some(x), Some(y)) => match (x?, y?) {
            (Num::Int(x), Num::Int(y)) => new(int_op(x, y)?),
            (x, y) => float::new(float_op(x.as_f64(), y.as_f64())?),
        },
        _ => Err(unsupported(op, a, b)),
    }
}

fn int_div_zero() -> RuntimeError {
    RuntimeError::ZeroDivision("integer division or modulo by zero".into())
}

pub(crate) fn floor_div_i64(x: i64, y: i64) -> RtResult<i64> {
    if y == 0 {
        return Err(int_div_zero());
    }
    let q = x.checked_div(y).ok_or_else(|| overflow("//"))?;
    Ok(if x % y != 0 && ((x < 0) != (y < 0)) { q - 1 } else { q })
}

pub(crate) fn mod_i64(x: i64, y: i64) -> RtResult<i64> {
    if y == 0 {
        return Err(int_div_zero());
    }
    let r = x.checked_rem(y).unwrap_or(0);
    Ok(if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r })
}

pub(crate) fn floor_div_f64(x: f64, y: f64) -> RtResult<f64> {
    if y == 0.0 {
        return Err(RuntimeError::ZeroDivision("float floor division by zero".into()));
    }
    Ok((x / y).floor())
}

pub(crate) fn mod_f64(x: f64, y: f64) -> RtResult<f64> {
    if y == 0.0 {
        return Err(RuntimeError::ZeroDivision("float modulo".into()));
    }
    let r = x % y;
    Ok(if r != 0.0 && ((r < 0.0) != (y < 0.0)) { r + y } else { r })
}

pub(crate) fn true_div_f64(x: f64, y: f64) -> RtResult<f64> {
    if y == 0.0 {
        return Err(RuntimeError::ZeroDivision("division by zero".into()));
    }
    Ok(x / y)
}

// =============================================================================
// Slots
// =============================================================================

fn int_add(a: &Obj, b: &Obj) -> RtResult<Obj> {
    binary(a, b, "+", |x, y| x.checked_add(y).ok_or_else(|| overflow("+")), |x, y| Ok(x + y))
}

fn int_sub(a: &Obj, b: &Obj) -> RtResult<Obj> {
    binary(a, b, "-", |x, y| x.checked_sub(y).ok_or_else(|| overflow("-")), |x, y| Ok(x - y))
}

fn int_mul(a: &Obj, b: &Obj) -> RtResult<Obj> {
    binary(a, b, "*", |x, y| x.checked_mul(y).ok_or_else(|| overflow("*")), |x, y| Ok(x * y))
}

fn int_mod(a: &Obj, b: &Obj) -> RtResult<Obj> {
    binary(a, b, "%", mod_i64, mod_f64)
}

fn int_floordiv(a: &Obj, b: &Obj) -> RtResult<Obj> {
    binary(a, b, "//", floor_div_i64, floor_div_f64)
}

fn int_truediv(a: &Obj, b: &Obj) -> RtResult<Obj> {
    match (Num::of(a), Num::of(b)) {
        (Some(x), Some(y)) => float::new(true_div_f64(x?.as_f64(), y?.as_f64())?),
        _ => Err(unsupported("/", a, b)),
    }
}

fn int_neg(a: &Obj) -> RtResult<Obj> {
    new(value(a)?.checked_neg().ok_or_else(|| overflow("-"))?)
}

fn int_pos(a: &Obj) -> RtResult<Obj> {
    new(value(a)?)
}

fn int_abs(a: &Obj) -> RtResult<Obj> {
    new(value(a)?.checked_abs().ok_or_else(|| overflow("abs"))?)
}

fn int_invert(a: &Obj) -> RtResult<Obj> {
    new(!value(a)?)
}

fn int_bool(a: &Obj) -> RtResult<bool> {
    Ok(value(a)? != 0)
}

fn int_float(a: &Obj) -> RtResult<Obj> {
    float::new(value(a)? as f64)
}

fn int_repr(a: &Obj) -> RtResult<Obj> {
    string::new(&value(a)?.to_string())
}

fn int_hash(a: &Obj) -> RtResult<i64> {
    Ok(match value(a)? {
        -1 => -2,
        v => v,
    })
}

/// Install the integer kind's hooks and slots.
pub(crate) fn init_type(t: &mut TypeObject) {
    t.tp_repr = Some(int_repr);
    t.tp_hash = Some(int_hash);
    t.tp_as_number = Box::into_raw(Box::new(NumberMethods {
        nb_add: Some(int_add),
        nb_subtract: Some(int_sub),
        nb_multiply: Some(int_mul),
        nb_remainder: Some(int_mod),
        nb_negative: Some(int_neg),
        nb_positive: Some(int_pos),
        nb_absolute: Some(int_abs),
        nb_bool: Some(int_bool),
        nb_invert: Some(int_invert),
        nb_int: Some(int_pos),
        nb_float: Some(int_float),
        nb_floor_divide: Some(int_floordiv),
        nb_true_divide: Some(int_truediv),
        nb_matrix_multiply: None,
    }));
}
