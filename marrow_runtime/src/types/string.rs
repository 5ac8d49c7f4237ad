//! String objects.
//!
//! Strings are compact: the UTF-8 text follows the fixed part of the body
//! and is NUL terminated.
//!
//! ```text
//!   offset 0   ObjectHeader
//!   offset 16  length   isize   bytes of text
//!   offset 24  hash     i64     -1 until computed
//!   offset 32  state    u32     interned:2 kind:3 compact:1 ascii:1 ready:1
//!   offset 40  text..., NUL
//! ```
//!
//! Interned strings are registered in a table keyed by their text. The
//! table does not own a reference; a string removes itself when freed.

use crate::error::{RtResult, RuntimeError};
use crate::object::lifecycle::alloc_object;
use crate::object::protocols::SequenceMethods;
use crate::object::type_obj::{TypeFlags, TypeObject};
use crate::object::{Obj, ObjectHeader};
use crate::types::{Builtins, builtins};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::Hasher;
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Mask of the interned state bits.
pub const STATE_INTERNED_MASK: u32 = 0b11;
/// Shift of the character kind bits.
pub const STATE_KIND_SHIFT: u32 = 2;
/// Text is stored inline after the header.
pub const STATE_COMPACT: u32 = 1 << 5;
/// Text is pure ASCII.
pub const STATE_ASCII: u32 = 1 << 6;
/// Body is fully initialised.
pub const STATE_READY: u32 = 1 << 7;

/// Interned state: interned and kept alive by its owners only.
pub const INTERNED_MORTAL: u32 = 1;

/// Hash value meaning "not yet computed".
pub const HASH_NOT_COMPUTED: i64 = -1;

/// String object body (text follows).
#[repr(C)]
pub struct StrObject {
    pub ob_base: ObjectHeader,
    pub length: isize,
    pub hash: i64,
    pub state: u32,
    pub _pad: u32,
}

/// Offset of the text from the object address.
pub const DATA_OFFSET: usize = size_of::<StrObject>();

static INTERNED: OnceLock<Mutex<FxHashMap<Box<str>, usize>>> = OnceLock::new();

fn interned() -> &'static Mutex<FxHashMap<Box<str>, usize>> {
    INTERNED.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Create a string.
pub fn new(text: &str) -> RtResult<Obj> {
    new_in(builtins(), text)
}

pub(crate) fn new_in(b: &Builtins, text: &str) -> RtResult<Obj> {
    // Safety: `str` is live and ready.
    let obj = unsafe { alloc_object(b.str_type(), text.len() + 1)? };
    let body = obj.as_ptr().cast::<StrObject>();
    let mut state = STATE_COMPACT | STATE_READY | (1 << STATE_KIND_SHIFT);
    if text.is_ascii() {
        state |= STATE_ASCII;
    }
    // Safety: the block holds `len + 1` bytes of text; it is zeroed so the
    // terminator is already in place.
    unsafe {
        (*body).length = text.len() as isize;
        (*body).hash = HASH_NOT_COMPUTED;
        (*body).state = state;
        let data = obj.as_ptr().cast::<u8>().add(DATA_OFFSET);
        std::ptr::copy_nonoverlapping(text.as_ptr(), data, text.len());
    }
    Ok(obj)
}

/// The canonical interned string for `text`.
pub fn intern(text: &str) -> RtResult<Obj> {
    {
        let table = interned().lock();
        if let Some(&addr) = table.get(text) {
            // Safety: interned strings unregister themselves when freed.
            return Ok(unsafe { Obj::from_borrowed(NonNull::new_unchecked(addr as *mut ObjectHeader)) });
        }
    }
    let obj = new(text)?;
    // Safety: `obj` is a string body.
    unsafe { (*obj.as_ptr().cast::<StrObject>()).state |= INTERNED_MORTAL };
    interned().lock().insert(text.into(), obj.addr());
    Ok(obj)
}

/// Whether `obj` is a string.
#[inline]
pub fn check(obj: &Obj) -> bool {
    obj.type_flags().contains(TypeFlags::STR_SUBCLASS)
}

fn body(obj: &Obj) -> RtResult<*mut StrObject> {
    if !check(obj) {
        return Err(RuntimeError::type_error(format!(
            "expected str, got {}",
            obj.type_name()
        )));
    }
    Ok(obj.as_ptr().cast())
}

/// Text of a string.
pub fn as_str(obj: &Obj) -> RtResult<&str> {
    let body = body(obj)?;
    // Safety: a string body holds `length` bytes of text after the header.
    let bytes = unsafe {
        let len = (*body).length.max(0) as usize;
        std::slice::from_raw_parts(obj.as_ptr().cast::<u8>().add(DATA_OFFSET), len)
    };
    std::str::from_utf8(bytes).map_err(|_| RuntimeError::value_error("string holds invalid UTF-8"))
}

/// Whether a string is registered in the intern table.
pub fn is_interned(obj: &Obj) -> bool {
    // Safety: checked string body.
    body(obj).is_ok_and(|b| unsafe { (*b).state } & STATE_INTERNED_MASK != 0)
}

/// Remove a string from the intern table and clear its interned state.
pub fn unintern(obj: &Obj) -> RtResult<()> {
    let body = body(obj)?;
    // Safety: checked string body.
    unsafe { forget_interned(body) };
    Ok(())
}

/// Forget a cached hash so it is recomputed from the text.
pub fn reset_hash(obj: &Obj) -> RtResult<()> {
    let body = body(obj)?;
    // Safety: checked string body.
    unsafe { (*body).hash = HASH_NOT_COMPUTED };
    Ok(())
}

/// Drop the intern-table entry for `body`, if it is the registered one.
///
/// # Safety
///
/// `body` must be a live string body.
unsafe fn forget_interned(body: *mut StrObject) {
    // Safety: caller guarantees `body` is live.
    unsafe {
        if (*body).state & STATE_INTERNED_MASK == 0 {
            return;
        }
        (*body).state &= !STATE_INTERNED_MASK;
        let len = (*body).length.max(0) as usize;
        let bytes = std::slice::from_raw_parts(body.cast::<u8>().add(DATA_OFFSET), len);
        if let Ok(text) = std::str::from_utf8(bytes) {
            let mut table = interned().lock();
            if table.get(text) == Some(&(body as usize)) {
                table.remove(text);
            }
        }
    }
}

// =============================================================================
// Slots
// =============================================================================

unsafe fn str_clear(op: *mut ObjectHeader) {
    // Safety: caller guarantees `op` is a live string.
    unsafe { forget_interned(op.cast()) };
}

fn str_len(a: &Obj) -> RtResult<usize> {
    Ok(as_str(a)?.chars().count())
}

fn str_concat(a: &Obj, b: &Obj) -> RtResult<Obj> {
    if !check(b) {
        return Err(RuntimeError::type_error(format!(
            "can only concatenate str (not \"{}\") to str",
            b.type_name()
        )));
    }
    let mut out = String::from(as_str(a)?);
    out.push_str(as_str(b)?);
    new(&out)
}

fn str_item(a: &Obj, index: isize) -> RtResult<Obj> {
    let text = as_str(a)?;
    usize::try_from(index)
        .ok()
        .and_then(|i| text.chars().nth(i))
        .map_or_else(
            || Err(RuntimeError::index_error("string index out of range")),
            |c| new(c.encode_utf8(&mut [0; 4])),
        )
}

fn str_contains(a: &Obj, b: &Obj) -> RtResult<bool> {
    if !check(b) {
        return Err(RuntimeError::type_error(format!(
            "'in <string>' requires string as left operand, not {}",
            b.type_name()
        )));
    }
    Ok(as_str(a)?.contains(as_str(b)?))
}

fn str_repr(a: &Obj) -> RtResult<Obj> {
    let text = as_str(a)?;
    let quote = if text.contains('\'') && !text.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    new(&out)
}

fn str_hash(a: &Obj) -> RtResult<i64> {
    let body = body(a)?;
    // Safety: checked string body.
    let cached = unsafe { (*body).hash };
    if cached != HASH_NOT_COMPUTED {
        return Ok(cached);
    }
    let mut hasher = FxHasher::default();
    hasher.write(as_str(a)?.as_bytes());
    let h = match hasher.finish() as i64 {
        HASH_NOT_COMPUTED => -2,
        h => h,
    };
    // Safety: checked string body.
    unsafe { (*body).hash = h };
    Ok(h)
}

/// Install the string kind's hooks and slots.
pub(crate) fn init_type(t: &mut TypeObject) {
    t.tp_clear = Some(str_clear);
    t.tp_repr = Some(str_repr);
    t.tp_hash = Some(str_hash);
    t.tp_as_sequence = Box::into_raw(Box::new(SequenceMethods {
        sq_length: Some(str_len),
        sq_concat: Some(str_concat),
        sq_item: Some(str_item),
        sq_ass_item: None,
        sq_contains: Some(str_contains),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let s = new("hello").unwrap();
        assert_eq!(as_str(&s).unwrap(), "hello");
        assert_eq!(marrow_gc::heap().requested_size(s.addr()), Some(46));
        let state = unsafe { (*s.as_ptr().cast::<StrObject>()).state };
        assert_ne!(state & STATE_ASCII, 0);
        assert_eq!(state & STATE_INTERNED_MASK, 0);
    }

    #[test]
    fn test_intern_returns_same_object() {
        let a = intern("marrow-intern-test").unwrap();
        let b = intern("marrow-intern-test").unwrap();
        assert!(a.is(&b));
        assert!(is_interned(&a));
        unintern(&a).unwrap();
        assert!(!is_interned(&a));
        let c = intern("marrow-intern-test").unwrap();
        assert!(!c.is(&a));
    }

    #[test]
    fn test_freed_interned_string_leaves_table() {
        let addr = intern("marrow-short-lived").unwrap().addr();
        assert!(!interned().lock().values().any(|&a| a == addr));
    }

    #[test]
    fn test_hash_cached_and_reset() {
        let s = new("abc").unwrap();
        let h = str_hash(&s).unwrap();
        assert_eq!(unsafe { (*s.as_ptr().cast::<StrObject>()).hash }, h);
        reset_hash(&s).unwrap();
        assert_eq!(unsafe { (*s.as_ptr().cast::<StrObject>()).hash }, HASH_NOT_COMPUTED);
        assert_eq!(str_hash(&s).unwrap(), h);
    }

    #[test]
    fn test_sequence_slots() {
        let s = new("héllo").unwrap();
        assert_eq!(str_len(&s).unwrap(), 5);
        assert_eq!(as_str(&str_item(&s, 1).unwrap()).unwrap(), "é");
        assert!(str_contains(&s, &new("ll").unwrap()).unwrap());
        assert_eq!(as_str(&str_repr(&new("it's").unwrap()).unwrap()).unwrap(), "\"it's\"");
    }
}
