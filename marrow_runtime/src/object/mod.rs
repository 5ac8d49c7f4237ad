//! Core object header and reference types.
//!
//! Every marrow object begins with an [`ObjectHeader`]: a reference count
//! followed by a pointer to its type object. Variable-size objects extend it
//! with an item count ([`VarHeader`]).
//!
//! ```text
//!   offset 0   ob_refcnt  isize
//!   offset 8   ob_type    *mut TypeObject
//!   offset 16  ob_size    isize        (variable-size objects only)
//! ```
//!
//! Ownership of a reference is expressed with [`Obj`]: cloning increments
//! the count, dropping decrements it, and the object is deallocated through
//! its type when the count reaches zero.

pub mod attr;
pub mod class;
pub mod lifecycle;
pub mod protocols;
pub mod registry;
pub mod slots;
pub mod type_obj;
pub mod weakref;

use crate::object::type_obj::{TypeFlags, TypeObject};

use std::fmt;
use std::ptr::NonNull;

// =============================================================================
// Object Header
// =============================================================================

/// Header shared by every object.
#[repr(C)]
#[derive(Debug)]
pub struct ObjectHeader {
    /// Reference count.
    pub ob_refcnt: isize,
    /// Type of this object.
    pub ob_type: *mut TypeObject,
}

/// Header of variable-size objects.
#[repr(C)]
#[derive(Debug)]
pub struct VarHeader {
    /// Fixed header.
    pub ob_base: ObjectHeader,
    /// Number of items (sign carries meaning for some kinds).
    pub ob_size: isize,
}

/// Objects at or above this count are never counted or freed.
pub const IMMORTAL_REFCNT: isize = 1 << 40;

/// Size of the reference count field; the first byte that object
/// transplants may overwrite.
pub const REFCNT_SIZE: usize = size_of::<isize>();

/// Increment the reference count of `op`.
///
/// # Safety
///
/// `op` must point at a live object.
#[inline]
pub unsafe fn incref(op: *mut ObjectHeader) {
    // Safety: caller guarantees `op` is live.
    unsafe {
        if (*op).ob_refcnt < IMMORTAL_REFCNT {
            (*op).ob_refcnt += 1;
        }
    }
}

/// Decrement the reference count of `op`, deallocating it at zero.
///
/// # Safety
///
/// `op` must point at a live object and the caller must own the reference
/// being released.
#[inline]
pub unsafe fn decref(op: *mut ObjectHeader) {
    // Safety: caller owns a reference, so the object is live.
    unsafe {
        let cnt = (*op).ob_refcnt;
        if cnt >= IMMORTAL_REFCNT {
            return;
        }
        (*op).ob_refcnt = cnt - 1;
        if cnt == 1 {
            lifecycle::dealloc(op);
        }
    }
}

/// Decrement `op` if non-null.
///
/// # Safety
///
/// As [`decref`] when `op` is non-null.
#[inline]
pub unsafe fn xdecref(op: *mut ObjectHeader) {
    if !op.is_null() {
        // Safety: forwarded.
        unsafe { decref(op) };
    }
}

/// Increment `op` if non-null.
///
/// # Safety
///
/// As [`incref`] when `op` is non-null.
#[inline]
pub unsafe fn xincref(op: *mut ObjectHeader) {
    if !op.is_null() {
        // Safety: forwarded.
        unsafe { incref(op) };
    }
}

/// Mark an object as immortal.
///
/// # Safety
///
/// `op` must point at a live object that is never deallocated afterwards.
#[inline]
pub unsafe fn make_immortal(op: *mut ObjectHeader) {
    // Safety: caller guarantees `op` is live.
    unsafe { (*op).ob_refcnt = IMMORTAL_REFCNT };
}

// =============================================================================
// Strong References
// =============================================================================

/// An owned strong reference to an object.
///
/// `Obj` is deliberately `!Send`: reference counts are plain integers and
/// the object model is single-threaded.
pub struct Obj {
    ptr: NonNull<ObjectHeader>,
}

impl Obj {
    /// Take over a reference the caller already owns.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live object and the caller must transfer one
    /// owned reference.
    #[inline]
    pub unsafe fn from_owned(ptr: NonNull<ObjectHeader>) -> Self {
        Self { ptr }
    }

    /// Create a new strong reference from a borrowed pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live object.
    #[inline]
    pub unsafe fn from_borrowed(ptr: NonNull<ObjectHeader>) -> Self {
        // Safety: forwarded.
        unsafe { incref(ptr.as_ptr()) };
        Self { ptr }
    }

    /// Like [`Obj::from_borrowed`] but accepts a possibly-null pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or point at a live object.
    #[inline]
    pub unsafe fn from_borrowed_ptr(ptr: *mut ObjectHeader) -> Option<Self> {
        // Safety: forwarded.
        NonNull::new(ptr).map(|p| unsafe { Self::from_borrowed(p) })
    }

    /// Raw object pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut ObjectHeader {
        self.ptr.as_ptr()
    }

    /// Object address.
    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Give up ownership without decrementing.
    #[inline]
    pub fn into_raw(self) -> *mut ObjectHeader {
        let ptr = self.ptr.as_ptr();
        std::mem::forget(self);
        ptr
    }

    /// Current reference count.
    #[inline]
    pub fn refcnt(&self) -> isize {
        // Safety: we hold a reference.
        unsafe { (*self.as_ptr()).ob_refcnt }
    }

    /// Whether the object ignores reference counting.
    #[inline]
    pub fn is_immortal(&self) -> bool {
        self.refcnt() >= IMMORTAL_REFCNT
    }

    /// Raw pointer to this object's type.
    #[inline]
    pub fn type_ptr(&self) -> *mut TypeObject {
        // Safety: we hold a reference.
        unsafe { (*self.as_ptr()).ob_type }
    }

    /// This object's type as an object.
    #[inline]
    pub fn type_obj(&self) -> Obj {
        // Safety: a live object always has a live type.
        unsafe { Obj::from_borrowed(NonNull::new_unchecked(self.type_ptr().cast())) }
    }

    /// Name of this object's type.
    pub fn type_name(&self) -> String {
        // Safety: live object, live type.
        unsafe { (*self.type_ptr()).name().to_owned() }
    }

    /// Flags of this object's type.
    #[inline]
    pub fn type_flags(&self) -> TypeFlags {
        // Safety: live object, live type.
        unsafe { (*self.type_ptr()).flags() }
    }

    /// Identity comparison.
    #[inline]
    pub fn is(&self, other: &Obj) -> bool {
        self.ptr == other.ptr
    }

    /// Whether this object is a type object.
    #[inline]
    pub fn is_type(&self) -> bool {
        self.type_flags().contains(TypeFlags::TYPE_SUBCLASS)
    }

    /// View this object as a type.
    ///
    /// Returns `None` if it is not a type object.
    #[inline]
    pub fn as_type_ptr(&self) -> Option<*mut TypeObject> {
        self.is_type().then(|| self.as_ptr().cast())
    }
}

impl Clone for Obj {
    #[inline]
    fn clone(&self) -> Self {
        // Safety: we hold a reference.
        unsafe { Obj::from_borrowed(self.ptr) }
    }
}

impl Drop for Obj {
    #[inline]
    fn drop(&mut self) {
        // Safety: we own exactly one reference.
        unsafe { decref(self.ptr.as_ptr()) }
    }
}

impl PartialEq for Obj {
    fn eq(&self, other: &Self) -> bool {
        self.is(other)
    }
}

impl Eq for Obj {}

impl fmt::Debug for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} object at {:#x}>", self.type_name(), self.addr())
    }
}

impl fmt::Display for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match crate::ops::repr(self) {
            Ok(text) => f.write_str(&text),
            Err(_) => fmt::Debug::fmt(self, f),
        }
    }
}
