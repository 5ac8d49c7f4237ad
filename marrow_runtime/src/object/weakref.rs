//! Weak references.
//!
//! A weak reference remembers an object's address and the heap serial of
//! its block. It can be upgraded while a block with the same serial is
//! still live at that address, so address reuse after deallocation is
//! detected.

use crate::error::{RtResult, RuntimeError};
use crate::object::type_obj::TypeFlags;
use crate::object::{Obj, ObjectHeader};

use marrow_gc::heap;

/// A non-owning reference to a weakly referenceable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeakRef {
    addr: usize,
    serial: u64,
}

impl WeakRef {
    /// Create a weak reference.
    ///
    /// Fails with a `TypeError` if the object's type does not support weak
    /// references.
    pub fn new(obj: &Obj) -> RtResult<Self> {
        if !obj.type_flags().contains(TypeFlags::WEAKREFABLE) {
            return Err(RuntimeError::type_error(format!(
                "cannot create weak reference to '{}' object",
                obj.type_name()
            )));
        }
        let serial = heap().serial(obj.addr()).ok_or_else(|| {
            RuntimeError::type_error("cannot create weak reference to a static object")
        })?;
        Ok(Self {
            addr: obj.addr(),
            serial,
        })
    }

    /// Address of the referent.
    #[inline]
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Whether the referent is still alive.
    pub fn is_alive(&self) -> bool {
        heap().serial(self.addr) == Some(self.serial)
            // Safety: the block at `addr` is the referent's.
            && unsafe { (*(self.addr as *const ObjectHeader)).ob_refcnt } > 0
    }

    /// A strong reference to the referent, if it is still alive.
    pub fn upgrade(&self) -> Option<Obj> {
        if !self.is_alive() {
            return None;
        }
        // Safety: the referent is live.
        unsafe { Obj::from_borrowed_ptr(self.addr as *mut ObjectHeader) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::class::{ClassSpec, new_class};
    use crate::types::int;

    #[test]
    fn test_upgrade_while_alive() {
        let cls = new_class(&ClassSpec::new("WeakTarget")).unwrap();
        let inst = crate::object::attr::call(&cls, &[]).unwrap();
        let weak = WeakRef::new(&inst).unwrap();
        assert!(weak.is_alive());
        assert!(weak.upgrade().unwrap().is(&inst));
        drop(inst);
        assert!(!weak.is_alive());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_types_are_weakly_referenceable() {
        let cls = new_class(&ClassSpec::new("WeakType")).unwrap();
        let weak = WeakRef::new(&cls).unwrap();
        assert!(weak.upgrade().is_some());
    }

    #[test]
    fn test_int_rejects_weakref() {
        let err = WeakRef::new(&int::new(1).unwrap()).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Type("cannot create weak reference to 'int' object".into())
        );
    }
}
