//! Object allocation and teardown.
//!
//! Every object lives in a heap block whose prefix is chosen from its type:
//! collector-tracked types get a [`GcHead`](marrow_gc::GcHead), and types
//! using the managed dictionary convention additionally get a dictionary
//! slot in front of it.
//!
//! Teardown is split in two so that bodies can be replaced in place:
//!
//! - [`release_contents`] drops everything the body owns but keeps the
//!   block and header
//! - [`adopt_contents`] takes ownership of everything a freshly copied body
//!   refers to

use crate::error::RtResult;
use crate::object::type_obj::{TypeFlags, TypeObject};
use crate::object::{Obj, ObjectHeader, VarHeader, decref, incref, xdecref};

use marrow_gc::{BlockPrefix, heap, tracking};
use std::ptr::NonNull;

/// Block prefix used for instances of `tp`.
#[inline]
pub fn prefix_for(tp: &TypeObject) -> BlockPrefix {
    if tp.has(TypeFlags::MANAGED_DICT) {
        BlockPrefix::GC_WITH_DICT
    } else if tp.has(TypeFlags::HAVE_GC) {
        BlockPrefix::GC
    } else {
        BlockPrefix::NONE
    }
}

/// Size of an instance of `tp` with `nitems` trailing items.
#[inline]
pub fn instance_size(tp: &TypeObject, nitems: usize) -> usize {
    tp.tp_basicsize as usize + tp.tp_itemsize as usize * nitems
}

/// Allocate an instance of `tp` through its `tp_alloc` hook.
///
/// # Safety
///
/// `tp` must be a live, ready type object.
pub unsafe fn alloc_object(tp: *mut TypeObject, nitems: usize) -> RtResult<Obj> {
    // Safety: caller guarantees `tp` is live.
    unsafe {
        match (*tp).tp_alloc {
            Some(alloc) => alloc(tp, nitems),
            None => generic_alloc(tp, nitems),
        }
    }
}

/// Default `tp_alloc`: a zeroed block with the header filled in, tracked
/// when the type is collector-aware.
///
/// # Safety
///
/// `tp` must be a live type object.
pub unsafe fn generic_alloc(tp: *mut TypeObject, nitems: usize) -> RtResult<Obj> {
    // Safety: caller guarantees `tp` is live.
    let t = unsafe { &*tp };
    let size = instance_size(t, nitems);
    let prefix = prefix_for(t);
    let mem = heap().allocate(size, prefix)?;
    let op = mem.as_ptr().cast::<ObjectHeader>();
    // Safety: the block is at least `size` bytes, zeroed, and ours.
    unsafe {
        (*op).ob_refcnt = 1;
        (*op).ob_type = tp;
        if t.tp_itemsize != 0 {
            (*op.cast::<VarHeader>()).ob_size = nitems as isize;
        }
        if t.has(TypeFlags::HEAPTYPE) {
            incref(tp.cast());
        }
        if prefix.gc_head {
            tracking::track(op as usize);
        }
        Ok(Obj::from_owned(NonNull::new_unchecked(op)))
    }
}

/// Default `tp_free`: hand the block back to the heap.
///
/// # Safety
///
/// `op` must be an unreachable object allocated by [`generic_alloc`].
pub unsafe fn generic_free(op: *mut ObjectHeader) {
    // Safety: caller guarantees the block is ours to release.
    if let Err(err) = unsafe { heap().release(op as usize) } {
        tracing::error!(addr = op as usize, %err, "failed to release object");
    }
}

/// Deallocate an object whose reference count reached zero.
///
/// # Safety
///
/// `op` must be a live object with no remaining references.
pub unsafe fn dealloc(op: *mut ObjectHeader) {
    // Safety: caller guarantees `op` is live.
    unsafe {
        let tp = (*op).ob_type;
        match (*tp).tp_dealloc {
            Some(f) => f(op),
            None => generic_dealloc(op),
        }
    }
}

/// Default `tp_dealloc`.
///
/// # Safety
///
/// As [`dealloc`].
pub unsafe fn generic_dealloc(op: *mut ObjectHeader) {
    let addr = op as usize;
    // Safety: caller guarantees `op` is live and unreferenced.
    unsafe {
        let free = (*(*op).ob_type).tp_free;
        if let Some(info) = heap().block(addr) {
            if info.prefix.gc_head {
                tracking::untrack(addr);
            }
            if let Some(slot) = info.dict_slot_addr() {
                let slot = slot as *mut *mut ObjectHeader;
                let dict = *slot;
                *slot = std::ptr::null_mut();
                xdecref(dict);
            }
        }
        release_contents(op);
        match free {
            Some(f) => f(op),
            None => generic_free(op),
        }
    }
}

/// Drop every reference owned by the object's body, including the
/// reference a heap type's instance holds on its type.
///
/// The header is left in place (with a possibly dangling type pointer) so
/// the caller can overwrite or free the body.
///
/// # Safety
///
/// `op` must be a live object whose body is not used afterwards except to
/// be overwritten or freed.
pub unsafe fn release_contents(op: *mut ObjectHeader) {
    // Safety: caller guarantees `op` is live.
    unsafe {
        let tp = (*op).ob_type;
        if let Some(clear) = (*tp).tp_clear {
            clear(op);
        }
        if (*tp).has(TypeFlags::HEAPTYPE) {
            decref(tp.cast());
        }
    }
}

/// Take ownership of everything a body copied in from elsewhere refers to.
///
/// Kinds that own out-of-line buffers duplicate them through `tp_adopt`;
/// otherwise every reference reported by `tp_traverse` is incremented.
///
/// # Safety
///
/// `op` must hold a complete, consistent body whose references are live.
pub unsafe fn adopt_contents(op: *mut ObjectHeader) {
    // Safety: caller guarantees the body is consistent.
    unsafe {
        let tp = (*op).ob_type;
        if (*tp).has(TypeFlags::HEAPTYPE) {
            incref(tp.cast());
        }
        if let Some(adopt) = (*tp).tp_adopt {
            adopt(op);
        } else if let Some(traverse) = (*tp).tp_traverse {
            traverse(op, &mut |child| incref(child));
        }
    }
}

/// Make the object's tracking state agree with its current type: tracked
/// if and only if the type is collector-aware and the block has a head.
///
/// # Safety
///
/// `op` must be a live heap object.
pub unsafe fn sync_tracking(op: *mut ObjectHeader) {
    let addr = op as usize;
    let Some(info) = heap().block(addr) else {
        return;
    };
    if !info.prefix.gc_head {
        return;
    }
    // Safety: the block has a head; `op` is live.
    unsafe {
        if (*(*op).ob_type).has(TypeFlags::HAVE_GC) {
            tracking::track(addr);
        } else {
            tracking::untrack(addr);
        }
    }
}

/// Whether the object is on the collector's tracking list.
pub fn is_tracked(obj: &Obj) -> bool {
    match heap().block(obj.addr()) {
        // Safety: the block has a head.
        Some(info) if info.prefix.gc_head => unsafe { tracking::is_tracked(obj.addr()) },
        _ => false,
    }
}
