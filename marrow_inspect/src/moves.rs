//! Move and swap engine.
//!
//! A move transplants one object's body onto another object's storage.
//! The destination keeps its address and its reference count; everything
//! after the count field is replaced:
//!
//! ```text
//!          0        8                     size_in_memory(src)
//!   src  | refcnt | ob_type | body ...  |
//!                   |                    |
//!                   v  copied            v
//!   dst  | refcnt | ob_type | body ...  | slack ... | size_allocated(dst)
//!          kept
//! ```
//!
//! # Checks
//!
//! Every check runs before any byte is written:
//!
//! 1. A non-collector body may not enter a collector-tracked object.
//!    Relaxed (with a warning) inside a capability.
//! 2. A managed instance dictionary needs a prefix slot at the
//!    destination. Relaxed inside a capability, in which case the
//!    dictionary stays with the source.
//! 3. The source footprint must fit the destination block. Never relaxed.
//!
//! Interned strings are removed from the intern table and cached hashes
//! reset on both participants.
//!
//! # Ownership
//!
//! A move shares: the destination's old contents are released and the
//! references in the copied body are taken anew. A swap transfers: bodies
//! change places without any reference count traffic, and is therefore
//! its own inverse at the byte level.
//!
//! Type objects never take part in either operation.

use crate::capability;
use crate::catalog::RecordKind;
use crate::config::ViewConfig;
use crate::error::{InspectError, Result};
use crate::record::{AttachedTable, ObjectRecord};
use crate::view::{AnyView, View, view_with};

use marrow_gc::{heap, tracking};
use marrow_runtime::object::attr::materialize_dict;
use marrow_runtime::object::lifecycle::{adopt_contents, release_contents, sync_tracking};
use marrow_runtime::object::{REFCNT_SIZE, xdecref};
use marrow_runtime::types::string;
use marrow_runtime::{Obj, ObjectHeader, set_attr};
use std::ptr;

// =============================================================================
// Checks
// =============================================================================

fn type_name(record: &ObjectRecord) -> Result<String> {
    let tp = record.type_ptr()?;
    // Safety: a live object's type is live.
    Ok(unsafe { (*tp).name().to_string() })
}

fn reject_types(src: &ObjectRecord, dst: &ObjectRecord) -> Result<()> {
    for record in [src, dst] {
        if record.kind() == RecordKind::Type {
            return Err(InspectError::KindMismatch {
                expected: "non-type object".into(),
                found: type_name(record)?,
            });
        }
    }
    Ok(())
}

/// Whether `src`'s managed dictionary can follow it into `dst`.
fn managed_dict_fits(src: &ObjectRecord, dst: &ObjectRecord) -> Result<bool> {
    Ok(src.attached_table()? != AttachedTable::Managed || dst.has_dict_slot())
}

/// Checks for placing `src`'s body into `dst`'s block.
fn check_move(src: &ObjectRecord, dst: &ObjectRecord, relaxed: bool) -> Result<()> {
    if !src.is_gc()? && dst.is_gc()? {
        let (src_name, dst_name) = (type_name(src)?, type_name(dst)?);
        if !relaxed {
            return Err(InspectError::GcIncompatible {
                src: src_name,
                dst: dst_name,
            });
        }
        tracing::warn!(src = %src_name, dst = %dst_name, "moving non-gc body into gc object under unsafe context");
    }

    if !managed_dict_fits(src, dst)? {
        let message = format!(
            "'{}' keeps its dict in the block prefix but the block at {} has no slot for it",
            type_name(src)?,
            dst.address()
        );
        if !relaxed {
            return Err(InspectError::AttachedTable(message));
        }
        tracing::warn!(%message, "instance dict left behind under unsafe context");
    }

    let needed = src.size_in_memory()?;
    let available = dst.size_allocated()?;
    if needed > available {
        return Err(InspectError::OutOfBounds { needed, available });
    }
    Ok(())
}

/// Forget identity caches that would survive the copy.
fn hygiene(obj: &Obj) -> Result<()> {
    if string::check(obj) {
        string::unintern(obj)?;
        string::reset_hash(obj)?;
    }
    Ok(())
}

/// Copy everything after the reference count from `src` to `dst`.
///
/// # Safety
///
/// Both ranges must be valid for `len` bytes and must not overlap.
unsafe fn copy_body(src: usize, dst: usize, len: usize) {
    if len <= REFCNT_SIZE {
        return;
    }
    // Safety: caller guarantees both ranges.
    unsafe {
        ptr::copy_nonoverlapping(
            (src + REFCNT_SIZE) as *const u8,
            (dst + REFCNT_SIZE) as *mut u8,
            len - REFCNT_SIZE,
        );
    }
}

/// The object behind a participant, for the duration of the operation.
///
/// Views without a lifetime source resolve through the record's address,
/// which the record has already checked against the block's serial.
fn participant(view: &View, record: &ObjectRecord) -> Result<Obj> {
    match view.base() {
        Ok(obj) => Ok(obj),
        Err(InspectError::NoReference | InspectError::WeakExpired) => {
            let addr = record.address();
            if !record.is_live() {
                return Err(InspectError::Dangling(addr.get()));
            }
            // Safety: the block is live under the serial the record was
            // built with, so it still holds the viewed object.
            unsafe { addr.reify() }.ok_or(InspectError::Dangling(addr.get()))
        }
        Err(err) => Err(err),
    }
}

/// A view over `obj` that owns a reference, whatever `like` was set to.
fn fresh_view(obj: &Obj, like: &View) -> Result<AnyView> {
    view_with(
        obj,
        ViewConfig {
            hold_ref: true,
            ..like.config().clone()
        },
    )
}

// =============================================================================
// Move
// =============================================================================

/// Transplant `src`'s body onto `dst`. See [`View::move_from`].
pub(crate) fn move_view(dst: &View, src: &View) -> Result<AnyView> {
    let src_rec = src.record()?.clone();
    let dst_rec = dst.record()?.clone();
    if src_rec.address() == dst_rec.address() {
        return fresh_view(&participant(dst, &dst_rec)?, dst);
    }

    let relaxed = capability::is_active(src) || capability::is_active(dst);
    reject_types(&src_rec, &dst_rec)?;
    check_move(&src_rec, &dst_rec, relaxed)?;

    let src_obj = participant(src, &src_rec)?;
    let dst_obj = participant(dst, &dst_rec)?;
    hygiene(&src_obj)?;
    hygiene(&dst_obj)?;

    let dict = if src_rec.attached_table()? == AttachedTable::Managed && dst_rec.has_dict_slot() {
        materialize_dict(&src_obj)?
    } else {
        None
    };

    let len = src_rec.size_in_memory()?;
    let (src_addr, dst_addr) = (src_obj.addr(), dst_obj.addr());
    // Safety: both objects are live and distinct; the capacity check
    // guarantees `len` bytes fit the destination block.
    unsafe {
        let op = dst_obj.as_ptr();
        release_contents(op);
        copy_body(src_addr, dst_addr, len);
        adopt_contents(op);
        sync_tracking(op);
    }
    heap().set_requested(dst_addr, len)?;
    if let Some(dict) = &dict {
        set_attr(&dst_obj, "__dict__", dict)?;
    }

    tracing::debug!(
        src = src_addr,
        dst = dst_addr,
        bytes = len,
        kind = %src_rec.kind(),
        live_bytes = heap().stats().live_bytes(),
        live_objects = heap().stats().live_objects(),
        tracked = tracking::tracked_count(),
        "moved object body"
    );

    src.drop_ref();
    dst.rebind()?;
    fresh_view(&dst_obj, dst)
}

// =============================================================================
// Swap
// =============================================================================

/// Take the managed dictionary out of a block's prefix.
fn steal_prefix_dict(record: &ObjectRecord) -> *mut ObjectHeader {
    match heap().block(record.address().get()).and_then(|b| b.dict_slot_addr()) {
        // Safety: the prefix slot holds null or an owned dict reference.
        Some(slot) => unsafe { ptr::replace(slot as *mut *mut ObjectHeader, ptr::null_mut()) },
        None => ptr::null_mut(),
    }
}

/// Put an owned dictionary reference into the prefix of the object now
/// living at `record`'s address, or release it if it has nowhere to go.
///
/// # Safety
///
/// `dict` must be null or an owned reference.
unsafe fn install_prefix_dict(record: &ObjectRecord, dict: *mut ObjectHeader) -> Result<()> {
    let slot = heap().block(record.address().get()).and_then(|b| b.dict_slot_addr());
    match slot {
        Some(slot) if record.attached_table()? == AttachedTable::Managed => {
            // Safety: the slot was emptied by `steal_prefix_dict`.
            unsafe {
                let old = ptr::replace(slot as *mut *mut ObjectHeader, dict);
                xdecref(old);
            }
        }
        // Safety: caller passes an owned reference.
        _ => unsafe { xdecref(dict) },
    }
    Ok(())
}

/// Exchange the bodies of `a` and `b`. See [`View::swap`].
pub(crate) fn swap_views(a: &View, b: &View) -> Result<(AnyView, AnyView)> {
    let a_rec = a.record()?.clone();
    let b_rec = b.record()?.clone();
    if a_rec.address() == b_rec.address() {
        let obj = participant(a, &a_rec)?;
        return Ok((fresh_view(&obj, a)?, fresh_view(&obj, b)?));
    }

    let relaxed = capability::is_active(a) || capability::is_active(b);
    reject_types(&a_rec, &b_rec)?;
    check_move(&a_rec, &b_rec, relaxed)?;
    check_move(&b_rec, &a_rec, relaxed)?;

    let a_len = a_rec.size_in_memory()?;
    let b_len = b_rec.size_in_memory()?;
    let limit = a.config().max_swap_bytes;
    if a_len > limit {
        return Err(InspectError::OutOfBounds {
            needed: a_len,
            available: limit,
        });
    }

    let a_obj = participant(a, &a_rec)?;
    let b_obj = participant(b, &b_rec)?;
    hygiene(&a_obj)?;
    hygiene(&b_obj)?;

    let a_dict = steal_prefix_dict(&a_rec);
    let b_dict = steal_prefix_dict(&b_rec);

    let mut staged = a_rec.bytes()?;
    let (a_addr, b_addr) = (a_obj.addr(), b_obj.addr());
    // Safety: both objects are live and distinct, both directions passed
    // the capacity check, and `staged` outlives the buffer record.
    unsafe {
        copy_body(b_addr, a_addr, b_len);
        let buffer = ObjectRecord::over_buffer(
            staged.as_mut_ptr(),
            staged.len(),
            a_rec.kind(),
            a_rec.layout().clone(),
        );
        copy_body(buffer.address().get(), b_addr, buffer.size_in_memory()?);
        sync_tracking(a_obj.as_ptr());
        sync_tracking(b_obj.as_ptr());
    }
    heap().set_requested(a_addr, b_len)?;
    heap().set_requested(b_addr, a_len)?;

    let a_now = ObjectRecord::of(&a_obj)?;
    let b_now = ObjectRecord::of(&b_obj)?;
    // Safety: both dicts were stolen above and are owned here.
    unsafe {
        install_prefix_dict(&b_now, a_dict)?;
        install_prefix_dict(&a_now, b_dict)?;
    }

    tracing::debug!(
        a = a_addr,
        b = b_addr,
        a_bytes = a_len,
        b_bytes = b_len,
        live_bytes = heap().stats().live_bytes(),
        tracked = tracking::tracked_count(),
        "swapped object bodies"
    );

    a.drop_ref();
    b.drop_ref();
    Ok((fresh_view(&a_obj, a)?, fresh_view(&b_obj, b)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use marrow_runtime::types::{dict, float, int, list, tuple};
    use marrow_runtime::{ClassSpec, DictConvention, call, get_attr, new_class, ops};

    fn hashed_interned(text: &str) -> Obj {
        let s = string::intern(text).unwrap();
        ops::hash(&s).unwrap();
        assert!(string::is_interned(&s));
        s
    }

    fn str_view(obj: &Obj) -> AnyView {
        view_with(obj, ViewConfig::default()).unwrap()
    }

    #[test]
    fn test_move_int_into_float() {
        let src = int::new(5).unwrap();
        let dst = float::new(1.0).unwrap();
        let dst_view = View::new(&dst).unwrap();
        let src_view = View::new(&src).unwrap();
        let count = dst.refcnt();

        let fresh = dst_view.move_from(&src_view).unwrap();
        assert!(src_view.is_dropped());
        assert!(matches!(fresh, AnyView::Int(_)));
        assert_eq!(int::value(&dst).unwrap(), 5);
        assert_eq!(dst.refcnt(), count + 1);
        assert_eq!(dst_view.kind().unwrap(), RecordKind::Int);
        assert_eq!(heap().requested_size(dst.addr()), Some(28));
    }

    #[test]
    fn test_move_through_detached_views() {
        let src = float::new(6.5).unwrap();
        let dst = float::new(1.5).unwrap();
        let dst_view = View::with_config(&dst, ViewConfig::detached()).unwrap();
        let src_view = View::with_config(&src, ViewConfig::detached()).unwrap();
        assert!(matches!(dst_view.base(), Err(InspectError::NoReference)));

        let fresh = dst_view.move_from(&src_view).unwrap();
        assert!(matches!(fresh, AnyView::Float(_)));
        assert!(fresh.base().unwrap().is(&dst));
        assert_eq!(float::value(&dst).unwrap(), 6.5);
        assert!(src_view.is_dropped());
    }

    #[test]
    fn test_move_from_obj_holds_source() {
        let plain = new_class(&ClassSpec::new("MoveWeakDst")).unwrap();
        let opaque = new_class(&ClassSpec::new("MoveNoWeak").weakrefs(false)).unwrap();
        let dst = call(&plain, &[]).unwrap();
        let src = call(&opaque, &[]).unwrap();
        set_attr(&src, "x", &int::new(4).unwrap()).unwrap();

        let dst_view = View::with_config(&dst, ViewConfig::borrowed()).unwrap();
        dst_view.move_from_obj(&src).unwrap();
        assert!(dst.type_obj().is(&opaque));
        assert_eq!(int::value(&get_attr(&dst, "x").unwrap()).unwrap(), 4);

        let f = float::new(0.0).unwrap();
        let f_view = View::with_config(&f, ViewConfig::borrowed()).unwrap();
        f_view.move_from_obj(&float::new(2.0).unwrap()).unwrap();
        assert_eq!(float::value(&f).unwrap(), 2.0);
    }

    #[test]
    fn test_move_resets_string_identity() {
        let src = hashed_interned("hygiene-src-a");
        let dst = hashed_interned("hygiene-dst-a");

        View::new(&dst).unwrap().move_from_obj(&src).unwrap();
        assert_eq!(string::as_str(&dst).unwrap(), "hygiene-src-a");
        assert!(!string::is_interned(&src));
        assert!(!string::is_interned(&dst));
        assert!(!string::intern("hygiene-dst-a").unwrap().is(&dst));
        assert!(!string::intern("hygiene-src-a").unwrap().is(&src));
        assert_eq!(str_view(&dst).as_str().unwrap().cached_hash().unwrap(), None);
        assert_eq!(str_view(&src).as_str().unwrap().cached_hash().unwrap(), None);
    }

    #[test]
    fn test_swap_resets_string_identity() {
        let a = hashed_interned("hygiene-swap-a");
        let b = hashed_interned("hygiene-swap-b");

        let (va, vb) = View::new(&a).unwrap().swap(&View::new(&b).unwrap()).unwrap();
        assert_eq!(string::as_str(&a).unwrap(), "hygiene-swap-b");
        assert_eq!(string::as_str(&b).unwrap(), "hygiene-swap-a");
        for s in [&a, &b] {
            assert!(!string::is_interned(s));
        }
        assert!(!string::intern("hygiene-swap-a").unwrap().is(&a));
        assert!(!string::intern("hygiene-swap-b").unwrap().is(&b));
        assert_eq!(va.as_str().unwrap().cached_hash().unwrap(), None);
        assert_eq!(vb.as_str().unwrap().cached_hash().unwrap(), None);
    }

    #[test]
    fn test_move_rejects_gc_mismatch() {
        let src = int::new(5).unwrap();
        let dst = tuple::new(&[]).unwrap();
        let dst_view = View::new(&dst).unwrap();
        let src_view = View::new(&src).unwrap();
        let before = dst_view.bytes().unwrap();

        let err = dst_view.move_from(&src_view).unwrap_err();
        assert!(matches!(err, InspectError::GcIncompatible { .. }));
        assert_eq!(dst_view.bytes().unwrap(), before);
        assert!(!src_view.is_dropped());
    }

    #[test]
    fn test_move_rejects_oversized_source() {
        let _guard = crate::test_lock();
        let src = tuple::new(&[int::new(1).unwrap(), int::new(2).unwrap(), int::new(3).unwrap()]).unwrap();
        let dst = tuple::new(&[]).unwrap();
        let dst_view = View::new(&dst).unwrap();
        let src_view = View::new(&src).unwrap();
        let _scope = dst_view.unsafe_scope();
        assert!(matches!(
            dst_view.move_from(&src_view),
            Err(InspectError::OutOfBounds { needed: 48, available: 32 })
        ));
    }

    #[test]
    fn test_move_relocates_managed_dict() {
        let cls = new_class(&ClassSpec::new("MoveManaged").dict(DictConvention::Managed)).unwrap();
        let a = call(&cls, &[]).unwrap();
        let b = call(&cls, &[]).unwrap();
        set_attr(&a, "x", &int::new(11).unwrap()).unwrap();

        let b_view = View::new(&b).unwrap();
        b_view.move_from_obj(&a).unwrap();
        assert_eq!(int::value(&get_attr(&b, "x").unwrap()).unwrap(), 11);
    }

    #[test]
    fn test_managed_dict_needs_prefix_slot() {
        let _guard = crate::test_lock();
        let managed = new_class(&ClassSpec::new("SrcManaged").dict(DictConvention::Managed)).unwrap();
        let inline = new_class(&ClassSpec::new("DstInline")).unwrap();
        let src = call(&managed, &[]).unwrap();
        let dst = call(&inline, &[]).unwrap();
        let dst_view = View::new(&dst).unwrap();
        let src_view = View::new(&src).unwrap();
        assert!(matches!(dst_view.move_from(&src_view), Err(InspectError::AttachedTable(_))));

        let _scope = dst_view.unsafe_scope();
        dst_view.move_from(&src_view).unwrap();
        assert!(dst.type_obj().is(&managed));
    }

    #[test]
    fn test_swap_is_its_own_inverse() {
        let l = list::new(&[int::new(1).unwrap()]).unwrap();
        let d = dict::new().unwrap();
        dict::set_item(&d, "k", &int::new(2).unwrap()).unwrap();
        let l_bytes = View::new(&l).unwrap().bytes().unwrap();
        let d_bytes = View::new(&d).unwrap().bytes().unwrap();

        let (a, b) = View::new(&l).unwrap().swap(&View::new(&d).unwrap()).unwrap();
        assert!(matches!(a, AnyView::Dict(_)));
        assert!(matches!(b, AnyView::List(_)));
        // Reference counts stay with the addresses.
        assert_eq!(a.bytes().unwrap()[REFCNT_SIZE..], d_bytes[REFCNT_SIZE..]);
        assert_eq!(b.bytes().unwrap()[REFCNT_SIZE..], l_bytes[REFCNT_SIZE..]);

        let (a, b) = a.swap(&b).unwrap();
        assert_eq!(a.bytes().unwrap(), l_bytes);
        assert_eq!(b.bytes().unwrap(), d_bytes);
        assert_eq!(list::len(&l), 1);
        assert_eq!(dict::len(&d), 1);
    }

    #[test]
    fn test_same_address_is_noop() {
        let f = float::new(8.0).unwrap();
        let v = View::new(&f).unwrap();
        let before = v.bytes().unwrap();
        let fresh = v.move_from(&v).unwrap();
        assert!(!v.is_dropped());
        assert_eq!(fresh.bytes().unwrap(), before);
    }

    #[test]
    fn test_types_never_move() {
        let cls = new_class(&ClassSpec::new("NoMove")).unwrap();
        let other = new_class(&ClassSpec::new("NoMoveEither")).unwrap();
        let v = View::new(&cls).unwrap();
        assert!(matches!(
            v.move_from(&View::new(&other).unwrap()),
            Err(InspectError::KindMismatch { .. })
        ));
    }
}
