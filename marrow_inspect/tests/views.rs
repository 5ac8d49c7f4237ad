//! Integration tests for views, capability gating and lifetime tracking.
//!
//! Coverage:
//! - Header writes under local and global capability scopes
//! - Lifetime sources: strong, weak, detached
//! - Type reassignment on user instances
//! - Layout-driven records over plain buffers

mod common;

use marrow_inspect::{
    FieldValue, InspectError, LayoutBuilder, ObjectRecord, Prim, RecordKind, View, ViewConfig, catalog,
    unsafe_global, unsafe_views, view, view_with,
};
use marrow_runtime::types::{float, int, string};
use marrow_runtime::{ClassSpec, call, get_attr, new_class};

// =============================================================================
// Capability Gating
// =============================================================================

#[test]
fn test_refcount_write_needs_capability() {
    let _guard = common::setup();
    let x = float::new(2.5).unwrap();
    let v = view_with(&x, ViewConfig::borrowed()).unwrap();
    let before = v.bytes().unwrap();
    let count = v.ref_count().unwrap();
    assert_eq!(count, x.refcnt());

    let err = v.set_ref_count(5).unwrap_err();
    assert!(matches!(err, InspectError::Capability(_)));
    assert!(err.is_unsafe_gate());
    assert_eq!(v.bytes().unwrap(), before);

    {
        let _scope = v.unsafe_scope();
        v.set_ref_count(5).unwrap();
        assert_eq!(x.refcnt(), 5);
        v.set_ref_count(count).unwrap();
    }
    assert!(!v.is_unsafe());
    assert_eq!(x.refcnt(), count);
}

#[test]
fn test_global_scope_authorizes_every_view() {
    let _guard = common::setup();
    let a = int::new(1_000_001).unwrap();
    let b = int::new(1_000_002).unwrap();
    let (va, vb) = (view(&a).unwrap(), view(&b).unwrap());

    let scope = unsafe_global();
    assert!(va.is_unsafe() && vb.is_unsafe());
    drop(scope);
    assert!(!va.is_unsafe() && !vb.is_unsafe());

    let views = unsafe_views(&[&va, &vb]);
    assert!(va.is_unsafe() && vb.is_unsafe());
    drop(views);
    assert!(!va.is_unsafe());
}

#[test]
fn test_read_only_and_unknown_fields() {
    let x = float::new(0.5).unwrap();
    let v = view(&x).unwrap();
    assert!(matches!(v.read("nope"), Err(InspectError::UnknownField { .. })));
    v.write("ob_fval", 4.0).unwrap();
    assert_eq!(float::value(&x).unwrap(), 4.0);
}

// =============================================================================
// Lifetime
// =============================================================================

#[test]
fn test_detached_view_reconstructs_under_capability() {
    let _guard = common::setup();
    let x = float::new(9.0).unwrap();
    let v = View::with_config(&x, ViewConfig::detached()).unwrap();
    assert!(matches!(v.base(), Err(InspectError::NoReference)));

    let _scope = v.unsafe_scope();
    let again = v.base().unwrap();
    assert!(again.is(&x));
}

#[test]
fn test_weak_view_reports_expiry() {
    let cls = new_class(&ClassSpec::new("Fleeting")).unwrap();
    let inst = call(&cls, &[]).unwrap();
    let v = View::with_config(&inst, ViewConfig::borrowed()).unwrap();
    assert!(v.base().unwrap().is(&inst));

    drop(inst);
    assert!(matches!(v.base(), Err(InspectError::WeakExpired)));
    assert!(matches!(v.read("ob_type"), Err(InspectError::Dangling(_))));
}

#[test]
fn test_dropped_view_refuses_access() {
    let s = string::new("gone").unwrap();
    let v = view(&s).unwrap();
    v.drop_ref();
    assert!(v.is_dropped());
    assert!(matches!(v.base(), Err(InspectError::Dropped)));
    assert!(matches!(v.as_str().unwrap().text(), Err(InspectError::Dropped)));
    assert_eq!(string::as_str(&s).unwrap(), "gone");
}

// =============================================================================
// Type Reassignment
// =============================================================================

#[test]
fn test_set_type_switches_behavior() {
    let _guard = common::setup();
    let a = new_class(&ClassSpec::new("Before").attr("tag", int::new(1).unwrap())).unwrap();
    let b = new_class(&ClassSpec::new("After").attr("tag", int::new(2).unwrap())).unwrap();
    let inst = call(&a, &[]).unwrap();
    let v = view(&inst).unwrap();

    assert!(matches!(v.set_type(&b), Err(InspectError::Capability(_))));
    {
        let _scope = v.unsafe_scope();
        v.set_type(&b).unwrap();
    }
    assert!(inst.type_obj().is(&b));
    assert_eq!(int::value(&get_attr(&inst, "tag").unwrap()).unwrap(), 2);
    assert_eq!(v.kind().unwrap(), RecordKind::Instance);
}

#[test]
fn test_set_type_checks_block_size() {
    let _guard = common::setup();
    let small = new_class(&ClassSpec::new("Small")).unwrap();
    let wide = new_class(&ClassSpec::new("Wide").slots(&["a", "b", "c", "d", "e"])).unwrap();
    let inst = call(&small, &[]).unwrap();
    let v = view(&inst).unwrap();
    let _scope = v.unsafe_scope();
    assert!(matches!(v.set_type(&wide), Err(InspectError::OutOfBounds { .. })));
    assert!(inst.type_obj().is(&small));
}

// =============================================================================
// Records
// =============================================================================

#[test]
fn test_custom_layout_over_buffer() {
    let layout = LayoutBuilder::new("pair")
        .field("tag", Prim::U8)
        .field("value", Prim::I64)
        .finish()
        .unwrap();
    assert_eq!(layout.size(), 16);

    let mut buf = [0u8; 16];
    // Safety: `buf` outlives the record and is as large as the layout.
    let record =
        unsafe { ObjectRecord::over_buffer(buf.as_mut_ptr(), buf.len(), RecordKind::Object, layout.into()) };
    // Safety: plain data, no runtime invariants.
    unsafe { record.write_unchecked("value", &FieldValue::Int(-3)).unwrap() };
    assert_eq!(record.read("value").unwrap().as_i64(), Some(-3));
    assert_eq!(record.read("tag").unwrap().as_u64(), Some(0));
    assert!(catalog::static_layout(RecordKind::Float).is_some());
}
