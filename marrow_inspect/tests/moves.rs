//! Integration tests for moving and swapping object bodies.

mod common;

use marrow_inspect::{AnyView, InspectError, View, ViewConfig, view};
use marrow_runtime::types::{float, int, list, string, tuple};
use marrow_runtime::{ClassSpec, call, get_attr, new_class, ops, set_attr};

#[test]
fn test_instance_move_carries_class_and_dict() {
    let _guard = common::setup();
    let greeter = new_class(&ClassSpec::new("Greeter").attr("kind", string::new("greeter").unwrap())).unwrap();
    let plain = new_class(&ClassSpec::new("Plain")).unwrap();
    let src = call(&greeter, &[]).unwrap();
    let dst = call(&plain, &[]).unwrap();
    set_attr(&src, "name", &string::new("ada").unwrap()).unwrap();

    let dst_view = view(&dst).unwrap();
    let fresh = dst_view.move_from_obj(&src).unwrap();
    assert!(matches!(fresh, AnyView::Instance(_)));
    assert!(dst.type_obj().is(&greeter));
    assert_eq!(string::as_str(&get_attr(&dst, "name").unwrap()).unwrap(), "ada");
    assert_eq!(string::as_str(&get_attr(&dst, "kind").unwrap()).unwrap(), "greeter");

    // The source still owns its own references.
    assert_eq!(string::as_str(&get_attr(&src, "name").unwrap()).unwrap(), "ada");
    set_attr(&dst, "name", &string::new("grace").unwrap()).unwrap();
    assert_eq!(string::as_str(&get_attr(&src, "name").unwrap()).unwrap(), "grace");
}

#[test]
fn test_moved_list_owns_its_buffer() {
    let src = list::new(&[int::new(1).unwrap(), int::new(2).unwrap()]).unwrap();
    let dst = list::new(&[]).unwrap();
    view(&dst).unwrap().move_from_obj(&src).unwrap();

    list::append(&dst, &int::new(3).unwrap()).unwrap();
    assert_eq!(list::len(&dst), 3);
    assert_eq!(list::len(&src), 2);
    drop(src);
    assert_eq!(int::value(&list::get(&dst, 1).unwrap()).unwrap(), 2);
}

#[test]
fn test_failed_move_leaves_both_views_usable() {
    let items: Vec<_> = (0..3).map(|i| float::new(i as f64).unwrap()).collect();
    let src = tuple::new(&items).unwrap();
    let dst = float::new(3.0).unwrap();
    let dst_view = View::with_config(&dst, ViewConfig::borrowed()).unwrap();
    let src_view = View::new(&src).unwrap();

    assert!(matches!(
        dst_view.move_from(&src_view),
        Err(InspectError::OutOfBounds { needed: 48, available: 32 })
    ));
    assert!(!src_view.is_dropped());
    assert_eq!(float::value(&dst).unwrap(), 3.0);
    assert_eq!(tuple::len(&src), 3);
}

#[test]
fn test_swap_exchanges_identity_at_fixed_addresses() {
    let _guard = common::setup();
    let a = int::new(7).unwrap();
    let b = int::new(-9).unwrap();
    let (addr_a, addr_b) = (a.addr(), b.addr());

    let (va, vb) = view(&a).unwrap().swap(&view(&b).unwrap()).unwrap();
    assert_eq!(va.address().get(), addr_a);
    assert_eq!(vb.address().get(), addr_b);
    assert_eq!(int::value(&a).unwrap(), -9);
    assert_eq!(int::value(&b).unwrap(), 7);
    assert_eq!(int::value(&ops::add(&a, &b).unwrap()).unwrap(), -2);
}

#[test]
fn test_swap_respects_staging_limit() {
    let a = string::new(&"x".repeat(256)).unwrap();
    let b = string::new(&"y".repeat(256)).unwrap();
    let config = ViewConfig {
        max_swap_bytes: 64,
        ..Default::default()
    };
    let va = View::with_config(&a, config.clone()).unwrap();
    let vb = View::with_config(&b, config).unwrap();

    assert!(matches!(va.swap(&vb), Err(InspectError::OutOfBounds { .. })));
    assert!(!va.is_dropped() && !vb.is_dropped());
}
