//! Slot Dispatch Benchmarks
//!
//! Measures the cost of the generic operations and attribute lookup.
//!
//! # Benchmark Categories
//!
//! 1. **Native Slots**: arithmetic through built-in slot functions
//! 2. **Trampolines**: slots that dispatch back through a dunder lookup
//! 3. **Attribute Lookup**: cached type lookup vs uncached MRO walk

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use marrow_runtime::object::attr::type_lookup_uncached;
use marrow_runtime::types::{function, int};
use marrow_runtime::{ClassSpec, Obj, RtResult, call, get_attr, new_class, ops, set_attr, type_lookup};

fn add_one(args: &[Obj]) -> RtResult<Obj> {
    int::new(int::value(&args[1])? + 1)
}

// =============================================================================
// Native Slot Benchmarks
// =============================================================================

fn bench_native_slots(c: &mut Criterion) {
    let mut group = c.benchmark_group("native_slots");

    group.bench_function("int_add", |b| {
        let x = int::new(20).unwrap();
        let y = int::new(22).unwrap();
        b.iter(|| black_box(ops::add(&x, &y).unwrap()))
    });

    group.bench_function("int_hash", |b| {
        let x = int::new(12345).unwrap();
        b.iter(|| black_box(ops::hash(&x).unwrap()))
    });

    group.finish();
}

// =============================================================================
// Trampoline Benchmarks
// =============================================================================

fn bench_trampolines(c: &mut Criterion) {
    let mut group = c.benchmark_group("trampolines");

    group.bench_function("user_add", |b| {
        let f = function::native("__add__", add_one).unwrap();
        let cls = new_class(&ClassSpec::new("BenchAdd").attr("__add__", f)).unwrap();
        let inst = call(&cls, &[]).unwrap();
        let rhs = int::new(1).unwrap();
        b.iter(|| black_box(ops::add(&inst, &rhs).unwrap()))
    });

    group.finish();
}

// =============================================================================
// Attribute Lookup Benchmarks
// =============================================================================

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("attribute_lookup");

    for depth in [1usize, 4, 8] {
        let mut cls = new_class(&ClassSpec::new("Depth0")).unwrap();
        set_attr(&cls, "marker", &int::new(1).unwrap()).unwrap();
        for i in 1..depth {
            cls = new_class(&ClassSpec::new(format!("Depth{i}")).base(&cls)).unwrap();
        }
        let tp = cls.as_type_ptr().unwrap();

        group.bench_with_input(BenchmarkId::new("cached", depth), &depth, |b, _| {
            let t = unsafe { &*tp };
            b.iter(|| black_box(type_lookup(t, "marker")))
        });
        group.bench_with_input(BenchmarkId::new("uncached", depth), &depth, |b, _| {
            let t = unsafe { &*tp };
            b.iter(|| black_box(type_lookup_uncached(t, "marker")))
        });
    }

    group.bench_function("instance_dict_get", |b| {
        let cls = new_class(&ClassSpec::new("BenchInst")).unwrap();
        let inst = call(&cls, &[]).unwrap();
        set_attr(&inst, "x", &int::new(3).unwrap()).unwrap();
        b.iter(|| black_box(get_attr(&inst, "x").unwrap()))
    });

    group.finish();
}

// =============================================================================
// Criterion Groups
// =============================================================================

criterion_group!(dispatch_benches, bench_native_slots, bench_trampolines, bench_lookup);

criterion_main!(dispatch_benches);
