//! Record and View Benchmarks
//!
//! Measures the overhead views add over direct runtime access.
//!
//! # Benchmark Categories
//!
//! 1. **Layout Resolution**: static kinds vs per-class cached layouts
//! 2. **Field Access**: view reads against the runtime accessors
//! 3. **Transplants**: moving and swapping object bodies

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use marrow_inspect::{ObjectRecord, View, catalog, view};
use marrow_runtime::types::{float, int, list, string};
use marrow_runtime::{ClassSpec, call, new_class};

// =============================================================================
// Layout Resolution Benchmarks
// =============================================================================

fn bench_layouts(c: &mut Criterion) {
    let mut group = c.benchmark_group("layout_resolution");

    group.bench_function("builtin_float", |b| {
        let x = float::new(1.0).unwrap();
        b.iter(|| black_box(ObjectRecord::of(&x).unwrap()))
    });

    group.bench_function("user_instance", |b| {
        let cls = new_class(&ClassSpec::new("BenchRecord").slots(&["a", "b", "c"])).unwrap();
        let inst = call(&cls, &[]).unwrap();
        b.iter(|| black_box(ObjectRecord::of(&inst).unwrap()))
    });

    group.bench_function("static_lookup", |b| {
        b.iter(|| black_box(catalog::static_layout(black_box(catalog::RecordKind::Str))))
    });

    group.finish();
}

// =============================================================================
// Field Access Benchmarks
// =============================================================================

fn bench_fields(c: &mut Criterion) {
    let mut group = c.benchmark_group("field_access");

    let x = float::new(2.5).unwrap();
    let v = view(&x).unwrap();
    group.bench_function("float_view_value", |b| {
        let f = v.as_float().unwrap();
        b.iter(|| black_box(f.value().unwrap()))
    });
    group.bench_function("float_runtime_value", |b| {
        b.iter(|| black_box(float::value(&x).unwrap()))
    });

    group.bench_function("int_view_value", |b| {
        let n = int::new(1 << 40).unwrap();
        let v = view(&n).unwrap();
        let i = v.as_int().unwrap();
        b.iter(|| black_box(i.value().unwrap()))
    });

    group.bench_function("str_view_text", |b| {
        let s = string::new("a moderately sized string for benchmarking").unwrap();
        let v = view(&s).unwrap();
        let sv = v.as_str().unwrap();
        b.iter(|| black_box(sv.text().unwrap()))
    });

    group.finish();
}

// =============================================================================
// Transplant Benchmarks
// =============================================================================

fn bench_transplants(c: &mut Criterion) {
    let mut group = c.benchmark_group("transplants");

    group.bench_function("move_float", |b| {
        b.iter_batched(
            || (float::new(1.0).unwrap(), float::new(2.0).unwrap()),
            |(dst, src)| {
                let dst_view = View::new(&dst).unwrap();
                black_box(dst_view.move_from_obj(&src).unwrap())
            },
            BatchSize::SmallInput,
        )
    });

    group.bench_function("swap_lists", |b| {
        let items: Vec<_> = (0..16).map(|i| int::new(i).unwrap()).collect();
        b.iter_batched(
            || (list::new(&items).unwrap(), list::new(&items[..4]).unwrap()),
            |(l, r)| {
                let pair = View::new(&l).unwrap().swap(&View::new(&r).unwrap()).unwrap();
                black_box(pair)
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

// =============================================================================
// Criterion Groups
// =============================================================================

criterion_group!(record_benches, bench_layouts, bench_fields, bench_transplants);

criterion_main!(record_benches);
