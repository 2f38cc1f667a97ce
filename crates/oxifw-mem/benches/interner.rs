//! Interner throughput for selector-shaped names.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use oxifw_mem::StringInterner;

fn selector_names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("performAction{i}:withObject:")).collect()
}

fn bench_intern_fresh(c: &mut Criterion) {
    let mut group = c.benchmark_group("intern_fresh");
    for count in [16, 256, 4096] {
        let names = selector_names(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &names, |b, names| {
            b.iter(|| {
                let mut interner = StringInterner::with_capacity(names.len());
                for name in names {
                    black_box(interner.intern(name));
                }
            });
        });
    }
    group.finish();
}

fn bench_intern_hit(c: &mut Criterion) {
    let names = selector_names(256);
    let mut interner = StringInterner::new();
    for name in &names {
        interner.intern(name);
    }
    c.bench_function("intern_hit", |b| {
        b.iter(|| {
            for name in &names {
                black_box(interner.intern(name));
            }
        });
    });
}

fn bench_resolve(c: &mut Criterion) {
    let mut interner = StringInterner::new();
    let symbols: Vec<_> = selector_names(256).iter().map(|n| interner.intern(n)).collect();
    c.bench_function("resolve", |b| {
        b.iter(|| {
            for sym in &symbols {
                black_box(interner.resolve(*sym));
            }
        });
    });
}

criterion_group!(benches, bench_intern_fresh, bench_intern_hit, bench_resolve);
criterion_main!(benches);
