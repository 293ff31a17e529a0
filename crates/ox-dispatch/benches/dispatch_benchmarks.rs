//! Benchmarks for the indirect call hot path

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use ox_core::diag::DiagnosticCounters;
use ox_dispatch::{CallContext, Dispatcher, FunctionMapping, FunctionTable};
use ox_memory::AddressSpace;

fn nop_fn(ctx: &mut CallContext, _space: &AddressSpace) {
    ctx.set_r3(1);
}

fn bench_resolve(c: &mut Criterion) {
    let space = AddressSpace::reserve().unwrap();
    let code_base = space.layout().code_base;

    let table = Arc::new(FunctionTable::new(space.clone()));
    table.populate(&[FunctionMapping::new(code_base, nop_fn), FunctionMapping::END]);

    let diag = Arc::new(DiagnosticCounters::new());
    let dispatcher = Dispatcher::new(table, space.clone(), diag);

    let mut group = c.benchmark_group("resolve");

    group.bench_function("registered_target", |b| {
        b.iter(|| dispatcher.resolve(black_box(code_base)));
    });

    group.bench_function("null_target", |b| {
        b.iter(|| dispatcher.resolve(black_box(0)));
    });

    group.bench_function("out_of_range_target", |b| {
        b.iter(|| dispatcher.resolve(black_box(0xF000_0000)));
    });

    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let space = AddressSpace::reserve().unwrap();
    let code_base = space.layout().code_base;

    let table = Arc::new(FunctionTable::new(space.clone()));
    table.populate(&[FunctionMapping::new(code_base, nop_fn), FunctionMapping::END]);

    let diag = Arc::new(DiagnosticCounters::new());
    let dispatcher = Dispatcher::new(table, space.clone(), diag);

    c.bench_function("dispatch_registered_target", |b| {
        let mut ctx = CallContext::new();
        b.iter(|| {
            dispatcher.dispatch(black_box(code_base), &mut ctx);
            black_box(ctx.r3());
        });
    });
}

criterion_group!(benches, bench_resolve, bench_dispatch);
criterion_main!(benches);
