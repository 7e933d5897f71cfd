//! Benchmark: nursery allocation and collection pauses.
//!
//! Measures bump allocation throughput, the pause of a nursery run over
//! live chains of different lengths, and a full run after promotion.

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use vmgc::{GcConfig, Instance, Ref, StructRepr, ThreadContext, Trace};

#[derive(Default, Trace)]
#[repr(C)]
struct Node {
    next: Ref,
    value: u64,
}

fn node_type(tc: &ThreadContext) -> Ref {
    tc.allocate_descriptor(Arc::new(StructRepr::<Node>::new("Node")), "Node")
}

/// Builds a chain of `len` nodes rooted at `head`.
fn build_chain(tc: &ThreadContext, desc: Ref, head: &mut Ref, len: u64) {
    *head = tc.allocate_object(desc, StructRepr::<Node>::body_size());
    let mut prev = *head;
    unsafe { tc.root_push(&mut prev) };
    for value in 1..len {
        let n = tc.allocate_object(desc, StructRepr::<Node>::body_size());
        // SAFETY: zeroed bytes are a valid Node, and both nodes are live.
        unsafe {
            StructRepr::<Node>::body(n).value = value;
            tc.assign_ref(prev, &mut StructRepr::<Node>::body(prev).next, n);
        }
        prev = n;
    }
    tc.root_pop();
}

fn bench_allocation(c: &mut Criterion) {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let tc = instance.main_thread();
    let mut desc = node_type(&tc);
    let _scope = tc.root_scope();
    unsafe { tc.root_push(&mut desc) };

    c.bench_function("allocate_1000_nodes", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                black_box(tc.allocate_object(desc, StructRepr::<Node>::body_size()));
            }
        });
    });
}

fn bench_nursery_pause(c: &mut Criterion) {
    let mut group = c.benchmark_group("nursery_pause");
    for len in [100_u64, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            let instance = Instance::new(GcConfig::default()).unwrap();
            let tc = instance.main_thread();
            let mut desc = node_type(&tc);
            let mut head = Ref::NULL;
            let _scope = tc.root_scope();
            unsafe {
                tc.root_push(&mut desc);
                tc.root_push(&mut head);
            }
            b.iter(|| {
                // A fresh chain each time so that it is copied, not promoted.
                build_chain(&tc, desc, &mut head, len);
                tc.collect();
                head = Ref::NULL;
            });
        });
    }
    group.finish();
}

fn bench_full_run(c: &mut Criterion) {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let tc = instance.main_thread();
    let mut desc = node_type(&tc);
    let mut head = Ref::NULL;
    let _scope = tc.root_scope();
    unsafe {
        tc.root_push(&mut desc);
        tc.root_push(&mut head);
    }
    build_chain(&tc, desc, &mut head, 10_000);
    tc.collect();
    tc.collect();

    c.bench_function("full_run_10000_gen2_nodes", |b| {
        b.iter(|| tc.collect_full());
    });
}

criterion_group!(
    name = nursery;
    config = Criterion::default()
        .sample_size(30)
        .warm_up_time(Duration::from_millis(200))
        .measurement_time(Duration::from_secs(2));
    targets =
        bench_allocation,
        bench_nursery_pause,
        bench_full_run,
);

criterion_main!(nursery);
