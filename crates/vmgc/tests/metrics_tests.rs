//! Integration tests for per-run and cumulative metrics.

mod common;

use common::{counting_type, new_node};
use vmgc::{CollectionType, GcConfig, Instance};

#[test]
fn test_no_run_yet() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let m = instance.last_gc_metrics();
    assert_eq!(m.collection_type, CollectionType::None);
    assert_eq!(m.total_collections, 0);
    assert_eq!(instance.global_metrics().total_collections(), 0);
}

#[test]
fn test_nursery_run_metrics() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let tc = instance.main_thread();
    let (_counting, mut desc) = counting_type(&tc);
    let _scope = tc.root_scope();
    unsafe { tc.root_push(&mut desc) };

    let mut kept = new_node(&tc, desc, 1);
    unsafe { tc.root_push(&mut kept) };
    for i in 0..10 {
        new_node(&tc, desc, 100 + i);
    }

    tc.collect();
    let m = instance.last_gc_metrics();
    assert_eq!(m.collection_type, CollectionType::Nursery);
    assert_eq!(m.participants, 1);
    assert_eq!(m.threads_stolen, 0);
    // The descriptor and the rooted node.
    assert_eq!(m.objects_copied, 2);
    assert_eq!(m.objects_promoted, 0);
    assert_eq!(m.objects_freed, 10);
    assert_eq!(m.total_collections, 1);

    tc.collect();
    let m2 = instance.last_gc_metrics();
    assert!(m2.seq > m.seq);
    assert_eq!(m2.objects_promoted, 2);
    assert_eq!(m2.objects_copied, 0);
    assert_eq!(m2.total_collections, 2);
}

#[test]
fn test_full_run_metrics() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let tc = instance.main_thread();
    let (_counting, mut desc) = counting_type(&tc);
    let _scope = tc.root_scope();
    unsafe { tc.root_push(&mut desc) };
    let mut kept = new_node(&tc, desc, 1);
    unsafe { tc.root_push(&mut kept) };

    tc.collect();
    tc.collect();
    tc.collect_full();
    let m = instance.last_gc_metrics();
    assert_eq!(m.collection_type, CollectionType::Full);
    assert_eq!(m.gen2_marked, 2);
    assert_eq!(m.objects_freed, 0);
}

#[test]
fn test_global_metrics_accumulate() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let tc = instance.main_thread();
    let (_counting, mut desc) = counting_type(&tc);
    let _scope = tc.root_scope();
    unsafe { tc.root_push(&mut desc) };

    for round in 0..3 {
        for i in 0..5 {
            new_node(&tc, desc, round * 10 + i);
        }
        tc.collect();
    }
    tc.collect_full();

    let global = instance.global_metrics();
    assert_eq!(global.total_collections(), 4);
    assert_eq!(global.total_nursery_collections(), 3);
    assert_eq!(global.total_full_collections(), 1);
    assert_eq!(global.total_objects_freed(), 15);
    // The descriptor, promoted on the second run.
    assert_eq!(global.total_objects_promoted(), 1);
    assert_eq!(instance.last_gc_metrics().total_collections, 4);
}
