//! Promotion, the write barrier, and the gen2 sweep.

mod common;

use common::{counting_type, link, new_node, node};
use vmgc::{CollectionType, Flags, Forward, GcConfig, Instance};

#[test]
fn test_survivor_is_promoted_on_second_run() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let tc = instance.main_thread();
    let (_counting, mut desc) = counting_type(&tc);
    let _scope = tc.root_scope();
    unsafe { tc.root_push(&mut desc) };
    let mut a = new_node(&tc, desc, 1);
    unsafe { tc.root_push(&mut a) };

    tc.collect();
    let flags = unsafe { a.header() }.flags();
    assert!(flags.contains(Flags::NURSERY_SEEN));
    assert!(!flags.contains(Flags::SECOND_GEN));
    assert!(tc.nursery_contains(a));

    tc.collect();
    let flags = unsafe { a.header() }.flags();
    assert!(flags.contains(Flags::SECOND_GEN));
    assert!(!flags.contains(Flags::NURSERY_SEEN));
    assert!(tc.gen2_contains(a));
    assert!(!tc.nursery_contains(a));
    assert_eq!(unsafe { node(a) }.id, 1);
    assert_eq!(instance.last_gc_metrics().objects_promoted, 2);

    // Later nursery runs leave it where it is.
    let promoted = a;
    tc.collect();
    assert_eq!(a, promoted);
    let m = instance.last_gc_metrics();
    assert_eq!(m.objects_copied, 0);
    assert_eq!(m.objects_promoted, 0);
    assert!(!tc.has_gen2_root(a));
}

#[test]
fn test_write_barrier_keeps_young_referent_alive() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let tc = instance.main_thread();
    let (counting, mut desc) = counting_type(&tc);
    let _scope = tc.root_scope();
    unsafe { tc.root_push(&mut desc) };
    let mut old = new_node(&tc, desc, 1);
    unsafe { tc.root_push(&mut old) };
    tc.collect();
    tc.collect();
    assert!(tc.gen2_contains(old));

    let young = new_node(&tc, desc, 2);
    link(&tc, old, young);
    assert!(tc.has_gen2_root(old));
    assert!(unsafe { old.header() }.flags().contains(Flags::IN_GEN2_ROOT_LIST));

    tc.collect();
    assert_eq!(counting.frees(), 0);
    let moved = unsafe { node(old) }.next;
    assert_ne!(moved, young);
    assert!(tc.nursery_contains(moved));
    assert_eq!(unsafe { node(moved) }.id, 2);
    // Still points into the nursery.
    assert!(tc.has_gen2_root(old));

    // Promoted on the next run; the root is dropped on the one after.
    tc.collect();
    let promoted = unsafe { node(old) }.next;
    assert!(tc.gen2_contains(promoted));
    tc.collect();
    assert!(!tc.has_gen2_root(old));
    assert!(!unsafe { old.header() }.flags().contains(Flags::IN_GEN2_ROOT_LIST));
    assert_eq!(unsafe { node(old) }.next, promoted);
}

#[test]
fn test_barrier_ignores_young_containers_and_old_referents() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let tc = instance.main_thread();
    let (_counting, mut desc) = counting_type(&tc);
    let _scope = tc.root_scope();
    unsafe { tc.root_push(&mut desc) };
    let mut a = new_node(&tc, desc, 1);
    let mut b = new_node(&tc, desc, 2);
    unsafe {
        tc.root_push(&mut a);
        tc.root_push(&mut b);
    }
    tc.collect();
    tc.collect();
    tc.collect();
    assert_eq!(tc.gen2_root_count(), 0);

    // Old to old.
    link(&tc, a, b);
    assert_eq!(tc.gen2_root_count(), 0);

    // Young to old.
    let young = new_node(&tc, desc, 3);
    link(&tc, young, a);
    assert_eq!(tc.gen2_root_count(), 0);
}

#[test]
fn test_nursery_run_leaves_gen2_marks_untouched() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let tc = instance.main_thread();
    let (_counting, mut desc) = counting_type(&tc);
    let _scope = tc.root_scope();
    unsafe { tc.root_push(&mut desc) };
    let mut a = new_node(&tc, desc, 1);
    unsafe { tc.root_push(&mut a) };
    tc.collect();
    tc.collect();
    tc.collect();

    let before = unsafe { a.header() }.flags();
    assert_eq!(unsafe { a.header() }.forward(), Forward::Unvisited);
    tc.collect();
    assert_eq!(instance.last_gc_metrics().collection_type, CollectionType::Nursery);
    assert_eq!(unsafe { a.header() }.forward(), Forward::Unvisited);
    assert_eq!(unsafe { a.header() }.flags(), before);
    assert_eq!(instance.last_gc_metrics().gen2_marked, 0);
}

#[test]
fn test_full_run_frees_unreachable_gen2_objects() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let tc = instance.main_thread();
    let (counting, mut desc) = counting_type(&tc);
    let _scope = tc.root_scope();
    unsafe { tc.root_push(&mut desc) };
    let mut keep = new_node(&tc, desc, 1);
    unsafe { tc.root_push(&mut keep) };
    let mut drop_me = new_node(&tc, desc, 2);
    unsafe { tc.root_push(&mut drop_me) };
    tc.collect();
    tc.collect();
    assert!(tc.gen2_contains(drop_me));

    tc.root_pop();
    tc.collect_full();
    let m = instance.last_gc_metrics();
    assert_eq!(m.collection_type, CollectionType::Full);
    assert_eq!(counting.frees(), 1);
    assert_eq!(*counting.freed_ids.lock().unwrap(), vec![2]);
    assert!(m.gen2_marked >= 2);

    // Survivors are unmarked again for the next run.
    assert_eq!(unsafe { keep.header() }.forward(), Forward::Unvisited);
    assert_eq!(unsafe { node(keep) }.id, 1);

    // Sweeping again with nothing newly dead frees nothing.
    tc.collect_full();
    assert_eq!(counting.frees(), 1);
}

#[test]
fn test_oversized_allocation_goes_to_gen2() {
    let config = GcConfig::default().with_nursery_size(64 * 1024);
    let instance = Instance::new(config).unwrap();
    let tc = instance.main_thread();
    let (counting, mut desc) = counting_type(&tc);
    let _scope = tc.root_scope();
    unsafe { tc.root_push(&mut desc) };

    let big = tc.allocate_object(desc, 128 * 1024);
    unsafe { node(big) }.id = 9;
    assert!(tc.gen2_contains(big));
    assert!(!tc.nursery_contains(big));
    assert!(unsafe { big.header() }.flags().contains(Flags::SECOND_GEN));

    tc.collect_full();
    assert_eq!(*counting.freed_ids.lock().unwrap(), vec![9]);
}

#[test]
fn test_nursery_exhaustion_runs_a_collection() {
    let config = GcConfig::default().with_nursery_size(64 * 1024);
    let instance = Instance::new(config).unwrap();
    let tc = instance.main_thread();
    let (counting, mut desc) = counting_type(&tc);
    let _scope = tc.root_scope();
    unsafe { tc.root_push(&mut desc) };
    let mut keep = new_node(&tc, desc, 0);
    unsafe { tc.root_push(&mut keep) };

    for id in 1..10_000 {
        let _ = new_node(&tc, desc, id);
    }

    assert!(instance.global_metrics().total_collections() > 0);
    assert!(counting.frees() > 0);
    assert_eq!(unsafe { node(keep) }.id, 0);
}
