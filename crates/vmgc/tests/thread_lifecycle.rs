//! Spawning, exit, deferred destruction and global destruction.

mod common;

use std::sync::Arc;

use common::{counting_type, new_node, node};
use vmgc::{GcConfig, GcStatus, Instance, Ref, ThreadStage};

fn permanent_slot(instance: &Instance) -> *mut Ref {
    let slot: &'static mut Ref = Box::leak(Box::new(Ref::NULL));
    unsafe { instance.add_permanent_root(slot) };
    slot
}

#[test]
fn test_child_stages_from_spawn_to_exit() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let main = instance.main_thread();
    let (tx, rx) = std::sync::mpsc::channel::<()>();
    let handle = instance
        .spawn(&main, move |tc| {
            assert_eq!(tc.stage(), ThreadStage::Started);
            assert_eq!(tc.status(), GcStatus::None);
            rx.recv().unwrap();
        })
        .unwrap();
    assert_eq!(instance.num_user_threads(), 1);
    assert_eq!(instance.registered_threads(), 2);
    tx.send(()).unwrap();
    main.join(handle).unwrap();

    let child = instance.thread(2).unwrap();
    assert_eq!(child.stage(), ThreadStage::Exited);
    assert_eq!(child.status(), GcStatus::Unable);
    assert_eq!(instance.morgue_thread_count(), 1);
}

#[test]
fn test_exited_thread_heap_is_taken_over() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let main = instance.main_thread();
    let (counting, desc) = counting_type(&main);
    let desc_root = permanent_slot(&instance);
    let head_root = permanent_slot(&instance);
    unsafe { *desc_root = desc };
    let (desc_addr, head_addr) = (desc_root as usize, head_root as usize);

    let handle = instance
        .spawn(&main, move |tc| {
            let desc = unsafe { *(desc_addr as *const Ref) };
            let mut head = new_node(tc, desc, 0);
            let _scope = tc.root_scope();
            unsafe { tc.root_push(&mut head) };
            let mut prev = head;
            for id in 1..50 {
                let n = new_node(tc, desc, id);
                unsafe { node(prev) }.next = n;
                prev = n;
            }
            // Garbage.
            for id in 100..150 {
                let _ = new_node(tc, desc, id);
            }
            unsafe { *(head_addr as *mut Ref) = head };
        })
        .unwrap();
    main.join(handle).unwrap();
    let worker = instance.thread(2).unwrap();

    // First run: every survivor is promoted into the exited thread's gen2.
    main.collect();
    assert_eq!(worker.stage(), ThreadStage::ClearingNursery);
    assert_eq!(counting.frees(), 50);
    let head = unsafe { *head_root };
    assert!(worker.gen2_contains(head));

    // Second run: the heap moves to the collector and the thread is gone.
    main.collect();
    assert_eq!(worker.stage(), ThreadStage::Destroyed);
    assert_eq!(instance.registered_threads(), 1);
    assert_eq!(instance.num_user_threads(), 0);
    assert_eq!(instance.morgue_thread_count(), 0);

    let mut cur = unsafe { *head_root };
    for id in 0..50 {
        assert!(main.gen2_contains(cur));
        assert_eq!(unsafe { cur.header() }.owner(), Arc::as_ptr(&main));
        assert_eq!(unsafe { node(cur) }.id, id);
        cur = unsafe { node(cur) }.next;
    }
    assert!(cur.is_null());

    // The taken-over objects are swept like any other gen2 object.
    unsafe { *head_root = Ref::NULL };
    main.collect_full();
    assert_eq!(counting.frees(), 100);
}

#[test]
fn test_panicking_thread_still_exits() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let main = instance.main_thread();
    let handle = instance
        .spawn(&main, |_tc| {
            panic!("worker failed");
        })
        .unwrap();
    assert!(main.join(handle).is_err());
    assert_eq!(instance.morgue_thread_count(), 1);

    main.collect();
    main.collect();
    assert_eq!(instance.registered_threads(), 1);
    assert_eq!(instance.num_user_threads(), 0);
}

#[test]
fn test_global_destruction_frees_everything() {
    const THREADS: u64 = 3;
    const PER_THREAD: u64 = 40;

    let instance = Instance::new(GcConfig::default()).unwrap();
    let main = instance.main_thread();
    let (counting, desc) = counting_type(&main);
    let desc_root = permanent_slot(&instance);
    unsafe { *desc_root = desc };
    let desc_addr = desc_root as usize;

    let mut handles = Vec::new();
    for t in 0..THREADS {
        handles.push(
            instance
                .spawn(&main, move |tc| {
                    let desc = unsafe { *(desc_addr as *const Ref) };
                    let mut keep = new_node(tc, desc, t * 1000);
                    tc.with_thread_roots(|roots| roots.thread_obj = keep);
                    for i in 1..PER_THREAD {
                        let n = new_node(tc, desc, t * 1000 + i);
                        if i % 2 == 0 {
                            keep = tc.with_thread_roots(|roots| roots.thread_obj);
                            unsafe { node(n) }.next = keep;
                            tc.with_thread_roots(|roots| roots.thread_obj = n);
                        }
                    }
                })
                .unwrap(),
        );
    }
    let mut mine = new_node(&main, unsafe { *desc_root }, 9999);
    let _scope = main.root_scope();
    unsafe { main.root_push(&mut mine) };

    instance.global_destruction(&main);
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(instance.num_user_threads(), 0);
    assert_eq!(instance.morgue_thread_count(), 0);
    assert_eq!(instance.registered_threads(), 1);
    assert_eq!(counting.frees() as u64, THREADS * PER_THREAD + 1);
    let mut freed = counting.freed_ids.lock().unwrap().clone();
    freed.sort_unstable();
    freed.dedup();
    assert_eq!(freed.len() as u64, THREADS * PER_THREAD + 1);
}
