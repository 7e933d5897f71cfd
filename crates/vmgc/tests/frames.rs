//! Call-frame roots.

mod common;

use std::ptr::NonNull;
use std::sync::Arc;

use common::{counting_type, new_node, node};
use vmgc::{ArgFlags, Callsite, Frame, GcConfig, Instance, Params, Ref, Register, RegisterKind};

#[test]
fn test_frame_registers_are_roots_and_updated() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let tc = instance.main_thread();
    let (counting, mut desc) = counting_type(&tc);
    let _scope = tc.root_scope();
    unsafe { tc.root_push(&mut desc) };

    let local = new_node(&tc, desc, 1);
    let lexical = new_node(&tc, desc, 2);
    let arg = new_node(&tc, desc, 3);
    let in_caller = new_node(&tc, desc, 4);
    let garbage = new_node(&tc, desc, 5);

    let mut caller = Frame::new(
        Ref::NULL,
        Ref::NULL,
        Arc::from([RegisterKind::Obj]),
        Arc::from([]),
    );
    caller.work[0] = Register::obj(in_caller);

    let mut frame = Frame::new(
        Ref::NULL,
        Ref::NULL,
        Arc::from([RegisterKind::Int, RegisterKind::Obj]),
        Arc::from([RegisterKind::Str]),
    );
    // An integer that happens to equal an address is not a root.
    frame.work[0] = Register::int(garbage.addr() as i64);
    frame.work[1] = Register::obj(local);
    frame.env[0] = Register::obj(lexical);
    frame.args = vec![Register::obj(arg), Register::int(7)];
    frame.cur_args_callsite = Some(Arc::new(Callsite::new(vec![ArgFlags::OBJ, ArgFlags::INT])));
    frame.caller = Some(NonNull::from(&mut caller));

    unsafe { tc.set_current_frame(Some(NonNull::from(&mut frame))) };
    tc.collect();
    unsafe { tc.set_current_frame(None) };

    let seq = instance.last_gc_metrics().seq;
    assert!(frame.scanned_in(seq));
    assert!(caller.scanned_in(seq));
    assert_eq!(counting.frees(), 1);
    assert_eq!(*counting.freed_ids.lock().unwrap(), vec![5]);

    let ids = unsafe {
        [
            node(frame.work[1].as_obj()).id,
            node(frame.env[0].as_obj()).id,
            node(frame.args[0].as_obj()).id,
            node(caller.work[0].as_obj()).id,
        ]
    };
    assert_eq!(ids, [1, 2, 3, 4]);
    assert_ne!(unsafe { frame.work[1].as_obj() }, local);
    assert_eq!(unsafe { frame.args[1].i64 }, 7);
}

#[test]
fn test_frame_reached_twice_is_scanned_once() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let tc = instance.main_thread();
    let (counting, mut desc) = counting_type(&tc);
    let _scope = tc.root_scope();
    unsafe { tc.root_push(&mut desc) };

    let shared_obj = new_node(&tc, desc, 1);
    let mut shared = Frame::new(Ref::NULL, Ref::NULL, Arc::from([RegisterKind::Obj]), Arc::from([]));
    shared.work[0] = Register::obj(shared_obj);

    let mut frame = Frame::new(Ref::NULL, Ref::NULL, Arc::from([]), Arc::from([]));
    frame.caller = Some(NonNull::from(&mut shared));
    frame.outer = Some(NonNull::from(&mut shared));

    unsafe { tc.set_current_frame(Some(NonNull::from(&mut frame))) };
    tc.collect();
    unsafe { tc.set_current_frame(None) };

    assert_eq!(counting.traces(), 1);
    assert!(shared.scanned_in(instance.last_gc_metrics().seq));
}

#[test]
fn test_params_are_scanned_only_when_flattened() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let tc = instance.main_thread();
    let (counting, mut desc) = counting_type(&tc);
    let _scope = tc.root_scope();
    unsafe { tc.root_push(&mut desc) };

    let kept = new_node(&tc, desc, 1);
    let dropped = new_node(&tc, desc, 2);

    let mut flat = Frame::new(Ref::NULL, Ref::NULL, Arc::from([]), Arc::from([]));
    flat.params = Some(Params {
        callsite: Arc::new(Callsite::new(vec![ArgFlags::OBJ.union(ArgFlags::FLAT)])),
        args: vec![Register::obj(kept)],
    });
    let mut plain = Frame::new(Ref::NULL, Ref::NULL, Arc::from([]), Arc::from([]));
    plain.params = Some(Params {
        callsite: Arc::new(Callsite::new(vec![ArgFlags::OBJ])),
        args: vec![Register::obj(dropped)],
    });
    flat.caller = Some(NonNull::from(&mut plain));

    unsafe { tc.set_current_frame(Some(NonNull::from(&mut flat))) };
    tc.collect();
    unsafe { tc.set_current_frame(None) };

    assert_eq!(*counting.freed_ids.lock().unwrap(), vec![2]);
    let moved = unsafe { flat.params.as_ref().unwrap().args[0].as_obj() };
    assert_eq!(unsafe { node(moved) }.id, 1);
}

#[test]
fn test_code_ref_and_static_info_are_roots() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let tc = instance.main_thread();
    let (counting, mut desc) = counting_type(&tc);
    let _scope = tc.root_scope();
    unsafe { tc.root_push(&mut desc) };

    let code = new_node(&tc, desc, 1);
    let info = new_node(&tc, desc, 2);
    let mut frame = Frame::new(info, code, Arc::from([]), Arc::from([]));
    frame.context_object = new_node(&tc, desc, 3);

    unsafe { tc.set_current_frame(Some(NonNull::from(&mut frame))) };
    tc.collect();
    unsafe { tc.set_current_frame(None) };

    assert_eq!(counting.frees(), 0);
    assert_eq!(counting.traces(), 3);
    assert_eq!(unsafe { node(frame.code_ref) }.id, 1);
    assert_eq!(unsafe { node(frame.static_info) }.id, 2);
    assert_eq!(unsafe { node(frame.context_object) }.id, 3);
}
