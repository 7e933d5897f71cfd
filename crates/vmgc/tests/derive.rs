//! Tests for the #[derive(Trace)] macro.

use std::sync::Arc;

use vmgc::{GcConfig, Instance, Ref, StructRepr, ThreadContext, Trace, Worklist};

#[derive(Default, Trace)]
#[repr(C)]
struct Named {
    first: Ref,
    count: u64,
    rest: Vec<Ref>,
    #[vmgc(skip)]
    cache: Ref,
}

#[derive(Default, Trace)]
struct Tuple(Ref, u32, Option<Ref>);

#[derive(Default, Trace)]
struct Wrapper<T> {
    inner: T,
}

#[derive(Trace)]
enum Slot {
    Empty,
    One(Ref),
    Pair { left: Ref, right: Ref },
}

#[derive(Default, Trace)]
struct Leaf {
    value: u64,
}

fn leaf_type(tc: &ThreadContext) -> Ref {
    tc.allocate_descriptor(Arc::new(StructRepr::<Leaf>::new("Leaf")), "Leaf")
}

fn leaf(tc: &ThreadContext, desc: Ref, value: u64) -> Ref {
    let r = tc.allocate_object(desc, StructRepr::<Leaf>::body_size());
    unsafe { StructRepr::<Leaf>::init_body(r, Leaf { value }) };
    r
}

fn value(r: Ref) -> u64 {
    unsafe { StructRepr::<Leaf>::body(r) }.value
}

#[test]
fn test_derive_named_struct_skips_marked_fields() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let tc = instance.main_thread();
    let mut leaf_desc = leaf_type(&tc);
    let _scope = tc.root_scope();
    unsafe { tc.root_push(&mut leaf_desc) };

    let mut named = Named {
        first: leaf(&tc, leaf_desc, 1),
        count: 3,
        rest: vec![leaf(&tc, leaf_desc, 2), Ref::NULL, leaf(&tc, leaf_desc, 3)],
        cache: leaf(&tc, leaf_desc, 4),
    };
    let mut worklist = Worklist::new(false);
    named.trace(&mut worklist);
    // Null slots and the skipped field are not enqueued.
    assert_eq!(worklist.len(), 3);
}

#[test]
fn test_derive_tuple_struct() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let tc = instance.main_thread();
    let desc = leaf_type(&tc);

    let mut tuple = Tuple(leaf(&tc, desc, 1), 7, None);
    let mut worklist = Worklist::new(false);
    tuple.trace(&mut worklist);
    assert_eq!(worklist.len(), 1);

    tuple.2 = Some(leaf(&tc, desc, 2));
    let mut worklist = Worklist::new(false);
    tuple.trace(&mut worklist);
    assert_eq!(worklist.len(), 2);
}

#[test]
fn test_derive_enum_variants() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let tc = instance.main_thread();
    let desc = leaf_type(&tc);
    let a = leaf(&tc, desc, 1);
    let b = leaf(&tc, desc, 2);

    for (mut slot, expected) in [
        (Slot::Empty, 0),
        (Slot::One(a), 1),
        (Slot::Pair { left: a, right: b }, 2),
    ] {
        let mut worklist = Worklist::new(false);
        slot.trace(&mut worklist);
        assert_eq!(worklist.len(), expected);
    }
}

#[test]
fn test_derived_body_survives_collection() {
    let instance = Instance::new(GcConfig::default()).unwrap();
    let tc = instance.main_thread();
    let mut leaf_desc = leaf_type(&tc);
    let mut pair_desc = tc.allocate_descriptor(
        Arc::new(StructRepr::<Wrapper<Tuple>>::new("Wrapper")),
        "Wrapper",
    );
    let _scope = tc.root_scope();
    unsafe {
        tc.root_push(&mut leaf_desc);
        tc.root_push(&mut pair_desc);
    }

    let mut outer = tc.allocate_object(pair_desc, StructRepr::<Wrapper<Tuple>>::body_size());
    unsafe { StructRepr::<Wrapper<Tuple>>::init_body(outer, Wrapper::default()) };
    unsafe { tc.root_push(&mut outer) };

    let first = leaf(&tc, leaf_desc, 10);
    unsafe { tc.assign_ref(outer, &mut StructRepr::<Wrapper<Tuple>>::body(outer).inner.0, first) };
    let second = leaf(&tc, leaf_desc, 20);
    unsafe { StructRepr::<Wrapper<Tuple>>::body(outer) }.inner.2 = Some(second);

    tc.collect();

    let body = unsafe { StructRepr::<Wrapper<Tuple>>::body(outer) };
    assert_ne!(body.inner.0, first);
    assert_eq!(value(body.inner.0), 10);
    let moved = body.inner.2.unwrap();
    assert_ne!(moved, second);
    assert_eq!(value(moved), 20);
    assert!(tc.nursery_contains(moved));
}

#[test]
fn test_derive_custom_crate_path() {
    mod renamed {
        pub use vmgc as gc;
    }

    #[derive(Default, Trace)]
    #[vmgc(crate = renamed::gc)]
    struct Aliased {
        slot: Ref,
    }

    let mut value = Aliased::default();
    let mut worklist = Worklist::new(false);
    value.trace(&mut worklist);
    assert!(worklist.is_empty());
}
