//! Type descriptors and the representation capability interface.
//!
//! Every object points at a [`TypeDescriptor`], itself a managed allocation.
//! The descriptor carries the shared metadata of a type and the
//! [`Representation`] that knows how the object body is laid out: which
//! slots it holds and which native resources must be released when the
//! object dies.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::Arc;

use crate::gc::worklist::Worklist;
use crate::header::{Collectable, Object, Ref};
use crate::trace::Trace;

/// Per-representation collector callbacks.
///
/// # Safety
///
/// `trace` must enqueue every reference slot in the object body. A missed
/// slot is left pointing at a stale address once its referent moves.
pub unsafe trait Representation: Send + Sync + 'static {
    /// Diagnostic name.
    fn name(&self) -> &'static str;

    /// Enqueues the outgoing slots of `object`'s body.
    fn trace(&self, object: Ref, worklist: &mut Worklist);

    /// Enqueues references held by representation-private type metadata.
    fn trace_type_metadata(&self, _descriptor: &mut TypeDescriptor, _worklist: &mut Worklist) {}

    /// Releases native resources of a dead object.
    fn free(&self, _object: Ref) {}

    /// Releases native resources of a body embedded in another structure.
    fn cleanup_embedded(&self, _body: *mut u8) {}

    /// Whether instances can reach call frames.
    ///
    /// Promoted instances of such representations stay in their owner's
    /// inter-generational root list for good.
    fn refs_frames(&self) -> bool {
        false
    }
}

/// How a type answers boolean context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoolificationSpec {
    /// Representation-defined mode.
    pub mode: u32,
    /// Method invoked for `mode`s that call back into user code.
    pub method: Ref,
}

/// Container behavior attached to a type.
pub trait ContainerSpec: Send + Sync {
    /// Diagnostic name.
    fn name(&self) -> &'static str;

    /// Enqueues references held in the container configuration.
    fn trace_data(&mut self, worklist: &mut Worklist);
}

/// How instances of a type are invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationSpec {
    /// Class owning the invocation attribute.
    pub class_handle: Ref,
    /// Attribute holding the invocable.
    pub attr_name: String,
    /// Handler invoked for every call.
    pub invocation_handler: Ref,
}

/// Shared per-type metadata. Lives in the managed heap like any other
/// collectable.
#[repr(C)]
pub struct TypeDescriptor {
    /// Common header.
    pub header: Collectable,
    /// Body layout and callbacks.
    pub repr: Arc<dyn Representation>,
    /// Diagnostic type name.
    pub name: String,
    /// Meta-object.
    pub how: Ref,
    /// Canonical type object.
    pub what: Ref,
    /// Arbitrary payload set by the language.
    pub who: Ref,
    /// Method lookup cache.
    pub method_cache: Ref,
    /// Virtual dispatch table.
    pub vtable: Vec<Ref>,
    /// Types this type satisfies.
    pub type_check_cache: Vec<Ref>,
    /// Boolean context behavior.
    pub boolification: Option<BoolificationSpec>,
    /// Container behavior.
    pub container_spec: Option<Box<dyn ContainerSpec>>,
    /// Invocation behavior.
    pub invocation_spec: Option<InvocationSpec>,
}

/// Allocation size of a type descriptor.
pub const DESCRIPTOR_SIZE: usize = mem::size_of::<TypeDescriptor>();

impl TypeDescriptor {
    /// Writes a descriptor body over a freshly initialized header.
    ///
    /// # Safety
    ///
    /// `desc` must point at a descriptor-sized allocation whose header is
    /// initialized and whose remaining bytes are not a live value.
    pub(crate) unsafe fn init(desc: Ref, repr: Arc<dyn Representation>, name: String) {
        let p = desc.as_ptr().cast::<Self>();
        // SAFETY: caller guarantees the fields are uninitialized storage.
        unsafe {
            ptr::addr_of_mut!((*p).repr).write(repr);
            ptr::addr_of_mut!((*p).name).write(name);
            ptr::addr_of_mut!((*p).how).write(Ref::NULL);
            ptr::addr_of_mut!((*p).what).write(Ref::NULL);
            ptr::addr_of_mut!((*p).who).write(Ref::NULL);
            ptr::addr_of_mut!((*p).method_cache).write(Ref::NULL);
            ptr::addr_of_mut!((*p).vtable).write(Vec::new());
            ptr::addr_of_mut!((*p).type_check_cache).write(Vec::new());
            ptr::addr_of_mut!((*p).boolification).write(None);
            ptr::addr_of_mut!((*p).container_spec).write(None);
            ptr::addr_of_mut!((*p).invocation_spec).write(None);
        }
    }

    /// Borrows the descriptor behind `desc`.
    ///
    /// # Safety
    ///
    /// `desc` must be a live type descriptor and no other reference to it
    /// may be active.
    #[must_use]
    pub unsafe fn from_ref<'a>(desc: Ref) -> &'a mut Self {
        // SAFETY: caller guarantees validity and exclusivity.
        unsafe { &mut *desc.as_ptr().cast::<Self>() }
    }

    /// Clones the representation of the descriptor behind `desc`.
    ///
    /// # Safety
    ///
    /// `desc` must be a live type descriptor, or the not-yet-reused old copy
    /// of one moved during the current run.
    #[must_use]
    pub(crate) unsafe fn repr_of(desc: Ref) -> Arc<dyn Representation> {
        let p = desc.as_ptr().cast::<Self>();
        // SAFETY: only the repr field is borrowed; it is never written after
        // initialization.
        unsafe { (*ptr::addr_of!((*p).repr)).clone() }
    }

    /// Enqueues the shared metadata slots.
    pub(crate) fn trace_shared(&mut self, worklist: &mut Worklist) {
        worklist.add(&mut self.how);
        worklist.add(&mut self.what);
        worklist.add(&mut self.who);
        worklist.add(&mut self.method_cache);
        for slot in &mut self.vtable {
            worklist.add(slot);
        }
        for slot in &mut self.type_check_cache {
            worklist.add(slot);
        }
        if let Some(spec) = &mut self.boolification {
            worklist.add(&mut spec.method);
        }
        if let Some(spec) = &mut self.container_spec {
            spec.trace_data(worklist);
        }
        if let Some(spec) = &mut self.invocation_spec {
            worklist.add(&mut spec.class_handle);
            worklist.add(&mut spec.invocation_handler);
        }
    }

    /// Runs the destructor of the descriptor fields in place.
    ///
    /// # Safety
    ///
    /// `desc` must be a dead descriptor that no run can still reach; it must
    /// not be destroyed twice.
    pub(crate) unsafe fn destroy(desc: Ref) {
        let p = desc.as_ptr().cast::<Self>();
        // SAFETY: caller guarantees the descriptor is dead and initialized.
        unsafe { ptr::drop_in_place(p) };
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("repr", &self.repr.name())
            .field("vtable", &self.vtable.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// StructRepr
// ============================================================================

/// A representation whose body is a single Rust value of type `T`.
///
/// The body starts zeroed; [`StructRepr::init_body`] must run before the
/// object can be traced or freed unless all-zero bytes are a valid `T`.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use vmgc::{GcConfig, Instance, Ref, StructRepr, Trace};
///
/// #[derive(Trace, Default)]
/// #[repr(C)]
/// struct Pair {
///     left: Ref,
///     right: Ref,
/// }
///
/// let instance = Instance::new(GcConfig::default()).unwrap();
/// let tc = instance.main_thread();
/// let desc = tc.allocate_descriptor(Arc::new(StructRepr::<Pair>::new("Pair")), "Pair");
/// let obj = tc.allocate_object(desc, StructRepr::<Pair>::body_size());
/// unsafe { StructRepr::<Pair>::init_body(obj, Pair::default()) };
/// ```
pub struct StructRepr<T> {
    name: &'static str,
    _body: PhantomData<fn() -> T>,
}

impl<T: Trace + 'static> StructRepr<T> {
    /// Creates the representation.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _body: PhantomData,
        }
    }

    /// Body size to request from the allocator.
    #[must_use]
    pub const fn body_size() -> usize {
        mem::size_of::<T>()
    }

    /// Moves `value` into the body of `object`.
    ///
    /// # Safety
    ///
    /// `object` must be a live object allocated with [`Self::body_size`]
    /// whose body has not been initialized.
    pub unsafe fn init_body(object: Ref, value: T) {
        // SAFETY: caller guarantees the body is uninitialized storage.
        unsafe { Object::body(object).cast::<T>().write(value) };
    }

    /// Borrows the body of `object`.
    ///
    /// # Safety
    ///
    /// `object` must be a live, initialized instance of this representation
    /// and no other reference to its body may be active.
    #[must_use]
    pub unsafe fn body<'a>(object: Ref) -> &'a mut T {
        // SAFETY: caller guarantees validity and exclusivity.
        unsafe { &mut *Object::body(object).cast::<T>() }
    }
}

impl<T> fmt::Debug for StructRepr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructRepr").field("name", &self.name).finish()
    }
}

// SAFETY: the body is traced through T's Trace impl.
unsafe impl<T: Trace + 'static> Representation for StructRepr<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn trace(&self, object: Ref, worklist: &mut Worklist) {
        // SAFETY: the collector only traces live instances.
        unsafe { Self::body(object) }.trace(worklist);
    }

    fn free(&self, object: Ref) {
        // SAFETY: a dead object's body is dropped exactly once.
        unsafe { ptr::drop_in_place(Object::body(object).cast::<T>()) };
    }

    fn cleanup_embedded(&self, body: *mut u8) {
        // SAFETY: caller hands over an initialized embedded body.
        unsafe { ptr::drop_in_place(body.cast::<T>()) };
    }
}
