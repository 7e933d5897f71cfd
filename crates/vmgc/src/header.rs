//! The collectable header embedded at the start of every managed allocation.
//!
//! Objects, type objects and type descriptors all begin with a
//! [`Collectable`]. The header records how large the allocation is, which
//! thread owns it, which generation it lives in, and its per-run
//! [`Forward`] state.
//!
//! References between managed allocations are [`Ref`]s. The collector works
//! on the *slots* holding those references (`*mut Ref`) so that it can
//! rewrite them once the referent has moved.

use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU16, Ordering};

use crate::fatal::{fatal, GcFatal};
use crate::thread::ThreadContext;

/// Allocation granularity for every managed allocation.
pub const ALIGN: usize = 8;

/// Rounds `size` up to [`ALIGN`].
#[inline]
#[must_use]
pub const fn align_size(size: usize) -> usize {
    (size + ALIGN - 1) & !(ALIGN - 1)
}

// ============================================================================
// Flags
// ============================================================================

/// Header flag bits.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Flags(u16);

impl Flags {
    /// The allocation is a type object (header and descriptor, no body).
    pub const IS_TYPE_OBJECT: Self = Self(1 << 0);
    /// The allocation is a type descriptor.
    pub const IS_TYPE_DESCRIPTOR: Self = Self(1 << 1);
    /// Survived one nursery pass; promoted on the next.
    pub const NURSERY_SEEN: Self = Self(1 << 2);
    /// Lives in the generation-2 store.
    pub const SECOND_GEN: Self = Self(1 << 3);
    /// Present in its owner's inter-generational root list.
    pub const IN_GEN2_ROOT_LIST: Self = Self(1 << 4);
    /// A gen2 type descriptor found dead once; freed the next time.
    pub const DIED_LAST_RUN: Self = Self(1 << 5);

    /// No bits set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Bitwise union.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Bits of `self` not in `other`.
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl std::ops::BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 6] = [
            (Flags::IS_TYPE_OBJECT, "IS_TYPE_OBJECT"),
            (Flags::IS_TYPE_DESCRIPTOR, "IS_TYPE_DESCRIPTOR"),
            (Flags::NURSERY_SEEN, "NURSERY_SEEN"),
            (Flags::SECOND_GEN, "SECOND_GEN"),
            (Flags::IN_GEN2_ROOT_LIST, "IN_GEN2_ROOT_LIST"),
            (Flags::DIED_LAST_RUN, "DIED_LAST_RUN"),
        ];
        let mut list = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                list.entry(&format_args!("{name}"));
            }
        }
        list.finish()
    }
}

/// What an allocation is, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// An instance with a representation body.
    Object,
    /// A type object: descriptor slot, no body.
    TypeObject,
    /// A type descriptor.
    Descriptor,
}

// ============================================================================
// Forward
// ============================================================================

/// Per-run state of an allocation.
///
/// `Forwarded` doubles as the "visited in this run" mark: moved objects
/// point at their new address, objects marked in place point at themselves.
/// Dead gen2 slots chain their free list through `FreeListNext`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(usize)]
pub enum Forward {
    /// Not visited in the current run. All-zero memory decodes to this.
    #[default]
    Unvisited = 0,
    /// Visited; the live copy is at the given address.
    Forwarded(NonNull<Collectable>) = 1,
    /// A free gen2 slot; the next free slot of the same size class.
    FreeListNext(Option<NonNull<Collectable>>) = 2,
}

impl Forward {
    /// Whether the allocation has been visited in the current run.
    #[must_use]
    pub const fn is_forwarded(self) -> bool {
        matches!(self, Self::Forwarded(_))
    }
}

// ============================================================================
// Collectable
// ============================================================================

/// Header shared by every managed allocation.
#[repr(C)]
pub struct Collectable {
    forward: Forward,
    owner: *const ThreadContext,
    /// Serialization context of the allocation, traced like any other slot.
    pub sc: Ref,
    size: u32,
    flags: AtomicU16,
}

impl Collectable {
    /// Writes a fresh header at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of `size_of::<Collectable>()` bytes and
    /// suitably aligned.
    pub(crate) unsafe fn init(
        ptr: NonNull<Self>,
        size: usize,
        flags: Flags,
        owner: *const ThreadContext,
    ) {
        let size = u32::try_from(size).unwrap_or_else(|_| fatal(GcFatal::AllocationFailure));
        // SAFETY: caller guarantees ptr is writable.
        unsafe {
            ptr::write(
                ptr.as_ptr(),
                Self {
                    forward: Forward::Unvisited,
                    owner,
                    sc: Ref::NULL,
                    size,
                    flags: AtomicU16::new(flags.bits()),
                },
            );
        }
    }

    /// Byte size of the whole allocation, header included.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size as usize
    }

    /// Current flags.
    #[must_use]
    pub fn flags(&self) -> Flags {
        Flags(self.flags.load(Ordering::Acquire))
    }

    /// Sets the bits of `flags`.
    pub fn insert_flags(&self, flags: Flags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clears the bits of `flags`.
    pub fn remove_flags(&self, flags: Flags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Per-run forwarding state.
    #[must_use]
    pub const fn forward(&self) -> Forward {
        self.forward
    }

    /// Owning thread context.
    #[must_use]
    pub const fn owner(&self) -> *const ThreadContext {
        self.owner
    }

    /// Whether the allocation lives in the generation-2 store.
    #[must_use]
    pub fn is_gen2(&self) -> bool {
        self.flags().contains(Flags::SECOND_GEN)
    }

    /// Kind of allocation. Both kind bits at once is fatal.
    #[must_use]
    pub fn kind(&self) -> Kind {
        let flags = self.flags();
        match (
            flags.contains(Flags::IS_TYPE_OBJECT),
            flags.contains(Flags::IS_TYPE_DESCRIPTOR),
        ) {
            (false, false) => Kind::Object,
            (true, false) => Kind::TypeObject,
            (false, true) => Kind::Descriptor,
            (true, true) => fatal(GcFatal::InvalidFlags),
        }
    }
}

impl fmt::Debug for Collectable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collectable")
            .field("size", &self.size)
            .field("flags", &self.flags())
            .field("forward", &self.forward)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Ref
// ============================================================================

/// A reference to a managed allocation, possibly null.
///
/// `Ref` is a plain pointer: it does not keep its referent alive. A `Ref`
/// stored anywhere other than a traced slot or a registered root is stale
/// after the next collection.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ref(*mut Collectable);

// SAFETY: a Ref is an address; ownership rules are enforced by the run
// protocol, not by the type.
unsafe impl Send for Ref {}
// SAFETY: see above.
unsafe impl Sync for Ref {}

impl Ref {
    /// The null reference.
    pub const NULL: Self = Self(ptr::null_mut());

    /// Wraps a raw header pointer.
    #[must_use]
    pub const fn from_raw(ptr: *mut Collectable) -> Self {
        Self(ptr)
    }

    pub(crate) const fn from_non_null(ptr: NonNull<Collectable>) -> Self {
        Self(ptr.as_ptr())
    }

    /// Raw header pointer.
    #[must_use]
    pub const fn as_ptr(self) -> *mut Collectable {
        self.0
    }

    /// Whether this is the null reference.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Address as an integer, for range checks and sorting.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0 as usize
    }

    /// Borrows the header.
    ///
    /// # Safety
    ///
    /// The reference must be non-null and point at a live allocation.
    #[must_use]
    pub const unsafe fn header<'a>(self) -> &'a Collectable {
        // SAFETY: caller guarantees validity.
        unsafe { &*self.0 }
    }

    /// Mutably borrows the header.
    ///
    /// # Safety
    ///
    /// As [`Ref::header`], and the caller must be the only party touching
    /// the header.
    #[must_use]
    pub unsafe fn header_mut<'a>(self) -> &'a mut Collectable {
        // SAFETY: caller guarantees validity and exclusivity.
        unsafe { &mut *self.0 }
    }

    // Field accessors below go through raw field pointers so that threads
    // reading a foreign header never hold a reference overlapping the
    // owner's writes to `forward`.

    /// Flags of the referent.
    ///
    /// # Safety
    ///
    /// The reference must be non-null and point at a live allocation.
    pub(crate) unsafe fn flags(self) -> Flags {
        // SAFETY: caller guarantees validity; flags is atomic.
        unsafe { Flags((*ptr::addr_of!((*self.0).flags)).load(Ordering::Acquire)) }
    }

    /// Owner of the referent.
    ///
    /// # Safety
    ///
    /// As [`Ref::flags`].
    pub(crate) unsafe fn owner(self) -> *const ThreadContext {
        // SAFETY: owner only changes while no run is tracing.
        unsafe { ptr::addr_of!((*self.0).owner).read() }
    }

    /// Forwarding state of the referent. Only the referent's collecting
    /// thread may call this during a run.
    ///
    /// # Safety
    ///
    /// As [`Ref::flags`].
    pub(crate) unsafe fn forward(self) -> Forward {
        // SAFETY: caller guarantees validity and ownership.
        unsafe { ptr::addr_of!((*self.0).forward).read() }
    }

    /// Overwrites the forwarding state.
    ///
    /// # Safety
    ///
    /// As [`Ref::forward`].
    pub(crate) unsafe fn set_forward(self, forward: Forward) {
        // SAFETY: caller guarantees validity and ownership.
        unsafe { ptr::addr_of_mut!((*self.0).forward).write(forward) };
    }

    /// Overwrites the owner.
    ///
    /// # Safety
    ///
    /// No run may be tracing the referent.
    pub(crate) unsafe fn set_owner(self, owner: *const ThreadContext) {
        // SAFETY: caller guarantees validity and exclusivity.
        unsafe { ptr::addr_of_mut!((*self.0).owner).write(owner) };
    }

    /// Byte size of the referent.
    ///
    /// # Safety
    ///
    /// As [`Ref::flags`].
    pub(crate) unsafe fn size(self) -> usize {
        // SAFETY: size is immutable after allocation.
        unsafe { ptr::addr_of!((*self.0).size).read() as usize }
    }

    /// Address of the referent's serialization-context slot.
    ///
    /// # Safety
    ///
    /// As [`Ref::flags`].
    pub(crate) unsafe fn sc_slot(self) -> *mut Ref {
        // SAFETY: caller guarantees validity.
        unsafe { ptr::addr_of_mut!((*self.0).sc) }
    }
}

impl Default for Ref {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({:p})", self.0)
    }
}

// ============================================================================
// Object
// ============================================================================

/// Layout prefix of every object and type object.
///
/// The representation body, if any, follows immediately after.
#[repr(C)]
pub struct Object {
    /// Common header.
    pub header: Collectable,
    /// The object's type descriptor.
    pub descriptor: Ref,
}

/// Offset of the representation body inside an object.
pub const OBJECT_BODY_OFFSET: usize = mem::size_of::<Object>();

impl Object {
    /// Address of the representation body of `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must be a live object allocation (not a descriptor).
    #[must_use]
    pub unsafe fn body(obj: Ref) -> *mut u8 {
        // SAFETY: objects are at least OBJECT_BODY_OFFSET bytes.
        unsafe { obj.as_ptr().cast::<u8>().add(OBJECT_BODY_OFFSET) }
    }

    /// Borrows the object prefix.
    ///
    /// # Safety
    ///
    /// `obj` must be a live object or type object.
    #[must_use]
    pub unsafe fn from_ref<'a>(obj: Ref) -> &'a mut Self {
        // SAFETY: caller guarantees validity.
        unsafe { &mut *obj.as_ptr().cast::<Self>() }
    }

    /// Reads the descriptor slot of `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must be a live object or type object.
    #[must_use]
    pub unsafe fn descriptor_of(obj: Ref) -> Ref {
        // SAFETY: caller guarantees validity.
        unsafe { (*obj.as_ptr().cast::<Self>()).descriptor }
    }
}
