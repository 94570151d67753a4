//! Value operations over raw instance memory
//!
//! Every operation here works on pointers into an instance buffer whose
//! layout was computed by the linker. Callers guarantee the pointer targets
//! a correctly aligned slot of the given kind; operations on `Struct` kinds
//! require the referenced struct to be linked.

use crate::align_up;
use crate::property::kind::PropertyKind;
use crate::property::PropertyFlags;
use crate::registry::{StructFlags, StructId, TypeRegistry};
use std::alloc::{alloc_zeroed, dealloc, Layout};

/// In-place storage for a dynamic array property.
///
/// Elements are packed at the element stride. The all-zero bit pattern is
/// the valid empty storage, which keeps `Seq` properties zero-constructible.
#[repr(C)]
pub(crate) struct SeqStorage {
    ptr: *mut u8,
    len: usize,
    cap_bytes: usize,
}

impl SeqStorage {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn elem_ptr(&self, stride: usize, index: usize) -> *mut u8 {
        debug_assert!(index < self.len);
        unsafe { self.ptr.add(stride * index) }
    }
}

/// Stride between consecutive elements of `elem` in a `Seq`.
pub(crate) fn elem_stride(registry: &TypeRegistry, elem: &PropertyKind) -> usize {
    align_up(elem.size(registry), elem.alignment(registry))
}

/// Destroy all elements and release the storage, leaving it empty.
///
/// # Safety
///
/// `storage` must point at a valid (possibly empty) `SeqStorage` whose
/// elements are constructed values of `elem`.
pub(crate) unsafe fn seq_clear(registry: &TypeRegistry, elem: &PropertyKind, storage: *mut SeqStorage) {
    let s = &mut *storage;
    if s.ptr.is_null() {
        s.len = 0;
        s.cap_bytes = 0;
        return;
    }
    let stride = elem_stride(registry, elem);
    if elem.needs_destructor(registry) {
        for i in 0..s.len {
            destroy_value(registry, elem, s.ptr.add(stride * i));
        }
    }
    let layout = Layout::from_size_align_unchecked(s.cap_bytes, elem.alignment(registry).max(1));
    dealloc(s.ptr, layout);
    s.ptr = std::ptr::null_mut();
    s.len = 0;
    s.cap_bytes = 0;
}

/// Replace the storage with `len` freshly constructed elements.
///
/// The new elements are zeroed and then explicitly initialized where the
/// element kind requires it.
///
/// # Safety
///
/// Same contract as [`seq_clear`].
pub(crate) unsafe fn seq_reset(
    registry: &TypeRegistry,
    elem: &PropertyKind,
    storage: *mut SeqStorage,
    len: usize,
) {
    seq_clear(registry, elem, storage);
    if len == 0 {
        return;
    }
    let stride = elem_stride(registry, elem);
    let cap_bytes = stride * len;
    let Ok(layout) = Layout::from_size_align(cap_bytes, elem.alignment(registry).max(1)) else {
        panic!("sequence capacity overflow: {cap_bytes} bytes");
    };
    let ptr = alloc_zeroed(layout);
    if ptr.is_null() {
        std::alloc::handle_alloc_error(layout);
    }

    let s = &mut *storage;
    s.ptr = ptr;
    s.len = len;
    s.cap_bytes = cap_bytes;

    if !elem.is_zero_constructible(registry) {
        for i in 0..len {
            initialize_value(registry, elem, ptr.add(stride * i));
        }
    }
}

/// Construct a value in place on top of zeroed memory.
///
/// Zero-constructible kinds are left untouched; the zero fill already is the
/// constructed value.
///
/// # Safety
///
/// `ptr` must be aligned for `kind` and point at zeroed memory of at least
/// `kind.size(registry)` bytes.
pub(crate) unsafe fn initialize_value(registry: &TypeRegistry, kind: &PropertyKind, ptr: *mut u8) {
    match kind {
        PropertyKind::Str | PropertyKind::Name => {
            (ptr as *mut String).write(String::new());
        }
        PropertyKind::Struct(id) => {
            initialize_struct(registry, *id, ptr);
        }
        // Scalars, reference slots, and empty Seq storage are valid as
        // zeroes.
        _ => {}
    }
}

/// Destroy a constructed value in place.
///
/// # Safety
///
/// `ptr` must point at a constructed value of `kind`.
pub(crate) unsafe fn destroy_value(registry: &TypeRegistry, kind: &PropertyKind, ptr: *mut u8) {
    match kind {
        PropertyKind::Str | PropertyKind::Name => {
            std::ptr::drop_in_place(ptr as *mut String);
        }
        PropertyKind::Seq(elem) => {
            seq_clear(registry, elem, ptr as *mut SeqStorage);
        }
        PropertyKind::Struct(id) => {
            destroy_struct(registry, *id, ptr);
        }
        _ => {}
    }
}

/// Deep-copy a constructed value over another constructed value.
///
/// # Safety
///
/// Both pointers must target constructed values of `kind`; they must not
/// overlap.
pub(crate) unsafe fn copy_value(
    registry: &TypeRegistry,
    kind: &PropertyKind,
    dst: *mut u8,
    src: *const u8,
) {
    match kind {
        PropertyKind::Str | PropertyKind::Name => {
            let d = &mut *(dst as *mut String);
            let s = &*(src as *const String);
            d.clear();
            d.push_str(s);
        }
        PropertyKind::Seq(elem) => {
            let s = &*(src as *const SeqStorage);
            let len = s.len();
            seq_reset(registry, elem, dst as *mut SeqStorage, len);
            let d = &*(dst as *const SeqStorage);
            let stride = elem_stride(registry, elem);
            for i in 0..len {
                copy_value(registry, elem, d.elem_ptr(stride, i), s.elem_ptr(stride, i));
            }
        }
        PropertyKind::Struct(id) => {
            copy_struct(registry, *id, dst, src);
        }
        _ => {
            std::ptr::copy_nonoverlapping(src, dst, kind.size(registry));
        }
    }
}

/// Compare two constructed values for exact equality.
///
/// Floats compare by bit pattern; this is the diffing predicate for
/// serialization, not numeric equality.
///
/// # Safety
///
/// Both pointers must target constructed values of `kind`.
pub(crate) unsafe fn values_identical(
    registry: &TypeRegistry,
    kind: &PropertyKind,
    a: *const u8,
    b: *const u8,
) -> bool {
    match kind {
        PropertyKind::Str | PropertyKind::Name => {
            *(a as *const String) == *(b as *const String)
        }
        PropertyKind::Seq(elem) => {
            let sa = &*(a as *const SeqStorage);
            let sb = &*(b as *const SeqStorage);
            if sa.len() != sb.len() {
                return false;
            }
            let stride = elem_stride(registry, elem);
            for i in 0..sa.len() {
                if !values_identical(
                    registry,
                    elem,
                    sa.elem_ptr(stride, i),
                    sb.elem_ptr(stride, i),
                ) {
                    return false;
                }
            }
            true
        }
        PropertyKind::Struct(id) => structs_identical(registry, *id, a, b),
        _ => {
            let size = kind.size(registry);
            std::slice::from_raw_parts(a, size) == std::slice::from_raw_parts(b, size)
        }
    }
}

/// Run per-property construction over a zeroed struct-sized region.
///
/// # Safety
///
/// `ptr` must be aligned for the struct and point at zeroed memory of
/// `properties_size` bytes. The struct must be linked.
pub(crate) unsafe fn initialize_struct(registry: &TypeRegistry, id: StructId, ptr: *mut u8) {
    let st = registry.get(id);
    // Native constructors run base-first, mirroring reverse destruction.
    let chain: Vec<StructId> = registry.super_chain(id).collect();
    for owner in chain.into_iter().rev() {
        if let Some(ops) = &registry.get(owner).native_ops {
            if let Some(construct) = ops.construct {
                construct(ptr);
            }
        }
    }
    for &pref in &st.property_link {
        let prop = registry.property(pref);
        if prop.flags.contains(PropertyFlags::ZERO_CONSTRUCT) {
            continue;
        }
        for i in 0..prop.array_dim {
            initialize_value(registry, &prop.kind, ptr.add(prop.element_offset(i)));
        }
    }
}

/// Destroy a constructed struct-sized region in place.
///
/// Walks the destructor chain in reverse (own properties before inherited)
/// and hands the natively-destructed remainder to the native destructor in
/// one call, so no resource is freed at two layers.
///
/// # Safety
///
/// `ptr` must target a constructed instance of the (linked) struct.
pub(crate) unsafe fn destroy_struct(registry: &TypeRegistry, id: StructId, ptr: *mut u8) {
    let st = registry.get(id);
    for &pref in st.dtor_link.iter().rev() {
        let prop = registry.property(pref);
        for i in (0..prop.array_dim).rev() {
            destroy_value(registry, &prop.kind, ptr.add(prop.element_offset(i)));
        }
    }
    // Native destructors run nearest-first. A covering destructor owns its
    // struct and everything inherited below it (those properties were
    // excluded from dtor_link at link time), so the walk stops there.
    for owner in registry.super_chain(id) {
        if let Some(ops) = &registry.get(owner).native_ops {
            if let Some(destruct) = ops.destruct {
                destruct(ptr);
                if ops.destroys_self_and_supers {
                    break;
                }
            }
        }
    }
}

/// Deep-copy one constructed struct instance over another.
///
/// # Safety
///
/// Both pointers must target constructed instances of the (linked) struct;
/// they must not overlap.
pub(crate) unsafe fn copy_struct(registry: &TypeRegistry, id: StructId, dst: *mut u8, src: *const u8) {
    let st = registry.get(id);
    if st.flags.contains(StructFlags::POD) {
        std::ptr::copy_nonoverlapping(src, dst, st.properties_size);
        return;
    }
    for &pref in &st.property_link {
        let prop = registry.property(pref);
        for i in 0..prop.array_dim {
            let off = prop.element_offset(i);
            copy_value(registry, &prop.kind, dst.add(off), src.add(off));
        }
    }
}

/// Compare two constructed struct instances property by property.
///
/// # Safety
///
/// Both pointers must target constructed instances of the (linked) struct.
pub(crate) unsafe fn structs_identical(
    registry: &TypeRegistry,
    id: StructId,
    a: *const u8,
    b: *const u8,
) -> bool {
    let st = registry.get(id);
    for &pref in &st.property_link {
        let prop = registry.property(pref);
        for i in 0..prop.array_dim {
            let off = prop.element_offset(i);
            if !values_identical(registry, &prop.kind, a.add(off), b.add(off)) {
                return false;
            }
        }
    }
    true
}
