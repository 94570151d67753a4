//! Reference-chain traversal
//!
//! A collector does not scan instance memory blindly; it walks the linked
//! ref chain, which names exactly the properties that can hold object
//! handles. Traversal recurses through nested structs and dynamic arrays
//! and hands every handle slot to the visitor, which may rewrite it (a
//! moving collector updates pointers this way). Null handles are reported,
//! never dereferenced.

use crate::property::kind::PropertyKind;
use crate::property::{ops, ObjectHandle, PropertyRef};
use crate::registry::{StructId, TypeRegistry};

/// Receiver for reference slots found during traversal.
pub trait ReferenceVisitor {
    /// Called once per handle slot, including null slots. `owner` is the
    /// property the slot belongs to (for arrays and sequences, once per
    /// element). The visitor may rewrite the handle in place.
    fn visit(&mut self, handle: &mut ObjectHandle, owner: PropertyRef);
}

impl<F> ReferenceVisitor for F
where
    F: FnMut(&mut ObjectHandle, PropertyRef),
{
    fn visit(&mut self, handle: &mut ObjectHandle, owner: PropertyRef) {
        self(handle, owner)
    }
}

/// Walk every reference slot of a constructed instance.
///
/// Only properties on the struct's ref chain are touched; everything else
/// is skipped without being read.
///
/// # Safety
///
/// `ptr` must target a constructed instance of the (linked) struct.
pub unsafe fn visit_references<V: ReferenceVisitor>(
    registry: &TypeRegistry,
    id: StructId,
    ptr: *mut u8,
    visitor: &mut V,
) {
    for &pref in &registry.get(id).ref_link {
        let prop = registry.property(pref);
        for i in 0..prop.array_dim {
            visit_kind(registry, &prop.kind, ptr.add(prop.element_offset(i)), pref, visitor);
        }
    }
}

unsafe fn visit_kind<V: ReferenceVisitor>(
    registry: &TypeRegistry,
    kind: &PropertyKind,
    ptr: *mut u8,
    owner: PropertyRef,
    visitor: &mut V,
) {
    match kind {
        PropertyKind::Object | PropertyKind::WeakObject => {
            visitor.visit(&mut *(ptr as *mut ObjectHandle), owner);
        }
        PropertyKind::Struct(nested) => {
            visit_references(registry, *nested, ptr, visitor);
        }
        PropertyKind::Seq(elem) => {
            let storage = &*(ptr as *const ops::SeqStorage);
            let stride = ops::elem_stride(registry, elem);
            for i in 0..storage.len() {
                visit_kind(registry, elem, storage.elem_ptr(stride, i), owner, visitor);
            }
        }
        // Ref-chain membership guarantees the kinds above; anything else
        // would be a linker defect.
        _ => debug_assert!(false, "non-reference kind on ref chain"),
    }
}
