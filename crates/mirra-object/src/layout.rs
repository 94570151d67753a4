//! Instance lifecycle over raw buffers
//!
//! [`StructLayout`] binds a linked struct's computed layout to the registry
//! and drives construction, destruction, and copying of instance memory.
//! The buffer itself is owned elsewhere (see [`crate::instance`]); callers
//! guarantee size and alignment, which is why the instance operations are
//! `unsafe`.

use crate::property::ops;
use crate::registry::{StructFlags, StructId, TypeRegistry};
use crate::{LinkError, LinkResult};

/// Layout view of one linked struct.
#[derive(Clone, Copy)]
pub struct StructLayout<'r> {
    registry: &'r TypeRegistry,
    id: StructId,
}

impl<'r> StructLayout<'r> {
    /// Bind to a struct's layout. Fails if the struct has not been linked.
    pub fn new(registry: &'r TypeRegistry, id: StructId) -> LinkResult<Self> {
        if !registry.get(id).linked {
            return Err(LinkError::Unlinked(registry.get(id).name.clone()));
        }
        Ok(Self { registry, id })
    }

    /// Struct handle this layout describes
    pub fn struct_id(&self) -> StructId {
        self.id
    }

    /// Struct name
    pub fn name(&self) -> &'r str {
        &self.registry.get(self.id).name
    }

    /// Instance size in bytes
    pub fn size(&self) -> usize {
        self.registry.get(self.id).properties_size
    }

    /// Instance alignment in bytes
    pub fn alignment(&self) -> usize {
        self.registry.get(self.id).min_alignment
    }

    /// Whether instances can be copied with a plain memcpy
    pub fn is_pod(&self) -> bool {
        self.registry.get(self.id).flags.contains(StructFlags::POD)
    }

    /// Whether the zero fill alone fully constructs an instance
    pub fn is_zero_init(&self) -> bool {
        self.registry
            .get(self.id)
            .flags
            .contains(StructFlags::ZERO_INIT)
    }

    /// Construct an instance in place: zero fill, native constructor, then
    /// per-property construction of non-zero-constructible kinds.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned to [`Self::alignment`] and writable for
    /// [`Self::size`] bytes.
    pub unsafe fn initialize_instance(&self, ptr: *mut u8) {
        std::ptr::write_bytes(ptr, 0, self.size());
        ops::initialize_struct(self.registry, self.id, ptr);
    }

    /// Tear an instance down: destructor chain in reverse (own properties
    /// before inherited), then native destructors nearest-first.
    ///
    /// # Safety
    ///
    /// `ptr` must target a constructed instance of this struct.
    pub unsafe fn destroy_instance(&self, ptr: *mut u8) {
        ops::destroy_struct(self.registry, self.id, ptr);
    }

    /// Deep-copy one constructed instance over another. Plain-old-data
    /// layouts take the memcpy path.
    ///
    /// # Safety
    ///
    /// Both pointers must target constructed, non-overlapping instances of
    /// this struct.
    pub unsafe fn copy_instance(&self, dst: *mut u8, src: *const u8) {
        ops::copy_struct(self.registry, self.id, dst, src);
    }

    /// Property-by-property equality of two constructed instances; padding
    /// bytes never participate.
    ///
    /// # Safety
    ///
    /// Both pointers must target constructed instances of this struct.
    pub unsafe fn instances_identical(&self, a: *const u8, b: *const u8) -> bool {
        ops::structs_identical(self.registry, self.id, a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::kind::PropertyKind;
    use crate::property::Property;
    use crate::registry::natives::NativeOpsRegistry;
    use crate::registry::StructBuilder;
    use crate::PropertyLinker;
    use std::alloc::{alloc, dealloc, Layout};

    fn linked_registry() -> (TypeRegistry, StructId) {
        let mut registry = TypeRegistry::new();
        let id = registry
            .register(
                StructBuilder::new("Item")
                    .prop(Property::new("Count", PropertyKind::Int32))
                    .prop(Property::new("Label", PropertyKind::Str))
                    .prop(Property::new("Weights", PropertyKind::Double).array(2)),
            )
            .unwrap();
        let mut natives = NativeOpsRegistry::new();
        PropertyLinker::new()
            .link(&mut registry, &mut natives, id)
            .unwrap();
        (registry, id)
    }

    struct RawBuf {
        ptr: *mut u8,
        layout: Layout,
    }

    impl RawBuf {
        fn for_layout(view: &StructLayout<'_>) -> Self {
            let layout = Layout::from_size_align(view.size(), view.alignment()).unwrap();
            let ptr = unsafe { alloc(layout) };
            assert!(!ptr.is_null());
            Self { ptr, layout }
        }
    }

    impl Drop for RawBuf {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) }
        }
    }

    #[test]
    fn test_unlinked_struct_rejected() {
        let mut registry = TypeRegistry::new();
        let id = registry.register(StructBuilder::new("Bare")).unwrap();
        assert!(matches!(
            StructLayout::new(&registry, id),
            Err(LinkError::Unlinked(_))
        ));
    }

    #[test]
    fn test_initialize_and_destroy() {
        let (registry, id) = linked_registry();
        let view = StructLayout::new(&registry, id).unwrap();
        let buf = RawBuf::for_layout(&view);

        unsafe {
            view.initialize_instance(buf.ptr);
            // The string slot is a constructed empty String, not zeroes.
            let label = registry.find_property(id, "Label").unwrap();
            let s = &mut *(buf.ptr.add(registry.property(label).offset) as *mut String);
            assert!(s.is_empty());
            s.push_str("sword");
            view.destroy_instance(buf.ptr);
        }
    }

    #[test]
    fn test_copy_and_identical() {
        let (registry, id) = linked_registry();
        let view = StructLayout::new(&registry, id).unwrap();
        let a = RawBuf::for_layout(&view);
        let b = RawBuf::for_layout(&view);

        unsafe {
            view.initialize_instance(a.ptr);
            view.initialize_instance(b.ptr);
            assert!(view.instances_identical(a.ptr, b.ptr));

            let count = registry.find_property(id, "Count").unwrap();
            *(a.ptr.add(registry.property(count).offset) as *mut i32) = 7;
            let label = registry.find_property(id, "Label").unwrap();
            (*(a.ptr.add(registry.property(label).offset) as *mut String)).push_str("axe");
            assert!(!view.instances_identical(a.ptr, b.ptr));

            view.copy_instance(b.ptr, a.ptr);
            assert!(view.instances_identical(a.ptr, b.ptr));
            assert_eq!(*(b.ptr.add(registry.property(count).offset) as *const i32), 7);

            view.destroy_instance(a.ptr);
            view.destroy_instance(b.ptr);
        }
    }

    #[test]
    fn test_pod_struct_uses_memcpy_path() {
        let mut registry = TypeRegistry::new();
        let id = registry
            .register(
                StructBuilder::new("Vec2")
                    .prop(Property::new("X", PropertyKind::Float))
                    .prop(Property::new("Y", PropertyKind::Float)),
            )
            .unwrap();
        let mut natives = NativeOpsRegistry::new();
        PropertyLinker::new()
            .link(&mut registry, &mut natives, id)
            .unwrap();

        let view = StructLayout::new(&registry, id).unwrap();
        assert!(view.is_pod());
        assert!(view.is_zero_init());
        assert_eq!(view.size(), 8);
    }
}
