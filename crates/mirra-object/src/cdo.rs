//! Class default objects
//!
//! Every class has one canonical default instance, built lazily on first
//! request and memoized for the life of the factory. Defaults are built
//! base-first: a class's default object starts from its super's default
//! values, then applies its own construction. Construction of a class can
//! re-enter the factory for the same class (a native constructor reading
//! its own defaults); the in-flight instance is handed out rather than
//! recursing into a second build.
//!
//! Slots are stable heap allocations, so references handed out remain valid
//! across later insertions. Proper destruction needs the registry and is
//! therefore explicit ([`ClassDefaultObjectFactory::teardown`]); `Drop`
//! only releases the raw memory.

use crate::property::ops;
use crate::registry::{StructId, TypeRegistry};
use crate::{LinkError, LinkResult};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::alloc::{alloc_zeroed, dealloc, Layout};

struct Slot {
    ptr: *mut u8,
    layout: Layout,
    complete: bool,
}

/// Memoized store of class default objects.
#[derive(Default)]
pub struct ClassDefaultObjectFactory {
    slots: Mutex<FxHashMap<StructId, Slot>>,
}

// Slot pointers are owned by the factory and only the map needs guarding;
// instance bytes are written once, under the building thread, before
// `complete` is published.
unsafe impl Send for ClassDefaultObjectFactory {}
unsafe impl Sync for ClassDefaultObjectFactory {}

impl ClassDefaultObjectFactory {
    /// Create an empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the default object for a linked struct/class, building it (and
    /// its supers' defaults, base-first) on first request.
    ///
    /// Returns the raw default instance bytes. During a re-entrant call the
    /// partially constructed in-flight instance is returned.
    pub fn default_object(&self, registry: &TypeRegistry, id: StructId) -> LinkResult<&[u8]> {
        let st = registry.get(id);
        if !st.linked {
            return Err(LinkError::Unlinked(st.name.clone()));
        }
        let size = st.properties_size;

        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get(&id) {
                // Complete or in-flight; either way the memory is stable.
                // Safety: slot allocations live as long as the factory and
                // are never reallocated.
                return Ok(unsafe { std::slice::from_raw_parts(slot.ptr, size) });
            }
            let layout = layout_for(st.properties_size, st.min_alignment);
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null(), "out of memory");
            slots.insert(
                id,
                Slot {
                    ptr,
                    layout,
                    complete: false,
                },
            );
        }

        // Build outside the lock: super defaults first, then construction.
        // A native constructor re-entering for this class hits the
        // in-flight slot above instead of building twice.
        let super_default = match st.super_id {
            Some(super_id) => Some(self.default_object(registry, super_id)?),
            None => None,
        };

        let ptr = {
            let slots = self.slots.lock();
            slots[&id].ptr
        };
        unsafe {
            ops::initialize_struct(registry, id, ptr);
            if let (Some(super_id), Some(defaults)) = (st.super_id, super_default) {
                // Inherited properties start from the super's defaults.
                for &pref in &registry.get(super_id).property_link {
                    let prop = registry.property(pref);
                    for i in 0..prop.array_dim {
                        let off = prop.element_offset(i);
                        ops::copy_value(
                            registry,
                            &prop.kind,
                            ptr.add(off),
                            defaults.as_ptr().add(off),
                        );
                    }
                }
            }
        }

        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&id) {
            slot.complete = true;
        }
        log::trace!("built default object for `{}`", st.name);
        Ok(unsafe { std::slice::from_raw_parts(ptr, size) })
    }

    /// Whether a default object has been fully built for `id`
    pub fn contains(&self, id: StructId) -> bool {
        self.slots.lock().get(&id).is_some_and(|s| s.complete)
    }

    /// Number of stored default objects (including in-flight ones)
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Destroy all default objects and release their memory.
    ///
    /// Destruction runs the structs' destructor chains, so the registry the
    /// defaults were built against is required.
    pub fn teardown(&mut self, registry: &TypeRegistry) {
        let mut slots = self.slots.lock();
        for (id, slot) in slots.drain() {
            unsafe {
                if slot.complete {
                    ops::destroy_struct(registry, id, slot.ptr);
                }
                dealloc(slot.ptr, slot.layout);
            }
        }
    }
}

impl Drop for ClassDefaultObjectFactory {
    fn drop(&mut self) {
        // Without a registry the destructor chains cannot run; leaked
        // in-place strings are reported by teardown-less shutdown paths in
        // leak checkers, so long-lived processes call teardown.
        let mut slots = self.slots.lock();
        for (_, slot) in slots.drain() {
            unsafe { dealloc(slot.ptr, slot.layout) }
        }
    }
}

fn layout_for(size: usize, alignment: usize) -> Layout {
    // Zero-sized structs still get a distinct allocation.
    match Layout::from_size_align(size.max(1), alignment.max(1)) {
        Ok(layout) => layout,
        Err(_) => Layout::new::<u8>(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::kind::PropertyKind;
    use crate::property::Property;
    use crate::registry::natives::{NativeOps, NativeOpsRegistry};
    use crate::registry::StructBuilder;
    use crate::PropertyLinker;

    fn link(registry: &mut TypeRegistry, natives: &mut NativeOpsRegistry, id: StructId) {
        PropertyLinker::new().link(registry, natives, id).unwrap();
    }

    #[test]
    fn test_default_object_is_memoized() {
        let mut registry = TypeRegistry::new();
        let id = registry
            .register(StructBuilder::class("Actor").prop(Property::new("Health", PropertyKind::Int32)))
            .unwrap();
        let mut natives = NativeOpsRegistry::new();
        link(&mut registry, &mut natives, id);

        let mut factory = ClassDefaultObjectFactory::new();
        let first = factory.default_object(&registry, id).unwrap().as_ptr();
        let second = factory.default_object(&registry, id).unwrap().as_ptr();
        assert_eq!(first, second);
        assert!(factory.contains(id));
        assert_eq!(factory.len(), 1);
        factory.teardown(&registry);
        assert!(factory.is_empty());
    }

    #[test]
    fn test_supers_built_first_and_inherited() {
        fn set_base_health(ptr: *mut u8) {
            // Base's Health is its first (offset 0) property.
            unsafe { *(ptr as *mut i32) = 100 }
        }

        let mut registry = TypeRegistry::new();
        let base = registry
            .register(
                StructBuilder::class("Base")
                    .native("base_ops")
                    .prop(Property::new("Health", PropertyKind::Int32)),
            )
            .unwrap();
        let derived = registry
            .register(
                StructBuilder::class("Derived")
                    .with_super(base)
                    .prop(Property::new("Speed", PropertyKind::Float)),
            )
            .unwrap();
        let mut natives = NativeOpsRegistry::new();
        natives.register(
            "base_ops",
            NativeOps {
                construct: Some(set_base_health),
                destruct: None,
                destroys_self_and_supers: false,
            },
        );
        link(&mut registry, &mut natives, derived);

        let mut factory = ClassDefaultObjectFactory::new();
        let bytes = factory.default_object(&registry, derived).unwrap();

        // Base was built as a dependency, and its constructed default
        // flowed into the derived default's inherited region.
        assert!(factory.contains(base));
        let health = registry.find_property(derived, "Health").unwrap();
        let off = registry.property(health).offset;
        let value = i32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        assert_eq!(value, 100);

        factory.teardown(&registry);
    }

    #[test]
    fn test_unlinked_class_rejected() {
        let mut registry = TypeRegistry::new();
        let id = registry.register(StructBuilder::class("Late")).unwrap();
        let factory = ClassDefaultObjectFactory::new();
        assert!(matches!(
            factory.default_object(&registry, id),
            Err(LinkError::Unlinked(_))
        ));
    }
}
