//! Linking, layout, and default-object behavior through the public API.

use mirra_object::{
    ClassDefaultObjectFactory, Instance, LinkError, LinkOptions, NativeOps, NativeOpsRegistry,
    ObjectHandle, Property, PropertyKind, PropertyLinker, PropertyRef, StructBuilder, StructId,
    TypeRegistry,
};
use std::sync::atomic::{AtomicU32, Ordering};

fn link(registry: &mut TypeRegistry, natives: &mut NativeOpsRegistry, id: StructId) {
    let _ = env_logger::builder().is_test(true).try_init();
    PropertyLinker::new().link(registry, natives, id).unwrap();
}

#[test]
fn test_offsets_monotonic_and_in_bounds_across_hierarchy() {
    let mut registry = TypeRegistry::new();
    let base = registry
        .register(
            StructBuilder::class("Base")
                .prop(Property::new("Flag", PropertyKind::Bool))
                .prop(Property::new("Health", PropertyKind::Int32)),
        )
        .unwrap();
    let mid = registry
        .register(
            StructBuilder::class("Mid")
                .with_super(base)
                .prop(Property::new("Position", PropertyKind::Double).array(3)),
        )
        .unwrap();
    let leaf = registry
        .register(
            StructBuilder::class("Leaf")
                .with_super(mid)
                .prop(Property::new("Label", PropertyKind::Str))
                .prop(Property::new("Owner", PropertyKind::Object)),
        )
        .unwrap();
    let mut natives = NativeOpsRegistry::new();
    link(&mut registry, &mut natives, leaf);

    // Sizes grow down the hierarchy.
    let sizes: Vec<usize> = [base, mid, leaf]
        .iter()
        .map(|&id| registry.get(id).properties_size)
        .collect();
    assert!(sizes[0] <= sizes[1] && sizes[1] <= sizes[2]);

    // Offsets along the full chain are strictly increasing and in bounds.
    let st = registry.get(leaf);
    let mut last_end = 0usize;
    for &pref in &st.property_link {
        let prop = registry.property(pref);
        assert!(prop.offset >= last_end, "property `{}` overlaps", prop.name);
        assert_eq!(prop.offset % prop.alignment, 0);
        last_end = prop.offset + prop.total_size();
        assert!(last_end <= st.properties_size);
    }
}

#[test]
fn test_relinking_unchanged_hierarchy_is_idempotent() {
    let mut registry = TypeRegistry::new();
    let base = registry
        .register(StructBuilder::new("Base").prop(Property::new("A", PropertyKind::Int64)))
        .unwrap();
    let derived = registry
        .register(
            StructBuilder::new("Derived")
                .with_super(base)
                .prop(Property::new("B", PropertyKind::Str))
                .prop(Property::new("C", PropertyKind::Int16)),
        )
        .unwrap();
    let mut natives = NativeOpsRegistry::new();
    let mut linker = PropertyLinker::new();
    linker.link(&mut registry, &mut natives, derived).unwrap();

    let snapshot = |registry: &TypeRegistry, id: StructId| -> (usize, usize, Vec<usize>) {
        let st = registry.get(id);
        (
            st.properties_size,
            st.min_alignment,
            st.property_link
                .iter()
                .map(|&r| registry.property(r).offset)
                .collect(),
        )
    };
    let before = snapshot(&registry, derived);
    linker.link(&mut registry, &mut natives, derived).unwrap();
    assert_eq!(before, snapshot(&registry, derived));
}

#[test]
fn test_ref_link_is_complete_including_inherited() {
    let mut registry = TypeRegistry::new();
    let inner = registry
        .register(StructBuilder::new("Inner").prop(Property::new("Link", PropertyKind::Object)))
        .unwrap();
    let base = registry
        .register(
            StructBuilder::class("Base")
                .prop(Property::new("Owner", PropertyKind::Object))
                .prop(Property::new("Health", PropertyKind::Int32)),
        )
        .unwrap();
    let derived = registry
        .register(
            StructBuilder::class("Derived")
                .with_super(base)
                .prop(Property::new("Name", PropertyKind::Str))
                .prop(Property::new("Nested", PropertyKind::Struct(inner)))
                .prop(
                    Property::new("Friends", PropertyKind::Seq(Box::new(PropertyKind::Object))),
                ),
        )
        .unwrap();
    let mut natives = NativeOpsRegistry::new();
    link(&mut registry, &mut natives, derived);

    let names: Vec<&str> = registry
        .get(derived)
        .ref_link
        .iter()
        .map(|&r| registry.property(r).name.as_str())
        .collect();
    // Inherited reference first, then everything reference-bearing.
    assert_eq!(names, vec!["Owner", "Nested", "Friends"]);

    // Every reference slot is reachable through the visitor, nulls included.
    let mut instance = Instance::new(&registry, derived).unwrap();
    instance.set_handle("Owner", ObjectHandle::new(21)).unwrap();
    let mut seen = Vec::new();
    let mut collect = |h: &mut ObjectHandle, _r: PropertyRef| seen.push(h.raw());
    instance.visit_references(&mut collect);
    assert_eq!(seen, vec![21, 0]); // Friends is empty; Nested has one null slot
}

#[test]
fn test_class_default_object_singleton_and_base_first() {
    static BUILD_SEQ: AtomicU32 = AtomicU32::new(0);
    static BASE_BUILT_AT: AtomicU32 = AtomicU32::new(0);
    static DERIVED_BUILT_AT: AtomicU32 = AtomicU32::new(0);

    fn base_construct(ptr: *mut u8) {
        BASE_BUILT_AT.store(BUILD_SEQ.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
        unsafe { *(ptr as *mut i32) = 50 }
    }
    fn derived_construct(_ptr: *mut u8) {
        DERIVED_BUILT_AT.store(BUILD_SEQ.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
    }

    let mut registry = TypeRegistry::new();
    let base = registry
        .register(
            StructBuilder::class("Base")
                .native("base")
                .prop(Property::new("Health", PropertyKind::Int32)),
        )
        .unwrap();
    let derived = registry
        .register(
            StructBuilder::class("Derived")
                .with_super(base)
                .native("derived")
                .prop(Property::new("Speed", PropertyKind::Float)),
        )
        .unwrap();
    let mut natives = NativeOpsRegistry::new();
    let no_dtor = |construct| NativeOps {
        construct: Some(construct),
        destruct: None,
        destroys_self_and_supers: false,
    };
    natives.register("base", no_dtor(base_construct as fn(*mut u8)));
    natives.register("derived", no_dtor(derived_construct as fn(*mut u8)));
    link(&mut registry, &mut natives, derived);

    let mut factory = ClassDefaultObjectFactory::new();
    let first = factory.default_object(&registry, derived).unwrap().as_ptr();
    let again = factory.default_object(&registry, derived).unwrap().as_ptr();
    assert_eq!(first, again, "default object must be a singleton");

    // Base's own default was built before Derived finished.
    assert!(factory.contains(base));
    assert!(BASE_BUILT_AT.load(Ordering::SeqCst) <= DERIVED_BUILT_AT.load(Ordering::SeqCst));

    // Instances pick up the natively constructed default.
    let actor = Instance::with_defaults(&registry, &factory, derived).unwrap();
    assert_eq!(actor.get_i32("Health").unwrap(), 50);
    drop(actor);
    factory.teardown(&registry);
}

#[test]
fn test_native_destructor_covers_supers() {
    static DESTROYED: AtomicU32 = AtomicU32::new(0);

    fn covering_dtor(_ptr: *mut u8) {
        DESTROYED.fetch_add(1, Ordering::SeqCst);
    }

    let mut registry = TypeRegistry::new();
    let base = registry
        .register(StructBuilder::class("Base").prop(Property::new("Tag", PropertyKind::Str)))
        .unwrap();
    let derived = registry
        .register(
            StructBuilder::class("Derived")
                .with_super(base)
                .native("derived")
                .prop(Property::new("Speed", PropertyKind::Float)),
        )
        .unwrap();
    let mut natives = NativeOpsRegistry::new();
    natives.register(
        "derived",
        NativeOps {
            construct: None,
            destruct: Some(covering_dtor),
            destroys_self_and_supers: true,
        },
    );
    link(&mut registry, &mut natives, derived);

    // Covering destructor empties the reflected destructor chain.
    assert!(registry.get(derived).dtor_link.is_empty());
    assert!(!registry.get(base).dtor_link.is_empty());

    let instance = Instance::new(&registry, derived).unwrap();
    drop(instance);
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
}

#[test]
fn test_recursive_array_of_self_is_rejected() {
    let mut registry = TypeRegistry::new();
    let node = registry.register(StructBuilder::new("Node")).unwrap();
    registry.add_property(
        node,
        Property::new("Kids", PropertyKind::Seq(Box::new(PropertyKind::Struct(node)))),
    );

    let mut natives = NativeOpsRegistry::new();
    let result = PropertyLinker::new().link(&mut registry, &mut natives, node);
    assert!(matches!(result, Err(LinkError::RecursiveStruct(_))));
}

#[test]
fn test_retry_bound_counts_restarts_not_attempts() {
    // A struct that never changes mid-link needs zero restarts, so even the
    // tightest bound links it.
    let mut registry = TypeRegistry::new();
    let id = registry
        .register(StructBuilder::new("Widget").prop(Property::new("A", PropertyKind::Int32)))
        .unwrap();
    let mut natives = NativeOpsRegistry::new();

    let mut strict = PropertyLinker::with_options(LinkOptions { max_link_retries: 0 });
    strict.link(&mut registry, &mut natives, id).unwrap();
    assert!(registry.get(id).linked);
}

#[test]
fn test_link_all_links_every_registered_struct() {
    let mut registry = TypeRegistry::new();
    let a = registry
        .register(StructBuilder::new("A").prop(Property::new("X", PropertyKind::Int32)))
        .unwrap();
    let b = registry
        .register(
            StructBuilder::new("B")
                .prop(Property::new("Inner", PropertyKind::Struct(a)))
                .prop(Property::new("Y", PropertyKind::Str)),
        )
        .unwrap();
    let mut natives = NativeOpsRegistry::new();
    PropertyLinker::new()
        .link_all(&mut registry, &mut natives)
        .unwrap();
    assert!(registry.get(a).linked);
    assert!(registry.get(b).linked);
}
