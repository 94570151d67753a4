//! Property linking
//!
//! Linking assigns byte offsets and alignment to a struct's properties and
//! builds the four derived traversal chains. Offsets are seeded from the
//! super struct, so linking is base-first; struct-typed properties force
//! their dependency to link first, which is where self-recursive layouts are
//! caught.
//!
//! Linking a dependency can, in a hot type graph, change the linking
//! struct's own declarations mid-walk (a rename, or a transience flip).
//! Rather than recursing unboundedly, the walk snapshots each property's
//! identity before the dependency pass and restarts from scratch when the
//! snapshot no longer matches, bounded by a retry counter.

use crate::property::kind::PropertyKind;
use crate::property::{PropertyFlags, PropertyRef};
use crate::registry::natives::NativeOpsRegistry;
use crate::registry::{ClassFlags, StructFlags, StructId, TypeRegistry};
use crate::{align_up, LinkError, LinkResult};
use rustc_hash::FxHashSet;

/// Linker tuning knobs.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Upper bound on restarts of the offset walk. This is a last-resort
    /// safety valve, not a protocol constant; exhaustion is a fatal
    /// registration error.
    pub max_link_retries: usize,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            max_link_retries: 64,
        }
    }
}

/// Computes layouts and derived chains for registered structs.
pub struct PropertyLinker {
    options: LinkOptions,
    in_progress: FxHashSet<StructId>,
}

impl Default for PropertyLinker {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyLinker {
    /// Create a linker with default options
    pub fn new() -> Self {
        Self::with_options(LinkOptions::default())
    }

    /// Create a linker with explicit options
    pub fn with_options(options: LinkOptions) -> Self {
        Self {
            options,
            in_progress: FxHashSet::default(),
        }
    }

    /// Link one struct (recomputing even if already linked).
    ///
    /// Super structs and struct-typed property dependencies are linked
    /// first if they are not already. Relinking an unchanged struct yields
    /// identical offsets and chains.
    pub fn link(
        &mut self,
        registry: &mut TypeRegistry,
        natives: &mut NativeOpsRegistry,
        id: StructId,
    ) -> LinkResult<()> {
        if !self.in_progress.insert(id) {
            return Err(LinkError::RecursiveStruct(registry.get(id).name.clone()));
        }
        let result = self.link_guarded(registry, natives, id);
        self.in_progress.remove(&id);
        result
    }

    /// Link every registered struct, in registration order.
    pub fn link_all(
        &mut self,
        registry: &mut TypeRegistry,
        natives: &mut NativeOpsRegistry,
    ) -> LinkResult<()> {
        for index in 0..registry.struct_count() {
            let id = StructId(index as u32);
            if !registry.get(id).linked {
                self.link(registry, natives, id)?;
            }
        }
        Ok(())
    }

    fn ensure_linked(
        &mut self,
        registry: &mut TypeRegistry,
        natives: &mut NativeOpsRegistry,
        id: StructId,
    ) -> LinkResult<()> {
        if self.in_progress.contains(&id) {
            return Err(LinkError::RecursiveStruct(registry.get(id).name.clone()));
        }
        if registry.get(id).linked {
            return Ok(());
        }
        self.link(registry, natives, id)
    }

    fn ensure_kind_deps(
        &mut self,
        registry: &mut TypeRegistry,
        natives: &mut NativeOpsRegistry,
        kind: &PropertyKind,
    ) -> LinkResult<()> {
        match kind {
            PropertyKind::Struct(dep) => self.ensure_linked(registry, natives, *dep),
            // An array of a struct that recurses back into the owner is an
            // unresolved layout, caught here through ensure_linked.
            PropertyKind::Seq(elem) => self.ensure_kind_deps(registry, natives, elem),
            _ => Ok(()),
        }
    }

    fn link_guarded(
        &mut self,
        registry: &mut TypeRegistry,
        natives: &mut NativeOpsRegistry,
        id: StructId,
    ) -> LinkResult<()> {
        if let Some(super_id) = registry.get(id).super_id {
            self.ensure_linked(registry, natives, super_id)?;
        }

        // Bind deferred native ops on first link.
        if registry.get(id).native_ops.is_none() {
            if let Some(binding) = registry.get(id).native_binding.clone() {
                let ops = natives
                    .consume(&binding)
                    .ok_or(LinkError::UnknownNativeOps(binding))?;
                registry.get_mut(id).native_ops = Some(ops);
            }
        }

        // Offset walk with bounded restart. Each attempt snapshots the
        // properties' identity, links dependencies (which may mutate this
        // struct's declarations), and restarts if the snapshot changed.
        // `max_link_retries` bounds the restarts, so a stable struct links
        // on its single attempt even with the bound at zero.
        let mut element_layouts: Vec<(usize, usize)> = Vec::new();
        let mut stabilized = false;
        for attempt in 0..=self.options.max_link_retries {
            let before = Self::snapshot(registry, id);

            let count = registry.get(id).properties.len();
            for index in 0..count {
                let kind = registry.get(id).properties[index].kind.clone();
                self.ensure_kind_deps(registry, natives, &kind)?;
            }

            if Self::snapshot(registry, id) != before {
                log::debug!(
                    "relinking `{}`: declarations changed during attempt {}",
                    registry.get(id).name,
                    attempt
                );
                continue;
            }

            let st = registry.get(id);
            element_layouts = st
                .properties
                .iter()
                .map(|p| (p.kind.size(registry), p.kind.alignment(registry)))
                .collect();
            stabilized = true;
            break;
        }
        if !stabilized {
            return Err(LinkError::RetryExhausted(
                registry.get(id).name.clone(),
                self.options.max_link_retries,
            ));
        }

        // Assign offsets, seeded from the super struct.
        let (mut size, mut alignment) = match registry.get(id).super_id {
            Some(super_id) => {
                let sup = registry.get(super_id);
                (sup.properties_size, sup.min_alignment)
            }
            None => (0, 1),
        };
        let count = registry.get(id).properties.len();
        for index in 0..count {
            let (elem_size, elem_align) = element_layouts[index];
            let offset = align_up(size, elem_align.max(1));
            let dim = registry.get(id).properties[index].array_dim as usize;

            let prop = &mut registry.get_mut(id).properties[index];
            prop.offset = offset;
            prop.size = elem_size;
            prop.alignment = elem_align;

            size = offset + elem_size * dim;
            alignment = alignment.max(elem_align);
        }
        let total = align_up(size, alignment);

        // Layout invariants.
        if let Some(super_id) = registry.get(id).super_id {
            debug_assert!(registry.get(super_id).properties_size <= total);
        }
        for index in 0..count {
            let prop = &registry.get(id).properties[index];
            if prop.offset + prop.total_size() > total {
                return Err(LinkError::LayoutError {
                    owner: registry.get(id).name.clone(),
                    property: prop.name.clone(),
                    offset: prop.offset,
                    size: prop.total_size(),
                    struct_size: total,
                });
            }
        }

        // Computed per-property flags.
        for index in 0..count {
            let kind = registry.get(id).properties[index].kind.clone();
            let is_reference = contains_reference(registry, &kind);
            let needs_dtor = kind.needs_destructor(registry);
            let zero_construct = kind.is_zero_constructible(registry);

            let flags = &mut registry.get_mut(id).properties[index].flags;
            flags.set(PropertyFlags::REFERENCE, is_reference);
            flags.set(PropertyFlags::NEEDS_DTOR, needs_dtor);
            flags.set(PropertyFlags::ZERO_CONSTRUCT, zero_construct);
        }

        // Derived chains, inherited contributions first.
        let (mut property_link, super_ref, super_dtor, super_post) =
            match registry.get(id).super_id {
                Some(super_id) => {
                    let sup = registry.get(super_id);
                    (
                        sup.property_link.clone(),
                        sup.ref_link.clone(),
                        sup.dtor_link.clone(),
                        sup.post_construct_link.clone(),
                    )
                }
                None => (Vec::new(), Vec::new(), Vec::new(), Vec::new()),
            };
        let own_refs: Vec<PropertyRef> = (0..count)
            .map(|index| PropertyRef {
                owner: id,
                index: index as u32,
            })
            .collect();
        property_link.extend(own_refs.iter().copied());

        let mut ref_link = super_ref;
        let mut dtor_link;
        let mut post_construct_link = super_post;

        let covering_native_dtor = registry
            .get(id)
            .native_ops
            .as_ref()
            .is_some_and(|ops| ops.destruct.is_some() && ops.destroys_self_and_supers);
        if covering_native_dtor {
            // The native destructor owns this struct and everything
            // inherited below it; reflected destruction would double-free.
            dtor_link = Vec::new();
        } else {
            dtor_link = super_dtor;
        }

        let per_object_config = registry
            .get(id)
            .class_flags
            .is_some_and(|f| f.contains(ClassFlags::PER_OBJECT_CONFIG));

        for &pref in &own_refs {
            let prop = registry.property(pref);
            if prop.flags.contains(PropertyFlags::REFERENCE) {
                ref_link.push(pref);
            }
            if !covering_native_dtor && prop.flags.contains(PropertyFlags::NEEDS_DTOR) {
                dtor_link.push(pref);
            }
            let native = prop.flags.contains(PropertyFlags::NATIVE);
            let config = prop.flags.contains(PropertyFlags::CONFIG);
            if !native || (config && !per_object_config) {
                post_construct_link.push(pref);
            }
        }

        // Computed struct flags.
        let native_dtor_root = if covering_native_dtor {
            Some(id)
        } else {
            registry
                .get(id)
                .super_id
                .and_then(|s| registry.get(s).native_dtor_root)
        };
        let has_chain_native_dtor = registry
            .super_chain(id)
            .any(|s| registry.get(s).native_ops.as_ref().is_some_and(|o| o.destruct.is_some()));
        let has_chain_native_ctor = registry
            .super_chain(id)
            .any(|s| registry.get(s).native_ops.as_ref().is_some_and(|o| o.construct.is_some()));
        let all_pod = property_link
            .iter()
            .all(|&r| registry.property(r).kind.is_pod(registry))
            && !has_chain_native_dtor;
        let all_zero = property_link
            .iter()
            .all(|&r| registry.property(r).flags.contains(PropertyFlags::ZERO_CONSTRUCT))
            && !has_chain_native_ctor;
        let needs_dtor = !dtor_link.is_empty() || has_chain_native_dtor;

        let st = registry.get_mut(id);
        st.properties_size = total;
        st.min_alignment = alignment;
        st.property_link = property_link;
        st.ref_link = ref_link;
        st.dtor_link = dtor_link;
        st.post_construct_link = post_construct_link;
        st.native_dtor_root = native_dtor_root;
        st.flags.set(StructFlags::POD, all_pod);
        st.flags.set(StructFlags::ZERO_INIT, all_zero);
        st.flags.set(StructFlags::NEEDS_DTOR, needs_dtor);
        st.linked = true;

        log::trace!(
            "linked `{}`: {} bytes, align {}, {} properties",
            registry.get(id).name,
            total,
            alignment,
            count
        );
        Ok(())
    }

    fn snapshot(registry: &TypeRegistry, id: StructId) -> Vec<(String, bool)> {
        registry
            .get(id)
            .properties
            .iter()
            .map(|p| (p.name.clone(), p.flags.contains(PropertyFlags::TRANSIENT)))
            .collect()
    }
}

/// Whether a kind transitively holds an object/weak reference.
///
/// Nested structs are guaranteed linked by the dependency pass, so their
/// ref chains are authoritative; self-recursive layouts never reach here.
fn contains_reference(registry: &TypeRegistry, kind: &PropertyKind) -> bool {
    match kind {
        PropertyKind::Object | PropertyKind::WeakObject => true,
        PropertyKind::Struct(id) => !registry.get(*id).ref_link.is_empty(),
        PropertyKind::Seq(elem) => contains_reference(registry, elem),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::Property;
    use crate::registry::StructBuilder;

    fn link_one(registry: &mut TypeRegistry, id: StructId) -> LinkResult<()> {
        let mut natives = NativeOpsRegistry::new();
        PropertyLinker::new().link(registry, &mut natives, id)
    }

    #[test]
    fn test_offsets_respect_alignment() {
        let mut registry = TypeRegistry::new();
        let id = registry
            .register(
                StructBuilder::new("Mixed")
                    .prop(Property::new("Flag", PropertyKind::Bool))
                    .prop(Property::new("Big", PropertyKind::Double))
                    .prop(Property::new("Small", PropertyKind::Int16)),
            )
            .unwrap();
        link_one(&mut registry, id).unwrap();

        let st = registry.get(id);
        assert_eq!(st.properties[0].offset, 0);
        assert_eq!(st.properties[1].offset, 8); // aligned up from 1
        assert_eq!(st.properties[2].offset, 16);
        assert_eq!(st.min_alignment, 8);
        assert_eq!(st.properties_size, 24); // padded to alignment
        assert!(st.linked);
    }

    #[test]
    fn test_super_seeds_offsets() {
        let mut registry = TypeRegistry::new();
        let base = registry
            .register(StructBuilder::new("Base").prop(Property::new("A", PropertyKind::Int32)))
            .unwrap();
        let derived = registry
            .register(
                StructBuilder::new("Derived")
                    .with_super(base)
                    .prop(Property::new("B", PropertyKind::Float)),
            )
            .unwrap();
        link_one(&mut registry, derived).unwrap();

        let b = registry.get(derived).own_property(0);
        assert_eq!(b.offset, 4); // after Base's A
        assert!(registry.get(base).linked); // linked as a dependency
        assert!(registry.get(derived).properties_size >= registry.get(base).properties_size);
    }

    #[test]
    fn test_chains_are_subsequences() {
        let mut registry = TypeRegistry::new();
        let id = registry
            .register(
                StructBuilder::new("Holder")
                    .prop(Property::new("Count", PropertyKind::Int32))
                    .prop(Property::new("Label", PropertyKind::Str))
                    .prop(Property::new("Target", PropertyKind::Object)),
            )
            .unwrap();
        link_one(&mut registry, id).unwrap();

        let st = registry.get(id);
        assert_eq!(st.property_link.len(), 3);
        assert_eq!(st.ref_link.len(), 1);
        assert_eq!(registry.property(st.ref_link[0]).name, "Target");
        assert_eq!(st.dtor_link.len(), 1);
        assert_eq!(registry.property(st.dtor_link[0]).name, "Label");

        // Subset chains are order-preserving subsequences of property_link.
        for subset in [&st.ref_link, &st.dtor_link, &st.post_construct_link] {
            let positions: Vec<usize> = subset
                .iter()
                .map(|r| st.property_link.iter().position(|p| p == r).unwrap())
                .collect();
            assert!(positions.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_relink_is_idempotent() {
        let mut registry = TypeRegistry::new();
        let id = registry
            .register(
                StructBuilder::new("Stable")
                    .prop(Property::new("A", PropertyKind::Int8))
                    .prop(Property::new("B", PropertyKind::Int64))
                    .prop(Property::new("C", PropertyKind::Str)),
            )
            .unwrap();
        link_one(&mut registry, id).unwrap();
        let first: Vec<(usize, usize)> = registry
            .get(id)
            .properties
            .iter()
            .map(|p| (p.offset, p.size))
            .collect();
        let first_chain = registry.get(id).property_link.clone();
        let first_size = registry.get(id).properties_size;

        link_one(&mut registry, id).unwrap();
        let second: Vec<(usize, usize)> = registry
            .get(id)
            .properties
            .iter()
            .map(|p| (p.offset, p.size))
            .collect();
        assert_eq!(first, second);
        assert_eq!(first_chain, registry.get(id).property_link);
        assert_eq!(first_size, registry.get(id).properties_size);
    }

    #[test]
    fn test_zero_retry_bound_links_stable_struct() {
        // The bound counts restarts; a struct whose declarations never
        // change during linking needs none.
        let mut registry = TypeRegistry::new();
        let id = registry
            .register(StructBuilder::new("Stable").prop(Property::new("A", PropertyKind::Int32)))
            .unwrap();
        let mut natives = NativeOpsRegistry::new();
        let mut linker = PropertyLinker::with_options(LinkOptions {
            max_link_retries: 0,
        });
        linker.link(&mut registry, &mut natives, id).unwrap();
        assert!(registry.get(id).linked);
    }

    #[test]
    fn test_recursive_seq_rejected() {
        let mut registry = TypeRegistry::new();
        let id = registry.register(StructBuilder::new("Node")).unwrap();
        registry.add_property(
            id,
            Property::new(
                "Children",
                PropertyKind::Seq(Box::new(PropertyKind::Struct(id))),
            ),
        );
        assert!(matches!(
            link_one(&mut registry, id),
            Err(LinkError::RecursiveStruct(_))
        ));
    }

    #[test]
    fn test_unknown_native_binding_is_fatal() {
        let mut registry = TypeRegistry::new();
        let id = registry
            .register(StructBuilder::new("Bound").native("missing_ops"))
            .unwrap();
        assert!(matches!(
            link_one(&mut registry, id),
            Err(LinkError::UnknownNativeOps(_))
        ));
    }

    #[test]
    fn test_nested_struct_reference_propagates() {
        let mut registry = TypeRegistry::new();
        let inner = registry
            .register(StructBuilder::new("Inner").prop(Property::new("Ref", PropertyKind::Object)))
            .unwrap();
        let outer = registry
            .register(
                StructBuilder::new("Outer")
                    .prop(Property::new("Value", PropertyKind::Int32))
                    .prop(Property::new("Nested", PropertyKind::Struct(inner))),
            )
            .unwrap();
        link_one(&mut registry, outer).unwrap();

        let st = registry.get(outer);
        assert_eq!(st.ref_link.len(), 1);
        assert_eq!(registry.property(st.ref_link[0]).name, "Nested");
    }

    #[test]
    fn test_pod_and_zero_init_flags() {
        let mut registry = TypeRegistry::new();
        let pod = registry
            .register(
                StructBuilder::new("Pod")
                    .prop(Property::new("A", PropertyKind::Int32))
                    .prop(Property::new("B", PropertyKind::Double)),
            )
            .unwrap();
        let text = registry
            .register(StructBuilder::new("Text").prop(Property::new("S", PropertyKind::Str)))
            .unwrap();
        link_one(&mut registry, pod).unwrap();
        link_one(&mut registry, text).unwrap();

        assert!(registry.get(pod).flags.contains(StructFlags::POD));
        assert!(registry.get(pod).flags.contains(StructFlags::ZERO_INIT));
        assert!(!registry.get(text).flags.contains(StructFlags::POD));
        assert!(!registry.get(text).flags.contains(StructFlags::ZERO_INIT));
    }
}
