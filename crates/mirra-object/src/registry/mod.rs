//! Type registry
//!
//! The registry is an arena of struct/class and enum descriptors addressed
//! by stable handles. Super-struct and owner relations are non-owning
//! handles resolved through the arena, which keeps the cyclic
//! struct/super-struct/default-object graph representable without owning
//! pointers.
//!
//! Registration is a distinct phase: types and their properties are declared
//! first, then linked (see [`crate::linker`]), and only then instantiated.

pub mod natives;
pub mod redirects;

use crate::property::{Property, PropertyRef};
use crate::{LinkError, LinkResult};
use natives::NativeOps;
use rustc_hash::FxHashMap;

/// Handle to a registered struct or class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StructId(pub(crate) u32);

impl StructId {
    /// Raw arena index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a registered enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnumId(pub(crate) u32);

impl EnumId {
    /// Raw arena index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags::bitflags! {
    /// Struct-level flags; the high bits are computed at link time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StructFlags: u32 {
        /// Serialize all properties whenever any differs (no per-property
        /// diffing inside this struct)
        const ATOMIC    = 1 << 0;
        /// Whole layout is memcpy-safe (computed)
        const POD       = 1 << 8;
        /// Whole layout is valid as all zeroes (computed)
        const ZERO_INIT  = 1 << 9;
        /// Instances need reflected or native destruction (computed)
        const NEEDS_DTOR = 1 << 10;
    }
}

bitflags::bitflags! {
    /// Class-level flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassFlags: u32 {
        /// Config-flagged fields are defaulted per object, not from the CDO
        const PER_OBJECT_CONFIG = 1 << 0;
    }
}

/// A registered enum: named entries with integral values.
#[derive(Debug, Clone)]
pub struct Enum {
    pub id: EnumId,
    pub name: String,
    pub entries: Vec<(String, i64)>,
}

impl Enum {
    /// Look up an entry value by name
    pub fn value_of(&self, entry: &str) -> Option<i64> {
        self.entries
            .iter()
            .find(|(name, _)| name == entry)
            .map(|(_, v)| *v)
    }

    /// Look up an entry name by value
    pub fn name_of(&self, value: i64) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(name, _)| name.as_str())
    }
}

/// A reflected aggregate type: named fields with a single optional super
/// struct.
///
/// `properties` holds only the struct's own fields in declaration order.
/// The four derived chains are populated by the linker; all three subset
/// chains are order-preserving subsequences of `property_link`, which lists
/// inherited properties before own properties.
#[derive(Debug)]
pub struct Struct {
    pub id: StructId,
    pub name: String,
    pub super_id: Option<StructId>,
    pub flags: StructFlags,
    /// `Some` when this struct was registered as a class
    pub class_flags: Option<ClassFlags>,
    /// Deferred native-ops name, consumed from the registry at first link
    pub native_binding: Option<String>,
    /// Bound native ops (set at first link)
    pub native_ops: Option<NativeOps>,
    /// Own properties, declaration order
    pub properties: Vec<Property>,
    /// Total instance size in bytes (padded to `min_alignment`)
    pub properties_size: usize,
    /// Instance alignment
    pub min_alignment: usize,
    /// Whether linking has completed
    pub linked: bool,
    /// All properties, inherited first, declaration order
    pub property_link: Vec<PropertyRef>,
    /// Subset transitively holding object/weak references
    pub ref_link: Vec<PropertyRef>,
    /// Subset needing explicit destruction not covered by a native
    /// destructor
    pub dtor_link: Vec<PropertyRef>,
    /// Subset copied from the class default object after raw construction
    pub post_construct_link: Vec<PropertyRef>,
    /// Nearest struct (self or super) whose native destructor covers itself
    /// and its supers
    pub native_dtor_root: Option<StructId>,
}

impl Struct {
    /// Whether this struct was registered as a class
    pub fn is_class(&self) -> bool {
        self.class_flags.is_some()
    }

    /// One of the struct's own properties
    pub fn own_property(&self, index: u32) -> &Property {
        &self.properties[index as usize]
    }
}

/// Builder for registering a struct or class.
pub struct StructBuilder {
    name: String,
    super_id: Option<StructId>,
    flags: StructFlags,
    class_flags: Option<ClassFlags>,
    native_binding: Option<String>,
    properties: Vec<Property>,
}

impl StructBuilder {
    /// Start a plain struct
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            super_id: None,
            flags: StructFlags::empty(),
            class_flags: None,
            native_binding: None,
            properties: Vec::new(),
        }
    }

    /// Start a class (a struct with a class default object)
    pub fn class(name: impl Into<String>) -> Self {
        let mut b = Self::new(name);
        b.class_flags = Some(ClassFlags::empty());
        b
    }

    /// Inherit from a previously registered struct/class
    pub fn with_super(mut self, id: StructId) -> Self {
        self.super_id = Some(id);
        self
    }

    /// Request whole-struct (non-diffed) serialization
    pub fn atomic(mut self) -> Self {
        self.flags |= StructFlags::ATOMIC;
        self
    }

    /// Mark the class as per-object-config
    pub fn per_object_config(mut self) -> Self {
        let flags = self.class_flags.get_or_insert(ClassFlags::empty());
        *flags |= ClassFlags::PER_OBJECT_CONFIG;
        self
    }

    /// Bind deferred native ops by name (resolved at first link)
    pub fn native(mut self, ops_name: impl Into<String>) -> Self {
        self.native_binding = Some(ops_name.into());
        self
    }

    /// Declare a property
    pub fn prop(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }
}

/// Arena of registered types.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    structs: Vec<Struct>,
    enums: Vec<Enum>,
    struct_names: FxHashMap<String, StructId>,
    enum_names: FxHashMap<String, EnumId>,
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a struct or class
    pub fn register(&mut self, builder: StructBuilder) -> LinkResult<StructId> {
        if self.struct_names.contains_key(&builder.name) {
            return Err(LinkError::DuplicateType(builder.name));
        }
        let id = StructId(self.structs.len() as u32);
        self.struct_names.insert(builder.name.clone(), id);
        self.structs.push(Struct {
            id,
            name: builder.name,
            super_id: builder.super_id,
            flags: builder.flags,
            class_flags: builder.class_flags,
            native_binding: builder.native_binding,
            native_ops: None,
            properties: builder.properties,
            properties_size: 0,
            min_alignment: 1,
            linked: false,
            property_link: Vec::new(),
            ref_link: Vec::new(),
            dtor_link: Vec::new(),
            post_construct_link: Vec::new(),
            native_dtor_root: None,
        });
        Ok(id)
    }

    /// Declare an additional property on an already-registered struct.
    ///
    /// Needed for self-referential declarations, where the property's kind
    /// mentions the owning struct's own handle. Unlinks the struct.
    pub fn add_property(&mut self, id: StructId, property: Property) {
        let st = &mut self.structs[id.index()];
        st.properties.push(property);
        st.linked = false;
    }

    /// Register an enum
    pub fn register_enum(
        &mut self,
        name: impl Into<String>,
        entries: Vec<(String, i64)>,
    ) -> LinkResult<EnumId> {
        let name = name.into();
        if self.enum_names.contains_key(&name) {
            return Err(LinkError::DuplicateType(name));
        }
        let id = EnumId(self.enums.len() as u32);
        self.enum_names.insert(name.clone(), id);
        self.enums.push(Enum { id, name, entries });
        Ok(id)
    }

    /// Resolve a struct by name
    pub fn find(&self, name: &str) -> Option<StructId> {
        self.struct_names.get(name).copied()
    }

    /// Resolve an enum by name
    pub fn find_enum(&self, name: &str) -> Option<EnumId> {
        self.enum_names.get(name).copied()
    }

    /// Get a struct by handle
    pub fn get(&self, id: StructId) -> &Struct {
        &self.structs[id.index()]
    }

    /// Get a struct by handle, mutably
    pub fn get_mut(&mut self, id: StructId) -> &mut Struct {
        &mut self.structs[id.index()]
    }

    /// Get an enum by handle
    pub fn get_enum(&self, id: EnumId) -> &Enum {
        &self.enums[id.index()]
    }

    /// Resolve a property handle
    pub fn property(&self, r: PropertyRef) -> &Property {
        &self.structs[r.owner.index()].properties[r.index as usize]
    }

    /// Resolve a property handle, mutably
    pub fn property_mut(&mut self, r: PropertyRef) -> &mut Property {
        &mut self.structs[r.owner.index()].properties[r.index as usize]
    }

    /// Walk a struct chain from the given struct up through its supers
    pub fn super_chain(&self, id: StructId) -> SuperChain<'_> {
        SuperChain {
            registry: self,
            next: Some(id),
        }
    }

    /// Whether `id` is `ancestor` or inherits from it
    pub fn is_descendant_of(&self, id: StructId, ancestor: StructId) -> bool {
        self.super_chain(id).any(|s| s == ancestor)
    }

    /// Find a property by name anywhere in the struct chain.
    ///
    /// Works on unlinked structs; scans own properties super-chain-upward.
    pub fn find_property(&self, id: StructId, name: &str) -> Option<PropertyRef> {
        for owner in self.super_chain(id) {
            let st = self.get(owner);
            for (index, prop) in st.properties.iter().enumerate() {
                if prop.name == name {
                    return Some(PropertyRef {
                        owner,
                        index: index as u32,
                    });
                }
            }
        }
        None
    }

    /// Number of registered structs
    pub fn struct_count(&self) -> usize {
        self.structs.len()
    }
}

/// Iterator over a struct and its supers, nearest first.
pub struct SuperChain<'r> {
    registry: &'r TypeRegistry,
    next: Option<StructId>,
}

impl<'r> Iterator for SuperChain<'r> {
    type Item = StructId;

    fn next(&mut self) -> Option<StructId> {
        let id = self.next?;
        self.next = self.registry.get(id).super_id;
        Some(id)
    }
}
