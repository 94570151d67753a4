//! Property descriptors
//!
//! A [`Property`] is one reflected field: its name, value kind, computed
//! offset/size/alignment, and flags. Properties are owned by exactly one
//! struct in the [`TypeRegistry`](crate::registry::TypeRegistry); order of
//! declaration is significant for both iteration and wire layout.

pub mod kind;
pub(crate) mod ops;

use crate::registry::StructId;
use kind::PropertyKind;

/// Stable identity for a property-level rename hint carried on the wire.
pub type PropertyGuid = [u8; 16];

bitflags::bitflags! {
    /// Per-property behavior flags.
    ///
    /// `TRANSIENT`, `EDITOR_ONLY`, `CONFIG`, and `NATIVE` are declared at
    /// registration; `REFERENCE`, `NEEDS_DTOR`, and `ZERO_CONSTRUCT` are
    /// computed from the value kind when the owning struct is linked.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PropertyFlags: u32 {
        /// Transitively holds an object/weak reference
        const REFERENCE      = 1 << 0;
        /// Needs explicit destruction
        const NEEDS_DTOR     = 1 << 1;
        /// Never serialized
        const TRANSIENT      = 1 << 2;
        /// Serialized only when editor data is enabled
        const EDITOR_ONLY    = 1 << 3;
        /// An all-zero bit pattern is a fully constructed value
        const ZERO_CONSTRUCT = 1 << 4;
        /// Default value comes from configuration
        const CONFIG         = 1 << 5;
        /// Storage is owned by native code
        const NATIVE         = 1 << 6;
    }
}

/// Handle to a property: the struct that declared it plus its declaration
/// index within that struct. Stable across linking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyRef {
    /// Struct that declared the property
    pub owner: StructId,
    /// Declaration index within the owner's own properties
    pub index: u32,
}

/// An opaque reference slot stored inside instance memory.
///
/// Zero is the null handle. The GC visitor receives these by mutable
/// reference and may rewrite them in place (compacting collectors) or only
/// observe them (mark-sweep). An unresolved referent is represented as null,
/// never dereferenced here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectHandle(pub u64);

impl ObjectHandle {
    /// The null handle
    pub const NULL: ObjectHandle = ObjectHandle(0);

    /// Create a handle from a raw id
    pub fn new(raw: u64) -> Self {
        ObjectHandle(raw)
    }

    /// Raw id
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Whether this handle refers to nothing
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl Default for ObjectHandle {
    fn default() -> Self {
        Self::NULL
    }
}

/// One reflected field descriptor.
///
/// `offset`, `size`, and `alignment` are zero until the owning struct is
/// linked; `size` and `alignment` describe a single element (`array_dim`
/// elements are laid out back to back).
#[derive(Debug, Clone)]
pub struct Property {
    /// Field name, unique within the owning struct chain
    pub name: String,
    /// Value kind
    pub kind: PropertyKind,
    /// Static array dimension (1 for plain fields)
    pub array_dim: u32,
    /// Declared + computed flags
    pub flags: PropertyFlags,
    /// Optional stable rename hint
    pub guid: Option<PropertyGuid>,
    /// Byte offset within the instance, assigned at link time
    pub offset: usize,
    /// Size of one element, assigned at link time
    pub size: usize,
    /// Alignment of one element, assigned at link time
    pub alignment: usize,
}

impl Property {
    /// Declare a new property with default flags and `array_dim == 1`
    pub fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            array_dim: 1,
            flags: PropertyFlags::empty(),
            guid: None,
            offset: 0,
            size: 0,
            alignment: 0,
        }
    }

    /// Declare as a static array of `dim` elements
    pub fn array(mut self, dim: u32) -> Self {
        assert!(dim >= 1, "array dimension must be at least 1");
        self.array_dim = dim;
        self
    }

    /// Mark as transient (never serialized)
    pub fn transient(mut self) -> Self {
        self.flags |= PropertyFlags::TRANSIENT;
        self
    }

    /// Mark as editor-only
    pub fn editor_only(mut self) -> Self {
        self.flags |= PropertyFlags::EDITOR_ONLY;
        self
    }

    /// Mark as config-defaulted
    pub fn config(mut self) -> Self {
        self.flags |= PropertyFlags::CONFIG;
        self
    }

    /// Mark the storage as natively owned
    pub fn native(mut self) -> Self {
        self.flags |= PropertyFlags::NATIVE;
        self
    }

    /// Attach a stable rename hint
    pub fn with_guid(mut self, guid: PropertyGuid) -> Self {
        self.guid = Some(guid);
        self
    }

    /// Total bytes occupied by all elements
    pub fn total_size(&self) -> usize {
        self.size * self.array_dim as usize
    }

    /// Byte offset of one element
    pub fn element_offset(&self, index: u32) -> usize {
        debug_assert!(index < self.array_dim);
        self.offset + self.size * index as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_declaration() {
        let p = Property::new("Health", PropertyKind::Int32)
            .array(4)
            .transient();
        assert_eq!(p.name, "Health");
        assert_eq!(p.array_dim, 4);
        assert!(p.flags.contains(PropertyFlags::TRANSIENT));
        assert!(!p.flags.contains(PropertyFlags::EDITOR_ONLY));
        assert_eq!(p.offset, 0); // unlinked
    }

    #[test]
    fn test_object_handle_null() {
        assert!(ObjectHandle::NULL.is_null());
        assert!(ObjectHandle::default().is_null());
        assert!(!ObjectHandle::new(7).is_null());
        assert_eq!(ObjectHandle::new(7).raw(), 7);
    }

    #[test]
    fn test_element_offset() {
        let mut p = Property::new("Slots", PropertyKind::Int32).array(3);
        p.offset = 8;
        p.size = 4;
        assert_eq!(p.element_offset(0), 8);
        assert_eq!(p.element_offset(2), 16);
        assert_eq!(p.total_size(), 12);
    }
}
