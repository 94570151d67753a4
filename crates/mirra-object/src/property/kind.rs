//! Property value kinds
//!
//! [`PropertyKind`] describes what a property's bytes mean. Size and
//! alignment of scalar kinds are fixed; `Struct` defers to the referenced
//! struct's linked layout, which is why a struct-typed property forces its
//! dependency to link first.

use crate::registry::{EnumId, StructId, TypeRegistry};

/// Value-type descriptor for one property element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    /// A byte, optionally interpreted through a registered enum
    Byte(Option<EnumId>),
    /// In-place owned UTF-8 string
    Str,
    /// Identifier string; same storage as `Str`, distinct on the wire
    Name,
    /// Strong object reference slot
    Object,
    /// Weak object reference slot
    WeakObject,
    /// Inline nested struct
    Struct(StructId),
    /// Dynamic array of elements, stored as stride-packed heap storage
    Seq(Box<PropertyKind>),
}

impl PropertyKind {
    /// Size in bytes of one value of this kind.
    ///
    /// For `Struct` this is the referenced struct's `properties_size`, so
    /// the referenced struct must already be linked.
    pub fn size(&self, registry: &TypeRegistry) -> usize {
        match self {
            PropertyKind::Bool
            | PropertyKind::Int8
            | PropertyKind::UInt8
            | PropertyKind::Byte(_) => 1,
            PropertyKind::Int16 | PropertyKind::UInt16 => 2,
            PropertyKind::Int32 | PropertyKind::UInt32 | PropertyKind::Float => 4,
            PropertyKind::Int64
            | PropertyKind::UInt64
            | PropertyKind::Double
            | PropertyKind::Object
            | PropertyKind::WeakObject => 8,
            PropertyKind::Str | PropertyKind::Name => std::mem::size_of::<String>(),
            PropertyKind::Seq(_) => std::mem::size_of::<super::ops::SeqStorage>(),
            PropertyKind::Struct(id) => registry.get(*id).properties_size,
        }
    }

    /// Alignment in bytes of one value of this kind.
    pub fn alignment(&self, registry: &TypeRegistry) -> usize {
        match self {
            PropertyKind::Bool
            | PropertyKind::Int8
            | PropertyKind::UInt8
            | PropertyKind::Byte(_) => 1,
            PropertyKind::Int16 | PropertyKind::UInt16 => 2,
            PropertyKind::Int32 | PropertyKind::UInt32 | PropertyKind::Float => 4,
            PropertyKind::Int64
            | PropertyKind::UInt64
            | PropertyKind::Double
            | PropertyKind::Object
            | PropertyKind::WeakObject => 8,
            PropertyKind::Str | PropertyKind::Name => std::mem::align_of::<String>(),
            PropertyKind::Seq(_) => std::mem::align_of::<super::ops::SeqStorage>(),
            PropertyKind::Struct(id) => registry.get(*id).min_alignment,
        }
    }

    /// Whether an all-zero bit pattern is a fully constructed value.
    ///
    /// Scalars and reference slots are zero-constructible (zero is the null
    /// handle); so is `Seq` (zero is the empty storage). `Str`/`Name` are
    /// not: a zeroed `String` is invalid and must be written explicitly.
    pub fn is_zero_constructible(&self, registry: &TypeRegistry) -> bool {
        match self {
            PropertyKind::Str | PropertyKind::Name => false,
            PropertyKind::Struct(id) => registry
                .get(*id)
                .flags
                .contains(crate::registry::StructFlags::ZERO_INIT),
            // Empty storage is all zeroes; element construction happens on
            // insertion.
            PropertyKind::Seq(_) => true,
            _ => true,
        }
    }

    /// Whether values of this kind need explicit destruction.
    pub fn needs_destructor(&self, registry: &TypeRegistry) -> bool {
        match self {
            PropertyKind::Str | PropertyKind::Name | PropertyKind::Seq(_) => true,
            PropertyKind::Struct(id) => registry
                .get(*id)
                .flags
                .contains(crate::registry::StructFlags::NEEDS_DTOR),
            _ => false,
        }
    }

    /// Whether values of this kind can be copied with a plain memcpy.
    pub fn is_pod(&self, registry: &TypeRegistry) -> bool {
        match self {
            PropertyKind::Str | PropertyKind::Name | PropertyKind::Seq(_) => false,
            PropertyKind::Struct(id) => registry
                .get(*id)
                .flags
                .contains(crate::registry::StructFlags::POD),
            _ => true,
        }
    }

    /// Directly holds a reference slot (no recursion into structs/arrays).
    pub fn is_reference_slot(&self) -> bool {
        matches!(self, PropertyKind::Object | PropertyKind::WeakObject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_sizes() {
        let registry = TypeRegistry::new();
        assert_eq!(PropertyKind::Bool.size(&registry), 1);
        assert_eq!(PropertyKind::Int16.size(&registry), 2);
        assert_eq!(PropertyKind::Int32.size(&registry), 4);
        assert_eq!(PropertyKind::Float.size(&registry), 4);
        assert_eq!(PropertyKind::Double.size(&registry), 8);
        assert_eq!(PropertyKind::Object.size(&registry), 8);
        assert_eq!(PropertyKind::Byte(None).size(&registry), 1);
    }

    #[test]
    fn test_alignment_matches_size_for_scalars() {
        let registry = TypeRegistry::new();
        for kind in [
            PropertyKind::Bool,
            PropertyKind::Int16,
            PropertyKind::Int32,
            PropertyKind::Int64,
            PropertyKind::Float,
            PropertyKind::Double,
            PropertyKind::Object,
        ] {
            assert_eq!(kind.size(&registry), kind.alignment(&registry));
        }
    }

    #[test]
    fn test_zero_constructible() {
        let registry = TypeRegistry::new();
        assert!(PropertyKind::Int32.is_zero_constructible(&registry));
        assert!(PropertyKind::Object.is_zero_constructible(&registry));
        assert!(PropertyKind::Seq(Box::new(PropertyKind::Int32)).is_zero_constructible(&registry));
        assert!(!PropertyKind::Str.is_zero_constructible(&registry));
        assert!(!PropertyKind::Name.is_zero_constructible(&registry));
    }

    #[test]
    fn test_needs_destructor() {
        let registry = TypeRegistry::new();
        assert!(PropertyKind::Str.needs_destructor(&registry));
        assert!(PropertyKind::Seq(Box::new(PropertyKind::Int32)).needs_destructor(&registry));
        assert!(!PropertyKind::Int64.needs_destructor(&registry));
        assert!(!PropertyKind::Object.needs_destructor(&registry));
    }
}
