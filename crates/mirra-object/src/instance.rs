//! Owned instance buffers
//!
//! [`Instance`] owns one aligned, constructed instance of a linked struct or
//! class and is the safe surface over the raw-memory machinery: typed field
//! access by name, tagged save/load, JSON conversion, and reference
//! traversal. Dropping an instance runs its destructor chain.

use crate::gc::ReferenceVisitor;
use crate::property::kind::PropertyKind;
use crate::property::{ops, ObjectHandle, PropertyRef};
use crate::registry::{StructId, TypeRegistry};
use crate::serial::{self, LoadContext, LoadStats, SaveContext};
use crate::{cdo::ClassDefaultObjectFactory, LinkError, LinkResult, SerialResult, StructLayout};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io::{Read, Seek, Write};
use std::ptr::NonNull;

/// Field access errors.
#[derive(Debug, thiserror::Error)]
pub enum FieldError {
    /// No property of that name anywhere in the struct chain
    #[error("no field named `{0}`")]
    UnknownField(String),

    /// The property exists but holds a different kind
    #[error("field `{0}` is not of the requested kind")]
    KindMismatch(String),

    /// Static array element index out of range
    #[error("field `{field}` index {index} out of range (dim {dim})")]
    IndexOutOfBounds { field: String, index: u32, dim: u32 },
}

/// One owned, constructed instance of a linked struct or class.
pub struct Instance<'r> {
    registry: &'r TypeRegistry,
    id: StructId,
    ptr: NonNull<u8>,
    layout: Layout,
}

impl<'r> Instance<'r> {
    /// Construct a zero-defaulted instance: zero fill, native constructors,
    /// per-property construction. No class defaults are applied.
    pub fn new(registry: &'r TypeRegistry, id: StructId) -> LinkResult<Self> {
        let view = StructLayout::new(registry, id)?;
        let layout = Layout::from_size_align(view.size().max(1), view.alignment().max(1))
            .map_err(|_| LinkError::LayoutError {
                owner: view.name().to_string(),
                property: String::new(),
                offset: 0,
                size: view.size(),
                struct_size: view.size(),
            })?;
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => std::alloc::handle_alloc_error(layout),
        };
        unsafe { ops::initialize_struct(registry, id, ptr.as_ptr()) };
        Ok(Self {
            registry,
            id,
            ptr,
            layout,
        })
    }

    /// Construct an instance with class defaults: after construction, the
    /// post-construct chain is copied from the class default object.
    pub fn with_defaults(
        registry: &'r TypeRegistry,
        factory: &ClassDefaultObjectFactory,
        id: StructId,
    ) -> LinkResult<Self> {
        let instance = Self::new(registry, id)?;
        let defaults = factory.default_object(registry, id)?;
        unsafe {
            for &pref in &registry.get(id).post_construct_link {
                let prop = registry.property(pref);
                for i in 0..prop.array_dim {
                    let off = prop.element_offset(i);
                    ops::copy_value(
                        registry,
                        &prop.kind,
                        instance.ptr.as_ptr().add(off),
                        defaults.as_ptr().add(off),
                    );
                }
            }
        }
        Ok(instance)
    }

    /// Struct handle of this instance
    pub fn struct_id(&self) -> StructId {
        self.id
    }

    /// Struct name of this instance
    pub fn struct_name(&self) -> &'r str {
        &self.registry.get(self.id).name
    }

    /// Registry the instance was built against
    pub fn registry(&self) -> &'r TypeRegistry {
        self.registry
    }

    /// Instance bytes
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size()) }
    }

    /// Instance size in bytes
    pub fn size(&self) -> usize {
        self.registry.get(self.id).properties_size
    }

    /// Resolve a field by name anywhere in the struct chain
    pub fn field(&self, name: &str) -> Result<PropertyRef, FieldError> {
        self.registry
            .find_property(self.id, name)
            .ok_or_else(|| FieldError::UnknownField(name.to_string()))
    }

    fn scalar_ptr(
        &self,
        name: &str,
        index: u32,
        want: &PropertyKind,
    ) -> Result<*mut u8, FieldError> {
        let pref = self.field(name)?;
        let prop = self.registry.property(pref);
        if prop.kind != *want {
            return Err(FieldError::KindMismatch(name.to_string()));
        }
        if index >= prop.array_dim {
            return Err(FieldError::IndexOutOfBounds {
                field: name.to_string(),
                index,
                dim: prop.array_dim,
            });
        }
        Ok(unsafe { self.ptr.as_ptr().add(prop.element_offset(index)) })
    }

    /// Read a `Bool` field
    pub fn get_bool(&self, name: &str) -> Result<bool, FieldError> {
        let p = self.scalar_ptr(name, 0, &PropertyKind::Bool)?;
        Ok(unsafe { *p != 0 })
    }

    /// Write a `Bool` field
    pub fn set_bool(&mut self, name: &str, value: bool) -> Result<(), FieldError> {
        let p = self.scalar_ptr(name, 0, &PropertyKind::Bool)?;
        unsafe { *p = value as u8 };
        Ok(())
    }

    /// Read an `Int32` field
    pub fn get_i32(&self, name: &str) -> Result<i32, FieldError> {
        let p = self.scalar_ptr(name, 0, &PropertyKind::Int32)?;
        Ok(unsafe { *(p as *const i32) })
    }

    /// Write an `Int32` field
    pub fn set_i32(&mut self, name: &str, value: i32) -> Result<(), FieldError> {
        let p = self.scalar_ptr(name, 0, &PropertyKind::Int32)?;
        unsafe { *(p as *mut i32) = value };
        Ok(())
    }

    /// Read an `Int32` static-array element
    pub fn get_i32_at(&self, name: &str, index: u32) -> Result<i32, FieldError> {
        let p = self.scalar_ptr(name, index, &PropertyKind::Int32)?;
        Ok(unsafe { *(p as *const i32) })
    }

    /// Write an `Int32` static-array element
    pub fn set_i32_at(&mut self, name: &str, index: u32, value: i32) -> Result<(), FieldError> {
        let p = self.scalar_ptr(name, index, &PropertyKind::Int32)?;
        unsafe { *(p as *mut i32) = value };
        Ok(())
    }

    /// Read an `Int64` field
    pub fn get_i64(&self, name: &str) -> Result<i64, FieldError> {
        let p = self.scalar_ptr(name, 0, &PropertyKind::Int64)?;
        Ok(unsafe { *(p as *const i64) })
    }

    /// Write an `Int64` field
    pub fn set_i64(&mut self, name: &str, value: i64) -> Result<(), FieldError> {
        let p = self.scalar_ptr(name, 0, &PropertyKind::Int64)?;
        unsafe { *(p as *mut i64) = value };
        Ok(())
    }

    /// Read a `Float` field
    pub fn get_f32(&self, name: &str) -> Result<f32, FieldError> {
        let p = self.scalar_ptr(name, 0, &PropertyKind::Float)?;
        Ok(unsafe { *(p as *const f32) })
    }

    /// Write a `Float` field
    pub fn set_f32(&mut self, name: &str, value: f32) -> Result<(), FieldError> {
        let p = self.scalar_ptr(name, 0, &PropertyKind::Float)?;
        unsafe { *(p as *mut f32) = value };
        Ok(())
    }

    /// Read a `Double` field
    pub fn get_f64(&self, name: &str) -> Result<f64, FieldError> {
        let p = self.scalar_ptr(name, 0, &PropertyKind::Double)?;
        Ok(unsafe { *(p as *const f64) })
    }

    /// Write a `Double` field
    pub fn set_f64(&mut self, name: &str, value: f64) -> Result<(), FieldError> {
        let p = self.scalar_ptr(name, 0, &PropertyKind::Double)?;
        unsafe { *(p as *mut f64) = value };
        Ok(())
    }

    /// Read a `Str` or `Name` field
    pub fn get_str(&self, name: &str) -> Result<&str, FieldError> {
        let pref = self.field(name)?;
        let prop = self.registry.property(pref);
        if !matches!(prop.kind, PropertyKind::Str | PropertyKind::Name) {
            return Err(FieldError::KindMismatch(name.to_string()));
        }
        let s = unsafe { &*(self.ptr.as_ptr().add(prop.offset) as *const String) };
        Ok(s.as_str())
    }

    /// Write a `Str` or `Name` field
    pub fn set_str(&mut self, name: &str, value: &str) -> Result<(), FieldError> {
        let pref = self.field(name)?;
        let prop = self.registry.property(pref);
        if !matches!(prop.kind, PropertyKind::Str | PropertyKind::Name) {
            return Err(FieldError::KindMismatch(name.to_string()));
        }
        let s = unsafe { &mut *(self.ptr.as_ptr().add(prop.offset) as *mut String) };
        s.clear();
        s.push_str(value);
        Ok(())
    }

    /// Read an `Object`/`WeakObject` reference slot
    pub fn get_handle(&self, name: &str) -> Result<ObjectHandle, FieldError> {
        let pref = self.field(name)?;
        let prop = self.registry.property(pref);
        if !prop.kind.is_reference_slot() {
            return Err(FieldError::KindMismatch(name.to_string()));
        }
        Ok(unsafe { *(self.ptr.as_ptr().add(prop.offset) as *const ObjectHandle) })
    }

    /// Write an `Object`/`WeakObject` reference slot
    pub fn set_handle(&mut self, name: &str, value: ObjectHandle) -> Result<(), FieldError> {
        let pref = self.field(name)?;
        let prop = self.registry.property(pref);
        if !prop.kind.is_reference_slot() {
            return Err(FieldError::KindMismatch(name.to_string()));
        }
        unsafe { *(self.ptr.as_ptr().add(prop.offset) as *mut ObjectHandle) = value };
        Ok(())
    }

    /// Read a `Byte` field (enum-typed or plain)
    pub fn get_byte(&self, name: &str) -> Result<u8, FieldError> {
        let pref = self.field(name)?;
        let prop = self.registry.property(pref);
        if !matches!(prop.kind, PropertyKind::Byte(_)) {
            return Err(FieldError::KindMismatch(name.to_string()));
        }
        Ok(unsafe { *self.ptr.as_ptr().add(prop.offset) })
    }

    /// Write a `Byte` field (enum-typed or plain)
    pub fn set_byte(&mut self, name: &str, value: u8) -> Result<(), FieldError> {
        let pref = self.field(name)?;
        let prop = self.registry.property(pref);
        if !matches!(prop.kind, PropertyKind::Byte(_)) {
            return Err(FieldError::KindMismatch(name.to_string()));
        }
        unsafe { *self.ptr.as_ptr().add(prop.offset) = value };
        Ok(())
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        let size = self.size();
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), size) }
    }

    /// Save to a seekable sink as tagged binary records.
    pub fn save<W: Write + Seek>(&self, writer: &mut W, ctx: &SaveContext) -> SerialResult<()> {
        unsafe { serial::save_instance(self.registry, self.id, self.as_bytes(), writer, ctx) }
    }

    /// Save to a plain (non-seekable) sink through a scratch buffer.
    pub fn save_buffered<W: Write>(&self, writer: &mut W, ctx: &SaveContext) -> SerialResult<()> {
        unsafe {
            serial::save_instance_buffered(self.registry, self.id, self.as_bytes(), writer, ctx)
        }
    }

    /// Load tagged binary records over this instance.
    pub fn load<R: Read + Seek>(
        &mut self,
        reader: &mut R,
        ctx: &LoadContext<'_>,
    ) -> SerialResult<LoadStats> {
        let registry = self.registry;
        let id = self.id;
        unsafe { serial::load_instance(registry, id, self.as_bytes_mut(), reader, ctx) }
    }

    /// Convert to a structured JSON record (same diff rule as binary save).
    pub fn to_json(&self, ctx: &SaveContext) -> SerialResult<serde_json::Value> {
        unsafe { serial::json::instance_to_json(self.registry, self.id, self.as_bytes(), ctx) }
    }

    /// Apply a structured JSON record over this instance.
    pub fn from_json(
        &mut self,
        value: &serde_json::Value,
        ctx: &LoadContext<'_>,
    ) -> SerialResult<LoadStats> {
        let registry = self.registry;
        let id = self.id;
        unsafe { serial::json::apply_json(registry, id, self.as_bytes_mut(), value, ctx) }
    }

    /// Walk every reference slot, handing each to the visitor.
    pub fn visit_references<V: ReferenceVisitor>(&mut self, visitor: &mut V) {
        unsafe { crate::gc::visit_references(self.registry, self.id, self.ptr.as_ptr(), visitor) }
    }
}

impl Drop for Instance<'_> {
    fn drop(&mut self) {
        unsafe {
            ops::destroy_struct(self.registry, self.id, self.ptr.as_ptr());
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl std::fmt::Debug for Instance<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("struct", &self.struct_name())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::Property;
    use crate::registry::natives::NativeOpsRegistry;
    use crate::registry::StructBuilder;
    use crate::PropertyLinker;

    fn registry_with_item() -> (TypeRegistry, StructId) {
        let mut registry = TypeRegistry::new();
        let id = registry
            .register(
                StructBuilder::class("Item")
                    .prop(Property::new("Count", PropertyKind::Int32))
                    .prop(Property::new("Weight", PropertyKind::Double))
                    .prop(Property::new("Label", PropertyKind::Str))
                    .prop(Property::new("Owner", PropertyKind::Object))
                    .prop(Property::new("Charges", PropertyKind::Int32).array(3)),
            )
            .unwrap();
        let mut natives = NativeOpsRegistry::new();
        PropertyLinker::new()
            .link(&mut registry, &mut natives, id)
            .unwrap();
        (registry, id)
    }

    #[test]
    fn test_typed_field_access() {
        let (registry, id) = registry_with_item();
        let mut item = Instance::new(&registry, id).unwrap();

        assert_eq!(item.get_i32("Count").unwrap(), 0);
        item.set_i32("Count", 12).unwrap();
        assert_eq!(item.get_i32("Count").unwrap(), 12);

        item.set_f64("Weight", 2.5).unwrap();
        assert_eq!(item.get_f64("Weight").unwrap(), 2.5);

        assert_eq!(item.get_str("Label").unwrap(), "");
        item.set_str("Label", "torch").unwrap();
        assert_eq!(item.get_str("Label").unwrap(), "torch");

        assert!(item.get_handle("Owner").unwrap().is_null());
        item.set_handle("Owner", ObjectHandle::new(4)).unwrap();
        assert_eq!(item.get_handle("Owner").unwrap().raw(), 4);

        item.set_i32_at("Charges", 2, 9).unwrap();
        assert_eq!(item.get_i32_at("Charges", 2).unwrap(), 9);
        assert_eq!(item.get_i32_at("Charges", 0).unwrap(), 0);
    }

    #[test]
    fn test_field_errors() {
        let (registry, id) = registry_with_item();
        let mut item = Instance::new(&registry, id).unwrap();

        assert!(matches!(
            item.get_i32("Missing"),
            Err(FieldError::UnknownField(_))
        ));
        assert!(matches!(
            item.get_i32("Label"),
            Err(FieldError::KindMismatch(_))
        ));
        assert!(matches!(
            item.set_i32_at("Charges", 3, 1),
            Err(FieldError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_defaults_copied_from_class_default_object() {
        let mut registry = TypeRegistry::new();
        let id = registry
            .register(
                StructBuilder::class("Actor")
                    .prop(Property::new("Health", PropertyKind::Int32))
                    .prop(Property::new("Tag", PropertyKind::Str)),
            )
            .unwrap();
        let mut natives = NativeOpsRegistry::new();
        PropertyLinker::new()
            .link(&mut registry, &mut natives, id)
            .unwrap();

        let mut factory = ClassDefaultObjectFactory::new();
        // Zero-defaults here; the copy itself is what is under test.
        let actor = Instance::with_defaults(&registry, &factory, id).unwrap();
        assert_eq!(actor.get_i32("Health").unwrap(), 0);
        assert_eq!(actor.get_str("Tag").unwrap(), "");
        assert!(factory.contains(id));
        drop(actor);
        factory.teardown(&registry);
    }

    #[test]
    fn test_inherited_field_access() {
        let mut registry = TypeRegistry::new();
        let base = registry
            .register(StructBuilder::class("Base").prop(Property::new("A", PropertyKind::Int32)))
            .unwrap();
        let derived = registry
            .register(
                StructBuilder::class("Derived")
                    .with_super(base)
                    .prop(Property::new("B", PropertyKind::Float)),
            )
            .unwrap();
        let mut natives = NativeOpsRegistry::new();
        PropertyLinker::new()
            .link(&mut registry, &mut natives, derived)
            .unwrap();

        let mut d = Instance::new(&registry, derived).unwrap();
        d.set_i32("A", 3).unwrap();
        d.set_f32("B", 1.5).unwrap();
        assert_eq!(d.get_i32("A").unwrap(), 3);
        assert_eq!(d.get_f32("B").unwrap(), 1.5);
    }
}
