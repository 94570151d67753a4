//! Reflection-driven object model.
//!
//! Types (structs and classes) are described by metadata registered at
//! startup; field layout, garbage-collection reference sets, and the on-disk
//! representation are all derived from that metadata rather than written per
//! type. The pieces:
//!
//! - [`registry`]: the type arena (struct/class/enum descriptors addressed
//!   by stable handles), the deferred native-ops table, and the rename
//!   redirect table.
//! - [`linker`]: computes byte offsets and the four derived traversal
//!   chains over a struct's properties.
//! - [`layout`]: instance initialize/destroy/copy over raw buffers.
//! - [`gc`]: reference-chain traversal for a garbage collector.
//! - [`serial`]: versioned, schema-tolerant tagged save/load.
//! - [`cdo`]: the class-default-object factory.
//! - [`instance`]: the owned-buffer facade composing all of the above.

pub mod cdo;
pub mod gc;
pub mod instance;
pub mod layout;
pub mod linker;
pub mod property;
pub mod registry;
pub mod serial;

pub use cdo::ClassDefaultObjectFactory;
pub use gc::{visit_references, ReferenceVisitor};
pub use instance::{FieldError, Instance};
pub use layout::StructLayout;
pub use linker::{LinkOptions, PropertyLinker};
pub use property::kind::PropertyKind;
pub use property::{ObjectHandle, Property, PropertyFlags, PropertyGuid, PropertyRef};
pub use registry::natives::{NativeOps, NativeOpsRegistry};
pub use registry::redirects::RedirectTable;
pub use registry::{
    ClassFlags, Enum, EnumId, Struct, StructBuilder, StructFlags, StructId, TypeRegistry,
};
pub use serial::{
    load_instance, save_instance, save_instance_buffered, LoadContext, LoadStats, SaveContext,
};

/// Fatal type-registration errors.
///
/// Everything here is raised while a type is being registered or linked,
/// long before instances exist. A type that fails to link is unusable.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// A property landed outside its struct's computed size
    #[error(
        "layout invariant violated in `{owner}`: property `{property}` at offset {offset} \
         (+{size} bytes) exceeds struct size {struct_size}"
    )]
    LayoutError {
        owner: String,
        property: String,
        offset: usize,
        size: usize,
        struct_size: usize,
    },

    /// The re-entrant link loop never stabilized
    #[error("property linking for `{0}` did not stabilize after {1} restarts")]
    RetryExhausted(String, usize),

    /// A struct layout recursed into itself (directly or through an array)
    #[error("unresolved self-recursive layout through `{0}`")]
    RecursiveStruct(String),

    /// A struct declared a native binding that was never registered
    #[error("no native ops registered under `{0}`")]
    UnknownNativeOps(String),

    /// Attempted to instantiate or lay out a struct before linking it
    #[error("struct `{0}` is not linked")]
    Unlinked(String),

    /// Two types registered under the same name
    #[error("duplicate type name `{0}`")]
    DuplicateType(String),
}

/// Result alias for type-registration operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// Per-instance serialization errors.
///
/// Schema drift (renamed, removed, retyped fields) is *not* an error; those
/// values are skipped and counted in [`LoadStats`]. Errors here abort the
/// remaining tags of one instance only; the process carries on.
#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    /// Underlying stream failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A tag could not be decoded at all
    #[error("malformed property tag: {0}")]
    BadTag(String),

    /// A tag carried a wire type this build does not know
    #[error("unknown wire type: {0:#04x}")]
    UnknownWireType(u8),

    /// Declared size and actually-consumed bytes disagree
    #[error(
        "stream bookkeeping mismatch for property `{property}`: declared {declared} bytes, \
         consumed {consumed}"
    )]
    StreamCorruption {
        property: String,
        declared: u64,
        consumed: u64,
    },

    /// The instance buffer does not match the struct's layout
    #[error("instance buffer is {actual} bytes, struct `{owner}` needs {expected}")]
    BufferSize {
        owner: String,
        expected: usize,
        actual: usize,
    },
}

/// Result alias for serialization operations.
pub type SerialResult<T> = Result<T, SerialError>;

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
