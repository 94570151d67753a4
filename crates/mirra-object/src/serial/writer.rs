//! Tagged save
//!
//! Two passes per record without buffering the body: the header goes out
//! with a zero size field, the value body is written, then the writer seeks
//! back and patches the real size in. Sinks that cannot seek go through
//! [`save_instance_buffered`], which assembles the stream in memory first.

use crate::property::kind::PropertyKind;
use crate::property::{ops, PropertyFlags};
use crate::registry::{StructFlags, StructId, TypeRegistry};
use crate::serial::tag::{PropertyTag, TagAux, WireType};
use crate::serial::SaveContext;
use crate::{SerialError, SerialResult};
use std::io::{Cursor, Seek, SeekFrom, Write};

/// Save one instance as a sentinel-terminated tagged stream.
///
/// Properties identical to `ctx.defaults` are omitted unless the struct is
/// atomic or the context forces a full write. Transient properties are
/// never written; editor-only properties only with `ctx.editor_data`.
///
/// # Safety
///
/// `data` must hold a constructed instance of the (linked) struct, aligned
/// to its `min_alignment`; `ctx.defaults`, when present, likewise.
pub unsafe fn save_instance<W: Write + Seek>(
    registry: &TypeRegistry,
    id: StructId,
    data: &[u8],
    writer: &mut W,
    ctx: &SaveContext<'_>,
) -> SerialResult<()> {
    check_buffer(registry, id, data.len())?;
    if let Some(defaults) = ctx.defaults {
        check_buffer(registry, id, defaults.len())?;
    }
    write_tagged_body(
        registry,
        id,
        data.as_ptr(),
        ctx.defaults.map(|d| d.as_ptr()),
        writer,
        ctx,
        true,
    )
}

/// [`save_instance`] for sinks without `Seek`: the stream is assembled in a
/// scratch buffer and written out in one piece.
///
/// # Safety
///
/// Same contract as [`save_instance`].
pub unsafe fn save_instance_buffered<W: Write>(
    registry: &TypeRegistry,
    id: StructId,
    data: &[u8],
    writer: &mut W,
    ctx: &SaveContext<'_>,
) -> SerialResult<()> {
    let mut scratch = Cursor::new(Vec::new());
    save_instance(registry, id, data, &mut scratch, ctx)?;
    writer.write_all(&scratch.into_inner())?;
    Ok(())
}

fn check_buffer(registry: &TypeRegistry, id: StructId, actual: usize) -> SerialResult<()> {
    let expected = registry.get(id).properties_size;
    if actual != expected {
        return Err(SerialError::BufferSize {
            owner: registry.get(id).name.clone(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Write all eligible records of one struct region, then the sentinel.
///
/// `top_level` gates the subset filter; nested struct bodies always write
/// their full eligible set.
unsafe fn write_tagged_body<W: Write + Seek>(
    registry: &TypeRegistry,
    id: StructId,
    data: *const u8,
    defaults: Option<*const u8>,
    writer: &mut W,
    ctx: &SaveContext<'_>,
    top_level: bool,
) -> SerialResult<()> {
    let st = registry.get(id);
    let full = ctx.force_full || defaults.is_none() || st.flags.contains(StructFlags::ATOMIC);

    for &pref in &st.property_link {
        let prop = registry.property(pref);
        if prop.flags.contains(PropertyFlags::TRANSIENT) {
            continue;
        }
        let editor_only = prop.flags.contains(PropertyFlags::EDITOR_ONLY);
        if editor_only && !ctx.editor_data {
            continue;
        }
        if top_level {
            if let Some(subset) = ctx.subset {
                if !subset.contains(&prop.name) {
                    continue;
                }
            }
        }

        for index in 0..prop.array_dim {
            let offset = prop.element_offset(index);
            let value = data.add(offset);
            let default_value = defaults.map(|d| d.add(offset));
            if !full {
                if let Some(dv) = default_value {
                    if ops::values_identical(registry, &prop.kind, value, dv) {
                        continue;
                    }
                }
            }

            let tag = PropertyTag {
                name: prop.name.clone(),
                wire_type: WireType::for_kind(&prop.kind),
                size: 0,
                array_index: (prop.array_dim > 1).then_some(index),
                aux: TagAux::for_kind(registry, &prop.kind),
                guid: if ctx.cooked { None } else { prop.guid },
                editor_only,
            };

            let tag_start = writer.stream_position()?;
            tag.encode(writer)?;
            let body_start = writer.stream_position()?;
            write_value(registry, &prop.kind, value, default_value, writer, ctx)?;
            let body_end = writer.stream_position()?;

            let body_size = body_end - body_start;
            let size = u32::try_from(body_size).map_err(|_| SerialError::StreamCorruption {
                property: prop.name.clone(),
                declared: u32::MAX as u64,
                consumed: body_size,
            })?;
            writer.seek(SeekFrom::Start(tag_start + tag.size_field_offset()))?;
            writer.write_all(&size.to_le_bytes())?;
            writer.seek(SeekFrom::Start(body_end))?;
        }
    }

    PropertyTag::encode_sentinel(writer)
}

/// Write one value body.
unsafe fn write_value<W: Write + Seek>(
    registry: &TypeRegistry,
    kind: &PropertyKind,
    value: *const u8,
    default_value: Option<*const u8>,
    writer: &mut W,
    ctx: &SaveContext<'_>,
) -> SerialResult<()> {
    match kind {
        PropertyKind::Str | PropertyKind::Name => {
            let s = &*(value as *const String);
            let bytes = s.as_bytes();
            writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
            writer.write_all(bytes)?;
        }
        PropertyKind::Struct(nested) => {
            // Nested struct bodies are tagged streams in their own right,
            // diffed against the corresponding defaults sub-region.
            write_tagged_body(registry, *nested, value, default_value, writer, ctx, false)?;
        }
        PropertyKind::Seq(elem) => {
            let storage = &*(value as *const ops::SeqStorage);
            let stride = ops::elem_stride(registry, elem);
            writer.write_all(&(storage.len() as u32).to_le_bytes())?;
            for i in 0..storage.len() {
                // Elements have no per-element defaults; structs inside a
                // sequence are written in full.
                write_value(registry, elem, storage.elem_ptr(stride, i), None, writer, ctx)?;
            }
        }
        PropertyKind::Bool | PropertyKind::Int8 | PropertyKind::UInt8 | PropertyKind::Byte(_) => {
            writer.write_all(&[*value])?;
        }
        PropertyKind::Int16 => writer.write_all(&(*(value as *const i16)).to_le_bytes())?,
        PropertyKind::UInt16 => writer.write_all(&(*(value as *const u16)).to_le_bytes())?,
        PropertyKind::Int32 => writer.write_all(&(*(value as *const i32)).to_le_bytes())?,
        PropertyKind::UInt32 => writer.write_all(&(*(value as *const u32)).to_le_bytes())?,
        PropertyKind::Int64 => writer.write_all(&(*(value as *const i64)).to_le_bytes())?,
        PropertyKind::UInt64
        | PropertyKind::Object
        | PropertyKind::WeakObject => writer.write_all(&(*(value as *const u64)).to_le_bytes())?,
        PropertyKind::Float => writer.write_all(&(*(value as *const f32)).to_le_bytes())?,
        PropertyKind::Double => writer.write_all(&(*(value as *const f64)).to_le_bytes())?,
    }
    Ok(())
}
