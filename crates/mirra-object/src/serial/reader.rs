//! Tagged load
//!
//! Loading never trusts the stream to match the current schema. Each record
//! resolves against the instance's property chain through, in order: the
//! forward cursor (in-order streams hit this every time), the guid rename
//! hint, the redirect table, and finally a wraparound name scan. Anything
//! that still fails to resolve, or resolves to an incompatible target, is
//! skipped by its recorded size and counted; schema drift degrades, it
//! does not error. Only stream bookkeeping violations abort the instance.

use crate::property::kind::PropertyKind;
use crate::property::{ops, PropertyFlags};
use crate::registry::{StructId, TypeRegistry};
use crate::serial::tag::{PropertyTag, TagAux, WireType};
use crate::serial::{LoadContext, LoadStats};
use crate::{SerialError, SerialResult};
use std::io::{Read, Seek, SeekFrom};

/// Load a sentinel-terminated tagged stream over a constructed instance.
///
/// Returns degradation counters; see [`LoadStats`].
///
/// # Safety
///
/// `data` must hold a constructed instance of the (linked) struct, aligned
/// to its `min_alignment`.
pub unsafe fn load_instance<R: Read + Seek>(
    registry: &TypeRegistry,
    id: StructId,
    data: &mut [u8],
    reader: &mut R,
    ctx: &LoadContext<'_>,
) -> SerialResult<LoadStats> {
    let expected = registry.get(id).properties_size;
    if data.len() != expected {
        return Err(SerialError::BufferSize {
            owner: registry.get(id).name.clone(),
            expected,
            actual: data.len(),
        });
    }
    let mut stats = LoadStats::default();
    load_tagged_body(registry, id, data.as_mut_ptr(), reader, ctx, &mut stats)?;
    Ok(stats)
}

unsafe fn load_tagged_body<R: Read + Seek>(
    registry: &TypeRegistry,
    id: StructId,
    data: *mut u8,
    reader: &mut R,
    ctx: &LoadContext<'_>,
    stats: &mut LoadStats,
) -> SerialResult<()> {
    let st = registry.get(id);
    let chain = &st.property_link;
    let mut cursor: usize = 0;

    while let Some(tag) = PropertyTag::decode(reader)? {
        let resolved = resolve_tag(registry, id, chain, cursor, &tag, ctx);
        let (pos, renamed) = match resolved {
            Some(hit) => hit,
            None => {
                log::debug!(
                    "`{}`: skipping unresolved property `{}` ({} bytes)",
                    st.name,
                    tag.name,
                    tag.size
                );
                skip_body(reader, &tag)?;
                stats.properties_skipped += 1;
                continue;
            }
        };
        // In-order streams keep hitting the fast path; repeated tags of a
        // static array stay on the same property.
        cursor = if tag.array_index.is_some() { pos } else { pos + 1 };

        let prop = registry.property(chain[pos]);

        if prop.flags.contains(PropertyFlags::TRANSIENT) {
            log::debug!("`{}`: property `{}` is now transient", st.name, tag.name);
            skip_body(reader, &tag)?;
            stats.properties_skipped += 1;
            continue;
        }
        if tag.editor_only && !ctx.editor_data {
            log::trace!("`{}`: skipping editor-only `{}`", st.name, tag.name);
            skip_body(reader, &tag)?;
            stats.properties_skipped += 1;
            continue;
        }

        let converted = match tag_compatible(registry, &tag, &prop.kind, ctx) {
            Some(converted) => converted,
            None => {
                log::warn!(
                    "`{}`: property `{}` changed type, skipping value",
                    st.name,
                    tag.name
                );
                skip_body(reader, &tag)?;
                stats.properties_skipped += 1;
                continue;
            }
        };

        let index = tag.array_index.unwrap_or(0);
        if index >= prop.array_dim {
            log::warn!(
                "`{}`: array index {} out of range for `{}` (dim {})",
                st.name,
                index,
                tag.name,
                prop.array_dim
            );
            skip_body(reader, &tag)?;
            stats.properties_skipped += 1;
            continue;
        }

        let body_start = reader.stream_position()?;
        read_value(
            registry,
            &prop.kind,
            data.add(prop.element_offset(index)),
            reader,
            ctx,
            stats,
            &tag.name,
            tag.size as u64,
        )?;
        let consumed = reader.stream_position()? - body_start;
        if consumed != tag.size as u64 {
            // The stream and this build disagree about the value layout;
            // nothing after this point can be trusted for this instance.
            return Err(SerialError::StreamCorruption {
                property: tag.name,
                declared: tag.size as u64,
                consumed,
            });
        }

        stats.properties_loaded += 1;
        if renamed || converted {
            stats.tags_converted += 1;
        }
    }
    Ok(())
}

/// Resolve a tag to a position in the property chain.
///
/// Returns the chain position and whether resolution went through a rename
/// (guid hint or redirect).
fn resolve_tag(
    registry: &TypeRegistry,
    id: StructId,
    chain: &[crate::PropertyRef],
    cursor: usize,
    tag: &PropertyTag,
    ctx: &LoadContext<'_>,
) -> Option<(usize, bool)> {
    // Fast path: the stream is in declaration order.
    if cursor < chain.len() && registry.property(chain[cursor]).name == tag.name {
        return Some((cursor, false));
    }

    if !ctx.cooked {
        // Guid hint: survives any number of renames.
        if let Some(guid) = &tag.guid {
            if let Some(pos) = chain
                .iter()
                .position(|&r| registry.property(r).guid.as_ref() == Some(guid))
            {
                let renamed = registry.property(chain[pos]).name != tag.name;
                return Some((pos, renamed));
            }
        }
        // Redirect table, owning-struct chain nearest-first.
        if let Some(redirects) = ctx.redirects {
            let owners = registry.super_chain(id).map(|s| registry.get(s).name.as_str());
            if let Some(new_name) = redirects.property_in_chain(owners, &tag.name) {
                if let Some(pos) = chain
                    .iter()
                    .position(|&r| registry.property(r).name == new_name)
                {
                    return Some((pos, true));
                }
            }
        }
    }

    // Wraparound scan: out-of-order but otherwise matching streams.
    let len = chain.len();
    for step in 0..len {
        let pos = (cursor + step) % len;
        if registry.property(chain[pos]).name == tag.name {
            return Some((pos, false));
        }
    }
    None
}

/// Whether a tag's wire description can load into the property's kind.
///
/// `Some(converted)` on success; `None` means the value cannot be applied
/// and must be skipped.
fn tag_compatible(
    registry: &TypeRegistry,
    tag: &PropertyTag,
    kind: &PropertyKind,
    ctx: &LoadContext<'_>,
) -> Option<bool> {
    if tag.wire_type != WireType::for_kind(kind) {
        return None;
    }
    aux_compatible(registry, &tag.aux, kind, ctx)
}

fn aux_compatible(
    registry: &TypeRegistry,
    aux: &TagAux,
    kind: &PropertyKind,
    ctx: &LoadContext<'_>,
) -> Option<bool> {
    match (aux, kind) {
        (TagAux::Struct(stored), PropertyKind::Struct(id)) => {
            let current = &registry.get(*id).name;
            if stored == current {
                return Some(false);
            }
            if !ctx.cooked {
                if let Some(redirects) = ctx.redirects {
                    if redirects.struct_name(stored) == Some(current) {
                        return Some(true);
                    }
                }
            }
            None
        }
        (TagAux::Enum(stored), PropertyKind::Byte(id)) => {
            let current = id.map(|e| registry.get_enum(e).name.as_str());
            match (stored.as_deref(), current) {
                (None, None) => Some(false),
                (Some(a), Some(b)) if a == b => Some(false),
                // Plain byte and enum byte share storage; drifting between
                // them is a counted conversion.
                (None, Some(_)) | (Some(_), None) => Some(true),
                (Some(old), Some(new)) => {
                    if !ctx.cooked {
                        if let Some(redirects) = ctx.redirects {
                            if redirects.enum_name(old) == Some(new) {
                                return Some(true);
                            }
                        }
                    }
                    None
                }
            }
        }
        (TagAux::Seq { elem, elem_aux }, PropertyKind::Seq(elem_kind)) => {
            if *elem != WireType::for_kind(elem_kind) {
                return None;
            }
            aux_compatible(registry, elem_aux, elem_kind, ctx)
        }
        (TagAux::None, _) => Some(false),
        _ => None,
    }
}

fn skip_body<R: Read + Seek>(reader: &mut R, tag: &PropertyTag) -> SerialResult<()> {
    reader.seek(SeekFrom::Current(tag.size as i64))?;
    Ok(())
}

/// Smallest possible on-wire footprint of one value of `kind`. Used to
/// reject length prefixes that could not possibly fit the declared body.
fn min_wire_size(kind: &PropertyKind) -> u64 {
    match kind {
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
        // u32 length prefix
        PropertyKind::Str | PropertyKind::Name | PropertyKind::Seq(_) => 4,
        // empty sentinel
        PropertyKind::Struct(_) => 3,
    }
}

#[allow(clippy::too_many_arguments)]
unsafe fn read_value<R: Read + Seek>(
    registry: &TypeRegistry,
    kind: &PropertyKind,
    ptr: *mut u8,
    reader: &mut R,
    ctx: &LoadContext<'_>,
    stats: &mut LoadStats,
    name: &str,
    limit: u64,
) -> SerialResult<()> {
    match kind {
        PropertyKind::Str | PropertyKind::Name => {
            let mut len = [0u8; 4];
            reader.read_exact(&mut len)?;
            let len = u32::from_le_bytes(len) as u64;
            // A length the declared body cannot hold is corruption, not a
            // request to allocate.
            if len > limit.saturating_sub(4) {
                return Err(SerialError::StreamCorruption {
                    property: name.to_owned(),
                    declared: limit,
                    consumed: 4 + len,
                });
            }
            let mut bytes = Vec::new();
            reader.by_ref().take(len).read_to_end(&mut bytes)?;
            if bytes.len() as u64 != len {
                return Err(SerialError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            let text = String::from_utf8(bytes)
                .map_err(|e| SerialError::BadTag(format!("non-UTF-8 string value: {e}")))?;
            let slot = &mut *(ptr as *mut String);
            slot.clear();
            slot.push_str(&text);
        }
        PropertyKind::Struct(nested) => {
            load_tagged_body(registry, *nested, ptr, reader, ctx, stats)?;
        }
        PropertyKind::Seq(elem) => {
            let mut len = [0u8; 4];
            reader.read_exact(&mut len)?;
            let len = u32::from_le_bytes(len) as usize;
            let need = (len as u64)
                .checked_mul(min_wire_size(elem))
                .and_then(|b| b.checked_add(4));
            match need {
                Some(need) if need <= limit => {}
                _ => {
                    return Err(SerialError::StreamCorruption {
                        property: name.to_owned(),
                        declared: limit,
                        consumed: need.unwrap_or(u64::MAX),
                    });
                }
            }
            let storage = ptr as *mut ops::SeqStorage;
            ops::seq_reset(registry, elem, storage, len);
            let stride = ops::elem_stride(registry, elem);
            let elem_limit = limit - 4;
            for i in 0..len {
                read_value(
                    registry,
                    elem,
                    (*storage).elem_ptr(stride, i),
                    reader,
                    ctx,
                    stats,
                    name,
                    elem_limit,
                )?;
            }
        }
        PropertyKind::Bool | PropertyKind::Int8 | PropertyKind::UInt8 | PropertyKind::Byte(_) => {
            let mut buf = [0u8; 1];
            reader.read_exact(&mut buf)?;
            *ptr = buf[0];
        }
        PropertyKind::Int16 | PropertyKind::UInt16 => {
            let mut buf = [0u8; 2];
            reader.read_exact(&mut buf)?;
            (ptr as *mut u16).write(u16::from_le_bytes(buf));
        }
        PropertyKind::Int32 | PropertyKind::UInt32 | PropertyKind::Float => {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf)?;
            (ptr as *mut u32).write(u32::from_le_bytes(buf));
        }
        PropertyKind::Int64
        | PropertyKind::UInt64
        | PropertyKind::Double
        | PropertyKind::Object
        | PropertyKind::WeakObject => {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            (ptr as *mut u64).write(u64::from_le_bytes(buf));
        }
    }
    Ok(())
}
