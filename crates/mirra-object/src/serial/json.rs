//! Structured (self-describing) container
//!
//! One JSON object per instance, keyed by property name; nested structs are
//! nested objects, sequences and static arrays are JSON arrays, enum bytes
//! are entry-name strings. No sentinel and no sizes: JSON is already
//! skippable, so unknown keys on load just don't resolve. The emission rule
//! is the binary writer's: diff against defaults unless atomic or forced.

use crate::property::kind::PropertyKind;
use crate::property::{ops, PropertyFlags};
use crate::registry::{StructFlags, StructId, TypeRegistry};
use crate::serial::{LoadContext, LoadStats, SaveContext};
use crate::{SerialError, SerialResult};
use serde_json::{json, Map, Value};

/// Convert one instance into a JSON record.
///
/// # Safety
///
/// `data` must hold a constructed instance of the (linked) struct, aligned
/// to its `min_alignment`; `ctx.defaults`, when present, likewise.
pub unsafe fn instance_to_json(
    registry: &TypeRegistry,
    id: StructId,
    data: &[u8],
    ctx: &SaveContext<'_>,
) -> SerialResult<Value> {
    let expected = registry.get(id).properties_size;
    if data.len() != expected {
        return Err(SerialError::BufferSize {
            owner: registry.get(id).name.clone(),
            expected,
            actual: data.len(),
        });
    }
    Ok(struct_to_json(
        registry,
        id,
        data.as_ptr(),
        ctx.defaults.map(|d| d.as_ptr()),
        ctx,
        true,
    ))
}

unsafe fn struct_to_json(
    registry: &TypeRegistry,
    id: StructId,
    data: *const u8,
    defaults: Option<*const u8>,
    ctx: &SaveContext<'_>,
    top_level: bool,
) -> Value {
    let st = registry.get(id);
    let full = ctx.force_full || defaults.is_none() || st.flags.contains(StructFlags::ATOMIC);
    let mut map = Map::new();

    for &pref in &st.property_link {
        let prop = registry.property(pref);
        if prop.flags.contains(PropertyFlags::TRANSIENT) {
            continue;
        }
        if prop.flags.contains(PropertyFlags::EDITOR_ONLY) && !ctx.editor_data {
            continue;
        }
        if top_level {
            if let Some(subset) = ctx.subset {
                if !subset.contains(&prop.name) {
                    continue;
                }
            }
        }

        if prop.array_dim > 1 {
            // Static arrays diff as a whole; a partial array record would
            // be ambiguous in a keyed container.
            if !full {
                if let Some(d) = defaults {
                    let identical = (0..prop.array_dim).all(|i| {
                        let off = prop.element_offset(i);
                        ops::values_identical(registry, &prop.kind, data.add(off), d.add(off))
                    });
                    if identical {
                        continue;
                    }
                }
            }
            let elems: Vec<Value> = (0..prop.array_dim)
                .map(|i| value_to_json(registry, &prop.kind, data.add(prop.element_offset(i)), ctx))
                .collect();
            map.insert(prop.name.clone(), Value::Array(elems));
        } else {
            let off = prop.offset;
            if !full {
                if let Some(d) = defaults {
                    if ops::values_identical(registry, &prop.kind, data.add(off), d.add(off)) {
                        continue;
                    }
                }
            }
            map.insert(
                prop.name.clone(),
                value_to_json(registry, &prop.kind, data.add(off), ctx),
            );
        }
    }
    Value::Object(map)
}

unsafe fn value_to_json(
    registry: &TypeRegistry,
    kind: &PropertyKind,
    ptr: *const u8,
    ctx: &SaveContext<'_>,
) -> Value {
    match kind {
        PropertyKind::Bool => Value::Bool(*ptr != 0),
        PropertyKind::Int8 => json!(*(ptr as *const i8)),
        PropertyKind::Int16 => json!(*(ptr as *const i16)),
        PropertyKind::Int32 => json!(*(ptr as *const i32)),
        PropertyKind::Int64 => json!(*(ptr as *const i64)),
        PropertyKind::UInt8 => json!(*ptr),
        PropertyKind::UInt16 => json!(*(ptr as *const u16)),
        PropertyKind::UInt32 => json!(*(ptr as *const u32)),
        PropertyKind::UInt64 => json!(*(ptr as *const u64)),
        PropertyKind::Float => float_value(f64::from(*(ptr as *const f32))),
        PropertyKind::Double => float_value(*(ptr as *const f64)),
        PropertyKind::Byte(enum_id) => {
            let raw = *ptr;
            if let Some(enum_id) = enum_id {
                if let Some(name) = registry.get_enum(*enum_id).name_of(raw as i64) {
                    return Value::String(name.to_string());
                }
            }
            json!(raw)
        }
        PropertyKind::Str | PropertyKind::Name => {
            Value::String((*(ptr as *const String)).clone())
        }
        PropertyKind::Object | PropertyKind::WeakObject => json!(*(ptr as *const u64)),
        PropertyKind::Struct(nested) => {
            // Nested structs are written in full; a keyed sub-record with
            // missing keys would shadow-load stale defaults.
            let nested_ctx = SaveContext {
                cooked: ctx.cooked,
                editor_data: ctx.editor_data,
                force_full: true,
                defaults: None,
                subset: None,
            };
            struct_to_json(registry, *nested, ptr, None, &nested_ctx, false)
        }
        PropertyKind::Seq(elem) => {
            let storage = &*(ptr as *const ops::SeqStorage);
            let stride = ops::elem_stride(registry, elem);
            let elems: Vec<Value> = (0..storage.len())
                .map(|i| value_to_json(registry, elem, storage.elem_ptr(stride, i), ctx))
                .collect();
            Value::Array(elems)
        }
    }
}

fn float_value(value: f64) -> Value {
    match serde_json::Number::from_f64(value) {
        Some(n) => Value::Number(n),
        // JSON has no NaN/inf representation; null round-trips as a skip.
        None => Value::Null,
    }
}

/// Apply a JSON record over a constructed instance.
///
/// Unknown keys, retyped values, and over-long arrays are skipped and
/// counted, mirroring the binary loader's tolerance.
///
/// # Safety
///
/// `data` must hold a constructed instance of the (linked) struct, aligned
/// to its `min_alignment`.
pub unsafe fn apply_json(
    registry: &TypeRegistry,
    id: StructId,
    data: &mut [u8],
    value: &Value,
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
    apply_struct(registry, id, data.as_mut_ptr(), value, ctx, &mut stats)?;
    Ok(stats)
}

unsafe fn apply_struct(
    registry: &TypeRegistry,
    id: StructId,
    data: *mut u8,
    value: &Value,
    ctx: &LoadContext<'_>,
    stats: &mut LoadStats,
) -> SerialResult<()> {
    let st = registry.get(id);
    let map = match value.as_object() {
        Some(map) => map,
        None => {
            return Err(SerialError::BadTag(format!(
                "expected a JSON object for `{}`",
                st.name
            )))
        }
    };

    for (key, entry) in map {
        let (pref, renamed) = match resolve_key(registry, id, key, ctx) {
            Some(hit) => hit,
            None => {
                log::debug!("`{}`: skipping unknown JSON key `{}`", st.name, key);
                stats.properties_skipped += 1;
                continue;
            }
        };
        let prop = registry.property(pref).clone();
        if prop.flags.contains(PropertyFlags::TRANSIENT) {
            stats.properties_skipped += 1;
            continue;
        }
        if prop.flags.contains(PropertyFlags::EDITOR_ONLY) && !ctx.editor_data {
            stats.properties_skipped += 1;
            continue;
        }

        let applied = if prop.array_dim > 1 {
            match entry.as_array() {
                Some(elems) if elems.len() as u32 <= prop.array_dim => {
                    let mut ok = true;
                    for (i, elem) in elems.iter().enumerate() {
                        let ptr = data.add(prop.element_offset(i as u32));
                        if !apply_value(registry, &prop.kind, ptr, elem, ctx, stats)? {
                            ok = false;
                        }
                    }
                    ok
                }
                Some(elems) => {
                    log::warn!(
                        "`{}`: array for `{}` has {} entries, dim is {}",
                        st.name,
                        key,
                        elems.len(),
                        prop.array_dim
                    );
                    false
                }
                None => false,
            }
        } else {
            apply_value(registry, &prop.kind, data.add(prop.offset), entry, ctx, stats)?
        };

        if applied {
            stats.properties_loaded += 1;
            if renamed {
                stats.tags_converted += 1;
            }
        } else {
            log::warn!("`{}`: value for `{}` has the wrong shape", st.name, key);
            stats.properties_skipped += 1;
        }
    }
    Ok(())
}

fn resolve_key(
    registry: &TypeRegistry,
    id: StructId,
    key: &str,
    ctx: &LoadContext<'_>,
) -> Option<(crate::PropertyRef, bool)> {
    if let Some(pref) = registry.find_property(id, key) {
        return Some((pref, false));
    }
    if !ctx.cooked {
        if let Some(redirects) = ctx.redirects {
            let owners = registry.super_chain(id).map(|s| registry.get(s).name.as_str());
            if let Some(new_name) = redirects.property_in_chain(owners, key) {
                if let Some(pref) = registry.find_property(id, new_name) {
                    return Some((pref, true));
                }
            }
        }
    }
    None
}

/// Apply one JSON value; `Ok(false)` means a shape mismatch (caller counts
/// the skip).
unsafe fn apply_value(
    registry: &TypeRegistry,
    kind: &PropertyKind,
    ptr: *mut u8,
    value: &Value,
    ctx: &LoadContext<'_>,
    stats: &mut LoadStats,
) -> SerialResult<bool> {
    let applied = match kind {
        PropertyKind::Bool => match value.as_bool() {
            Some(b) => {
                *ptr = b as u8;
                true
            }
            None => false,
        },
        PropertyKind::Int8 => write_int(value, |v| *(ptr as *mut i8) = v as i8),
        PropertyKind::Int16 => write_int(value, |v| *(ptr as *mut i16) = v as i16),
        PropertyKind::Int32 => write_int(value, |v| *(ptr as *mut i32) = v as i32),
        PropertyKind::Int64 => write_int(value, |v| *(ptr as *mut i64) = v),
        PropertyKind::UInt8 => write_uint(value, |v| *ptr = v as u8),
        PropertyKind::UInt16 => write_uint(value, |v| *(ptr as *mut u16) = v as u16),
        PropertyKind::UInt32 => write_uint(value, |v| *(ptr as *mut u32) = v as u32),
        PropertyKind::UInt64 => write_uint(value, |v| *(ptr as *mut u64) = v),
        PropertyKind::Float => match value.as_f64() {
            Some(v) => {
                *(ptr as *mut f32) = v as f32;
                true
            }
            None => false,
        },
        PropertyKind::Double => match value.as_f64() {
            Some(v) => {
                *(ptr as *mut f64) = v;
                true
            }
            None => false,
        },
        PropertyKind::Byte(enum_id) => match (value, enum_id) {
            (Value::String(entry), Some(enum_id)) => {
                match registry.get_enum(*enum_id).value_of(entry) {
                    Some(v) => {
                        *ptr = v as u8;
                        true
                    }
                    None => {
                        log::warn!(
                            "unknown entry `{}` for enum `{}`",
                            entry,
                            registry.get_enum(*enum_id).name
                        );
                        false
                    }
                }
            }
            (other, _) => write_uint(other, |v| *ptr = v as u8),
        },
        PropertyKind::Str | PropertyKind::Name => match value.as_str() {
            Some(s) => {
                let slot = &mut *(ptr as *mut String);
                slot.clear();
                slot.push_str(s);
                true
            }
            None => false,
        },
        PropertyKind::Object | PropertyKind::WeakObject => {
            write_uint(value, |v| *(ptr as *mut u64) = v)
        }
        PropertyKind::Struct(nested) => {
            if value.is_object() {
                apply_struct(registry, *nested, ptr, value, ctx, stats)?;
                true
            } else {
                false
            }
        }
        PropertyKind::Seq(elem) => match value.as_array() {
            Some(elems) => {
                let storage = ptr as *mut ops::SeqStorage;
                ops::seq_reset(registry, elem, storage, elems.len());
                let stride = ops::elem_stride(registry, elem);
                let mut ok = true;
                for (i, entry) in elems.iter().enumerate() {
                    let elem_ptr = (*storage).elem_ptr(stride, i);
                    if !apply_value(registry, elem, elem_ptr, entry, ctx, stats)? {
                        ok = false;
                    }
                }
                ok
            }
            None => false,
        },
    };
    Ok(applied)
}

fn write_int(value: &Value, write: impl FnOnce(i64)) -> bool {
    match value.as_i64() {
        Some(v) => {
            write(v);
            true
        }
        None => false,
    }
}

fn write_uint(value: &Value, write: impl FnOnce(u64)) -> bool {
    match value.as_u64() {
        Some(v) => {
            write(v);
            true
        }
        None => false,
    }
}
