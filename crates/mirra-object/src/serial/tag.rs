//! Property tags on the wire
//!
//! Binary layout of one record header, little-endian throughout:
//!
//! ```text
//! name        u16 length + UTF-8 bytes
//! wire_type   u8   (0 together with an empty name is the sentinel)
//! flags       u8   (guid / array-index / editor-only presence bits)
//! size        u32  byte size of the value body that follows the header
//! array_index u32  present iff flags has HAS_ARRAY_INDEX
//! aux         wire-type-specific (struct name, enum name, seq element)
//! guid        16 bytes, present iff flags has HAS_GUID
//! ```
//!
//! The size field is written as zero first and patched after the value body
//! lands, so the writer never needs to know a body's size up front.

use crate::property::kind::PropertyKind;
use crate::registry::TypeRegistry;
use crate::{PropertyGuid, SerialError, SerialResult};
use std::io::{Read, Write};

const FLAG_HAS_GUID: u8 = 1 << 0;
const FLAG_HAS_ARRAY_INDEX: u8 = 1 << 1;
const FLAG_EDITOR_ONLY: u8 = 1 << 2;

/// On-wire value type of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireType {
    Bool = 1,
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    Int64 = 5,
    UInt8 = 6,
    UInt16 = 7,
    UInt32 = 8,
    UInt64 = 9,
    Float = 10,
    Double = 11,
    Byte = 12,
    Str = 13,
    Name = 14,
    Object = 15,
    WeakObject = 16,
    Struct = 17,
    Seq = 18,
}

impl WireType {
    /// Decode a wire-type byte (0 is the sentinel, not a wire type).
    pub fn from_u8(value: u8) -> Option<WireType> {
        Some(match value {
            1 => WireType::Bool,
            2 => WireType::Int8,
            3 => WireType::Int16,
            4 => WireType::Int32,
            5 => WireType::Int64,
            6 => WireType::UInt8,
            7 => WireType::UInt16,
            8 => WireType::UInt32,
            9 => WireType::UInt64,
            10 => WireType::Float,
            11 => WireType::Double,
            12 => WireType::Byte,
            13 => WireType::Str,
            14 => WireType::Name,
            15 => WireType::Object,
            16 => WireType::WeakObject,
            17 => WireType::Struct,
            18 => WireType::Seq,
            _ => return None,
        })
    }

    /// The wire type a property kind serializes as.
    pub fn for_kind(kind: &PropertyKind) -> WireType {
        match kind {
            PropertyKind::Bool => WireType::Bool,
            PropertyKind::Int8 => WireType::Int8,
            PropertyKind::Int16 => WireType::Int16,
            PropertyKind::Int32 => WireType::Int32,
            PropertyKind::Int64 => WireType::Int64,
            PropertyKind::UInt8 => WireType::UInt8,
            PropertyKind::UInt16 => WireType::UInt16,
            PropertyKind::UInt32 => WireType::UInt32,
            PropertyKind::UInt64 => WireType::UInt64,
            PropertyKind::Float => WireType::Float,
            PropertyKind::Double => WireType::Double,
            PropertyKind::Byte(_) => WireType::Byte,
            PropertyKind::Str => WireType::Str,
            PropertyKind::Name => WireType::Name,
            PropertyKind::Object => WireType::Object,
            PropertyKind::WeakObject => WireType::WeakObject,
            PropertyKind::Struct(_) => WireType::Struct,
            PropertyKind::Seq(_) => WireType::Seq,
        }
    }
}

/// Type-specific extra data carried by a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagAux {
    None,
    /// Struct records carry the struct's name
    Struct(String),
    /// Byte records carry the enum name, if any
    Enum(Option<String>),
    /// Seq records carry the element's wire description
    Seq {
        elem: WireType,
        elem_aux: Box<TagAux>,
    },
}

impl TagAux {
    /// The aux a property kind serializes with.
    pub fn for_kind(registry: &TypeRegistry, kind: &PropertyKind) -> TagAux {
        match kind {
            PropertyKind::Struct(id) => TagAux::Struct(registry.get(*id).name.clone()),
            PropertyKind::Byte(Some(id)) => {
                TagAux::Enum(Some(registry.get_enum(*id).name.clone()))
            }
            PropertyKind::Byte(None) => TagAux::Enum(None),
            PropertyKind::Seq(elem) => TagAux::Seq {
                elem: WireType::for_kind(elem),
                elem_aux: Box::new(TagAux::for_kind(registry, elem)),
            },
            _ => TagAux::None,
        }
    }

    fn encode<W: Write>(&self, writer: &mut W) -> SerialResult<()> {
        match self {
            TagAux::None => {}
            TagAux::Struct(name) => write_str16(writer, name)?,
            TagAux::Enum(name) => write_str16(writer, name.as_deref().unwrap_or(""))?,
            TagAux::Seq { elem, elem_aux } => {
                writer.write_all(&[*elem as u8])?;
                elem_aux.encode(writer)?;
            }
        }
        Ok(())
    }

    fn decode<R: Read>(reader: &mut R, wire_type: WireType) -> SerialResult<TagAux> {
        Ok(match wire_type {
            WireType::Struct => TagAux::Struct(read_str16(reader)?),
            WireType::Byte => {
                let name = read_str16(reader)?;
                TagAux::Enum(if name.is_empty() { None } else { Some(name) })
            }
            WireType::Seq => {
                let mut byte = [0u8; 1];
                reader.read_exact(&mut byte)?;
                let elem =
                    WireType::from_u8(byte[0]).ok_or(SerialError::UnknownWireType(byte[0]))?;
                let elem_aux = Box::new(TagAux::decode(reader, elem)?);
                TagAux::Seq { elem, elem_aux }
            }
            _ => TagAux::None,
        })
    }
}

/// One decoded record header.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyTag {
    pub name: String,
    pub wire_type: WireType,
    /// Byte size of the value body (everything after the header)
    pub size: u32,
    /// Static-array element index; absent for plain (dim 1) properties
    pub array_index: Option<u32>,
    pub aux: TagAux,
    /// Stable rename hint, carried only in non-cooked saves
    pub guid: Option<PropertyGuid>,
    pub editor_only: bool,
}

impl PropertyTag {
    /// Encode the header. `size` is written as-is; writers emit zero and
    /// patch it at [`Self::size_field_offset`] once the body is written.
    pub fn encode<W: Write>(&self, writer: &mut W) -> SerialResult<()> {
        write_str16(writer, &self.name)?;
        writer.write_all(&[self.wire_type as u8])?;

        let mut flags = 0u8;
        if self.guid.is_some() {
            flags |= FLAG_HAS_GUID;
        }
        if self.array_index.is_some() {
            flags |= FLAG_HAS_ARRAY_INDEX;
        }
        if self.editor_only {
            flags |= FLAG_EDITOR_ONLY;
        }
        writer.write_all(&[flags])?;
        writer.write_all(&self.size.to_le_bytes())?;
        if let Some(index) = self.array_index {
            writer.write_all(&index.to_le_bytes())?;
        }
        self.aux.encode(writer)?;
        if let Some(guid) = &self.guid {
            writer.write_all(guid)?;
        }
        Ok(())
    }

    /// Byte offset of the size field from the start of the encoded header.
    pub fn size_field_offset(&self) -> u64 {
        2 + self.name.len() as u64 + 1 + 1
    }

    /// Decode a header; `Ok(None)` is the stream sentinel.
    pub fn decode<R: Read>(reader: &mut R) -> SerialResult<Option<PropertyTag>> {
        let name = read_str16(reader)?;
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        if byte[0] == 0 {
            if name.is_empty() {
                return Ok(None);
            }
            return Err(SerialError::BadTag(format!(
                "named record `{name}` with sentinel wire type"
            )));
        }
        let wire_type =
            WireType::from_u8(byte[0]).ok_or(SerialError::UnknownWireType(byte[0]))?;

        let mut flags = [0u8; 1];
        reader.read_exact(&mut flags)?;
        let flags = flags[0];

        let mut size = [0u8; 4];
        reader.read_exact(&mut size)?;
        let size = u32::from_le_bytes(size);

        let array_index = if flags & FLAG_HAS_ARRAY_INDEX != 0 {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf)?;
            Some(u32::from_le_bytes(buf))
        } else {
            None
        };

        let aux = TagAux::decode(reader, wire_type)?;

        let guid = if flags & FLAG_HAS_GUID != 0 {
            let mut buf = [0u8; 16];
            reader.read_exact(&mut buf)?;
            Some(buf)
        } else {
            None
        };

        Ok(Some(PropertyTag {
            name,
            wire_type,
            size,
            array_index,
            aux,
            guid,
            editor_only: flags & FLAG_EDITOR_ONLY != 0,
        }))
    }

    /// Write the stream-terminating sentinel.
    pub fn encode_sentinel<W: Write>(writer: &mut W) -> SerialResult<()> {
        write_str16(writer, "")?;
        writer.write_all(&[0u8])?;
        Ok(())
    }
}

pub(crate) fn write_str16<W: Write>(writer: &mut W, value: &str) -> SerialResult<()> {
    let bytes = value.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(SerialError::BadTag(format!(
            "name too long ({} bytes)",
            bytes.len()
        )));
    }
    writer.write_all(&(bytes.len() as u16).to_le_bytes())?;
    writer.write_all(bytes)?;
    Ok(())
}

pub(crate) fn read_str16<R: Read>(reader: &mut R) -> SerialResult<String> {
    let mut len = [0u8; 2];
    reader.read_exact(&mut len)?;
    let len = u16::from_le_bytes(len) as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| SerialError::BadTag(format!("non-UTF-8 name: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_tag_round_trip() {
        let tag = PropertyTag {
            name: "Health".to_string(),
            wire_type: WireType::Int32,
            size: 4,
            array_index: None,
            aux: TagAux::None,
            guid: None,
            editor_only: false,
        };
        let mut buf = Vec::new();
        tag.encode(&mut buf).unwrap();
        let decoded = PropertyTag::decode(&mut Cursor::new(&buf)).unwrap().unwrap();
        assert_eq!(decoded, tag);
    }

    #[test]
    fn test_tag_with_all_flags() {
        let tag = PropertyTag {
            name: "Slots".to_string(),
            wire_type: WireType::Seq,
            size: 20,
            array_index: Some(2),
            aux: TagAux::Seq {
                elem: WireType::Struct,
                elem_aux: Box::new(TagAux::Struct("Vec3".to_string())),
            },
            guid: Some([7u8; 16]),
            editor_only: true,
        };
        let mut buf = Vec::new();
        tag.encode(&mut buf).unwrap();
        let decoded = PropertyTag::decode(&mut Cursor::new(&buf)).unwrap().unwrap();
        assert_eq!(decoded, tag);
    }

    #[test]
    fn test_sentinel() {
        let mut buf = Vec::new();
        PropertyTag::encode_sentinel(&mut buf).unwrap();
        assert_eq!(buf, vec![0, 0, 0]);
        assert!(PropertyTag::decode(&mut Cursor::new(&buf))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_named_sentinel_is_malformed() {
        let mut buf = Vec::new();
        write_str16(&mut buf, "X").unwrap();
        buf.push(0);
        assert!(matches!(
            PropertyTag::decode(&mut Cursor::new(&buf)),
            Err(SerialError::BadTag(_))
        ));
    }

    #[test]
    fn test_unknown_wire_type() {
        let mut buf = Vec::new();
        write_str16(&mut buf, "X").unwrap();
        buf.push(200);
        assert!(matches!(
            PropertyTag::decode(&mut Cursor::new(&buf)),
            Err(SerialError::UnknownWireType(200))
        ));
    }

    #[test]
    fn test_size_field_offset() {
        let tag = PropertyTag {
            name: "AB".to_string(),
            wire_type: WireType::Bool,
            size: 0,
            array_index: None,
            aux: TagAux::None,
            guid: None,
            editor_only: false,
        };
        let mut buf = Vec::new();
        tag.encode(&mut buf).unwrap();
        let off = tag.size_field_offset() as usize;
        // Patch the size in the encoded bytes and decode it back.
        buf[off..off + 4].copy_from_slice(&9u32.to_le_bytes());
        let decoded = PropertyTag::decode(&mut Cursor::new(&buf)).unwrap().unwrap();
        assert_eq!(decoded.size, 9);
    }

    #[test]
    fn test_byte_enum_aux() {
        let tag = PropertyTag {
            name: "Color".to_string(),
            wire_type: WireType::Byte,
            size: 1,
            array_index: None,
            aux: TagAux::Enum(Some("EColor".to_string())),
            guid: None,
            editor_only: false,
        };
        let mut buf = Vec::new();
        tag.encode(&mut buf).unwrap();
        let decoded = PropertyTag::decode(&mut Cursor::new(&buf)).unwrap().unwrap();
        assert_eq!(decoded.aux, TagAux::Enum(Some("EColor".to_string())));
    }
}
