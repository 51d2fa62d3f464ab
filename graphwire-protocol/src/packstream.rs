//! Binary value codec.
//!
//! Every value starts with a marker byte. Small integers and short
//! collections fit their size into the marker itself; larger ones use a
//! marker naming an 8/16/32-bit size class followed by the big-endian size
//! and the payload.
//!
//! Structures are `marker | signature | fields...`, where the marker carries
//! the field count (`B0 | n` for n < 16, otherwise `DC n` or `DD nn`). Which
//! signatures are legal depends on the protocol version.

use crate::error::ProtocolError;
use crate::value::{
    Duration, Node, Path, Point2D, Point3D, Relationship, Time, UnboundRelationship, Value,
    ValueMap, ZonedDateTime,
};
use crate::version::ProtocolVersion;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Days, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::collections::HashMap;

/// Marker bytes.
pub mod marker {
    pub const TINY_STRING: u8 = 0x80;
    pub const TINY_LIST: u8 = 0x90;
    pub const TINY_MAP: u8 = 0xA0;
    pub const TINY_STRUCT: u8 = 0xB0;

    pub const NULL: u8 = 0xC0;
    pub const FLOAT_64: u8 = 0xC1;
    pub const FALSE: u8 = 0xC2;
    pub const TRUE: u8 = 0xC3;

    pub const INT_8: u8 = 0xC8;
    pub const INT_16: u8 = 0xC9;
    pub const INT_32: u8 = 0xCA;
    pub const INT_64: u8 = 0xCB;

    pub const BYTES_8: u8 = 0xCC;
    pub const BYTES_16: u8 = 0xCD;
    pub const BYTES_32: u8 = 0xCE;

    pub const STRING_8: u8 = 0xD0;
    pub const STRING_16: u8 = 0xD1;
    pub const STRING_32: u8 = 0xD2;

    pub const LIST_8: u8 = 0xD4;
    pub const LIST_16: u8 = 0xD5;
    pub const LIST_32: u8 = 0xD6;

    pub const MAP_8: u8 = 0xD8;
    pub const MAP_16: u8 = 0xD9;
    pub const MAP_32: u8 = 0xDA;

    pub const STRUCT_8: u8 = 0xDC;
    pub const STRUCT_16: u8 = 0xDD;
}

/// Signatures of value structures.
pub mod signature {
    pub const NODE: u8 = 0x4E;
    pub const RELATIONSHIP: u8 = 0x52;
    pub const UNBOUND_RELATIONSHIP: u8 = 0x72;
    pub const PATH: u8 = 0x50;

    pub const POINT_2D: u8 = 0x58;
    pub const POINT_3D: u8 = 0x59;
    pub const DATE: u8 = 0x44;
    pub const TIME: u8 = 0x54;
    pub const LOCAL_TIME: u8 = 0x74;
    pub const LOCAL_DATE_TIME: u8 = 0x64;
    pub const DATE_TIME_OFFSET: u8 = 0x46;
    pub const DATE_TIME_ZONE_ID: u8 = 0x66;
    pub const DURATION: u8 = 0x45;
}

/// Maximum nesting of lists, maps and structures in one value.
pub const MAX_NESTING_DEPTH: usize = 32;

const NANOS_PER_SECOND: i64 = 1_000_000_000;
const NANOS_PER_DAY: i64 = 86_400 * NANOS_PER_SECOND;

/// (signature, field count) of the graph structures available since v1.
const GRAPH_STRUCTS: &[(u8, usize)] = &[
    (signature::NODE, 3),
    (signature::RELATIONSHIP, 5),
    (signature::UNBOUND_RELATIONSHIP, 3),
    (signature::PATH, 3),
];

/// (signature, field count) of the structures added in v2.
const EXTENDED_STRUCTS: &[(u8, usize)] = &[
    (signature::POINT_2D, 3),
    (signature::POINT_3D, 4),
    (signature::DATE, 1),
    (signature::TIME, 2),
    (signature::LOCAL_TIME, 1),
    (signature::LOCAL_DATE_TIME, 2),
    (signature::DATE_TIME_OFFSET, 3),
    (signature::DATE_TIME_ZONE_ID, 3),
    (signature::DURATION, 4),
];

/// Returns the field count of a value structure registered for `version`.
pub fn struct_arity(version: ProtocolVersion, signature: u8) -> Option<usize> {
    let extended: &[(u8, usize)] = if version.supports_extended_values() {
        EXTENDED_STRUCTS
    } else {
        &[]
    };
    GRAPH_STRUCTS
        .iter()
        .chain(extended)
        .find(|(sig, _)| *sig == signature)
        .map(|(_, arity)| *arity)
}

fn unix_epoch_date() -> NaiveDate {
    // NaiveDate's default is 1970-01-01.
    NaiveDate::default()
}

fn nanos_of_day(time: &NaiveTime) -> i64 {
    i64::from(time.num_seconds_from_midnight()) * NANOS_PER_SECOND + i64::from(time.nanosecond())
}

/// Writes values into a buffer.
pub struct Packer<'a> {
    buf: &'a mut BytesMut,
    version: ProtocolVersion,
}

impl<'a> Packer<'a> {
    pub fn new(buf: &'a mut BytesMut, version: ProtocolVersion) -> Self {
        Self { buf, version }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Packs any value, rejecting types the active version cannot carry.
    pub fn pack(&mut self, value: &Value) -> Result<(), ProtocolError> {
        match value {
            Value::Null => self.pack_null(),
            Value::Boolean(b) => self.pack_bool(*b),
            Value::Integer(i) => self.pack_int(*i),
            Value::Float(f) => self.pack_float(*f),
            Value::String(s) => self.pack_string(s)?,
            Value::Bytes(b) => {
                self.require_extended(value)?;
                self.pack_bytes(b)?;
            }
            Value::List(items) => {
                self.pack_list_header(items.len())?;
                for item in items {
                    self.pack(item)?;
                }
            }
            Value::Map(map) => self.pack_map(map)?,
            Value::Node(node) => self.pack_node(node)?,
            Value::Relationship(rel) => {
                self.pack_struct_header(5, signature::RELATIONSHIP)?;
                self.pack_int(rel.id);
                self.pack_int(rel.start_node_id);
                self.pack_int(rel.end_node_id);
                self.pack_string(&rel.rel_type)?;
                self.pack_map(&rel.properties)?;
            }
            Value::UnboundRelationship(rel) => self.pack_unbound_relationship(rel)?,
            Value::Path(path) => {
                self.pack_struct_header(3, signature::PATH)?;
                self.pack_list_header(path.nodes.len())?;
                for node in &path.nodes {
                    self.pack_node(node)?;
                }
                self.pack_list_header(path.relationships.len())?;
                for rel in &path.relationships {
                    self.pack_unbound_relationship(rel)?;
                }
                self.pack_list_header(path.indices.len())?;
                for index in &path.indices {
                    self.pack_int(*index);
                }
            }
            Value::Point2D(p) => {
                self.require_extended(value)?;
                self.pack_struct_header(3, signature::POINT_2D)?;
                self.pack_int(p.srid);
                self.pack_float(p.x);
                self.pack_float(p.y);
            }
            Value::Point3D(p) => {
                self.require_extended(value)?;
                self.pack_struct_header(4, signature::POINT_3D)?;
                self.pack_int(p.srid);
                self.pack_float(p.x);
                self.pack_float(p.y);
                self.pack_float(p.z);
            }
            Value::Date(date) => {
                self.require_extended(value)?;
                self.pack_struct_header(1, signature::DATE)?;
                self.pack_int(date.signed_duration_since(unix_epoch_date()).num_days());
            }
            Value::Time(time) => {
                self.require_extended(value)?;
                self.pack_struct_header(2, signature::TIME)?;
                self.pack_int(nanos_of_day(&time.time));
                self.pack_int(i64::from(time.offset.local_minus_utc()));
            }
            Value::LocalTime(time) => {
                self.require_extended(value)?;
                self.pack_struct_header(1, signature::LOCAL_TIME)?;
                self.pack_int(nanos_of_day(time));
            }
            Value::LocalDateTime(local) => {
                self.require_extended(value)?;
                self.pack_struct_header(2, signature::LOCAL_DATE_TIME)?;
                self.pack_int(local.and_utc().timestamp());
                self.pack_int(i64::from(local.nanosecond()));
            }
            Value::DateTime(dt) => {
                self.require_extended(value)?;
                let local = dt.naive_local();
                self.pack_struct_header(3, signature::DATE_TIME_OFFSET)?;
                self.pack_int(local.and_utc().timestamp());
                self.pack_int(i64::from(local.nanosecond()));
                self.pack_int(i64::from(dt.offset().local_minus_utc()));
            }
            Value::DateTimeZoneId(zoned) => {
                self.require_extended(value)?;
                self.pack_struct_header(3, signature::DATE_TIME_ZONE_ID)?;
                self.pack_int(zoned.local.and_utc().timestamp());
                self.pack_int(i64::from(zoned.local.nanosecond()));
                self.pack_string(&zoned.zone_id)?;
            }
            Value::Duration(d) => {
                self.require_extended(value)?;
                self.pack_struct_header(4, signature::DURATION)?;
                self.pack_int(d.months);
                self.pack_int(d.days);
                self.pack_int(d.seconds);
                self.pack_int(d.nanoseconds);
            }
        }
        Ok(())
    }

    fn require_extended(&self, value: &Value) -> Result<(), ProtocolError> {
        if self.version.supports_extended_values() {
            Ok(())
        } else {
            Err(ProtocolError::UnsupportedValue(format!(
                "{} is not available in protocol {}",
                value.type_name(),
                self.version
            )))
        }
    }

    pub fn pack_null(&mut self) {
        self.buf.put_u8(marker::NULL);
    }

    pub fn pack_bool(&mut self, b: bool) {
        self.buf
            .put_u8(if b { marker::TRUE } else { marker::FALSE });
    }

    /// Packs an integer using the smallest size class that holds it.
    pub fn pack_int(&mut self, i: i64) {
        if (-16..=127).contains(&i) {
            self.buf.put_i8(i as i8);
        } else if (i64::from(i8::MIN)..=i64::from(i8::MAX)).contains(&i) {
            self.buf.put_u8(marker::INT_8);
            self.buf.put_i8(i as i8);
        } else if (i64::from(i16::MIN)..=i64::from(i16::MAX)).contains(&i) {
            self.buf.put_u8(marker::INT_16);
            self.buf.put_i16(i as i16);
        } else if (i64::from(i32::MIN)..=i64::from(i32::MAX)).contains(&i) {
            self.buf.put_u8(marker::INT_32);
            self.buf.put_i32(i as i32);
        } else {
            self.buf.put_u8(marker::INT_64);
            self.buf.put_i64(i);
        }
    }

    pub fn pack_float(&mut self, f: f64) {
        self.buf.put_u8(marker::FLOAT_64);
        self.buf.put_f64(f);
    }

    pub fn pack_string(&mut self, s: &str) -> Result<(), ProtocolError> {
        self.pack_size(
            s.len(),
            Some(marker::TINY_STRING),
            [marker::STRING_8, marker::STRING_16, marker::STRING_32],
            "string",
        )?;
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    pub fn pack_bytes(&mut self, b: &[u8]) -> Result<(), ProtocolError> {
        self.pack_size(
            b.len(),
            None,
            [marker::BYTES_8, marker::BYTES_16, marker::BYTES_32],
            "byte array",
        )?;
        self.buf.put_slice(b);
        Ok(())
    }

    pub fn pack_list_header(&mut self, len: usize) -> Result<(), ProtocolError> {
        self.pack_size(
            len,
            Some(marker::TINY_LIST),
            [marker::LIST_8, marker::LIST_16, marker::LIST_32],
            "list",
        )
    }

    pub fn pack_map_header(&mut self, len: usize) -> Result<(), ProtocolError> {
        self.pack_size(
            len,
            Some(marker::TINY_MAP),
            [marker::MAP_8, marker::MAP_16, marker::MAP_32],
            "map",
        )
    }

    pub fn pack_struct_header(&mut self, fields: usize, signature: u8) -> Result<(), ProtocolError> {
        if fields < 16 {
            self.buf.put_u8(marker::TINY_STRUCT | fields as u8);
        } else if fields <= usize::from(u8::MAX) {
            self.buf.put_u8(marker::STRUCT_8);
            self.buf.put_u8(fields as u8);
        } else if fields <= usize::from(u16::MAX) {
            self.buf.put_u8(marker::STRUCT_16);
            self.buf.put_u16(fields as u16);
        } else {
            return Err(ProtocolError::UnsupportedValue(format!(
                "structure with {} fields",
                fields
            )));
        }
        self.buf.put_u8(signature);
        Ok(())
    }

    pub fn pack_map(&mut self, map: &ValueMap) -> Result<(), ProtocolError> {
        self.pack_map_header(map.len())?;
        for (key, value) in map.iter() {
            self.pack_string(key)?;
            self.pack(value)?;
        }
        Ok(())
    }

    /// Packs a map that may only hold primitive values (auth tokens,
    /// transaction metadata, response metadata).
    pub fn pack_primitive_map(&mut self, map: &ValueMap) -> Result<(), ProtocolError> {
        if let Some((key, value)) = map.iter().find(|(_, v)| !v.is_primitive()) {
            return Err(ProtocolError::UnsupportedValue(format!(
                "{} under key '{}' where only primitive values are allowed",
                value.type_name(),
                key
            )));
        }
        self.pack_map(map)
    }

    fn pack_node(&mut self, node: &Node) -> Result<(), ProtocolError> {
        self.pack_struct_header(3, signature::NODE)?;
        self.pack_int(node.id);
        self.pack_list_header(node.labels.len())?;
        for label in &node.labels {
            self.pack_string(label)?;
        }
        self.pack_map(&node.properties)
    }

    fn pack_unbound_relationship(&mut self, rel: &UnboundRelationship) -> Result<(), ProtocolError> {
        self.pack_struct_header(3, signature::UNBOUND_RELATIONSHIP)?;
        self.pack_int(rel.id);
        self.pack_string(&rel.rel_type)?;
        self.pack_map(&rel.properties)
    }

    fn pack_size(
        &mut self,
        len: usize,
        tiny: Option<u8>,
        sized: [u8; 3],
        what: &str,
    ) -> Result<(), ProtocolError> {
        match tiny {
            Some(tiny) if len < 16 => self.buf.put_u8(tiny | len as u8),
            _ if len <= usize::from(u8::MAX) => {
                self.buf.put_u8(sized[0]);
                self.buf.put_u8(len as u8);
            }
            _ if len <= usize::from(u16::MAX) => {
                self.buf.put_u8(sized[1]);
                self.buf.put_u16(len as u16);
            }
            _ if len <= u32::MAX as usize => {
                self.buf.put_u8(sized[2]);
                self.buf.put_u32(len as u32);
            }
            _ => {
                return Err(ProtocolError::UnsupportedValue(format!(
                    "{} of length {} exceeds the 32-bit size class",
                    what, len
                )))
            }
        }
        Ok(())
    }
}

/// Reads values from a complete message buffer.
///
/// All reads are bounds-checked; a short buffer yields
/// [`ProtocolError::Truncated`] and never panics.
pub struct Unpacker<'a> {
    input: &'a [u8],
    pos: usize,
    version: ProtocolVersion,
    depth: usize,
}

impl<'a> Unpacker<'a> {
    pub fn new(input: &'a [u8], version: ProtocolVersion) -> Self {
        Self {
            input,
            pos: 0,
            version,
            depth: 0,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    /// Fails if any bytes are left after the last expected value.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::malformed(format!(
                "{} trailing bytes after message",
                n
            ))),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated {
                needed: n - self.remaining(),
            });
        }
        let slice = &self.input[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// Returns the next marker without consuming it.
    pub fn peek_marker(&self) -> Result<u8, ProtocolError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(ProtocolError::Truncated { needed: 1 })
    }

    /// Reads a structure header, returning `(field_count, signature)`.
    ///
    /// The caller is responsible for unpacking exactly `field_count` values.
    pub fn unpack_struct_header(&mut self) -> Result<(usize, u8), ProtocolError> {
        let m = self.read_u8()?;
        self.struct_header_after(m)
    }

    fn struct_header_after(&mut self, m: u8) -> Result<(usize, u8), ProtocolError> {
        let fields = match m {
            0xB0..=0xBF => usize::from(m & 0x0F),
            marker::STRUCT_8 => usize::from(self.read_u8()?),
            marker::STRUCT_16 => usize::from(self.read_u16()?),
            other => {
                return Err(ProtocolError::malformed(format!(
                    "expected structure, found marker {:#04x}",
                    other
                )))
            }
        };
        let signature = self.read_u8()?;
        Ok((fields, signature))
    }

    /// Unpacks the next value.
    pub fn unpack(&mut self) -> Result<Value, ProtocolError> {
        let m = self.read_u8()?;
        match m {
            0x00..=0x7F => Ok(Value::Integer(i64::from(m))),
            0xF0..=0xFF => Ok(Value::Integer(i64::from(m as i8))),
            marker::NULL => Ok(Value::Null),
            marker::TRUE => Ok(Value::Boolean(true)),
            marker::FALSE => Ok(Value::Boolean(false)),
            marker::FLOAT_64 => Ok(Value::Float(f64::from_bits(self.read_u64()?))),
            marker::INT_8 => Ok(Value::Integer(i64::from(self.read_u8()? as i8))),
            marker::INT_16 => Ok(Value::Integer(i64::from(self.read_u16()? as i16))),
            marker::INT_32 => Ok(Value::Integer(i64::from(self.read_u32()? as i32))),
            marker::INT_64 => Ok(Value::Integer(self.read_u64()? as i64)),
            0x80..=0x8F | marker::STRING_8 | marker::STRING_16 | marker::STRING_32 => {
                let len = self.size_after(m, marker::TINY_STRING, marker::STRING_8)?;
                self.read_string(len).map(Value::String)
            }
            marker::BYTES_8 | marker::BYTES_16 | marker::BYTES_32
                if self.version.supports_extended_values() =>
            {
                let len = self.size_after(m, 0, marker::BYTES_8)?;
                Ok(Value::Bytes(Bytes::copy_from_slice(self.take(len)?)))
            }
            0x90..=0x9F | marker::LIST_8 | marker::LIST_16 | marker::LIST_32 => {
                let len = self.size_after(m, marker::TINY_LIST, marker::LIST_8)?;
                self.read_list(len).map(Value::List)
            }
            0xA0..=0xAF | marker::MAP_8 | marker::MAP_16 | marker::MAP_32 => {
                let len = self.size_after(m, marker::TINY_MAP, marker::MAP_8)?;
                self.read_map(len).map(Value::Map)
            }
            0xB0..=0xBF | marker::STRUCT_8 | marker::STRUCT_16 => {
                let (fields, signature) = self.struct_header_after(m)?;
                self.enter()?;
                let value = self.read_structure(fields, signature);
                self.depth -= 1;
                value
            }
            other => Err(ProtocolError::malformed(format!(
                "unknown marker {:#04x}",
                other
            ))),
        }
    }

    /// Decodes the size that follows (or is embedded in) marker `m`.
    ///
    /// `sized_base` is the 8-bit marker of the family; the 16- and 32-bit
    /// markers follow it directly.
    fn size_after(&mut self, m: u8, tiny_base: u8, sized_base: u8) -> Result<usize, ProtocolError> {
        let len = if m == sized_base {
            usize::from(self.read_u8()?)
        } else if m == sized_base + 1 {
            usize::from(self.read_u16()?)
        } else if m == sized_base + 2 {
            self.read_u32()? as usize
        } else {
            usize::from(m - tiny_base)
        };
        Ok(len)
    }

    fn enter(&mut self) -> Result<(), ProtocolError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(ProtocolError::DepthExceeded(MAX_NESTING_DEPTH));
        }
        Ok(())
    }

    fn read_string(&mut self, len: usize) -> Result<String, ProtocolError> {
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn read_list(&mut self, len: usize) -> Result<Vec<Value>, ProtocolError> {
        // Every element needs at least one byte.
        if len > self.remaining() {
            return Err(ProtocolError::Truncated {
                needed: len - self.remaining(),
            });
        }
        self.enter()?;
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(self.unpack()?);
        }
        self.depth -= 1;
        Ok(items)
    }

    fn read_map(&mut self, len: usize) -> Result<ValueMap, ProtocolError> {
        // Every entry needs at least a key marker and a value marker.
        if len.saturating_mul(2) > self.remaining() {
            return Err(ProtocolError::Truncated {
                needed: len.saturating_mul(2) - self.remaining(),
            });
        }
        self.enter()?;
        let mut entries: Vec<(String, Value)> = Vec::with_capacity(len);
        let mut index: HashMap<String, usize> = HashMap::with_capacity(len);
        for _ in 0..len {
            let key = match self.unpack()? {
                Value::String(key) => key,
                other => {
                    return Err(ProtocolError::malformed(format!(
                        "map key must be a string, found {}",
                        other.type_name()
                    )))
                }
            };
            let value = self.unpack()?;
            // A repeated key keeps its first position and takes the last value.
            match index.get(&key) {
                Some(&at) => entries[at].1 = value,
                None => {
                    index.insert(key.clone(), entries.len());
                    entries.push((key, value));
                }
            }
        }
        self.depth -= 1;
        Ok(ValueMap::from_unique_entries(entries))
    }

    fn read_structure(&mut self, fields: usize, sig: u8) -> Result<Value, ProtocolError> {
        let expected = struct_arity(self.version, sig).ok_or(ProtocolError::UnknownStructure {
            signature: sig,
            version: self.version.number(),
        })?;
        if fields != expected {
            return Err(ProtocolError::StructureArity {
                signature: sig,
                expected,
                actual: fields,
            });
        }

        let value = match sig {
            signature::NODE => Value::Node(self.node_fields()?),
            signature::RELATIONSHIP => Value::Relationship(Relationship {
                id: self.unpack_int()?,
                start_node_id: self.unpack_int()?,
                end_node_id: self.unpack_int()?,
                rel_type: self.unpack_string()?,
                properties: self.unpack_map()?,
            }),
            signature::UNBOUND_RELATIONSHIP => {
                Value::UnboundRelationship(self.unbound_relationship_fields()?)
            }
            signature::PATH => Value::Path(self.path_fields()?),
            signature::POINT_2D => Value::Point2D(Point2D {
                srid: self.unpack_int()?,
                x: self.unpack_float()?,
                y: self.unpack_float()?,
            }),
            signature::POINT_3D => Value::Point3D(Point3D {
                srid: self.unpack_int()?,
                x: self.unpack_float()?,
                y: self.unpack_float()?,
                z: self.unpack_float()?,
            }),
            signature::DATE => {
                let days = self.unpack_int()?;
                Value::Date(date_from_epoch_days(days)?)
            }
            signature::TIME => {
                let nanos = self.unpack_int()?;
                let offset = self.unpack_int()?;
                Value::Time(Time {
                    time: time_from_nanos(nanos)?,
                    offset: offset_from_seconds(offset)?,
                })
            }
            signature::LOCAL_TIME => Value::LocalTime(time_from_nanos(self.unpack_int()?)?),
            signature::LOCAL_DATE_TIME => {
                let seconds = self.unpack_int()?;
                let nanos = self.unpack_int()?;
                Value::LocalDateTime(local_from_epoch(seconds, nanos)?)
            }
            signature::DATE_TIME_OFFSET => {
                let seconds = self.unpack_int()?;
                let nanos = self.unpack_int()?;
                let offset = offset_from_seconds(self.unpack_int()?)?;
                let local = local_from_epoch(seconds, nanos)?;
                let dt = local
                    .and_local_timezone(offset)
                    .single()
                    .ok_or_else(|| ProtocolError::malformed("date-time out of range"))?;
                Value::DateTime(dt)
            }
            signature::DATE_TIME_ZONE_ID => {
                let seconds = self.unpack_int()?;
                let nanos = self.unpack_int()?;
                let zone_id = self.unpack_string()?;
                Value::DateTimeZoneId(ZonedDateTime {
                    local: local_from_epoch(seconds, nanos)?,
                    zone_id,
                })
            }
            signature::DURATION => Value::Duration(Duration {
                months: self.unpack_int()?,
                days: self.unpack_int()?,
                seconds: self.unpack_int()?,
                nanoseconds: self.unpack_int()?,
            }),
            other => {
                return Err(ProtocolError::UnknownStructure {
                    signature: other,
                    version: self.version.number(),
                })
            }
        };
        Ok(value)
    }

    fn node_fields(&mut self) -> Result<Node, ProtocolError> {
        let id = self.unpack_int()?;
        let labels = self
            .unpack_list()?
            .into_iter()
            .map(|label| match label {
                Value::String(s) => Ok(s),
                other => Err(ProtocolError::malformed(format!(
                    "node label must be a string, found {}",
                    other.type_name()
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let properties = self.unpack_map()?;
        Ok(Node {
            id,
            labels,
            properties,
        })
    }

    fn unbound_relationship_fields(&mut self) -> Result<UnboundRelationship, ProtocolError> {
        Ok(UnboundRelationship {
            id: self.unpack_int()?,
            rel_type: self.unpack_string()?,
            properties: self.unpack_map()?,
        })
    }

    fn path_fields(&mut self) -> Result<Path, ProtocolError> {
        let nodes = self
            .unpack_list()?
            .into_iter()
            .map(|v| match v {
                Value::Node(node) => Ok(node),
                other => Err(ProtocolError::malformed(format!(
                    "path node must be a Node, found {}",
                    other.type_name()
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let relationships = self
            .unpack_list()?
            .into_iter()
            .map(|v| match v {
                Value::UnboundRelationship(rel) => Ok(rel),
                other => Err(ProtocolError::malformed(format!(
                    "path relationship must be an UnboundRelationship, found {}",
                    other.type_name()
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let indices = self
            .unpack_list()?
            .into_iter()
            .map(|v| {
                v.as_int()
                    .ok_or_else(|| ProtocolError::malformed("path index must be an integer"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Path {
            nodes,
            relationships,
            indices,
        })
    }

    pub fn unpack_int(&mut self) -> Result<i64, ProtocolError> {
        match self.unpack()? {
            Value::Integer(i) => Ok(i),
            other => Err(unexpected("Integer", &other)),
        }
    }

    pub fn unpack_float(&mut self) -> Result<f64, ProtocolError> {
        match self.unpack()? {
            Value::Float(f) => Ok(f),
            other => Err(unexpected("Float", &other)),
        }
    }

    pub fn unpack_string(&mut self) -> Result<String, ProtocolError> {
        match self.unpack()? {
            Value::String(s) => Ok(s),
            other => Err(unexpected("String", &other)),
        }
    }

    pub fn unpack_list(&mut self) -> Result<Vec<Value>, ProtocolError> {
        match self.unpack()? {
            Value::List(items) => Ok(items),
            other => Err(unexpected("List", &other)),
        }
    }

    pub fn unpack_map(&mut self) -> Result<ValueMap, ProtocolError> {
        match self.unpack()? {
            Value::Map(map) => Ok(map),
            other => Err(unexpected("Map", &other)),
        }
    }
}

fn unexpected(expected: &str, found: &Value) -> ProtocolError {
    ProtocolError::malformed(format!(
        "expected {}, found {}",
        expected,
        found.type_name()
    ))
}

fn date_from_epoch_days(days: i64) -> Result<NaiveDate, ProtocolError> {
    let epoch = unix_epoch_date();
    let date = if days >= 0 {
        epoch.checked_add_days(Days::new(days as u64))
    } else {
        epoch.checked_sub_days(Days::new(days.unsigned_abs()))
    };
    date.ok_or_else(|| ProtocolError::malformed(format!("date {} days from epoch out of range", days)))
}

fn time_from_nanos(nanos: i64) -> Result<NaiveTime, ProtocolError> {
    if !(0..NANOS_PER_DAY).contains(&nanos) {
        return Err(ProtocolError::malformed(format!(
            "time of day {}ns out of range",
            nanos
        )));
    }
    let secs = (nanos / NANOS_PER_SECOND) as u32;
    let subsec = (nanos % NANOS_PER_SECOND) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, subsec)
        .ok_or_else(|| ProtocolError::malformed("invalid time of day"))
}

fn offset_from_seconds(seconds: i64) -> Result<FixedOffset, ProtocolError> {
    i32::try_from(seconds)
        .ok()
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| ProtocolError::malformed(format!("UTC offset {}s out of range", seconds)))
}

fn local_from_epoch(seconds: i64, nanos: i64) -> Result<NaiveDateTime, ProtocolError> {
    if !(0..NANOS_PER_SECOND).contains(&nanos) {
        return Err(ProtocolError::malformed(format!(
            "nanosecond adjustment {} out of range",
            nanos
        )));
    }
    DateTime::from_timestamp(seconds, nanos as u32)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| ProtocolError::malformed(format!("epoch second {} out of range", seconds)))
}

/// Packs a single value into a fresh buffer.
pub fn to_bytes(value: &Value, version: ProtocolVersion) -> Result<BytesMut, ProtocolError> {
    let mut buf = BytesMut::new();
    Packer::new(&mut buf, version).pack(value)?;
    Ok(buf)
}

/// Unpacks exactly one value from `input`, failing on trailing bytes.
pub fn from_bytes(input: &[u8], version: ProtocolVersion) -> Result<Value, ProtocolError> {
    let mut unpacker = Unpacker::new(input, version);
    let value = unpacker.unpack()?;
    unpacker.finish()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    const V1: ProtocolVersion = ProtocolVersion::V1;
    const V2: ProtocolVersion = ProtocolVersion::V2;

    fn roundtrip(value: &Value, version: ProtocolVersion) -> Value {
        let bytes = to_bytes(value, version).unwrap();
        from_bytes(&bytes, version).unwrap()
    }

    #[test]
    fn test_integer_size_classes() {
        let cases: &[(i64, &[u8])] = &[
            (0, &[0x00]),
            (127, &[0x7F]),
            (-1, &[0xFF]),
            (-16, &[0xF0]),
            (-17, &[0xC8, 0xEF]),
            (-128, &[0xC8, 0x80]),
            (128, &[0xC9, 0x00, 0x80]),
            (-129, &[0xC9, 0xFF, 0x7F]),
            (32767, &[0xC9, 0x7F, 0xFF]),
            (32768, &[0xCA, 0x00, 0x00, 0x80, 0x00]),
            (
                2147483648,
                &[0xCB, 0x00, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00],
            ),
        ];
        for (value, expected) in cases {
            let bytes = to_bytes(&Value::Integer(*value), V1).unwrap();
            assert_eq!(&bytes[..], *expected, "encoding of {}", value);
            assert_eq!(from_bytes(&bytes, V1).unwrap(), Value::Integer(*value));
        }
        assert_eq!(
            roundtrip(&Value::Integer(i64::MIN), V1),
            Value::Integer(i64::MIN)
        );
        assert_eq!(
            roundtrip(&Value::Integer(i64::MAX), V1),
            Value::Integer(i64::MAX)
        );
    }

    #[test]
    fn test_scalar_markers() {
        assert_eq!(&to_bytes(&Value::Null, V1).unwrap()[..], &[0xC0]);
        assert_eq!(&to_bytes(&Value::Boolean(true), V1).unwrap()[..], &[0xC3]);
        assert_eq!(&to_bytes(&Value::Boolean(false), V1).unwrap()[..], &[0xC2]);
        assert_eq!(
            &to_bytes(&Value::Float(1.1), V1).unwrap()[..],
            &[0xC1, 0x3F, 0xF1, 0x99, 0x99, 0x99, 0x99, 0x99, 0x9A]
        );
    }

    #[test]
    fn test_string_size_boundaries() {
        assert_eq!(&to_bytes(&Value::from(""), V1).unwrap()[..], &[0x80]);
        assert_eq!(&to_bytes(&Value::from("A"), V1).unwrap()[..], &[0x81, 0x41]);

        for len in [15usize, 16, 255, 256, 65535, 65536] {
            let s = "x".repeat(len);
            let bytes = to_bytes(&Value::from(s.as_str()), V1).unwrap();
            let expected_marker = match len {
                0..=15 => 0x80 | len as u8,
                16..=255 => marker::STRING_8,
                256..=65535 => marker::STRING_16,
                _ => marker::STRING_32,
            };
            assert_eq!(bytes[0], expected_marker, "marker for length {}", len);
            assert_eq!(from_bytes(&bytes, V1).unwrap(), Value::String(s));
        }
    }

    #[test]
    fn test_multibyte_string() {
        let value = Value::from("Größenmaßstäbe");
        assert_eq!(roundtrip(&value, V1), value);
    }

    #[test]
    fn test_list_and_map() {
        let list = Value::List(vec![Value::from(1), Value::from(2), Value::from(3)]);
        assert_eq!(
            &to_bytes(&list, V1).unwrap()[..],
            &[0x93, 0x01, 0x02, 0x03]
        );

        let map = Value::Map(ValueMap::new().with("a", 1));
        assert_eq!(&to_bytes(&map, V1).unwrap()[..], &[0xA1, 0x81, 0x61, 0x01]);

        let big: Vec<Value> = (0..300).map(Value::from).collect();
        let bytes = to_bytes(&Value::List(big.clone()), V1).unwrap();
        assert_eq!(bytes[0], marker::LIST_16);
        assert_eq!(from_bytes(&bytes, V1).unwrap(), Value::List(big));
    }

    #[test]
    fn test_map_decoding_is_order_independent() {
        // {b: 2, a: 1} on the wire equals a map built as {a: 1, b: 2}
        let wire = [0xA2, 0x81, 0x62, 0x02, 0x81, 0x61, 0x01];
        let decoded = from_bytes(&wire, V1).unwrap();
        assert_eq!(
            decoded,
            Value::Map(ValueMap::new().with("a", 1).with("b", 2))
        );
    }

    #[test]
    fn test_graph_structures_v1() {
        let alice = Node {
            id: 1,
            labels: vec!["Person".into()],
            properties: ValueMap::new().with("name", "Alice"),
        };
        let bob = Node {
            id: 2,
            labels: vec!["Person".into()],
            properties: ValueMap::new().with("name", "Bob"),
        };
        let knows = UnboundRelationship {
            id: 10,
            rel_type: "KNOWS".into(),
            properties: ValueMap::new(),
        };
        let values = vec![
            Value::Node(alice.clone()),
            Value::Relationship(Relationship {
                id: 10,
                start_node_id: 1,
                end_node_id: 2,
                rel_type: "KNOWS".into(),
                properties: ValueMap::new().with("since", 2010),
            }),
            Value::UnboundRelationship(knows.clone()),
            Value::Path(Path {
                nodes: vec![alice, bob],
                relationships: vec![knows],
                indices: vec![1, 1],
            }),
        ];
        for value in values {
            assert_eq!(roundtrip(&value, V1), value);
        }
    }

    #[test]
    fn test_node_wire_layout() {
        let node = Value::Node(Node {
            id: 1,
            labels: vec![],
            properties: ValueMap::new(),
        });
        assert_eq!(
            &to_bytes(&node, V1).unwrap()[..],
            &[0xB3, 0x4E, 0x01, 0x90, 0xA0]
        );
    }

    #[test]
    fn test_extended_structures_v2() {
        let offset = FixedOffset::east_opt(3600).unwrap();
        let values = vec![
            Value::Bytes(Bytes::from_static(&[1, 2, 3])),
            Value::Point2D(Point2D {
                srid: 7203,
                x: 1.5,
                y: -2.0,
            }),
            Value::Point3D(Point3D {
                srid: 9157,
                x: 1.0,
                y: 2.0,
                z: 3.0,
            }),
            Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()),
            Value::Date(NaiveDate::from_ymd_opt(1901, 12, 13).unwrap()),
            Value::LocalTime(NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999).unwrap()),
            Value::Time(Time {
                time: NaiveTime::from_hms_opt(12, 30, 0).unwrap(),
                offset,
            }),
            Value::LocalDateTime(
                NaiveDate::from_ymd_opt(1969, 7, 20)
                    .unwrap()
                    .and_hms_nano_opt(20, 17, 40, 5)
                    .unwrap(),
            ),
            Value::DateTime(offset.with_ymd_and_hms(2020, 1, 1, 10, 0, 0).unwrap()),
            Value::DateTimeZoneId(ZonedDateTime {
                local: NaiveDate::from_ymd_opt(2021, 3, 28)
                    .unwrap()
                    .and_hms_opt(2, 30, 0)
                    .unwrap(),
                zone_id: "Europe/Stockholm".into(),
            }),
            Value::Duration(Duration {
                months: 14,
                days: -3,
                seconds: 59,
                nanoseconds: 7,
            }),
        ];
        for value in values {
            assert_eq!(roundtrip(&value, V2), value, "{}", value.type_name());
            assert_eq!(roundtrip(&value, ProtocolVersion::V3), value);
        }
    }

    #[test]
    fn test_date_wire_layout() {
        let date = Value::Date(NaiveDate::from_ymd_opt(1970, 1, 2).unwrap());
        assert_eq!(&to_bytes(&date, V2).unwrap()[..], &[0xB1, 0x44, 0x01]);
    }

    #[test]
    fn test_v1_rejects_extended_structures_on_decode() {
        // Date(1) encoded with the v2 codec
        let bytes = to_bytes(
            &Value::Date(NaiveDate::from_ymd_opt(1970, 1, 2).unwrap()),
            V2,
        )
        .unwrap();
        let result = from_bytes(&bytes, V1);
        assert!(matches!(
            result,
            Err(ProtocolError::UnknownStructure {
                signature: 0x44,
                version: 1
            })
        ));
    }

    #[test]
    fn test_v1_rejects_extended_values_on_encode() {
        let value = Value::Point2D(Point2D {
            srid: 1,
            x: 0.0,
            y: 0.0,
        });
        let result = to_bytes(&value, V1);
        assert!(matches!(result, Err(ProtocolError::UnsupportedValue(_))));

        let nested = Value::List(vec![Value::Bytes(Bytes::from_static(b"x"))]);
        assert!(matches!(
            to_bytes(&nested, V1),
            Err(ProtocolError::UnsupportedValue(_))
        ));
    }

    #[test]
    fn test_v1_bytes_marker_is_malformed() {
        let result = from_bytes(&[marker::BYTES_8, 0x01, 0xFF], V1);
        assert!(matches!(result, Err(ProtocolError::MalformedMessage(_))));
    }

    #[test]
    fn test_unknown_structure_signature() {
        let result = from_bytes(&[0xB0, 0x99], ProtocolVersion::V3);
        assert!(matches!(
            result,
            Err(ProtocolError::UnknownStructure {
                signature: 0x99,
                ..
            })
        ));
    }

    #[test]
    fn test_structure_arity_mismatch() {
        // Node with two fields
        let result = from_bytes(&[0xB2, 0x4E, 0x01, 0x90], V1);
        assert!(matches!(
            result,
            Err(ProtocolError::StructureArity {
                expected: 3,
                actual: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_struct_8_header_is_accepted() {
        let mut unpacker = Unpacker::new(&[marker::STRUCT_8, 0x02, 0x10, 0x80, 0xA0], V1);
        let (fields, sig) = unpacker.unpack_struct_header().unwrap();
        assert_eq!((fields, sig), (2, 0x10));
        assert_eq!(unpacker.unpack_string().unwrap(), "");
        assert!(unpacker.unpack_map().unwrap().is_empty());
        unpacker.finish().unwrap();
    }

    #[test]
    fn test_truncated_inputs() {
        let cases: &[&[u8]] = &[
            &[],
            &[marker::INT_16, 0x01],
            &[marker::FLOAT_64, 0, 0, 0],
            &[0x85, b'a', b'b'],
            &[marker::STRING_8],
            &[0x92, 0x01],
            &[0xA1, 0x81, b'a'],
            &[marker::LIST_32, 0xFF, 0xFF, 0xFF, 0xFF],
            &[marker::MAP_32, 0x7F, 0xFF, 0xFF, 0xFF],
        ];
        for case in cases {
            let result = from_bytes(case, V1);
            assert!(
                matches!(result, Err(ProtocolError::Truncated { .. })),
                "input {:02x?} gave {:?}",
                case,
                result
            );
        }
    }

    #[test]
    fn test_malformed_inputs() {
        // Reserved marker
        assert!(matches!(
            from_bytes(&[0xC4], V1),
            Err(ProtocolError::MalformedMessage(_))
        ));
        // Integer map key
        assert!(matches!(
            from_bytes(&[0xA1, 0x01, 0x01], V1),
            Err(ProtocolError::MalformedMessage(_))
        ));
        // Invalid UTF-8
        assert!(matches!(
            from_bytes(&[0x82, 0xC3, 0x28], V1),
            Err(ProtocolError::InvalidUtf8)
        ));
        // Trailing bytes
        assert!(matches!(
            from_bytes(&[0x01, 0x02], V1),
            Err(ProtocolError::MalformedMessage(_))
        ));
        // Node label that is not a string
        assert!(matches!(
            from_bytes(&[0xB3, 0x4E, 0x01, 0x91, 0x01, 0xA0], V1),
            Err(ProtocolError::MalformedMessage(_))
        ));
        // Time of day past midnight
        assert!(matches!(
            from_bytes(&[0xB1, 0x74, 0xCB, 0x7F, 0, 0, 0, 0, 0, 0, 0], V2),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_nesting_depth_limit() {
        let mut bytes = vec![0x91; MAX_NESTING_DEPTH + 1];
        bytes.push(0xC0);
        assert!(matches!(
            from_bytes(&bytes, V1),
            Err(ProtocolError::DepthExceeded(_))
        ));

        let mut ok = vec![0x91; MAX_NESTING_DEPTH];
        ok.push(0xC0);
        assert!(from_bytes(&ok, V1).is_ok());
    }

    #[test]
    fn test_primitive_map_rejects_graph_and_temporal_values() {
        let mut buf = BytesMut::new();
        let mut packer = Packer::new(&mut buf, V2);

        let ok = ValueMap::new()
            .with("scheme", "basic")
            .with("tags", Value::List(vec![Value::from("a")]));
        packer.pack_primitive_map(&ok).unwrap();

        let node = ValueMap::new().with(
            "n",
            Node {
                id: 1,
                labels: vec![],
                properties: ValueMap::new(),
            },
        );
        assert!(matches!(
            packer.pack_primitive_map(&node),
            Err(ProtocolError::UnsupportedValue(_))
        ));

        let bytes = ValueMap::new().with("b", Bytes::from_static(b"x"));
        assert!(packer.pack_primitive_map(&bytes).is_err());

        let date = ValueMap::new().with(
            "d",
            Value::Date(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()),
        );
        let err = packer.pack_primitive_map(&date).unwrap_err();
        assert!(err.to_string().contains("Date"));
    }

    #[test]
    fn test_struct_arity_table() {
        assert_eq!(struct_arity(V1, signature::NODE), Some(3));
        assert_eq!(struct_arity(V1, signature::RELATIONSHIP), Some(5));
        assert_eq!(struct_arity(V1, signature::DATE), None);
        assert_eq!(struct_arity(V2, signature::DATE), Some(1));
        assert_eq!(struct_arity(V2, signature::DURATION), Some(4));
        assert_eq!(struct_arity(ProtocolVersion::V3, 0x10), None);
    }

    fn primitive_strategy() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Boolean),
            any::<i64>().prop_map(Value::Integer),
            (-1.0e12f64..1.0e12).prop_map(Value::Float),
            ".{0,40}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..20).prop_map(Value::List),
                prop::collection::vec(("[a-z]{0,8}", inner), 0..20)
                    .prop_map(|entries| Value::Map(entries.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_value_roundtrip(value in primitive_strategy()) {
            for version in ProtocolVersion::ALL {
                let bytes = to_bytes(&value, version).unwrap();
                prop_assert_eq!(from_bytes(&bytes, version).unwrap(), value.clone());
            }
        }

        #[test]
        fn prop_decoding_arbitrary_bytes_never_panics(input in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = from_bytes(&input, ProtocolVersion::V3);
        }
    }
}
