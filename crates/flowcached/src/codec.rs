//! Side-channel metadata codec.
//!
//! Values travel as big-endian byte strings of `ceil(bitwidth / 8)` bytes.
//! Decoding accepts shorter strings (leading zero bytes stripped) and longer
//! ones as long as the surplus leading bytes are zero.

use crate::channel::{BitField, PacketMetadata};
use crate::error::{ControllerError, Result};
use crate::schema::PacketInSchema;
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use std::collections::BTreeMap;

/// Packet-out side-channel layout: `(name, bitwidth)` in wire order.
///
/// Hand-maintained to match the dataplane's packet-out header; it is not
/// derived from the pipeline schema and must be updated together with the
/// dataplane program.
pub const PACKET_OUT_LAYOUT: [(&str, u32); 3] = [("opcode", 8), ("reserved1", 8), ("operand0", 32)];

fn fits(value: u64, bitwidth: u32) -> bool {
    bitwidth >= 64 || value >> bitwidth == 0
}

fn byte_len(bitwidth: u32) -> usize {
    bitwidth.div_ceil(8) as usize
}

/// Encodes `value` of field `name` as a big-endian byte string.
pub fn encode_value(name: &str, value: u64, bitwidth: u32) -> Result<Bytes> {
    if bitwidth == 0 || bitwidth > 64 || !fits(value, bitwidth) {
        return Err(ControllerError::MetadataOverflow {
            name: name.to_string(),
            value,
            bitwidth,
        });
    }
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, value);
    Ok(Bytes::copy_from_slice(&buf[8 - byte_len(bitwidth)..]))
}

/// Decodes a big-endian byte string of field `name`.
pub fn decode_value(name: &str, raw: &[u8], bitwidth: u32) -> Result<u64> {
    let (surplus, tail) = raw.split_at(raw.len().saturating_sub(8));
    let mut buf = [0u8; 8];
    buf[8 - tail.len()..].copy_from_slice(tail);
    let value = BigEndian::read_u64(&buf);

    if surplus.iter().any(|b| *b != 0) || !fits(value, bitwidth) {
        return Err(ControllerError::MetadataOverflow {
            name: name.to_string(),
            value,
            bitwidth,
        });
    }
    Ok(value)
}

/// Decoded packet-in side-channel fields, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketInMetadata {
    fields: BTreeMap<String, u64>,
}

impl PacketInMetadata {
    pub fn get(&self, name: &str) -> Option<u64> {
        self.fields.get(name).copied()
    }

    pub fn require(&self, name: &str) -> Result<u64> {
        self.get(name)
            .ok_or_else(|| ControllerError::MissingMetadata(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Decodes packet-in metadata against the schema.
///
/// Fails closed: an id the schema does not declare is a
/// [`ControllerError::SchemaMismatch`].
pub fn decode_packet_in(raw: &[PacketMetadata], schema: &PacketInSchema) -> Result<PacketInMetadata> {
    let mut fields = BTreeMap::new();
    for metadata in raw {
        let field = schema
            .field(metadata.metadata_id)
            .ok_or(ControllerError::SchemaMismatch {
                id: metadata.metadata_id,
            })?;
        let value = decode_value(&field.name, &metadata.value, field.bitwidth)?;
        fields.insert(field.name.clone(), value);
    }
    Ok(PacketInMetadata { fields })
}

/// Builds packet-out side-channel fields in [`PACKET_OUT_LAYOUT`] order.
pub fn encode_packet_out(opcode: u64, reserved: u64, operand: u64) -> Result<Vec<BitField>> {
    PACKET_OUT_LAYOUT
        .iter()
        .zip([opcode, reserved, operand])
        .map(|(&(name, bitwidth), value)| {
            if fits(value, bitwidth) {
                Ok(BitField::new(value, bitwidth))
            } else {
                Err(ControllerError::MetadataOverflow {
                    name: name.to_string(),
                    value,
                    bitwidth,
                })
            }
        })
        .collect()
}

/// Encodes packet-in metadata the way a switch would attach it. Used by the
/// simulated fabric to fabricate punts.
pub fn encode_packet_in(
    schema: &PacketInSchema,
    values: &[(u32, u64)],
) -> Result<Vec<PacketMetadata>> {
    values
        .iter()
        .map(|&(id, value)| {
            let field = schema
                .field(id)
                .ok_or(ControllerError::SchemaMismatch { id })?;
            Ok(PacketMetadata {
                metadata_id: id,
                value: encode_value(&field.name, value, field.bitwidth)?,
            })
        })
        .collect()
}
