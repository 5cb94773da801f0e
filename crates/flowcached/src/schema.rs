//! Pipeline schema resolved once at startup.
//!
//! The packet-in metadata table (id to name and bit width) and the
//! serializable enums of the dataplane program are turned into lookup
//! structures here, so that the dispatcher never compares against hard-coded
//! integers.

use crate::config::PipelineConfig;
use crate::error::{ControllerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const PUNT_REASON_ENUM: &str = "PuntReason_t";
pub const FLOW_UNKNOWN: &str = "FLOW_UNKNOWN";
pub const CONTROLLER_OPCODE_ENUM: &str = "ControllerOpcode_t";
pub const SEND_TO_PORT_IN_OPERAND0: &str = "SEND_TO_PORT_IN_OPERAND0";

/// Packet-in metadata field carrying the punt reason.
pub const PUNT_REASON_FIELD: &str = "punt_reason";

/// One packet-in metadata field as declared by the dataplane program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub id: u32,
    pub name: String,
    pub bitwidth: u32,
}

/// Packet-in metadata fields indexed by id.
#[derive(Debug, Clone, Default)]
pub struct PacketInSchema {
    fields: HashMap<u32, MetadataField>,
}

impl PacketInSchema {
    /// Builds the schema, rejecting duplicate ids or names and bit widths
    /// outside `1..=64`.
    pub fn new(fields: impl IntoIterator<Item = MetadataField>) -> Result<Self> {
        let mut by_id = HashMap::new();
        let mut names = HashMap::new();
        for field in fields {
            if field.bitwidth == 0 || field.bitwidth > 64 {
                return Err(ControllerError::Config(format!(
                    "packet-in field '{}' has unsupported bit width {}",
                    field.name, field.bitwidth
                )));
            }
            if names.insert(field.name.clone(), field.id).is_some() {
                return Err(ControllerError::Config(format!(
                    "packet-in field name '{}' declared twice",
                    field.name
                )));
            }
            if let Some(previous) = by_id.insert(field.id, field) {
                return Err(ControllerError::Config(format!(
                    "packet-in field id {} declared twice ('{}')",
                    previous.id, previous.name
                )));
            }
        }
        Ok(Self { fields: by_id })
    }

    pub fn field(&self, id: u32) -> Option<&MetadataField> {
        self.fields.get(&id)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A serializable enum of the dataplane program.
#[derive(Debug, Clone)]
pub struct SerializableEnum {
    name: String,
    by_name: BTreeMap<String, u64>,
    by_value: BTreeMap<u64, String>,
}

impl SerializableEnum {
    pub fn new(name: impl Into<String>, members: &BTreeMap<String, u64>) -> Result<Self> {
        let name = name.into();
        let mut by_value = BTreeMap::new();
        for (member, value) in members {
            if let Some(other) = by_value.insert(*value, member.clone()) {
                return Err(ControllerError::Config(format!(
                    "enum {} members {} and {} share value {}",
                    name, other, member, value
                )));
            }
        }
        Ok(Self {
            name,
            by_name: members.clone(),
            by_value,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_of(&self, member: &str) -> Option<u64> {
        self.by_name.get(member).copied()
    }

    pub fn member_of(&self, value: u64) -> Option<&str> {
        self.by_value.get(&value).map(String::as_str)
    }

    fn require(&self, member: &str) -> Result<u64> {
        self.value_of(member).ok_or_else(|| {
            ControllerError::Config(format!("enum {} has no member {}", self.name, member))
        })
    }
}

/// Everything the controller needs to know about the dataplane program.
#[derive(Debug, Clone)]
pub struct PipelineSchema {
    packet_in: PacketInSchema,
    punt_reasons: SerializableEnum,
    opcodes: SerializableEnum,
    flow_unknown: u64,
    send_to_port: u64,
}

impl PipelineSchema {
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let packet_in = PacketInSchema::new(config.packet_in.iter().cloned())?;
        if !config
            .packet_in
            .iter()
            .any(|field| field.name == PUNT_REASON_FIELD)
        {
            return Err(ControllerError::Config(format!(
                "packet-in schema does not declare '{}'",
                PUNT_REASON_FIELD
            )));
        }

        let lookup = |name: &str| -> Result<SerializableEnum> {
            let members = config
                .enums
                .get(name)
                .ok_or_else(|| ControllerError::Config(format!("enum {} is not declared", name)))?;
            SerializableEnum::new(name, members)
        };
        let punt_reasons = lookup(PUNT_REASON_ENUM)?;
        let opcodes = lookup(CONTROLLER_OPCODE_ENUM)?;
        let flow_unknown = punt_reasons.require(FLOW_UNKNOWN)?;
        let send_to_port = opcodes.require(SEND_TO_PORT_IN_OPERAND0)?;

        Ok(Self {
            packet_in,
            punt_reasons,
            opcodes,
            flow_unknown,
            send_to_port,
        })
    }

    pub fn packet_in(&self) -> &PacketInSchema {
        &self.packet_in
    }

    /// Value of `PuntReason_t.FLOW_UNKNOWN`.
    pub fn flow_unknown(&self) -> u64 {
        self.flow_unknown
    }

    /// Value of `ControllerOpcode_t.SEND_TO_PORT_IN_OPERAND0`.
    pub fn send_to_port_opcode(&self) -> u64 {
        self.send_to_port
    }

    /// Member name of a punt reason, for log lines.
    pub fn punt_reason_name(&self, value: u64) -> &str {
        self.punt_reasons.member_of(value).unwrap_or("UNDEFINED")
    }

    pub fn opcode_name(&self, value: u64) -> &str {
        self.opcodes.member_of(value).unwrap_or("UNDEFINED")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn field(id: u32, name: &str, bitwidth: u32) -> MetadataField {
        MetadataField {
            id,
            name: name.to_string(),
            bitwidth,
        }
    }

    #[test]
    fn test_default_pipeline_resolves() {
        let schema = PipelineSchema::from_config(&PipelineConfig::default()).unwrap();
        assert_eq!(schema.flow_unknown(), 1);
        assert_eq!(schema.send_to_port_opcode(), 1);
        assert_eq!(schema.punt_reason_name(1), "FLOW_UNKNOWN");
        assert_eq!(schema.punt_reason_name(99), "UNDEFINED");
        assert_eq!(schema.packet_in().len(), 3);
    }

    #[test]
    fn test_duplicate_metadata_id_rejected() {
        let result = PacketInSchema::new(vec![field(1, "a", 8), field(1, "b", 8)]);
        assert!(matches!(result, Err(ControllerError::Config(_))));
    }

    #[test]
    fn test_bitwidth_out_of_range_rejected() {
        assert!(PacketInSchema::new(vec![field(1, "a", 0)]).is_err());
        assert!(PacketInSchema::new(vec![field(1, "a", 65)]).is_err());
        assert!(PacketInSchema::new(vec![field(1, "a", 64)]).is_ok());
    }

    #[test]
    fn test_missing_enum_member_rejected() {
        let mut config = PipelineConfig::default();
        config
            .enums
            .get_mut(PUNT_REASON_ENUM)
            .unwrap()
            .remove(FLOW_UNKNOWN);
        assert!(PipelineSchema::from_config(&config).is_err());
    }

    #[test]
    fn test_missing_punt_reason_field_rejected() {
        let mut config = PipelineConfig::default();
        config.packet_in.retain(|f| f.name != PUNT_REASON_FIELD);
        assert!(PipelineSchema::from_config(&config).is_err());
    }
}
