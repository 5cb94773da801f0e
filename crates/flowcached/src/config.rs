//! Deployment configuration for flowcached.
//!
//! Loaded once from a TOML file at startup, validated, then shared read-only
//! by every task. Default location: `config/flowcache.toml`.

use crate::channel::SwitchIdentity;
use crate::error::{ControllerError, Result};
use crate::flow_cache::PORT_BITWIDTH;
use crate::schema::{
    MetadataField, PipelineSchema, CONTROLLER_OPCODE_ENUM, FLOW_UNKNOWN, PUNT_REASON_ENUM,
    SEND_TO_PORT_IN_OPERAND0,
};
use fabric_types::{DeviceId, MacAddress, PortNumber};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/flowcache.toml";

/// One managed switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub name: String,

    /// Control channel address, `host:port`
    pub address: String,

    pub device_id: DeviceId,
}

impl SwitchConfig {
    pub fn identity(&self) -> SwitchIdentity {
        SwitchIdentity {
            name: self.name.clone(),
            address: self.address.clone(),
            device_id: self.device_id,
        }
    }
}

/// Dataplane program artifacts and the names the controller uses against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// P4Info artifact; the simulated fabric accepts an empty pipeline
    #[serde(default)]
    pub p4info: Option<PathBuf>,

    /// Compiled device config (BMv2 JSON)
    #[serde(default)]
    pub device_config: Option<PathBuf>,

    #[serde(default = "default_flow_table")]
    pub flow_table: String,

    #[serde(default = "default_flow_action")]
    pub flow_action: String,

    #[serde(default = "default_match_protocol")]
    pub match_protocol: String,

    #[serde(default = "default_match_src")]
    pub match_src: String,

    #[serde(default = "default_match_dst")]
    pub match_dst: String,

    #[serde(default = "default_param_port")]
    pub param_port: String,

    #[serde(default = "default_param_decrement_ttl")]
    pub param_decrement_ttl: String,

    #[serde(default = "default_param_new_dscp")]
    pub param_new_dscp: String,

    #[serde(default = "default_param_dst_mac")]
    pub param_dst_mac: String,

    /// Counts packet-outs seen at ingress
    #[serde(default = "default_ingress_counter")]
    pub ingress_counter: String,

    /// Counts packet-ins generated at egress
    #[serde(default = "default_egress_counter")]
    pub egress_counter: String,

    /// Packet-in metadata schema
    #[serde(default = "default_packet_in")]
    pub packet_in: Vec<MetadataField>,

    /// Serializable enums, enum name to member name to value
    #[serde(default = "default_enums")]
    pub enums: BTreeMap<String, BTreeMap<String, u64>>,
}

/// Punt path setup written to every switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PuntConfig {
    #[serde(default = "default_cpu_port")]
    pub cpu_port: PortNumber,

    #[serde(default = "default_clone_session_id")]
    pub clone_session_id: u32,

    #[serde(default = "default_replica_instance")]
    pub replica_instance: u32,

    /// 0 disables truncation
    #[serde(default)]
    pub truncation_bytes: u32,
}

/// Action parameters and lifetime of installed flow rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_new_dscp")]
    pub new_dscp: u8,

    #[serde(default = "default_decrement_ttl")]
    pub decrement_ttl: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Fixed sleep between retries of a transient channel failure
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Read counters and dump tables after each install
    #[serde(default)]
    pub enabled: bool,
}

/// Complete flowcached configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_election_id")]
    pub election_id: u64,

    #[serde(default)]
    pub switches: Vec<SwitchConfig>,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub punt: PuntConfig,

    #[serde(default)]
    pub flow: FlowConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    /// Switch name to destination address to output port
    #[serde(default)]
    pub routes: BTreeMap<String, BTreeMap<Ipv4Addr, PortNumber>>,

    /// Destination address to destination MAC
    #[serde(default)]
    pub addresses: BTreeMap<Ipv4Addr, MacAddress>,
}

// Default functions
fn default_election_id() -> u64 {
    1
}

fn default_flow_table() -> String {
    "MyIngress.flow_cache".to_string()
}

fn default_flow_action() -> String {
    "MyIngress.cached_action".to_string()
}

fn default_match_protocol() -> String {
    "hdr.ipv4.protocol".to_string()
}

fn default_match_src() -> String {
    "hdr.ipv4.srcAddr".to_string()
}

fn default_match_dst() -> String {
    "hdr.ipv4.dstAddr".to_string()
}

fn default_param_port() -> String {
    "port".to_string()
}

fn default_param_decrement_ttl() -> String {
    "decrement_ttl".to_string()
}

fn default_param_new_dscp() -> String {
    "new_dscp".to_string()
}

fn default_param_dst_mac() -> String {
    "dst_eth_addr".to_string()
}

fn default_ingress_counter() -> String {
    "MyIngress.ingressPktOutCounter".to_string()
}

fn default_egress_counter() -> String {
    "MyEgress.egressPktInCounter".to_string()
}

fn default_packet_in() -> Vec<MetadataField> {
    [("input_port", 16), ("punt_reason", 8), ("opcode", 8)]
        .into_iter()
        .zip(1u32..)
        .map(|((name, bitwidth), id)| MetadataField {
            id,
            name: name.to_string(),
            bitwidth,
        })
        .collect()
}

fn default_enums() -> BTreeMap<String, BTreeMap<String, u64>> {
    let members = |pairs: &[(&str, u64)]| {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect::<BTreeMap<_, _>>()
    };
    BTreeMap::from([
        (
            PUNT_REASON_ENUM.to_string(),
            members(&[(FLOW_UNKNOWN, 1), ("UNRECOGNIZED_OPCODE", 2)]),
        ),
        (
            CONTROLLER_OPCODE_ENUM.to_string(),
            members(&[("NO_OP", 0), (SEND_TO_PORT_IN_OPERAND0, 1)]),
        ),
    ])
}

fn default_cpu_port() -> PortNumber {
    PortNumber::DEFAULT_CPU
}

fn default_clone_session_id() -> u32 {
    57
}

fn default_replica_instance() -> u32 {
    1
}

fn default_idle_timeout_secs() -> u64 {
    3
}

fn default_new_dscp() -> u8 {
    5
}

fn default_decrement_ttl() -> bool {
    true
}

fn default_retry_interval_ms() -> u64 {
    2000
}

// Default implementations
impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            p4info: None,
            device_config: None,
            flow_table: default_flow_table(),
            flow_action: default_flow_action(),
            match_protocol: default_match_protocol(),
            match_src: default_match_src(),
            match_dst: default_match_dst(),
            param_port: default_param_port(),
            param_decrement_ttl: default_param_decrement_ttl(),
            param_new_dscp: default_param_new_dscp(),
            param_dst_mac: default_param_dst_mac(),
            ingress_counter: default_ingress_counter(),
            egress_counter: default_egress_counter(),
            packet_in: default_packet_in(),
            enums: default_enums(),
        }
    }
}

impl Default for PuntConfig {
    fn default() -> Self {
        Self {
            cpu_port: default_cpu_port(),
            clone_session_id: default_clone_session_id(),
            replica_instance: default_replica_instance(),
            truncation_bytes: 0,
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            new_dscp: default_new_dscp(),
            decrement_ttl: default_decrement_ttl(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl ControllerConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ControllerError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Get retry interval as Duration
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.recovery.retry_interval_ms)
    }

    /// Get idle timeout budget as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.flow.idle_timeout_secs)
    }

    /// Output port for `destination` on `switch`.
    pub fn route(&self, switch: &str, destination: Ipv4Addr) -> Result<PortNumber> {
        self.routes
            .get(switch)
            .and_then(|table| table.get(&destination))
            .copied()
            .ok_or_else(|| ControllerError::MissingRoute {
                switch: switch.to_string(),
                destination,
            })
    }

    /// Destination MAC for `destination`.
    pub fn address(&self, destination: Ipv4Addr) -> Result<MacAddress> {
        self.addresses
            .get(&destination)
            .copied()
            .ok_or(ControllerError::MissingAddress(destination))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.switches.is_empty() {
            return Err(ControllerError::Config(
                "at least one switch must be configured".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut device_ids = HashSet::new();
        for switch in &self.switches {
            if !names.insert(switch.name.as_str()) {
                return Err(ControllerError::Config(format!(
                    "switch name '{}' is configured twice",
                    switch.name
                )));
            }
            if !device_ids.insert(switch.device_id) {
                return Err(ControllerError::Config(format!(
                    "device id {} is configured twice",
                    switch.device_id
                )));
            }
        }

        if let Some(unknown) = self.routes.keys().find(|name| !names.contains(name.as_str())) {
            return Err(ControllerError::Config(format!(
                "routing table references unknown switch '{}'",
                unknown
            )));
        }

        let fits_port = |port: PortNumber| port.as_u64() >> PORT_BITWIDTH == 0;
        if !fits_port(self.punt.cpu_port) {
            return Err(ControllerError::Config(format!(
                "cpu_port {} does not fit in {} bits",
                self.punt.cpu_port, PORT_BITWIDTH
            )));
        }
        for (switch, table) in &self.routes {
            if let Some((destination, port)) = table.iter().find(|(_, port)| !fits_port(**port)) {
                return Err(ControllerError::Config(format!(
                    "route {} -> {} on switch '{}' does not fit in {} bits",
                    destination, port, switch, PORT_BITWIDTH
                )));
            }
        }

        if self.flow.idle_timeout_secs == 0 {
            return Err(ControllerError::Config(
                "idle_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.flow.new_dscp > 63 {
            return Err(ControllerError::Config(
                "new_dscp must be 0-63".to_string(),
            ));
        }

        if self.recovery.retry_interval_ms == 0 {
            return Err(ControllerError::Config(
                "retry_interval_ms must be > 0".to_string(),
            ));
        }

        PipelineSchema::from_config(&self.pipeline)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const MINIMAL: &str = r#"
[[switches]]
name = "s1"
address = "127.0.0.1:50051"
device_id = 0

[routes.s1]
"10.0.1.1" = 1
"10.0.2.2" = 2

[addresses]
"10.0.1.1" = "08:00:00:00:01:11"
"#;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.election_id, 1);
        assert_eq!(config.punt.cpu_port, PortNumber(510));
        assert_eq!(config.punt.clone_session_id, 57);
        assert_eq!(config.punt.replica_instance, 1);
        assert_eq!(config.punt.truncation_bytes, 0);
        assert_eq!(config.flow.new_dscp, 5);
        assert!(config.flow.decrement_ttl);
        assert_eq!(config.idle_timeout(), Duration::from_secs(3));
        assert_eq!(config.retry_interval(), Duration::from_secs(2));
        assert!(!config.diagnostics.enabled);
        assert_eq!(config.pipeline.flow_table, "MyIngress.flow_cache");
    }

    #[test]
    fn test_route_and_address_lookup() {
        let config = ControllerConfig::from_toml_str(MINIMAL).unwrap();
        let dst: Ipv4Addr = "10.0.1.1".parse().unwrap();
        assert_eq!(config.route("s1", dst).unwrap(), PortNumber(1));
        assert_eq!(
            config.address(dst).unwrap(),
            "08:00:00:00:01:11".parse::<MacAddress>().unwrap()
        );

        let missing: Ipv4Addr = "10.0.9.9".parse().unwrap();
        assert!(matches!(
            config.route("s1", missing),
            Err(ControllerError::MissingRoute { .. })
        ));
        assert!(matches!(
            config.route("s2", dst),
            Err(ControllerError::MissingRoute { .. })
        ));
        assert!(matches!(
            config.address(missing),
            Err(ControllerError::MissingAddress(_))
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_device_id() {
        let content = format!(
            "{}\n[[switches]]\nname = \"s2\"\naddress = \"127.0.0.1:50052\"\ndevice_id = 0\n",
            MINIMAL
        );
        assert!(matches!(
            ControllerConfig::from_toml_str(&content),
            Err(ControllerError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_route_for_unknown_switch() {
        let content = format!("{}\n[routes.s9]\n\"10.0.1.1\" = 1\n", MINIMAL);
        assert!(ControllerConfig::from_toml_str(&content).is_err());
    }

    #[test]
    fn test_validate_rejects_port_wider_than_action_param() {
        let content = MINIMAL.replace("\"10.0.2.2\" = 2", "\"10.0.2.2\" = 600");
        match ControllerConfig::from_toml_str(&content) {
            Err(ControllerError::Config(msg)) => assert!(msg.contains("10.0.2.2"), "{}", msg),
            other => panic!("unexpected result: {:?}", other),
        }

        let content = MINIMAL.replace("\"10.0.2.2\" = 2", "\"10.0.2.2\" = 511");
        assert!(ControllerConfig::from_toml_str(&content).is_ok());

        let content = format!("{}\n[punt]\ncpu_port = 512\n", MINIMAL);
        assert!(matches!(
            ControllerConfig::from_toml_str(&content),
            Err(ControllerError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_switch_list() {
        assert!(ControllerConfig::from_toml_str("").is_err());
    }

    #[test]
    fn test_invalid_mac_rejected() {
        let content = MINIMAL.replace("08:00:00:00:01:11", "08:00:00:zz:01:11");
        assert!(matches!(
            ControllerConfig::from_toml_str(&content),
            Err(ControllerError::Toml(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = ControllerConfig::load(file.path()).unwrap();
        assert_eq!(config.switches[0].identity().device_id, DeviceId(0));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            ControllerConfig::load("/nonexistent/flowcache.toml"),
            Err(ControllerError::Config(_))
        ));
    }

    #[test]
    fn test_bundled_config_is_valid() {
        let config =
            ControllerConfig::from_toml_str(include_str!("../config/flowcache.toml")).unwrap();
        assert_eq!(config.switches.len(), 3);
        assert_eq!(
            config.route("s2", "10.0.1.1".parse().unwrap()).unwrap(),
            PortNumber(2)
        );
    }
}
