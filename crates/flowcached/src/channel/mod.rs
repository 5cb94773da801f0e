//! Switch control channel contract.
//!
//! A [`SwitchChannel`] is one control session to one switch. Every method is
//! a blocking call, the same shape as a synchronous P4Runtime client stub;
//! callers in async context must offload them (see
//! [`SwitchConnection`](crate::switch::SwitchConnection)).
//!
//! The controller never looks at the wire encoding. Match fields, action
//! parameters and packet-out metadata travel as `(value, bitwidth)` pairs
//! and the channel implementation owns the byte layout.

pub mod sim;

use bytes::Bytes;
use fabric_types::{DeviceId, PortNumber};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Status codes a control channel can report.
///
/// These correspond to the gRPC status space used by P4Runtime, minus `OK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        };
        write!(f, "{}", s)
    }
}

/// The only error type a [`SwitchChannel`] returns.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ChannelError {
    pub code: StatusCode,
    pub message: String,
}

impl ChannelError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The error a channel reports for calls made after `close()`.
    pub fn closed() -> Self {
        Self::new(StatusCode::Cancelled, "channel closed")
    }
}

/// Result type for channel calls.
pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// Identity of a managed switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchIdentity {
    pub name: String,
    pub address: String,
    pub device_id: DeviceId,
}

impl fmt::Display for SwitchIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, device {})", self.name, self.address, self.device_id)
    }
}

/// Compiled dataplane program pushed to each switch at startup.
#[derive(Debug, Clone, Default)]
pub struct ForwardingPipeline {
    /// P4Info describing tables, actions and controller metadata.
    pub p4info: Bytes,
    /// Target-specific device configuration (e.g. BMv2 JSON).
    pub device_config: Bytes,
}

impl ForwardingPipeline {
    /// Reads both pipeline artifacts from disk.
    pub fn load(p4info: &Path, device_config: &Path) -> std::io::Result<Self> {
        Ok(Self {
            p4info: Bytes::from(std::fs::read(p4info)?),
            device_config: Bytes::from(std::fs::read(device_config)?),
        })
    }
}

/// A `(value, bitwidth)` pair; the channel encodes it for the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BitField {
    pub value: u64,
    pub bitwidth: u32,
}

impl BitField {
    pub const fn new(value: u64, bitwidth: u32) -> Self {
        Self { value, bitwidth }
    }
}

/// An exact-match field of a table entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldMatch {
    pub field: String,
    pub value: BitField,
}

/// A named parameter of a table action.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionParam {
    pub name: String,
    pub value: BitField,
}

/// A table entry as written to or read from a switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub table: String,
    pub matches: Vec<FieldMatch>,
    pub action: String,
    pub params: Vec<ActionParam>,
    /// Zero disables idle-timeout tracking for the entry.
    pub idle_timeout_ns: u64,
}

impl TableEntry {
    /// The switch-side identity of this entry: its table and match key.
    pub fn rule_handle(&self) -> RuleHandle {
        RuleHandle::new(self.table.clone(), self.matches.clone())
    }
}

/// Opaque reference to an installed switch-side rule.
///
/// A rule is identified on the switch by its table and full match key, so
/// the handle carries exactly that and nothing about the action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleHandle {
    table: String,
    matches: Vec<FieldMatch>,
}

impl RuleHandle {
    pub fn new(table: impl Into<String>, mut matches: Vec<FieldMatch>) -> Self {
        matches.sort();
        Self {
            table: table.into(),
            matches,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn matches(&self) -> &[FieldMatch] {
        &self.matches
    }
}

impl fmt::Display for RuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.table)?;
        for (i, m) in self.matches.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:#x}", m.field, m.value.value)?;
        }
        write!(f, "]")
    }
}

/// One replica of a clone session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replica {
    pub egress_port: PortNumber,
    pub instance: u32,
}

/// Clone session written once per switch so the dataplane can punt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneSessionEntry {
    pub session_id: u32,
    pub replicas: Vec<Replica>,
    /// Zero disables truncation of cloned packets.
    pub packet_length_bytes: u32,
}

/// Side-channel metadata attached to a punted packet, still undecoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketMetadata {
    pub metadata_id: u32,
    /// Big-endian unsigned value.
    pub value: Bytes,
}

/// A punted packet as delivered by the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacketIn {
    pub payload: Bytes,
    pub metadata: Vec<PacketMetadata>,
}

/// Idle-timeout report for one or more expired rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleTimeoutNotification {
    pub rules: Vec<RuleHandle>,
    pub timestamp_ns: u64,
}

/// Packet and byte counts of one counter cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterData {
    pub packet_count: u64,
    pub byte_count: u64,
}

/// A counter cell read from a switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterEntry {
    pub counter: String,
    pub index: u64,
    pub data: CounterData,
}

/// One blocking control session to one switch.
///
/// Implementations must allow independent call types to run concurrently
/// (a listener blocked in [`packet_in`](Self::packet_in) must not stop a
/// write from the dispatcher), and [`close`](Self::close) must wake every
/// blocked call with [`ChannelError::closed`].
pub trait SwitchChannel: Send + Sync + 'static {
    /// Identity this session was opened for.
    fn identity(&self) -> &SwitchIdentity;

    /// Claims primary (master) role for this controller.
    fn arbitrate(&self, election_id: u64) -> ChannelResult<()>;

    fn set_forwarding_pipeline(&self, pipeline: &ForwardingPipeline) -> ChannelResult<()>;

    fn write_table_entry(&self, entry: &TableEntry) -> ChannelResult<RuleHandle>;

    fn delete_table_entry(&self, rule: &RuleHandle) -> ChannelResult<()>;

    /// Fails with [`StatusCode::AlreadyExists`] if the session is present.
    fn write_clone_session(&self, session: &CloneSessionEntry) -> ChannelResult<()>;

    /// Reads one counter cell, or every cell when `index` is `None`.
    fn read_counters(&self, counter: &str, index: Option<u64>) -> ChannelResult<Vec<CounterEntry>>;

    fn read_table_entries(&self) -> ChannelResult<Vec<TableEntry>>;

    /// Blocks until the next punted packet arrives.
    fn packet_in(&self) -> ChannelResult<RawPacketIn>;

    /// Blocks until the next idle-timeout notification arrives.
    fn idle_timeout_notification(&self) -> ChannelResult<IdleTimeoutNotification>;

    fn packet_out(&self, payload: &[u8], metadata: &[BitField]) -> ChannelResult<()>;

    /// Tears the session down. Must not block.
    fn close(&self);
}

/// Opens control sessions. Blocking, like the channel calls themselves.
pub trait ChannelConnector: Send + Sync + 'static {
    fn connect(&self, identity: &SwitchIdentity) -> ChannelResult<Arc<dyn SwitchChannel>>;
}
