//! Error types for the flow-cache controller.
//!
//! Errors fall into three groups that drive how the dispatcher reacts:
//!
//! - notification-local errors (bad metadata, missing route, malformed
//!   frame) drop the offending notification and processing continues
//! - fatal channel errors trigger an orderly shutdown of every switch
//! - [`ControllerError::Shutdown`] marks work abandoned because shutdown
//!   was already requested

use crate::channel::ChannelError;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Errors that can occur in the controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Deployment configuration is invalid or incomplete.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A packet-in carried a metadata id the pipeline schema does not know.
    ///
    /// Indicates version skew between the controller and the dataplane program.
    #[error("Packet-in metadata id {id} is not in the pipeline schema")]
    SchemaMismatch { id: u32 },

    /// A metadata value does not fit its declared bit width.
    #[error("Metadata field '{name}' value {value:#x} does not fit in {bitwidth} bits")]
    MetadataOverflow {
        name: String,
        value: u64,
        bitwidth: u32,
    },

    /// A packet-in lacks a metadata field the controller relies on.
    #[error("Packet-in is missing metadata field '{0}'")]
    MissingMetadata(String),

    /// No output port is configured for this destination on this switch.
    #[error("No route on switch {switch} for destination {destination}")]
    MissingRoute {
        switch: String,
        destination: Ipv4Addr,
    },

    /// No destination MAC is configured for this address.
    #[error("No address table entry for destination {0}")]
    MissingAddress(Ipv4Addr),

    /// The punted frame could not be parsed as Ethernet/IPv4.
    #[error("Malformed packet: {0}")]
    Packet(String),

    /// A switch control channel failed with a non-retryable status.
    #[error("Switch {switch}: {operation} failed: {source}")]
    Channel {
        switch: String,
        operation: &'static str,
        #[source]
        source: ChannelError,
    },

    /// A controller task panicked or was aborted.
    #[error("Task failed: {0}")]
    Task(String),

    /// Work was abandoned because shutdown was requested.
    #[error("Controller is shutting down")]
    Shutdown,

    /// IO error while loading configuration or pipeline artifacts.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file is not valid TOML for the expected schema.
    #[error("Invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    /// A metric could not be created or registered.
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// A fabric value (MAC, port, device id) failed to parse.
    #[error("Parse error: {0}")]
    Parse(#[from] fabric_types::ParseError),
}

impl ControllerError {
    /// Returns true if the error only invalidates the notification being
    /// processed and the dispatcher should continue with the next one.
    pub fn is_notification_local(&self) -> bool {
        matches!(
            self,
            ControllerError::SchemaMismatch { .. }
                | ControllerError::MetadataOverflow { .. }
                | ControllerError::MissingMetadata(_)
                | ControllerError::MissingRoute { .. }
                | ControllerError::MissingAddress(_)
                | ControllerError::Packet(_)
                | ControllerError::Parse(_)
        )
    }

    /// Returns the switch a channel failure came from, if any.
    pub fn switch(&self) -> Option<&str> {
        match self {
            ControllerError::Channel { switch, .. } => Some(switch),
            ControllerError::MissingRoute { switch, .. } => Some(switch),
            _ => None,
        }
    }
}

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;
