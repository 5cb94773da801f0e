//! Common value types for a programmable switch fabric.
//!
//! These types are shared by the flow-cache controller and its tests:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`DeviceId`]: numeric identity of a switch on its control channel
//! - [`PortNumber`]: dataplane port numbers, including the CPU punt port

mod device;
mod mac;

pub use device::{DeviceId, PortNumber};
pub use mac::MacAddress;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid port number: {0}")]
    InvalidPortNumber(String),

    #[error("invalid device id: {0}")]
    InvalidDeviceId(String),
}
