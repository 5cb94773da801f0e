//! Switch and port identifiers.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric device id of a switch on its control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse()
            .map(DeviceId)
            .map_err(|_| ParseError::InvalidDeviceId(s.to_string()))
    }
}

/// A dataplane port number.
///
/// Port numbers travel to the switch in 9-bit or wider fields; the type only
/// guards against values that do not fit the 32-bit packet-out operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortNumber(pub u32);

impl PortNumber {
    /// The CPU port used by the reference dataplane for punted packets.
    pub const DEFAULT_CPU: PortNumber = PortNumber(510);

    /// Returns the port as an unsigned integer suitable for encoding.
    pub const fn as_u64(&self) -> u64 {
        self.0 as u64
    }
}

impl fmt::Display for PortNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PortNumber {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse()
            .map(PortNumber)
            .map_err(|_| ParseError::InvalidPortNumber(s.to_string()))
    }
}

impl From<u32> for PortNumber {
    fn from(port: u32) -> Self {
        PortNumber(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_port_parse() {
        assert_eq!("3".parse::<PortNumber>().unwrap(), PortNumber(3));
        assert!("-1".parse::<PortNumber>().is_err());
        assert!("port3".parse::<PortNumber>().is_err());
        assert_eq!(PortNumber::DEFAULT_CPU.as_u64(), 510);
    }

    #[test]
    fn test_device_id_display() {
        let id: DeviceId = "2".parse().unwrap();
        assert_eq!(id, DeviceId(2));
        assert_eq!(id.to_string(), "2");
        assert!("s2".parse::<DeviceId>().is_err());
    }
}
