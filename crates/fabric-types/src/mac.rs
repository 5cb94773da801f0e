//! Ethernet MAC addresses as they appear in table action parameters.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 48-bit Ethernet MAC address.
///
/// Action parameters carry MAC addresses as 48-bit unsigned integers, so
/// the type converts losslessly to and from `u64`.
///
/// ```
/// use fabric_types::MacAddress;
///
/// let mac: MacAddress = "08:00:00:00:01:11".parse().unwrap();
/// assert_eq!(mac.to_u64(), 0x0800_0000_0111);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Width of a MAC address action parameter.
    pub const BITWIDTH: u32 = 48;

    pub const fn new(octets: [u8; 6]) -> Self {
        MacAddress(octets)
    }

    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// The address as a big-endian 48-bit integer.
    pub fn to_u64(&self) -> u64 {
        let mut wide = [0u8; 8];
        wide[2..].copy_from_slice(&self.0);
        u64::from_be_bytes(wide)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, octet) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", octet)?;
        }
        Ok(())
    }
}

impl FromStr for MacAddress {
    type Err = ParseError;

    /// Accepts `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff`, one separator
    /// style per address.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidMacAddress(s.to_string());
        let separator = match (s.contains(':'), s.contains('-')) {
            (true, false) => ':',
            (false, true) => '-',
            _ => return Err(invalid()),
        };

        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in s.split(separator) {
            let slot = octets.get_mut(count).ok_or_else(invalid)?;
            if !(1..=2).contains(&part.len()) {
                return Err(invalid());
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
            count += 1;
        }
        if count != octets.len() {
            return Err(invalid());
        }
        Ok(MacAddress(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> String {
        mac.to_string()
    }
}
