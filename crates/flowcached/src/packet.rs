//! Ethernet/IPv4 header parsing for punted frames.

use crate::error::{ControllerError, Result};
use byteorder::{BigEndian, ByteOrder};
use fabric_types::MacAddress;
use std::net::Ipv4Addr;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

const ETHERNET_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const IPV4_MIN_HEADER_LEN: usize = 20;

/// The IPv4 fields a forwarding decision is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Flow {
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

/// Extracts protocol and addresses from an Ethernet frame, skipping one
/// 802.1Q tag if present.
pub fn parse_ipv4_flow(frame: &[u8]) -> Result<Ipv4Flow> {
    if frame.len() < ETHERNET_HEADER_LEN {
        return Err(ControllerError::Packet(format!(
            "frame of {} bytes is shorter than an Ethernet header",
            frame.len()
        )));
    }

    let mut offset = 12;
    let mut ethertype = BigEndian::read_u16(&frame[offset..]);
    if ethertype == ETHERTYPE_VLAN {
        offset += VLAN_TAG_LEN;
        if frame.len() < offset + 2 {
            return Err(ControllerError::Packet("truncated 802.1Q tag".to_string()));
        }
        ethertype = BigEndian::read_u16(&frame[offset..]);
    }
    if ethertype != ETHERTYPE_IPV4 {
        return Err(ControllerError::Packet(format!(
            "ethertype {:#06x} is not IPv4",
            ethertype
        )));
    }

    let ip = &frame[offset + 2..];
    if ip.len() < IPV4_MIN_HEADER_LEN {
        return Err(ControllerError::Packet(format!(
            "IPv4 header truncated to {} bytes",
            ip.len()
        )));
    }
    let version = ip[0] >> 4;
    let ihl = usize::from(ip[0] & 0x0f) * 4;
    if version != 4 || ihl < IPV4_MIN_HEADER_LEN || ip.len() < ihl {
        return Err(ControllerError::Packet(format!(
            "bad IPv4 version/IHL byte {:#04x}",
            ip[0]
        )));
    }

    Ok(Ipv4Flow {
        protocol: ip[9],
        src: Ipv4Addr::from(BigEndian::read_u32(&ip[12..16])),
        dst: Ipv4Addr::from(BigEndian::read_u32(&ip[16..20])),
    })
}

fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|pair| u32::from(BigEndian::read_u16(pair)))
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Builds an untagged Ethernet/IPv4 frame carrying `payload`.
///
/// Used to fabricate traffic for the simulated fabric.
pub fn build_ipv4_frame(
    src_mac: MacAddress,
    dst_mac: MacAddress,
    flow: &Ipv4Flow,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = (IPV4_MIN_HEADER_LEN + payload.len()) as u16;
    let mut frame = Vec::with_capacity(ETHERNET_HEADER_LEN + usize::from(total_len));
    frame.extend_from_slice(dst_mac.as_bytes());
    frame.extend_from_slice(src_mac.as_bytes());

    let mut ethertype = [0u8; 2];
    BigEndian::write_u16(&mut ethertype, ETHERTYPE_IPV4);
    frame.extend_from_slice(&ethertype);

    let mut header = [0u8; IPV4_MIN_HEADER_LEN];
    header[0] = 0x45;
    BigEndian::write_u16(&mut header[2..4], total_len);
    BigEndian::write_u16(&mut header[4..6], 1);
    BigEndian::write_u16(&mut header[6..8], 0x4000);
    header[8] = 64;
    header[9] = flow.protocol;
    BigEndian::write_u32(&mut header[12..16], u32::from(flow.src));
    BigEndian::write_u32(&mut header[16..20], u32::from(flow.dst));
    let checksum = ipv4_checksum(&header);
    BigEndian::write_u16(&mut header[10..12], checksum);

    frame.extend_from_slice(&header);
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn flow() -> Ipv4Flow {
        Ipv4Flow {
            protocol: 17,
            src: Ipv4Addr::new(10, 0, 2, 2),
            dst: Ipv4Addr::new(10, 0, 1, 1),
        }
    }

    fn frame() -> Vec<u8> {
        build_ipv4_frame(
            "08:00:00:00:02:22".parse().unwrap(),
            "08:00:00:00:01:11".parse().unwrap(),
            &flow(),
            b"hello",
        )
    }

    #[test]
    fn test_parse_untagged() {
        assert_eq!(parse_ipv4_flow(&frame()).unwrap(), flow());
    }

    #[test]
    fn test_parse_vlan_tagged() {
        let plain = frame();
        let mut tagged = plain[..12].to_vec();
        tagged.extend_from_slice(&[0x81, 0x00, 0x00, 0x0a]);
        tagged.extend_from_slice(&plain[12..]);
        assert_eq!(parse_ipv4_flow(&tagged).unwrap(), flow());
    }

    #[test]
    fn test_checksum_verifies() {
        let frame = frame();
        assert_eq!(ipv4_checksum(&frame[14..34]), 0);
    }

    #[test]
    fn test_rejects_non_ipv4() {
        let mut frame = frame();
        frame[12] = 0x86;
        frame[13] = 0xdd;
        assert!(matches!(
            parse_ipv4_flow(&frame),
            Err(ControllerError::Packet(_))
        ));
    }

    #[test]
    fn test_rejects_truncated() {
        assert!(parse_ipv4_flow(&frame()[..20]).is_err());
        assert!(parse_ipv4_flow(&[0u8; 4]).is_err());
    }
}
