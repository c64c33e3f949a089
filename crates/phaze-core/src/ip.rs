//! Minimal inspection of tunnelled IP packets.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Destination address of an IPv4 or IPv6 packet, if the header is intact.
pub fn packet_destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Source address of an IPv4 or IPv6 packet, if the header is intact.
pub fn packet_source(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[12..16].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[8..24].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45;
        packet[12..16].copy_from_slice(&src);
        packet[16..20].copy_from_slice(&dst);
        packet
    }

    #[test]
    fn test_ipv4_addresses() {
        let packet = ipv4_packet([10, 9, 0, 2], [1, 1, 1, 1]);
        assert_eq!(
            packet_destination(&packet),
            Some(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)))
        );
        assert_eq!(
            packet_source(&packet),
            Some(IpAddr::V4(Ipv4Addr::new(10, 9, 0, 2)))
        );
    }

    #[test]
    fn test_ipv6_destination() {
        let mut packet = vec![0u8; 40];
        packet[0] = 0x60;
        packet[39] = 1;
        assert_eq!(packet_destination(&packet), Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn test_truncated_or_unknown() {
        assert_eq!(packet_destination(&[]), None);
        assert_eq!(packet_destination(&[0x45; 10]), None);
        assert_eq!(packet_destination(&[0x10; 64]), None);
    }
}
