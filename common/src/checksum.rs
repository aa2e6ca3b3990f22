//! Transport checksum handling across relay hops.
//!
//! The client does not know which address and port the forward node will send
//! a flow from. It computes the transport checksum as if the source address
//! and source port were both zero (`prepare_origin`). The forward then adds
//! its real source address and port into the checksum in constant time
//! (`finalize_source`). Only the terminal hop before injection recomputes
//! everything from scratch (`rechecksum`).
//!
//! IPv4 only.

use crate::error::DecodeError;
use crate::protocol::Proto;
use std::net::Ipv4Addr;

// ============================================================================
// One's-complement primitives
// ============================================================================

/// Sum of big-endian 16-bit words. An odd trailing byte is padded with zero.
pub fn sum16(data: &[u8]) -> u64 {
    let mut sum = 0u64;
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        sum += u64::from(u16::from_be_bytes([c[0], c[1]]));
    }
    if let [b] = chunks.remainder() {
        sum += u64::from(*b) << 8;
    }
    sum
}

pub fn fold(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

pub fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, len: usize) -> u64 {
    sum16(&src.octets()) + sum16(&dst.octets()) + u64::from(proto) + len as u64
}

/// Offset of the checksum field inside the transport header.
pub fn checksum_offset(proto: Proto) -> usize {
    match proto {
        Proto::Udp => 6,
        Proto::Tcp => 16,
    }
}

fn min_header_len(proto: Proto) -> usize {
    match proto {
        Proto::Udp => 8,
        Proto::Tcp => 20,
    }
}

fn check_len(transport: &[u8], proto: Proto) -> Result<(), DecodeError> {
    if transport.len() < min_header_len(proto) {
        return Err(DecodeError::TooShort(transport.len()));
    }
    Ok(())
}

/// Full checksum of `transport` with the checksum field treated as zero.
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, proto: Proto, transport: &[u8]) -> u16 {
    let off = checksum_offset(proto);
    let stored = sum16(&transport[off..off + 2]);
    // one's-complement subtraction of the stored field
    let sum = pseudo_header_sum(src, dst, proto.number(), transport.len())
        + sum16(transport)
        + (0xffff - stored);
    let cksum = !fold(sum);
    if proto == Proto::Udp && cksum == 0 {
        0xffff
    } else {
        cksum
    }
}

// ============================================================================
// Relay convention
// ============================================================================

/// Rewrite the checksum of a captured segment as if it had been sent from
/// `0.0.0.0:0`. The source port is restored afterwards without being folded
/// back in. Returns the original source port.
pub fn prepare_origin(transport: &mut [u8], dst: Ipv4Addr, proto: Proto) -> Result<u16, DecodeError> {
    check_len(transport, proto)?;
    let off = checksum_offset(proto);
    let port = u16::from_be_bytes([transport[0], transport[1]]);

    transport[0..2].copy_from_slice(&[0, 0]);
    transport[off..off + 2].copy_from_slice(&[0, 0]);
    let sum = pseudo_header_sum(Ipv4Addr::UNSPECIFIED, dst, proto.number(), transport.len())
        + sum16(transport);
    transport[off..off + 2].copy_from_slice(&(!fold(sum)).to_be_bytes());
    transport[0..2].copy_from_slice(&port.to_be_bytes());
    Ok(port)
}

/// Add the egress source address and port into an origin-prepared checksum
/// and overwrite the source port. Constant time.
pub fn finalize_source(
    transport: &mut [u8],
    proto: Proto,
    src: Ipv4Addr,
    port: u16,
) -> Result<(), DecodeError> {
    check_len(transport, proto)?;
    let off = checksum_offset(proto);
    let old = u16::from_be_bytes([transport[off], transport[off + 1]]);
    let sum = u64::from(!old) + sum16(&src.octets()) + u64::from(port);
    let mut cksum = !fold(sum);
    if proto == Proto::Udp && cksum == 0 {
        cksum = 0xffff;
    }
    transport[off..off + 2].copy_from_slice(&cksum.to_be_bytes());
    transport[0..2].copy_from_slice(&port.to_be_bytes());
    Ok(())
}

/// True if `transport` carries an origin-prepared checksum for `dst`.
pub fn validate_origin(transport: &[u8], dst: Ipv4Addr, proto: Proto) -> bool {
    if check_len(transport, proto).is_err() {
        return false;
    }
    let mut copy = transport.to_vec();
    copy[0..2].copy_from_slice(&[0, 0]);
    let sum = pseudo_header_sum(Ipv4Addr::UNSPECIFIED, dst, proto.number(), copy.len())
        + sum16(&copy);
    fold(sum) == 0xffff
}

// ============================================================================
// Full recompute
// ============================================================================

pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let stored = sum16(&header[10..12]);
    !fold(sum16(header) + (0xffff - stored))
}

/// Recompute both the IPv4 header checksum and the TCP/UDP checksum of a
/// complete IPv4 packet in place.
pub fn rechecksum(packet: &mut [u8]) -> Result<(), DecodeError> {
    if packet.len() < 20 {
        return Err(DecodeError::TooShort(packet.len()));
    }
    let ihl = usize::from(packet[0] & 0x0f) * 4;
    let total = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
    if ihl < 20 || total < ihl || total > packet.len() {
        return Err(DecodeError::TooShort(packet.len()));
    }
    let proto = Proto::try_from(packet[9])?;
    let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);

    let ip_cksum = ipv4_header_checksum(&packet[..ihl]);
    packet[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    let transport = &mut packet[ihl..total];
    check_len(transport, proto)?;
    let cksum = transport_checksum(src, dst, proto, transport);
    let off = checksum_offset(proto);
    transport[off..off + 2].copy_from_slice(&cksum.to_be_bytes());
    Ok(())
}

/// True if the transport checksum of a complete IPv4 packet verifies.
pub fn verify_transport(packet: &[u8]) -> bool {
    if packet.len() < 20 {
        return false;
    }
    let ihl = usize::from(packet[0] & 0x0f) * 4;
    let total = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
    let Ok(proto) = Proto::try_from(packet[9]) else {
        return false;
    };
    if total > packet.len() || total < ihl + min_header_len(proto) {
        return false;
    }
    let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    let transport = &packet[ihl..total];
    let sum = pseudo_header_sum(src, dst, proto.number(), transport.len()) + sum16(transport);
    fold(sum) == 0xffff
}
