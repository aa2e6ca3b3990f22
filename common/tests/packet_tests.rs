//! Tests for packet buffers and the relay checksum convention

use hopwire_common::checksum::{
    finalize_source, fold, prepare_origin, rechecksum, sum16, transport_checksum,
    validate_origin, verify_transport,
};
use hopwire_common::packet::{parse_ipv4, write_ipv4_header, IPV4_HEADER_LEN};
use hopwire_common::Proto;
use std::net::Ipv4Addr;

const SERVER: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);
const EGRESS: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 20);

/// Create a UDP segment (header + payload) with a zero checksum
fn create_udp_segment(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let len = (8 + payload.len()) as u16;
    let mut seg = Vec::with_capacity(len as usize);
    seg.extend_from_slice(&src_port.to_be_bytes());
    seg.extend_from_slice(&dst_port.to_be_bytes());
    seg.extend_from_slice(&len.to_be_bytes());
    seg.extend_from_slice(&[0x00, 0x00]);
    seg.extend_from_slice(payload);
    seg
}

/// Create a TCP segment (20-byte header + payload) with a zero checksum
fn create_tcp_segment(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut seg = vec![0u8; 20];
    seg[0..2].copy_from_slice(&src_port.to_be_bytes());
    seg[2..4].copy_from_slice(&dst_port.to_be_bytes());
    seg[4..8].copy_from_slice(&0x1234_5678u32.to_be_bytes()); // seq
    seg[12] = 0x50; // data offset 5
    seg[13] = 0x18; // PSH, ACK
    seg[14..16].copy_from_slice(&[0xFF, 0xFF]); // window
    seg.extend_from_slice(payload);
    seg
}

/// Wrap a transport segment in an IPv4 header
fn create_ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, proto: Proto, transport: &[u8]) -> Vec<u8> {
    let total = IPV4_HEADER_LEN + transport.len();
    let mut packet = vec![0u8; total];
    write_ipv4_header(&mut packet, src, dst, proto.number(), total as u16);
    packet[IPV4_HEADER_LEN..].copy_from_slice(transport);
    packet
}

// ============================================================================
// Origin / Finalize
// ============================================================================

#[test]
fn test_udp_patch_matches_direct_computation() {
    let mut seg = create_udp_segment(40000, 27015, b"hello game server");
    let port = prepare_origin(&mut seg, SERVER, Proto::Udp).unwrap();
    assert_eq!(port, 40000);
    assert_eq!(&seg[0..2], &40000u16.to_be_bytes());
    assert!(validate_origin(&seg, SERVER, Proto::Udp));

    let mut patched = seg.clone();
    finalize_source(&mut patched, Proto::Udp, EGRESS, 51000).unwrap();

    let mut direct = seg.clone();
    direct[0..2].copy_from_slice(&51000u16.to_be_bytes());
    let expected = transport_checksum(EGRESS, SERVER, Proto::Udp, &direct);

    assert_eq!(&patched[0..2], &51000u16.to_be_bytes());
    assert_eq!(&patched[6..8], &expected.to_be_bytes());
}

#[test]
fn test_tcp_patch_matches_direct_computation() {
    let mut seg = create_tcp_segment(52311, 443, &[0xAB; 31]);
    prepare_origin(&mut seg, SERVER, Proto::Tcp).unwrap();
    assert!(validate_origin(&seg, SERVER, Proto::Tcp));

    let mut patched = seg.clone();
    finalize_source(&mut patched, Proto::Tcp, EGRESS, 61000).unwrap();

    let mut direct = seg.clone();
    direct[0..2].copy_from_slice(&61000u16.to_be_bytes());
    let expected = transport_checksum(EGRESS, SERVER, Proto::Tcp, &direct);
    assert_eq!(&patched[16..18], &expected.to_be_bytes());

    let packet = create_ipv4_packet(EGRESS, SERVER, Proto::Tcp, &patched);
    assert!(verify_transport(&packet));
}

#[test]
fn test_patched_packet_verifies_on_the_wire() {
    let mut seg = create_udp_segment(1234, 5678, &[1, 2, 3, 4, 5]);
    prepare_origin(&mut seg, SERVER, Proto::Udp).unwrap();
    finalize_source(&mut seg, Proto::Udp, EGRESS, 40001).unwrap();

    let packet = create_ipv4_packet(EGRESS, SERVER, Proto::Udp, &seg);
    assert!(verify_transport(&packet));
}

#[test]
fn test_validate_origin_detects_corruption() {
    let mut seg = create_udp_segment(1000, 2000, b"payload");
    prepare_origin(&mut seg, SERVER, Proto::Udp).unwrap();
    seg[9] ^= 0x01;
    assert!(!validate_origin(&seg, SERVER, Proto::Udp));
}

#[test]
fn test_validate_origin_depends_on_destination() {
    let mut seg = create_udp_segment(1000, 2000, b"payload");
    prepare_origin(&mut seg, SERVER, Proto::Udp).unwrap();
    assert!(!validate_origin(&seg, Ipv4Addr::new(203, 0, 113, 8), Proto::Udp));
}

// ============================================================================
// Rechecksum
// ============================================================================

#[test]
fn test_rechecksum_fixes_both_checksums() {
    let seg = create_udp_segment(27015, 40000, b"reply");
    let mut packet = create_ipv4_packet(SERVER, Ipv4Addr::new(10, 0, 0, 2), Proto::Udp, &seg);
    assert!(!verify_transport(&packet));

    rechecksum(&mut packet).unwrap();

    assert_eq!(fold(sum16(&packet[..IPV4_HEADER_LEN])), 0xFFFF);
    assert!(verify_transport(&packet));
    assert_ne!(&packet[26..28], &[0, 0]);
}

#[test]
fn test_rechecksum_rejects_unknown_protocol() {
    let mut packet = create_ipv4_packet(SERVER, EGRESS, Proto::Udp, &[0u8; 8]);
    packet[9] = 1;
    assert!(rechecksum(&mut packet).is_err());
}

// ============================================================================
// IPv4 parsing
// ============================================================================

#[test]
fn test_parse_captured_udp() {
    let seg = create_udp_segment(40000, 27015, &[0u8; 36]);
    let packet = create_ipv4_packet(Ipv4Addr::new(192, 168, 1, 1), SERVER, Proto::Udp, &seg);

    let info = parse_ipv4(&packet).unwrap();
    assert_eq!(info.src, Ipv4Addr::new(192, 168, 1, 1));
    assert_eq!(info.dst, SERVER);
    assert_eq!(info.protocol, 17);
    assert_eq!(info.header_len, 20);
    assert_eq!(info.total_len, 64);
}

#[test]
fn test_parse_detects_fragment() {
    let seg = create_udp_segment(1, 2, &[0u8; 8]);
    let mut packet = create_ipv4_packet(EGRESS, SERVER, Proto::Udp, &seg);
    packet[6] = 0x20; // more fragments
    let info = parse_ipv4(&packet).unwrap();
    assert!(info.fragmented);
}

#[test]
fn test_parse_rejects_truncated() {
    let seg = create_udp_segment(1, 2, &[0u8; 8]);
    let packet = create_ipv4_packet(EGRESS, SERVER, Proto::Udp, &seg);
    assert!(parse_ipv4(&packet[..24]).is_none());
}
