//! Packet buffers with reserved headroom, plus IPv4 helpers for captured
//! traffic.
//!
//! Relay hops prepend a wire header or an IPv4 header to a payload they just
//! received. Reserving room in front of the payload lets that happen without
//! shifting the payload bytes.

use etherparse::Ipv4HeaderSlice;
use std::net::Ipv4Addr;

pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const MAX_PACKET_SIZE: usize = 65535;

/// Owned byte buffer whose readable region starts at `head`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    buf: Vec<u8>,
    head: usize,
}

impl Packet {
    /// Zero-filled buffer with `headroom` bytes reserved in front and
    /// `capacity` readable bytes after it. Call `truncate` once the real
    /// length is known.
    pub fn with_headroom(headroom: usize, capacity: usize) -> Self {
        Self {
            buf: vec![0u8; headroom + capacity],
            head: headroom,
        }
    }

    pub fn from_slice(headroom: usize, data: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(headroom + data.len());
        buf.resize(headroom, 0);
        buf.extend_from_slice(data);
        Self { buf, head: headroom }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { buf: data, head: 0 }
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.head..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.head..]
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn headroom(&self) -> usize {
        self.head
    }

    /// Keep only the first `len` readable bytes.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(self.head + len);
    }

    /// Prepend `prefix`, growing the headroom if it is too small.
    pub fn attach(&mut self, prefix: &[u8]) {
        if prefix.len() > self.head {
            let grow = prefix.len() - self.head;
            let mut buf = Vec::with_capacity(self.buf.len() + grow);
            buf.resize(grow, 0);
            buf.extend_from_slice(&self.buf);
            self.buf = buf;
            self.head += grow;
        }
        self.head -= prefix.len();
        self.buf[self.head..self.head + prefix.len()].copy_from_slice(prefix);
    }

    /// Advance the read cursor by `len` and return the skipped bytes.
    /// Returns `None` and leaves the packet untouched if it is too short.
    pub fn detach(&mut self, len: usize) -> Option<&[u8]> {
        if self.len() < len {
            return None;
        }
        let start = self.head;
        self.head += len;
        Some(&self.buf[start..self.head])
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        self.buf.drain(..self.head);
        self.buf
    }
}

/// Fields of a captured IPv4 packet the relay cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Info {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub header_len: usize,
    pub total_len: usize,
    pub fragmented: bool,
}

/// Parse the IPv4 header at the front of `data`. Non-IPv4 or truncated
/// input yields `None`.
pub fn parse_ipv4(data: &[u8]) -> Option<Ipv4Info> {
    let header = Ipv4HeaderSlice::from_slice(data).ok()?;
    let header_len = usize::from(header.ihl()) * 4;
    let total_len = usize::from(header.total_len());
    if total_len < header_len || total_len > data.len() {
        return None;
    }
    Some(Ipv4Info {
        src: header.source_addr(),
        dst: header.destination_addr(),
        protocol: header.protocol().0,
        header_len,
        total_len,
        fragmented: header.is_fragmenting_payload(),
    })
}

/// Write a 20-byte IPv4 header (DF set, TTL 64) with a zero checksum.
pub fn write_ipv4_header(
    out: &mut [u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    total_len: u16,
) {
    out[0] = 0x45;
    out[1] = 0x00;
    out[2..4].copy_from_slice(&total_len.to_be_bytes());
    out[4..6].copy_from_slice(&[0x00, 0x00]);
    out[6..8].copy_from_slice(&[0x40, 0x00]);
    out[8] = 64;
    out[9] = protocol;
    out[10..12].copy_from_slice(&[0x00, 0x00]);
    out[12..16].copy_from_slice(&src.octets());
    out[16..20].copy_from_slice(&dst.octets());
}
