//! Relay wire header and control payloads.
//!
//! Every tunnel datagram starts with a fixed 13-byte header:
//!
//! ```text
//! [0]      kind
//! [1]      transport protocol (6 = TCP, 17 = UDP)
//! [2]      per-leg data id
//! [3..5]   client port, little-endian
//! [5..9]   client IPv4 address
//! [9..13]  server IPv4 address
//! ```
//!
//! For `Kind::Data` the bytes after the header are the original transport
//! segment. For every other kind they are a control payload, see [`Control`].

use crate::error::DecodeError;
use crate::geo::Coord;
use crate::packet::Packet;
use bytes::{Buf, BufMut, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};

pub const HEADER_SIZE: usize = 13;

// ============================================================================
// Kind / Proto
// ============================================================================

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Data = 1,
    PingGateway = 2,
    PingForward = 3,
    PingProxyer = 4,
    PackLossClientGateway = 5,
    PackLossGatewayForward = 6,
    PackLossForwardGateway = 7,
    LocGateway = 8,
    LocForward = 9,
    Route = 10,
}

impl Kind {
    pub fn is_data(self) -> bool {
        self == Kind::Data
    }

    pub fn is_ping(self) -> bool {
        matches!(self, Kind::PingGateway | Kind::PingForward | Kind::PingProxyer)
    }

    pub fn is_packet_loss(self) -> bool {
        matches!(
            self,
            Kind::PackLossClientGateway
                | Kind::PackLossGatewayForward
                | Kind::PackLossForwardGateway
        )
    }

    pub fn is_location(self) -> bool {
        matches!(self, Kind::LocGateway | Kind::LocForward)
    }
}

impl TryFrom<u8> for Kind {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            1 => Kind::Data,
            2 => Kind::PingGateway,
            3 => Kind::PingForward,
            4 => Kind::PingProxyer,
            5 => Kind::PackLossClientGateway,
            6 => Kind::PackLossGatewayForward,
            7 => Kind::PackLossForwardGateway,
            8 => Kind::LocGateway,
            9 => Kind::LocForward,
            10 => Kind::Route,
            other => return Err(DecodeError::InvalidKind(other)),
        })
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp = 6,
    Udp = 17,
}

impl Proto {
    pub fn number(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Proto {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            6 => Ok(Proto::Tcp),
            17 => Ok(Proto::Udp),
            other => Err(DecodeError::InvalidProto(other)),
        }
    }
}

// ============================================================================
// Header
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: Kind,
    pub proto: Proto,
    pub id: u8,
    pub client: SocketAddrV4,
    pub server: Ipv4Addr,
}

impl Header {
    pub fn new(kind: Kind, proto: Proto, id: u8, client: SocketAddrV4, server: Ipv4Addr) -> Self {
        Self {
            kind,
            proto,
            id,
            client,
            server,
        }
    }

    /// Control header with no client/server context yet.
    pub fn control(kind: Kind) -> Self {
        Self::new(
            kind,
            Proto::Udp,
            0,
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            Ipv4Addr::UNSPECIFIED,
        )
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = self.kind as u8;
        out[1] = self.proto as u8;
        out[2] = self.id;
        out[3..5].copy_from_slice(&self.client.port().to_le_bytes());
        out[5..9].copy_from_slice(&self.client.ip().octets());
        out[9..13].copy_from_slice(&self.server.octets());
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_SIZE {
            return Err(DecodeError::TooShort(data.len()));
        }
        let kind = Kind::try_from(data[0])?;
        let proto = Proto::try_from(data[1])?;
        let port = u16::from_le_bytes([data[3], data[4]]);
        let client_ip = Ipv4Addr::new(data[5], data[6], data[7], data[8]);
        let server = Ipv4Addr::new(data[9], data[10], data[11], data[12]);
        Ok(Self {
            kind,
            proto,
            id: data[2],
            client: SocketAddrV4::new(client_ip, port),
            server,
        })
    }

    /// Prepend the header to `packet`.
    pub fn encode(&self, packet: &mut Packet) {
        packet.attach(&self.to_bytes());
    }

    /// Parse the header at the front of `packet` and advance past it. On
    /// error the packet is left as it was.
    pub fn decode(packet: &mut Packet) -> Result<Self, DecodeError> {
        let header = Self::parse(packet.data())?;
        packet.detach(HEADER_SIZE);
        Ok(header)
    }
}

// ============================================================================
// Control payloads
// ============================================================================

/// Body of a non-Data packet. Requests for packet loss and location carry
/// no body; the answering hop fills it in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Control {
    Ping { stamp: u64 },
    PackLoss(Option<u8>),
    Location(Option<Coord>),
    Route(SocketAddrV4),
}

impl Control {
    pub fn decode(kind: Kind, mut body: &[u8]) -> Result<Self, DecodeError> {
        match kind {
            Kind::Data => Err(DecodeError::NotControl(kind)),
            Kind::PingGateway | Kind::PingForward | Kind::PingProxyer => {
                if body.len() < 8 {
                    return Err(DecodeError::BadPayload(kind));
                }
                Ok(Control::Ping {
                    stamp: body.get_u64_le(),
                })
            }
            Kind::PackLossClientGateway
            | Kind::PackLossGatewayForward
            | Kind::PackLossForwardGateway => Ok(Control::PackLoss(body.first().copied())),
            Kind::LocGateway | Kind::LocForward => {
                if body.is_empty() {
                    return Ok(Control::Location(None));
                }
                if body.len() < 8 {
                    return Err(DecodeError::BadPayload(kind));
                }
                let lat = body.get_f32_le();
                let lon = body.get_f32_le();
                Ok(Control::Location(Some(Coord::new(lat as f64, lon as f64))))
            }
            Kind::Route => {
                if body.len() < 6 {
                    return Err(DecodeError::BadPayload(kind));
                }
                let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                body.advance(4);
                Ok(Control::Route(SocketAddrV4::new(ip, body.get_u16_le())))
            }
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Control::Ping { stamp } => buf.put_u64_le(*stamp),
            Control::PackLoss(Some(pct)) => buf.put_u8(*pct),
            Control::PackLoss(None) | Control::Location(None) => {}
            Control::Location(Some(coord)) => {
                buf.put_f32_le(coord.lat as f32);
                buf.put_f32_le(coord.lon as f32);
            }
            Control::Route(addr) => {
                buf.put_slice(&addr.ip().octets());
                buf.put_u16_le(addr.port());
            }
        }
    }
}

/// Header followed by a control body, ready to send.
pub fn control_packet(header: &Header, control: &Control) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + 8);
    buf.put_slice(&header.to_bytes());
    control.encode(&mut buf);
    buf.to_vec()
}
