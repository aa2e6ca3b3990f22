//! Per-flow sockets between a forward node and the game server.
//!
//! Both modes carry UDP flows only and hand back replies as UDP segments
//! (header plus payload) located in a buffer owned by the link. TCP needs
//! the kernel to stay out of the handshake on the leased port, which
//! neither mode arranges, so TCP flows are refused at setup.

use crate::config::EgressMode;
use crate::link::{FlowKey, PortLease};
use hopwire_common::packet::UDP_HEADER_LEN;
use hopwire_common::Proto;
use std::io;
use std::ops::Range;
use std::net::{SocketAddrV4, UdpSocket as StdUdpSocket};
use tokio::net::UdpSocket;

pub enum FlowSocket {
    Datagram(DatagramFlow),
    #[cfg(target_os = "linux")]
    Raw(raw::RawFlow),
}

impl FlowSocket {
    pub async fn open(mode: EgressMode, key: &FlowKey, lease: &mut PortLease) -> io::Result<Self> {
        if key.proto != Proto::Udp {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "egress carries UDP flows only",
            ));
        }
        match mode {
            EgressMode::Datagram => Ok(FlowSocket::Datagram(DatagramFlow::open(key, lease).await?)),
            #[cfg(target_os = "linux")]
            EgressMode::Raw => Ok(FlowSocket::Raw(raw::RawFlow::open(key, lease.local_addr())?)),
            #[cfg(not(target_os = "linux"))]
            EgressMode::Raw => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "raw egress is only available on Linux",
            )),
        }
    }

    /// Send one transport segment whose checksum follows the origin
    /// convention.
    pub async fn send(&self, transport: &mut [u8]) -> io::Result<()> {
        match self {
            FlowSocket::Datagram(flow) => flow.send(transport).await,
            #[cfg(target_os = "linux")]
            FlowSocket::Raw(flow) => flow.send(transport).await,
        }
    }

    /// Next reply from the server, read into `buf`. Returns where the UDP
    /// segment sits in `buf`, or `None` if what arrived does not belong to
    /// this flow.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<Option<Range<usize>>> {
        match self {
            FlowSocket::Datagram(flow) => flow.recv(buf).await.map(Some),
            #[cfg(target_os = "linux")]
            FlowSocket::Raw(flow) => flow.recv(buf).await,
        }
    }
}

// ============================================================================
// Datagram egress
// ============================================================================

/// UDP socket on the leased port, connected to the server so the kernel
/// drops anything from other peers.
pub struct DatagramFlow {
    socket: UdpSocket,
    server: SocketAddrV4,
    local_port: u16,
}

impl DatagramFlow {
    async fn open(key: &FlowKey, lease: &mut PortLease) -> io::Result<Self> {
        let socket = lease
            .take_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "lease socket already taken"))?;
        let socket: StdUdpSocket = socket.into();
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket)?;
        socket.connect(key.server).await?;
        Ok(Self {
            socket,
            server: key.server,
            local_port: lease.port(),
        })
    }

    async fn send(&self, transport: &mut [u8]) -> io::Result<()> {
        if transport.len() < UDP_HEADER_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "short UDP segment"));
        }
        self.socket.send(&transport[UDP_HEADER_LEN..]).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<Range<usize>> {
        if buf.len() <= UDP_HEADER_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "receive buffer too small"));
        }
        let n = self.socket.recv(&mut buf[UDP_HEADER_LEN..]).await?;
        let end = UDP_HEADER_LEN + n;

        // Checksum left zero; the terminal hop recomputes it.
        let udp = &mut buf[..UDP_HEADER_LEN];
        udp[0..2].copy_from_slice(&self.server.port().to_be_bytes());
        udp[2..4].copy_from_slice(&self.local_port.to_be_bytes());
        udp[4..6].copy_from_slice(&(end as u16).to_be_bytes());
        udp[6..8].copy_from_slice(&[0, 0]);
        Ok(0..end)
    }
}

// ============================================================================
// Raw egress
// ============================================================================

#[cfg(target_os = "linux")]
pub mod raw {
    use super::*;
    use hopwire_common::checksum::finalize_source;
    use hopwire_common::packet::parse_ipv4;
    use socket2::{Domain, Protocol, SockAddr, Socket, Type};
    use std::io::Read;
    use std::os::unix::io::AsRawFd;
    use tokio::io::unix::AsyncFd;
    use tracing::trace;

    // Classic BPF opcodes (linux/filter.h)
    const BPF_LD: u16 = 0x00;
    const BPF_LDX: u16 = 0x01;
    const BPF_JMP: u16 = 0x05;
    const BPF_RET: u16 = 0x06;
    const BPF_W: u16 = 0x00;
    const BPF_H: u16 = 0x08;
    const BPF_B: u16 = 0x10;
    const BPF_ABS: u16 = 0x20;
    const BPF_IND: u16 = 0x40;
    const BPF_MSH: u16 = 0xa0;
    const BPF_JEQ: u16 = 0x10;
    const BPF_K: u16 = 0x00;

    fn op(code: u16, jt: u8, jf: u8, k: u32) -> libc::sock_filter {
        libc::sock_filter { code, jt, jf, k }
    }

    /// Accept only IPv4 packets from `server` addressed to `local_port`.
    pub fn flow_filter(server: SocketAddrV4, local_port: u16) -> Vec<libc::sock_filter> {
        vec![
            op(BPF_LD | BPF_W | BPF_ABS, 0, 0, 12),
            op(BPF_JMP | BPF_JEQ | BPF_K, 0, 6, u32::from(*server.ip())),
            op(BPF_LDX | BPF_B | BPF_MSH, 0, 0, 0),
            op(BPF_LD | BPF_H | BPF_IND, 0, 0, 0),
            op(BPF_JMP | BPF_JEQ | BPF_K, 0, 3, u32::from(server.port())),
            op(BPF_LD | BPF_H | BPF_IND, 0, 0, 2),
            op(BPF_JMP | BPF_JEQ | BPF_K, 0, 1, u32::from(local_port)),
            op(BPF_RET | BPF_K, 0, 0, 0xffff),
            op(BPF_RET | BPF_K, 0, 0, 0),
        ]
    }

    fn attach_filter(socket: &Socket, filter: &mut [libc::sock_filter]) -> io::Result<()> {
        let prog = libc::sock_fprog {
            len: filter.len() as libc::c_ushort,
            filter: filter.as_mut_ptr(),
        };
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &prog as *const libc::sock_fprog as *const libc::c_void,
                std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub struct RawFlow {
        fd: AsyncFd<Socket>,
        local: SocketAddrV4,
        server: SocketAddrV4,
    }

    impl RawFlow {
        pub fn open(key: &FlowKey, local: SocketAddrV4) -> io::Result<Self> {
            let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::UDP))?;
            socket.bind(&SockAddr::from(SocketAddrV4::new(*local.ip(), 0)))?;
            attach_filter(&socket, &mut flow_filter(key.server, local.port()))?;
            socket.set_nonblocking(true)?;
            Ok(Self {
                fd: AsyncFd::new(socket)?,
                local,
                server: key.server,
            })
        }

        pub async fn send(&self, transport: &mut [u8]) -> io::Result<()> {
            finalize_source(transport, Proto::Udp, *self.local.ip(), self.local.port())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let dest = SockAddr::from(SocketAddrV4::new(*self.server.ip(), 0));
            let data: &[u8] = transport;
            loop {
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| inner.get_ref().send_to(data, &dest)) {
                    Ok(res) => return res.map(|_| ()),
                    Err(_would_block) => continue,
                }
            }
        }

        pub async fn recv(&self, buf: &mut [u8]) -> io::Result<Option<Range<usize>>> {
            let n = loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| (&*inner.get_ref()).read(&mut *buf)) {
                    Ok(res) => break res?,
                    Err(_would_block) => continue,
                }
            };

            // The kernel filter already matched; check again in case packets
            // were queued before it was attached.
            let Some(info) = parse_ipv4(&buf[..n]) else {
                return Ok(None);
            };
            if info.src != *self.server.ip() || info.fragmented {
                return Ok(None);
            }
            let segment = info.header_len..info.total_len;
            if segment.len() < UDP_HEADER_LEN {
                return Ok(None);
            }
            let t = &buf[segment.clone()];
            let sport = u16::from_be_bytes([t[0], t[1]]);
            let dport = u16::from_be_bytes([t[2], t[3]]);
            if sport != self.server.port() || dport != self.local.port() {
                trace!("raw flow {} ignored {}:{} -> {}", self.local, info.src, sport, dport);
                return Ok(None);
            }
            Ok(Some(segment))
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::PortAllocator;
    use std::net::Ipv4Addr;

    fn tcp_key() -> FlowKey {
        FlowKey {
            client: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 5000),
            proto: Proto::Tcp,
            port: 40000,
            server: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 27015),
        }
    }

    #[tokio::test]
    async fn test_tcp_flows_refused_in_every_mode() {
        let alloc = PortAllocator::new(Ipv4Addr::LOCALHOST, 4);
        for mode in [EgressMode::Datagram, EgressMode::Raw] {
            let mut lease = alloc.allocate(Proto::Tcp).unwrap();
            match FlowSocket::open(mode, &tcp_key(), &mut lease).await {
                Err(e) => assert_eq!(e.kind(), io::ErrorKind::Unsupported),
                Ok(_) => panic!("{:?} egress accepted a TCP flow", mode),
            }
        }
    }

    #[tokio::test]
    async fn test_datagram_reply_rebuilds_udp_header() {
        let server = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let server_addr = match server.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        let alloc = PortAllocator::new(Ipv4Addr::LOCALHOST, 4);
        let mut lease = alloc.allocate(Proto::Udp).unwrap();
        let key = FlowKey {
            proto: Proto::Udp,
            server: server_addr,
            ..tcp_key()
        };
        let flow = FlowSocket::open(EgressMode::Datagram, &key, &mut lease).await.unwrap();

        let mut seg = vec![0u8; UDP_HEADER_LEN];
        seg.extend_from_slice(b"hi");
        flow.send(&mut seg).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");
        server.send_to(b"hello", from).await.unwrap();

        // stale bytes from an earlier reply must not leak into the header
        let mut buf = vec![0xaa; 128];
        let range = flow.recv(&mut buf).await.unwrap().unwrap();
        let udp = &buf[range];
        assert_eq!(&udp[0..2], &server_addr.port().to_be_bytes());
        assert_eq!(&udp[2..4], &lease.port().to_be_bytes());
        assert_eq!(&udp[4..6], &13u16.to_be_bytes());
        assert_eq!(&udp[6..8], &[0, 0]);
        assert_eq!(&udp[8..], b"hello");
    }
}
