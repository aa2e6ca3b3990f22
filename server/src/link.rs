//! Per-flow links of a forward node.
//!
//! A link multiplexes one original client connection onto a locally
//! allocated port. The uplink map finds the link for a packet arriving from
//! the tunnel; the downlink map finds it for a reply arriving from the game
//! server. Both entries always come and go together.

use crate::egress::FlowSocket;
use hopwire_common::{Proto, RelayError, RelayResult};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Socket, Type};
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Identity of an original connection as seen by the forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Client endpoint as observed by the gateway.
    pub client: SocketAddrV4,
    pub proto: Proto,
    /// Source port of the connection on the player's machine.
    pub port: u16,
    pub server: SocketAddrV4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DownlinkKey {
    /// Port allocated on the forward.
    pub port: u16,
    pub proto: Proto,
    pub server: SocketAddrV4,
}

pub struct Link {
    pub id: u64,
    pub key: FlowKey,
    /// Gateway the flow arrived from.
    pub tunnel: SocketAddr,
    pub socket: FlowSocket,
    lease: PortLease,
    alive: AtomicBool,
}

impl Link {
    pub fn new(id: u64, key: FlowKey, tunnel: SocketAddr, lease: PortLease, socket: FlowSocket) -> Self {
        Self {
            id,
            key,
            tunnel,
            socket,
            lease,
            alive: AtomicBool::new(true),
        }
    }

    pub fn port(&self) -> u16 {
        self.lease.port()
    }

    pub fn downlink_key(&self) -> DownlinkKey {
        DownlinkKey {
            port: self.port(),
            proto: self.key.proto,
            server: self.key.server,
        }
    }

    pub fn touch(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Read and clear the liveness flag.
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("tunnel", &self.tunnel)
            .field("port", &self.port())
            .finish()
    }
}

// ============================================================================
// Link table
// ============================================================================

struct Slot {
    link: Arc<Link>,
    // Dropping the sender stops the link task.
    _stop: oneshot::Sender<()>,
}

#[derive(Default)]
struct Tables {
    uplink: HashMap<FlowKey, Slot>,
    downlink: HashMap<DownlinkKey, Arc<Link>>,
}

#[derive(Default)]
pub struct LinkTable {
    inner: RwLock<Tables>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<Link>> {
        self.inner.read().uplink.get(key).map(|s| s.link.clone())
    }

    pub fn downlink(&self, key: &DownlinkKey) -> Option<Arc<Link>> {
        self.inner.read().downlink.get(key).cloned()
    }

    /// Register both directions of `link`. If the flow already has a link,
    /// nothing is inserted and the existing link is returned.
    pub fn insert(&self, link: Arc<Link>, stop: oneshot::Sender<()>) -> Result<(), Arc<Link>> {
        let mut tables = self.inner.write();
        if let Some(existing) = tables.uplink.get(&link.key) {
            return Err(existing.link.clone());
        }
        tables.downlink.insert(link.downlink_key(), link.clone());
        tables.uplink.insert(
            link.key,
            Slot {
                link,
                _stop: stop,
            },
        );
        Ok(())
    }

    /// Remove `link` from both maps. A newer link for the same flow is left
    /// alone. Returns true if anything was removed.
    pub fn remove(&self, link: &Link) -> bool {
        let mut tables = self.inner.write();
        let owned = tables
            .uplink
            .get(&link.key)
            .map(|s| s.link.id == link.id)
            .unwrap_or(false);
        if !owned {
            return false;
        }
        let slot = tables.uplink.remove(&link.key);
        let dk = link.downlink_key();
        if tables.downlink.get(&dk).map(|l| l.id) == Some(link.id) {
            tables.downlink.remove(&dk);
        }
        drop(tables);
        drop(slot);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.read().uplink.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<Link>> {
        self.inner.read().uplink.values().map(|s| s.link.clone()).collect()
    }

    /// Drop every link, stopping all link tasks.
    pub fn clear(&self) {
        let mut tables = self.inner.write();
        let uplink = std::mem::take(&mut tables.uplink);
        tables.downlink.clear();
        drop(tables);
        drop(uplink);
    }
}

// ============================================================================
// Port allocation
// ============================================================================

/// Reserves local ports by binding placeholder sockets on `ip:0`.
pub struct PortAllocator {
    ip: Ipv4Addr,
    max: usize,
    held: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(ip: Ipv4Addr, max: usize) -> Arc<Self> {
        Arc::new(Self {
            ip,
            max,
            held: Mutex::new(HashSet::new()),
        })
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn in_use(&self) -> usize {
        self.held.lock().len()
    }

    pub fn allocate(self: &Arc<Self>, proto: Proto) -> RelayResult<PortLease> {
        if self.in_use() >= self.max {
            return Err(RelayError::Exhausted(self.ip));
        }
        let ty = match proto {
            Proto::Udp => Type::DGRAM,
            Proto::Tcp => Type::STREAM,
        };
        let socket = Socket::new(Domain::IPV4, ty, None).map_err(RelayError::Flow)?;
        socket
            .bind(&SocketAddr::V4(SocketAddrV4::new(self.ip, 0)).into())
            .map_err(RelayError::Flow)?;
        let port = socket
            .local_addr()
            .map_err(RelayError::Flow)?
            .as_socket_ipv4()
            .map(|a| a.port())
            .ok_or(RelayError::Exhausted(self.ip))?;

        let mut held = self.held.lock();
        if held.len() >= self.max || !held.insert(port) {
            return Err(RelayError::Exhausted(self.ip));
        }
        Ok(PortLease {
            port,
            socket: Some(socket),
            allocator: self.clone(),
        })
    }
}

/// A reserved port. The port returns to the allocator when the lease drops.
pub struct PortLease {
    port: u16,
    socket: Option<Socket>,
    allocator: Arc<PortAllocator>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.allocator.ip, self.port)
    }

    /// Hand over the placeholder socket to be used for the flow itself.
    pub fn take_socket(&mut self) -> Option<Socket> {
        self.socket.take()
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.held.lock().remove(&self.port);
    }
}
