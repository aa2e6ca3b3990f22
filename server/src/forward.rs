//! Forward node: terminates the tunnel and talks to game servers.
//!
//! Each original connection gets a link with its own port and socket toward
//! the server. Replies are rewrapped with a relay header and sent back to the
//! gateway the flow came from.

use crate::config::{EgressMode, ForwardConfig};
use crate::egress::FlowSocket;
use crate::link::{DownlinkKey, FlowKey, Link, LinkTable, PortAllocator};
use anyhow::{bail, Context, Result};
use hopwire_common::checksum::validate_origin;
use hopwire_common::error::is_transient_io;
use hopwire_common::{
    control_packet, Control, Header, Kind, Leg, NodeMetrics, Packet, PeerSummary, RelayError,
    RelayResult, HEADER_SIZE,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct Forward {
    inner: Arc<Inner>,
}

struct Inner {
    config: ForwardConfig,
    socket: UdpSocket,
    links: LinkTable,
    allocator: Arc<PortAllocator>,
    gateways: RwLock<HashMap<SocketAddr, Arc<Leg>>>,
    metrics: NodeMetrics,
    next_link_id: AtomicU64,
}

impl Forward {
    pub async fn bind(config: ForwardConfig) -> Result<Self> {
        if config.egress == EgressMode::Raw && config.local_ip.is_unspecified() {
            bail!("raw egress needs local_ip set to the address flows leave from");
        }
        let socket = UdpSocket::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind forward socket on {}", config.listen))?;
        let allocator = PortAllocator::new(config.local_ip, config.max_links);

        info!(
            "Forward listening on {} ({:?} egress via {})",
            socket.local_addr()?,
            config.egress,
            config.local_ip
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                socket,
                links: LinkTable::new(),
                allocator,
                gateways: RwLock::new(HashMap::new()),
                metrics: NodeMetrics::new(),
                next_link_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.inner.metrics
    }

    pub fn links(&self) -> &LinkTable {
        &self.inner.links
    }

    /// Loss from each gateway seen so far and the links it holds open.
    pub fn peer_summary(&self) -> Vec<PeerSummary> {
        let mut open: HashMap<SocketAddr, usize> = HashMap::new();
        for link in self.inner.links.snapshot() {
            *open.entry(link.tunnel).or_default() += 1;
        }
        let mut peers: Vec<PeerSummary> = self
            .inner
            .gateways
            .read()
            .iter()
            .map(|(addr, leg)| PeerSummary {
                peer: *addr,
                loss_percent: leg.loss_percent(),
                rtt: None,
                links: Some(open.get(addr).copied().unwrap_or(0)),
            })
            .collect();
        peers.sort_by_key(|p| p.peer);
        peers
    }

    pub fn ports_in_use(&self) -> usize {
        self.inner.allocator.in_use()
    }

    /// Close every link.
    pub fn shutdown(&self) {
        let count = self.inner.links.len();
        self.inner.links.clear();
        info!("Forward closed {} links", count);
    }

    /// Receive loop on the tunnel socket. Returns only on a fatal receive
    /// error; failed sends and flow setup only cost the packet.
    pub async fn run(&self) -> Result<()> {
        let mut buf = vec![0u8; self.inner.config.buffer_size];
        loop {
            let (len, from) = match self.inner.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) if is_transient_io(&e) => {
                    debug!("Forward receive error: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("Forward socket failed: {}", e);
                    return Err(e).context("forward receive failed");
                }
            };
            let packet = Packet::from_slice(0, &buf[..len]);
            if let Err(e) = self.handle(packet, from).await {
                match e {
                    RelayError::Io(_) | RelayError::Flow(_) => {
                        warn!("Dropped packet from {}: {}", from, e);
                    }
                    _ => debug!("Dropped packet from {}: {}", from, e),
                }
                self.inner.metrics.record_dropped();
            }
        }
    }

    async fn handle(&self, mut packet: Packet, from: SocketAddr) -> RelayResult<()> {
        let header = Header::decode(&mut packet)?;
        match header.kind {
            Kind::Data => self.handle_data(header, packet, from).await,
            Kind::PingForward | Kind::PingProxyer => {
                header.encode(&mut packet);
                self.inner.socket.send_to(packet.data(), from).await?;
                Ok(())
            }
            Kind::PackLossGatewayForward => {
                let pct = self.gateway_leg(from).loss_percent();
                self.reply(&header, &Control::PackLoss(Some(pct)), from).await
            }
            Kind::LocForward => {
                let location = Control::Location(self.inner.config.location);
                self.reply(&header, &location, from).await
            }
            other => {
                debug!("Forward ignoring {:?} from {}", other, from);
                Ok(())
            }
        }
    }

    async fn reply(&self, header: &Header, control: &Control, to: SocketAddr) -> RelayResult<()> {
        let bytes = control_packet(header, control);
        self.inner.socket.send_to(&bytes, to).await?;
        Ok(())
    }

    fn gateway_leg(&self, addr: SocketAddr) -> Arc<Leg> {
        if let Some(leg) = self.inner.gateways.read().get(&addr) {
            return leg.clone();
        }
        self.inner
            .gateways
            .write()
            .entry(addr)
            .or_insert_with(|| Arc::new(Leg::new(self.inner.config.pl_window)))
            .clone()
    }

    async fn handle_data(&self, header: Header, mut packet: Packet, from: SocketAddr) -> RelayResult<()> {
        self.gateway_leg(from).record(header.id);

        let len = packet.len();
        let transport = packet.data_mut();
        if transport.len() < 4 {
            return Err(hopwire_common::DecodeError::TooShort(transport.len()).into());
        }
        let src_port = u16::from_be_bytes([transport[0], transport[1]]);
        let dst_port = u16::from_be_bytes([transport[2], transport[3]]);
        let key = FlowKey {
            client: header.client,
            proto: header.proto,
            port: src_port,
            server: SocketAddrV4::new(header.server, dst_port),
        };

        if cfg!(debug_assertions) && !validate_origin(transport, header.server, header.proto) {
            warn!("Origin checksum mismatch on {:?}", key);
        }

        let link = match self.inner.links.get(&key) {
            Some(link) => link,
            None => self.open_link(key, from).await?,
        };
        link.touch();

        if let Err(e) = link.socket.send(transport).await {
            warn!("Link {} to {} failed: {}", link.id, key.server, e);
            self.inner.links.remove(&link);
            self.inner.metrics.record_dropped();
            return Ok(());
        }
        self.inner.metrics.record_up(len);
        Ok(())
    }

    async fn open_link(&self, key: FlowKey, tunnel: SocketAddr) -> RelayResult<Arc<Link>> {
        let mut lease = match self.inner.allocator.allocate(key.proto) {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Cannot open link for {:?}: {}", key, e);
                return Err(e);
            }
        };
        let socket = FlowSocket::open(self.inner.config.egress, &key, &mut lease)
            .await
            .map_err(RelayError::Flow)?;
        let id = self.inner.next_link_id.fetch_add(1, Ordering::Relaxed);
        let link = Arc::new(Link::new(id, key, tunnel, lease, socket));

        let (stop_tx, stop_rx) = oneshot::channel();
        if let Err(existing) = self.inner.links.insert(link.clone(), stop_tx) {
            return Ok(existing);
        }
        self.inner.metrics.record_link_opened();
        info!(
            "Link {} opened: {}:{} -> {} on port {}",
            id,
            key.client,
            key.port,
            key.server,
            link.port()
        );

        let forward = self.clone();
        let task_link = link.clone();
        tokio::spawn(async move {
            forward.drive_link(task_link, stop_rx).await;
        });
        Ok(link)
    }

    /// Per-link task: relays replies and tears the link down once it has
    /// been idle for a full keepalive period or its socket fails.
    async fn drive_link(&self, link: Arc<Link>, mut stop: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.inner.config.keepalive());
        ticker.tick().await;
        let mut buf = vec![0u8; self.inner.config.buffer_size];

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    if !link.take_alive() {
                        debug!("Link {} idle", link.id);
                        break;
                    }
                }
                res = link.socket.recv(&mut buf) => match res {
                    Ok(Some(segment)) => {
                        let packet = Packet::from_slice(HEADER_SIZE, &buf[segment]);
                        if let Err(e) = self.handle_reply(&link, packet).await {
                            debug!("Link {} reply dropped: {}", link.id, e);
                            self.inner.metrics.record_dropped();
                        }
                    }
                    Ok(None) => {}
                    Err(e) if is_transient_io(&e) => {}
                    Err(e) => {
                        warn!("Link {} socket error: {}", link.id, e);
                        break;
                    }
                },
            }
        }

        self.inner.links.remove(&link);
        self.inner.metrics.record_link_closed();
        info!("Link {} closed ({}:{} -> {})", link.id, link.key.client, link.key.port, link.key.server);
    }

    async fn handle_reply(&self, link: &Link, mut packet: Packet) -> RelayResult<()> {
        let len = packet.len();
        let transport = packet.data_mut();
        if transport.len() < 4 {
            return Err(hopwire_common::DecodeError::TooShort(transport.len()).into());
        }
        let dst_port = u16::from_be_bytes([transport[2], transport[3]]);
        let key = DownlinkKey {
            port: dst_port,
            proto: link.key.proto,
            server: link.key.server,
        };
        let Some(owner) = self.inner.links.downlink(&key) else {
            debug!("No link owns reply on port {}", dst_port);
            return Ok(());
        };
        transport[2..4].copy_from_slice(&owner.key.port.to_be_bytes());
        owner.touch();

        let header = Header::new(
            Kind::Data,
            owner.key.proto,
            self.gateway_leg(owner.tunnel).next_id(),
            owner.key.client,
            *owner.key.server.ip(),
        );
        header.encode(&mut packet);
        self.inner.socket.send_to(packet.data(), owner.tunnel).await?;
        self.inner.metrics.record_down(len);
        Ok(())
    }
}
