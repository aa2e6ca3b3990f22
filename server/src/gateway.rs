//! Gateway node: the player-facing hop.
//!
//! Clients send tunnel traffic to the gateway's listen socket. Data is
//! relayed to the forward bound for the packet's server; replies from
//! forwards come back on a separate socket and are fanned out to clients.

use crate::config::GatewayConfig;
use anyhow::{Context, Result};
use hopwire_common::error::is_transient_io;
use hopwire_common::{
    control_packet, Control, Header, Kind, Leg, NodeMetrics, Packet, PeerSummary, RelayError,
    RelayResult,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

/// State kept per client tunnel endpoint.
pub struct ClientSession {
    pub leg: Leg,
    routes: RwLock<HashMap<Ipv4Addr, SocketAddrV4>>,
    last_seen: Mutex<Instant>,
}

impl ClientSession {
    fn new(pl_window: u64) -> Self {
        Self {
            leg: Leg::new(pl_window),
            routes: RwLock::new(HashMap::new()),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn route(&self, server: Ipv4Addr) -> Option<SocketAddrV4> {
        self.routes.read().get(&server).copied()
    }
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

struct Inner {
    config: GatewayConfig,
    client_socket: UdpSocket,
    forward_socket: UdpSocket,
    clients: RwLock<HashMap<SocketAddrV4, Arc<ClientSession>>>,
    forwards: RwLock<HashMap<SocketAddrV4, Arc<Leg>>>,
    metrics: NodeMetrics,
    epoch: Instant,
}

impl Gateway {
    pub async fn bind(config: GatewayConfig) -> Result<Self> {
        let client_socket = UdpSocket::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind gateway socket on {}", config.listen))?;
        let forward_socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
            .await
            .context("failed to bind gateway forward socket")?;

        info!(
            "Gateway listening on {}, forwards via {}",
            client_socket.local_addr()?,
            forward_socket.local_addr()?
        );
        match config.default_forward {
            Some(fwd) => info!("Default forward: {}", fwd),
            None => warn!("No default forward configured; unbound servers are dropped"),
        }

        let forwards = config
            .forwards
            .iter()
            .chain(config.default_forward.iter())
            .map(|addr| (*addr, Arc::new(Leg::new(config.pl_window))))
            .collect();

        Ok(Self {
            inner: Arc::new(Inner {
                client_socket,
                forward_socket,
                clients: RwLock::new(HashMap::new()),
                forwards: RwLock::new(forwards),
                metrics: NodeMetrics::new(),
                epoch: Instant::now(),
                config,
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.client_socket.local_addr()
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.inner.metrics
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.read().len()
    }

    pub fn session(&self, client: SocketAddrV4) -> Option<Arc<ClientSession>> {
        self.inner.clients.read().get(&client).cloned()
    }

    /// Round-trip time to a forward from the last heartbeat.
    pub fn forward_rtt(&self, forward: SocketAddrV4) -> Option<Duration> {
        self.inner.forwards.read().get(&forward).and_then(|leg| leg.rtt())
    }

    /// Loss and round-trip time toward each configured forward.
    pub fn peer_summary(&self) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self
            .inner
            .forwards
            .read()
            .iter()
            .map(|(addr, leg)| PeerSummary {
                peer: SocketAddr::V4(*addr),
                loss_percent: leg.loss_percent(),
                rtt: leg.rtt(),
                links: None,
            })
            .collect();
        peers.sort_by_key(|p| p.peer);
        peers
    }

    /// Serve both directions until one of the sockets fails.
    pub async fn run(&self) -> Result<()> {
        let sweeper = self.clone();
        let sweep = tokio::spawn(async move { sweeper.sweep_sessions().await });
        let beater = self.clone();
        let heartbeat = tokio::spawn(async move { beater.heartbeat().await });

        let result = tokio::select! {
            r = self.uplink_loop() => r,
            r = self.downlink_loop() => r,
        };
        sweep.abort();
        heartbeat.abort();
        result
    }

    fn client_session(&self, client: SocketAddrV4) -> Arc<ClientSession> {
        if let Some(session) = self.inner.clients.read().get(&client) {
            return session.clone();
        }
        let mut clients = self.inner.clients.write();
        clients
            .entry(client)
            .or_insert_with(|| {
                info!("New client session {}", client);
                Arc::new(ClientSession::new(self.inner.config.pl_window))
            })
            .clone()
    }

    fn forward_leg(&self, forward: SocketAddrV4) -> Arc<Leg> {
        if let Some(leg) = self.inner.forwards.read().get(&forward) {
            return leg.clone();
        }
        self.inner
            .forwards
            .write()
            .entry(forward)
            .or_insert_with(|| Arc::new(Leg::new(self.inner.config.pl_window)))
            .clone()
    }

    fn forward_for(&self, session: &ClientSession, server: Ipv4Addr) -> Option<SocketAddrV4> {
        session.route(server).or(self.inner.config.default_forward)
    }

    // ========================================================================
    // Client -> gateway
    // ========================================================================

    async fn uplink_loop(&self) -> Result<()> {
        let mut buf = vec![0u8; self.inner.config.buffer_size];
        loop {
            let (len, from) = match self.inner.client_socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) if is_transient_io(&e) => continue,
                Err(e) => {
                    error!("Gateway client socket failed: {}", e);
                    return Err(e).context("gateway client receive failed");
                }
            };
            let SocketAddr::V4(from) = from else {
                continue;
            };
            let packet = Packet::from_slice(0, &buf[..len]);
            if let Err(e) = self.handle_uplink(packet, from).await {
                self.drop_packet("from", from, e);
            }
        }
    }

    async fn handle_uplink(&self, mut packet: Packet, from: SocketAddrV4) -> RelayResult<()> {
        let mut header = Header::decode(&mut packet)?;
        let session = self.client_session(from);
        session.touch();

        match header.kind {
            Kind::Data => {
                if !session.leg.accept(header.id) {
                    self.inner.metrics.record_duplicate();
                    return Ok(());
                }
                let Some(forward) = self.forward_for(&session, header.server) else {
                    debug!("No forward for {} from {}", header.server, from);
                    self.inner.metrics.record_dropped();
                    return Ok(());
                };
                let len = packet.len();
                header.client = from;
                header.id = self.forward_leg(forward).next_id();
                header.encode(&mut packet);
                self.inner.forward_socket.send_to(packet.data(), forward).await?;
                self.inner.metrics.record_up(len);
                Ok(())
            }
            Kind::PingGateway => {
                header.encode(&mut packet);
                self.inner.client_socket.send_to(packet.data(), from).await?;
                Ok(())
            }
            Kind::PackLossClientGateway => {
                let pct = session.leg.loss_percent();
                self.reply(&header, &Control::PackLoss(Some(pct)), from).await
            }
            Kind::PackLossForwardGateway => {
                let pct = self
                    .forward_for(&session, header.server)
                    .map(|fwd| self.forward_leg(fwd).loss_percent());
                self.reply(&header, &Control::PackLoss(pct), from).await
            }
            Kind::LocGateway => {
                let location = Control::Location(self.inner.config.location);
                self.reply(&header, &location, from).await
            }
            Kind::Route => {
                let Control::Route(forward) = Control::decode(header.kind, packet.data())? else {
                    return Ok(());
                };
                let previous = session.routes.write().insert(header.server, forward);
                if previous != Some(forward) {
                    info!("Client {} bound {} via {}", from, header.server, forward);
                }
                self.forward_leg(forward);
                Ok(())
            }
            Kind::PingForward | Kind::PackLossGatewayForward | Kind::LocForward => {
                let Some(forward) = self.forward_for(&session, header.server) else {
                    debug!("No forward to relay {:?} for {}", header.kind, from);
                    return Ok(());
                };
                header.client = from;
                header.encode(&mut packet);
                self.inner.forward_socket.send_to(packet.data(), forward).await?;
                Ok(())
            }
            Kind::PingProxyer => Ok(()),
        }
    }

    /// Count a packet that could not be relayed. Send failures only cost
    /// the packet: the destination came from a peer and may be unusable.
    fn drop_packet(&self, origin: &str, peer: SocketAddrV4, err: RelayError) {
        match err {
            RelayError::Io(e) => warn!("Send for packet {} {} failed: {}", origin, peer, e),
            e => debug!("Dropped packet {} {}: {}", origin, peer, e),
        }
        self.inner.metrics.record_dropped();
    }

    async fn reply(&self, header: &Header, control: &Control, to: SocketAddrV4) -> RelayResult<()> {
        let bytes = control_packet(header, control);
        self.inner.client_socket.send_to(&bytes, to).await?;
        Ok(())
    }

    // ========================================================================
    // Forward -> gateway
    // ========================================================================

    async fn downlink_loop(&self) -> Result<()> {
        let mut buf = vec![0u8; self.inner.config.buffer_size];
        loop {
            let (len, from) = match self.inner.forward_socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) if is_transient_io(&e) => continue,
                Err(e) => {
                    error!("Gateway forward socket failed: {}", e);
                    return Err(e).context("gateway forward receive failed");
                }
            };
            let SocketAddr::V4(from) = from else {
                continue;
            };
            let packet = Packet::from_slice(0, &buf[..len]);
            if let Err(e) = self.handle_downlink(packet, from).await {
                self.drop_packet("from forward", from, e);
            }
        }
    }

    async fn handle_downlink(&self, mut packet: Packet, from: SocketAddrV4) -> RelayResult<()> {
        let mut header = Header::decode(&mut packet)?;
        match header.kind {
            Kind::Data => {
                self.forward_leg(from).record(header.id);
                let tunnel = header.client;
                let Some(session) = self.session(tunnel) else {
                    debug!("Reply for unknown client {}", tunnel);
                    self.inner.metrics.record_dropped();
                    return Ok(());
                };
                let transport = packet.data();
                if transport.len() < 4 {
                    return Err(hopwire_common::DecodeError::TooShort(transport.len()).into());
                }
                let dst_port = u16::from_be_bytes([transport[2], transport[3]]);
                let len = packet.len();

                header.client = SocketAddrV4::new(*tunnel.ip(), dst_port);
                header.id = session.leg.next_id();
                header.encode(&mut packet);
                for _ in 0..self.inner.config.redundancy.max(1) {
                    self.inner.client_socket.send_to(packet.data(), tunnel).await?;
                }
                self.inner.metrics.record_down(len);
                Ok(())
            }
            Kind::PingProxyer => {
                if let Control::Ping { stamp } = Control::decode(header.kind, packet.data())? {
                    let now = self.inner.epoch.elapsed().as_micros() as u64;
                    let rtt = Duration::from_micros(now.saturating_sub(stamp));
                    self.forward_leg(from).record_rtt(rtt);
                    debug!("Forward {} rtt {:?}", from, rtt);
                }
                Ok(())
            }
            Kind::PingForward | Kind::PackLossGatewayForward | Kind::LocForward => {
                let client = header.client;
                header.encode(&mut packet);
                self.inner.client_socket.send_to(packet.data(), client).await?;
                Ok(())
            }
            other => {
                debug!("Gateway ignoring {:?} from forward {}", other, from);
                Ok(())
            }
        }
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    async fn heartbeat(&self) {
        let mut ticker = tokio::time::interval(self.inner.config.keepalive());
        loop {
            ticker.tick().await;
            let targets: Vec<SocketAddrV4> = self.inner.forwards.read().keys().copied().collect();
            for forward in targets {
                let stamp = self.inner.epoch.elapsed().as_micros() as u64;
                let bytes = control_packet(&Header::control(Kind::PingProxyer), &Control::Ping { stamp });
                if let Err(e) = self.inner.forward_socket.send_to(&bytes, forward).await {
                    debug!("Heartbeat to {} failed: {}", forward, e);
                }
            }
        }
    }

    async fn sweep_sessions(&self) {
        let timeout = self.inner.config.session_timeout();
        let mut ticker = tokio::time::interval(self.inner.config.keepalive());
        loop {
            ticker.tick().await;
            let mut clients = self.inner.clients.write();
            let before = clients.len();
            clients.retain(|addr, session| {
                let keep = session.idle_for() < timeout;
                if !keep {
                    info!("Removing idle client session {}", addr);
                }
                keep
            });
            let removed = before - clients.len();
            drop(clients);
            if removed > 0 {
                info!("Cleaned up {} idle client sessions", removed);
            }
        }
    }
}
