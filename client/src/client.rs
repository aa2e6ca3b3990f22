//! Client node: turns captured game packets into tunnel traffic and back.

use crate::capture::{Captured, PacketCapture};
use crate::config::ClientConfig;
use crate::locator::IpApiLocator;
use crate::route::{GeoProbe, RoutePair, RouteProbe, RouteSelector};
use anyhow::{Context, Result};
use hopwire_common::checksum::{prepare_origin, rechecksum};
use hopwire_common::error::is_transient_io;
use hopwire_common::packet::{parse_ipv4, write_ipv4_header, IPV4_HEADER_LEN};
use hopwire_common::{
    control_packet, Control, Coord, Header, Kind, Leg, Mailbox, NodeMetrics, Packet, Proto,
    RelayError, RelayResult,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

/// Server address used for diagnostic queries that are not about a
/// particular game server.
pub const PROBE_SERVER: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// Control reply received from a relay.
#[derive(Debug, Clone, Copy)]
pub struct Reply {
    pub header: Header,
    pub control: Control,
    pub from: SocketAddrV4,
}

/// Packet loss per leg, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LossReport {
    pub client_gateway: u8,
    pub gateway_forward: u8,
    pub forward_gateway: u8,
    pub gateway_client: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Locations {
    pub gateway: Option<Coord>,
    pub forward: Option<Coord>,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    socket: UdpSocket,
    routes: RouteSelector,
    gateways: RwLock<HashMap<SocketAddrV4, Arc<Leg>>>,
    bindings: Mutex<HashMap<(SocketAddrV4, Ipv4Addr), (SocketAddrV4, Instant)>>,
    replies: Mailbox<Reply>,
    local_ip: RwLock<Option<Ipv4Addr>>,
    enabled: AtomicBool,
    metrics: NodeMetrics,
    epoch: Instant,
}

impl Client {
    /// Client with geographic route probing through ip-api.com.
    pub async fn bind(config: ClientConfig) -> Result<Self> {
        let locator = IpApiLocator::new(
            config.geo_endpoint.clone(),
            Duration::from_millis(config.geo_timeout_ms),
        )
        .context("failed to build geolocation client")?;
        let prober = GeoProbe::new(
            Arc::new(locator),
            config.gateways.clone(),
            config.forwards.clone(),
            config.client_location,
            config.default_route(),
        );
        Self::with_prober(config, Arc::new(prober)).await
    }

    pub async fn with_prober(config: ClientConfig, prober: Arc<dyn RouteProbe>) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind)
            .await
            .with_context(|| format!("failed to bind client socket on {}", config.bind))?;
        info!("Client tunnel socket on {}", socket.local_addr()?);
        if let Some(fixed) = config.fixed_route {
            info!("Fixed route: gateway {} forward {}", fixed.gateway, fixed.forward);
        }

        let routes = RouteSelector::new(config.fixed_route, config.default_route(), prober);
        Ok(Self {
            inner: Arc::new(Inner {
                socket,
                routes,
                gateways: RwLock::new(HashMap::new()),
                bindings: Mutex::new(HashMap::new()),
                replies: Mailbox::new(config.mailbox_capacity),
                local_ip: RwLock::new(None),
                enabled: AtomicBool::new(true),
                metrics: NodeMetrics::new(),
                epoch: Instant::now(),
                config,
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.inner.metrics
    }

    pub fn routes(&self) -> &RouteSelector {
        &self.inner.routes
    }

    /// When disabled every captured packet passes through untouched.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
        info!("Acceleration {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    /// Relay captured traffic until the capture driver shuts down or a
    /// receive on the tunnel socket fails.
    pub async fn run(&self, capture: Arc<dyn PacketCapture>) -> Result<()> {
        tokio::select! {
            r = self.uplink_loop(capture.as_ref()) => r,
            r = self.downlink_loop(Some(capture.as_ref())) => r,
        }
    }

    /// Receive control replies only. Needed for diagnostics when `run` is
    /// not active.
    pub async fn serve_control(&self) -> Result<()> {
        self.downlink_loop(None).await
    }

    fn gateway_leg(&self, gateway: SocketAddrV4) -> Arc<Leg> {
        if let Some(leg) = self.inner.gateways.read().get(&gateway) {
            return leg.clone();
        }
        self.inner
            .gateways
            .write()
            .entry(gateway)
            .or_insert_with(|| Arc::new(Leg::new(self.inner.config.pl_window)))
            .clone()
    }

    // ========================================================================
    // Uplink
    // ========================================================================

    async fn uplink_loop(&self, capture: &dyn PacketCapture) -> Result<()> {
        loop {
            let captured = match capture.recv().await {
                Ok(Some(c)) => c,
                Ok(None) => {
                    info!("Capture closed");
                    return Ok(());
                }
                Err(e) => return Err(e).context("capture receive failed"),
            };
            // A gateway that rejects sends costs only this packet.
            if let Err(e) = self.handle_captured(captured, capture).await {
                match e {
                    RelayError::Io(e) => warn!("Dropped captured packet: {}", e),
                    e => debug!("Dropped captured packet: {}", e),
                }
                self.inner.metrics.record_dropped();
            }
        }
    }

    async fn handle_captured(&self, captured: Captured, capture: &dyn PacketCapture) -> RelayResult<()> {
        if !captured.game || !self.is_enabled() {
            capture.inject(captured.data).await?;
            return Ok(());
        }
        let info = match parse_ipv4(&captured.data) {
            Some(info) if !info.fragmented => info,
            _ => {
                capture.inject(captured.data).await?;
                return Ok(());
            }
        };
        let Ok(proto) = Proto::try_from(info.protocol) else {
            capture.inject(captured.data).await?;
            return Ok(());
        };
        *self.inner.local_ip.write() = Some(info.src);

        let server = info.dst;
        let route = match self.inner.routes.match_route(server, self.inner.config.probe_routes) {
            Ok(route) => route,
            Err(e) if e.is_temporary() => {
                debug!("Dropping packet to {}: {}", server, e);
                self.inner.metrics.record_dropped();
                return Ok(());
            }
            Err(e) => {
                warn!("{}; using default route for {}", e, server);
                let fallback = self.inner.routes.default_route();
                self.inner.routes.insert(server, fallback);
                fallback
            }
        };

        let mut packet = Packet::from_vec(captured.data);
        packet.truncate(info.total_len);
        let _ = packet.detach(info.header_len);
        let port = prepare_origin(packet.data_mut(), server, proto)?;

        self.ensure_binding(route, server).await?;

        let len = packet.len();
        let leg = self.gateway_leg(route.gateway);
        let header = Header::new(
            Kind::Data,
            proto,
            leg.next_id(),
            SocketAddrV4::new(info.src, port),
            server,
        );
        header.encode(&mut packet);
        for _ in 0..self.inner.config.redundancy.max(1) {
            self.inner.socket.send_to(packet.data(), route.gateway).await?;
        }
        self.inner.metrics.record_up(len);
        Ok(())
    }

    /// Tell the gateway which forward to use for `server` if it has not
    /// been told recently.
    async fn ensure_binding(&self, route: RoutePair, server: Ipv4Addr) -> RelayResult<()> {
        let refresh = self.inner.config.route_refresh();
        let stale = match self.inner.bindings.lock().get(&(route.gateway, server)) {
            Some((forward, at)) => *forward != route.forward || at.elapsed() >= refresh,
            None => true,
        };
        if !stale {
            return Ok(());
        }

        let mut header = Header::control(Kind::Route);
        header.server = server;
        let bytes = control_packet(&header, &Control::Route(route.forward));
        self.inner.socket.send_to(&bytes, route.gateway).await?;
        self.inner
            .bindings
            .lock()
            .insert((route.gateway, server), (route.forward, Instant::now()));
        debug!("Bound {} via {} at {}", server, route.forward, route.gateway);
        Ok(())
    }

    // ========================================================================
    // Downlink
    // ========================================================================

    async fn downlink_loop(&self, capture: Option<&dyn PacketCapture>) -> Result<()> {
        let mut buf = vec![0u8; self.inner.config.buffer_size];
        loop {
            let (len, from) = match self.inner.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) if is_transient_io(&e) => continue,
                Err(e) => {
                    error!("Client socket failed: {}", e);
                    return Err(e).context("client receive failed");
                }
            };
            let SocketAddr::V4(from) = from else {
                continue;
            };
            let packet = Packet::from_slice(IPV4_HEADER_LEN, &buf[..len]);
            if let Err(e) = self.handle_downlink(packet, from, capture).await {
                debug!("Dropped packet from {}: {}", from, e);
                self.inner.metrics.record_dropped();
            }
        }
    }

    async fn handle_downlink(
        &self,
        mut packet: Packet,
        from: SocketAddrV4,
        capture: Option<&dyn PacketCapture>,
    ) -> RelayResult<()> {
        let header = Header::decode(&mut packet)?;
        if header.kind != Kind::Data {
            if header.kind == Kind::Route {
                return Ok(());
            }
            let control = Control::decode(header.kind, packet.data())?;
            if self
                .inner
                .replies
                .push_evict(Reply {
                    header,
                    control,
                    from,
                })
                .is_some()
            {
                debug!("Reply mailbox full, dropped oldest reply");
            }
            return Ok(());
        }

        if !self.gateway_leg(from).accept(header.id) {
            self.inner.metrics.record_duplicate();
            return Ok(());
        }
        let Some(capture) = capture else {
            return Ok(());
        };
        let Some(local) = *self.inner.local_ip.read() else {
            debug!("No local address learned yet, dropping reply");
            return Ok(());
        };

        let len = packet.len();
        let total = IPV4_HEADER_LEN + len;
        let mut ip = [0u8; IPV4_HEADER_LEN];
        write_ipv4_header(&mut ip, header.server, local, header.proto.number(), total as u16);
        packet.attach(&ip);
        rechecksum(packet.data_mut())?;
        capture.inject(packet.into_vec()).await?;
        self.inner.metrics.record_down(len);
        Ok(())
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    async fn query<F>(&self, gateway: SocketAddrV4, header: Header, control: Control, matches: F) -> RelayResult<Reply>
    where
        F: FnMut(&Reply) -> bool,
    {
        let bytes = control_packet(&header, &control);
        self.inner.socket.send_to(&bytes, gateway).await?;
        tokio::time::timeout(self.inner.config.query_timeout(), self.inner.replies.pop_matching(matches))
            .await
            .map_err(|_| {
                RelayError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no {:?} reply from {}", header.kind, gateway),
                ))
            })
    }

    /// Round-trip time to the gateway (`PingGateway`) or through it to the
    /// forward (`PingForward`).
    pub async fn ping(&self, kind: Kind, route: RoutePair) -> RelayResult<Duration> {
        if kind == Kind::PingForward {
            self.ensure_binding(route, PROBE_SERVER).await?;
        }
        let stamp = self.inner.epoch.elapsed().as_micros() as u64;
        let mut header = Header::control(kind);
        header.server = PROBE_SERVER;
        self.query(route.gateway, header, Control::Ping { stamp }, |r| {
            r.header.kind == kind && r.control == Control::Ping { stamp }
        })
        .await?;
        let now = self.inner.epoch.elapsed().as_micros() as u64;
        Ok(Duration::from_micros(now.saturating_sub(stamp)))
    }

    /// Loss on all four legs of `route`. Gateway to client loss is measured
    /// here; the rest are asked of the relays.
    pub async fn packet_loss(&self, route: RoutePair) -> RelayResult<LossReport> {
        self.ensure_binding(route, PROBE_SERVER).await?;
        let mut report = LossReport {
            gateway_client: self.gateway_leg(route.gateway).loss_percent(),
            ..LossReport::default()
        };
        for kind in [
            Kind::PackLossClientGateway,
            Kind::PackLossGatewayForward,
            Kind::PackLossForwardGateway,
        ] {
            let mut header = Header::control(kind);
            header.server = PROBE_SERVER;
            let reply = self
                .query(route.gateway, header, Control::PackLoss(None), |r| r.header.kind == kind)
                .await?;
            let pct = match reply.control {
                Control::PackLoss(Some(pct)) => pct,
                _ => 0,
            };
            match kind {
                Kind::PackLossClientGateway => report.client_gateway = pct,
                Kind::PackLossGatewayForward => report.gateway_forward = pct,
                _ => report.forward_gateway = pct,
            }
        }
        Ok(report)
    }

    /// Configured locations of the gateway and forward of `route`.
    pub async fn locate(&self, route: RoutePair) -> RelayResult<Locations> {
        self.ensure_binding(route, PROBE_SERVER).await?;
        let mut out = Locations::default();
        for kind in [Kind::LocGateway, Kind::LocForward] {
            let mut header = Header::control(kind);
            header.server = PROBE_SERVER;
            let reply = self
                .query(route.gateway, header, Control::Location(None), |r| r.header.kind == kind)
                .await?;
            let coord = match reply.control {
                Control::Location(c) => c,
                _ => None,
            };
            if kind == Kind::LocGateway {
                out.gateway = coord;
            } else {
                out.forward = coord;
            }
        }
        Ok(out)
    }
}
