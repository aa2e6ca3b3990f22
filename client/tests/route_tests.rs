//! Route selection: one probe per server, never blocking the caller

use async_trait::async_trait;
use hopwire_client::config::NodeEntry;
use hopwire_client::{GeoLocator, GeoProbe, LocateError, RoutePair, RouteProbe, RouteSelector};
use hopwire_common::{Coord, RelayError, RelayResult, Temporary};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn pair(gw: u8, fwd: u8) -> RoutePair {
    RoutePair {
        gateway: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, gw), 7000),
        forward: SocketAddrV4::new(Ipv4Addr::new(10, 0, 1, fwd), 7100),
    }
}

struct CountingProbe {
    calls: AtomicUsize,
    delay: Duration,
    result: Option<RoutePair>,
}

impl CountingProbe {
    fn new(delay: Duration, result: Option<RoutePair>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            result,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RouteProbe for CountingProbe {
    async fn probe(&self, _server: Ipv4Addr) -> RelayResult<RoutePair> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.result
            .ok_or_else(|| RelayError::Probe("no relay reachable".to_string()))
    }
}

const SERVER: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);

#[tokio::test]
async fn test_probe_runs_once_and_is_cached() {
    let probe = CountingProbe::new(Duration::from_millis(50), Some(pair(2, 3)));
    let routes = RouteSelector::new(None, pair(1, 1), probe.clone());

    assert!(matches!(
        routes.match_route(SERVER, true),
        Err(RelayError::Temporary(Temporary::ProbeStarted(ip))) if ip == SERVER
    ));
    assert!(matches!(
        routes.match_route(SERVER, true),
        Err(RelayError::Temporary(Temporary::ProbeInProgress(ip))) if ip == SERVER
    ));
    assert_eq!(routes.probes_in_flight(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(routes.match_route(SERVER, true).unwrap(), pair(2, 3));
    assert_eq!(routes.match_route(SERVER, true).unwrap(), pair(2, 3));
    assert_eq!(routes.cached(SERVER), Some(pair(2, 3)));
    assert_eq!(routes.probes_in_flight(), 0);
    assert_eq!(probe.calls(), 1);
}

#[tokio::test]
async fn test_distinct_servers_probe_independently() {
    let probe = CountingProbe::new(Duration::from_millis(20), Some(pair(2, 3)));
    let routes = RouteSelector::new(None, pair(1, 1), probe.clone());

    assert!(routes.match_route(SERVER, true).is_err());
    assert!(routes.match_route(Ipv4Addr::new(198, 51, 100, 1), true).is_err());
    assert_eq!(routes.probes_in_flight(), 2);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(probe.calls(), 2);
}

#[tokio::test]
async fn test_fixed_route_skips_probing() {
    let probe = CountingProbe::new(Duration::ZERO, Some(pair(2, 3)));
    let routes = RouteSelector::new(Some(pair(9, 9)), pair(1, 1), probe.clone());

    assert_eq!(routes.match_route(SERVER, true).unwrap(), pair(9, 9));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(probe.calls(), 0);
}

#[tokio::test]
async fn test_no_probe_uses_default() {
    let probe = CountingProbe::new(Duration::ZERO, Some(pair(2, 3)));
    let routes = RouteSelector::new(None, pair(1, 1), probe.clone());

    assert_eq!(routes.match_route(SERVER, false).unwrap(), pair(1, 1));
    assert!(routes.cached(SERVER).is_none());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(probe.calls(), 0);

    // an explicit entry wins over the default
    routes.insert(SERVER, pair(4, 4));
    assert_eq!(routes.match_route(SERVER, false).unwrap(), pair(4, 4));
    routes.forget(SERVER);
    assert_eq!(routes.match_route(SERVER, false).unwrap(), pair(1, 1));
}

#[tokio::test]
async fn test_probe_failure_surfaces_once() {
    let probe = CountingProbe::new(Duration::from_millis(10), None);
    let routes = RouteSelector::new(None, pair(1, 1), probe.clone());

    assert!(routes.match_route(SERVER, true).unwrap_err().is_temporary());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = routes.match_route(SERVER, true).unwrap_err();
    assert!(matches!(err, RelayError::Probe(_)));
    assert!(!err.is_temporary());
    assert_eq!(routes.probes_in_flight(), 0);
    assert!(routes.cached(SERVER).is_none());

    // nothing cached, so the next lookup probes again
    assert!(matches!(
        routes.match_route(SERVER, true),
        Err(RelayError::Temporary(Temporary::ProbeStarted(_)))
    ));
}

// ============================================================================
// Geographic probing
// ============================================================================

struct FixedLocator {
    me: Coord,
    servers: Vec<(Ipv4Addr, Coord)>,
}

#[async_trait]
impl GeoLocator for FixedLocator {
    async fn locate(&self, ip: Option<Ipv4Addr>) -> Result<Coord, LocateError> {
        match ip {
            None => Ok(self.me),
            Some(ip) => self
                .servers
                .iter()
                .find(|(s, _)| *s == ip)
                .map(|(_, c)| *c)
                .ok_or(LocateError::Lookup {
                    ip: ip.to_string(),
                    reason: "unknown".to_string(),
                }),
        }
    }
}

fn node(last: u8, port: u16, lat: f64, lon: f64) -> NodeEntry {
    NodeEntry {
        addr: SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, last), port),
        lat,
        lon,
    }
}

#[tokio::test]
async fn test_geo_probe_picks_nearest_nodes() {
    let berlin = Coord::new(52.52, 13.40);
    let new_york = Coord::new(40.71, -74.0);
    let locator = Arc::new(FixedLocator {
        me: berlin,
        servers: vec![(SERVER, new_york)],
    });

    let gateways = vec![node(1, 7000, 48.85, 2.35), node(2, 7000, 35.68, 139.69)];
    let forwards = vec![node(3, 7100, 51.51, -0.13), node(4, 7100, 39.95, -75.17)];
    let probe = GeoProbe::new(locator, gateways, forwards, None, pair(1, 1));

    let route = probe.probe(SERVER).await.unwrap();
    assert_eq!(route.gateway, node(1, 7000, 0.0, 0.0).addr);
    assert_eq!(route.forward, node(4, 7100, 0.0, 0.0).addr);
}

#[tokio::test]
async fn test_geo_probe_without_tables_uses_default() {
    let locator = Arc::new(FixedLocator {
        me: Coord::default(),
        servers: Vec::new(),
    });
    let probe = GeoProbe::new(locator, Vec::new(), Vec::new(), None, pair(1, 1));
    assert_eq!(probe.probe(SERVER).await.unwrap(), pair(1, 1));
}

#[tokio::test]
async fn test_geo_probe_lookup_failure() {
    let locator = Arc::new(FixedLocator {
        me: Coord::default(),
        servers: Vec::new(),
    });
    let forwards = vec![node(3, 7100, 51.51, -0.13)];
    let probe = GeoProbe::new(locator, Vec::new(), forwards, None, pair(1, 1));
    assert!(matches!(probe.probe(SERVER).await, Err(RelayError::Probe(_))));
}
