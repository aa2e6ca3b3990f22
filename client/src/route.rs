//! Per-server choice of gateway and forward.
//!
//! Lookups never wait. A miss starts a background probe and reports a
//! temporary error; later lookups for the same server either see the probe
//! still running or collect its result. At most one probe per server is in
//! flight.

use crate::config::NodeEntry;
use crate::locator::GeoLocator;
use async_trait::async_trait;
use hopwire_common::geo::nearest;
use hopwire_common::{Coord, RelayError, RelayResult, Temporary};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutePair {
    pub gateway: SocketAddrV4,
    pub forward: SocketAddrV4,
}

#[async_trait]
pub trait RouteProbe: Send + Sync {
    async fn probe(&self, server: Ipv4Addr) -> RelayResult<RoutePair>;
}

/// Picks the forward nearest the server and the gateway nearest the player.
pub struct GeoProbe {
    locator: Arc<dyn GeoLocator>,
    gateways: Vec<NodeEntry>,
    forwards: Vec<NodeEntry>,
    client_location: Option<Coord>,
    default: RoutePair,
}

impl GeoProbe {
    pub fn new(
        locator: Arc<dyn GeoLocator>,
        gateways: Vec<NodeEntry>,
        forwards: Vec<NodeEntry>,
        client_location: Option<Coord>,
        default: RoutePair,
    ) -> Self {
        Self {
            locator,
            gateways,
            forwards,
            client_location,
            default,
        }
    }
}

#[async_trait]
impl RouteProbe for GeoProbe {
    async fn probe(&self, server: Ipv4Addr) -> RelayResult<RoutePair> {
        let forward = if self.forwards.is_empty() {
            self.default.forward
        } else {
            let at = self
                .locator
                .locate(Some(server))
                .await
                .map_err(|e| RelayError::Probe(e.to_string()))?;
            nearest(&self.forwards, &at, NodeEntry::coord)
                .map(|n| n.addr)
                .unwrap_or(self.default.forward)
        };

        let gateway = if self.gateways.is_empty() {
            self.default.gateway
        } else {
            let me = match self.client_location {
                Some(c) => c,
                None => self
                    .locator
                    .locate(None)
                    .await
                    .map_err(|e| RelayError::Probe(e.to_string()))?,
            };
            nearest(&self.gateways, &me, NodeEntry::coord)
                .map(|n| n.addr)
                .unwrap_or(self.default.gateway)
        };

        Ok(RoutePair { gateway, forward })
    }
}

pub struct RouteSelector {
    fixed: Option<RoutePair>,
    default: RoutePair,
    cache: RwLock<HashMap<Ipv4Addr, RoutePair>>,
    inflight: Mutex<HashMap<Ipv4Addr, oneshot::Receiver<RelayResult<RoutePair>>>>,
    prober: Arc<dyn RouteProbe>,
}

impl RouteSelector {
    pub fn new(fixed: Option<RoutePair>, default: RoutePair, prober: Arc<dyn RouteProbe>) -> Self {
        Self {
            fixed,
            default,
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            prober,
        }
    }

    pub fn default_route(&self) -> RoutePair {
        self.default
    }

    /// Route for `server`. Must be called from within a tokio runtime since
    /// a miss spawns the probe.
    pub fn match_route(&self, server: Ipv4Addr, should_probe: bool) -> RelayResult<RoutePair> {
        if let Some(pair) = self.fixed {
            return Ok(pair);
        }
        if let Some(pair) = self.cache.read().get(&server) {
            return Ok(*pair);
        }
        if !should_probe {
            return Ok(self.default);
        }

        let mut inflight = self.inflight.lock();
        let polled = inflight.get_mut(&server).map(|rx| rx.try_recv());
        match polled {
            None => {
                let (tx, rx) = oneshot::channel();
                inflight.insert(server, rx);
                drop(inflight);

                debug!("Probing route for {}", server);
                let prober = self.prober.clone();
                tokio::spawn(async move {
                    let _ = tx.send(prober.probe(server).await);
                });
                Err(Temporary::ProbeStarted(server).into())
            }
            Some(Err(TryRecvError::Empty)) => Err(Temporary::ProbeInProgress(server).into()),
            Some(Err(TryRecvError::Closed)) => {
                inflight.remove(&server);
                Err(RelayError::Probe(format!("probe for {} vanished", server)))
            }
            Some(Ok(result)) => {
                inflight.remove(&server);
                drop(inflight);
                let pair = result?;
                info!(
                    "Route for {}: gateway {} forward {}",
                    server, pair.gateway, pair.forward
                );
                self.cache.write().insert(server, pair);
                Ok(pair)
            }
        }
    }

    pub fn insert(&self, server: Ipv4Addr, pair: RoutePair) {
        self.cache.write().insert(server, pair);
    }

    pub fn cached(&self, server: Ipv4Addr) -> Option<RoutePair> {
        self.cache.read().get(&server).copied()
    }

    pub fn forget(&self, server: Ipv4Addr) {
        self.cache.write().remove(&server);
    }

    pub fn probes_in_flight(&self) -> usize {
        self.inflight.lock().len()
    }
}
