use crate::route::RoutePair;
use anyhow::Result;
use hopwire_common::Coord;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// A relay node the route selector may pick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub addr: SocketAddrV4,
    pub lat: f64,
    pub lon: f64,
}

impl NodeEntry {
    pub fn coord(&self) -> Coord {
        Coord::new(self.lat, self.lon)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    #[serde(default = "default_gateway")]
    pub default_gateway: SocketAddrV4,
    #[serde(default = "default_forward")]
    pub default_forward: SocketAddrV4,

    /// Probe routes for unknown servers. When off, unknown servers use the
    /// default pair.
    #[serde(default = "default_probe_routes")]
    pub probe_routes: bool,

    /// Copies of each data packet sent to the gateway
    #[serde(default = "default_redundancy")]
    pub redundancy: u8,
    #[serde(default = "default_pl_window")]
    pub pl_window: u64,

    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// How often a route binding is re-sent to the gateway
    #[serde(default = "default_route_refresh_secs")]
    pub route_refresh_secs: u64,
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_geo_endpoint")]
    pub geo_endpoint: String,
    #[serde(default = "default_geo_timeout_ms")]
    pub geo_timeout_ms: u64,

    /// Always use this pair, skipping route selection
    #[serde(default)]
    pub fixed_route: Option<RoutePair>,

    /// Player location. Looked up from the public IP when unset.
    #[serde(default)]
    pub client_location: Option<Coord>,

    #[serde(default)]
    pub gateways: Vec<NodeEntry>,
    #[serde(default)]
    pub forwards: Vec<NodeEntry>,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

fn default_gateway() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7000)
}

fn default_forward() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7100)
}

fn default_probe_routes() -> bool {
    true
}

fn default_redundancy() -> u8 {
    1
}

fn default_pl_window() -> u64 {
    32
}

fn default_query_timeout_ms() -> u64 {
    1000
}

fn default_route_refresh_secs() -> u64 {
    30
}

fn default_mailbox_capacity() -> usize {
    64
}

fn default_buffer_size() -> usize {
    65536
}

fn default_geo_endpoint() -> String {
    "http://ip-api.com/json".to_string()
}

fn default_geo_timeout_ms() -> u64 {
    5000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            default_gateway: default_gateway(),
            default_forward: default_forward(),
            probe_routes: default_probe_routes(),
            redundancy: default_redundancy(),
            pl_window: default_pl_window(),
            query_timeout_ms: default_query_timeout_ms(),
            route_refresh_secs: default_route_refresh_secs(),
            mailbox_capacity: default_mailbox_capacity(),
            buffer_size: default_buffer_size(),
            geo_endpoint: default_geo_endpoint(),
            geo_timeout_ms: default_geo_timeout_ms(),
            fixed_route: None,
            client_location: None,
            gateways: Vec::new(),
            forwards: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn default_route(&self) -> RoutePair {
        RoutePair {
            gateway: self.default_gateway,
            forward: self.default_forward,
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn route_refresh(&self) -> Duration {
        Duration::from_secs(self.route_refresh_secs)
    }
}
