use anyhow::Result;
use hopwire_common::Coord;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// How a forward node puts a flow on the wire toward the game server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EgressMode {
    /// One UDP socket per flow, connected to the server. UDP flows only.
    Datagram,
    /// One raw IP socket per flow with a kernel filter. Needs CAP_NET_RAW.
    Raw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_listen")]
    pub listen: SocketAddr,

    /// Forward used for servers no client has bound a route for.
    #[serde(default)]
    pub default_forward: Option<SocketAddrV4>,

    /// Forwards heartbeated with PingProxyer.
    #[serde(default)]
    pub forwards: Vec<SocketAddrV4>,

    #[serde(default = "default_keepalive_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Copies of each data packet sent back to the client.
    #[serde(default = "default_redundancy")]
    pub redundancy: u8,
    #[serde(default = "default_pl_window")]
    pub pl_window: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default)]
    pub location: Option<Coord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardConfig {
    #[serde(default = "default_forward_listen")]
    pub listen: SocketAddr,

    /// Address flows leave from. Raw egress needs a concrete address.
    #[serde(default = "default_local_ip")]
    pub local_ip: Ipv4Addr,

    #[serde(default = "default_egress")]
    pub egress: EgressMode,

    #[serde(default = "default_keepalive_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_max_links")]
    pub max_links: usize,
    #[serde(default = "default_pl_window")]
    pub pl_window: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default)]
    pub location: Option<Coord>,
}

fn default_gateway_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7000))
}

fn default_forward_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7100))
}

fn default_local_ip() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_egress() -> EgressMode {
    EgressMode::Datagram
}

fn default_keepalive_ms() -> u64 {
    30_000
}

fn default_session_timeout() -> u64 {
    300
}

fn default_redundancy() -> u8 {
    1
}

fn default_pl_window() -> u64 {
    32
}

fn default_buffer_size() -> usize {
    65536
}

fn default_max_links() -> usize {
    4096
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_gateway_listen(),
            default_forward: None,
            forwards: Vec::new(),
            keepalive_interval_ms: default_keepalive_ms(),
            session_timeout_secs: default_session_timeout(),
            redundancy: default_redundancy(),
            pl_window: default_pl_window(),
            buffer_size: default_buffer_size(),
            location: None,
        }
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            listen: default_forward_listen(),
            local_ip: default_local_ip(),
            egress: default_egress(),
            keepalive_interval_ms: default_keepalive_ms(),
            max_links: default_max_links(),
            pl_window: default_pl_window(),
            buffer_size: default_buffer_size(),
            location: None,
        }
    }
}

impl GatewayConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms.max(1))
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

impl ForwardConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ForwardConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms.max(1))
    }
}
