//! IP geolocation used to pick relay nodes near the player and the server.

use async_trait::async_trait;
use hopwire_common::Coord;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("geolocation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("geolocation lookup for {ip} failed: {reason}")]
    Lookup { ip: String, reason: String },
}

#[async_trait]
pub trait GeoLocator: Send + Sync {
    /// Coordinates of `ip`, or of this host's public address when `None`.
    async fn locate(&self, ip: Option<Ipv4Addr>) -> Result<Coord, LocateError>;
}

/// Response from the ip-api.com JSON endpoint
#[derive(Debug, Deserialize)]
struct IpApiResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    lat: f64,
    #[serde(default)]
    lon: f64,
}

/// ip-api.com lookups with a per-instance cache.
pub struct IpApiLocator {
    client: reqwest::Client,
    endpoint: String,
    cache: RwLock<HashMap<Option<Ipv4Addr>, Coord>>,
}

impl IpApiLocator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, LocateError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            cache: RwLock::new(HashMap::new()),
        })
    }

    fn url(&self, ip: Option<Ipv4Addr>) -> String {
        match ip {
            Some(ip) => format!("{}/{}?fields=status,message,lat,lon", self.endpoint, ip),
            None => format!("{}/?fields=status,message,lat,lon", self.endpoint),
        }
    }
}

#[async_trait]
impl GeoLocator for IpApiLocator {
    async fn locate(&self, ip: Option<Ipv4Addr>) -> Result<Coord, LocateError> {
        if let Some(coord) = self.cache.read().get(&ip) {
            debug!("Cache hit for {:?}: {:?}", ip, coord);
            return Ok(*coord);
        }

        let who = ip.map(|ip| ip.to_string()).unwrap_or_else(|| "self".to_string());
        let response: IpApiResponse = self
            .client
            .get(self.url(ip))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.status != "success" {
            return Err(LocateError::Lookup {
                ip: who,
                reason: response.message.unwrap_or(response.status),
            });
        }

        let coord = Coord::new(response.lat, response.lon);
        info!("Located {}: lat={}, lon={}", who, coord.lat, coord.lon);
        self.cache.write().insert(ip, coord);
        Ok(coord)
    }
}
