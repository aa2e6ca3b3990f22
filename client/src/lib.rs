pub mod capture;
pub mod client;
pub mod config;
pub mod locator;
pub mod route;

pub use capture::{CaptureHandle, Captured, ChannelCapture, PacketCapture};
pub use client::{Client, Locations, LossReport, Reply};
pub use config::{ClientConfig, NodeEntry};
pub use locator::{GeoLocator, IpApiLocator, LocateError};
pub use route::{GeoProbe, RoutePair, RouteProbe, RouteSelector};
