//! Tests for gateway and forward configuration

use hopwire_common::Coord;
use hopwire_server::config::{EgressMode, ForwardConfig, GatewayConfig};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

#[test]
fn test_gateway_config_default() {
    let config = GatewayConfig::default();

    assert_eq!(config.listen.port(), 7000);
    assert!(config.default_forward.is_none());
    assert!(config.forwards.is_empty());
    assert_eq!(config.keepalive_interval_ms, 30_000);
    assert_eq!(config.session_timeout_secs, 300);
    assert_eq!(config.redundancy, 1);
    assert_eq!(config.pl_window, 32);
    assert_eq!(config.buffer_size, 65536);
    assert!(config.location.is_none());
}

#[test]
fn test_forward_config_default() {
    let config = ForwardConfig::default();

    assert_eq!(config.listen.port(), 7100);
    assert_eq!(config.local_ip, Ipv4Addr::UNSPECIFIED);
    assert_eq!(config.egress, EgressMode::Datagram);
    assert_eq!(config.max_links, 4096);
    assert_eq!(config.keepalive(), Duration::from_secs(30));
}

#[test]
fn test_gateway_config_partial_toml() {
    let config: GatewayConfig = toml::from_str(
        r#"
        listen = "127.0.0.1:9000"
        default_forward = "10.1.0.1:7100"
        redundancy = 2
        "#,
    )
    .unwrap();

    assert_eq!(config.listen.port(), 9000);
    assert_eq!(
        config.default_forward,
        Some(SocketAddrV4::new(Ipv4Addr::new(10, 1, 0, 1), 7100))
    );
    assert_eq!(config.redundancy, 2);
    assert_eq!(config.pl_window, 32);
}

#[test]
fn test_forward_config_raw_egress() {
    let config: ForwardConfig = toml::from_str(
        r#"
        local_ip = "192.0.2.10"
        egress = "raw"
        keepalive_interval_ms = 500

        [location]
        lat = 50.11
        lon = 8.68
        "#,
    )
    .unwrap();

    assert_eq!(config.egress, EgressMode::Raw);
    assert_eq!(config.local_ip, Ipv4Addr::new(192, 0, 2, 10));
    assert_eq!(config.keepalive(), Duration::from_millis(500));
    assert_eq!(config.location, Some(Coord::new(50.11, 8.68)));
}

#[test]
fn test_config_save_and_load() {
    let path = std::env::temp_dir().join(format!("hopwire-gateway-{}.toml", std::process::id()));
    let path = path.to_str().unwrap();

    let mut config = GatewayConfig::default();
    config.forwards = vec![SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 7100)];
    config.location = Some(Coord::new(1.5, 2.5));
    config.save(path).unwrap();

    let loaded = GatewayConfig::load(path).unwrap();
    assert_eq!(loaded.forwards, config.forwards);
    assert_eq!(loaded.location, config.location);

    std::fs::remove_file(path).ok();
}

#[test]
fn test_load_missing_file_fails() {
    assert!(ForwardConfig::load("/nonexistent/hopwire-forward.toml").is_err());
}
