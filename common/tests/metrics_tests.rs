use hopwire_common::{NodeMetrics, PeerSummary, Stats};
use std::time::Duration;

#[test]
fn test_metrics_initialization() {
    let metrics = NodeMetrics::new();
    let stats = metrics.get_stats();

    assert_eq!(stats.bytes_up, 0);
    assert_eq!(stats.bytes_down, 0);
    assert_eq!(stats.packets_up, 0);
    assert_eq!(stats.packets_down, 0);
    assert_eq!(stats.links_active, 0);
    assert_eq!(stats.links_total, 0);
}

#[test]
fn test_record_directions() {
    let metrics = NodeMetrics::new();

    metrics.record_up(100);
    metrics.record_up(200);
    metrics.record_down(50);

    let stats = metrics.get_stats();
    assert_eq!(stats.bytes_up, 300);
    assert_eq!(stats.packets_up, 2);
    assert_eq!(stats.bytes_down, 50);
    assert_eq!(stats.packets_down, 1);
}

#[test]
fn test_link_tracking() {
    let metrics = NodeMetrics::new();

    metrics.record_link_opened();
    metrics.record_link_opened();
    metrics.record_link_closed();

    let stats = metrics.get_stats();
    assert_eq!(stats.links_active, 1);
    assert_eq!(stats.links_total, 2);
}

#[test]
fn test_drops_and_duplicates() {
    let metrics = NodeMetrics::new();

    metrics.record_dropped();
    metrics.record_duplicate();
    metrics.record_duplicate();

    let stats = metrics.get_stats();
    assert_eq!(stats.packets_dropped, 1);
    assert_eq!(stats.duplicates, 2);
}

#[test]
fn test_clones_share_counters() {
    let metrics = NodeMetrics::new();
    let clone = metrics.clone();

    clone.record_up(10);

    assert_eq!(metrics.get_stats().bytes_up, 10);
}

#[test]
fn test_format_bytes() {
    assert_eq!(Stats::format_bytes(0), "0 B");
    assert_eq!(Stats::format_bytes(1023), "1023 B");
    assert_eq!(Stats::format_bytes(1024), "1.0 KiB");
    assert_eq!(Stats::format_bytes(1536), "1.5 KiB");
    assert_eq!(Stats::format_bytes(1024 * 1024 * 3), "3.0 MiB");
}

#[test]
fn test_summary_lists_peers() {
    let metrics = NodeMetrics::new();
    metrics.record_up(2048);
    metrics.record_link_opened();

    let peers = [
        PeerSummary {
            peer: "192.0.2.1:7100".parse().unwrap(),
            loss_percent: 3,
            rtt: Some(Duration::from_micros(12_500)),
            links: None,
        },
        PeerSummary {
            peer: "192.0.2.2:7000".parse().unwrap(),
            loss_percent: 0,
            rtt: None,
            links: Some(4),
        },
    ];
    let lines = metrics.get_stats().summary_lines("Gateway", &peers);

    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("Gateway up"));
    assert!(lines[0].contains("2.0 KiB / 1 pkts up"));
    assert!(lines[1].contains("links 1 open / 1 total"));
    assert_eq!(lines[2], "  192.0.2.1:7100 loss 3% rtt 12.5ms");
    assert_eq!(lines[3], "  192.0.2.2:7000 loss 0% rtt - links 4");
}
