//! LoopIds, PlStats and Deduplicate behaviour

use hopwire_common::{Deduplicate, LoopIds, PlStats};

// ============================================================================
// LoopIds
// ============================================================================

#[test]
fn test_in_order_ids_expand_monotonically() {
    let mut ids = LoopIds::new(256);
    for i in 0..1000u32 {
        assert_eq!(ids.expand(i % 256), Some(i64::from(i)));
    }
}

#[test]
fn test_reordered_ids_keep_relative_position() {
    let mut ids = LoopIds::new(256);
    assert_eq!(ids.expand(10), Some(10));
    assert_eq!(ids.expand(12), Some(12));
    assert_eq!(ids.expand(11), Some(11));
    assert_eq!(ids.expand(13), Some(13));
}

#[test]
fn test_backward_across_wrap() {
    let mut ids = LoopIds::new(256);
    assert_eq!(ids.expand(254), Some(254));
    assert_eq!(ids.expand(1), Some(257));
    assert_eq!(ids.expand(255), Some(255));
}

#[test]
fn test_far_id_is_not_nearby() {
    let mut ids = LoopIds::new(256);
    ids.expand(0);
    assert_eq!(ids.expand(128), None);
    // state unchanged
    assert_eq!(ids.expand(1), Some(1));
}

// ============================================================================
// PlStats
// ============================================================================

#[test]
fn test_no_loss() {
    let mut stats = PlStats::new(256);
    for i in 0..100u32 {
        stats.id(i % 256);
    }
    assert_eq!(stats.pl(10), 0.0);
}

#[test]
fn test_single_gap() {
    let mut stats = PlStats::new(256);
    for i in (0..=100u32).filter(|i| *i != 50) {
        stats.id(i % 256);
    }
    assert!((stats.pl(10) - 1.0 / 101.0).abs() < 1e-9);
    assert!((stats.pl(10) - 0.01).abs() < 0.001);
}

#[test]
fn test_every_other_packet_lost() {
    let mut stats = PlStats::new(256);
    for i in (0..200u32).step_by(2) {
        stats.id(i % 256);
    }
    let pl = stats.pl(10);
    assert!((pl - 0.5).abs() < 0.01, "got {}", pl);
}

#[test]
fn test_duplicates_never_report_negative_loss() {
    let mut stats = PlStats::new(256);
    for i in 0..20u32 {
        stats.id(i);
        stats.id(i);
    }
    assert_eq!(stats.pl(2), 0.0);
}

// ============================================================================
// Deduplicate
// ============================================================================

#[test]
fn test_first_seen_then_duplicate() {
    let mut dedup = Deduplicate::new(256);
    assert!(!dedup.recved(7));
    assert!(dedup.recved(7));
    assert!(!dedup.recved(8));
    assert!(dedup.recved(7));
}

#[test]
fn test_late_packet_within_half_ring() {
    let mut dedup = Deduplicate::new(256);
    assert!(!dedup.recved(10));
    assert!(!dedup.recved(20));
    assert!(!dedup.recved(15));
    assert!(dedup.recved(15));
}

#[test]
fn test_half_ring_boundary() {
    let mut dedup = Deduplicate::new(8);
    for id in 0..8 {
        assert!(!dedup.recved(id));
    }
    // exactly half the ring away counts as the next lap, not as a repeat of
    // the first one
    assert!(!dedup.recved(4));
    assert!(!dedup.recved(3));
    assert!(dedup.recved(4));
    assert!(dedup.recved(3));
}

#[test]
fn test_burst_loss_keeps_fresh_packets() {
    let mut dedup = Deduplicate::new(256);
    for id in 0..256 {
        assert!(!dedup.recved(id));
    }
    // the next 128 ids of the second lap were lost in transit
    let flagged = (128..256).filter(|&id| dedup.recved(id)).count();
    assert_eq!(flagged, 0);

    // redundant copies of what did arrive are still caught
    assert!(dedup.recved(200));
    assert!(dedup.recved(255));
}

#[test]
fn test_late_beyond_half_ring_is_not_a_duplicate() {
    let mut dedup = Deduplicate::new(16);
    for id in 0..12 {
        assert!(!dedup.recved(id));
    }
    // id 1 repeated 11 slots late is placed on the next lap
    assert!(!dedup.recved(1));
    // but the ids received since then still match
    assert!(dedup.recved(11));
}
