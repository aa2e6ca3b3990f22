//! Per-peer state of one hop in the relay chain.

use crate::dedup::Deduplicate;
use crate::sequence::PlStats;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

/// Size of the on-wire data id space.
pub const ID_SPACE: u32 = 256;

/// Minimum samples before a loss estimate is reported.
pub const MIN_LOSS_SAMPLES: u64 = 8;

#[derive(Debug)]
struct Receive {
    dedup: Deduplicate,
    stats: PlStats,
    window: u64,
    last_loss: Option<f64>,
}

/// Outgoing id counter, duplicate filter and loss window for a single peer.
#[derive(Debug)]
pub struct Leg {
    tx_id: AtomicU8,
    rx: Mutex<Receive>,
    rtt_us: AtomicU64,
}

impl Leg {
    /// `window` is how many accepted ids make up one loss window.
    pub fn new(window: u64) -> Self {
        Self {
            tx_id: AtomicU8::new(0),
            rx: Mutex::new(Receive {
                dedup: Deduplicate::new(ID_SPACE as usize),
                stats: PlStats::new(ID_SPACE),
                window: window.max(MIN_LOSS_SAMPLES),
                last_loss: None,
            }),
            rtt_us: AtomicU64::new(0),
        }
    }

    /// Id for the next packet sent on this leg.
    pub fn next_id(&self) -> u8 {
        self.tx_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a received id. Returns false for duplicates, which the
    /// caller should drop.
    pub fn accept(&self, id: u8) -> bool {
        let mut rx = self.rx.lock();
        if rx.dedup.recved(u32::from(id)) {
            return false;
        }
        rx.record(id);
        true
    }

    /// Register a received id without duplicate filtering.
    pub fn record(&self, id: u8) {
        self.rx.lock().record(id);
    }

    /// Loss over the last completed window, or over the current partial
    /// window if none has completed yet.
    pub fn loss(&self) -> f64 {
        let rx = self.rx.lock();
        match rx.last_loss {
            Some(pl) => pl,
            None => rx.stats.pl(MIN_LOSS_SAMPLES),
        }
    }

    pub fn loss_percent(&self) -> u8 {
        (self.loss() * 100.0).round().clamp(0.0, 100.0) as u8
    }

    pub fn record_rtt(&self, rtt: Duration) {
        self.rtt_us
            .store(rtt.as_micros().max(1) as u64, Ordering::Relaxed);
    }

    pub fn rtt(&self) -> Option<Duration> {
        match self.rtt_us.load(Ordering::Relaxed) {
            0 => None,
            us => Some(Duration::from_micros(us)),
        }
    }
}

impl Receive {
    fn record(&mut self, id: u8) {
        self.stats.id(u32::from(id));
        if self.stats.count() >= self.window {
            self.last_loss = Some(self.stats.pl(MIN_LOSS_SAMPLES));
            self.stats.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_wrap() {
        let leg = Leg::new(32);
        for expected in 0..=255u8 {
            assert_eq!(leg.next_id(), expected);
        }
        assert_eq!(leg.next_id(), 0);
    }

    #[test]
    fn test_duplicates_rejected() {
        let leg = Leg::new(32);
        assert!(leg.accept(4));
        assert!(!leg.accept(4));
        assert!(leg.accept(5));
    }

    #[test]
    fn test_window_loss() {
        let leg = Leg::new(10);
        // ids 0..20 with every fourth one missing: 15 accepted
        for id in (0..20u8).filter(|i| i % 4 != 3) {
            leg.accept(id);
        }
        // first window closes after 10 accepted ids spanning 0..=12
        let pl = leg.loss();
        assert!((pl - 3.0 / 13.0).abs() < 1e-9, "got {}", pl);
        assert_eq!(leg.loss_percent(), 23);
    }

    #[test]
    fn test_rtt_unset() {
        let leg = Leg::new(32);
        assert!(leg.rtt().is_none());
        leg.record_rtt(Duration::from_millis(12));
        assert_eq!(leg.rtt(), Some(Duration::from_millis(12)));
    }
}
