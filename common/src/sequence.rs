//! Sequence id unwrapping and packet-loss estimation.
//!
//! Data ids on the wire are a single byte and wrap constantly. `LoopIds`
//! expands them into a monotonic index as long as consecutive ids stay within
//! a third of the id space of each other. `PlStats` estimates loss from the
//! spread of expanded indexes against the number of ids seen.

use tracing::debug;

#[derive(Debug, Clone)]
pub struct LoopIds {
    modulus: u32,
    dimension: u32,
    last: Option<u32>,
    index: i64,
}

impl LoopIds {
    /// `modulus` is the size of the raw id space and must be at least 3.
    pub fn new(modulus: u32) -> Self {
        assert!(modulus >= 3, "id space too small: {}", modulus);
        Self {
            modulus,
            dimension: modulus / 3,
            last: None,
            index: 0,
        }
    }

    pub fn modulus(&self) -> u32 {
        self.modulus
    }

    /// Expand `raw` relative to the previous id. Returns `None` when `raw`
    /// is not within a third of the id space of the previous id, in which
    /// case the tracker state is unchanged.
    pub fn expand(&mut self, raw: u32) -> Option<i64> {
        let raw = raw % self.modulus;
        let Some(last) = self.last else {
            self.last = Some(raw);
            self.index = i64::from(raw);
            return Some(self.index);
        };

        let forward = (raw + self.modulus - last) % self.modulus;
        let backward = (last + self.modulus - raw) % self.modulus;
        if forward < self.dimension {
            self.index += i64::from(forward);
        } else if backward < self.dimension {
            self.index -= i64::from(backward);
        } else {
            return None;
        }
        self.last = Some(raw);
        Some(self.index)
    }
}

/// Loss estimate over one window of received ids.
#[derive(Debug, Clone)]
pub struct PlStats {
    ids: LoopIds,
    min: i64,
    max: i64,
    count: u64,
}

impl PlStats {
    pub fn new(modulus: u32) -> Self {
        Self {
            ids: LoopIds::new(modulus),
            min: 0,
            max: 0,
            count: 0,
        }
    }

    /// Record a received raw id. Returns false if it was too far from the
    /// previous id to be placed.
    pub fn id(&mut self, raw: u32) -> bool {
        let Some(idx) = self.ids.expand(raw) else {
            debug!("id {} not near the previous id, ignored", raw);
            return false;
        };
        if self.count == 0 {
            self.min = idx;
            self.max = idx;
        } else {
            self.min = self.min.min(idx);
            self.max = self.max.max(idx);
        }
        self.count += 1;
        true
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Fraction of ids missing in `[min, max]`, or 0 when fewer than
    /// `max(min_samples, 2)` ids have been seen.
    pub fn pl(&self, min_samples: u64) -> f64 {
        if self.count < min_samples.max(2) {
            return 0.0;
        }
        let span = (self.max - self.min + 1) as u64;
        if span < self.count {
            return 0.0;
        }
        (span - self.count) as f64 / span as f64
    }

    /// Start a new window. The id tracker keeps its position.
    pub fn reset(&mut self) {
        self.count = 0;
        self.min = 0;
        self.max = 0;
    }
}
