//! Duplicate suppression for redundantly sent packets.

/// Ring of recently received ids.
///
/// Each slot remembers the position (raw id plus completed laps) of the
/// packet that last filled it, so a flag left over from an earlier lap never
/// matches. Raw ids are placed within half a ring of the highest position
/// seen, with an id exactly half a ring away counted as ahead. A packet
/// delayed by half the ring or more is therefore taken for a new one and
/// reported fresh.
#[derive(Debug, Clone)]
pub struct Deduplicate {
    ring: Vec<Option<u64>>,
    /// One past the highest position seen.
    top: u64,
    started: bool,
}

impl Deduplicate {
    pub fn new(id_space: usize) -> Self {
        let size = if id_space > 1024 {
            id_space / 2
        } else {
            id_space
        };
        assert!(size >= 2, "id space too small: {}", id_space);
        Self {
            ring: vec![None; size],
            top: 0,
            started: false,
        }
    }

    pub fn size(&self) -> usize {
        self.ring.len()
    }

    /// Mark `id` as received. Returns true if it had already been seen.
    pub fn recved(&mut self, id: u32) -> bool {
        let slot = id as usize % self.ring.len();
        let pos = self.position(slot);
        if pos >= self.top {
            self.top = pos + 1;
        }
        std::mem::replace(&mut self.ring[slot], Some(pos)) == Some(pos)
    }

    fn position(&mut self, slot: usize) -> u64 {
        let size = self.ring.len() as u64;
        if !self.started {
            self.started = true;
            // one lap of margin keeps positions behind the first id positive
            return slot as u64 + size;
        }
        let ahead = (slot as u64 + size - self.top % size) % size;
        if ahead > size / 2 {
            self.top + ahead - size
        } else {
            self.top + ahead
        }
    }
}
