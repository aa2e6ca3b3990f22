use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Traffic counters for one relay node. Uplink is toward the game server,
/// downlink is toward the player.
#[derive(Debug, Clone)]
pub struct NodeMetrics {
    pub bytes_up: Arc<AtomicU64>,
    pub bytes_down: Arc<AtomicU64>,
    pub packets_up: Arc<AtomicU64>,
    pub packets_down: Arc<AtomicU64>,
    pub packets_dropped: Arc<AtomicU64>,
    pub duplicates: Arc<AtomicU64>,
    pub links_active: Arc<AtomicU64>,
    pub links_total: Arc<AtomicU64>,
    pub start_time: Instant,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self {
            bytes_up: Arc::new(AtomicU64::new(0)),
            bytes_down: Arc::new(AtomicU64::new(0)),
            packets_up: Arc::new(AtomicU64::new(0)),
            packets_down: Arc::new(AtomicU64::new(0)),
            packets_dropped: Arc::new(AtomicU64::new(0)),
            duplicates: Arc::new(AtomicU64::new(0)),
            links_active: Arc::new(AtomicU64::new(0)),
            links_total: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn record_up(&self, bytes: usize) {
        self.bytes_up.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_up.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_down(&self, bytes: usize) {
        self.bytes_down.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_down.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_link_opened(&self) {
        self.links_active.fetch_add(1, Ordering::Relaxed);
        self.links_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_link_closed(&self) {
        self.links_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> Stats {
        Stats {
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            packets_up: self.packets_up.load(Ordering::Relaxed),
            packets_down: self.packets_down.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            links_active: self.links_active.load(Ordering::Relaxed),
            links_total: self.links_total.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Stats {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub packets_up: u64,
    pub packets_down: u64,
    pub packets_dropped: u64,
    pub duplicates: u64,
    pub links_active: u64,
    pub links_total: u64,
    pub uptime_secs: u64,
}

/// Per-peer line of a node summary: a forward as seen by a gateway, or a
/// gateway as seen by a forward.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSummary {
    pub peer: SocketAddr,
    pub loss_percent: u8,
    pub rtt: Option<Duration>,
    /// Links this peer holds open, where the node tracks them.
    pub links: Option<usize>,
}

impl Stats {
    /// Byte count in binary units, one decimal.
    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
        let exp = match bytes {
            0 => 0,
            b => (b.ilog2() / 10).min(4) as usize,
        };
        if exp == 0 {
            return format!("{} B", bytes);
        }
        format!("{:.1} {}", bytes as f64 / (1u64 << (10 * exp)) as f64, UNITS[exp])
    }

    pub fn summary_lines(&self, role: &str, peers: &[PeerSummary]) -> Vec<String> {
        let mut lines = vec![
            format!(
                "{} up {}s: {} / {} pkts up, {} / {} pkts down",
                role,
                self.uptime_secs,
                Self::format_bytes(self.bytes_up),
                self.packets_up,
                Self::format_bytes(self.bytes_down),
                self.packets_down
            ),
            format!(
                "dropped {}, duplicates {}, links {} open / {} total",
                self.packets_dropped, self.duplicates, self.links_active, self.links_total
            ),
        ];
        for p in peers {
            let rtt = p
                .rtt
                .map(|d| format!("{:.1}ms", d.as_secs_f64() * 1000.0))
                .unwrap_or_else(|| "-".to_string());
            let mut line = format!("  {} loss {}% rtt {}", p.peer, p.loss_percent, rtt);
            if let Some(links) = p.links {
                line.push_str(&format!(" links {}", links));
            }
            lines.push(line);
        }
        lines
    }

    pub fn print_summary(&self, role: &str, peers: &[PeerSummary]) {
        for line in self.summary_lines(role, peers) {
            info!("📊 {}", line);
        }
    }
}
