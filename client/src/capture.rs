//! Boundary to the OS packet capture driver.
//!
//! Drivers are platform specific and live outside this crate. They hand over
//! whole IPv4 packets and take back packets to deliver to the local stack.

use async_trait::async_trait;
use std::io;
use tokio::sync::{mpsc, Mutex};

/// A packet taken off the wire before the OS stack sends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub data: Vec<u8>,
    /// Set when the packet belongs to the accelerated game process.
    pub game: bool,
}

#[async_trait]
pub trait PacketCapture: Send + Sync {
    /// Next captured packet, or `None` once the driver has shut down.
    async fn recv(&self) -> io::Result<Option<Captured>>;

    /// Hand a packet to the local stack as if it had arrived or left
    /// normally.
    async fn inject(&self, packet: Vec<u8>) -> io::Result<()>;
}

/// In-memory capture backed by channels. The paired `CaptureHandle` plays
/// the driver.
pub struct ChannelCapture {
    captured: Mutex<mpsc::Receiver<Captured>>,
    injected: mpsc::Sender<Vec<u8>>,
}

pub struct CaptureHandle {
    captured: mpsc::Sender<Captured>,
    injected: mpsc::Receiver<Vec<u8>>,
}

impl ChannelCapture {
    pub fn pair(capacity: usize) -> (ChannelCapture, CaptureHandle) {
        let (cap_tx, cap_rx) = mpsc::channel(capacity);
        let (inj_tx, inj_rx) = mpsc::channel(capacity);
        (
            ChannelCapture {
                captured: Mutex::new(cap_rx),
                injected: inj_tx,
            },
            CaptureHandle {
                captured: cap_tx,
                injected: inj_rx,
            },
        )
    }
}

#[async_trait]
impl PacketCapture for ChannelCapture {
    async fn recv(&self) -> io::Result<Option<Captured>> {
        Ok(self.captured.lock().await.recv().await)
    }

    async fn inject(&self, packet: Vec<u8>) -> io::Result<()> {
        self.injected
            .send(packet)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "capture handle dropped"))
    }
}

impl CaptureHandle {
    /// Feed a packet as if the driver had captured it.
    pub async fn capture(&self, data: Vec<u8>, game: bool) -> bool {
        self.captured.send(Captured { data, game }).await.is_ok()
    }

    /// Next packet the client injected.
    pub async fn injected(&mut self) -> Option<Vec<u8>> {
        self.injected.recv().await
    }
}
