//! Error types shared by every relay role.

use std::io;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Reasons a wire header or control payload is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("packet shorter than header ({0} bytes)")]
    TooShort(usize),
    #[error("invalid kind {0}")]
    InvalidKind(u8),
    #[error("invalid protocol {0}")]
    InvalidProto(u8),
    #[error("bad control payload for {0:?}")]
    BadPayload(crate::protocol::Kind),
    #[error("{0:?} carries no control payload")]
    NotControl(crate::protocol::Kind),
}

/// Conditions the caller is expected to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Temporary {
    #[error("route probe started for {0}")]
    ProbeStarted(Ipv4Addr),
    #[error("route probe in progress for {0}")]
    ProbeInProgress(Ipv4Addr),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed packet: {0}")]
    Malformed(#[from] DecodeError),
    #[error(transparent)]
    Temporary(#[from] Temporary),
    #[error("no free port on {0}")]
    Exhausted(Ipv4Addr),
    #[error("route probe failed: {0}")]
    Probe(String),
    /// Opening the per-flow socket failed. Only that flow is affected.
    #[error("flow setup failed: {0}")]
    Flow(io::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    pub fn is_temporary(&self) -> bool {
        matches!(self, RelayError::Temporary(_))
    }
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;

/// Receive errors a serve loop survives. Anything else ends the loop.
pub fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}
