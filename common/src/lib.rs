pub mod checksum;
pub mod dedup;
pub mod error;
pub mod geo;
pub mod leg;
pub mod mailbox;
pub mod metrics;
pub mod packet;
pub mod protocol;
pub mod sequence;

pub use dedup::Deduplicate;
pub use error::{DecodeError, RelayError, RelayResult, Temporary};
pub use geo::Coord;
pub use leg::Leg;
pub use mailbox::Mailbox;
pub use metrics::*;
pub use packet::Packet;
pub use protocol::*;
pub use sequence::{LoopIds, PlStats};
