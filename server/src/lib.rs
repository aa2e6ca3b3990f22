pub mod config;
pub mod egress;
pub mod forward;
pub mod gateway;
pub mod link;

pub use config::{EgressMode, ForwardConfig, GatewayConfig};
pub use forward::Forward;
pub use gateway::Gateway;
