//! HTTP bridge over a publish/subscribe message bus.

pub mod bridge;
pub mod client;
pub mod config;
pub mod connection;
pub mod fabric;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod pool;
pub mod protocol;
pub mod routing;

pub use bridge::{Bridge, BridgeError, BridgeHandle};
pub use config::BridgeConfig;
pub use lifecycle::Shutdown;
