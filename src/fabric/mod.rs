//! Channel fabric: the pub/sub seam the bridge runs on.
//!
//! # Data Flow
//! ```text
//! ChannelFabric::open(uri, persistence)
//!     → Channel handle (owned by exactly one component)
//!         publish(bytes)        → every live Subscription on the uri
//!         subscribe()           → Subscription::recv() in publish order
//!         latest(timeout)       → retained value, or next publish within timeout
//!         close()               → ends this handle's subscriptions
//! ```
//!
//! # Design Decisions
//! - Payloads are opaque bytes; command encoding lives in `protocol`
//! - Trait objects so the engine does not care which bus it runs on
//! - `memory.rs` is the in-process bus used by the CLI and the tests

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

pub use memory::MemoryFabric;

/// Whether a channel keeps its last value for late readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// Published values reach current subscribers only.
    Never,
    /// The last published value is retained for `latest`.
    Latest,
}

/// Errors raised by fabric operations.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("channel {0} is closed")]
    Closed(Url),

    #[error("no value on channel {uri} within {timeout:?}")]
    Timeout { uri: Url, timeout: Duration },

    #[error("failed to open channel {uri}: {reason}")]
    Open { uri: Url, reason: String },

    #[error("message encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Opens channels by URI.
#[async_trait]
pub trait ChannelFabric: Send + Sync + 'static {
    async fn open(&self, uri: &Url, persistence: Persistence) -> Result<Box<dyn Channel>, FabricError>;
}

/// An open handle on a named channel.
#[async_trait]
pub trait Channel: Send + Sync {
    fn uri(&self) -> &Url;

    async fn publish(&self, payload: Bytes) -> Result<(), FabricError>;

    async fn subscribe(&self) -> Result<Subscription, FabricError>;

    /// Read the latest value, waiting up to `timeout` for one to arrive.
    async fn latest(&self, timeout: Duration) -> Result<Bytes, FabricError>;

    /// Release the handle. Closing twice is a no-op.
    async fn close(&self) -> Result<(), FabricError>;
}

/// Stream of payloads delivered to one subscriber.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Next payload, or `None` once the owning handle is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}
