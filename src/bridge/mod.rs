//! Engine assembly.
//!
//! # Data Flow
//! ```text
//! Bridge::new(fabric, config).start()
//!     → open + subscribe the command channel
//!     → build registry, pool and router
//!     → spawn the command loop
//!     → BridgeHandle
//!
//! BridgeHandle::shutdown()
//!     → Shutdown::trigger (command loop stops reading)
//!     → every registered connection signalled to stop
//!     → pool drained, stragglers aborted after the grace period
//! ```
//!
//! # Design Decisions
//! - The command loop is a single task: commands are taken in delivery order
//! - Shutdown is not cooperative for workers that outlive the grace period

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::BridgeConfig;
use crate::fabric::{Channel, ChannelFabric, FabricError, Persistence, Subscription};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::pool::WorkerPool;
use crate::protocol::ConnectionId;
use crate::routing::{CommandRouter, ConnectionRegistry};

/// Error type for engine startup.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid command channel name: {0}")]
    ChannelName(#[from] url::ParseError),

    #[error("command channel unavailable: {0}")]
    Fabric(#[from] FabricError),
}

/// An HTTP bridge that has not been started yet.
pub struct Bridge {
    fabric: Arc<dyn ChannelFabric>,
    config: Arc<BridgeConfig>,
}

impl Bridge {
    pub fn new(fabric: Arc<dyn ChannelFabric>, config: BridgeConfig) -> Self {
        Self {
            fabric,
            config: Arc::new(config),
        }
    }

    /// Subscribe to the command channel and start serving commands.
    pub async fn start(self) -> Result<BridgeHandle, BridgeError> {
        let command_uri = self.config.bridge.command_uri()?;
        let channel = self.fabric.open(&command_uri, Persistence::Never).await?;
        let subscription = channel.subscribe().await?;

        let registry = Arc::new(ConnectionRegistry::new());
        let pool = Arc::new(WorkerPool::new(self.config.pool.max_workers));
        let router = CommandRouter::new(
            Arc::clone(&self.fabric),
            Arc::clone(&self.config),
            Arc::clone(&registry),
            Arc::clone(&pool),
        );

        let shutdown = Shutdown::new();
        let task = tokio::spawn(command_loop(
            router.clone(),
            channel,
            subscription,
            shutdown.subscribe(),
        ));

        tracing::info!(
            channel = %command_uri,
            max_workers = self.config.pool.max_workers,
            "HTTP bridge started"
        );

        Ok(BridgeHandle {
            command_uri,
            config: self.config,
            router,
            pool,
            shutdown,
            task,
        })
    }
}

async fn command_loop(
    router: CommandRouter,
    channel: Box<dyn Channel>,
    mut subscription: Subscription,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                tracing::info!("Command loop stopping");
                break;
            }
            payload = subscription.recv() => match payload {
                Some(payload) => router.on_command(payload).await,
                None => {
                    tracing::warn!(channel = %channel.uri(), "Command channel closed");
                    break;
                }
            },
        }
    }

    if let Err(e) = channel.close().await {
        tracing::warn!(channel = %channel.uri(), error = %e, "Failed to close command channel");
    }
}

/// A running bridge.
pub struct BridgeHandle {
    command_uri: Url,
    config: Arc<BridgeConfig>,
    router: CommandRouter,
    pool: Arc<WorkerPool>,
    shutdown: Shutdown,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    /// The well-known channel callers publish Setup and Teardown on.
    pub fn command_channel(&self) -> &Url {
        &self.command_uri
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.router.is_connected(id)
    }

    pub fn connection_count(&self) -> usize {
        self.router.registry().len()
    }

    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    /// Workers currently holding a pool slot.
    pub fn active_workers(&self) -> usize {
        self.pool.active()
    }

    /// Setups waiting for a worker slot.
    pub fn pending_setups(&self) -> usize {
        self.router.pending_setups()
    }

    /// Stop taking commands, signal every connection, then stop the pool.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Command loop ended abnormally");
        }

        let records = self.router.registry().drain();
        for record in &records {
            record.stop();
        }
        metrics::record_active_connections(0);
        tracing::info!(connections = records.len(), "Connections signalled to stop");

        self.pool.shutdown(self.config.pool.shutdown_grace()).await;
        tracing::info!("HTTP bridge stopped");
    }
}
