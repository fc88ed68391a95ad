//! Command channel dispatch.
//!
//! # Responsibilities
//! - Decode and validate every command arriving on the command channel
//! - Create connections on Setup, release them on Teardown
//! - Publish exactly one reply per answerable command
//!
//! # Design Decisions
//! - Setups run as their own tasks: a Setup waiting for a pool slot must not
//!   hold back the Teardown that would free one
//! - Setups waiting for a slot are not capped. Refusing them would break the
//!   blocking saturation contract, and holding the command loop would stall
//!   Teardowns, so the waiting set grows with the command backlog and is
//!   exposed as [`CommandRouter::pending_setups`] and `bridge_pending_setups`
//! - Teardowns run inline and never wait for the worker to exit
//! - A reply channel stays open for the configured grace period after publishing

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use url::Url;

use crate::config::BridgeConfig;
use crate::connection::ConnectionWorker;
use crate::fabric::{ChannelFabric, Persistence};
use crate::observability::metrics;
use crate::pool::WorkerPool;
use crate::protocol::{
    syntax_error_reply, BridgeStatus, CommandMessage, ConnectionId, SetupCommand, TeardownCommand,
    ValidationError,
};
use crate::routing::registry::{ConnectionRecord, ConnectionRegistry};

/// Entry point for Setup and Teardown commands.
#[derive(Clone)]
pub struct CommandRouter {
    fabric: Arc<dyn ChannelFabric>,
    config: Arc<BridgeConfig>,
    registry: Arc<ConnectionRegistry>,
    pool: Arc<WorkerPool>,
    pending_setups: Arc<AtomicUsize>,
}

impl CommandRouter {
    pub fn new(
        fabric: Arc<dyn ChannelFabric>,
        config: Arc<BridgeConfig>,
        registry: Arc<ConnectionRegistry>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            fabric,
            config,
            registry,
            pool,
            pending_setups: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.registry.contains(id)
    }

    /// Setups currently waiting for a worker slot.
    pub fn pending_setups(&self) -> usize {
        self.pending_setups.load(Ordering::SeqCst)
    }

    /// Handle one payload from the command channel.
    pub async fn on_command(&self, payload: Bytes) {
        let msg = match CommandMessage::decode(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.on_malformed(&payload, e).await;
                return;
            }
        };

        match msg {
            CommandMessage::Setup(mut cmd) => match cmd.validate() {
                Ok(()) => {
                    let router = self.clone();
                    tokio::spawn(async move {
                        let reply = router.handle_setup(cmd).await;
                        metrics::record_command("setup", reply.header.status);
                        router.report(&reply.into()).await;
                    });
                }
                Err(e) => self.reject(cmd.into(), e).await,
            },
            CommandMessage::Teardown(mut cmd) => match self.validate_teardown(&mut cmd) {
                Ok(()) => {
                    let reply = self.handle_teardown(cmd).await;
                    metrics::record_command("teardown", reply.header.status);
                    self.report(&reply.into()).await;
                }
                Err(e) => self.reject(cmd.into(), e).await,
            },
            CommandMessage::Data(mut cmd) => {
                cmd.header.status = BridgeStatus::ErrorOnSyntax;
                self.reject(cmd.into(), ValidationError::WrongChannel("data")).await;
            }
        }
    }

    /// The identifier must belong to a live connection.
    pub fn validate_teardown(&self, cmd: &mut TeardownCommand) -> Result<(), ValidationError> {
        if cmd.header.cmd_return_channel_uri.is_none() {
            cmd.header.status = BridgeStatus::ErrorOnSyntax;
            return Err(ValidationError::MissingReturnChannel);
        }
        let id = cmd.header.connection_id;
        if !self.is_connected(id) {
            cmd.header.status = BridgeStatus::ErrorOnSyntax;
            return Err(ValidationError::UnknownConnection(id));
        }
        cmd.header.status = BridgeStatus::Ok;
        Ok(())
    }

    /// Create a connection for a validated Setup and return the reply.
    ///
    /// Waits while the pool is saturated. On failure no registry entry is
    /// left behind.
    pub async fn handle_setup(&self, mut cmd: SetupCommand) -> SetupCommand {
        let Some(target) = cmd.connection_url.clone() else {
            cmd.header.status = BridgeStatus::ErrorOnSyntax;
            return cmd;
        };

        let waiting = PendingSetup::enter(&self.pending_setups);
        let reserved = self.pool.reserve().await;
        drop(waiting);
        let slot = match reserved {
            Ok(slot) => slot,
            Err(e) => {
                tracing::warn!(url = %target, error = %e, "Setup refused");
                cmd.header.status = BridgeStatus::ErrorOnConnect;
                return cmd;
            }
        };

        let channels = &self.config.bridge;
        let registered = self.registry.register(|id| -> Result<ConnectionRecord, url::ParseError> {
            let data_channel = channels.data_uri(id)?;
            let return_channel = channels.data_return_uri(id)?;
            let mut setup = cmd.clone();
            setup.header.connection_id = id;
            setup.header.status = BridgeStatus::Ok;
            setup.data_cmd_channel_uri = Some(data_channel.clone());
            setup.data_cmd_return_channel_uri = Some(return_channel.clone());
            Ok(ConnectionRecord::new(id, setup, data_channel, return_channel))
        });
        let record = match registered {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(error = %e, "Could not build connection channel names");
                cmd.header.status = BridgeStatus::ErrorOnSyntax;
                return cmd;
            }
        };

        let worker = ConnectionWorker::start(
            &self.fabric,
            Arc::clone(&self.registry),
            Arc::clone(&record),
            target.clone(),
            self.config.http.clone(),
        )
        .await;
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                tracing::warn!(connection_id = %record.id, error = %e, "Could not open connection channels");
                cmd.header.status = BridgeStatus::ErrorOnConnect;
                return cmd;
            }
        };

        if let Err(e) = self.pool.spawn(slot, record.id, worker.run()).await {
            tracing::warn!(connection_id = %record.id, error = %e, "Setup abandoned");
            cmd.header.status = BridgeStatus::ErrorOnConnect;
            return cmd;
        }
        metrics::record_active_connections(self.registry.len());
        tracing::info!(
            connection_id = %record.id,
            url = %target,
            data_channel = %record.data_channel,
            "Connection established"
        );
        record.setup.clone()
    }

    /// Release a connection. An unknown identifier is a no-op.
    pub async fn handle_teardown(&self, mut cmd: TeardownCommand) -> TeardownCommand {
        let id = cmd.header.connection_id;
        match self.registry.remove(id) {
            Some(record) => {
                record.stop();
                metrics::record_active_connections(self.registry.len());
                tracing::info!(connection_id = %id, "Connection torn down");
            }
            None => tracing::debug!(connection_id = %id, "Teardown for unknown connection ignored"),
        }
        cmd.header.status = BridgeStatus::Ok;
        cmd
    }

    async fn reject(&self, msg: CommandMessage, error: ValidationError) {
        tracing::warn!(command = msg.kind(), error = %error, "Command rejected");
        metrics::record_command(msg.kind(), msg.status());
        self.report(&msg).await;
    }

    async fn on_malformed(&self, payload: &[u8], error: serde_json::Error) {
        match syntax_error_reply(payload) {
            Some((uri, reply)) => {
                tracing::warn!(error = %error, channel = %uri, "Malformed command");
                metrics::record_command("malformed", BridgeStatus::ErrorOnSyntax);
                self.publish_reply(uri, reply).await;
            }
            None => tracing::warn!(error = %error, bytes = payload.len(), "Malformed command without return channel dropped"),
        }
    }

    /// Publish `msg` on its own return channel.
    async fn report(&self, msg: &CommandMessage) {
        let Some(uri) = msg.header().cmd_return_channel_uri.clone() else {
            tracing::warn!(command = msg.kind(), "No return channel, reply dropped");
            return;
        };
        match msg.encode() {
            Ok(payload) => self.publish_reply(uri, payload).await,
            Err(e) => tracing::error!(command = msg.kind(), error = %e, "Failed to encode reply"),
        }
    }

    async fn publish_reply(&self, uri: Url, payload: Bytes) {
        let channel = match self.fabric.open(&uri, Persistence::Never).await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(channel = %uri, error = %e, "Failed to open return channel");
                metrics::record_publish_failure("command_return");
                return;
            }
        };

        if let Err(e) = channel.publish(payload).await {
            tracing::warn!(channel = %uri, error = %e, "Failed to publish reply");
            metrics::record_publish_failure("command_return");
        }

        // Keep the channel up long enough for the subscriber to take delivery.
        let grace = self.config.bridge.reply_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(e) = channel.close().await {
                tracing::debug!(channel = %uri, error = %e, "Failed to close return channel");
            }
        });
    }
}

/// Counts a Setup as pending while it waits for a pool slot.
struct PendingSetup {
    count: Arc<AtomicUsize>,
}

impl PendingSetup {
    fn enter(count: &Arc<AtomicUsize>) -> Self {
        let pending = count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::record_pending_setups(pending);
        Self {
            count: Arc::clone(count),
        }
    }
}

impl Drop for PendingSetup {
    fn drop(&mut self) {
        let pending = self.count.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::record_pending_setups(pending);
    }
}
