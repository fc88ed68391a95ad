//! Per-connection data command loop.
//!
//! # Responsibilities
//! - Own the connection's data command and data return channels
//! - Run data commands one at a time, in delivery order
//! - Publish one reply per data command
//! - Deregister the connection when the loop exits, however it exits

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use url::Url;

use crate::config::HttpConfig;
use crate::fabric::{Channel, ChannelFabric, FabricError, Persistence, Subscription};
use crate::http::{HttpExecutor, ProxyTarget};
use crate::observability::metrics;
use crate::protocol::{syntax_error_payload, BridgeStatus, CommandMessage, DataCommand, ValidationError};
use crate::routing::{ConnectionRecord, ConnectionRegistry};

/// Worker for one live connection.
///
/// Built by [`start`](Self::start) before the Setup is answered, so a caller
/// may publish as soon as it holds the reply.
pub struct ConnectionWorker {
    context: WorkerContext,
    subscription: Subscription,
}

struct WorkerContext {
    record: Arc<ConnectionRecord>,
    executor: HttpExecutor,
    commands: Box<dyn Channel>,
    replies: Box<dyn Channel>,
    guard: RegistryGuard,
}

impl ConnectionWorker {
    /// Open the return channel, then open and subscribe the data command channel.
    ///
    /// If this fails the record is removed from the registry again.
    pub async fn start(
        fabric: &Arc<dyn ChannelFabric>,
        registry: Arc<ConnectionRegistry>,
        record: Arc<ConnectionRecord>,
        target: Url,
        http: HttpConfig,
    ) -> Result<Self, FabricError> {
        let guard = RegistryGuard {
            registry,
            record: Arc::clone(&record),
        };

        let replies = fabric.open(&record.return_channel, Persistence::Never).await?;
        let commands = fabric.open(&record.data_channel, Persistence::Never).await?;
        let subscription = commands.subscribe().await?;

        let proxy = ProxyTarget::from_setup(&record.setup);
        let executor = HttpExecutor::new(Arc::clone(fabric), target, proxy, http);

        Ok(Self {
            context: WorkerContext {
                record,
                executor,
                commands,
                replies,
                guard,
            },
            subscription,
        })
    }

    /// Handle data commands until stopped or the channel goes away.
    pub async fn run(self) {
        let Self {
            context,
            mut subscription,
        } = self;
        let stop = context.record.stop_token();
        tracing::debug!(channel = %context.record.data_channel, "Worker listening");

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    tracing::debug!("Stop requested");
                    break;
                }
                payload = subscription.recv() => match payload {
                    Some(payload) => context.on_data_command(payload).await,
                    None => {
                        tracing::warn!("Data command channel closed under the worker");
                        break;
                    }
                },
            }
        }

        context.close().await;
    }
}

impl WorkerContext {
    async fn on_data_command(&self, payload: Bytes) {
        let mut cmd = match CommandMessage::decode(&payload) {
            Ok(CommandMessage::Data(cmd)) => cmd,
            Ok(mut other) => {
                tracing::warn!(error = %ValidationError::WrongChannel(other.kind()), "Data command rejected");
                other.set_status(BridgeStatus::ErrorOnSyntax);
                self.reply(&other).await;
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Malformed data command");
                if let Some(reply) = syntax_error_payload(&payload) {
                    self.publish(reply).await;
                }
                return;
            }
        };

        if let Err(e) = self.validate(&mut cmd) {
            tracing::warn!(error = %e, "Data command rejected");
            metrics::record_rejected_data_command(cmd.header.status);
            self.reply(&cmd.into()).await;
            return;
        }

        let method = cmd.http_request.clone().unwrap_or_default();
        let started = Instant::now();
        self.executor.execute(&mut cmd).await;
        metrics::record_data_command(&method, cmd.header.status, started);
        tracing::info!(
            method = %method,
            status = %cmd.header.status,
            response_code = cmd.response_code,
            "Data command complete"
        );

        self.reply(&cmd.into()).await;
    }

    /// Method present, and the identifier (if given) names this live connection.
    fn validate(&self, cmd: &mut DataCommand) -> Result<(), ValidationError> {
        cmd.validate()?;

        let id = cmd.header.connection_id;
        if id.is_none() {
            cmd.header.connection_id = self.record.id;
        } else if id != self.record.id || !self.is_live() {
            cmd.header.status = BridgeStatus::ErrorOnSyntax;
            return Err(ValidationError::UnknownConnection(id));
        }
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.guard
            .registry
            .get(self.record.id)
            .is_some_and(|current| Arc::ptr_eq(&current, &self.record))
    }

    async fn reply(&self, msg: &CommandMessage) {
        match msg.encode() {
            Ok(payload) => self.publish(payload).await,
            Err(e) => tracing::error!(error = %e, "Failed to encode data command reply"),
        }
    }

    async fn publish(&self, payload: Bytes) {
        // The caller may already have abandoned the connection.
        if let Err(e) = self.replies.publish(payload).await {
            tracing::info!(channel = %self.replies.uri(), error = %e, "Data command reply dropped");
            metrics::record_publish_failure("data_return");
        }
    }

    async fn close(self) {
        for channel in [&self.commands, &self.replies] {
            if let Err(e) = channel.close().await {
                tracing::info!(channel = %channel.uri(), error = %e, "Failed to close channel");
            }
        }
        tracing::info!("Worker stopped");
    }
}

/// Removes the connection from the registry when the worker goes away.
struct RegistryGuard {
    registry: Arc<ConnectionRegistry>,
    record: Arc<ConnectionRecord>,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.record.stop();
        if self.registry.remove_if_same(&self.record) {
            tracing::debug!(connection_id = %self.record.id, "Connection deregistered by worker exit");
            metrics::record_active_connections(self.registry.len());
        }
    }
}
