//! Caller side of the command protocol.
//!
//! # Data Flow
//! ```text
//! BridgeClient::connect(fabric, command channel, private return channel)
//!     setup(url)      → Setup on the command channel → reply on the return channel
//!     open_connection → BridgeConnection on the derived data channels
//!         send(data)  → Data on the data channel → reply on the data return channel
//!     teardown(id)    → Teardown on the command channel → reply
//! ```
//!
//! # Design Decisions
//! - Every call waits for its reply, so one client issues one command at a time
//! - Return channels are subscribed before anything is published
//! - A reply that arrives after its call timed out is discarded by the next
//!   call instead of being taken as that call's answer

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use crate::fabric::{Channel, ChannelFabric, FabricError, Persistence, Subscription};
use crate::protocol::{
    BridgeStatus, CommandMessage, ConnectionId, DataCommand, SetupCommand, TeardownCommand,
};

/// Default time to wait for a reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Error type for client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("fabric error: {0}")]
    Fabric(#[from] FabricError),

    #[error("malformed reply: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("reply channel closed")]
    Closed,

    #[error("expected a {expected} reply, got {got}")]
    UnexpectedReply {
        expected: &'static str,
        got: &'static str,
    },

    #[error("connection was not established: {0}")]
    NotConnected(BridgeStatus),
}

/// Publishes commands on the bridge's command channel.
///
/// `setup` and `teardown` skip replies that are not theirs: a teardown reply
/// must carry the requested identifier and a setup reply the requested URL.
/// Two Setups for the same URL cannot be told apart, so after a timed-out
/// `setup` the bridge may still create that connection; tear it down or
/// discard the client.
pub struct BridgeClient {
    fabric: Arc<dyn ChannelFabric>,
    commands: Box<dyn Channel>,
    returns: Box<dyn Channel>,
    replies: Subscription,
    timeout: Duration,
}

impl BridgeClient {
    /// Open the command channel and subscribe to `return_uri`.
    pub async fn connect(
        fabric: Arc<dyn ChannelFabric>,
        command_uri: &Url,
        return_uri: &Url,
    ) -> Result<Self, ClientError> {
        let returns = fabric.open(return_uri, Persistence::Never).await?;
        let replies = returns.subscribe().await?;
        let commands = fabric.open(command_uri, Persistence::Never).await?;
        Ok(Self {
            fabric,
            commands,
            returns,
            replies,
            timeout: DEFAULT_REPLY_TIMEOUT,
        })
    }

    /// Time to wait for each reply, on this client and its connections.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn return_channel(&self) -> &Url {
        self.returns.uri()
    }

    /// Publish `msg` and wait for the next reply on the return channel, whatever it is.
    pub async fn send_command(&mut self, msg: &CommandMessage) -> Result<CommandMessage, ClientError> {
        self.exchange(msg, |_| true).await
    }

    async fn exchange<F>(&mut self, msg: &CommandMessage, accept: F) -> Result<CommandMessage, ClientError>
    where
        F: FnMut(&CommandMessage) -> bool,
    {
        self.commands.publish(msg.encode()?).await?;
        recv_reply(&mut self.replies, self.timeout, accept).await
    }

    /// Ask the bridge for a connection to `url`.
    pub async fn setup(&mut self, url: Url) -> Result<SetupCommand, ClientError> {
        let cmd = SetupCommand::new(self.return_channel().clone(), url);
        self.setup_with(cmd).await
    }

    /// Send a prepared Setup (for a proxy, say). The return channel is filled in.
    pub async fn setup_with(&mut self, mut cmd: SetupCommand) -> Result<SetupCommand, ClientError> {
        cmd.header.cmd_return_channel_uri = Some(self.return_channel().clone());
        let url = cmd.connection_url.clone();
        let accept = |reply: &CommandMessage| {
            matches!(reply, CommandMessage::Setup(setup) if setup.connection_url == url)
        };
        match self.exchange(&cmd.into(), accept).await? {
            CommandMessage::Setup(reply) => Ok(reply),
            other => Err(unexpected("setup", &other)),
        }
    }

    pub async fn teardown(&mut self, id: ConnectionId) -> Result<TeardownCommand, ClientError> {
        let cmd = TeardownCommand::new(id, self.return_channel().clone());
        let accept = |reply: &CommandMessage| {
            matches!(reply, CommandMessage::Teardown(_)) && reply.header().connection_id == id
        };
        match self.exchange(&cmd.into(), accept).await? {
            CommandMessage::Teardown(reply) => Ok(reply),
            other => Err(unexpected("teardown", &other)),
        }
    }

    /// Open the data channels named in a successful Setup reply.
    pub async fn open_connection(&self, setup: &SetupCommand) -> Result<BridgeConnection, ClientError> {
        let (Some(data_uri), Some(return_uri)) =
            (&setup.data_cmd_channel_uri, &setup.data_cmd_return_channel_uri)
        else {
            return Err(ClientError::NotConnected(setup.header.status));
        };
        if !setup.header.status.is_ok() {
            return Err(ClientError::NotConnected(setup.header.status));
        }

        let returns = self.fabric.open(return_uri, Persistence::Never).await?;
        let replies = returns.subscribe().await?;
        let commands = self.fabric.open(data_uri, Persistence::Never).await?;
        Ok(BridgeConnection {
            id: setup.header.connection_id,
            commands,
            returns,
            replies,
            timeout: self.timeout,
            late_replies: 0,
        })
    }

    pub async fn close(self) {
        close_all([&self.commands, &self.returns]).await;
    }
}

/// One established connection's data channels.
///
/// The bridge answers data commands one at a time and in order, so the replies
/// owed to timed-out sends are the first ones to arrive and are skipped.
pub struct BridgeConnection {
    id: ConnectionId,
    commands: Box<dyn Channel>,
    returns: Box<dyn Channel>,
    replies: Subscription,
    timeout: Duration,
    late_replies: usize,
}

impl BridgeConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Run one data command and return the populated reply.
    pub async fn send(&mut self, mut cmd: DataCommand) -> Result<DataCommand, ClientError> {
        cmd.header.connection_id = self.id;
        self.commands.publish(CommandMessage::from(cmd).encode()?).await?;

        let late = &mut self.late_replies;
        let skip_late = |_: &CommandMessage| {
            if *late == 0 {
                return true;
            }
            *late -= 1;
            false
        };
        let reply = recv_reply(&mut self.replies, self.timeout, skip_late).await;
        if matches!(reply, Err(ClientError::Timeout(_))) {
            self.late_replies += 1;
        }

        match reply? {
            CommandMessage::Data(reply) => Ok(reply),
            other => Err(unexpected("data", &other)),
        }
    }

    pub async fn close(self) {
        close_all([&self.commands, &self.returns]).await;
    }
}

/// First reply `accept` takes, within `timeout` of the call.
async fn recv_reply<F>(replies: &mut Subscription, timeout: Duration, mut accept: F) -> Result<CommandMessage, ClientError>
where
    F: FnMut(&CommandMessage) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let payload = match tokio::time::timeout_at(deadline, replies.recv()).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return Err(ClientError::Closed),
            Err(_) => return Err(ClientError::Timeout(timeout)),
        };
        let reply = CommandMessage::decode(&payload)?;
        if accept(&reply) {
            return Ok(reply);
        }
        tracing::debug!(command = reply.kind(), status = %reply.status(), "Discarding stale reply");
    }
}

fn unexpected(expected: &'static str, got: &CommandMessage) -> ClientError {
    ClientError::UnexpectedReply {
        expected,
        got: got.kind(),
    }
}

async fn close_all(channels: [&Box<dyn Channel>; 2]) {
    for channel in channels {
        if let Err(e) = channel.close().await {
            tracing::debug!(channel = %channel.uri(), error = %e, "Failed to close channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::MemoryFabric;

    fn uri(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn reply_times_out_without_a_bridge() {
        let fabric: Arc<dyn ChannelFabric> = Arc::new(MemoryFabric::new());
        let mut client = BridgeClient::connect(fabric, &uri("ndn:/test/cmd"), &uri("ndn:/test/ret"))
            .await
            .unwrap()
            .with_timeout(Duration::from_millis(20));

        let err = client.setup(uri("http://example.com")).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
    }

    #[tokio::test]
    async fn failed_setup_cannot_be_opened() {
        let fabric: Arc<dyn ChannelFabric> = Arc::new(MemoryFabric::new());
        let client = BridgeClient::connect(fabric, &uri("ndn:/test/cmd"), &uri("ndn:/test/ret"))
            .await
            .unwrap();

        let mut setup = SetupCommand::new(uri("ndn:/test/ret"), uri("http://example.com"));
        setup.header.status = BridgeStatus::ErrorOnSyntax;
        let err = client.open_connection(&setup).await.err().unwrap();
        assert!(matches!(err, ClientError::NotConnected(BridgeStatus::ErrorOnSyntax)));
    }

    #[tokio::test]
    async fn late_data_reply_is_not_taken_for_the_next_send() {
        let fabric: Arc<dyn ChannelFabric> = Arc::new(MemoryFabric::new());
        let data_uri = uri("ndn:/test/data-7");
        let return_uri = uri("ndn:/test/data-return-7");

        // Answers each command with its path, the first one late.
        let inbox = fabric.open(&data_uri, Persistence::Never).await.unwrap();
        let mut commands = inbox.subscribe().await.unwrap();
        let outbox = fabric.open(&return_uri, Persistence::Never).await.unwrap();
        tokio::spawn(async move {
            let _inbox = inbox;
            let mut first = true;
            while let Some(payload) = commands.recv().await {
                let CommandMessage::Data(mut cmd) = CommandMessage::decode(&payload).unwrap() else {
                    continue;
                };
                if first {
                    first = false;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                cmd.response_message = cmd.url_path.clone();
                outbox.publish(CommandMessage::from(cmd).encode().unwrap()).await.unwrap();
            }
        });

        let client = BridgeClient::connect(Arc::clone(&fabric), &uri("ndn:/test/cmd"), &uri("ndn:/test/ret"))
            .await
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        let mut setup = SetupCommand::new(uri("ndn:/test/ret"), uri("http://example.com"));
        setup.header.connection_id = ConnectionId::new(7);
        setup.data_cmd_channel_uri = Some(data_uri);
        setup.data_cmd_return_channel_uri = Some(return_uri);
        let mut connection = client.open_connection(&setup).await.unwrap();

        let err = connection
            .send(DataCommand::new(ConnectionId::new(7), "GET").with_path("/slow"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let reply = connection
            .send(DataCommand::new(ConnectionId::new(7), "GET").with_path("/fast"))
            .await
            .unwrap();
        assert_eq!(reply.response_message.as_deref(), Some("/fast"));
    }

    #[tokio::test]
    async fn teardown_skips_replies_for_other_commands() {
        let fabric: Arc<dyn ChannelFabric> = Arc::new(MemoryFabric::new());
        let return_uri = uri("ndn:/test/ret");
        let mut client = BridgeClient::connect(Arc::clone(&fabric), &uri("ndn:/test/cmd"), &return_uri)
            .await
            .unwrap()
            .with_timeout(Duration::from_secs(1));

        let stray = fabric.open(&return_uri, Persistence::Never).await.unwrap();
        let late_setup = SetupCommand::new(return_uri.clone(), uri("http://example.com"));
        let other_teardown = TeardownCommand::new(ConnectionId::new(4), return_uri.clone());
        let ours = TeardownCommand::new(ConnectionId::new(5), return_uri.clone());
        for msg in [late_setup.into(), other_teardown.into(), CommandMessage::from(ours)] {
            stray.publish(msg.encode().unwrap()).await.unwrap();
        }

        let reply = client.teardown(ConnectionId::new(5)).await.unwrap();
        assert_eq!(reply.header.connection_id, ConnectionId::new(5));
    }
}
