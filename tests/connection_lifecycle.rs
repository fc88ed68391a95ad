//! Setup / teardown behaviour of a running bridge.

use std::time::Duration;

use bytes::Bytes;
use url::Url;

use http_bridge::client::ClientError;
use http_bridge::fabric::{ChannelFabric, Persistence};
use http_bridge::protocol::{
    BridgeStatus, CommandMessage, ConnectionId, DataCommand, SetupCommand, TeardownCommand,
};

mod common;
use common::{MockResponse, TestBridge};

#[tokio::test]
async fn test_setup_without_url_is_syntax_error() {
    let bridge = TestBridge::start(common::fast_config(4)).await;
    let mut client = bridge.client("no-url").await;

    let reply = client.setup_with(SetupCommand::default()).await.unwrap();

    assert_eq!(reply.header.status, BridgeStatus::ErrorOnSyntax);
    assert!(reply.header.connection_id.is_none());
    assert!(reply.data_cmd_channel_uri.is_none());
    assert_eq!(bridge.handle.connection_count(), 0);
    bridge.handle.shutdown().await;
}

#[tokio::test]
async fn test_setup_without_return_channel_registers_nothing() {
    let bridge = TestBridge::start(common::fast_config(4)).await;
    let commands = bridge
        .fabric
        .open(bridge.handle.command_channel(), Persistence::Never)
        .await
        .unwrap();

    let setup = SetupCommand {
        connection_url: Some(Url::parse("http://127.0.0.1:9").unwrap()),
        ..SetupCommand::default()
    };
    commands
        .publish(CommandMessage::from(setup).encode().unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(bridge.handle.connection_count(), 0);
    assert_eq!(bridge.handle.active_workers(), 0);
    bridge.handle.shutdown().await;
}

#[tokio::test]
async fn test_setup_then_teardown() {
    let backend = common::start_mock_backend(200, "OK", "unused").await;
    let bridge = TestBridge::start(common::fast_config(4)).await;
    let mut client = bridge
        .client("lifecycle")
        .await
        .with_timeout(Duration::from_millis(500));

    let setup = client.setup(backend.url()).await.unwrap();
    assert_eq!(setup.header.status, BridgeStatus::Ok);
    let id = setup.header.connection_id;
    assert!(!id.is_none());
    assert!(bridge.handle.is_connected(id));
    assert_eq!(setup.connection_url.as_ref(), Some(&backend.url()));

    let mut connection = client.open_connection(&setup).await.unwrap();

    let teardown = client.teardown(id).await.unwrap();
    assert_eq!(teardown.header.status, BridgeStatus::Ok);
    assert!(!bridge.handle.is_connected(id));

    // The worker is gone: nobody answers on the old data channel.
    let err = connection.send(DataCommand::new(id, "GET")).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)));
    assert_eq!(backend.request_count(), 0);

    connection.close().await;
    bridge.handle.shutdown().await;
}

#[tokio::test]
async fn test_double_teardown() {
    let bridge = TestBridge::start(common::fast_config(4)).await;
    let mut client = bridge.client("double-teardown").await;

    let setup = client.setup(Url::parse("http://127.0.0.1:9").unwrap()).await.unwrap();
    let id = setup.header.connection_id;

    let first = client.teardown(id).await.unwrap();
    assert_eq!(first.header.status, BridgeStatus::Ok);

    // The router's validation rejects the unknown id...
    let second = client.teardown(id).await.unwrap();
    assert_eq!(second.header.status, BridgeStatus::ErrorOnSyntax);
    assert!(!bridge.handle.is_connected(id));

    // ...while the teardown operation itself stays a no-op.
    let direct = bridge
        .handle
        .router()
        .handle_teardown(TeardownCommand::new(id, client.return_channel().clone()))
        .await;
    assert_eq!(direct.header.status, BridgeStatus::Ok);

    bridge.handle.shutdown().await;
}

#[tokio::test]
async fn test_teardown_of_never_issued_id() {
    let bridge = TestBridge::start(common::fast_config(4)).await;
    let mut client = bridge.client("stranger").await;

    let reply = client.teardown(ConnectionId::new(12345)).await.unwrap();
    assert_eq!(reply.header.status, BridgeStatus::ErrorOnSyntax);
    bridge.handle.shutdown().await;
}

#[tokio::test]
async fn test_data_command_on_command_channel_is_rejected() {
    let bridge = TestBridge::start(common::fast_config(4)).await;
    let mut client = bridge.client("wrong-channel").await;

    let mut cmd = DataCommand::new(ConnectionId::new(1), "GET");
    cmd.header.cmd_return_channel_uri = Some(client.return_channel().clone());
    let reply = client.send_command(&cmd.into()).await.unwrap();

    assert!(matches!(reply, CommandMessage::Data(_)));
    assert_eq!(reply.status(), BridgeStatus::ErrorOnSyntax);
    bridge.handle.shutdown().await;
}

#[tokio::test]
async fn test_malformed_command_is_answered_when_possible() {
    let bridge = TestBridge::start(common::fast_config(4)).await;
    let return_uri = Url::parse("ndn:/test/caller/malformed").unwrap();
    let returns = bridge.fabric.open(&return_uri, Persistence::Never).await.unwrap();
    let mut replies = returns.subscribe().await.unwrap();
    let commands = bridge
        .fabric
        .open(bridge.handle.command_channel(), Persistence::Never)
        .await
        .unwrap();

    commands.publish(Bytes::from_static(b"definitely not json")).await.unwrap();
    commands
        .publish(Bytes::from(format!(
            r#"{{"command":"reboot","cmdReturnChannelURI":"{}"}}"#,
            return_uri
        )))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), replies.recv())
        .await
        .unwrap()
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(json["status"], "ERROR_ON_SYNTAX");
    assert_eq!(json["command"], "reboot");

    bridge.handle.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_every_worker() {
    let bridge = TestBridge::start(common::fast_config(4)).await;
    let mut client = bridge.client("shutdown").await;

    let mut data_channels = Vec::new();
    for _ in 0..3 {
        let setup = client.setup(Url::parse("http://127.0.0.1:9").unwrap()).await.unwrap();
        assert_eq!(setup.header.status, BridgeStatus::Ok);
        data_channels.push(setup.data_cmd_channel_uri.unwrap());
    }
    assert_eq!(bridge.handle.connection_count(), 3);
    client.close().await;

    let fabric = bridge.fabric.clone();
    bridge.handle.shutdown().await;

    for uri in &data_channels {
        assert!(!fabric.is_open(uri), "{} still open", uri);
    }
}

#[tokio::test]
async fn test_teardown_lets_in_flight_request_finish() {
    let backend = common::start_programmable_backend(|_| {
        MockResponse::new(200, "OK", "slow").with_delay(Duration::from_millis(500))
    })
    .await;
    let bridge = TestBridge::start(common::fast_config(4)).await;
    let mut client = bridge.client("in-flight").await;

    let setup = client.setup(backend.url()).await.unwrap();
    let id = setup.header.connection_id;
    let mut connection = client.open_connection(&setup).await.unwrap();

    let in_flight = tokio::spawn(async move {
        let reply = connection.send(DataCommand::new(id, "GET")).await;
        connection.close().await;
        reply
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(backend.request_count(), 1);

    let teardown = client.teardown(id).await.unwrap();
    assert_eq!(teardown.header.status, BridgeStatus::Ok);
    assert!(!bridge.handle.is_connected(id));
    assert!(!in_flight.is_finished());

    let reply = in_flight.await.unwrap().unwrap();
    assert_eq!(reply.header.status, BridgeStatus::Ok);
    assert_eq!(reply.response_code, Some(200));

    bridge.handle.shutdown().await;
}
