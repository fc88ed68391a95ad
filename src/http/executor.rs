//! One HTTP request/response cycle per data command.
//!
//! # Responsibilities
//! - Build (once) the client bound to a connection's URL and proxy
//! - Run the request steps in order, short-circuiting to a status
//! - Stream the input channel into the request and the response into the output channel
//! - Always release the output channel

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use thiserror::Error;
use url::Url;

use crate::config::HttpConfig;
use crate::fabric::{Channel, ChannelFabric, Persistence};
use crate::http::{request, response};
use crate::protocol::{BridgeStatus, DataCommand, SetupCommand};

/// A failed step, tagged with the status it reports.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("connect error: {0}")]
    Connect(String),

    #[error("response error: {0}")]
    Response(String),

    #[error("io error: {0}")]
    Io(String),
}

impl ExecutorError {
    pub fn status(&self) -> BridgeStatus {
        match self {
            ExecutorError::Syntax(_) => BridgeStatus::ErrorOnSyntax,
            ExecutorError::Connect(_) => BridgeStatus::ErrorOnConnect,
            ExecutorError::Response(_) => BridgeStatus::ErrorOnResponse,
            ExecutorError::Io(_) => BridgeStatus::ErrorOnIo,
        }
    }
}

/// HTTP proxy taken from a Setup command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub host: String,
    pub port: Option<u16>,
}

impl ProxyTarget {
    pub fn from_setup(setup: &SetupCommand) -> Option<Self> {
        setup.proxy().map(|(host, port)| Self {
            host: host.to_string(),
            port,
        })
    }

    fn url(&self) -> String {
        match self.port {
            Some(port) => format!("http://{}:{}", self.host, port),
            None => format!("http://{}", self.host),
        }
    }
}

/// Executes data commands against one connection URL.
pub struct HttpExecutor {
    fabric: Arc<dyn ChannelFabric>,
    target: Url,
    proxy: Option<ProxyTarget>,
    config: HttpConfig,
    client: OnceLock<Client>,
}

impl std::fmt::Debug for HttpExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpExecutor")
            .field("target", &self.target.as_str())
            .field("proxy", &self.proxy)
            .finish()
    }
}

impl HttpExecutor {
    pub fn new(
        fabric: Arc<dyn ChannelFabric>,
        target: Url,
        proxy: Option<ProxyTarget>,
        config: HttpConfig,
    ) -> Self {
        Self {
            fabric,
            target,
            proxy,
            config,
            client: OnceLock::new(),
        }
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Run `cmd` and write the outcome into it.
    ///
    /// Never fails: every error becomes the command's status.
    pub async fn execute(&self, cmd: &mut DataCommand) {
        cmd.header.status = BridgeStatus::Ok;

        let mut output: Option<Box<dyn Channel>> = None;
        let outcome = self.exchange(cmd, &mut output).await;

        if let Some(channel) = output.take() {
            if let Err(e) = channel.close().await {
                tracing::info!(channel = %channel.uri(), error = %e, "Failed to close output channel");
            }
        }

        if let Err(e) = outcome {
            tracing::warn!(status = %e.status(), error = %e, "Data command failed");
            cmd.header.status = e.status();
        }
    }

    async fn exchange(
        &self,
        cmd: &mut DataCommand,
        output: &mut Option<Box<dyn Channel>>,
    ) -> Result<(), ExecutorError> {
        let client = self.client()?;

        let method = request::parse_method(cmd.http_request.as_deref().unwrap_or_default())?;
        let url = request::target_url(&self.target, cmd.url_path.as_deref())?;
        let headers = request::build_headers(cmd.request_headers.as_ref(), cmd.use_cache)?;
        let mut builder = client.request(method.clone(), url.clone()).headers(headers);

        if let Some(uri) = &cmd.output_http_channel_uri {
            tracing::debug!(channel = %uri, "Opening output channel for response body");
            let channel = self
                .fabric
                .open(uri, Persistence::Latest)
                .await
                .map_err(|e| ExecutorError::Connect(format!("output channel: {}", e)))?;
            *output = Some(channel);
        }

        // The body has to be known before the request is sent.
        if let Some(uri) = &cmd.input_http_channel_uri {
            if request::allows_request_body(&method) {
                let timeout = Duration::from_secs(cmd.input_timeout_seconds);
                builder = builder.body(self.read_input(uri, timeout).await?);
            } else {
                tracing::debug!(method = %method, "Method takes no body, input channel ignored");
            }
        }

        tracing::info!(method = %method, url = %url, "Sending request");
        let resp = builder.send().await.map_err(classify_send_error)?;

        let status = resp.status();
        let message = response::reason_phrase(&resp);
        cmd.response_code = Some(status.as_u16());
        cmd.response_message = Some(message.clone());
        cmd.response_headers = Some(response::collect_headers(resp.headers()));
        tracing::info!(response_code = status.as_u16(), response_message = %message, "Response received");

        if response::is_error_status(status) {
            return Err(ExecutorError::Response(format!(
                "HTTP error [{}] {}",
                status.as_u16(),
                message
            )));
        }

        if let Some(channel) = output.as_ref() {
            if response::allows_response_body(&method, status) {
                let body = resp
                    .bytes()
                    .await
                    .map_err(|e| ExecutorError::Io(format!("reading response body: {}", e)))?;
                if body.is_empty() {
                    tracing::info!("Empty response body, nothing published");
                } else {
                    let len = body.len();
                    channel
                        .publish(body)
                        .await
                        .map_err(|e| ExecutorError::Io(format!("publishing response body: {}", e)))?;
                    tracing::info!(bytes = len, channel = %channel.uri(), "Published response body");
                }
            }
        }

        Ok(())
    }

    async fn read_input(&self, uri: &Url, timeout: Duration) -> Result<Bytes, ExecutorError> {
        let channel = self
            .fabric
            .open(uri, Persistence::Latest)
            .await
            .map_err(|e| ExecutorError::Response(format!("input channel: {}", e)))?;

        let read = channel.latest(timeout).await;
        if let Err(e) = channel.close().await {
            tracing::info!(channel = %uri, error = %e, "Failed to close input channel");
        }

        let bytes = read.map_err(|e| ExecutorError::Response(format!("input channel: {}", e)))?;
        tracing::info!(bytes = bytes.len(), channel = %uri, "Input bytes received");
        Ok(bytes)
    }

    fn client(&self) -> Result<&Client, ExecutorError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let built = self.build_client()?;
        Ok(self.client.get_or_init(|| built))
    }

    fn build_client(&self) -> Result<Client, ExecutorError> {
        let mut builder = Client::builder();

        match &self.proxy {
            Some(proxy) => {
                tracing::info!(url = %self.target, proxy = %proxy.url(), "Opening connection through proxy");
                let proxy = reqwest::Proxy::all(proxy.url())
                    .map_err(|e| ExecutorError::Connect(format!("invalid proxy: {}", e)))?;
                builder = builder.proxy(proxy);
            }
            None => {
                tracing::info!(url = %self.target, "Opening connection, no proxy");
                if !self.config.use_system_proxy {
                    builder = builder.no_proxy();
                }
            }
        }

        if !self.config.keep_alive {
            builder = builder.pool_max_idle_per_host(0);
        }
        if let Some(secs) = self.config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        builder
            .build()
            .map_err(|e| ExecutorError::Connect(format!("building client: {}", e)))
    }
}

fn classify_send_error(e: reqwest::Error) -> ExecutorError {
    if e.is_body() {
        ExecutorError::Io(e.to_string())
    } else if e.is_connect() || e.is_builder() {
        ExecutorError::Connect(e.to_string())
    } else {
        ExecutorError::Response(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::MemoryFabric;
    use crate::protocol::ConnectionId;

    fn executor(target: &str) -> HttpExecutor {
        HttpExecutor::new(
            Arc::new(MemoryFabric::new()),
            Url::parse(target).unwrap(),
            None,
            HttpConfig::default(),
        )
    }

    #[test]
    fn errors_map_to_statuses() {
        assert_eq!(ExecutorError::Syntax(String::new()).status(), BridgeStatus::ErrorOnSyntax);
        assert_eq!(ExecutorError::Connect(String::new()).status(), BridgeStatus::ErrorOnConnect);
        assert_eq!(ExecutorError::Response(String::new()).status(), BridgeStatus::ErrorOnResponse);
        assert_eq!(ExecutorError::Io(String::new()).status(), BridgeStatus::ErrorOnIo);
    }

    #[test]
    fn proxy_url_includes_port_when_given() {
        let setup = SetupCommand::new(
            Url::parse("ndn:/node/ret").unwrap(),
            Url::parse("http://example.com").unwrap(),
        )
        .with_proxy("proxy.local", 911);
        let proxy = ProxyTarget::from_setup(&setup).unwrap();
        assert_eq!(proxy.url(), "http://proxy.local:911");

        let bare = ProxyTarget { host: "proxy.local".into(), port: None };
        assert_eq!(bare.url(), "http://proxy.local");
    }

    #[tokio::test]
    async fn bad_method_never_touches_the_network() {
        // Nothing listens on port 9; a network attempt would be a connect error.
        let exec = executor("http://127.0.0.1:9");
        let mut cmd = DataCommand::new(ConnectionId::new(1), "FOO");
        exec.execute(&mut cmd).await;
        assert_eq!(cmd.header.status, BridgeStatus::ErrorOnSyntax);
        assert!(cmd.response_code.is_none());
    }

    #[tokio::test]
    async fn refused_connection_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let exec = executor(&format!("http://{}", addr));
        let mut cmd = DataCommand::new(ConnectionId::new(1), "GET");
        exec.execute(&mut cmd).await;
        assert_eq!(cmd.header.status, BridgeStatus::ErrorOnConnect);
    }

    #[tokio::test]
    async fn client_is_built_once() {
        let exec = executor("http://127.0.0.1:9");
        let first = exec.client().unwrap() as *const Client;
        let second = exec.client().unwrap() as *const Client;
        assert_eq!(first, second);
    }
}
