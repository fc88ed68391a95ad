//! HTTP bridge command line.
//!
//! ```text
//!   http-bridge fetch <url>            one request through an in-process bridge
//!        │
//!        ▼
//!   BridgeClient ──setup──▶ command channel ──▶ CommandRouter ──▶ ConnectionWorker
//!        │                                                          │
//!        └──data──▶ data channel ─────────────────────────────────▶ HttpExecutor ──▶ server
//!                                                                   │
//!   stdout ◀── output channel ◀── response body ◀───────────────────┘
//!
//!   http-bridge check-config <file>    load, validate and print a configuration
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use url::Url;

use http_bridge::client::BridgeClient;
use http_bridge::config::{load_config, BridgeConfig};
use http_bridge::fabric::{ChannelFabric, MemoryFabric, Persistence};
use http_bridge::lifecycle::signals;
use http_bridge::observability::{logging, metrics};
use http_bridge::protocol::{DataCommand, SetupCommand};
use http_bridge::Bridge;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "http-bridge")]
#[command(about = "HTTP requests carried over a publish/subscribe bus", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one request through an in-process bridge and print the result
    Fetch(FetchArgs),
    /// Validate a configuration file and print the effective settings
    CheckConfig {
        path: PathBuf,
    },
}

#[derive(Args)]
struct FetchArgs {
    /// Connection URL
    url: Url,

    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Path appended to the connection URL
    #[arg(long)]
    path: Option<String>,

    /// Request header, "Name: value"
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,

    #[arg(long)]
    proxy_host: Option<String>,

    #[arg(long)]
    proxy_port: Option<u16>,

    /// Seconds to wait for the request body
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[arg(long)]
    use_cache: bool,

    /// Log at info level instead of warn
    #[arg(short, long)]
    verbose: bool,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once(':')
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected \"Name: value\", got {:?}", raw))
}

#[tokio::main]
async fn main() -> CliResult<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { path } => {
            let config = load_config(&path)?;
            println!("# {} is valid", path.display());
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Fetch(args) => {
            let mut config = match &cli.config {
                Some(path) => load_config(path)?,
                None => BridgeConfig::default(),
            };
            if !args.verbose && cli.config.is_none() {
                config.observability.log_filter = "http_bridge=warn".to_string();
            }
            logging::init_logging(&config.observability);

            if config.observability.metrics_enabled {
                match config.observability.metrics_address.parse() {
                    Ok(addr) => metrics::init_metrics(addr),
                    Err(_) => tracing::error!(
                        metrics_address = %config.observability.metrics_address,
                        "Failed to parse metrics address"
                    ),
                }
            }

            fetch(config, args).await
        }
    }
}

async fn fetch(config: BridgeConfig, args: FetchArgs) -> CliResult<ExitCode> {
    let fabric: Arc<dyn ChannelFabric> = Arc::new(MemoryFabric::new());
    let handle = Bridge::new(Arc::clone(&fabric), config.clone()).start().await?;

    let outcome = tokio::select! {
        result = run_fetch(&fabric, handle.command_channel(), &config, args) => result,
        _ = signals::wait_for_signal() => Err("interrupted".into()),
    };

    handle.shutdown().await;
    outcome
}

async fn run_fetch(
    fabric: &Arc<dyn ChannelFabric>,
    command_uri: &Url,
    config: &BridgeConfig,
    args: FetchArgs,
) -> CliResult<ExitCode> {
    let scope = format!(
        "{}/fetch-{}",
        config.bridge.node_uri.trim_end_matches('/'),
        std::process::id()
    );
    let return_uri = Url::parse(&format!("{}/return", scope))?;
    let input_uri = Url::parse(&format!("{}/input", scope))?;
    let output_uri = Url::parse(&format!("{}/output", scope))?;

    let mut client = BridgeClient::connect(Arc::clone(fabric), command_uri, &return_uri)
        .await?
        .with_timeout(Duration::from_secs(args.timeout.saturating_add(60)));

    let mut setup = SetupCommand::new(return_uri.clone(), args.url.clone());
    setup.proxy_host = args.proxy_host;
    setup.proxy_port = args.proxy_port;
    let setup = client.setup_with(setup).await?;
    if !setup.header.status.is_ok() {
        eprintln!("setup failed: {}", setup.header.status);
        return Ok(ExitCode::FAILURE);
    }
    let id = setup.header.connection_id;
    let mut connection = client.open_connection(&setup).await?;

    let output = fabric.open(&output_uri, Persistence::Latest).await?;
    let mut cmd = DataCommand::new(id, args.method).with_output(output_uri);
    cmd.use_cache = args.use_cache;
    if let Some(path) = args.path {
        cmd = cmd.with_path(path);
    }
    for (name, value) in args.headers {
        cmd = cmd.with_header(name, value);
    }

    let input = match args.data {
        Some(body) => {
            let channel = fabric.open(&input_uri, Persistence::Latest).await?;
            channel.publish(Bytes::from(body)).await?;
            cmd = cmd.with_input(input_uri, args.timeout);
            Some(channel)
        }
        None => None,
    };

    let reply = connection.send(cmd).await?;

    eprintln!("status: {}", reply.header.status);
    if let Some(code) = reply.response_code {
        eprintln!("{} {}", code, reply.response_message.as_deref().unwrap_or_default());
    }
    for (name, values) in reply.response_headers.iter().flatten() {
        for value in values {
            eprintln!("{}: {}", name, value);
        }
    }

    if reply.header.status.is_ok() {
        if let Ok(body) = output.latest(Duration::from_millis(100)).await {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&body)?;
            stdout.flush()?;
        }
    }

    connection.close().await;
    let teardown = client.teardown(id).await?;
    tracing::info!(connection_id = %id, status = %teardown.header.status, "Connection released");
    client.close().await;
    output.close().await?;
    if let Some(channel) = input {
        channel.close().await?;
    }

    Ok(if reply.header.status.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
