// ABOUTME: Library behind the axon-ping CLI.
// ABOUTME: Resolves connector settings from file, env and flags, then serves, pings or lists processors.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use axon_connector::axon_proto::command::{Command as AxonCommand, CommandResponse};
use axon_connector::axon_proto::common::SerializedObject;
use axon_connector::{
    AxonServerConnection, AxonServerConnectionFactory, CommandHandler, CommandName, ConnectorConfig,
    ConnectorError, Context, LoadFactor,
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

pub const PING_COMMAND: &str = "ping";
const PAYLOAD_TYPE: &str = "string";

#[derive(Parser, Debug)]
#[command(name = "axon-ping", about = "Ping round trips through AxonServer")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Routing server (host or host:port); repeat for more
    #[arg(long = "server", global = true, env = "AXON_SERVERS", value_delimiter = ',')]
    pub servers: Vec<String>,

    /// Context to connect to
    #[arg(long, global = true, env = "AXON_CONTEXT")]
    pub context: Option<String>,

    /// Access token
    #[arg(long, global = true, env = "AXON_TOKEN")]
    pub token: Option<String>,

    /// Connector config file (defaults to ~/.config/axon/connector.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Component name to register as
    #[arg(long, global = true)]
    pub component: Option<String>,

    /// Client instance id (generated when absent)
    #[arg(long = "client-id", global = true)]
    pub client_id: Option<String>,

    /// Show connector stream and heartbeat traffic
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Answer ping commands with pong until interrupted
    Serve,

    /// Send ping commands and report round trip times
    Ping {
        #[arg(long, short = 'c', default_value_t = 1)]
        count: u32,
    },

    /// List event processors known to the server
    Processors,
}

/// Config file first, then flags and environment on top.
pub fn resolve_config(cli: &Cli) -> Result<ConnectorConfig> {
    let mut config = match &cli.config {
        Some(path) => ConnectorConfig::load_from(path)?,
        None => ConnectorConfig::load()?,
    };
    if !cli.servers.is_empty() {
        config.servers = cli.servers.clone();
    }
    if let Some(context) = &cli.context {
        config.context = context.clone();
    }
    if let Some(token) = &cli.token {
        config.token = Some(token.clone());
    }
    if let Some(component) = &cli.component {
        config.component_name = component.clone();
    }
    if let Some(client_id) = &cli.client_id {
        config.client_instance_id = Some(client_id.clone());
    }
    Ok(config)
}

/// Answers every ping with pong.
#[derive(Debug, Default)]
pub struct PongHandler;

#[async_trait]
impl CommandHandler for PongHandler {
    async fn handle(
        &self,
        command: AxonCommand,
        _cancellation: CancellationToken,
    ) -> Result<CommandResponse, ConnectorError> {
        tracing::debug!(id = %command.message_identifier, "answering ping");
        Ok(CommandResponse {
            message_identifier: format!("pong-{}", command.message_identifier),
            payload: Some(text("pong")),
            ..Default::default()
        })
    }
}

fn text(value: &str) -> SerializedObject {
    SerializedObject {
        r#type: PAYLOAD_TYPE.to_string(),
        revision: String::new(),
        data: value.as_bytes().to_vec(),
    }
}

pub fn ping_command() -> AxonCommand {
    AxonCommand {
        name: PING_COMMAND.to_string(),
        payload: Some(text("ping")),
        ..Default::default()
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;
    let context = Context::new(config.context.clone())?;
    let wait = Duration::from_millis(config.connect_timeout_ms.saturating_mul(2));
    let options = config.into_options()?;

    let factory = AxonServerConnectionFactory::new(options);
    let connection = factory.connect(context).await?;
    let outcome = match tokio::time::timeout(wait, connection.wait_until_connected()).await {
        Ok(connected) => {
            connected?;
            execute(&cli.command, &connection).await
        }
        Err(_) => Err(anyhow::anyhow!(
            "could not reach AxonServer within {} ms",
            wait.as_millis()
        )),
    };
    factory.dispose().await;
    outcome
}

async fn execute(command: &Command, connection: &AxonServerConnection) -> Result<()> {
    match command {
        Command::Serve => serve(connection).await,
        Command::Ping { count } => ping(connection, *count).await,
        Command::Processors => processors(connection).await,
    }
}

async fn serve(connection: &AxonServerConnection) -> Result<()> {
    let registration = connection.command_channel()?.register_command_handler(
        Arc::new(PongHandler),
        LoadFactor::default(),
        [CommandName::new(PING_COMMAND)?],
    )?;
    registration
        .wait_until_completed()
        .await
        .context("server did not accept the ping subscription")?;
    println!("Serving '{PING_COMMAND}' in context {}. Ctrl-C to stop.", connection.context());

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    registration.dispose().await?;
    Ok(())
}

async fn ping(connection: &AxonServerConnection, count: u32) -> Result<()> {
    if count == 0 {
        bail!("count must be at least 1");
    }
    let channel = connection.command_channel()?;
    let cancellation = CancellationToken::new();
    let mut total = Duration::ZERO;
    for attempt in 1..=count {
        let started = Instant::now();
        let response = channel.send_command(ping_command(), &cancellation).await?;
        let elapsed = started.elapsed();
        total += elapsed;
        if let Some(error) = response.error_message {
            bail!("ping {attempt} failed: {} ({})", error.message, response.error_code);
        }
        println!(
            "reply from {}: seq={attempt} time={:.2} ms",
            response.message_identifier,
            elapsed.as_secs_f64() * 1000.0
        );
    }
    println!(
        "{count} pings, average {:.2} ms",
        total.as_secs_f64() * 1000.0 / f64::from(count)
    );
    Ok(())
}

async fn processors(connection: &AxonServerConnection) -> Result<()> {
    let processors = connection.admin_channel()?.get_all_event_processors().await?;
    if processors.is_empty() {
        println!("No event processors.");
        return Ok(());
    }
    for processor in processors {
        let name = processor
            .identifier
            .as_ref()
            .map(|identifier| identifier.processor_name.as_str())
            .unwrap_or("<unnamed>");
        println!(
            "{name}  mode={}  instances={}",
            processor.mode,
            processor.client_instance.len()
        );
    }
    Ok(())
}
