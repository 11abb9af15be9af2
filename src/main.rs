//! # chatroom
//!
//! Command-line front end: run a broker, or act as a one-shot client.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chatroom_broker::{Broker, BrokerConfig};
use chatroom_client::{Client, ClientConfig};
use chatroom_core::settings::{self, Settings};
use chatroom_discovery::{MdnsDiscovery, Resolver, StaticResolver};
use chatroom_telemetry::{init_telemetry, TelemetryConfig};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};

/// Path-addressed message bus.
#[derive(Parser, Debug)]
#[command(name = "chatroom", version, about = "Path-addressed message bus")]
struct Cli {
    /// Settings file (default `~/.chatroom/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Broker address as `host:port`; skips mDNS discovery of the broker name.
    #[arg(long, global = true)]
    broker: Option<String>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a broker until interrupted.
    Broker {
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (0 for auto-assign).
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        name: Option<String>,
        /// Do not announce the broker over mDNS.
        #[arg(long)]
        no_announce: bool,
    },
    /// Call a method on another path and print the result.
    Call {
        target: String,
        method: String,
        /// Parameters as a JSON object.
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long, default_value = "cli.caller")]
        path: String,
        /// Seconds to wait for the result.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Publish one JSON payload from `path`.
    Publish {
        payload: String,
        #[arg(long)]
        path: String,
    },
    /// Print everything published by the given paths.
    Listen {
        #[arg(required = true)]
        sources: Vec<String>,
        #[arg(long, default_value = "cli.listener")]
        path: String,
    },
    /// Round-trip a message through the broker.
    Echo {
        message: String,
        #[arg(long, default_value = "cli.echo")]
        path: String,
    },
}

fn load(cli: &Cli) -> Result<Settings> {
    let mut settings = match &cli.settings {
        Some(path) => settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => settings::load_settings().context("Failed to load settings")?,
    };
    if cli.json_logs {
        settings.logging.json = true;
    }
    Ok(settings)
}

/// JSON if it parses, otherwise the raw text as a string.
fn parse_json(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn resolver(cli: &Cli) -> Result<Box<dyn Resolver>> {
    match &cli.broker {
        Some(target) => {
            let resolver = StaticResolver::parse(target)
                .with_context(|| format!("Invalid broker address: {target}"))?;
            Ok(Box::new(resolver))
        }
        None => {
            let mdns = MdnsDiscovery::new().context("Failed to start mDNS discovery")?;
            Ok(Box::new(mdns))
        }
    }
}

async fn connect(cli: &Cli, settings: &Settings, path: &str) -> Result<Client> {
    let resolver = resolver(cli)?;
    let config = ClientConfig::from_settings(path, &settings.client);
    Client::connect(config, resolver.as_ref())
        .await
        .with_context(|| format!("Failed to connect as {path}"))
}

async fn run_broker(
    settings: &Settings,
    host: Option<String>,
    port: Option<u16>,
    name: Option<String>,
    announce: bool,
) -> Result<()> {
    let mut config = BrokerConfig::from_settings(&settings.broker);
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(name) = name {
        config.name = name;
    }
    let mut broker = Broker::new(config);
    if announce {
        match MdnsDiscovery::new() {
            Ok(mdns) => broker = broker.with_announcer(Arc::new(mdns)),
            Err(e) => warn!(error = %e, "mDNS unavailable, broker will not be discoverable"),
        }
    }
    let handle = broker
        .start()
        .await
        .context("Failed to start broker")?;
    println!("listening on ws://{}/ws", handle.local_addr());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("interrupt received, shutting down");
    handle.shutdown(None).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;
    let _telemetry = init_telemetry(TelemetryConfig::from_settings(&settings.logging))
        .context("Failed to initialise logging")?;

    match &cli.command {
        Command::Broker {
            host,
            port,
            name,
            no_announce,
        } => {
            run_broker(&settings, host.clone(), *port, name.clone(), !no_announce).await?;
        }
        Command::Call {
            target,
            method,
            params,
            path,
            timeout,
        } => {
            let params: Value = serde_json::from_str(params).context("--params must be JSON")?;
            let client = connect(&cli, &settings, path).await?;
            let pending = client.send_rpc_request(target, method, params).await?;
            let result = match timeout {
                Some(secs) => pending.wait_for(Duration::from_secs(*secs)).await,
                None => pending.wait().await,
            };
            client.disconnect().await;
            println!("{}", serde_json::to_string_pretty(&result?)?);
        }
        Command::Publish { payload, path } => {
            let client = connect(&cli, &settings, path).await?;
            client.publish(parse_json(payload)).await?;
            client.disconnect().await;
        }
        Command::Listen { sources, path } => {
            let client = connect(&cli, &settings, path).await?;
            for source in sources {
                let from = source.clone();
                client
                    .subscribe(source, move |payload: &Value| println!("{from}: {payload}"))
                    .await
                    .with_context(|| format!("Failed to subscribe to {source}"))?;
            }
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for ctrl-c")?;
            client.disconnect().await;
        }
        Command::Echo { message, path } => {
            let client = connect(&cli, &settings, path).await?;
            let reply = client.echo(parse_json(message)).await;
            client.disconnect().await;
            println!("{}", reply?);
        }
    }
    Ok(())
}
