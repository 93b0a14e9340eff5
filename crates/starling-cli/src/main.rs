//! Thin demo binary around `starling-client`: connect to a Helios-Starling
//! server, fire a single request, or stay connected and print topic
//! notifications.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use starling_client::request_registry::RequestOptions;
use starling_client::{StarlingClient, TopicOptions};
use starling_config::StarlingConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "starling-cli", about = "Demo client for the Helios-Starling protocol")]
struct Cli {
    /// Path to a starling.toml config file, overriding the discovered one.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Override the server URL from config.
    #[arg(long)]
    url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Issue a single request and print the response.
    Request {
        method: String,
        /// JSON payload, e.g. '{"id": 1}'.
        #[arg(long)]
        payload: Option<String>,
        /// Timeout in milliseconds, overriding the configured default.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Subscribe to a topic pattern and print notifications as they arrive.
    Listen {
        pattern: String,
    },
    /// Force a recovery-token refresh and print the token.
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = StarlingConfig::load_from(cli.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(url) = cli.url {
        config.infra.connection.url = url;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.infra.telemetry.log_level.clone()))
        .init();

    let client = StarlingClient::new(config);

    {
        let client = client.clone();
        client.on("starling:*", move |event| {
            tracing::info!(name = %event.name, payload = %event.payload, "lifecycle event");
        });
    }

    client.connect().await.context("failed to connect")?;

    match cli.command {
        Command::Request {
            method,
            payload,
            timeout_ms,
        } => {
            let payload = payload
                .map(|p| serde_json::from_str(&p))
                .transpose()
                .context("payload was not valid JSON")?;
            let options = RequestOptions {
                timeout_ms,
                ..RequestOptions::new()
            };
            let handle = client
                .request(method, payload, options)
                .await
                .context("failed to issue request")?;
            let response = handle.await.context("request failed")?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Listen { pattern } => {
            client
                .subscribe(
                    pattern,
                    TopicOptions::new(),
                    Arc::new(|topic, data| {
                        println!("{topic}: {data}");
                    }),
                )
                .await
                .context("failed to subscribe")?;
            tracing::info!("listening, press ctrl-c to exit");
            tokio::signal::ctrl_c().await.ok();
        }
        Command::Sync => {
            let token = client.sync().await.context("state refresh failed")?;
            println!("{}", token.as_str());
        }
    }

    client.disconnect(None).await;
    Ok(())
}
