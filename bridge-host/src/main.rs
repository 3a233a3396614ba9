//! Headless bridge host.
//!
//! Reads method calls as JSON lines on stdin and answers each with one JSON
//! line on stdout. Logs go to stderr.

mod wire;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use thermal_bridge::dispatch::dispatch;
use thermal_bridge::{Bridge, BridgeConfig, BtleplugAdapter};

use crate::wire::{Response, parse_request};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = BridgeConfig::from_env();
    tracing::info!("Starting thermal printer bridge host");

    let adapter = Arc::new(BtleplugAdapter::new().await?);
    let (bridge, pump) = Bridge::start(adapter, config).await?;

    tokio::select! {
        result = serve(&bridge) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
    }

    tracing::info!("Shutting down...");
    bridge.shutdown();
    if let Err(e) = pump.await {
        tracing::warn!("Event pump ended abnormally: {e}");
    }
    Ok(())
}

/// Answer requests until stdin closes.
async fn serve(bridge: &Bridge<BtleplugAdapter>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match parse_request(&line) {
            Ok(request) => {
                let result = dispatch(bridge, &request.call).await;
                Response::from_method(request.id, result)
            }
            Err(e) => {
                tracing::warn!("Unparseable request: {e}");
                Response::Error {
                    error: e.to_string(),
                }
            }
        };

        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        stdout.write_all(&encoded).await?;
        stdout.flush().await?;
    }

    tracing::info!("stdin closed");
    Ok(())
}
