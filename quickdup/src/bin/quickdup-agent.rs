use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use quickdup::{BridgeHost, Config, Duplicator, ExtensionBridge, Host};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let log_level = env::var("LOG_LEVEL")
        .map(|level| match level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env().context("invalid configuration")?;
    let (bridge, events) = ExtensionBridge::start(&config.bridge_addr)
        .await
        .context("failed to start extension bridge")?;

    if !bridge.wait_for_client(Duration::from_secs(30)).await {
        warn!("No extension connected yet; events will be handled once it does");
    }

    let host: Arc<dyn Host> = Arc::new(BridgeHost::new(bridge.clone(), config.markers.clone()));
    let duplicator = Duplicator::new(host, config);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for ctrl-c");
            return;
        }
        on_signal.cancel();
    });

    info!(addr = %bridge.local_addr(), "quickdup agent running");
    duplicator.run(events, cancel).await;
    info!("quickdup agent stopped");
    Ok(())
}
