/*!
PERFDATA BRIDGE - Point d'entrée du service d'ingestion

RÔLE : Charge la config, initialise le logging, branche le client Gnocchi
et lance dispatcher + workers jusqu'à Ctrl-C / SIGTERM.
*/

use std::sync::Arc;

use anyhow::{Context, Result};
use perfdata_bridge::store::GnocchiClient;
use perfdata_bridge::{BridgeConfig, BridgeService};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    let config_path = BridgeConfig::config_path();
    let config = BridgeConfig::load_from(&config_path)
        .await
        .context("failed to load configuration")?;

    // RUST_LOG prioritaire sur log_level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // le warn de load_from est parti avant l'init du subscriber
    if !config_path.exists() {
        warn!(path = %config_path.display(), "no config file, using defaults");
    }

    info!(endpoint = %config.store.endpoint, "perfdata bridge starting");

    let store = GnocchiClient::new(&config.store).context("failed to build store client")?;
    let service = BridgeService::with_memory_cache(config, Arc::new(store));

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    service.run(shutdown).await
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM, Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown requested, finishing current work items");
    shutdown.cancel();
}
