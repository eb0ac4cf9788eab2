pub mod error;
pub mod gateway; // Gateway pipeline and its internal HTTP surface
pub mod models;
pub mod modules;
pub mod utils;

#[cfg(test)]
mod test_support;

use modules::logger;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub use gateway::{
    GatewayClient, GatewayConfig, GatewayError, GatewayRequest, GatewayResponse, Operation,
};

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Run the gateway as a standalone service until Ctrl-C
pub async fn run() -> anyhow::Result<()> {
    let config = modules::config::load_app_config()?;
    logger::init_logger(&config.log_level);

    let data_dir = modules::config::get_data_dir()?;
    let client = Arc::new(GatewayClient::init_in(&config.gateway, &data_dir)?);

    // Expired entries are never served; sweeping only bounds memory
    let sweeper = {
        let client = client.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let purged = client.cache().purge_expired();
                if purged > 0 {
                    tracing::debug!("Purged {} expired cache entries", purged);
                }
            }
        })
    };

    let server = if config.server.enabled {
        if config.server.allow_lan_access {
            logger::log_warn("Gateway server accepts connections from the whole network");
        }
        match gateway::GatewayServer::start(
            config.server.get_bind_address(),
            config.server.port,
            client.clone(),
            config.server.api_key.clone(),
        )
        .await
        {
            Ok(started) => Some(started),
            Err(e) => {
                error!("Failed to start gateway server: {}", e);
                return Err(anyhow::anyhow!(e));
            }
        }
    } else {
        logger::log_info("HTTP surface disabled, gateway is only reachable in-process");
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Some((server, handle)) = server {
        server.stop();
        let _ = handle.await;
    }
    sweeper.abort();
    client.shutdown().await;
    Ok(())
}
