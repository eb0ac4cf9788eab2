use crate::gateway::config::UpstreamProxyConfig;
use reqwest::{Client, Proxy};

const USER_AGENT: &str = concat!("health-gateway/", env!("CARGO_PKG_VERSION"));

/// Create an HTTP client with the specified upstream proxy configuration
///
/// `timeout_secs` bounds each physical request; the pipeline deadline is enforced
/// separately.
pub fn create_client_with_proxy(
    timeout_secs: u64,
    proxy_config: Option<&UpstreamProxyConfig>,
) -> Client {
    let mut builder = Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .connect_timeout(std::time::Duration::from_secs(timeout_secs.min(10)))
        .user_agent(USER_AGENT);

    if let Some(config) = proxy_config {
        if config.enabled && !config.url.is_empty() {
            match Proxy::all(&config.url) {
                Ok(proxy) => {
                    builder = builder.proxy(proxy);
                    tracing::info!("HTTP client upstream proxy enabled: {}", config.url);
                }
                Err(e) => {
                    tracing::error!("Invalid proxy address: {}, error: {}", config.url, e);
                }
            }
        }
    }

    builder.build().unwrap_or_else(|e| {
        tracing::error!("Failed to build configured HTTP client: {}, using defaults", e);
        Client::new()
    })
}
