use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use super::config::{ClientCredentials, GatewayConfig};
use super::error::GatewayError;
use crate::models::AccessToken;
use crate::modules::oauth;

const REFRESH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Owns the access token of the client-credentials grant.
///
/// Reads go through `current`; every refresh happens under `refresh_lock`,
/// and waiters re-check the token after acquiring it, so concurrent callers
/// share one physical exchange.
pub struct TokenManager {
    http_client: Client,
    token_url: String,
    credentials: ClientCredentials,
    safety_margin: Duration,
    refresh_attempts: u32,
    retry_delay: Duration,
    current: RwLock<Option<AccessToken>>,
    refresh_lock: Mutex<()>,
    refresh_count: AtomicU64,
}

impl TokenManager {
    /// Create new TokenManager
    pub fn new(
        http_client: Client,
        token_url: String,
        credentials: ClientCredentials,
        safety_margin: Duration,
        refresh_attempts: u32,
    ) -> Self {
        Self {
            http_client,
            token_url,
            credentials,
            safety_margin,
            refresh_attempts: refresh_attempts.max(1),
            retry_delay: REFRESH_RETRY_DELAY,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            refresh_count: AtomicU64::new(0),
        }
    }

    pub fn from_config(http_client: Client, config: &GatewayConfig) -> Self {
        Self::new(
            http_client,
            config.endpoints().token_url.clone(),
            config.credentials.clone(),
            config.token_safety_margin(),
            config.token_refresh_attempts,
        )
    }

    /// Pause between failed refresh attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Get a token that is valid beyond the safety margin, refreshing if needed
    pub async fn get_token(&self) -> Result<AccessToken, GatewayError> {
        if let Some(token) = self.usable_token().await {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Someone else may have refreshed while we waited for the lock
        if let Some(token) = self.usable_token().await {
            return Ok(token);
        }

        tracing::info!("Access token absent or about to expire, refreshing...");
        self.refresh_locked().await
    }

    /// Unconditionally exchange credentials for a new token
    pub async fn refresh_token(&self) -> Result<AccessToken, GatewayError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Replace a token the downstream rejected with 401.
    ///
    /// If another caller already swapped `rejected` out, its replacement is
    /// returned without a second exchange.
    pub async fn force_refresh(&self, rejected: &str) -> Result<AccessToken, GatewayError> {
        let _guard = self.refresh_lock.lock().await;
        if let Some(token) = self.usable_token().await {
            if token.value != rejected {
                return Ok(token);
            }
        }

        tracing::warn!("Downstream rejected the current token, forcing refresh");
        self.refresh_locked().await
    }

    /// Forget the cached token (teardown, credential rotation)
    pub async fn invalidate(&self) {
        *self.current.write().await = None;
    }

    /// Physical token exchanges performed so far
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::SeqCst)
    }

    async fn usable_token(&self) -> Option<AccessToken> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|token| token.is_usable(self.safety_margin))
            .cloned()
    }

    /// Caller must hold `refresh_lock`
    async fn refresh_locked(&self) -> Result<AccessToken, GatewayError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.refresh_count.fetch_add(1, Ordering::SeqCst);

            match oauth::request_client_credentials_token(
                &self.http_client,
                &self.token_url,
                &self.credentials,
            )
            .await
            {
                Ok(response) => {
                    let scope = response
                        .scope
                        .unwrap_or_else(|| self.credentials.scope.clone());
                    let token = AccessToken::new(response.access_token, response.expires_in, scope);

                    // Unusable on arrival; retrying would get the same lifetime
                    if !token.is_usable(self.safety_margin) {
                        tracing::error!(
                            "Token lifetime {}s does not exceed the {}s safety margin",
                            response.expires_in,
                            self.safety_margin.as_secs()
                        );
                        *self.current.write().await = None;
                        return Err(GatewayError::authentication(format!(
                            "issued token lifetime {}s does not exceed the {}s safety margin",
                            response.expires_in,
                            self.safety_margin.as_secs()
                        )));
                    }

                    *self.current.write().await = Some(token.clone());
                    tracing::info!("Token refreshed successfully: {}", token.preview());
                    return Ok(token);
                }
                Err(e) if e.is_retryable() && attempt < self.refresh_attempts => {
                    tracing::warn!(
                        "Token refresh attempt {}/{} failed: {}",
                        attempt,
                        self.refresh_attempts,
                        e
                    );
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
                Err(e) => {
                    tracing::error!("Token refresh failed after {} attempt(s): {}", attempt, e);
                    *self.current.write().await = None;
                    return Err(GatewayError::authentication(e.to_string()));
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn install(&self, token: AccessToken) {
        *self.current.write().await = Some(token);
    }
}
