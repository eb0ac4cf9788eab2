use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::gateway::config::ClientCredentials;

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Some token services send this as a quoted string
    #[serde(deserialize_with = "deserialize_expires_in")]
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub scope: Option<String>,
}

fn deserialize_expires_in<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(i64),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Error)]
pub enum OAuthError {
    #[error("Token request failed: {0}")]
    Transport(String),

    #[error("Token endpoint rejected the grant with HTTP {status}")]
    Rejected { status: u16 },

    #[error("Token response parsing failed: {0}")]
    Malformed(String),
}

impl OAuthError {
    /// Bad credentials will not fix themselves; transport faults and 5xx might
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status } => *status >= 500 || *status == 429,
            Self::Malformed(_) => false,
        }
    }
}

/// Exchange client credentials for an access token
pub async fn request_client_credentials_token(
    client: &Client,
    token_url: &str,
    credentials: &ClientCredentials,
) -> Result<TokenResponse, OAuthError> {
    // Empty scope is still sent; the token service then applies the client's default
    let params = [
        ("grant_type", "client_credentials"),
        ("client_id", credentials.client_id.as_str()),
        ("client_secret", credentials.client_secret.as_str()),
        ("scope", credentials.scope.as_str()),
    ];

    crate::modules::logger::log_info("Requesting client-credentials token...");

    let response = client
        .post(token_url)
        .form(&params)
        .send()
        .await
        .map_err(|e| OAuthError::Transport(e.without_url().to_string()))?;

    let status = response.status();
    if !status.is_success() {
        // The body may echo the client id; keep it out of logs
        crate::modules::logger::log_warn(&format!("Token endpoint returned {}", status));
        return Err(OAuthError::Rejected {
            status: status.as_u16(),
        });
    }

    let token = response
        .json::<TokenResponse>()
        .await
        .map_err(|e| OAuthError::Malformed(e.without_url().to_string()))?;

    if token.access_token.is_empty() {
        return Err(OAuthError::Malformed("empty access_token".to_string()));
    }

    crate::modules::logger::log_info(&format!(
        "Token issued: {}..., expires in {} seconds",
        token.access_token.chars().take(8).collect::<String>(),
        token.expires_in
    ));

    Ok(token)
}
