// Downstream client implementation
// One physical HTTP attempt per `send`; retries live in the policy above it

use chrono::{DateTime, Utc};
use reqwest::{header, Client, Response};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::error::{AppError, AppResult};
use crate::gateway::channel::Operation;
use crate::gateway::retry::UpstreamFailure;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct UpstreamClient {
    http_client: Client,
    base_url: Url,
}

impl UpstreamClient {
    pub fn new(http_client: Client, base_url: &str) -> AppResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("Invalid base URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "Base URL cannot carry a path: {}",
                base_url
            )));
        }
        Ok(Self {
            http_client,
            base_url,
        })
    }

    /// Build the resource URL; identifiers are percent-encoded as path segments
    pub fn build_url(&self, operation: &Operation) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            segments.extend(operation.path_segments());
        }

        let query = operation.query();
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        url
    }

    /// Perform one GET against the downstream API.
    ///
    /// 2xx bodies are parsed as JSON (empty body -> Null); anything else
    /// becomes an `UpstreamFailure` for the retry policy to classify.
    pub async fn send(
        &self,
        operation: &Operation,
        access_token: &str,
        request_id: &str,
    ) -> Result<Value, UpstreamFailure> {
        let url = self.build_url(operation);

        // Build Headers
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static(operation.channel().accept()),
        );
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", access_token))
                .map_err(|_| UpstreamFailure::Decode("access token is not a valid header".into()))?,
        );
        headers.insert(
            REQUEST_ID_HEADER,
            header::HeaderValue::from_str(request_id)
                .map_err(|_| UpstreamFailure::Decode("request id is not a valid header".into()))?,
        );

        tracing::debug!(
            "[{}] GET {} ({})",
            request_id,
            url.path(),
            operation.channel().as_str()
        );

        let response = self
            .http_client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(transport_failure)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response, Utc::now());
            tracing::debug!("[{}] Downstream answered {}", request_id, status);
            return Err(UpstreamFailure::Status {
                status: status.as_u16(),
                retry_after,
            });
        }

        let body = response.bytes().await.map_err(transport_failure)?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body).map_err(|e| UpstreamFailure::Decode(e.to_string()))
    }
}

fn transport_failure(e: reqwest::Error) -> UpstreamFailure {
    if e.is_timeout() {
        UpstreamFailure::Timeout
    } else {
        // URL may carry identifiers in the query string
        UpstreamFailure::Connect(e.without_url().to_string())
    }
}

/// Read `Retry-After` as delta-seconds or an HTTP date
fn parse_retry_after(response: &Response, now: DateTime<Utc>) -> Option<Duration> {
    let raw = response.headers().get(header::RETRY_AFTER)?.to_str().ok()?;
    parse_retry_after_value(raw, now)
}

pub(crate) fn parse_retry_after_value(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
