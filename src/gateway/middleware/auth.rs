// API Key authentication middleware
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::gateway::server::AppState;

const OPEN_PATHS: &[&str] = &["/healthz"];

/// API Key authentication middleware
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    tracing::debug!("Request: {} {}", request.method(), request.uri().path());

    if OPEN_PATHS.contains(&request.uri().path()) {
        return Ok(next.run(request).await);
    }

    // Extract API key from header
    let api_key = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .or_else(|| {
            request
                .headers()
                .get("x-api-key")
                .and_then(|h| h.to_str().ok())
        });

    match api_key {
        Some(key) if keys_match(key, &state.api_key) => Ok(next.run(request).await),
        _ => {
            tracing::warn!("Rejected unauthenticated request to {}", request.uri().path());
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Length-independent comparison so response timing does not leak the key
fn keys_match(provided: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    let (a, b) = (provided.as_bytes(), expected.as_bytes());
    let mut diff = a.len() ^ b.len();
    for i in 0..b.len() {
        diff |= (a.get(i).copied().unwrap_or(0) ^ b[i]) as usize;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_match() {
        assert!(keys_match("sk-abc", "sk-abc"));
        assert!(!keys_match("sk-ab", "sk-abc"));
        assert!(!keys_match("sk-abcd", "sk-abc"));
        assert!(!keys_match("sk-abd", "sk-abc"));
        // Unset key never authenticates anyone
        assert!(!keys_match("", ""));
    }
}
