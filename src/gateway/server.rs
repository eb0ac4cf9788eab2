use axum::{
    extract::{DefaultBodyLimit, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use super::channel::GatewayRequest;
use super::client::GatewayClient;
use super::error::GatewayError;
use crate::models::{AuditCategory, AuditQuery};

const DEFAULT_AUDIT_LIMIT: usize = 100;
const MAX_AUDIT_LIMIT: usize = 1000;

/// Axum application state
#[derive(Clone)]
pub struct AppState {
    pub client: Arc<GatewayClient>,
    pub api_key: Arc<str>,
}

/// Internal HTTP front of a shared `GatewayClient`
pub struct GatewayServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    local_addr: SocketAddr,
}

impl GatewayServer {
    /// Start listening; port 0 picks a free port (see `local_addr`)
    pub async fn start(
        host: &str,
        port: u16,
        client: Arc<GatewayClient>,
        api_key: String,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), String> {
        if api_key.is_empty() {
            tracing::warn!("No API key configured, every protected route will answer 401");
        }
        let state = AppState {
            client,
            api_key: api_key.into(),
        };
        let app = router(state);

        // Bind address
        let addr = format!("{}:{}", host, port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind address {}: {}", addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("Failed to read bound address: {}", e))?;

        tracing::info!("Gateway server started at http://{}", local_addr);

        // Create shutdown channel
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        // Start server in new task
        let handle = tokio::spawn(async move {
            use hyper::server::conn::http1;
            use hyper_util::rt::TokioIo;
            use hyper_util::service::TowerToHyperService;

            loop {
                tokio::select! {
                    res = listener.accept() => {
                        match res {
                            Ok((stream, _)) => {
                                let io = TokioIo::new(stream);
                                let service = TowerToHyperService::new(app.clone());

                                tokio::task::spawn(async move {
                                    if let Err(err) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        debug!("Connection handling finished or errored: {:?}", err);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {:?}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::info!("Gateway server stopped listening");
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                shutdown_tx: Some(shutdown_tx),
                local_addr,
            },
            handle,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop server
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check_handler))
        .route("/v1/gateway/call", post(handle_call))
        .route("/v1/audit", get(handle_audit))
        .layer(
            // Outermost first; CORS sits above auth so preflights never reach the key check
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(super::middleware::cors_layer())
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    super::middleware::auth_middleware,
                ))
                .layer(DefaultBodyLimit::max(64 * 1024)),
        )
        .with_state(state)
}

/// Health check handler
async fn health_check_handler() -> Response {
    Json(serde_json::json!({
        "status": "ok"
    }))
    .into_response()
}

async fn handle_call(State(state): State<AppState>, Json(request): Json<GatewayRequest>) -> Response {
    match state.client.call(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}

fn error_response(err: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(err)).into_response();

    if let Some(retry_after) = err.retry_after() {
        // Whole seconds, rounded up so callers never come back early
        let secs = retry_after.as_millis().div_ceil(1000).max(1);
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

#[derive(Debug, Deserialize)]
struct AuditParams {
    category: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

async fn handle_audit(State(state): State<AppState>, Query(params): Query<AuditParams>) -> Response {
    let category = match params.category.as_deref().map(str::parse::<AuditCategory>) {
        None => None,
        Some(Ok(category)) => Some(category),
        Some(Err(e)) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    };
    let query = AuditQuery {
        category,
        from: params.from,
        to: params.to,
        limit: Some(
            params
                .limit
                .unwrap_or(DEFAULT_AUDIT_LIMIT)
                .min(MAX_AUDIT_LIMIT),
        ),
    };

    // Sinks do blocking file and SQLite I/O
    let client = state.client.clone();
    match tokio::task::spawn_blocking(move || client.audit().query(&query)).await {
        Ok(Ok(records)) => Json(records).into_response(),
        Ok(Err(e)) => {
            error!("Audit query failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "audit store unavailable"})),
            )
                .into_response()
        }
        Err(e) => {
            error!("Audit query task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
