// Throwaway axum servers standing in for the token endpoint and downstream APIs

use axum::{
    extract::{Form, State},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

struct TokenState {
    hits: AtomicUsize,
    failures: Vec<u16>,
    expires_in: i64,
    last_form: Mutex<Option<HashMap<String, String>>>,
}

pub(crate) struct TokenServer {
    pub url: String,
    state: Arc<TokenState>,
}

impl TokenServer {
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn last_form(&self) -> Option<HashMap<String, String>> {
        self.state.last_form.lock().unwrap().clone()
    }
}

/// Token endpoint answering the first `failures.len()` requests with those
/// statuses, then issuing `token-<n>` where n is the request number.
pub(crate) async fn spawn_token_server(expires_in: i64, failures: Vec<u16>) -> TokenServer {
    let state = Arc::new(TokenState {
        hits: AtomicUsize::new(0),
        failures,
        expires_in,
        last_form: Mutex::new(None),
    });

    async fn issue(
        State(state): State<Arc<TokenState>>,
        Form(form): Form<HashMap<String, String>>,
    ) -> Response {
        let n = state.hits.fetch_add(1, Ordering::SeqCst) + 1;
        *state.last_form.lock().unwrap() = Some(form);
        // Wide enough for concurrent callers to pile up
        tokio::time::sleep(Duration::from_millis(50)).await;

        if let Some(status) = state.failures.get(n - 1) {
            let status = StatusCode::from_u16(*status).unwrap();
            return (status, Json(json!({"error": "invalid_client"}))).into_response();
        }
        Json(json!({
            "access_token": format!("token-{}", n),
            "expires_in": state.expires_in.to_string(),
            "token_type": "Bearer"
        }))
        .into_response()
    }

    let app = Router::new()
        .route("/oauth2/token", post(issue))
        .with_state(state.clone());
    let base = serve(app).await;

    TokenServer {
        url: format!("{}/oauth2/token", base),
        state,
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Scripted {
    pub status: u16,
    pub body: Value,
    pub retry_after: Option<u64>,
    pub delay: Duration,
}

impl Scripted {
    pub fn ok(body: Value) -> Self {
        Self::status(200).with_body(body)
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: json!({"issue": [{"code": "processing", "diagnostics": "scripted"}]}),
            retry_after: None,
            delay: Duration::ZERO,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SeenRequest {
    pub path_and_query: String,
    pub headers: HeaderMap,
}

struct ApiState {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
    seen: Mutex<Vec<SeenRequest>>,
}

pub(crate) struct ApiServer {
    pub base_url: String,
    state: Arc<ApiState>,
}

impl ApiServer {
    pub fn hits(&self) -> usize {
        self.state.seen.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.state.seen.lock().unwrap().clone()
    }
}

/// Downstream API replying from `script` in order, then with `fallback`
pub(crate) async fn spawn_api_server(script: Vec<Scripted>, fallback: Scripted) -> ApiServer {
    let state = Arc::new(ApiState {
        script: Mutex::new(script.into()),
        fallback,
        seen: Mutex::new(Vec::new()),
    });

    async fn respond(State(state): State<Arc<ApiState>>, uri: Uri, headers: HeaderMap) -> Response {
        state.seen.lock().unwrap().push(SeenRequest {
            path_and_query: uri
                .path_and_query()
                .map(|pq| pq.to_string())
                .unwrap_or_default(),
            headers,
        });
        let reply = state
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| state.fallback.clone());

        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }

        let mut response = (
            StatusCode::from_u16(reply.status).unwrap(),
            Json(reply.body),
        )
            .into_response();
        if let Some(secs) = reply.retry_after {
            response
                .headers_mut()
                .insert("retry-after", secs.to_string().parse().unwrap());
        }
        response
    }

    let app = Router::new().fallback(respond).with_state(state.clone());
    let base_url = serve(app).await;
    ApiServer { base_url, state }
}
