// Gateway pipeline: admission -> token -> cache or fetch (retried) -> audit

use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::audit::{open_audit_sink, AuditContext, AuditRecorder, AuditSink};
use super::cache::{ResponseCache, TtlPolicy};
use super::channel::{GatewayRequest, Operation};
use super::config::GatewayConfig;
use super::error::GatewayError;
use super::rate_limiter::{open_window_store, Admission, RateLimiter, WindowStore};
use super::retry::{AttemptError, RetryEvent, RetryPolicy};
use super::token_manager::TokenManager;
use super::upstream::client::UpstreamClient;
use crate::error::AppResult;
use crate::models::AuditOutcome;
use crate::utils::http::create_client_with_proxy;

/// Successful result of `GatewayClient::call`
#[derive(Debug, Clone, Serialize)]
pub struct GatewayResponse {
    /// Downstream payload, passed through untouched
    pub data: Value,
    pub request_id: String,
    pub cache_hit: bool,
    /// Physical downstream attempts made for this call
    pub attempts: u32,
}

/// Attempts and retry decisions of one call, filled in by whoever runs the fetch
#[derive(Default)]
struct CallTrace {
    attempts: AtomicU32,
    retries: Mutex<Vec<RetryEvent>>,
}

impl CallTrace {
    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn retries(&self) -> Vec<RetryEvent> {
        self.retries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct Served {
    data: Value,
    cache_hit: bool,
    coalesced: bool,
}

/// Retried downstream fetch; owned by an Arc so cached fetches can outlive the caller
struct Fetcher {
    upstream: UpstreamClient,
    tokens: Arc<TokenManager>,
    retry: RetryPolicy,
}

impl Fetcher {
    async fn fetch(
        self: Arc<Self>,
        operation: Operation,
        request_id: String,
        trace: Arc<CallTrace>,
    ) -> Result<Value, GatewayError> {
        // Value of the token sent on the latest attempt, for force_refresh
        let last_token = Mutex::new(String::new());

        let result = self
            .retry
            .execute_observed(
                |ctx| {
                    let this = &*self;
                    let (operation, request_id, trace, last_token) =
                        (&operation, &request_id, &trace, &last_token);
                    async move {
                        trace.attempts.fetch_add(1, Ordering::SeqCst);
                        let token = if ctx.force_refresh {
                            let rejected = last_token
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .clone();
                            this.tokens.force_refresh(&rejected).await?
                        } else {
                            this.tokens.get_token().await?
                        };
                        *last_token.lock().unwrap_or_else(PoisonError::into_inner) =
                            token.value.clone();

                        this.upstream
                            .send(operation, &token.value, request_id)
                            .await
                            .map_err(AttemptError::from)
                    }
                },
                |event| {
                    trace
                        .retries
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(event.clone());
                },
            )
            .await?;

        Ok(result.value)
    }
}

/// Audit obligation of one `call`; written on `finish`, or on drop when the
/// caller abandons the call first
struct PendingRecord<'a> {
    client: &'a GatewayClient,
    request: &'a GatewayRequest,
    request_id: &'a str,
    trace: Arc<CallTrace>,
    started: Instant,
    armed: bool,
}

impl PendingRecord<'_> {
    /// Record the outcome; returns the attempts made
    fn finish(mut self, result: &Result<Served, GatewayError>) -> u32 {
        self.armed = false;
        self.write(result)
    }

    fn write(&self, result: &Result<Served, GatewayError>) -> u32 {
        let attempts = self.trace.attempts();
        self.client.record(
            self.request,
            self.request_id,
            result,
            attempts,
            &self.trace,
            self.started.elapsed(),
        );
        attempts
    }
}

impl Drop for PendingRecord<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            self.write(&Err(GatewayError::Unknown(
                "call cancelled by the caller before completion".to_string(),
            )));
        }
    }
}

/// Single entry point for calls to the external health-data services
pub struct GatewayClient {
    fetcher: Arc<Fetcher>,
    tokens: Arc<TokenManager>,
    limiter: RateLimiter,
    cache: ResponseCache,
    audit: AuditRecorder,
    default_timeout: Duration,
}

impl GatewayClient {
    /// Build every collaborator from config; relative store paths resolve
    /// under the data directory
    pub fn init(config: &GatewayConfig) -> AppResult<Self> {
        let data_dir = crate::modules::config::get_data_dir()?;
        Self::init_in(config, &data_dir)
    }

    pub fn init_in(config: &GatewayConfig, data_dir: &Path) -> AppResult<Self> {
        let window_store = open_window_store(&config.rate_limit.store, data_dir)?;
        let audit_sink = open_audit_sink(&config.audit, data_dir)?;
        Self::from_parts(config, window_store, audit_sink)
    }

    /// Build with injected stores (shared window store, test sinks)
    pub fn from_parts(
        config: &GatewayConfig,
        window_store: Arc<dyn WindowStore>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> AppResult<Self> {
        config.validate()?;

        let http_client =
            create_client_with_proxy(config.request_timeout_secs, Some(&config.upstream_proxy));
        let tokens = Arc::new(TokenManager::from_config(http_client.clone(), config));
        let upstream = UpstreamClient::new(http_client, &config.endpoints().base_url)?;

        let fetcher = Arc::new(Fetcher {
            upstream,
            tokens: tokens.clone(),
            retry: RetryPolicy::from_config(&config.retry),
        });

        tracing::info!(
            "Gateway client ready for {} ({})",
            config.environment.as_str(),
            config.endpoints().base_url
        );

        Ok(Self {
            fetcher,
            tokens,
            limiter: RateLimiter::new(
                window_store,
                config.rate_limit.clone(),
                config.bypass_rate_limit(),
            ),
            cache: ResponseCache::new(TtlPolicy::from_overrides(&config.cache_ttl_secs)),
            audit: AuditRecorder::new(audit_sink)?,
            default_timeout: config.request_timeout(),
        })
    }

    pub fn audit(&self) -> &AuditRecorder {
        &self.audit
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn token_manager(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Drop the token and cached responses
    pub async fn shutdown(&self) {
        self.tokens.invalidate().await;
        self.cache.clear();
        tracing::info!("Gateway client shut down");
    }

    /// Run one downstream call through the full pipeline.
    ///
    /// Exactly one audit record is written per invocation, whichever stage
    /// ends it, including deadline expiry and the caller dropping the future.
    pub async fn call(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let request_id = Uuid::new_v4().to_string();
        let deadline = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let pending = PendingRecord {
            client: self,
            request: &request,
            request_id: &request_id,
            trace: Arc::new(CallTrace::default()),
            started: Instant::now(),
            armed: true,
        };

        let result = match tokio::time::timeout(
            deadline,
            self.run_pipeline(&request, &request_id, &pending.trace),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "[{}] {} exceeded its {}ms deadline",
                    request_id,
                    request.operation.action(),
                    deadline.as_millis()
                );
                Err(GatewayError::Timeout { after: deadline })
            }
        };

        let attempts = pending.finish(&result);

        result.map(|served| GatewayResponse {
            data: served.data,
            request_id,
            cache_hit: served.cache_hit,
            attempts,
        })
    }

    async fn run_pipeline(
        &self,
        request: &GatewayRequest,
        request_id: &str,
        trace: &Arc<CallTrace>,
    ) -> Result<Served, GatewayError> {
        let operation = &request.operation;
        operation.validate()?;
        let channel = operation.channel();

        if let Admission::Rejected { retry_after, .. } = self.limiter.admit(channel.as_str())? {
            return Err(GatewayError::RateLimitExceeded { retry_after });
        }

        self.tokens.get_token().await?;

        if request.fresh {
            let data = self
                .fetcher
                .clone()
                .fetch(operation.clone(), request_id.to_string(), trace.clone())
                .await?;
            return Ok(Served {
                data,
                cache_hit: false,
                coalesced: false,
            });
        }

        let fetcher = self.fetcher.clone();
        let (owned_op, owned_id, trace) =
            (operation.clone(), request_id.to_string(), trace.clone());
        let lookup = self
            .cache
            .get_or_fetch(&request.cache_key(), operation.data_type(), move || {
                fetcher.fetch(owned_op, owned_id, trace)
            })
            .await?;
        Ok(Served {
            data: lookup.value,
            cache_hit: lookup.hit,
            coalesced: lookup.coalesced,
        })
    }

    fn record(
        &self,
        request: &GatewayRequest,
        request_id: &str,
        result: &Result<Served, GatewayError>,
        attempts: u32,
        trace: &CallTrace,
        elapsed: Duration,
    ) {
        let operation = &request.operation;
        let (outcome, cache_hit, coalesced) = match result {
            Ok(served) => (AuditOutcome::Success, served.cache_hit, served.coalesced),
            Err(e) => (e.outcome(), false, false),
        };

        let mut ctx = AuditContext::new(request_id, operation.channel().as_str())
            .subject(operation.subject_id())
            .outcome(outcome)
            .attempts(attempts)
            .cache_hit(cache_hit)
            .duration(elapsed)
            .tenant(request.tenant_id.clone())
            .actor(request.actor.clone());

        if coalesced {
            ctx = ctx.detail("coalesced", true);
        }
        let retries = trace.retries();
        if !retries.is_empty() {
            ctx = ctx.detail(
                "retries",
                serde_json::to_value(&retries).unwrap_or(Value::Null),
            );
        }
        if let Err(e) = result {
            ctx = ctx
                .detail("error_kind", e.kind())
                .detail("error", e.to_string());
        }

        match result {
            Ok(_) => tracing::info!(
                "[{}] {} completed (attempts: {}, cache_hit: {}, {}ms)",
                request_id,
                operation.action(),
                attempts,
                cache_hit,
                elapsed.as_millis()
            ),
            Err(e) => tracing::warn!(
                "[{}] {} failed: {} (attempts: {})",
                request_id,
                operation.action(),
                e.kind(),
                attempts
            ),
        }

        self.audit
            .log_action(operation.action(), operation.category(), ctx);
    }
}
