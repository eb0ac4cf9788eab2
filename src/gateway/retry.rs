// Failure classification and bounded retries
//
// Permanent  -> surfaced at once
// AuthExpired -> one forced token refresh, one more attempt
// RateLimited -> surfaced with a retry-after hint
// Transient  -> exponential backoff with jitter, up to max_attempts

use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

use super::config::RetryConfig;
use super::error::GatewayError;

/// Outcome kind of a failed downstream attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    RateLimited,
    AuthExpired,
}

/// What went wrong on one physical downstream attempt
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamFailure {
    /// Non-2xx response
    Status {
        status: u16,
        retry_after: Option<Duration>,
    },
    /// Request timed out in transit
    Timeout,
    /// Connection could not be established or was reset
    Connect(String),
    /// 2xx response whose body could not be read
    Decode(String),
}

impl UpstreamFailure {
    /// Short description safe for logs and error messages
    pub fn describe(&self) -> String {
        match self {
            Self::Status { status, .. } => format!("HTTP {}", status),
            Self::Timeout => "request timed out".to_string(),
            Self::Connect(reason) => format!("connection failed: {}", reason),
            Self::Decode(reason) => format!("unreadable response: {}", reason),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Classify a failed attempt. Pure: the attempt number plays no part.
pub fn classify(failure: &UpstreamFailure) -> ErrorKind {
    match failure {
        UpstreamFailure::Status { status, .. } => match *status {
            401 => ErrorKind::AuthExpired,
            429 => ErrorKind::RateLimited,
            400..=499 => ErrorKind::Permanent,
            // 5xx and anything unexpected outside the 4xx range
            _ => ErrorKind::Transient,
        },
        UpstreamFailure::Timeout | UpstreamFailure::Connect(_) => ErrorKind::Transient,
        UpstreamFailure::Decode(_) => ErrorKind::Permanent,
    }
}

/// Failure reported by an attempt closure
#[derive(Debug, Clone)]
pub enum AttemptError {
    /// Downstream answered badly; subject to classification
    Upstream(UpstreamFailure),
    /// Gateway-side failure (e.g. token refresh); ends the loop unchanged
    Gateway(GatewayError),
}

impl From<UpstreamFailure> for AttemptError {
    fn from(failure: UpstreamFailure) -> Self {
        Self::Upstream(failure)
    }
}

impl From<GatewayError> for AttemptError {
    fn from(err: GatewayError) -> Self {
        Self::Gateway(err)
    }
}

/// Passed to every attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptContext {
    /// 1-based attempt number
    pub attempt: u32,
    /// Previous attempt was rejected with 401; fetch a new token first
    pub force_refresh: bool,
}

/// Emitted each time the policy decides to try again
#[derive(Debug, Clone, Serialize)]
pub struct RetryEvent {
    pub attempt: u32,
    pub kind: ErrorKind,
    pub reason: String,
    #[serde(rename = "delay_ms", serialize_with = "serialize_millis")]
    pub delay: Duration,
}

fn serialize_millis<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_u64(d.as_millis() as u64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    max_backoff: Duration,
    jitter_ratio: f64,
    default_retry_after: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            max_backoff: Duration::from_millis(config.backoff_max_ms.max(config.backoff_base_ms)),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 0.99),
            default_retry_after: Duration::from_secs(config.default_retry_after_secs),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the `retry`-th retry (1-based), without jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Base delay plus uniform jitter in [0, jitter_ratio * base_delay)
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let delay = self.base_delay(retry);
        let jitter_cap = delay.mul_f64(self.jitter_ratio);
        if jitter_cap.is_zero() {
            return delay;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..jitter_cap.as_millis().max(1) as u64);
        delay + Duration::from_millis(jitter_ms)
    }

    /// Map a non-retried failure onto the caller-facing taxonomy
    pub fn to_error(&self, failure: &UpstreamFailure, attempts: u32) -> GatewayError {
        match (classify(failure), failure) {
            (ErrorKind::Permanent, UpstreamFailure::Status { status: 404, .. }) => {
                GatewayError::NotFound
            }
            (ErrorKind::Permanent, UpstreamFailure::Status { status, .. }) => {
                GatewayError::Validation { status: *status }
            }
            (ErrorKind::Permanent, other) => GatewayError::Unknown(other.describe()),
            (ErrorKind::RateLimited, _) => GatewayError::RateLimitExceeded {
                retry_after: failure.retry_after().unwrap_or(self.default_retry_after),
            },
            (ErrorKind::AuthExpired, _) => {
                GatewayError::authentication("downstream rejected a freshly issued token")
            }
            (ErrorKind::Transient, _) => GatewayError::TransientNetwork {
                attempts,
                message: failure.describe(),
            },
        }
    }

    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<Retried<T>, GatewayError>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        self.execute_observed(op, |_| {}).await
    }

    /// Run `op` under the policy, reporting every retry decision to `on_retry`
    pub async fn execute_observed<T, F, Fut, O>(
        &self,
        mut op: F,
        mut on_retry: O,
    ) -> Result<Retried<T>, GatewayError>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
        O: FnMut(&RetryEvent),
    {
        let mut attempt = 0u32;
        let mut transient_failures = 0u32;
        let mut reauthenticated = false;
        let mut force_refresh = false;

        loop {
            attempt += 1;
            let failure = match op(AttemptContext {
                attempt,
                force_refresh,
            })
            .await
            {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                    })
                }
                Err(AttemptError::Gateway(err)) => return Err(err),
                Err(AttemptError::Upstream(failure)) => failure,
            };
            force_refresh = false;

            let kind = classify(&failure);
            let delay = match kind {
                ErrorKind::Permanent | ErrorKind::RateLimited => {
                    return Err(self.to_error(&failure, attempt));
                }
                ErrorKind::AuthExpired if reauthenticated => {
                    return Err(self.to_error(&failure, attempt));
                }
                ErrorKind::AuthExpired => {
                    reauthenticated = true;
                    force_refresh = true;
                    Duration::ZERO
                }
                ErrorKind::Transient => {
                    transient_failures += 1;
                    if transient_failures >= self.max_attempts {
                        tracing::warn!(
                            "Giving up after {} attempt(s): {}",
                            attempt,
                            failure.describe()
                        );
                        return Err(self.to_error(&failure, attempt));
                    }
                    self.backoff_delay(transient_failures)
                }
            };

            let event = RetryEvent {
                attempt,
                kind,
                reason: failure.describe(),
                delay,
            };
            tracing::warn!(
                "Attempt {} failed ({:?}: {}), retrying in {}ms",
                attempt,
                kind,
                event.reason,
                delay.as_millis()
            );
            on_retry(&event);

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32, base_ms: u64) -> RetryPolicy {
        RetryPolicy::from_config(&RetryConfig {
            max_attempts,
            backoff_base_ms: base_ms,
            backoff_max_ms: 10_000,
            jitter_ratio: 0.5,
            default_retry_after_secs: 30,
        })
    }

    fn status(code: u16) -> UpstreamFailure {
        UpstreamFailure::Status {
            status: code,
            retry_after: None,
        }
    }

    #[test]
    fn test_classify_status_codes() {
        assert_eq!(classify(&status(400)), ErrorKind::Permanent);
        assert_eq!(classify(&status(404)), ErrorKind::Permanent);
        assert_eq!(classify(&status(401)), ErrorKind::AuthExpired);
        assert_eq!(classify(&status(429)), ErrorKind::RateLimited);
        assert_eq!(classify(&status(500)), ErrorKind::Transient);
        assert_eq!(classify(&status(503)), ErrorKind::Transient);
        assert_eq!(classify(&UpstreamFailure::Timeout), ErrorKind::Transient);
        assert_eq!(
            classify(&UpstreamFailure::Connect("refused".to_string())),
            ErrorKind::Transient
        );
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 10,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            jitter_ratio: 0.5,
            default_retry_after_secs: 30,
        });
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(6), Duration::from_millis(1_000));

        for retry in 1..=3 {
            let delay = policy.backoff_delay(retry);
            let base = policy.base_delay(retry);
            assert!(delay >= base && delay < base + base / 2 + Duration::from_millis(1));
        }
    }

    #[tokio::test]
    async fn test_transient_then_success_retries_twice_with_growing_delay() {
        let policy = policy(3, 10);
        let calls = Arc::new(AtomicU32::new(0));
        let mut events = Vec::new();

        let counter = calls.clone();
        let result = policy
            .execute_observed(
                move |_ctx| {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(AttemptError::Upstream(status(503)))
                        } else {
                            Ok(200u16)
                        }
                    }
                },
                |event| events.push(event.clone()),
            )
            .await
            .unwrap();

        assert_eq!(result.value, 200);
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(events.len(), 2);
        assert!(events[1].delay > events[0].delay);
        assert!(events.iter().all(|e| e.kind == ErrorKind::Transient));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let policy = policy(5, 1);
        let calls = Arc::new(AtomicU32::new(0));

        for (code, expected) in [
            (404u16, GatewayError::NotFound),
            (400u16, GatewayError::Validation { status: 400 }),
        ] {
            calls.store(0, Ordering::SeqCst);
            let counter = calls.clone();
            let err = policy
                .execute(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move { Err::<(), _>(AttemptError::Upstream(status(code))) }
                })
                .await
                .unwrap_err();
            assert_eq!(err, expected);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_transient_exhaustion_surfaces_attempt_count() {
        let policy = policy(3, 1);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = policy
            .execute(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(AttemptError::Upstream(UpstreamFailure::Timeout)) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            GatewayError::TransientNetwork { attempts, message } => {
                assert_eq!(attempts, 3);
                assert_eq!(message, "request timed out");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_expired_forces_refresh_then_retries_once() {
        let policy = policy(3, 1);
        let mut contexts = Vec::new();

        let err = policy
            .execute(|ctx| {
                contexts.push(ctx);
                async move { Err::<(), _>(AttemptError::Upstream(status(401))) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Authentication { .. }));
        assert_eq!(contexts.len(), 2);
        assert!(!contexts[0].force_refresh);
        assert!(contexts[1].force_refresh);
    }

    #[tokio::test]
    async fn test_rate_limited_uses_header_hint_without_retry() {
        let policy = policy(3, 1);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = policy
            .execute(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    Err::<(), _>(AttemptError::Upstream(UpstreamFailure::Status {
                        status: 429,
                        retry_after: Some(Duration::from_secs(7)),
                    }))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

        let err = policy
            .execute(|_| async { Err::<(), _>(AttemptError::Upstream(status(429))) })
            .await
            .unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_gateway_error_ends_loop_unchanged() {
        let policy = policy(3, 1);
        let err = policy
            .execute(|_| async {
                Err::<(), _>(AttemptError::Gateway(GatewayError::authentication("no token")))
            })
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::authentication("no token"));
    }
}
