use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::cancel::CancellationToken;
use crate::error::IngestError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub timeout: f64,
    pub max_retries: u32,
    pub initial_backoff: f64,
    pub max_backoff: f64,
    pub backoff_multiplier: f64,
    pub delay_between_requests: f64,
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            timeout: 60.0,
            max_retries: 8,
            initial_backoff: 2.0,
            max_backoff: 120.0,
            backoff_multiplier: 2.0,
            delay_between_requests: 0.5,
            retryable_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    timeout: Duration,
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff_multiplier: f64,
    delay_between_requests: Duration,
    retryable_status_codes: BTreeSet<u16>,
}

impl RetryPolicy {
    pub fn new(settings: &RetrySettings) -> Result<Self, IngestError> {
        let timeout = seconds("timeout", settings.timeout)?;
        let initial_backoff = seconds("initial_backoff", settings.initial_backoff)?;
        let max_backoff = seconds("max_backoff", settings.max_backoff)?;
        let delay_between_requests =
            seconds("delay_between_requests", settings.delay_between_requests)?;
        if max_backoff < initial_backoff {
            return Err(IngestError::InvalidRetryPolicy(format!(
                "max_backoff ({}s) must be >= initial_backoff ({}s)",
                settings.max_backoff, settings.initial_backoff
            )));
        }
        if !settings.backoff_multiplier.is_finite() || settings.backoff_multiplier < 1.0 {
            return Err(IngestError::InvalidRetryPolicy(format!(
                "backoff_multiplier must be >= 1, got {}",
                settings.backoff_multiplier
            )));
        }
        Ok(Self {
            timeout,
            max_retries: settings.max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier: settings.backoff_multiplier,
            delay_between_requests,
            retryable_status_codes: settings.retryable_status_codes.iter().copied().collect(),
        })
    }

    /// `min(initial × multiplier^(attempt-1), max)` for a 1-indexed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff.as_secs_f64());
        if capped.is_finite() {
            Duration::from_secs_f64(capped)
        } else {
            self.max_backoff
        }
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay_between_requests(&self) -> Duration {
        self.delay_between_requests
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_retries: 8,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(120),
            backoff_multiplier: 2.0,
            delay_between_requests: Duration::from_millis(500),
            retryable_status_codes: [429, 500, 502, 503, 504].into_iter().collect(),
        }
    }
}

fn seconds(name: &str, value: f64) -> Result<Duration, IngestError> {
    if !value.is_finite() || value < 0.0 {
        return Err(IngestError::InvalidRetryPolicy(format!(
            "{name} must be a non-negative number of seconds, got {value}"
        )));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|err| IngestError::InvalidRetryPolicy(format!("{name}: {err}")))
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn json(&self, context: &str) -> Result<Value, IngestError> {
        serde_json::from_slice(&self.body).map_err(|err| IngestError::Decode {
            context: context.to_string(),
            message: err.to_string(),
        })
    }

    pub fn text(&self, context: &str) -> Result<String, IngestError> {
        String::from_utf8(self.body.clone()).map_err(|err| IngestError::Decode {
            context: context.to_string(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Connect,
    Request,
    Fatal,
}

#[derive(Debug, Clone)]
pub struct SendFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl SendFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, FailureKind::Fatal)
    }
}

impl fmt::Display for SendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            FailureKind::Timeout => "timeout",
            FailureKind::Connect => "connection error",
            FailureKind::Request => "request error",
            FailureKind::Fatal => "fatal request error",
        };
        write!(f, "{label}: {}", self.message)
    }
}

pub trait HttpBackend: Send + Sync {
    fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        timeout: Duration,
    ) -> Result<HttpResponse, SendFailure>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Clone)]
pub struct ReqwestBackend {
    client: Client,
}

impl ReqwestBackend {
    pub fn new() -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("indicator-ingest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| IngestError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| IngestError::Http(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpBackend for ReqwestBackend {
    fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        timeout: Duration,
    ) -> Result<HttpResponse, SendFailure> {
        let response = self
            .client
            .get(url)
            .query(query)
            .timeout(timeout)
            .send()
            .map_err(classify_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().map_err(classify_error)?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

fn classify_error(err: reqwest::Error) -> SendFailure {
    let kind = if err.is_timeout() {
        FailureKind::Timeout
    } else if err.is_connect() {
        FailureKind::Connect
    } else if err.is_builder() {
        FailureKind::Fatal
    } else {
        FailureKind::Request
    };
    SendFailure::new(kind, err.to_string())
}

pub struct RetryingTransport {
    backend: Arc<dyn HttpBackend>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    last_request: Mutex<Option<Instant>>,
}

impl RetryingTransport {
    pub fn new(
        backend: Arc<dyn HttpBackend>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            clock,
            policy,
            cancel,
            last_request: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn get(
        &self,
        url: &str,
        params: &[(String, String)],
        context: &str,
    ) -> Result<HttpResponse, IngestError> {
        let max_retries = self.policy.max_retries;
        let mut last_error = "no attempt was made".to_string();

        for attempt in 1..=max_retries {
            self.cancel.check(context)?;
            if attempt == 1 {
                self.pace();
            }

            debug!(url, attempt, context, "GET");
            match self.backend.get(url, params, self.policy.timeout) {
                Ok(response) => {
                    self.mark_request();
                    let status = response.status;
                    if self.policy.is_retryable_status(status) {
                        last_error = format!("status {status}");
                    } else if !(200..300).contains(&status) {
                        return Err(IngestError::ClientError {
                            status,
                            url: url.to_string(),
                            context: context.to_string(),
                        });
                    } else {
                        return Ok(response);
                    }
                }
                Err(failure) if failure.is_retryable() => {
                    last_error = failure.to_string();
                }
                Err(failure) => return Err(IngestError::Http(failure.to_string())),
            }

            if attempt < max_retries {
                let wait = self.policy.backoff(attempt);
                warn!(
                    context,
                    attempt,
                    max_retries,
                    wait_ms = wait.as_millis() as u64,
                    "{last_error}, retrying"
                );
                self.clock.sleep(wait);
            }
        }

        error!(url, context, max_retries, "retries exhausted: {last_error}");
        Err(IngestError::RetryExhausted {
            attempts: max_retries,
            context: context.to_string(),
            last_error,
        })
    }

    fn pace(&self) {
        let delay = self.policy.delay_between_requests;
        if delay.is_zero() {
            return;
        }
        let last = match self.last_request.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        if let Some(last) = last {
            let elapsed = self.clock.now().saturating_duration_since(last);
            if elapsed < delay {
                self.clock.sleep(delay - elapsed);
            }
        }
    }

    fn mark_request(&self) {
        let now = self.clock.now();
        match self.last_request.lock() {
            Ok(mut guard) => *guard = Some(now),
            Err(poisoned) => *poisoned.into_inner() = Some(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(initial: f64, max: f64, multiplier: f64) -> RetryPolicy {
        RetryPolicy::new(&RetrySettings {
            initial_backoff: initial,
            max_backoff: max,
            backoff_multiplier: multiplier,
            ..RetrySettings::default()
        })
        .unwrap()
    }

    #[test]
    fn backoff_grows_then_caps() {
        let policy = policy(2.0, 10.0, 2.0);
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(4), Duration::from_secs(10));
        assert_eq!(policy.backoff(60), Duration::from_secs(10));
    }

    #[test]
    fn backoff_matches_formula_for_every_attempt() {
        let policy = policy(0.5, 30.0, 1.5);
        for attempt in 1..=20u32 {
            let expected = (0.5 * 1.5f64.powi(attempt as i32 - 1)).min(30.0);
            let actual = policy.backoff(attempt).as_secs_f64();
            assert!((actual - expected).abs() < 1e-6, "attempt {attempt}");
        }
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let err = RetryPolicy::new(&RetrySettings {
            initial_backoff: 5.0,
            max_backoff: 1.0,
            ..RetrySettings::default()
        })
        .unwrap_err();
        assert!(matches!(err, IngestError::InvalidRetryPolicy(_)));
    }

    #[test]
    fn rejects_negative_durations() {
        let err = RetryPolicy::new(&RetrySettings {
            timeout: -1.0,
            ..RetrySettings::default()
        })
        .unwrap_err();
        assert!(matches!(err, IngestError::InvalidRetryPolicy(_)));
    }

    #[test]
    fn rejects_out_of_range_durations() {
        let err = RetryPolicy::new(&RetrySettings {
            timeout: 1e20,
            ..RetrySettings::default()
        })
        .unwrap_err();
        assert!(matches!(err, IngestError::InvalidRetryPolicy(message) if message.starts_with("timeout")));
    }

    #[test]
    fn default_policy_matches_default_settings() {
        let from_settings = RetryPolicy::new(&RetrySettings::default()).unwrap();
        assert_eq!(from_settings, RetryPolicy::default());
        assert!(from_settings.is_retryable_status(429));
        assert!(!from_settings.is_retryable_status(404));
    }
}
