#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use indicator_ingest::cancel::CancellationToken;
use indicator_ingest::record::RawRecord;
use indicator_ingest::registry::SessionEnv;
use indicator_ingest::transport::{
    Clock, FailureKind, HttpBackend, HttpResponse, RetryPolicy, RetrySettings, RetryingTransport,
    SendFailure,
};

pub type Reply = Result<HttpResponse, SendFailure>;
type Handler = Box<dyn Fn(&str, &[(String, String)]) -> Reply + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub url: String,
    pub query: Vec<(String, String)>,
}

impl Call {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn params(&self, name: &str) -> Vec<&str> {
        self.query
            .iter()
            .filter(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
            .collect()
    }
}

/// Either replays a fixed queue of replies or routes each call through a closure.
pub struct MockBackend {
    queue: Mutex<VecDeque<Reply>>,
    handler: Option<Handler>,
    calls: Mutex<Vec<Call>>,
}

impl MockBackend {
    pub fn queue(replies: Vec<Reply>) -> Self {
        Self {
            queue: Mutex::new(replies.into()),
            handler: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn routed(
        handler: impl Fn(&str, &[(String, String)]) -> Reply + Send + Sync + 'static,
    ) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            handler: Some(Box::new(handler)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn always(status: u16) -> Self {
        Self::routed(move |_, _| Ok(response(status, Vec::new())))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl HttpBackend for MockBackend {
    fn get(&self, url: &str, query: &[(String, String)], _timeout: Duration) -> Reply {
        self.calls.lock().unwrap().push(Call {
            url: url.to_string(),
            query: query.to_vec(),
        });
        if let Some(handler) = &self.handler {
            return handler(url, query);
        }
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SendFailure::new(FailureKind::Fatal, "no scripted reply")))
    }
}

/// Records sleeps and advances virtual time instead of blocking.
pub struct FakeClock {
    start: Instant,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }

    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock().unwrap() += duration;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.start + *self.elapsed.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        self.advance(duration);
    }
}

pub fn response(status: u16, body: impl Into<Vec<u8>>) -> HttpResponse {
    HttpResponse {
        status,
        body: body.into(),
    }
}

pub fn json_reply(body: Value) -> Reply {
    Ok(response(200, body.to_string()))
}

pub fn text_reply(body: &str) -> Reply {
    Ok(response(200, body))
}

/// Fast policy: no pacing, small backoff.
pub fn quick_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(&RetrySettings {
        max_retries,
        initial_backoff: 1.0,
        max_backoff: 4.0,
        backoff_multiplier: 2.0,
        delay_between_requests: 0.0,
        ..RetrySettings::default()
    })
    .unwrap()
}

pub fn transport(
    backend: Arc<MockBackend>,
    clock: Arc<FakeClock>,
    policy: RetryPolicy,
) -> RetryingTransport {
    RetryingTransport::new(backend, clock, policy, CancellationToken::new())
}

pub fn session(backend: Arc<MockBackend>, clock: Arc<FakeClock>) -> SessionEnv {
    let mut env = SessionEnv::new(backend, clock, CancellationToken::new());
    env.default_policy = quick_policy(2);
    env
}

pub fn record(value: Value) -> RawRecord {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

/// An envelope page of the dimensioned API.
pub fn envelope(data: Vec<Value>, total_pages: u32) -> Value {
    serde_json::json!({
        "totalElements": data.len(),
        "totalPages": total_pages,
        "data": data,
    })
}
