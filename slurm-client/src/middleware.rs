//! Request decorators and observers
//!
//! Middleware runs after authentication, in registration order. Headers are
//! inserted, not appended: a later middleware setting a header replaces what an
//! earlier one set, so a caller's `User-Agent` overrides the default one.
//! Every finished attempt is reported back through [`Middleware::on_response`].

use crate::error::{ClientError, ClientResult};
use crate::metrics::MetricsCollector;
use reqwest::header::{HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Method, Request};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_USER_AGENT: &str = concat!("slurm-client-rs/", env!("CARGO_PKG_VERSION"));

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// One finished wire attempt
#[derive(Debug)]
pub struct Exchange<'a> {
    pub operation: &'a str,
    pub method: &'a Method,
    pub path: &'a str,
    pub request_id: Option<&'a str>,
    /// 1-based attempt number within the retry loop
    pub attempt: u32,
    /// `None` when no complete response arrived
    pub status: Option<u16>,
    pub elapsed: Duration,
    pub error: Option<&'a ClientError>,
}

pub trait Middleware: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn on_request(&self, _request: &mut Request) {}

    fn on_response(&self, _exchange: &Exchange<'_>) {}
}

/// Adds fixed headers to every request
#[derive(Debug, Clone, Default)]
pub struct HeaderMiddleware {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl HeaderMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: &str, value: &str) -> ClientResult<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ClientError::invalid_argument("header name", e.to_string()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ClientError::invalid_argument("header value", e.to_string()))?;
        self.headers.push((name, value));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl Middleware for HeaderMiddleware {
    fn name(&self) -> &str {
        "headers"
    }

    fn on_request(&self, request: &mut Request) {
        let headers = request.headers_mut();
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserAgentMiddleware {
    user_agent: HeaderValue,
}

impl UserAgentMiddleware {
    pub fn new(user_agent: &str) -> ClientResult<Self> {
        let user_agent = HeaderValue::from_str(user_agent)
            .map_err(|e| ClientError::invalid_argument("user_agent", e.to_string()))?;
        Ok(Self { user_agent })
    }
}

impl Default for UserAgentMiddleware {
    fn default() -> Self {
        Self {
            user_agent: HeaderValue::from_static(DEFAULT_USER_AGENT),
        }
    }
}

impl Middleware for UserAgentMiddleware {
    fn name(&self) -> &str {
        "user_agent"
    }

    fn on_request(&self, request: &mut Request) {
        request.headers_mut().insert(USER_AGENT, self.user_agent.clone());
    }
}

/// Tags every attempt with a fresh `X-Request-ID`
#[derive(Clone)]
pub struct RequestIdMiddleware {
    generator: Arc<dyn Fn() -> String + Send + Sync>,
}

impl RequestIdMiddleware {
    /// Random v4 UUIDs
    pub fn new() -> Self {
        Self::with_generator(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn with_generator(generator: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self {
            generator: Arc::new(generator),
        }
    }
}

impl Default for RequestIdMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RequestIdMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestIdMiddleware").finish_non_exhaustive()
    }
}

impl Middleware for RequestIdMiddleware {
    fn name(&self) -> &str {
        "request_id"
    }

    fn on_request(&self, request: &mut Request) {
        let id = (self.generator)();
        match HeaderValue::from_str(&id) {
            Ok(value) => {
                request.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            Err(_) => warn!(request_id = %id, "generated request id is not a valid header value"),
        }
    }
}

/// Per-attempt deadline, applied only when the request carries none yet
#[derive(Debug, Clone, Copy)]
pub struct TimeoutMiddleware {
    timeout: Duration,
}

impl TimeoutMiddleware {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &str {
        "timeout"
    }

    fn on_request(&self, request: &mut Request) {
        if request.timeout().is_none() && !self.timeout.is_zero() {
            *request.timeout_mut() = Some(self.timeout);
        }
    }
}

/// Structured log line per request and per finished attempt
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    fn on_request(&self, request: &mut Request) {
        debug!(
            method = %request.method(),
            path = request.url().path(),
            host = request.url().host_str().unwrap_or(""),
            "sending request"
        );
    }

    fn on_response(&self, exchange: &Exchange<'_>) {
        let elapsed_ms = exchange.elapsed.as_millis() as u64;
        match (exchange.status, exchange.error) {
            (Some(status), _) => info!(
                operation = exchange.operation,
                method = %exchange.method,
                path = exchange.path,
                request_id = exchange.request_id,
                attempt = exchange.attempt,
                status,
                elapsed_ms,
                "request completed"
            ),
            (None, error) => warn!(
                operation = exchange.operation,
                method = %exchange.method,
                path = exchange.path,
                request_id = exchange.request_id,
                attempt = exchange.attempt,
                elapsed_ms,
                error = %error.map(ToString::to_string).unwrap_or_default(),
                "request failed"
            ),
        }
    }
}

/// Feeds a shared [`MetricsCollector`]
#[derive(Debug, Clone)]
pub struct MetricsMiddleware {
    collector: Arc<MetricsCollector>,
}

impl MetricsMiddleware {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self { collector }
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }
}

impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    fn on_response(&self, exchange: &Exchange<'_>) {
        let method = exchange.method.as_str();
        self.collector.record_request(method, exchange.path);
        match (exchange.status, exchange.error) {
            (Some(status), _) => {
                self.collector
                    .record_response(method, exchange.path, status, exchange.elapsed)
            }
            (None, Some(error)) => self.collector.record_error(error),
            (None, None) => {}
        }
    }
}
