//! Wire calls against one protocol revision
//!
//! A [`WireClient`] binds a pooled transport, the retry policy, credentials and
//! the revision's error normalizer. Every call runs the full retry loop and
//! either returns the decoded JSON body or a normalized error.

use crate::auth::AuthProvider;
use crate::error::{ClientError, ClientResult};
use crate::middleware::{Exchange, Middleware, REQUEST_ID_HEADER};
use crate::normalizer::ErrorNormalizer;
use crate::pool::Transport;
use crate::retry::{self, CircuitBreaker, RetryPolicy};
use crate::version::ProtocolVersion;
use bytes::Bytes;
use reqwest::{Method, RequestBuilder};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Settings shared by every revision a factory binds
#[derive(Debug, Clone)]
pub struct WireSettings {
    pub base_url: String,
    /// Budget for one attempt, from send to the last body byte
    pub timeout: Duration,
    pub retry: Arc<dyn RetryPolicy>,
    pub auth: Arc<dyn AuthProvider>,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub breaker: Option<Arc<CircuitBreaker>>,
}

/// Status and body of one attempt
#[derive(Debug)]
pub(crate) struct Reply {
    pub status: u16,
    pub body: Bytes,
}

impl WireSettings {
    /// Send one attempt through auth, middleware and the circuit breaker.
    ///
    /// Non-2xx statuses are returned as replies; only transport failures,
    /// timeouts and breaker rejections are errors here.
    pub(crate) async fn dispatch(
        &self,
        transport: &Transport,
        request: RequestBuilder,
        operation: &str,
        attempt: u32,
    ) -> ClientResult<Reply> {
        if let Some(breaker) = &self.breaker {
            breaker.can_proceed(operation)?;
        }
        let _permit = transport.acquire().await?;

        let mut request = self
            .auth
            .apply(request)
            .build()
            .map_err(|e| ClientError::invalid_argument("request", e.to_string()))?;
        for middleware in &self.middleware {
            middleware.on_request(&mut request);
        }
        let method = request.method().clone();
        let path = request.url().path().to_string();
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let started = Instant::now();
        let exchange = async {
            let response = transport.http().execute(request).await?;
            let status = response.status().as_u16();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>(Reply { status, body })
        };
        let result = match timeout(self.timeout, exchange).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(ClientError::transport(operation, e)),
            Err(_) => Err(ClientError::transport(
                operation,
                format!("request timed out after {:?}", self.timeout),
            )),
        };
        let elapsed = started.elapsed();

        if let Some(breaker) = &self.breaker {
            match &result {
                Ok(reply) if reply.status < 500 => breaker.record_success(),
                _ => breaker.record_failure(operation),
            }
        }

        let exchange = Exchange {
            operation,
            method: &method,
            path: &path,
            request_id: request_id.as_deref(),
            attempt,
            status: result.as_ref().ok().map(|reply| reply.status),
            elapsed,
            error: result.as_ref().err(),
        };
        for middleware in &self.middleware {
            middleware.on_response(&exchange);
        }
        result
    }
}

#[derive(Debug, Clone)]
pub struct WireClient {
    settings: Arc<WireSettings>,
    version: ProtocolVersion,
    transport: Transport,
    normalizer: ErrorNormalizer,
}

impl WireClient {
    pub fn new(
        settings: Arc<WireSettings>,
        version: ProtocolVersion,
        transport: Transport,
    ) -> Self {
        Self {
            settings,
            version,
            transport,
            normalizer: ErrorNormalizer::new(version),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn retry_policy(&self) -> &dyn RetryPolicy {
        self.settings.retry.as_ref()
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    pub async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        operation: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<Value> {
        self.send(Method::GET, path, query, None, operation, cancel).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: &Value,
        operation: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<Value> {
        self.send(Method::POST, path, &[], Some(body), operation, cancel).await
    }

    pub async fn delete(
        &self,
        path: &str,
        operation: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<Value> {
        self.send(Method::DELETE, path, &[], None, operation, cancel).await
    }

    /// Breaker shared by every client of the owning factory, if one is configured
    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.settings.breaker.as_deref()
    }

    /// Send with retries; the body is serialized once and reused across attempts
    #[instrument(skip(self, query, body, cancel), fields(version = %self.version))]
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        operation: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<Value> {
        let url = self.url(path);
        let body = body.map(serde_json::to_vec).transpose()?.map(Bytes::from);

        retry::execute(self.settings.retry.as_ref(), cancel, operation, |attempt| {
            self.attempt(method.clone(), &url, query, body.clone(), operation, attempt)
        })
        .await
    }

    async fn attempt(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        body: Option<Bytes>,
        operation: &str,
        attempt: u32,
    ) -> ClientResult<Value> {
        let mut request = self.transport.http().request(method, url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.header("Content-Type", "application/json").body(body);
        }

        let reply = self
            .settings
            .dispatch(&self.transport, request, operation, attempt)
            .await?;
        debug!(
            operation,
            attempt,
            status = reply.status,
            len = reply.body.len(),
            "response received"
        );

        if let Some(error) = self.normalizer.normalize(reply.status, &reply.body, operation) {
            return Err(error.into());
        }

        decode_body(&reply.body, operation)
    }
}

fn decode_body(bytes: &[u8], operation: &str) -> ClientResult<Value> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes).map_err(|e| ClientError::InvalidResponse {
        operation: operation.to_string(),
        error: e.to_string(),
    })
}
