//! Client factory
//!
//! [`ClientFactoryBuilder`] only accumulates options. The first call that needs
//! a live client resolves the protocol revision (explicit, auto-detected, or by
//! backend release), then binds a pooled transport and the revision's adapter
//! factory into a [`Client`].
//!
//! Auto-detection runs at most once successfully per factory. A failed discovery
//! call degrades to the configured stable revision; a discovery that names a
//! revision this crate cannot speak is a hard error and is not cached.

use crate::adapter::AdapterRegistry;
use crate::auth::{AuthProvider, NoAuth, TokenAuth};
use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::metrics::MetricsCollector;
use crate::middleware::{Middleware, MetricsMiddleware, UserAgentMiddleware};
use crate::pool::{PoolConfig, PoolProfile, TransportRegistry, TransportStats};
use crate::retry::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, ExponentialBackoff, RetryPolicy,
};
use crate::version::{extract_version_from_url, CompatibilityMatrix, ProtocolVersion};
use crate::wire::{WireClient, WireSettings};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const RELEASE_PREFIX: &str = "slurm-";

#[derive(Debug, Default)]
pub struct ClientFactoryBuilder {
    config: ClientConfig,
    auth: Option<Arc<dyn AuthProvider>>,
    retry: Option<Arc<dyn RetryPolicy>>,
    pool_config: Option<PoolConfig>,
    middleware: Vec<Arc<dyn Middleware>>,
    adapters: Option<AdapterRegistry>,
    breaker: Option<CircuitBreakerConfig>,
}

impl ClientFactoryBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::from_config(ClientConfig::new(base_url))
    }

    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Pin the revision; discovery is skipped entirely
    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.config.api_version = Some(version.into());
        self
    }

    pub fn stable_version(mut self, version: impl Into<String>) -> Self {
        self.config.stable_version = version.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.discovery_timeout = timeout;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = Some(user_agent.into());
        self
    }

    pub fn insecure_skip_verify(mut self, skip: bool) -> Self {
        self.config.insecure_skip_verify = skip;
        self
    }

    pub fn auth(mut self, auth: impl AuthProvider + 'static) -> Self {
        self.auth = Some(Arc::new(auth));
        self
    }

    /// Shorthand for [`TokenAuth`]
    pub fn token(self, token: impl Into<String>) -> Self {
        self.auth(TokenAuth::new(token))
    }

    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry = Some(Arc::new(policy));
        self
    }

    pub fn pool_profile(mut self, profile: PoolProfile) -> Self {
        self.config.pool_profile = profile;
        self
    }

    /// Explicit pool tuning; selects [`PoolProfile::Custom`]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.config.pool_profile = PoolProfile::Custom;
        self.pool_config = Some(config);
        self
    }

    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Record every wire attempt into `collector`
    pub fn metrics(self, collector: Arc<MetricsCollector>) -> Self {
        self.middleware(MetricsMiddleware::new(collector))
    }

    /// Fail fast once the backend keeps failing; off unless configured
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Some(config);
        self
    }

    /// Replace the built-in revision adapters
    pub fn adapter_registry(mut self, registry: AdapterRegistry) -> Self {
        self.adapters = Some(registry);
        self
    }

    /// Validate options and assemble the factory. Never touches the network.
    pub fn build(self) -> ClientResult<ClientFactory> {
        let config = self.config;
        config.validate()?;

        let matrix = CompatibilityMatrix::global();
        let stable = config.stable()?;
        matrix
            .require(&stable)
            .map_err(|e| ClientError::config("stable_version", e.to_string()))?;

        let mut transports =
            TransportRegistry::new().with_insecure_skip_verify(config.insecure_skip_verify);
        if let Some(pool) = self.pool_config {
            pool.validate()?;
            transports = transports.with_custom_config(pool);
        } else if config.pool_profile == PoolProfile::Custom {
            return Err(ClientError::config(
                "pool_profile",
                "custom pool profile requires an explicit pool config",
            ));
        }

        let retry = self.retry.unwrap_or_else(|| {
            Arc::new(
                ExponentialBackoff::new()
                    .with_max_retries(config.max_retries)
                    .with_min_wait(config.retry_wait_min)
                    .with_max_wait(config.retry_wait_max),
            )
        });

        let user_agent = match &config.user_agent {
            Some(user_agent) => UserAgentMiddleware::new(user_agent)
                .map_err(|e| ClientError::config("user_agent", e.to_string()))?,
            None => UserAgentMiddleware::default(),
        };
        let mut middleware: Vec<Arc<dyn Middleware>> = vec![Arc::new(user_agent)];
        middleware.extend(self.middleware);

        if let Some(breaker) = &self.breaker {
            if breaker.failure_threshold == 0 {
                return Err(ClientError::config(
                    "circuit_breaker.failure_threshold",
                    "must be greater than 0",
                ));
            }
        }

        let settings = WireSettings {
            base_url: config.base_url().to_string(),
            timeout: config.timeout,
            retry,
            auth: self.auth.unwrap_or_else(|| Arc::new(NoAuth)),
            middleware,
            breaker: self.breaker.map(|config| Arc::new(CircuitBreaker::new(config))),
        };

        debug!(
            base_url = %settings.base_url,
            profile = %config.pool_profile,
            retry = settings.retry.name(),
            auth = settings.auth.scheme(),
            middleware = settings.middleware.len(),
            circuit_breaker = settings.breaker.is_some(),
            "client factory configured"
        );

        Ok(ClientFactory {
            inner: Arc::new(FactoryInner {
                stable,
                matrix,
                settings: Arc::new(settings),
                transports: Arc::new(transports),
                adapters: self.adapters.unwrap_or_else(AdapterRegistry::builtin),
                detected: OnceCell::new(),
                config,
            }),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClientFactory {
    inner: Arc<FactoryInner>,
}

#[derive(Debug)]
struct FactoryInner {
    config: ClientConfig,
    stable: ProtocolVersion,
    matrix: &'static CompatibilityMatrix,
    settings: Arc<WireSettings>,
    transports: Arc<TransportRegistry>,
    adapters: AdapterRegistry,
    detected: OnceCell<ProtocolVersion>,
}

/// Outcome of one discovery call
enum Discovery {
    Detected(ProtocolVersion),
    Undetectable(String),
}

impl ClientFactory {
    pub fn builder(base_url: impl Into<String>) -> ClientFactoryBuilder {
        ClientFactoryBuilder::new(base_url)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Client for the configured revision, or the auto-detected one when none is configured
    pub async fn new_client(&self, cancel: &CancellationToken) -> ClientResult<Client> {
        if cancel.is_cancelled() {
            return Err(ClientError::cancelled("new_client"));
        }
        let version = match self.inner.config.explicit_version()? {
            Some(version) => self.inner.matrix.require(&version)?,
            None => self.resolve_version(cancel).await?,
        };
        self.bind(version)
    }

    /// Client for an explicit revision (`latest` and `stable` are accepted too)
    pub async fn new_client_with_version(
        &self,
        version: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<Client> {
        if cancel.is_cancelled() {
            return Err(ClientError::cancelled("new_client_with_version"));
        }
        let version = ProtocolVersion::resolve_constraint(version)?;
        let version = self.inner.matrix.require(&version)?;
        self.bind(version)
    }

    /// Client for the highest revision compatible with a backend release such as `25.05.2`
    pub async fn new_client_for_backend_release(
        &self,
        release: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<Client> {
        if cancel.is_cancelled() {
            return Err(ClientError::cancelled("new_client_for_backend_release"));
        }
        let version = self.inner.matrix.find_best_version(release)?;
        self.log_resolution(version, "backend release");
        self.bind(version)
    }

    /// Revision from the discovery cache, running discovery on first use
    pub async fn resolve_version(
        &self,
        cancel: &CancellationToken,
    ) -> ClientResult<ProtocolVersion> {
        if let Some(version) = self.inner.detected.get() {
            return Ok(*version);
        }
        self.inner
            .detected
            .get_or_try_init(|| self.detect(cancel))
            .await
            .copied()
    }

    async fn detect(&self, cancel: &CancellationToken) -> ClientResult<ProtocolVersion> {
        match self.discover(cancel).await? {
            Discovery::Detected(version) => {
                self.log_resolution(version, "discovery");
                Ok(version)
            }
            Discovery::Undetectable(reason) => {
                let stable = self.inner.stable;
                let message = "version discovery failed, falling back to stable";
                if self.inner.config.debug {
                    info!(%stable, reason = %reason, "{}", message);
                } else {
                    warn!(%stable, reason = %reason, "{}", message);
                }
                Ok(stable)
            }
        }
    }

    /// Cached auto-detected revision, if discovery has already run
    pub fn detected_version(&self) -> Option<ProtocolVersion> {
        self.inner.detected.get().copied()
    }

    /// Revisions this factory can bind: known to the matrix and backed by an adapter
    pub fn supported_versions(&self) -> Vec<ProtocolVersion> {
        self.inner
            .adapters
            .versions()
            .into_iter()
            .filter(|v| self.inner.matrix.contains(v))
            .collect()
    }

    pub fn compatibility(&self) -> &'static CompatibilityMatrix {
        self.inner.matrix
    }

    /// State of the shared circuit breaker, if one is configured
    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.inner.settings.breaker.as_ref().map(|breaker| breaker.state())
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.inner.transports.stats()
    }

    /// Tear down every pooled transport. Call once in-flight calls have drained.
    pub fn close(&self) {
        self.inner.transports.close();
    }

    fn bind(&self, version: ProtocolVersion) -> ClientResult<Client> {
        let factory = self.inner.adapters.factory(version)?;
        let transport = self.inner.transports.get_transport(
            version,
            self.inner.config.pool_profile,
            &self.inner.settings.base_url,
        )?;
        let wire = WireClient::new(self.inner.settings.clone(), version, transport);
        debug!(%version, transport = wire.transport().id(), "client bound");
        Ok(Client::new(wire, factory, self.inner.transports.clone()))
    }

    fn log_resolution(&self, version: ProtocolVersion, source: &str) {
        if self.inner.config.debug {
            info!(%version, source, "protocol version resolved");
        } else {
            debug!(%version, source, "protocol version resolved");
        }
    }

    #[instrument(skip(self, cancel))]
    async fn discover(&self, cancel: &CancellationToken) -> ClientResult<Discovery> {
        if cancel.is_cancelled() {
            return Err(ClientError::cancelled("discovery"));
        }
        let config = &self.inner.config;
        let url = format!("{}{}", self.inner.settings.base_url, config.discovery_path);

        let fetch = async {
            let transport = self.inner.transports.get_transport(
                self.inner.stable,
                config.pool_profile,
                &self.inner.settings.base_url,
            )?;
            let reply = self
                .inner
                .settings
                .dispatch(&transport, transport.http().get(&url), "discovery", 1)
                .await?;
            if !(200..300).contains(&reply.status) {
                return Err(ClientError::transport(
                    "discovery",
                    format!("HTTP {}", reply.status),
                ));
            }
            serde_json::from_slice::<Value>(&reply.body)
                .map_err(|e| ClientError::transport("discovery", e))
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::cancelled("discovery")),
            result = timeout(config.discovery_timeout, fetch) => result,
        };

        let document = match result {
            Err(_) => {
                return Ok(Discovery::Undetectable(format!(
                    "discovery timed out after {:?}",
                    config.discovery_timeout
                )))
            }
            Ok(Err(e)) => return Ok(Discovery::Undetectable(e.to_string())),
            Ok(Ok(document)) => document,
        };

        match version_from_document(&document, self.inner.matrix) {
            Some(resolved) => resolved.map(Discovery::Detected),
            None => Ok(Discovery::Undetectable(
                "no version token in discovery document".to_string(),
            )),
        }
    }
}

/// Version token of a discovery document.
///
/// `None` when the document carries no usable token; `Some(Err)` when it names
/// a revision or backend release the matrix cannot serve.
fn version_from_document(
    document: &Value,
    matrix: &CompatibilityMatrix,
) -> Option<ClientResult<ProtocolVersion>> {
    if let Some(raw) = document.pointer("/info/version").and_then(Value::as_str) {
        let raw = raw.trim();
        let has_release_prefix = raw
            .get(..RELEASE_PREFIX.len())
            .map_or(false, |prefix| prefix.eq_ignore_ascii_case(RELEASE_PREFIX));
        if has_release_prefix && raw.len() > RELEASE_PREFIX.len() {
            return Some(matrix.find_best_version(&raw[RELEASE_PREFIX.len()..]));
        }
        if let Ok(version) = ProtocolVersion::parse(raw) {
            return Some(matrix.require(&version));
        }
        if let Some(version) = extract_version_from_url(raw) {
            return Some(matrix.require(&version));
        }
    }

    document
        .get("servers")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|server| server.get("url").and_then(Value::as_str))
        .find_map(extract_version_from_url)
        .map(|version| matrix.require(&version))
}
