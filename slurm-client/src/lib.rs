//! Slurm REST Client Library
//!
//! A version-aware async client runtime for slurmrestd. Resolves the protocol
//! revision (explicit, discovered, or by backend release), pools transports per
//! revision and endpoint, retries transient failures behind an optional
//! circuit breaker, normalizes error envelopes across revisions, and watches
//! resources by polling.

pub mod adapter;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod factory;
pub mod metrics;
pub mod middleware;
pub mod normalizer;
pub mod pool;
pub mod retry;
pub mod version;
pub mod watch;
pub mod wire;

pub use adapter::{
    AdapterFactory, AdapterRegistry, ListQuery, Operation, Resource, ResourceAdapter, ResourceKind,
};
pub use auth::{AuthProvider, BasicAuth, NoAuth, TokenAuth};
pub use client::Client;
pub use config::ClientConfig;
pub use error::{ClientError, ErrorDetail, ErrorKind, NormalizedError};
pub use factory::{ClientFactory, ClientFactoryBuilder};
pub use metrics::{DurationStats, MetricsCollector, MetricsSnapshot};
pub use middleware::{
    Exchange, HeaderMiddleware, LoggingMiddleware, MetricsMiddleware, Middleware,
    RequestIdMiddleware, TimeoutMiddleware, UserAgentMiddleware, REQUEST_ID_HEADER,
};
pub use pool::{PoolConfig, PoolProfile, TransportRegistry};
pub use retry::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, ExponentialBackoff, FixedDelay, NoRetry,
    RetryPolicy,
};
pub use version::{CompatibilityMatrix, ProtocolVersion};
pub use watch::{EventLabel, StopReason, WatchEvent, WatchOptions, WatchSession};

pub use tokio_util::sync::CancellationToken;

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
