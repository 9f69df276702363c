//! Connection pool manager
//!
//! Transports are `reqwest::Client` instances tuned from a [`PoolConfig`] and
//! cached per `(protocol version, pool profile, endpoint)`. The per-key entry is
//! created under the map shard lock, so concurrent first use constructs exactly
//! one transport and every later lookup returns the same handle.

use crate::error::{ClientError, ClientResult};
use crate::version::ProtocolVersion;
use dashmap::DashMap;
use reqwest::ClientBuilder;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::Resumption;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const TLS_SESSION_CACHE_SIZE: usize = 256;

/// Named tuning presets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolProfile {
    #[default]
    Default,
    HighThroughput,
    LowLatency,
    Conservative,
    Batch,
    /// Caller-supplied [`PoolConfig`]
    Custom,
}

impl PoolProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolProfile::Default => "default",
            PoolProfile::HighThroughput => "high_throughput",
            PoolProfile::LowLatency => "low_latency",
            PoolProfile::Conservative => "conservative",
            PoolProfile::Batch => "batch",
            PoolProfile::Custom => "custom",
        }
    }

    /// Preset values, `None` for `Custom`
    pub fn preset(&self) -> Option<PoolConfig> {
        match self {
            PoolProfile::Default => Some(PoolConfig::default()),
            PoolProfile::HighThroughput => Some(PoolConfig::high_throughput()),
            PoolProfile::LowLatency => Some(PoolConfig::low_latency()),
            PoolProfile::Conservative => Some(PoolConfig::conservative()),
            PoolProfile::Batch => Some(PoolConfig::batch()),
            PoolProfile::Custom => None,
        }
    }
}

impl fmt::Display for PoolProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolProfile {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "" | "default" => Ok(PoolProfile::Default),
            "high_throughput" | "high_performance" => Ok(PoolProfile::HighThroughput),
            "low_latency" => Ok(PoolProfile::LowLatency),
            "conservative" => Ok(PoolProfile::Conservative),
            "batch" => Ok(PoolProfile::Batch),
            "custom" => Ok(PoolProfile::Custom),
            other => Err(ClientError::config(
                "pool_profile",
                format!("unknown pool profile '{}'", other),
            )),
        }
    }
}

/// Transport tuning bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    /// Enforced as a permit count on the transport
    pub max_conns_per_host: usize,
    pub idle_conn_timeout: Duration,
    /// reqwest's connect timeout covers TCP connect and the TLS handshake
    pub tls_handshake_timeout: Duration,
    /// Carried in the tuning tables; hyper never sends `Expect: 100-continue`
    pub expect_continue_timeout: Duration,
    pub response_header_timeout: Duration,
    pub disable_compression: bool,
    pub disable_keep_alives: bool,
    pub tls_session_resumption: bool,
    pub insecure_skip_verify: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_conns: 100,
            max_idle_conns_per_host: 30,
            max_conns_per_host: 100,
            idle_conn_timeout: Duration::from_secs(90),
            tls_handshake_timeout: Duration::from_secs(10),
            expect_continue_timeout: Duration::from_secs(1),
            response_header_timeout: Duration::from_secs(30),
            disable_compression: false,
            disable_keep_alives: false,
            tls_session_resumption: true,
            insecure_skip_verify: false,
        }
    }
}

impl PoolConfig {
    pub fn high_throughput() -> Self {
        Self {
            max_idle_conns: 200,
            max_idle_conns_per_host: 50,
            max_conns_per_host: 200,
            idle_conn_timeout: Duration::from_secs(120),
            tls_handshake_timeout: Duration::from_secs(5),
            expect_continue_timeout: Duration::from_millis(500),
            response_header_timeout: Duration::from_secs(15),
            ..Self::default()
        }
    }

    pub fn low_latency() -> Self {
        Self {
            max_conns_per_host: 50,
            tls_handshake_timeout: Duration::from_secs(3),
            expect_continue_timeout: Duration::from_millis(100),
            response_header_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    pub fn conservative() -> Self {
        Self {
            max_idle_conns: 10,
            max_idle_conns_per_host: 5,
            max_conns_per_host: 20,
            idle_conn_timeout: Duration::from_secs(30),
            tls_handshake_timeout: Duration::from_secs(15),
            expect_continue_timeout: Duration::from_secs(2),
            response_header_timeout: Duration::from_secs(60),
            ..Self::default()
        }
    }

    pub fn batch() -> Self {
        Self {
            idle_conn_timeout: Duration::from_secs(300),
            response_header_timeout: Duration::from_secs(120),
            ..Self::high_throughput()
        }
    }

    pub fn with_insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }

    /// Apply revision-specific tuning on top of a profile.
    ///
    /// v0.0.40 backends get fewer connections and more time to answer. v0.0.41
    /// drops idle connections sooner; v0.0.43 and later keep them around longer.
    pub fn for_version(&self, version: ProtocolVersion) -> Self {
        let mut config = self.clone();
        match version {
            ProtocolVersion::V0_0_40 => {
                config.max_conns_per_host = config.max_conns_per_host.min(20);
                config.response_header_timeout =
                    config.response_header_timeout.max(Duration::from_secs(30));
            }
            ProtocolVersion::V0_0_41 => {
                config.expect_continue_timeout = Duration::from_millis(750);
                config.idle_conn_timeout = config.idle_conn_timeout.min(Duration::from_secs(60));
            }
            ProtocolVersion::V0_0_43 | ProtocolVersion::V0_0_44 => {
                config.expect_continue_timeout = Duration::from_millis(250);
                config.idle_conn_timeout = config.idle_conn_timeout.max(Duration::from_secs(120));
            }
            _ => {}
        }
        config
    }

    /// TLS settings to install, if any differ from platform defaults
    pub fn tls_override(&self) -> Option<TlsOverride> {
        if self.tls_session_resumption || self.insecure_skip_verify {
            Some(TlsOverride {
                session_resumption: self.tls_session_resumption,
                insecure_skip_verify: self.insecure_skip_verify,
            })
        } else {
            None
        }
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.max_conns_per_host == 0 {
            return Err(ClientError::config(
                "max_conns_per_host",
                "must be greater than 0",
            ));
        }
        if self.max_conns_per_host > Semaphore::MAX_PERMITS {
            return Err(ClientError::config(
                "max_conns_per_host",
                format!("must not exceed {}", Semaphore::MAX_PERMITS),
            ));
        }
        if self.idle_conn_timeout.is_zero() {
            return Err(ClientError::config(
                "idle_conn_timeout",
                "must be greater than 0",
            ));
        }
        if self.response_header_timeout.is_zero() {
            return Err(ClientError::config(
                "response_header_timeout",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    fn build_http_client(&self, tls: Option<&TlsOverride>) -> ClientResult<reqwest::Client> {
        let idle_per_host = if self.disable_keep_alives {
            0
        } else {
            self.max_idle_conns_per_host.min(self.max_idle_conns)
        };

        let mut builder = ClientBuilder::new()
            .connect_timeout(self.tls_handshake_timeout)
            .read_timeout(self.response_header_timeout)
            .pool_max_idle_per_host(idle_per_host)
            .pool_idle_timeout(Some(self.idle_conn_timeout))
            .gzip(!self.disable_compression);

        if !self.disable_keep_alives {
            builder = builder.tcp_keepalive(Some(TCP_KEEPALIVE));
        }

        if let Some(tls) = tls {
            builder = builder.use_preconfigured_tls(tls.client_config()?);
        }

        builder
            .build()
            .map_err(|e| ClientError::config("http_client", e.to_string()))
    }
}

/// TLS settings installed on a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TlsOverride {
    pub session_resumption: bool,
    pub insecure_skip_verify: bool,
}

impl TlsOverride {
    /// rustls configuration handed to reqwest in place of its built-in one
    pub fn client_config(&self) -> ClientResult<rustls::ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ClientError::config("tls", e.to_string()))?;

        let mut config = if self.insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        };

        config.resumption = if self.session_resumption {
            Resumption::in_memory_sessions(TLS_SESSION_CACHE_SIZE)
        } else {
            Resumption::disabled()
        };
        Ok(config)
    }
}

/// Certificate verifier for `insecure_skip_verify`; signatures are still checked
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Cache key of a transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TransportKey {
    pub version: ProtocolVersion,
    pub profile: PoolProfile,
    pub endpoint: String,
}

/// Reduce a URL to the `scheme://host:port` origin transports are keyed on
pub fn endpoint_origin(endpoint: &str) -> ClientResult<String> {
    let url = reqwest::Url::parse(endpoint.trim())
        .map_err(|e| ClientError::invalid_argument("endpoint", e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ClientError::invalid_argument(
                "endpoint",
                format!("unsupported scheme '{}'", other),
            ))
        }
    }
    if url.host_str().is_none() {
        return Err(ClientError::invalid_argument("endpoint", "missing host"));
    }
    Ok(url.origin().ascii_serialization())
}

/// Shared handle to a pooled transport
#[derive(Debug, Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

#[derive(Debug)]
struct TransportInner {
    id: u64,
    key: TransportKey,
    http: reqwest::Client,
    config: PoolConfig,
    tls: Option<TlsOverride>,
    permits: Arc<Semaphore>,
}

impl Transport {
    fn build(id: u64, key: TransportKey, config: PoolConfig) -> ClientResult<Self> {
        config.validate()?;
        let tls = config.tls_override();
        let http = config.build_http_client(tls.as_ref())?;
        debug!(
            id,
            endpoint = %key.endpoint,
            version = %key.version,
            profile = %key.profile,
            max_conns_per_host = config.max_conns_per_host,
            tls_override = tls.is_some(),
            "built transport"
        );
        Ok(Self {
            inner: Arc::new(TransportInner {
                id,
                key,
                http,
                permits: Arc::new(Semaphore::new(config.max_conns_per_host)),
                config,
                tls,
            }),
        })
    }

    /// Registry-unique identifier, stable for the life of the handle
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn key(&self) -> &TransportKey {
        &self.inner.key
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn tls_override(&self) -> Option<TlsOverride> {
        self.inner.tls
    }

    /// True when both handles refer to the same underlying transport
    pub fn ptr_eq(&self, other: &Transport) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// Wait for a connection slot; fails once the transport has been closed
    pub(crate) async fn acquire(&self) -> ClientResult<OwnedSemaphorePermit> {
        self.inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClientError::NotInitialized {
                reason: format!("transport for {} is closed", self.inner.key.endpoint),
            })
    }

    fn close(&self) {
        self.inner.permits.close();
    }
}

/// Transports for one `(version, profile)` pair, keyed by endpoint origin
#[derive(Debug)]
pub struct TransportPool {
    version: ProtocolVersion,
    profile: PoolProfile,
    config: PoolConfig,
    transports: DashMap<String, Transport>,
    next_id: Arc<AtomicU64>,
}

impl TransportPool {
    fn new(
        version: ProtocolVersion,
        profile: PoolProfile,
        config: PoolConfig,
        next_id: Arc<AtomicU64>,
    ) -> Self {
        Self {
            version,
            profile,
            config,
            transports: DashMap::new(),
            next_id,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn get_transport(&self, endpoint: &str) -> ClientResult<Transport> {
        let origin = endpoint_origin(endpoint)?;
        if let Some(existing) = self.transports.get(&origin) {
            return Ok(existing.value().clone());
        }

        let entry = self.transports.entry(origin.clone()).or_try_insert_with(|| {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let key = TransportKey {
                version: self.version,
                profile: self.profile,
                endpoint: origin,
            };
            Transport::build(id, key, self.config.clone())
        })?;
        Ok(entry.value().clone())
    }

    fn entries(&self) -> Vec<TransportEntry> {
        self.transports
            .iter()
            .map(|entry| {
                let transport = entry.value();
                TransportEntry {
                    id: transport.id(),
                    version: self.version,
                    profile: self.profile,
                    endpoint: transport.key().endpoint.clone(),
                }
            })
            .collect()
    }

    fn close(&self) {
        for transport in self.transports.iter() {
            transport.close();
        }
        self.transports.clear();
    }
}

/// One live transport as reported by [`TransportRegistry::stats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportEntry {
    pub id: u64,
    pub version: ProtocolVersion,
    pub profile: PoolProfile,
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub active_transports: usize,
    pub entries: Vec<TransportEntry>,
}

/// Pools per `(version, profile)`, each applying the revision overrides to its profile
#[derive(Debug)]
pub struct TransportRegistry {
    custom: Option<PoolConfig>,
    insecure_skip_verify: bool,
    pools: DashMap<(ProtocolVersion, PoolProfile), Arc<TransportPool>>,
    next_id: Arc<AtomicU64>,
    closed: AtomicBool,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            custom: None,
            insecure_skip_verify: false,
            pools: DashMap::new(),
            next_id: Arc::new(AtomicU64::new(1)),
            closed: AtomicBool::new(false),
        }
    }

    /// Config used for [`PoolProfile::Custom`]
    pub fn with_custom_config(mut self, config: PoolConfig) -> Self {
        self.custom = Some(config);
        self
    }

    /// Force certificate verification off for every profile
    pub fn with_insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }

    /// Effective config for a profile at a revision
    pub fn config_for(
        &self,
        version: ProtocolVersion,
        profile: PoolProfile,
    ) -> ClientResult<PoolConfig> {
        let base = match profile.preset() {
            Some(preset) => preset,
            None => self.custom.clone().ok_or_else(|| {
                ClientError::config(
                    "pool_config",
                    "custom pool profile selected without a pool config",
                )
            })?,
        };
        let mut config = base.for_version(version);
        if self.insecure_skip_verify {
            config.insecure_skip_verify = true;
        }
        Ok(config)
    }

    pub fn pool(
        &self,
        version: ProtocolVersion,
        profile: PoolProfile,
    ) -> ClientResult<Arc<TransportPool>> {
        self.ensure_open()?;
        if let Some(pool) = self.pools.get(&(version, profile)) {
            return Ok(pool.value().clone());
        }
        let config = self.config_for(version, profile)?;
        let pool = self
            .pools
            .entry((version, profile))
            .or_insert_with(|| {
                Arc::new(TransportPool::new(version, profile, config, self.next_id.clone()))
            });
        Ok(pool.value().clone())
    }

    pub fn get_transport(
        &self,
        version: ProtocolVersion,
        profile: PoolProfile,
        endpoint: &str,
    ) -> ClientResult<Transport> {
        self.pool(version, profile)?.get_transport(endpoint)
    }

    /// Snapshot of live transports, sorted by id
    pub fn stats(&self) -> TransportStats {
        let mut entries: Vec<TransportEntry> = self
            .pools
            .iter()
            .flat_map(|pool| pool.entries())
            .collect();
        entries.sort_by_key(|e| e.id);
        TransportStats {
            active_transports: entries.len(),
            entries,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every cached transport and clear the maps. Safe to call twice.
    ///
    /// Call only after in-flight requests have drained; lookups racing a close
    /// may observe either state.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let closed = self.stats().active_transports;
        for pool in self.pools.iter() {
            pool.close();
        }
        self.pools.clear();
        info!(transports = closed, "transport registry closed");
    }

    fn ensure_open(&self) -> ClientResult<()> {
        if self.is_closed() {
            return Err(ClientError::NotInitialized {
                reason: "transport registry is closed".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_presets() {
        let default = PoolConfig::default();
        assert_eq!(default.max_idle_conns, 100);
        assert_eq!(default.max_idle_conns_per_host, 30);
        assert_eq!(default.max_conns_per_host, 100);
        assert_eq!(default.idle_conn_timeout, Duration::from_secs(90));
        assert!(default.tls_session_resumption);
        assert!(!default.insecure_skip_verify);

        let low = PoolConfig::low_latency();
        assert_eq!(low.max_conns_per_host, 50);
        assert_eq!(low.response_header_timeout, Duration::from_secs(5));
        assert_eq!(low.expect_continue_timeout, Duration::from_millis(100));

        let batch = PoolConfig::batch();
        assert_eq!(batch.max_conns_per_host, 200);
        assert_eq!(batch.idle_conn_timeout, Duration::from_secs(300));
        assert_eq!(batch.response_header_timeout, Duration::from_secs(120));

        let conservative = PoolConfig::conservative();
        assert_eq!(conservative.max_idle_conns_per_host, 5);
        assert_eq!(conservative.response_header_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_profile_parsing() {
        assert_eq!("high-throughput".parse::<PoolProfile>().unwrap(), PoolProfile::HighThroughput);
        assert_eq!("LOW_LATENCY".parse::<PoolProfile>().unwrap(), PoolProfile::LowLatency);
        assert_eq!("".parse::<PoolProfile>().unwrap(), PoolProfile::Default);
        assert!("turbo".parse::<PoolProfile>().is_err());
        for profile in [
            PoolProfile::Default,
            PoolProfile::HighThroughput,
            PoolProfile::LowLatency,
            PoolProfile::Conservative,
            PoolProfile::Batch,
            PoolProfile::Custom,
        ] {
            assert_eq!(profile.to_string().parse::<PoolProfile>().unwrap(), profile);
        }
    }

    #[test]
    fn test_revision_overrides() {
        let base = PoolConfig::high_throughput();

        let old = base.for_version(ProtocolVersion::V0_0_40);
        assert_eq!(old.max_conns_per_host, 20);
        assert_eq!(old.response_header_timeout, Duration::from_secs(30));

        let conservative_old = PoolConfig::conservative().for_version(ProtocolVersion::V0_0_40);
        assert_eq!(conservative_old.max_conns_per_host, 20);
        assert_eq!(conservative_old.response_header_timeout, Duration::from_secs(60));

        let v41 = base.for_version(ProtocolVersion::V0_0_41);
        assert_eq!(v41.expect_continue_timeout, Duration::from_millis(750));
        assert_eq!(v41.idle_conn_timeout, Duration::from_secs(60));

        assert_eq!(base.for_version(ProtocolVersion::V0_0_42), base);

        let v44 = PoolConfig::default().for_version(ProtocolVersion::V0_0_44);
        assert_eq!(v44.expect_continue_timeout, Duration::from_millis(250));
        assert_eq!(v44.idle_conn_timeout, Duration::from_secs(120));
        let batch = PoolConfig::batch().for_version(ProtocolVersion::V0_0_43);
        assert_eq!(batch.idle_conn_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_validate_rejects_unusable_limits() {
        let mut config = PoolConfig::default();
        assert!(config.validate().is_ok());

        config.max_conns_per_host = usize::MAX;
        assert!(matches!(config.validate(), Err(ClientError::Config { .. })));

        config.max_conns_per_host = Semaphore::MAX_PERMITS;
        assert!(config.validate().is_ok());

        config.max_conns_per_host = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_custom_config_is_an_error() {
        let custom = PoolConfig {
            max_conns_per_host: usize::MAX,
            ..PoolConfig::default()
        };
        let registry = TransportRegistry::new().with_custom_config(custom);
        let result =
            registry.get_transport(ProtocolVersion::V0_0_42, PoolProfile::Custom, "http://a");
        assert!(matches!(result, Err(ClientError::Config { .. })));
        assert_eq!(registry.stats().active_transports, 0);
    }

    #[test]
    fn test_tls_override_only_when_requested() {
        let mut config = PoolConfig::default();
        config.tls_session_resumption = false;
        assert_eq!(config.tls_override(), None);

        config.insecure_skip_verify = true;
        assert_eq!(
            config.tls_override(),
            Some(TlsOverride {
                session_resumption: false,
                insecure_skip_verify: true
            })
        );
    }

    #[test]
    fn test_tls_override_builds_rustls_config() {
        let flags = [(true, false), (false, true), (true, true)];
        for (session_resumption, insecure_skip_verify) in flags {
            let tls = TlsOverride {
                session_resumption,
                insecure_skip_verify,
            };
            let config = tls.client_config().unwrap();
            assert!(config.enable_sni);

            let pool = PoolConfig {
                tls_session_resumption: session_resumption,
                insecure_skip_verify,
                ..PoolConfig::default()
            };
            assert!(pool.build_http_client(Some(&tls)).is_ok());
        }
    }

    #[test]
    fn test_endpoint_origin() {
        assert_eq!(endpoint_origin("http://host:6820/slurm").unwrap(), "http://host:6820");
        assert_eq!(endpoint_origin("https://Host/").unwrap(), "https://host");
        assert!(endpoint_origin("ftp://host").is_err());
        assert!(endpoint_origin("not a url").is_err());
    }

    #[test]
    fn test_same_key_same_transport() {
        let registry = TransportRegistry::new();
        let v = ProtocolVersion::V0_0_42;

        let a = registry.get_transport(v, PoolProfile::Default, "http://a:6820/x").unwrap();
        let b = registry.get_transport(v, PoolProfile::Default, "http://a:6820/y").unwrap();
        let c = registry.get_transport(v, PoolProfile::Default, "http://b:6820").unwrap();
        let d = registry
            .get_transport(ProtocolVersion::V0_0_40, PoolProfile::Default, "http://a:6820")
            .unwrap();

        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert!(!a.ptr_eq(&d));
        assert_eq!(d.config().max_conns_per_host, 20);
        assert_eq!(registry.stats().active_transports, 3);
    }

    #[test]
    fn test_custom_profile_requires_config() {
        let registry = TransportRegistry::new();
        assert!(registry
            .get_transport(ProtocolVersion::V0_0_42, PoolProfile::Custom, "http://a")
            .is_err());

        let mut custom = PoolConfig::conservative();
        custom.max_conns_per_host = 3;
        let registry = TransportRegistry::new().with_custom_config(custom);
        let t = registry
            .get_transport(ProtocolVersion::V0_0_42, PoolProfile::Custom, "http://a")
            .unwrap();
        assert_eq!(t.config().max_conns_per_host, 3);
    }

    #[test]
    fn test_insecure_flag_applies_to_presets() {
        let registry = TransportRegistry::new().with_insecure_skip_verify(true);
        let t = registry
            .get_transport(ProtocolVersion::V0_0_44, PoolProfile::LowLatency, "https://a")
            .unwrap();
        assert!(t.tls_override().unwrap().insecure_skip_verify);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_builds_once() {
        let registry = Arc::new(TransportRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .get_transport(ProtocolVersion::V0_0_43, PoolProfile::Batch, "http://node:6820")
                    .unwrap()
                    .id()
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(registry.stats().active_transports, 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_transports() {
        let registry = TransportRegistry::new();
        let transport = registry
            .get_transport(ProtocolVersion::V0_0_42, PoolProfile::Default, "http://a")
            .unwrap();
        assert!(transport.acquire().await.is_ok());

        registry.close();
        registry.close();

        assert!(registry.is_closed());
        assert_eq!(registry.stats(), TransportStats::default());
        assert!(transport.is_closed());
        assert!(transport.acquire().await.is_err());
        assert!(registry
            .get_transport(ProtocolVersion::V0_0_42, PoolProfile::Default, "http://a")
            .is_err());
    }
}
