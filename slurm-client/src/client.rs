//! Version-bound client facade
//!
//! A [`Client`] is bound to exactly one protocol revision for its whole life.
//! Resource facades are built lazily, once per kind, by the adapter factory
//! registered for that revision; concurrent first callers block on the same
//! slot and all observe the same adapter or the same failure.

use crate::adapter::{
    AdapterFactory, ListQuery, Resource, ResourceAdapter, ResourceKind, RevisionCapabilities,
};
use crate::error::{ClientError, ClientResult};
use crate::pool::{TransportRegistry, TransportStats};
use crate::version::ProtocolVersion;
use crate::watch::{spawn_watch, WatchOptions, WatchSession};
use crate::wire::WireClient;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

type FacadeSlot = OnceLock<ClientResult<Arc<dyn ResourceAdapter>>>;

#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    version: ProtocolVersion,
    wire: WireClient,
    factory: Arc<dyn AdapterFactory>,
    transports: Arc<TransportRegistry>,
    facades: [FacadeSlot; 7],
    constructions: AtomicUsize,
}

impl Client {
    pub(crate) fn new(
        wire: WireClient,
        factory: Arc<dyn AdapterFactory>,
        transports: Arc<TransportRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                version: wire.version(),
                wire,
                factory,
                transports,
                facades: std::array::from_fn(|_| OnceLock::new()),
                constructions: AtomicUsize::new(0),
            }),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.inner.version
    }

    /// Capability row of the bound revision, if it is one of the built-in ones
    pub fn capabilities(&self) -> Option<&'static RevisionCapabilities> {
        RevisionCapabilities::for_version(self.inner.version)
    }

    /// Adapter for `kind`, constructed on first use
    pub fn resource(&self, kind: ResourceKind) -> ClientResult<Arc<dyn ResourceAdapter>> {
        let slot = &self.inner.facades[kind as usize];
        slot.get_or_init(|| {
            self.inner.constructions.fetch_add(1, Ordering::Relaxed);
            let built = self
                .inner
                .factory
                .create(kind, self.inner.wire.clone())
                .and_then(|adapter| {
                    adapter.ok_or_else(|| ClientError::Unsupported {
                        operation: kind.as_str().to_string(),
                        version: self.inner.version.to_string(),
                    })
                });
            debug!(
                %kind,
                version = %self.inner.version,
                ok = built.is_ok(),
                "resource facade initialized"
            );
            built
        })
        .clone()
    }

    pub fn jobs(&self) -> ClientResult<Arc<dyn ResourceAdapter>> {
        self.resource(ResourceKind::Jobs)
    }

    pub fn nodes(&self) -> ClientResult<Arc<dyn ResourceAdapter>> {
        self.resource(ResourceKind::Nodes)
    }

    pub fn partitions(&self) -> ClientResult<Arc<dyn ResourceAdapter>> {
        self.resource(ResourceKind::Partitions)
    }

    pub fn reservations(&self) -> ClientResult<Arc<dyn ResourceAdapter>> {
        self.resource(ResourceKind::Reservations)
    }

    pub fn accounts(&self) -> ClientResult<Arc<dyn ResourceAdapter>> {
        self.resource(ResourceKind::Accounts)
    }

    pub fn qos(&self) -> ClientResult<Arc<dyn ResourceAdapter>> {
        self.resource(ResourceKind::Qos)
    }

    pub fn users(&self) -> ClientResult<Arc<dyn ResourceAdapter>> {
        self.resource(ResourceKind::Users)
    }

    /// Number of facade constructions attempted so far (at most one per kind)
    pub fn facade_constructions(&self) -> usize {
        self.inner.constructions.load(Ordering::Relaxed)
    }

    pub async fn list(
        &self,
        kind: ResourceKind,
        query: &ListQuery,
        cancel: &CancellationToken,
    ) -> ClientResult<Vec<Resource>> {
        self.resource(kind)?.list(query, cancel).await
    }

    pub async fn get(
        &self,
        kind: ResourceKind,
        id: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<Resource> {
        self.resource(kind)?.get(id, cancel).await
    }

    pub async fn submit_job(
        &self,
        payload: &Value,
        cancel: &CancellationToken,
    ) -> ClientResult<Value> {
        self.jobs()?.create(payload, cancel).await
    }

    pub async fn cancel_job(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<Value> {
        self.jobs()?.delete(job_id, cancel).await
    }

    /// Start a background watch over `kind`
    pub fn watch(
        &self,
        kind: ResourceKind,
        options: WatchOptions,
        cancel: &CancellationToken,
    ) -> ClientResult<WatchSession> {
        if cancel.is_cancelled() {
            return Err(ClientError::cancelled(format!("{}.watch", kind)));
        }
        spawn_watch(self.resource(kind)?, options, cancel)
    }

    /// Liveness check against the bound revision
    #[instrument(skip(self, cancel), fields(version = %self.inner.version))]
    pub async fn ping(&self, cancel: &CancellationToken) -> ClientResult<Value> {
        let path = format!("/slurm/{}/ping", self.inner.version);
        self.inner.wire.get(&path, &[], "ping", cancel).await
    }

    pub fn wire(&self) -> &WireClient {
        &self.inner.wire
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.inner.transports.stats()
    }
}
