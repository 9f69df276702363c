//! Resource adapters
//!
//! One [`ResourceAdapter`] instance serves one resource kind at one protocol
//! revision. The built-in [`RevisionAdapter`] is driven by a static capability
//! table; callers may register their own [`AdapterFactory`] per revision.

use crate::error::{ClientError, ClientResult, ErrorKind, NormalizedError};
use crate::version::ProtocolVersion;
use crate::watch::LabelVocabulary;
use crate::wire::WireClient;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Jobs,
    Nodes,
    Partitions,
    Reservations,
    Accounts,
    Qos,
    Users,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Jobs,
        ResourceKind::Nodes,
        ResourceKind::Partitions,
        ResourceKind::Reservations,
        ResourceKind::Accounts,
        ResourceKind::Qos,
        ResourceKind::Users,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Jobs => "jobs",
            ResourceKind::Nodes => "nodes",
            ResourceKind::Partitions => "partitions",
            ResourceKind::Reservations => "reservations",
            ResourceKind::Accounts => "accounts",
            ResourceKind::Qos => "qos",
            ResourceKind::Users => "users",
        }
    }

    /// Path segment addressing a single item
    fn item_segment(&self) -> &'static str {
        match self {
            ResourceKind::Jobs => "job",
            ResourceKind::Nodes => "node",
            ResourceKind::Partitions => "partition",
            ResourceKind::Reservations => "reservation",
            ResourceKind::Accounts => "account",
            ResourceKind::Qos => "qos",
            ResourceKind::Users => "user",
        }
    }

    /// Accounting resources live under `/slurmdb`
    pub fn is_accounting(&self) -> bool {
        matches!(self, ResourceKind::Accounts | ResourceKind::Qos | ResourceKind::Users)
    }

    fn id_field(&self) -> &'static str {
        match self {
            ResourceKind::Jobs => "job_id",
            _ => "name",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    List,
    Get,
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::List => "list",
            Operation::Get => "get",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

const READ: &[Operation] = &[Operation::List, Operation::Get];
const READ_UPDATE: &[Operation] = &[Operation::List, Operation::Get, Operation::Update];
const READ_UPDATE_DELETE: &[Operation] =
    &[Operation::List, Operation::Get, Operation::Update, Operation::Delete];
const NO_UPDATE: &[Operation] =
    &[Operation::List, Operation::Get, Operation::Create, Operation::Delete];
const ALL_OPS: &[Operation] = &[
    Operation::List,
    Operation::Get,
    Operation::Create,
    Operation::Update,
    Operation::Delete,
];

/// Operations each revision offers per resource kind. Kinds absent from a row
/// are not offered at all.
#[derive(Debug)]
pub struct RevisionCapabilities {
    pub version: ProtocolVersion,
    operations: &'static [(ResourceKind, &'static [Operation])],
}

static CAPABILITIES: [RevisionCapabilities; 5] = [
    RevisionCapabilities {
        version: ProtocolVersion::V0_0_40,
        operations: &[
            (ResourceKind::Jobs, NO_UPDATE),
            (ResourceKind::Nodes, READ),
            (ResourceKind::Partitions, READ),
            (ResourceKind::Accounts, NO_UPDATE),
            (ResourceKind::Qos, NO_UPDATE),
            (ResourceKind::Users, NO_UPDATE),
        ],
    },
    RevisionCapabilities {
        version: ProtocolVersion::V0_0_41,
        operations: &[
            (ResourceKind::Jobs, ALL_OPS),
            (ResourceKind::Nodes, READ),
            (ResourceKind::Partitions, READ),
            (ResourceKind::Reservations, READ),
            (ResourceKind::Accounts, NO_UPDATE),
            (ResourceKind::Qos, NO_UPDATE),
            (ResourceKind::Users, NO_UPDATE),
        ],
    },
    RevisionCapabilities {
        version: ProtocolVersion::V0_0_42,
        operations: &[
            (ResourceKind::Jobs, ALL_OPS),
            (ResourceKind::Nodes, READ_UPDATE_DELETE),
            (ResourceKind::Partitions, READ_UPDATE),
            (ResourceKind::Reservations, READ_UPDATE),
            (ResourceKind::Accounts, ALL_OPS),
            (ResourceKind::Qos, ALL_OPS),
            (ResourceKind::Users, ALL_OPS),
        ],
    },
    RevisionCapabilities {
        version: ProtocolVersion::V0_0_43,
        operations: &[
            (ResourceKind::Jobs, ALL_OPS),
            (ResourceKind::Nodes, READ_UPDATE_DELETE),
            (ResourceKind::Partitions, READ_UPDATE),
            (ResourceKind::Reservations, ALL_OPS),
            (ResourceKind::Accounts, ALL_OPS),
            (ResourceKind::Qos, ALL_OPS),
            (ResourceKind::Users, ALL_OPS),
        ],
    },
    RevisionCapabilities {
        version: ProtocolVersion::V0_0_44,
        operations: &[
            (ResourceKind::Jobs, ALL_OPS),
            (ResourceKind::Nodes, READ_UPDATE_DELETE),
            (ResourceKind::Partitions, READ_UPDATE),
            (ResourceKind::Reservations, ALL_OPS),
            (ResourceKind::Accounts, ALL_OPS),
            (ResourceKind::Qos, ALL_OPS),
            (ResourceKind::Users, ALL_OPS),
        ],
    },
];

impl RevisionCapabilities {
    pub fn for_version(version: ProtocolVersion) -> Option<&'static RevisionCapabilities> {
        CAPABILITIES.iter().find(|c| c.version == version)
    }

    pub fn operations(&self, kind: ResourceKind) -> Option<&'static [Operation]> {
        self.operations
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, ops)| *ops)
    }

    pub fn offers(&self, kind: ResourceKind) -> bool {
        self.operations(kind).is_some()
    }

    pub fn supports(&self, kind: ResourceKind, operation: Operation) -> bool {
        self.operations(kind)
            .map_or(false, |ops| ops.contains(&operation))
    }

    pub fn slurm_prefix(&self) -> String {
        format!("/slurm/{}", self.version)
    }

    pub fn slurmdb_prefix(&self) -> String {
        format!("/slurmdb/{}", self.version)
    }
}

/// One listed item: identifier, coarse state and the untouched payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    pub id: String,
    pub state: Option<String>,
    pub raw: Value,
}

impl Resource {
    pub fn new(id: impl Into<String>, state: Option<String>, raw: Value) -> Self {
        Self {
            id: id.into(),
            state,
            raw,
        }
    }

    /// Extract identifier and state the way the backend encodes them for `kind`
    pub fn from_value(kind: ResourceKind, raw: Value) -> Option<Self> {
        let id = scalar_text(raw.get(kind.id_field()))?;
        let state = match kind {
            ResourceKind::Jobs => first_state(raw.get("job_state")),
            ResourceKind::Nodes => joined_state(raw.get("state")),
            ResourceKind::Partitions => raw
                .get("partition")
                .and_then(|p| p.get("state"))
                .or_else(|| raw.get("state"))
                .and_then(|s| first_state(Some(s))),
            _ => None,
        };
        Some(Self { id, state, raw })
    }
}

fn scalar_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        // v0.0.40+ wraps some integers as {"set": true, "number": 42}
        Value::Object(map) => scalar_text(map.get("number")),
        _ => None,
    }
}

/// Job states arrive as a string or a list of flags; the first entry is the base state
fn first_state(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.to_ascii_uppercase()),
        Value::Array(items) => items
            .iter()
            .find_map(|v| v.as_str())
            .map(|s| s.to_ascii_uppercase()),
        _ => None,
    }
}

/// Node states keep their flags, joined the way `sinfo` prints them (`IDLE+DRAIN`)
fn joined_state(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.to_ascii_uppercase()),
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_ascii_uppercase())
                .collect();
            (!parts.is_empty()).then(|| parts.join("+"))
        }
        _ => None,
    }
}

/// Query passed through to list calls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub params: Vec<(String, String)>,
    /// Truncate the listing client-side
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Logical operations for one resource kind at one revision
#[async_trait]
pub trait ResourceAdapter: Send + Sync + fmt::Debug {
    fn kind(&self) -> ResourceKind;

    fn version(&self) -> ProtocolVersion;

    fn supports(&self, operation: Operation) -> bool;

    /// Watch labels this revision emits
    fn label_vocabulary(&self) -> LabelVocabulary {
        LabelVocabulary::for_version(self.version())
    }

    async fn list(
        &self,
        query: &ListQuery,
        cancel: &CancellationToken,
    ) -> ClientResult<Vec<Resource>>;

    async fn get(&self, id: &str, cancel: &CancellationToken) -> ClientResult<Resource>;

    async fn create(&self, payload: &Value, cancel: &CancellationToken) -> ClientResult<Value>;

    async fn update(
        &self,
        id: &str,
        payload: &Value,
        cancel: &CancellationToken,
    ) -> ClientResult<Value>;

    async fn delete(&self, id: &str, cancel: &CancellationToken) -> ClientResult<Value>;
}

/// Builds adapters for one revision
pub trait AdapterFactory: Send + Sync + fmt::Debug {
    /// `Ok(None)` when the revision does not offer `kind` at all
    fn create(
        &self,
        kind: ResourceKind,
        wire: WireClient,
    ) -> ClientResult<Option<Arc<dyn ResourceAdapter>>>;
}

/// Factory for the table-driven built-in adapters
#[derive(Debug, Clone, Copy, Default)]
pub struct RevisionAdapterFactory;

impl AdapterFactory for RevisionAdapterFactory {
    fn create(
        &self,
        kind: ResourceKind,
        wire: WireClient,
    ) -> ClientResult<Option<Arc<dyn ResourceAdapter>>> {
        let capabilities = RevisionCapabilities::for_version(wire.version()).ok_or_else(|| {
            ClientError::Unsupported {
                operation: kind.as_str().to_string(),
                version: wire.version().to_string(),
            }
        })?;
        if !capabilities.offers(kind) {
            return Ok(None);
        }
        Ok(Some(Arc::new(RevisionAdapter::new(kind, capabilities, wire))))
    }
}

/// Revision to adapter-factory binding
#[derive(Debug, Clone)]
pub struct AdapterRegistry {
    factories: HashMap<ProtocolVersion, Arc<dyn AdapterFactory>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Built-in adapters for every known revision
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for version in ProtocolVersion::supported() {
            registry.register(*version, Arc::new(RevisionAdapterFactory));
        }
        registry
    }

    pub fn register(&mut self, version: ProtocolVersion, factory: Arc<dyn AdapterFactory>) {
        self.factories.insert(version, factory);
    }

    pub fn factory(&self, version: ProtocolVersion) -> ClientResult<Arc<dyn AdapterFactory>> {
        self.factories.get(&version).cloned().ok_or_else(|| {
            let mut known: Vec<_> = self.factories.keys().copied().collect();
            known.sort();
            let names: Vec<String> = known.iter().map(ToString::to_string).collect();
            NormalizedError::unsupported_version(&version.to_string(), &names).into()
        })
    }

    pub fn versions(&self) -> Vec<ProtocolVersion> {
        let mut versions: Vec<_> = self.factories.keys().copied().collect();
        versions.sort();
        versions
    }
}

/// Built-in adapter: paths, envelopes and capabilities come from the revision table
#[derive(Debug)]
pub struct RevisionAdapter {
    kind: ResourceKind,
    capabilities: &'static RevisionCapabilities,
    wire: WireClient,
    prefix: String,
}

impl RevisionAdapter {
    pub fn new(
        kind: ResourceKind,
        capabilities: &'static RevisionCapabilities,
        wire: WireClient,
    ) -> Self {
        let prefix = if kind.is_accounting() {
            capabilities.slurmdb_prefix()
        } else {
            capabilities.slurm_prefix()
        };
        Self {
            kind,
            capabilities,
            wire,
            prefix,
        }
    }

    fn operation_name(&self, operation: Operation) -> String {
        format!("{}.{}", self.kind, operation.as_str())
    }

    /// Cancellation first, then capability, then argument checks
    fn precondition(
        &self,
        operation: Operation,
        id: Option<&str>,
        cancel: &CancellationToken,
    ) -> ClientResult<String> {
        let name = self.operation_name(operation);
        if cancel.is_cancelled() {
            return Err(ClientError::cancelled(name));
        }
        if !self.supports(operation) {
            return Err(ClientError::Unsupported {
                operation: name,
                version: self.version().to_string(),
            });
        }
        if let Some(id) = id {
            validate_id(id)?;
        }
        Ok(name)
    }

    fn collection_path(&self) -> String {
        format!("{}/{}", self.prefix, self.kind.as_str())
    }

    fn item_path(&self, id: &str) -> String {
        format!("{}/{}/{}", self.prefix, self.kind.item_segment(), id)
    }

    fn create_path(&self) -> String {
        match self.kind {
            ResourceKind::Jobs => format!("{}/job/submit", self.prefix),
            ResourceKind::Reservations => format!("{}/reservation", self.prefix),
            _ => self.collection_path(),
        }
    }

    /// Accounting writes take `{"<kind>": [item]}`; bare items are wrapped
    fn accounting_body(&self, payload: &Value) -> Value {
        if payload.get(self.kind.as_str()).is_some() {
            payload.clone()
        } else {
            let mut body = Map::new();
            body.insert(self.kind.as_str().to_string(), Value::Array(vec![payload.clone()]));
            Value::Object(body)
        }
    }

    fn resources(&self, body: &Value) -> Vec<Resource> {
        let items = body
            .get(self.kind.as_str())
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total = items.len();
        let resources: Vec<Resource> = items
            .into_iter()
            .filter_map(|item| Resource::from_value(self.kind, item))
            .collect();
        if resources.len() != total {
            debug!(
                kind = %self.kind,
                skipped = total - resources.len(),
                "skipped listed items without an identifier"
            );
        }
        resources
    }
}

fn validate_id(id: &str) -> ClientResult<()> {
    if id.trim().is_empty() {
        return Err(ClientError::invalid_argument("id", "identifier cannot be empty"));
    }
    if id.contains(['/', '?', '#']) || id.chars().any(char::is_whitespace) {
        return Err(ClientError::invalid_argument(
            "id",
            format!("identifier '{}' contains reserved characters", id),
        ));
    }
    Ok(())
}

#[async_trait]
impl ResourceAdapter for RevisionAdapter {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn version(&self) -> ProtocolVersion {
        self.capabilities.version
    }

    fn supports(&self, operation: Operation) -> bool {
        self.capabilities.supports(self.kind, operation)
    }

    #[instrument(skip(self, query, cancel), fields(kind = %self.kind, version = %self.version()))]
    async fn list(
        &self,
        query: &ListQuery,
        cancel: &CancellationToken,
    ) -> ClientResult<Vec<Resource>> {
        let operation = self.precondition(Operation::List, None, cancel)?;
        let body = self
            .wire
            .get(&self.collection_path(), &query.params, &operation, cancel)
            .await?;
        let mut resources = self.resources(&body);
        if let Some(limit) = query.limit {
            resources.truncate(limit);
        }
        Ok(resources)
    }

    #[instrument(skip(self, cancel), fields(kind = %self.kind, version = %self.version()))]
    async fn get(&self, id: &str, cancel: &CancellationToken) -> ClientResult<Resource> {
        let operation = self.precondition(Operation::Get, Some(id), cancel)?;
        let body = self.wire.get(&self.item_path(id), &[], &operation, cancel).await?;
        self.resources(&body)
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| {
                let message = format!("{} '{}' not found", self.kind.item_segment(), id);
                NormalizedError::new(ErrorKind::NotFound, None, message)
                    .with_api_version(self.version().to_string())
                    .with_operation(operation)
                    .into()
            })
    }

    #[instrument(skip(self, payload, cancel), fields(kind = %self.kind, version = %self.version()))]
    async fn create(&self, payload: &Value, cancel: &CancellationToken) -> ClientResult<Value> {
        let operation = self.precondition(Operation::Create, None, cancel)?;
        let body = if self.kind.is_accounting() {
            self.accounting_body(payload)
        } else {
            payload.clone()
        };
        self.wire.post(&self.create_path(), &body, &operation, cancel).await
    }

    #[instrument(skip(self, payload, cancel), fields(kind = %self.kind, version = %self.version()))]
    async fn update(
        &self,
        id: &str,
        payload: &Value,
        cancel: &CancellationToken,
    ) -> ClientResult<Value> {
        let operation = self.precondition(Operation::Update, Some(id), cancel)?;
        if self.kind.is_accounting() {
            let mut item = payload.clone();
            if let Value::Object(map) = &mut item {
                map.entry("name").or_insert_with(|| Value::String(id.to_string()));
            }
            let body = self.accounting_body(&item);
            self.wire.post(&self.collection_path(), &body, &operation, cancel).await
        } else {
            self.wire.post(&self.item_path(id), payload, &operation, cancel).await
        }
    }

    #[instrument(skip(self, cancel), fields(kind = %self.kind, version = %self.version()))]
    async fn delete(&self, id: &str, cancel: &CancellationToken) -> ClientResult<Value> {
        let operation = self.precondition(Operation::Delete, Some(id), cancel)?;
        self.wire.delete(&self.item_path(id), &operation, cancel).await
    }
}
