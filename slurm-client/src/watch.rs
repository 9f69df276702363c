//! Watch sessions
//!
//! A session polls one resource adapter's `list` on a fixed interval and turns
//! the difference between consecutive listings into [`WatchEvent`]s. The
//! snapshot is owned by the polling task alone. Events go through a bounded
//! queue; every send races the session's cancellation token so an abandoned
//! session never leaks its task.

use crate::adapter::{ListQuery, Resource, ResourceAdapter, ResourceKind};
use crate::error::{ClientError, ClientResult};
use crate::version::ProtocolVersion;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_BUFFER: usize = 100;

/// Job states after which a job never changes again
pub const TERMINAL_JOB_STATES: [&str; 9] = [
    "COMPLETED",
    "FAILED",
    "CANCELLED",
    "TIMEOUT",
    "NODE_FAIL",
    "PREEMPTED",
    "BOOT_FAIL",
    "DEADLINE",
    "OUT_OF_MEMORY",
];

pub fn is_terminal_job_state(state: &str) -> bool {
    TERMINAL_JOB_STATES.contains(&state)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLabel {
    /// Identifier appeared in the listing
    Created,
    /// Identifier left the listing without reaching a terminal state
    Completed,
    Start,
    Running,
    Pending,
    Suspend,
    End,
    Fail,
    Cancel,
    Drain,
    Resume,
    Idle,
    Allocated,
    Down,
    Mixed,
    Error,
    StateChange,
}

impl EventLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLabel::Created => "created",
            EventLabel::Completed => "completed",
            EventLabel::Start => "start",
            EventLabel::Running => "running",
            EventLabel::Pending => "pending",
            EventLabel::Suspend => "suspend",
            EventLabel::End => "end",
            EventLabel::Fail => "fail",
            EventLabel::Cancel => "cancel",
            EventLabel::Drain => "drain",
            EventLabel::Resume => "resume",
            EventLabel::Idle => "idle",
            EventLabel::Allocated => "allocated",
            EventLabel::Down => "down",
            EventLabel::Mixed => "mixed",
            EventLabel::Error => "error",
            EventLabel::StateChange => "state_change",
        }
    }
}

impl fmt::Display for EventLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label set a revision emits for state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelVocabulary {
    /// v0.0.40 to v0.0.42: cancellation has its own label
    Legacy,
    /// v0.0.43 onward: cancellation counts as failure; suspend/pending/running are labelled
    Extended,
}

impl LabelVocabulary {
    pub fn for_version(version: ProtocolVersion) -> Self {
        if version >= ProtocolVersion::V0_0_43 {
            LabelVocabulary::Extended
        } else {
            LabelVocabulary::Legacy
        }
    }

    pub fn label(
        &self,
        kind: ResourceKind,
        previous: Option<&str>,
        current: Option<&str>,
    ) -> EventLabel {
        match kind {
            ResourceKind::Jobs => self.job_label(previous, current),
            ResourceKind::Nodes => node_label(previous, current),
            _ => EventLabel::StateChange,
        }
    }

    fn job_label(&self, previous: Option<&str>, current: Option<&str>) -> EventLabel {
        let extended = *self == LabelVocabulary::Extended;
        match current.unwrap_or_default() {
            "RUNNING" if previous == Some("PENDING") => EventLabel::Start,
            "RUNNING" if extended => EventLabel::Running,
            "COMPLETED" => EventLabel::End,
            "FAILED" | "TIMEOUT" | "NODE_FAIL" => EventLabel::Fail,
            "CANCELLED" if extended => EventLabel::Fail,
            "CANCELLED" => EventLabel::Cancel,
            "SUSPENDED" if extended => EventLabel::Suspend,
            "PENDING" if extended => EventLabel::Pending,
            _ => EventLabel::StateChange,
        }
    }
}

fn has_flag(state: Option<&str>, flag: &str) -> bool {
    state.map_or(false, |s| s.split('+').any(|part| part == flag))
}

fn node_label(previous: Option<&str>, current: Option<&str>) -> EventLabel {
    if has_flag(current, "DRAIN") {
        return EventLabel::Drain;
    }
    let base = current.and_then(|s| s.split('+').next()).unwrap_or_default();
    match base {
        "IDLE" if has_flag(previous, "DRAIN") || has_flag(previous, "DOWN") => EventLabel::Resume,
        "IDLE" => EventLabel::Idle,
        "ALLOCATED" => EventLabel::Allocated,
        "DOWN" => EventLabel::Down,
        "MIXED" => EventLabel::Mixed,
        "ERROR" => EventLabel::Error,
        _ => EventLabel::StateChange,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchEvent {
    pub label: EventLabel,
    pub kind: ResourceKind,
    pub id: String,
    pub previous_state: Option<String>,
    pub current_state: Option<String>,
    /// Listing entry that triggered the event; `None` for removals
    pub resource: Option<Resource>,
    pub observed_at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub interval: Duration,
    pub buffer: usize,
    pub max_events: Option<usize>,
    /// Only report these identifiers; the session ends once all of them have left the listing
    pub ids: Option<HashSet<String>>,
    pub labels: Option<HashSet<EventLabel>>,
    /// End the session on a non-retryable poll error
    pub stop_on_error: bool,
    pub query: ListQuery,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            buffer: DEFAULT_BUFFER,
            max_events: None,
            ids: None,
            labels: None,
            stop_on_error: true,
            query: ListQuery::default(),
        }
    }
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn max_events(mut self, max: usize) -> Self {
        self.max_events = Some(max);
        self
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn labels(mut self, labels: impl IntoIterator<Item = EventLabel>) -> Self {
        self.labels = Some(labels.into_iter().collect());
        self
    }

    pub fn stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    pub fn query(mut self, query: ListQuery) -> Self {
        self.query = query;
        self
    }

    fn validate(&self) -> ClientResult<()> {
        if self.interval.is_zero() {
            return Err(ClientError::invalid_argument("interval", "must be greater than 0"));
        }
        if self.buffer == 0 {
            return Err(ClientError::invalid_argument("buffer", "must be greater than 0"));
        }
        if self.max_events == Some(0) {
            return Err(ClientError::invalid_argument("max_events", "must be greater than 0"));
        }
        if self.ids.as_ref().map_or(false, HashSet::is_empty) {
            return Err(ClientError::invalid_argument("ids", "filter cannot be empty"));
        }
        Ok(())
    }
}

/// Why a session ended
#[derive(Debug, Clone)]
pub enum StopReason {
    Cancelled,
    MaxEvents,
    /// Every filtered identifier left the listing
    WatchedIdsRetired,
    ReceiverDropped,
    Failed(ClientError),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Cancelled => f.write_str("cancelled"),
            StopReason::MaxEvents => f.write_str("max events reached"),
            StopReason::WatchedIdsRetired => f.write_str("watched identifiers retired"),
            StopReason::ReceiverDropped => f.write_str("receiver dropped"),
            StopReason::Failed(e) => write!(f, "poll failed: {}", e),
        }
    }
}

/// Handle to a running watch. Dropping it cancels the background task.
#[derive(Debug)]
pub struct WatchSession {
    events: mpsc::Receiver<WatchEvent>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<StopReason>>,
}

impl WatchSession {
    /// Next event; `None` once the session has stopped and the queue is drained
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel and wait for the task to exit
    pub async fn stop(mut self) -> StopReason {
        self.cancel.cancel();
        self.join_task().await
    }

    /// Stop accepting events and wait for the task to exit on its own
    pub async fn join(mut self) -> StopReason {
        self.events.close();
        self.join_task().await
    }

    async fn join_task(&mut self) -> StopReason {
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or(StopReason::Cancelled),
            None => StopReason::Cancelled,
        }
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start a session polling `adapter`. The session token is a child of `parent`.
pub fn spawn_watch(
    adapter: Arc<dyn ResourceAdapter>,
    options: WatchOptions,
    parent: &CancellationToken,
) -> ClientResult<WatchSession> {
    let kind = adapter.kind();
    if parent.is_cancelled() {
        return Err(ClientError::cancelled(format!("{}.watch", kind)));
    }
    options.validate()?;

    let cancel = parent.child_token();
    let (tx, rx) = mpsc::channel(options.buffer);
    let poller = Poller::new(adapter, options, cancel.clone(), tx);
    let handle = tokio::spawn(poller.run());

    Ok(WatchSession {
        events: rx,
        cancel,
        handle: Some(handle),
    })
}

/// Diff state of one session, owned by its task
struct Poller {
    adapter: Arc<dyn ResourceAdapter>,
    options: WatchOptions,
    cancel: CancellationToken,
    tx: mpsc::Sender<WatchEvent>,
    snapshot: HashMap<String, Option<String>>,
    /// Identifiers observed in a terminal state at least once
    finished: HashSet<String>,
    emitted: usize,
}

impl Poller {
    fn new(
        adapter: Arc<dyn ResourceAdapter>,
        options: WatchOptions,
        cancel: CancellationToken,
        tx: mpsc::Sender<WatchEvent>,
    ) -> Self {
        Self {
            adapter,
            options,
            cancel,
            tx,
            snapshot: HashMap::new(),
            finished: HashSet::new(),
            emitted: 0,
        }
    }

    async fn run(mut self) -> StopReason {
        let kind = self.adapter.kind();
        info!(
            %kind,
            version = %self.adapter.version(),
            interval = ?self.options.interval,
            "watch session started"
        );
        let reason = self.poll_loop().await;
        info!(%kind, events = self.emitted, reason = %reason, "watch session stopped");
        reason
    }

    async fn poll_loop(&mut self) -> StopReason {
        let mut ticker = tokio::time::interval(self.options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seeded = false;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return StopReason::Cancelled,
                _ = ticker.tick() => {}
            }

            let listing = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return StopReason::Cancelled,
                result = self.adapter.list(&self.options.query, &self.cancel) => result,
            };

            let listing = match listing {
                Ok(listing) => listing,
                Err(e) if e.is_cancelled() => return StopReason::Cancelled,
                Err(e) if e.is_retryable() || !self.options.stop_on_error => {
                    warn!(
                        kind = %self.adapter.kind(),
                        error = %e,
                        "watch poll failed, retrying next tick"
                    );
                    continue;
                }
                Err(e) => return StopReason::Failed(e),
            };

            if !seeded {
                self.seed(listing);
                seeded = true;
                debug!(
                    kind = %self.adapter.kind(),
                    observed = self.snapshot.len(),
                    "watch snapshot seeded"
                );
                continue;
            }

            let events = self.diff(listing);
            for event in events {
                if !self.wanted(&event) {
                    continue;
                }
                let sent = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return StopReason::Cancelled,
                    sent = self.tx.send(event) => sent,
                };
                if sent.is_err() {
                    return StopReason::ReceiverDropped;
                }
                self.emitted += 1;
                if self.options.max_events.map_or(false, |max| self.emitted >= max) {
                    return StopReason::MaxEvents;
                }
            }

            if self.watched_ids_retired() {
                return StopReason::WatchedIdsRetired;
            }
        }
    }

    fn seed(&mut self, listing: Vec<Resource>) {
        for resource in listing {
            self.note_terminal(&resource.id, resource.state.as_deref());
            self.snapshot.insert(resource.id, resource.state);
        }
    }

    /// Events for one listing, in listing order, then removals by identifier
    fn diff(&mut self, listing: Vec<Resource>) -> Vec<WatchEvent> {
        let kind = self.adapter.kind();
        let vocabulary = self.adapter.label_vocabulary();
        let now = SystemTime::now();
        let mut events = Vec::new();
        let mut present = HashSet::with_capacity(listing.len());

        for resource in listing {
            present.insert(resource.id.clone());
            self.note_terminal(&resource.id, resource.state.as_deref());
            let current = resource.state.clone();

            match self.snapshot.insert(resource.id.clone(), current.clone()) {
                None => events.push(WatchEvent {
                    label: EventLabel::Created,
                    kind,
                    id: resource.id.clone(),
                    previous_state: None,
                    current_state: current,
                    resource: Some(resource),
                    observed_at: now,
                }),
                Some(previous) if previous != current => events.push(WatchEvent {
                    label: vocabulary.label(kind, previous.as_deref(), current.as_deref()),
                    kind,
                    id: resource.id.clone(),
                    previous_state: previous,
                    current_state: current,
                    resource: Some(resource),
                    observed_at: now,
                }),
                Some(_) => {}
            }
        }

        let mut gone: Vec<String> = self
            .snapshot
            .keys()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();
        gone.sort();

        for id in gone {
            let previous = self.snapshot.remove(&id).flatten();
            let terminal = kind == ResourceKind::Jobs
                && previous.as_deref().map_or(false, is_terminal_job_state);
            if terminal {
                continue;
            }
            events.push(WatchEvent {
                label: EventLabel::Completed,
                kind,
                id,
                previous_state: previous,
                current_state: None,
                resource: None,
                observed_at: now,
            });
        }

        events
    }

    fn wanted(&self, event: &WatchEvent) -> bool {
        let id_ok = self.options.ids.as_ref().map_or(true, |ids| ids.contains(&event.id));
        let label_ok = self
            .options
            .labels
            .as_ref()
            .map_or(true, |labels| labels.contains(&event.label));
        id_ok && label_ok
    }

    fn note_terminal(&mut self, id: &str, state: Option<&str>) {
        let terminal =
            self.adapter.kind() == ResourceKind::Jobs && state.map_or(false, is_terminal_job_state);
        if terminal {
            self.finished.insert(id.to_string());
        }
    }

    /// Every filtered identifier reached a terminal state and then left the listing
    fn watched_ids_retired(&self) -> bool {
        match &self.options.ids {
            Some(ids) => ids
                .iter()
                .all(|id| self.finished.contains(id) && !self.snapshot.contains_key(id)),
            None => false,
        }
    }
}
