//! Request metrics
//!
//! A [`MetricsCollector`] is fed by [`MetricsMiddleware`](crate::middleware::MetricsMiddleware)
//! once per wire attempt. Counters are atomics keyed through `DashMap`, so the
//! collector can be shared by every client of a factory without locking.

use crate::error::ClientError;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Aggregated latency of a set of responses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DurationStats {
    pub count: u64,
    pub total_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: u64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_ms: u64,
    pub total_requests: u64,
    pub total_responses: u64,
    pub total_errors: u64,
    /// Keyed by `"METHOD /path"`
    pub requests_by_path: BTreeMap<String, u64>,
    pub responses_by_status: BTreeMap<u16, u64>,
    pub errors_by_type: BTreeMap<String, u64>,
    pub response_time: DurationStats,
    pub response_time_by_path: BTreeMap<String, DurationStats>,
}

impl MetricsSnapshot {
    /// Responses with a 2xx status over all finished attempts
    pub fn success_ratio(&self) -> f64 {
        let finished = self.total_responses + self.total_errors;
        if finished == 0 {
            return 0.0;
        }
        let ok: u64 = self
            .responses_by_status
            .range(200..300)
            .map(|(_, count)| count)
            .sum();
        ok as f64 / finished as f64
    }
}

#[derive(Debug)]
struct DurationAggregator {
    count: AtomicU64,
    total_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl Default for DurationAggregator {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
        }
    }
}

impl DurationAggregator {
    fn add(&self, duration: Duration) {
        let ms = duration.as_millis().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn stats(&self) -> DurationStats {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return DurationStats::default();
        }
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        DurationStats {
            count,
            total_ms,
            min_ms: self.min_ms.load(Ordering::Relaxed),
            max_ms: self.max_ms.load(Ordering::Relaxed),
            avg_ms: total_ms / count,
        }
    }
}

/// Lock-free request, response and error counters
#[derive(Debug)]
pub struct MetricsCollector {
    start_time: Instant,
    total_requests: AtomicU64,
    total_responses: AtomicU64,
    total_errors: AtomicU64,
    requests_by_path: DashMap<String, AtomicU64>,
    responses_by_status: DashMap<u16, AtomicU64>,
    errors_by_type: DashMap<&'static str, AtomicU64>,
    response_time: DurationAggregator,
    response_time_by_path: DashMap<String, DurationAggregator>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_requests: AtomicU64::new(0),
            total_responses: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            requests_by_path: DashMap::new(),
            responses_by_status: DashMap::new(),
            errors_by_type: DashMap::new(),
            response_time: DurationAggregator::default(),
            response_time_by_path: DashMap::new(),
        }
    }

    pub fn record_request(&self, method: &str, path: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        increment(&self.requests_by_path, route_key(method, path));
    }

    pub fn record_response(&self, method: &str, path: &str, status: u16, duration: Duration) {
        self.total_responses.fetch_add(1, Ordering::Relaxed);
        increment(&self.responses_by_status, status);
        self.response_time.add(duration);
        self.response_time_by_path
            .entry(route_key(method, path))
            .or_default()
            .add(duration);
    }

    pub fn record_error(&self, error: &ClientError) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        increment(&self.errors_by_type, error_type(error));
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_ms: self.start_time.elapsed().as_millis().min(u64::MAX as u128) as u64,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_responses: self.total_responses.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            requests_by_path: copy_counters(&self.requests_by_path, |k| k.clone()),
            responses_by_status: copy_counters(&self.responses_by_status, |k| *k),
            errors_by_type: copy_counters(&self.errors_by_type, |k| k.to_string()),
            response_time: self.response_time.stats(),
            response_time_by_path: self
                .response_time_by_path
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().stats()))
                .collect(),
        }
    }

    /// Clear every counter; uptime keeps counting from construction
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.total_responses.store(0, Ordering::Relaxed);
        self.total_errors.store(0, Ordering::Relaxed);
        self.requests_by_path.clear();
        self.responses_by_status.clear();
        self.errors_by_type.clear();
        self.response_time_by_path.clear();
        self.response_time.count.store(0, Ordering::Relaxed);
        self.response_time.total_ms.store(0, Ordering::Relaxed);
        self.response_time.min_ms.store(u64::MAX, Ordering::Relaxed);
        self.response_time.max_ms.store(0, Ordering::Relaxed);
    }
}

fn route_key(method: &str, path: &str) -> String {
    format!("{} {}", method, path)
}

fn increment<K>(map: &DashMap<K, AtomicU64>, key: K)
where
    K: Eq + std::hash::Hash,
{
    map.entry(key).or_default().fetch_add(1, Ordering::Relaxed);
}

fn copy_counters<K, T, F>(map: &DashMap<K, AtomicU64>, key: F) -> BTreeMap<T, u64>
where
    K: Eq + std::hash::Hash,
    T: Ord,
    F: Fn(&K) -> T,
{
    map.iter()
        .map(|entry| (key(entry.key()), entry.value().load(Ordering::Relaxed)))
        .collect()
}

fn error_type(error: &ClientError) -> &'static str {
    match error {
        ClientError::Api(_) => "api",
        ClientError::Transport { .. } => "transport",
        ClientError::Cancelled { .. } => "cancelled",
        ClientError::CircuitOpen { .. } => "circuit_open",
        ClientError::InvalidArgument { .. } => "invalid_argument",
        ClientError::NotInitialized { .. } => "not_initialized",
        ClientError::Unsupported { .. } => "unsupported",
        ClientError::Config { .. } => "config",
        ClientError::InvalidResponse { .. } => "invalid_response",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_requests_responses_and_errors() {
        let metrics = MetricsCollector::new();
        metrics.record_request("GET", "/slurm/v0.0.42/jobs");
        metrics.record_request("GET", "/slurm/v0.0.42/jobs");
        metrics.record_request("GET", "/slurm/v0.0.42/ping");
        metrics.record_response("GET", "/slurm/v0.0.42/jobs", 200, Duration::from_millis(10));
        metrics.record_response("GET", "/slurm/v0.0.42/jobs", 503, Duration::from_millis(30));
        metrics.record_error(&ClientError::transport("ping", "connection refused"));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.total_responses, 2);
        assert_eq!(snapshot.total_errors, 1);
        assert_eq!(snapshot.requests_by_path["GET /slurm/v0.0.42/jobs"], 2);
        assert_eq!(snapshot.responses_by_status[&200], 1);
        assert_eq!(snapshot.responses_by_status[&503], 1);
        assert_eq!(snapshot.errors_by_type["transport"], 1);

        let jobs = &snapshot.response_time_by_path["GET /slurm/v0.0.42/jobs"];
        assert_eq!(jobs.count, 2);
        assert_eq!(jobs.min_ms, 10);
        assert_eq!(jobs.max_ms, 30);
        assert_eq!(jobs.avg_ms, 20);
        assert!((snapshot.success_ratio() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_and_reset() {
        let metrics = MetricsCollector::new();
        assert_eq!(metrics.snapshot().response_time, DurationStats::default());
        assert_eq!(metrics.snapshot().success_ratio(), 0.0);

        metrics.record_request("POST", "/slurm/v0.0.44/job/submit");
        metrics.record_response("POST", "/slurm/v0.0.44/job/submit", 200, Duration::from_millis(5));
        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert!(snapshot.requests_by_path.is_empty());
        assert_eq!(snapshot.response_time, DurationStats::default());

        metrics.record_response("GET", "/x", 200, Duration::from_millis(7));
        assert_eq!(metrics.snapshot().response_time.min_ms, 7);
    }
}
