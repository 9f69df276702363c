//! Middleware chain, metrics and circuit breaker over real HTTP

mod common;

use common::{fast_backoff, ok_json, MockSlurm};
use serde_json::json;
use slurm_client::{
    CancellationToken, CircuitBreakerConfig, CircuitState, ClientError, HeaderMiddleware,
    MetricsCollector, NoRetry, RequestIdMiddleware, REQUEST_ID_HEADER,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use wiremock::ResponseTemplate;

const PING_V42: &str = "/slurm/v0.0.42/ping";

async fn header_values(mock: &MockSlurm, name: &str) -> Vec<Vec<String>> {
    mock.server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == PING_V42)
        .map(|r| {
            r.headers
                .get_all(name)
                .iter()
                .map(|v| v.to_str().unwrap().to_string())
                .collect()
        })
        .collect()
}

#[tokio::test]
async fn test_caller_user_agent_replaces_default() {
    let mock = MockSlurm::start().await;
    mock.fallback("GET", PING_V42, ok_json(json!({"pings": []}))).await;

    let headers = HeaderMiddleware::new()
        .with_header("User-Agent", "batch-submitter/2.1")
        .unwrap()
        .with_header("X-Cluster", "alpha")
        .unwrap();
    let factory = mock.builder().middleware(headers).build().unwrap();
    let cancel = CancellationToken::new();
    let client = factory.new_client_with_version("v0.0.42", &cancel).await.unwrap();
    client.ping(&cancel).await.unwrap();

    assert_eq!(header_values(&mock, "user-agent").await, vec![vec!["batch-submitter/2.1"]]);
    assert_eq!(header_values(&mock, "x-cluster").await, vec![vec!["alpha"]]);
}

#[tokio::test]
async fn test_configured_user_agent_sent_once() {
    let mock = MockSlurm::start().await;
    mock.fallback("GET", PING_V42, ok_json(json!({"pings": []}))).await;

    let factory = mock.builder().user_agent("ops-dashboard/1.0").build().unwrap();
    let cancel = CancellationToken::new();
    let client = factory.new_client_with_version("v0.0.42", &cancel).await.unwrap();
    client.ping(&cancel).await.unwrap();

    assert_eq!(header_values(&mock, "user-agent").await, vec![vec!["ops-dashboard/1.0"]]);
}

#[tokio::test]
async fn test_each_attempt_gets_its_own_request_id() {
    let mock = MockSlurm::start().await;
    mock.sequence(
        "GET",
        PING_V42,
        vec![
            ResponseTemplate::new(503),
            ResponseTemplate::new(503),
            ok_json(json!({"pings": []})),
        ],
    )
    .await;

    let factory = mock
        .builder()
        .retry_policy(fast_backoff(3))
        .middleware(RequestIdMiddleware::new())
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    let client = factory.new_client_with_version("v0.0.42", &cancel).await.unwrap();
    client.ping(&cancel).await.unwrap();

    let ids = header_values(&mock, REQUEST_ID_HEADER).await;
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|values| values.len() == 1));
    let distinct: HashSet<_> = ids.into_iter().flatten().collect();
    assert_eq!(distinct.len(), 3);
}

#[tokio::test]
async fn test_metrics_count_every_attempt() {
    let mock = MockSlurm::start().await;
    mock.sequence(
        "GET",
        PING_V42,
        vec![ResponseTemplate::new(503), ok_json(json!({"pings": []}))],
    )
    .await;

    let collector = Arc::new(MetricsCollector::new());
    let factory = mock
        .builder()
        .retry_policy(fast_backoff(3))
        .metrics(collector.clone())
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    let client = factory.new_client_with_version("v0.0.42", &cancel).await.unwrap();
    client.ping(&cancel).await.unwrap();

    let snapshot = collector.snapshot();
    assert_eq!(snapshot.total_requests, 2);
    assert_eq!(snapshot.total_responses, 2);
    assert_eq!(snapshot.total_errors, 0);
    assert_eq!(snapshot.requests_by_path["GET /slurm/v0.0.42/ping"], 2);
    assert_eq!(snapshot.responses_by_status[&503], 1);
    assert_eq!(snapshot.responses_by_status[&200], 1);
    assert_eq!(snapshot.response_time.count, 2);
}

#[tokio::test]
async fn test_metrics_record_transport_errors() {
    let collector = Arc::new(MetricsCollector::new());
    let factory = slurm_client::ClientFactoryBuilder::new("http://127.0.0.1:1")
        .retry_policy(NoRetry)
        .metrics(collector.clone())
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    let client = factory.new_client_with_version("v0.0.42", &cancel).await.unwrap();
    assert!(client.ping(&cancel).await.is_err());

    let snapshot = collector.snapshot();
    assert_eq!(snapshot.total_requests, 1);
    assert_eq!(snapshot.total_errors, 1);
    assert_eq!(snapshot.errors_by_type["transport"], 1);
}

#[tokio::test]
async fn test_circuit_breaker_opens_and_recovers() {
    let mock = MockSlurm::start().await;
    mock.sequence("GET", PING_V42, vec![ResponseTemplate::new(503), ResponseTemplate::new(503)])
        .await;
    mock.fallback("GET", PING_V42, ok_json(json!({"pings": []}))).await;

    let factory = mock
        .builder()
        .retry_policy(NoRetry)
        .circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(100),
        })
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    let client = factory.new_client_with_version("v0.0.42", &cancel).await.unwrap();
    assert_eq!(factory.circuit_state(), Some(CircuitState::Closed));

    assert_eq!(client.ping(&cancel).await.unwrap_err().http_status(), Some(503));
    assert_eq!(client.ping(&cancel).await.unwrap_err().http_status(), Some(503));
    assert_eq!(factory.circuit_state(), Some(CircuitState::Open));

    let err = client.ping(&cancel).await.unwrap_err();
    assert!(matches!(err, ClientError::CircuitOpen { ref operation } if operation == "ping"));
    assert_eq!(mock.request_count(PING_V42).await, 2);

    tokio::time::sleep(Duration::from_millis(150)).await;
    client.ping(&cancel).await.unwrap();
    assert_eq!(factory.circuit_state(), Some(CircuitState::Closed));
    assert_eq!(mock.request_count(PING_V42).await, 3);
}

#[tokio::test]
async fn test_zero_failure_threshold_rejected() {
    let mock = MockSlurm::start().await;
    let err = mock
        .builder()
        .circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 0,
            recovery_timeout: Duration::from_secs(1),
        })
        .build()
        .unwrap_err();
    assert!(matches!(err, ClientError::Config { ref field, .. }
        if field == "circuit_breaker.failure_threshold"));
}
