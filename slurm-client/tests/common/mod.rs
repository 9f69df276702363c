//! Mock slurmrestd shared by the integration tests

#![allow(dead_code)]

use serde_json::{json, Value};
use slurm_client::{ClientFactoryBuilder, ExponentialBackoff};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const DISCOVERY_PATH: &str = "/openapi/v3";

pub struct MockSlurm {
    pub server: MockServer,
}

impl MockSlurm {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Factory builder pointed at this server with millisecond retry waits
    pub fn builder(&self) -> ClientFactoryBuilder {
        ClientFactoryBuilder::new(self.uri())
            .timeout(Duration::from_secs(2))
            .discovery_timeout(Duration::from_secs(2))
            .retry_policy(fast_backoff(3))
    }

    /// Discovery document, served to exactly `expected` requests
    pub async fn discovery(&self, document: Value, expected: u64) {
        Mock::given(method("GET"))
            .and(path(DISCOVERY_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(document))
            .expect(expected)
            .mount(&self.server)
            .await;
    }

    /// Discovery endpoint that must never be called
    pub async fn no_discovery(&self) {
        Mock::given(method("GET"))
            .and(path(DISCOVERY_PATH))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&self.server)
            .await;
    }

    /// One response per request, in order
    pub async fn sequence(&self, verb: &str, route: &str, responses: Vec<ResponseTemplate>) {
        for response in responses {
            Mock::given(method(verb))
                .and(path(route))
                .respond_with(response)
                .up_to_n_times(1)
                .expect(1)
                .mount(&self.server)
                .await;
        }
    }

    /// Response used once every earlier mock on the route is exhausted
    pub async fn fallback(&self, verb: &str, route: &str, response: ResponseTemplate) {
        Mock::given(method(verb))
            .and(path(route))
            .respond_with(response)
            .with_priority(10)
            .mount(&self.server)
            .await;
    }

    pub async fn request_count(&self, route: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == route)
            .count()
    }
}

pub fn fast_backoff(max_retries: u32) -> ExponentialBackoff {
    ExponentialBackoff::new()
        .with_min_wait(Duration::from_millis(5))
        .with_max_wait(Duration::from_millis(20))
        .with_max_retries(max_retries)
}

pub fn ok_json(body: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(body)
}

/// `GET /slurm/<v>/jobs` body for `(job_id, state)` pairs
pub fn jobs_listing(jobs: &[(u64, &str)]) -> Value {
    let jobs: Vec<Value> = jobs
        .iter()
        .map(|(id, state)| {
            json!({"job_id": id, "name": format!("job-{}", id), "job_state": [state]})
        })
        .collect();
    json!({"jobs": jobs, "errors": [], "warnings": []})
}
