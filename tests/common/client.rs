//! HTTP client for end-to-end tests
//!
//! This module provides a high-level HTTP client that wraps reqwest
//! and provides methods for all dispatch endpoints.
//!
//! When API routes or request formats change, update only this file.

use super::constants::*;
use reqwest::Response;
use serde_json::{json, Value};
use std::time::Duration;

/// HTTP test client
pub struct TestClient {
    /// The underlying reqwest client (public for custom requests in tests)
    pub client: reqwest::Client,
    /// The base URL of the test server
    pub base_url: String,
}

impl TestClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build reqwest client");

        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // ========================================================================
    // Job Endpoints
    // ========================================================================

    /// POST /job with only the required field set
    pub async fn create_job(&self, instance_data_prefix: &str) -> Response {
        self.create_job_with(json!({ "instance_data_prefix": instance_data_prefix }))
            .await
    }

    /// POST /job with an arbitrary body
    pub async fn create_job_with(&self, body: Value) -> Response {
        self.client
            .post(self.url("/job"))
            .json(&body)
            .send()
            .await
            .expect("Create job request failed")
    }

    /// Creates a job and returns its id, panicking if creation fails
    pub async fn create_job_id(&self, instance_data_prefix: &str) -> String {
        let response = self.create_job(instance_data_prefix).await;
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        let job: Value = response.json().await.expect("Job is not JSON");
        job["id"].as_str().expect("Job has no id").to_string()
    }

    /// GET /jobs, optionally filtered by status
    pub async fn list_jobs(&self, status: Option<&str>) -> Response {
        let mut request = self.client.get(self.url("/jobs"));
        if let Some(status) = status {
            request = request.query(&[("status", status)]);
        }
        request.send().await.expect("List jobs request failed")
    }

    /// GET /job/{id}
    pub async fn get_job(&self, id: &str) -> Response {
        self.client
            .get(self.url(&format!("/job/{}", id)))
            .send()
            .await
            .expect("Get job request failed")
    }

    /// GET /job/{id} and parse the body
    pub async fn get_job_json(&self, id: &str) -> Value {
        let response = self.get_job(id).await;
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        response.json().await.expect("Job is not JSON")
    }

    /// POST /job/{id}/stop
    pub async fn stop_job(&self, id: &str) -> Response {
        self.client
            .post(self.url(&format!("/job/{}/stop", id)))
            .send()
            .await
            .expect("Stop job request failed")
    }

    /// GET /job/{id}/events
    pub async fn get_events(&self, id: &str) -> Response {
        self.client
            .get(self.url(&format!("/job/{}/events", id)))
            .send()
            .await
            .expect("Get events request failed")
    }

    /// Event types of a job, oldest first
    pub async fn event_types(&self, id: &str) -> Vec<String> {
        let response = self.get_events(id).await;
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let events: Vec<Value> = response.json().await.expect("Events are not JSON");
        events
            .iter()
            .map(|e| e["event_type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    // ========================================================================
    // Worker Endpoints
    // ========================================================================

    /// GET /work as the given machine
    pub async fn get_work(&self, machine_id: Option<&str>) -> Response {
        let mut request = self.client.get(self.url("/work"));
        if let Some(machine_id) = machine_id {
            request = request.query(&[("machine_id", machine_id)]);
        }
        request.send().await.expect("Get work request failed")
    }

    /// GET /work and parse the returned list
    pub async fn get_work_list(&self, machine_id: Option<&str>) -> Vec<Value> {
        let response = self.get_work(machine_id).await;
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        response.json().await.expect("Work is not JSON")
    }

    /// GET /work/peek
    pub async fn peek_work(&self) -> Vec<Value> {
        let response = self
            .client
            .get(self.url("/work/peek"))
            .send()
            .await
            .expect("Peek work request failed");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        response.json().await.expect("Work is not JSON")
    }

    /// POST /heartbeat/{id}
    pub async fn heartbeat(&self, id: &str, machine_id: &str) -> Response {
        self.client
            .post(self.url(&format!("/heartbeat/{}", id)))
            .query(&[("machine_id", machine_id)])
            .send()
            .await
            .expect("Heartbeat request failed")
    }

    // ========================================================================
    // Webhooks
    // ========================================================================

    async fn webhook(&self, path: &str, body: Value) -> Response {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("Webhook request failed")
    }

    /// POST /progress for a freshly uploaded checkpoint
    pub async fn report_progress(&self, job_id: &str, key: &str) -> Response {
        self.webhook(
            "/progress",
            json!({
                "job_id": job_id,
                "bucket_name": CHECKPOINT_BUCKET,
                "key": key,
            }),
        )
        .await
    }

    /// POST /complete pointing at the final model
    pub async fn report_complete(&self, job_id: &str, bucket: &str, key: &str) -> Response {
        self.webhook(
            "/complete",
            json!({
                "job_id": job_id,
                "bucket_name": bucket,
                "key": key,
                "machine_id": "finisher",
            }),
        )
        .await
    }

    /// POST /fail from the given machine
    pub async fn report_failure(&self, job_id: &str, machine_id: &str) -> Response {
        self.webhook(
            "/fail",
            json!({
                "job_id": job_id,
                "machine_id": machine_id,
            }),
        )
        .await
    }

    // ========================================================================
    // Misc
    // ========================================================================

    /// GET /
    pub async fn home(&self) -> Response {
        self.client
            .get(self.url("/"))
            .send()
            .await
            .expect("Home request failed")
    }

    /// GET on any path
    pub async fn get_raw(&self, path: &str) -> Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("Request failed")
    }
}
