//! End-to-end tests for work distribution
//!
//! Tests claiming, lease renewal, reclamation of abandoned jobs, bans and
//! the non-mutating peek.

mod common;

use common::{
    TestClient, TestServer, INSTANCE_PREFIX, MAX_HEARTBEAT_AGE_SECS, START_TIME,
};
use reqwest::StatusCode;
use serde_json::Value;

const LEASE: i64 = MAX_HEARTBEAT_AGE_SECS as i64;

// =============================================================================
// Claiming
// =============================================================================

#[tokio::test]
async fn test_empty_queue_returns_empty_list() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());

    assert!(client.get_work_list(Some("m1")).await.is_empty());
    assert!(client.get_work_list(None).await.is_empty());
}

#[tokio::test]
async fn test_claim_starts_oldest_pending_job() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());
    let first = client.create_job_id("a/").await;
    server.advance_clock(5);
    let second = client.create_job_id("b/").await;

    let work = client.get_work_list(Some("m1")).await;

    assert_eq!(work.len(), 1);
    assert_eq!(work[0]["id"], first);
    assert_eq!(work[0]["status"], "running");
    assert_eq!(work[0]["started_at"], START_TIME + 5);
    assert_eq!(work[0]["last_heartbeat"], START_TIME + 5);
    assert_eq!(work[0]["resume_from"], Value::Null);

    let work = client.get_work_list(Some("m2")).await;
    assert_eq!(work[0]["id"], second);
    assert!(client.get_work_list(Some("m3")).await.is_empty());

    assert_eq!(client.event_types(&first).await, vec!["created", "started"]);
}

#[tokio::test]
async fn test_work_lists_training_inputs() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());
    let images = server.seed_instance_images(3);
    client.create_job_id(INSTANCE_PREFIX).await;

    let work = client.get_work_list(Some("m1")).await;

    let keys: Vec<&str> = work[0]["instance_data_keys"]
        .as_array()
        .unwrap()
        .iter()
        .map(|k| k.as_str().unwrap())
        .collect();
    assert_eq!(keys, images);
    // No class prefix, so no class keys
    assert!(work[0].get("class_data_keys").is_none());
}

#[tokio::test]
async fn test_concurrent_polls_claim_job_once() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());
    let id = client.create_job_id("dogs/").await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let client = TestClient::new(server.base_url.clone());
            tokio::spawn(async move { client.get_work_list(Some(&format!("m{}", i))).await })
        })
        .collect();

    let mut claimed = Vec::new();
    for handle in handles {
        claimed.extend(handle.await.unwrap());
    }

    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0]["id"], id);
    assert_eq!(client.event_types(&id).await, vec!["created", "started"]);
}

// =============================================================================
// Leases
// =============================================================================

#[tokio::test]
async fn test_heartbeat_keeps_job_leased() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());
    let id = client.create_job_id("dogs/").await;
    client.get_work_list(Some("m1")).await;

    server.advance_clock(LEASE - 10);
    let response = client.heartbeat(&id, "m1").await;
    assert_eq!(response.status(), StatusCode::OK);

    // Past the original lease, but the heartbeat renewed it
    server.advance_clock(20);
    assert!(client.get_work_list(Some("m2")).await.is_empty());

    let job = client.get_job_json(&id).await;
    assert_eq!(job["last_heartbeat"], START_TIME + LEASE - 10);
    assert_eq!(
        client.event_types(&id).await,
        vec!["created", "started", "heartbeat"]
    );
}

#[tokio::test]
async fn test_heartbeat_on_pending_job_is_rejected() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());
    let id = client.create_job_id("dogs/").await;

    let response = client.heartbeat(&id, "m1").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("not running"));
}

#[tokio::test]
async fn test_heartbeat_on_unknown_job_returns_404() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());

    assert_eq!(
        client.heartbeat("nonexistent-job", "m1").await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_abandoned_job_is_reclaimed_before_pending_work() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());
    let stalled = client.create_job_id("a/").await;
    client.get_work_list(Some("m1")).await;
    let checkpoint = server.upload_checkpoint(&stalled, "step-400.safetensors", 1_000);
    server.advance_clock(1);
    let fresh = client.create_job_id("b/").await;

    server.advance_clock(LEASE);
    let work = client.get_work_list(Some("m2")).await;

    assert_eq!(work[0]["id"], stalled);
    assert_eq!(work[0]["status"], "running");
    assert_eq!(work[0]["started_at"], START_TIME);
    assert_eq!(work[0]["last_heartbeat"], server.now());
    assert_eq!(work[0]["resume_from"], checkpoint);
    assert_eq!(
        client.event_types(&stalled).await,
        vec!["created", "started", "heartbeat"]
    );

    let work = client.get_work_list(Some("m3")).await;
    assert_eq!(work[0]["id"], fresh);
}

#[tokio::test]
async fn test_most_overdue_job_is_reclaimed_first() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());
    let older = client.create_job_id("a/").await;
    server.advance_clock(1);
    let newer = client.create_job_id("b/").await;
    client.get_work_list(Some("m1")).await;
    client.get_work_list(Some("m2")).await;
    server.advance_clock(10);
    client.heartbeat(&newer, "m2").await;
    client.heartbeat(&older, "m1").await;
    server.advance_clock(1);
    client.heartbeat(&older, "m1").await;

    server.advance_clock(LEASE + 5);
    let work = client.get_work_list(Some("m3")).await;

    assert_eq!(work[0]["id"], newer);
}

#[tokio::test]
async fn test_resume_from_is_newest_checkpoint() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());
    let id = client.create_job_id("dogs/").await;
    client.get_work_list(Some("m1")).await;
    server.upload_checkpoint(&id, "step-100", 100);
    let newest = server.upload_checkpoint(&id, "step-300", 300);
    server.upload_checkpoint(&id, "step-200", 200);

    server.advance_clock(LEASE + 1);
    let work = client.get_work_list(Some("m2")).await;

    assert_eq!(work[0]["resume_from"], newest);
}

// =============================================================================
// Bans
// =============================================================================

#[tokio::test]
async fn test_failed_worker_is_not_offered_same_job() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());
    let id = client.create_job_id("dogs/").await;
    client.get_work_list(Some("m1")).await;
    assert_eq!(
        client.report_failure(&id, "m1").await.status(),
        StatusCode::OK
    );
    server.advance_clock(1);
    let other = client.create_job_id("cats/").await;

    server.advance_clock(LEASE + 1);

    // The abandoned job is the top candidate, but m1 is banned from it
    let work = client.get_work_list(Some("m1")).await;
    assert_eq!(work[0]["id"], other);

    // m2 may still take it
    let work = client.get_work_list(Some("m2")).await;
    assert_eq!(work[0]["id"], id);
}

// =============================================================================
// Peek
// =============================================================================

#[tokio::test]
async fn test_peek_does_not_claim() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());
    let id = client.create_job_id("dogs/").await;

    for _ in 0..3 {
        let peeked = client.peek_work().await;
        assert_eq!(peeked.len(), 1);
        assert_eq!(peeked[0]["id"], id);
        assert_eq!(peeked[0]["status"], "pending");
    }

    let job = client.get_job_json(&id).await;
    assert_eq!(job["status"], "pending");
    assert_eq!(job["last_heartbeat"], Value::Null);
    assert_eq!(client.event_types(&id).await, vec!["created"]);

    // Still claimable afterwards
    assert_eq!(client.get_work_list(Some("m1")).await[0]["id"], id);
    assert!(client.peek_work().await.is_empty());
}
