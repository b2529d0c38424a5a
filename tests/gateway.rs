//! Integration tests for the gateway over real HTTP
//!
//! The server is bound to an ephemeral port and driven with reqwest; the
//! scheduler, health prober and replicas are in-process doubles.

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::StatusCode;
use serde_json::{json, Value};
use tokio::time::sleep;

use hpcserve::server::{create_router, AppState};
use hpcserve::testkit::TestStack;

async fn spawn_gateway(stack: &TestStack) -> String {
    let app = create_router(AppState::new(stack.orchestrator.clone()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind gateway");
    let addr: SocketAddr = listener.local_addr().expect("Failed to get local address");

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give server time to start
    sleep(Duration::from_millis(50)).await;
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_deploy_route_and_stop_group() {
    let stack = TestStack::new();
    let base_url = spawn_gateway(&stack).await;
    let client = reqwest::Client::new();

    // Deploy three replicas
    let response = client
        .post(format!("{}/api/v1/services", base_url))
        .json(&json!({"recipe_name": "vllm", "replicas": 3}))
        .send()
        .await
        .expect("Failed to create services");
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    let group_id = body["group_id"].as_str().unwrap().to_string();
    let members: Vec<String> = body["members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(members.len(), 3);

    // Nothing is running yet
    let response = client
        .post(format!("{}/api/v1/vllm/{}/prompt", base_url, group_id))
        .json(&json!({"prompt": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "GROUP_UNAVAILABLE");

    for (i, id) in members.iter().enumerate() {
        stack.bring_up(id, &format!("gpu0{}", i + 1));
    }
    stack.settle().await;

    let body: Value = client
        .get(format!("{}/api/v1/service-groups/{}", base_url, group_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "running");
    assert_eq!(body["running"], 3);

    // Round-robin across the members
    let mut served = Vec::new();
    for _ in 0..3 {
        let response = client
            .post(format!("{}/api/v1/vllm/{}/chat", base_url, group_id))
            .header("x-request-id", "req-42")
            .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-request-id"], "req-42");
        served.push(
            response.headers()["x-served-by"]
                .to_str()
                .unwrap()
                .to_string(),
        );
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["path"], "/v1/chat/completions");
    }
    served.sort();
    assert_eq!(served, members);

    // Sticky sessions land on one member
    let mut sticky = Vec::new();
    for _ in 0..5 {
        let response = client
            .get(format!("{}/api/v1/vllm/{}/models", base_url, group_id))
            .header("x-session-id", "user-7")
            .send()
            .await
            .unwrap();
        sticky.push(
            response.headers()["x-served-by"]
                .to_str()
                .unwrap()
                .to_string(),
        );
    }
    sticky.dedup();
    assert_eq!(sticky.len(), 1);

    // Preferred stop keeps the records
    let response = client
        .post(format!("{}/api/v1/service-groups/{}/status", base_url, group_id))
        .json(&json!({"status": "cancelled"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = client
        .get(format!("{}/api/v1/services", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let services = body.as_array().unwrap();
    assert_eq!(services.len(), 3);
    assert!(services.iter().all(|s| s["status"] == "cancelled"));
}

#[tokio::test]
async fn test_single_service_and_legacy_delete() {
    let stack = TestStack::new();
    let base_url = spawn_gateway(&stack).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{}/api/v1/services", base_url))
        .json(&json!({"recipe_name": "qdrant"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = body["id"].as_str().unwrap().to_string();
    assert_eq!(body["kind"], "vector_db");

    stack.bring_up(&id, "cpu01");
    stack.settle().await;

    let response = client
        .post(format!(
            "{}/api/v1/vector-db/{}/collections/docs/points/search",
            base_url, id
        ))
        .json(&json!({"vector": [0.1, 0.2], "limit": 3}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-served-port"], "20000");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["path"], "/collections/docs/points/search");

    let response = client
        .delete(format!("{}/api/v1/services/{}", base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = client
        .get(format!("{}/api/v1/services/{}", base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "RECORD_NOT_FOUND");
}

#[tokio::test]
async fn test_delete_group_cancels_every_job() {
    let stack = TestStack::new();
    let base_url = spawn_gateway(&stack).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{}/api/v1/services", base_url))
        .json(&json!({"recipe_name": "vllm", "replicas": 3}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let group_id = body["group_id"].as_str().unwrap().to_string();
    let members: Vec<String> = body["members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap().to_string())
        .collect();

    // Two members up, one still queued
    stack.bring_up(&members[0], "gpu01");
    stack.bring_up(&members[1], "gpu02");
    stack.settle().await;
    assert_eq!(stack.scheduler.live_jobs().len(), 3);

    let response = client
        .delete(format!("{}/api/v1/service-groups/{}", base_url, group_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["removed"], true);

    assert!(stack.scheduler.live_jobs().is_empty());
    let mut cancelled = stack.scheduler.cancelled();
    cancelled.sort();
    assert_eq!(cancelled, members);

    let response = client
        .get(format!("{}/api/v1/service-groups/{}", base_url, group_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(stack.store.is_empty());
}

#[tokio::test]
async fn test_scheduler_outage_surfaces_as_503() {
    let stack = TestStack::new();
    let base_url = spawn_gateway(&stack).await;
    let client = reqwest::Client::new();
    stack.scheduler.set_unavailable(true);

    let response = client
        .post(format!("{}/api/v1/services", base_url))
        .json(&json!({"recipe_name": "vllm"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "SCHEDULER_UNAVAILABLE");
    assert!(stack.store.is_empty());
}
