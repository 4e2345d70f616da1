use backup_forge::integration_bridge::IntegrationBridge;
use backup_forge::resilience_core::BreakerManager;
use backup_forge::runtime_config::BridgeConfig;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Webhook server scenarios: the backup→gitops correlation flow over real
/// HTTP, plus bearer-token authentication levels.

async fn serve(config: BridgeConfig) -> (Arc<IntegrationBridge>, SocketAddr) {
    let bridge = IntegrationBridge::new(config, Arc::new(BreakerManager::new())).unwrap();
    bridge.clone().start_event_pump();
    let address = bridge.clone().start_server().await.unwrap();
    (bridge, address)
}

fn local_config() -> BridgeConfig {
    BridgeConfig {
        bind_address: "127.0.0.1".to_string(),
        bind_port: 0,
        debounce_secs: 1,
        ..BridgeConfig::default()
    }
}

fn backup_completed_envelope(backup_id: &str, success: bool) -> Value {
    json!({
        "id": "evt-1",
        "type": "backup.completed",
        "source": "backup-agent",
        "timestamp": chrono::Utc::now(),
        "data": {
            "backupId": backup_id,
            "clusterName": "prod-east",
            "success": success,
            "resourceCount": 42,
            "size": 123456,
            "objectPath": format!("backups/prod-east/2026/08/01/{backup_id}/manifest.json")
        }
    })
}

async fn status_json(client: &reqwest::Client, address: SocketAddr) -> Value {
    client
        .get(format!("http://{address}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_s5_backup_completed_drives_gitops_flow() {
    let (bridge, address) = serve(local_config()).await;
    let client = reqwest::Client::new();

    // Health endpoint answers
    let health: Value = client
        .get(format!("http://{address}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    // A successful backup arrives
    let response = client
        .post(format!("http://{address}/webhooks/backup/completed"))
        .json(&backup_completed_envelope("b1", true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    assert_eq!(response.json::<Value>().await.unwrap()["accepted"], true);

    // Before the debounce elapses, no generation request exists yet
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = status_json(&client, address).await;
    let premature = status["recent_events"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["type"] == "gitops.generation.requested");
    assert!(!premature, "generation must wait out the debounce");

    // After the debounce the request is published, correlated by backup id
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let status = status_json(&client, address).await;
    let request = status["recent_events"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["type"] == "gitops.generation.requested")
        .expect("generation request published")
        .clone();
    assert_eq!(request["data"]["backup_id"], "b1");
    let request_id = request["data"]["request_id"].as_str().unwrap().to_string();

    // The generator reports completion; the correlation closes
    let response = client
        .post(format!("http://{address}/webhooks/gitops/completed"))
        .json(&json!({
            "id": "evt-2",
            "type": "gitops.completed",
            "source": "gitops-generator",
            "data": {
                "requestId": request_id,
                "backupId": "b1",
                "status": "completed",
                "filesGenerated": 42,
                "filesCommitted": 42,
                "gitCommitHash": "deadbeef",
                "durationSeconds": 3.5
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let status = status_json(&client, address).await;
    assert_eq!(status["metrics"]["flow_success"], 1);
    assert_eq!(bridge.flow_success_count(), 1);
    println!("✅ S5: backup→gitops flow closed, flow_success incremented");

    // A duplicate of the same backup.completed is suppressed by dedup
    let response = client
        .post(format!("http://{address}/webhooks/backup/completed"))
        .json(&backup_completed_envelope("b1", true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let status = status_json(&client, address).await;
    let request_count = status["recent_events"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|e| e["type"] == "gitops.generation.requested")
        .count();
    assert_eq!(request_count, 1, "duplicate completion must not re-trigger");

    bridge.shutdown();
}

#[tokio::test]
async fn test_failed_backup_never_triggers_generation() {
    let (bridge, address) = serve(BridgeConfig {
        debounce_secs: 0,
        ..local_config()
    })
    .await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{address}/webhooks/backup/completed"))
        .json(&backup_completed_envelope("b-bad", false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = status_json(&client, address).await;
    assert!(!status["recent_events"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["type"] == "gitops.generation.requested"));

    bridge.shutdown();
}

#[tokio::test]
async fn test_component_registration_endpoints() {
    let (bridge, address) = serve(local_config()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{address}/register/gitops"))
        .json(&json!({"endpoint": "http://gitops-generator:9000", "version": "2.1.0"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert!(body["id"].as_str().is_some());

    // Unknown component kinds are rejected
    let response = client
        .post(format!("http://{address}/register/dashboard"))
        .json(&json!({"endpoint": "http://dashboard:3000", "version": "1.0"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let status = status_json(&client, address).await;
    assert_eq!(status["components"].as_array().unwrap().len(), 1);

    bridge.shutdown();
}

#[tokio::test]
async fn test_bearer_authentication_levels() {
    let (bridge, address) = serve(BridgeConfig {
        auth_token: Some("admin-secret".to_string()),
        viewer_token: Some("viewer-secret".to_string()),
        ..local_config()
    })
    .await;
    let client = reqwest::Client::new();

    // Missing token
    let response = client
        .get(format!("http://{address}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Invalid token
    let response = client
        .get(format!("http://{address}/health"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Viewer token reads but cannot write
    let response = client
        .get(format!("http://{address}/status"))
        .bearer_auth("viewer-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .post(format!("http://{address}/register/backup"))
        .bearer_auth("viewer-secret")
        .json(&json!({"endpoint": "http://agent:8080", "version": "1.0"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // Admin token writes
    let response = client
        .post(format!("http://{address}/register/backup"))
        .bearer_auth("admin-secret")
        .json(&json!({"endpoint": "http://agent:8080", "version": "1.0"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    bridge.shutdown();
}
