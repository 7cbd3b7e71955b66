//! 云端配置同步测试：本地 TCP 端口模拟云端接口

use pi_node_agent::config::{ConfigError, SYNC_BACKOFF_AFTER, SYNC_BACKOFF_FACTOR};
use pi_node_agent::{AgentConfig, AgentMetrics, ConfigEvent, ConfigPaths, ConfigStore};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// 对每个连接返回同一个响应，并把请求头转发给测试
async fn serve(status: u16, body: Value) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let payload = body.to_string();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap_or(0);
            let _ = tx.send(String::from_utf8_lossy(&buf[..n]).into_owned());

            let response = format!(
                "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                payload.len(),
                payload
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{}", addr), rx)
}

fn store_for(dir: &TempDir, api_url: &str) -> ConfigStore {
    let mut config = AgentConfig::default();
    config.cloud.api_url = api_url.to_string();
    config.cloud.device_id = "pi-test-01".to_string();
    config.auth.api_key = "sync-test-key-123".to_string();
    ConfigStore::from_config(
        ConfigPaths::new(dir.path()),
        config,
        Arc::new(AgentMetrics::new()),
    )
}

#[tokio::test]
async fn test_sync_merges_cloud_configuration() {
    // Given: 云端下发新的抽帧质量
    let (url, mut requests) = serve(
        200,
        json!({"configuration": {"snapshot": {"quality": 5}, "thresholds": {"memory": {"warning": 75}}}}),
    )
    .await;
    let dir = TempDir::new().unwrap();
    let store = store_for(&dir, &url);
    let mut events = store.subscribe();

    // When
    let config = store.sync_with_cloud().await.unwrap();

    // Then: 合并生效，其余字段保持
    assert_eq!(config.snapshot.quality, 5);
    assert_eq!(config.thresholds.memory.warning, 75.0);
    assert_eq!(config.thresholds.memory.critical, 90.0);
    assert_eq!(store.get_config().snapshot.quality, 5);

    // 请求带设备身份
    let request = requests.recv().await.unwrap();
    assert!(request.starts_with("GET /api/devices/pi-test-01/config"));
    let lower = request.to_lowercase();
    assert!(lower.contains("authorization: bearer sync-test-key-123"));
    assert!(lower.contains("x-device-id: pi-test-01"));

    // 落盘：本地配置与云端缓存
    let local: Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("local.json")).unwrap()).unwrap();
    assert_eq!(local["snapshot"]["quality"], 5);
    assert!(dir.path().join("cloud.json").exists());

    let status = store.status();
    assert!(status.last_sync_time.is_some());
    assert_eq!(status.sync_errors, 0);

    // 抽帧参数变化需要重启采集
    match events.recv().await.unwrap() {
        event @ ConfigEvent::Synced { .. } => assert!(event.requires_capture_restart()),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_sync_failure_keeps_config_and_counts() {
    // Given: 云端返回 500
    let (url, _requests) = serve(500, json!({"error": "boom"})).await;
    let dir = TempDir::new().unwrap();
    let store = store_for(&dir, &url);
    let before = store.get_config();
    let mut events = store.subscribe();

    // When
    let err = store.sync_with_cloud().await.unwrap_err();

    // Then
    assert!(matches!(err, ConfigError::Cloud(_)));
    assert_eq!(store.get_config().snapshot, before.snapshot);
    assert_eq!(store.status().sync_errors, 1);
    assert!(matches!(events.recv().await.unwrap(), ConfigEvent::SyncError(_)));
    assert!(!dir.path().join("local.json").exists());
}

#[tokio::test]
async fn test_sync_rejects_missing_or_invalid_configuration() {
    // Given: 响应缺少 configuration 字段
    let (url, _requests) = serve(200, json!({"device": "pi-test-01"})).await;
    let dir = TempDir::new().unwrap();
    let store = store_for(&dir, &url);

    // Then
    assert!(store.sync_with_cloud().await.is_err());

    // Given: configuration 字段值越界
    let (url, _requests) = serve(200, json!({"configuration": {"snapshot": {"quality": 99}}})).await;
    let store = store_for(&dir, &url);

    // Then: 校验失败，旧配置保留
    let err = store.sync_with_cloud().await.unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
    assert_eq!(store.get_config().snapshot.quality, 3);
}

#[tokio::test]
async fn test_repeated_failures_slow_down_sync() {
    // Given: 无法连接的云端
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let dir = TempDir::new().unwrap();
    let store = store_for(&dir, &url);
    let base = store.sync_interval().unwrap();

    // When: 连续失败达到阈值
    for _ in 0..SYNC_BACKOFF_AFTER {
        assert!(store.sync_with_cloud().await.is_err());
    }

    // Then: 间隔放慢
    assert_eq!(store.sync_interval(), Some(base * SYNC_BACKOFF_FACTOR));
    assert_eq!(store.status().sync_errors, SYNC_BACKOFF_AFTER);
    assert!(base >= Duration::from_secs(1));
}
