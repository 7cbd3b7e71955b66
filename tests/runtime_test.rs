//! 运行时端到端测试：启动、配置热更新、关闭

use pi_node_agent::{
    AgentConfig, AgentMetrics, AgentOptions, CaptureState, ConfigPaths, ConfigStore, EdgeAgent,
    ShellLauncher,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn agent(dir: &TempDir) -> (EdgeAgent, Arc<ConfigStore>) {
    let mut config = AgentConfig::default();
    config.cloud.sync_interval_ms = 0;
    let metrics = Arc::new(AgentMetrics::new());
    let store = Arc::new(ConfigStore::from_config(
        ConfigPaths::new(dir.path()),
        config,
        metrics.clone(),
    ));
    let options = AgentOptions {
        launcher: Arc::new(ShellLauncher::new(
            r"printf '\377\330run\377\331'; exec sleep 30",
        )),
        restart_settle: Duration::from_millis(50),
        config_poll: Duration::from_millis(50),
        ..AgentOptions::default()
    };
    (EdgeAgent::new(store.clone(), metrics, options), store)
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

#[tokio::test]
async fn test_start_and_shutdown() {
    // Given
    let dir = TempDir::new().unwrap();
    let (mut agent, _store) = agent(&dir);

    // When
    agent.start();

    // Then: 采集运行并产出快照
    assert!(wait_for(|| agent.cache().get_info().has_snapshot).await);
    assert_eq!(agent.supervisor().capture_state(), CaptureState::Running);
    assert_eq!(agent.facade().latest_snapshot().status, 200);

    // When: 关闭
    let supervisor = agent.supervisor().clone();
    tokio::time::timeout(Duration::from_secs(10), agent.shutdown())
        .await
        .expect("shutdown finished");

    // Then
    assert!(supervisor.process_id().is_none());
    assert_eq!(supervisor.capture_state(), CaptureState::Stopped);
}

#[tokio::test]
async fn test_capture_change_restarts_stream() {
    // Given
    let dir = TempDir::new().unwrap();
    let (mut agent, _store) = agent(&dir);
    agent.start();
    assert!(wait_for(|| agent.supervisor().process_id().is_some()).await);
    let first_pid = agent.supervisor().process_id();

    // When: 管理接口修改抽帧间隔
    let response = agent
        .facade()
        .update_config(&json!({"snapshot": {"intervalSec": 5}}));
    assert_eq!(response.status, 200);

    // Then: 采集进程被替换
    assert!(wait_for(|| {
        let pid = agent.supervisor().process_id();
        pid.is_some() && pid != first_pid
    })
    .await);
    assert_eq!(agent.supervisor().get_status().restart_count, 0);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_local_file_change_is_reloaded() {
    // Given
    let dir = TempDir::new().unwrap();
    let (mut agent, store) = agent(&dir);
    agent.start();

    // When: 外部改写本地配置文件
    std::fs::write(
        dir.path().join("local.json"),
        r#"{"thresholds": {"temperature": {"warning": 60, "critical": 75}}}"#,
    )
    .unwrap();

    // Then: 轮询发现并重载
    assert!(wait_for(|| store.get_config().thresholds.temperature.critical == 75.0).await);
    assert!(store.status().reloads >= 1);
    let first_pid = agent.supervisor().process_id();

    // 阈值变化不重启采集
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(agent.supervisor().process_id(), first_pid);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_during_config_restart_keeps_stream_down() {
    // Given: 配置变化触发的重启正在等待 settle
    let dir = TempDir::new().unwrap();
    let mut config = AgentConfig::default();
    config.cloud.sync_interval_ms = 0;
    let metrics = Arc::new(AgentMetrics::new());
    let store = Arc::new(ConfigStore::from_config(
        ConfigPaths::new(dir.path()),
        config,
        metrics.clone(),
    ));
    let options = AgentOptions {
        launcher: Arc::new(ShellLauncher::new("exec sleep 30")),
        restart_settle: Duration::from_millis(300),
        config_poll: Duration::from_millis(50),
        ..AgentOptions::default()
    };
    let mut agent = EdgeAgent::new(store, metrics, options);
    agent.start();
    assert!(wait_for(|| agent.supervisor().process_id().is_some()).await);
    let supervisor = agent.supervisor().clone();

    assert_eq!(
        agent
            .facade()
            .update_config(&json!({"snapshot": {"quality": 4}}))
            .status,
        200
    );
    assert!(wait_for(|| supervisor.process_id().is_none()).await);

    // When: settle 期间关闭
    agent.shutdown().await;

    // Then: settle 结束后也没有新进程
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!supervisor.is_running());
    assert!(supervisor.process_id().is_none());
    assert_eq!(supervisor.capture_state(), CaptureState::Stopped);
}
