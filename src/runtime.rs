//! 运行时编排 - 组装各组件并驱动后台任务
//!
//! 后台任务：
//! - 健康监控主循环
//! - 本地配置文件轮询（mtime 变化即 reload）
//! - 云端配置定时同步
//! - 配置事件处理：采集参数变化时重启采集
//! - critical 告警推送
//!
//! 所有任务监听同一个 `watch` 关闭信号。

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alert::WebhookAlerter;
use crate::cache::SnapshotCache;
use crate::capture::{CaptureLauncher, CaptureSupervisor, FfmpegLauncher, SupervisorOptions};
use crate::config::{mask_url_credentials, ConfigEvent, ConfigStore};
use crate::facade::AgentFacade;
use crate::health::{HealthEvent, HealthMonitor};
use crate::metrics::AgentMetrics;

/// 配置变化后重启采集前的等待
pub const CONFIG_RESTART_SETTLE: Duration = Duration::from_secs(3);
/// 本地配置文件轮询周期
pub const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// 云端同步关闭时重新检查配置的周期
const SYNC_DISABLED_RECHECK: Duration = Duration::from_secs(60);

/// 运行时参数
#[derive(Clone)]
pub struct AgentOptions {
    pub launcher: Arc<dyn CaptureLauncher>,
    pub supervisor: SupervisorOptions,
    pub restart_settle: Duration,
    pub config_poll: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            launcher: Arc::new(FfmpegLauncher),
            supervisor: SupervisorOptions::default(),
            restart_settle: CONFIG_RESTART_SETTLE,
            config_poll: CONFIG_POLL_INTERVAL,
        }
    }
}

/// 边缘代理
pub struct EdgeAgent {
    config: Arc<ConfigStore>,
    cache: Arc<SnapshotCache>,
    supervisor: CaptureSupervisor,
    health: Arc<HealthMonitor>,
    facade: Arc<AgentFacade>,
    metrics: Arc<AgentMetrics>,
    options: AgentOptions,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EdgeAgent {
    /// 根据当前配置组装组件，不启动任何任务
    pub fn new(config: Arc<ConfigStore>, metrics: Arc<AgentMetrics>, options: AgentOptions) -> Self {
        let current = config.get_config();
        let cache = Arc::new(SnapshotCache::new(
            current.snapshot.cache_max,
            current.snapshot_ttl(),
            metrics.clone(),
        ));
        let supervisor = CaptureSupervisor::with_options(
            config.clone(),
            cache.clone(),
            options.launcher.clone(),
            metrics.clone(),
            options.supervisor,
        );
        let health = Arc::new(HealthMonitor::new(
            config.clone(),
            supervisor.clone(),
            cache.clone(),
            metrics.clone(),
        ));
        let facade = Arc::new(AgentFacade::new(
            config.clone(),
            cache.clone(),
            supervisor.clone(),
            health.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            cache,
            supervisor,
            health,
            facade,
            metrics,
            options,
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    pub fn facade(&self) -> Arc<AgentFacade> {
        self.facade.clone()
    }

    pub fn supervisor(&self) -> &CaptureSupervisor {
        &self.supervisor
    }

    pub fn cache(&self) -> Arc<SnapshotCache> {
        self.cache.clone()
    }

    pub fn health(&self) -> Arc<HealthMonitor> {
        self.health.clone()
    }

    pub fn metrics(&self) -> Arc<AgentMetrics> {
        self.metrics.clone()
    }

    /// 启动采集与全部后台任务
    pub fn start(&mut self) {
        let config = self.config.get_config();
        info!(
            device_id = %config.cloud.device_id,
            stream = %mask_url_credentials(&config.capture.source_url),
            "Starting edge agent"
        );

        // 先订阅再启动，避免漏掉首批事件
        let config_events = self.config.subscribe();
        let health_events = self.health.subscribe();

        self.supervisor.start();

        let shutdown = self.shutdown_tx.subscribe();
        self.tasks
            .push(tokio::spawn(self.health.clone().run(shutdown)));

        self.tasks.push(tokio::spawn(restart_on_config_change(
            self.supervisor.clone(),
            config_events,
            self.options.restart_settle,
            self.shutdown_tx.subscribe(),
        )));

        self.tasks.push(tokio::spawn(watch_local_config(
            self.config.clone(),
            self.options.config_poll,
            self.shutdown_tx.subscribe(),
        )));

        self.tasks.push(tokio::spawn(cloud_sync_loop(
            self.config.clone(),
            self.shutdown_tx.subscribe(),
        )));

        match WebhookAlerter::new() {
            Ok(alerter) => self.tasks.push(tokio::spawn(forward_critical_alerts(
                self.config.clone(),
                alerter,
                health_events,
                self.shutdown_tx.subscribe(),
            ))),
            Err(e) => warn!(error = %e, "Critical alerts disabled"),
        }
    }

    /// 优雅关闭：停止后台任务与采集进程
    pub async fn shutdown(mut self) {
        info!("Shutting down edge agent");
        let _ = self.shutdown_tx.send(true);

        let grace = self.options.supervisor.stop_grace + Duration::from_secs(1);
        if !self.supervisor.shutdown(grace).await {
            warn!("Capture process did not exit in time");
        }

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Edge agent stopped");
    }
}

/// 采集参数变化时重启采集；其余配置变化只记录
async fn restart_on_config_change(
    supervisor: CaptureSupervisor,
    mut events: broadcast::Receiver<ConfigEvent>,
    settle: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.changed() => break,
        };
        match event {
            Ok(event) => {
                // ConfigStore 已记录成功与失败，这里只处理重启
                if event.requires_capture_restart() {
                    info!("Stream configuration changed, restarting stream");
                    tokio::select! {
                        _ = supervisor.restart(settle) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Config event listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Config event listener stopped");
}

/// 轮询本地配置文件的修改时间
async fn watch_local_config(
    config: Arc<ConfigStore>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_seen: Option<SystemTime> = config.local_modified();
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => break,
        }

        let modified = config.local_modified();
        if modified.is_some() && modified != last_seen {
            debug!(path = %config.paths().local.display(), "Local config file changed");
            last_seen = modified;
            // 失败时 ConfigStore 已记录日志并保留旧配置
            let _ = config.reload();
            // reload 不写文件，但 update/sync 可能在此期间落盘
            last_seen = config.local_modified().or(last_seen);
        }
    }
    debug!("Config file watcher stopped");
}

/// 启动时同步一次，之后按（可能降频的）间隔同步
async fn cloud_sync_loop(config: Arc<ConfigStore>, mut shutdown: watch::Receiver<bool>) {
    let mut first = true;
    loop {
        let wait = match config.sync_interval() {
            Some(_) if first => Duration::ZERO,
            Some(interval) => interval,
            None => {
                if first {
                    info!("Cloud sync disabled");
                }
                first = false;
                tokio::select! {
                    _ = tokio::time::sleep(SYNC_DISABLED_RECHECK) => continue,
                    _ = shutdown.changed() => break,
                }
            }
        };
        first = false;

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => break,
        }

        // 同步关闭后到期的这一轮跳过
        if config.sync_interval().is_none() {
            continue;
        }
        // 失败已计数并记录，等待下一轮
        let _ = config.sync_with_cloud().await;
    }
    debug!("Cloud sync loop stopped");
}

/// critical 问题记录日志，并在配置了 webhook 时推送
async fn forward_critical_alerts(
    config: Arc<ConfigStore>,
    alerter: WebhookAlerter,
    mut events: broadcast::Receiver<HealthEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.changed() => break,
        };
        let issue = match event {
            Ok(HealthEvent::CriticalIssue(issue)) => issue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };

        error!(component = %issue.component, message = %issue.message, "Critical health issue detected");

        let current = config.get_config();
        let Some(url) = current.cloud.webhook_url.as_deref() else {
            continue;
        };
        if let Err(e) = alerter
            .send_critical(url, &current.auth.api_key, &current.cloud.device_id, &issue)
            .await
        {
            warn!(error = %e, "Failed to deliver critical alert");
        }
    }
    debug!("Alert forwarder stopped");
}
