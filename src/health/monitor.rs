//! 健康监控 - 阈值检查、组件状态汇总、问题记录与自愈
//!
//! ## 总体状态优先级（高者胜出）
//! 1. `critical`：任一组件 critical / failed
//! 2. `unhealthy`：任一组件 unhealthy / error / stopped
//! 3. `warning`
//! 4. `unknown`：有组件尚未上报
//! 5. `healthy`

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::probe::{SystemProbe, SystemStats};
use crate::cache::{CacheInfo, SnapshotCache};
use crate::capture::{CaptureState, CaptureStatus, CaptureSupervisor, StreamEvent};
use crate::config::{ConfigEvent, ConfigStatus, ConfigStore, ThresholdLevel, ThresholdsConfig};
use crate::metrics::AgentMetrics;

/// 问题保留时长
pub const ISSUE_TTL: Duration = Duration::from_secs(5 * 60);
/// 快照超过该时长视为过期
pub const SNAPSHOT_STALE_AFTER: Duration = Duration::from_secs(60);
/// 自愈重启采集前的等待
pub const SELF_HEAL_SETTLE: Duration = Duration::from_secs(5);

/// 组件状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Warning,
    Unhealthy,
    Error,
    Critical,
    Failed,
    Stopped,
    Unknown,
}

/// 总体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Warning,
    Unknown,
    Unhealthy,
    Critical,
}

impl OverallStatus {
    /// 对外返回 200 的状态
    pub fn is_serving(&self) -> bool {
        matches!(self, OverallStatus::Healthy | OverallStatus::Warning)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Healthy => "healthy",
            OverallStatus::Warning => "warning",
            OverallStatus::Unknown => "unknown",
            OverallStatus::Unhealthy => "unhealthy",
            OverallStatus::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

/// 健康问题
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthIssue {
    pub component: String,
    pub message: String,
    pub severity: Severity,
    pub raised_at: DateTime<Utc>,
    /// 阈值类问题对应的指标
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(skip)]
    raised_instant: Instant,
}

impl HealthIssue {
    pub fn new(component: &str, message: &str, severity: Severity, metric: Option<&str>) -> Self {
        Self {
            component: component.to_string(),
            message: message.to_string(),
            severity,
            raised_at: Utc::now(),
            metric: metric.map(str::to_string),
            raised_instant: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.raised_instant.elapsed()
    }
}

/// 单个指标越过阈值
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdBreach {
    pub metric: &'static str,
    pub severity: Severity,
    pub message: String,
}

/// 健康事件
#[derive(Debug, Clone)]
pub enum HealthEvent {
    /// 新出现的 critical 问题，用于外部告警
    CriticalIssue(HealthIssue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ComponentStatuses {
    pub stream: ComponentStatus,
    pub api: ComponentStatus,
    pub system: ComponentStatus,
    pub cache: ComponentStatus,
}

impl ComponentStatuses {
    fn all(&self) -> [ComponentStatus; 4] {
        [self.stream, self.api, self.system, self.cache]
    }
}

/// getHealth 返回值
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: OverallStatus,
    pub components: ComponentStatuses,
    pub issues: Vec<HealthIssue>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormattedCpu {
    pub usage: String,
    pub temperature: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormattedUsage {
    pub used: String,
    pub total: String,
    pub percentage: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormattedNetwork {
    pub rx: String,
    pub tx: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormattedSystemStats {
    pub cpu: FormattedCpu,
    pub memory: FormattedUsage,
    pub disk: FormattedUsage,
    pub network: FormattedNetwork,
    pub uptime: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatuses {
    pub stream: CaptureStatus,
    pub cache: CacheInfo,
    pub config: ConfigStatus,
}

/// getStats 返回值
#[derive(Debug, Clone, Serialize)]
pub struct HealthStats {
    pub system: FormattedSystemStats,
    pub services: ServiceStatuses,
}

/// 自愈执行结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfHealingReport {
    pub restarted_stream: bool,
    pub cleared_cache: bool,
}

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * 1024 * 1024;

fn rounded(bytes: u64, unit: u64) -> u64 {
    (bytes as f64 / unit as f64).round() as u64
}

/// `93784` -> `1d 2h 3m`；不足一分钟为 `0m`
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 {
        parts.push(format!("{}m", minutes));
    }
    if parts.is_empty() {
        "0m".to_string()
    } else {
        parts.join(" ")
    }
}

pub fn format_system_stats(stats: &SystemStats) -> FormattedSystemStats {
    FormattedSystemStats {
        cpu: FormattedCpu {
            usage: format!("{:.1}%", stats.cpu.usage),
            temperature: stats
                .cpu
                .temperature
                .map(|t| format!("{:.1}°C", t))
                .unwrap_or_else(|| "n/a".to_string()),
        },
        memory: FormattedUsage {
            used: format!("{} MB", rounded(stats.memory.used, MB)),
            total: format!("{} MB", rounded(stats.memory.total, MB)),
            percentage: format!("{:.1}%", stats.memory.percentage),
        },
        disk: FormattedUsage {
            used: format!("{} GB", rounded(stats.disk.used, GB)),
            total: format!("{} GB", rounded(stats.disk.total, GB)),
            percentage: format!("{:.1}%", stats.disk.percentage),
        },
        network: FormattedNetwork {
            rx: format!("{} MB", rounded(stats.network.rx, MB)),
            tx: format!("{} MB", rounded(stats.network.tx, MB)),
        },
        uptime: format_uptime(stats.uptime_sec),
    }
}

fn breach(
    metric: &'static str,
    label: &str,
    value: f64,
    unit: &str,
    level: &ThresholdLevel,
) -> Option<ThresholdBreach> {
    let (severity, word) = if value >= level.critical {
        (Severity::Critical, "critical")
    } else if value >= level.warning {
        (Severity::Warning, "high")
    } else {
        return None;
    };
    Some(ThresholdBreach {
        metric,
        severity,
        message: format!("{} {}: {:.1}{}", label, word, value, unit),
    })
}

/// 每个指标最多一条，critical 覆盖 warning
pub fn evaluate_thresholds(stats: &SystemStats, thresholds: &ThresholdsConfig) -> Vec<ThresholdBreach> {
    let temperature = stats.cpu.temperature.and_then(|t| {
        breach("temperature", "CPU temperature", t, "°C", &thresholds.temperature)
    });
    let memory = breach(
        "memory",
        "Memory usage",
        stats.memory.percentage,
        "%",
        &thresholds.memory,
    );
    let disk = breach("disk", "Disk usage", stats.disk.percentage, "%", &thresholds.disk);

    [temperature, memory, disk].into_iter().flatten().collect()
}

pub fn overall_status(components: &[ComponentStatus]) -> OverallStatus {
    let any = |wanted: &[ComponentStatus]| components.iter().any(|c| wanted.contains(c));

    if any(&[ComponentStatus::Critical, ComponentStatus::Failed]) {
        OverallStatus::Critical
    } else if any(&[
        ComponentStatus::Unhealthy,
        ComponentStatus::Error,
        ComponentStatus::Stopped,
    ]) {
        OverallStatus::Unhealthy
    } else if any(&[ComponentStatus::Warning]) {
        OverallStatus::Warning
    } else if any(&[ComponentStatus::Unknown]) {
        OverallStatus::Unknown
    } else {
        OverallStatus::Healthy
    }
}

struct HealthState {
    stats: SystemStats,
    components: ComponentStatuses,
    overall: OverallStatus,
    issues: Vec<HealthIssue>,
    /// 每个指标上一次的严重级别，用于判断是否新进入 critical
    metric_severity: HashMap<&'static str, Severity>,
    last_stream_error: Option<Instant>,
}

impl HealthState {
    fn new() -> Self {
        let components = ComponentStatuses {
            stream: ComponentStatus::Unknown,
            api: ComponentStatus::Healthy,
            system: ComponentStatus::Unknown,
            cache: ComponentStatus::Unknown,
        };
        Self {
            stats: SystemStats::default(),
            components,
            overall: overall_status(&components.all()),
            issues: Vec::new(),
            metric_severity: HashMap::new(),
            last_stream_error: None,
        }
    }

    fn refresh_overall(&mut self) {
        self.overall = overall_status(&self.components.all());
    }

    /// 按 (component, message) 去重，返回是否新增
    fn add_issue(&mut self, issue: HealthIssue) -> bool {
        let exists = self
            .issues
            .iter()
            .any(|i| i.component == issue.component && i.message == issue.message);
        if exists {
            return false;
        }
        warn!(component = %issue.component, message = %issue.message, "Health issue");
        self.issues.push(issue);
        true
    }
}

/// 健康监控器
pub struct HealthMonitor {
    config: Arc<ConfigStore>,
    supervisor: CaptureSupervisor,
    cache: Arc<SnapshotCache>,
    metrics: Arc<AgentMetrics>,
    state: Mutex<HealthState>,
    events: broadcast::Sender<HealthEvent>,
    issue_ttl: Duration,
    heal_settle: Duration,
}

impl HealthMonitor {
    pub fn new(
        config: Arc<ConfigStore>,
        supervisor: CaptureSupervisor,
        cache: Arc<SnapshotCache>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            supervisor,
            cache,
            metrics,
            state: Mutex::new(HealthState::new()),
            events,
            issue_ttl: ISSUE_TTL,
            heal_settle: SELF_HEAL_SETTLE,
        }
    }

    /// 调整问题保留时长与自愈等待（测试用）
    pub fn with_timings(mut self, issue_ttl: Duration, heal_settle: Duration) -> Self {
        self.issue_ttl = issue_ttl;
        self.heal_settle = heal_settle;
        self
    }

    fn state(&self) -> MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// 记录问题，已存在则忽略
    pub fn add_issue(&self, component: &str, message: &str, severity: Severity) -> bool {
        self.state()
            .add_issue(HealthIssue::new(component, message, severity, None))
    }

    /// 写入一次主机采样并检查阈值
    pub fn apply_system_stats(&self, stats: SystemStats) -> ComponentStatus {
        if let Some(temperature) = stats.cpu.temperature {
            self.metrics.set_system_temperature(temperature);
        }
        self.state().stats = stats;
        self.check_system_thresholds()
    }

    /// 用最近一次采样检查温度、内存、磁盘阈值
    ///
    /// 已恢复的指标对应的问题会被移除；新进入 critical 的指标发送 `CriticalIssue`。
    pub fn check_system_thresholds(&self) -> ComponentStatus {
        let thresholds = self.config.get_config().thresholds.clone();
        let mut critical = Vec::new();

        let status = {
            let mut state = self.state();
            let breaches = evaluate_thresholds(&state.stats, &thresholds);

            state.issues.retain(|issue| match issue.metric.as_deref() {
                Some(metric) => breaches
                    .iter()
                    .any(|b| b.metric == metric && b.message == issue.message),
                None => true,
            });

            let previous = std::mem::take(&mut state.metric_severity);
            for b in &breaches {
                let issue = HealthIssue::new("system", &b.message, b.severity, Some(b.metric));
                let added = state.add_issue(issue.clone());
                let was_critical = previous.get(b.metric) == Some(&Severity::Critical);
                if added && b.severity == Severity::Critical && !was_critical {
                    critical.push(issue);
                }
                state.metric_severity.insert(b.metric, b.severity);
            }

            let status = if breaches.iter().any(|b| b.severity == Severity::Critical) {
                ComponentStatus::Critical
            } else if breaches.is_empty() {
                ComponentStatus::Healthy
            } else {
                ComponentStatus::Warning
            };
            state.components.system = status;
            state.refresh_overall();
            status
        };

        for issue in critical {
            error!(message = %issue.message, "Critical system issue");
            let _ = self.events.send(HealthEvent::CriticalIssue(issue));
        }
        status
    }

    fn stream_status(&self, last_stream_error: Option<Instant>) -> (ComponentStatus, Option<&'static str>) {
        if self.supervisor.capture_state() == CaptureState::Failed {
            return (ComponentStatus::Failed, None);
        }
        if !self.supervisor.is_running() {
            return (ComponentStatus::Stopped, Some("Stream is not running"));
        }
        if self.supervisor.is_healthy() {
            return (ComponentStatus::Healthy, None);
        }

        let last_frame = self
            .supervisor
            .last_frame_age()
            .and_then(|age| Instant::now().checked_sub(age));
        let errored = match (last_stream_error, last_frame) {
            (Some(err), Some(frame)) => err > frame,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let status = if errored {
            ComponentStatus::Error
        } else {
            ComponentStatus::Unhealthy
        };
        (status, Some("Stream is not receiving frames"))
    }

    fn cache_status(info: &CacheInfo) -> (ComponentStatus, Option<&'static str>) {
        if !info.has_snapshot {
            return (ComponentStatus::Warning, Some("No snapshots available"));
        }
        let stale = info
            .last_update_age_ms
            .is_some_and(|age| age > SNAPSHOT_STALE_AFTER.as_millis() as u64);
        if stale {
            (ComponentStatus::Warning, Some("Snapshots are stale"))
        } else {
            (ComponentStatus::Healthy, None)
        }
    }

    /// 一次健康检查：清理过期问题、汇总组件状态
    pub fn check_health(&self) -> HealthReport {
        let last_stream_error = self.state().last_stream_error;
        let (stream, stream_issue) = self.stream_status(last_stream_error);
        let (cache, cache_issue) = Self::cache_status(&self.cache.get_info());

        let report = {
            let mut state = self.state();
            let ttl = self.issue_ttl;
            state.issues.retain(|issue| issue.age() < ttl);

            if let Some(message) = stream_issue {
                state.add_issue(HealthIssue::new("stream", message, Severity::Error, None));
            }
            if let Some(message) = cache_issue {
                state.add_issue(HealthIssue::new("snapshot", message, Severity::Warning, None));
            }

            state.components.stream = stream;
            state.components.cache = cache;
            state.refresh_overall();
            Self::report(&state)
        };

        if report.status != OverallStatus::Healthy {
            warn!(
                status = report.status.as_str(),
                issues = report.issues.len(),
                "Health check issues"
            );
        } else {
            debug!("Health check passed");
        }
        report
    }

    fn report(state: &HealthState) -> HealthReport {
        HealthReport {
            status: state.overall,
            components: state.components,
            issues: state.issues.clone(),
            timestamp: Utc::now(),
        }
    }

    /// 采集事件驱动的状态更新
    pub fn handle_stream_event(&self, event: &StreamEvent) {
        let mut state = self.state();
        match event {
            StreamEvent::FrameReceived { .. } => {
                state.components.stream = ComponentStatus::Healthy;
            }
            StreamEvent::StreamError(message) => {
                state.components.stream = ComponentStatus::Error;
                state.last_stream_error = Some(Instant::now());
                state.add_issue(HealthIssue::new("stream", message, Severity::Error, None));
            }
            StreamEvent::StreamFailed(message) => {
                state.components.stream = ComponentStatus::Failed;
                let message = format!("Stream failed: {}", message);
                state.add_issue(HealthIssue::new("stream", &message, Severity::Error, None));
            }
            StreamEvent::Started { .. }
            | StreamEvent::Exited { .. }
            | StreamEvent::RetryScheduled { .. } => return,
        }
        state.refresh_overall();
    }

    pub fn get_health(&self) -> HealthReport {
        Self::report(&self.state())
    }

    pub fn overall(&self) -> OverallStatus {
        self.state().overall
    }

    pub fn components(&self) -> ComponentStatuses {
        self.state().components
    }

    pub fn system_stats(&self) -> SystemStats {
        self.state().stats.clone()
    }

    pub fn get_stats(&self) -> HealthStats {
        let system = format_system_stats(&self.state().stats);
        HealthStats {
            system,
            services: ServiceStatuses {
                stream: self.supervisor.get_status(),
                cache: self.cache.get_info(),
                config: self.config.status(),
            },
        }
    }

    /// 保守的自愈：只在 failed / error 时重启采集，内存 critical 时清空缓存
    pub async fn perform_self_healing(&self) -> SelfHealingReport {
        info!("Performing self-healing checks");
        let mut report = SelfHealingReport::default();

        let (stream, memory) = {
            let state = self.state();
            (state.components.stream, state.stats.memory.percentage)
        };

        if matches!(stream, ComponentStatus::Failed | ComponentStatus::Error) {
            info!(status = ?stream, "Attempting to restart stream");
            report.restarted_stream = self.supervisor.restart(self.heal_settle).await;
        }

        let memory_critical = self.config.get_config().thresholds.memory.critical;
        if memory >= memory_critical {
            info!(memory = %format!("{:.1}%", memory), "Clearing snapshot cache due to high memory usage");
            self.cache.clear();
            report.cleared_cache = true;
        }

        report
    }

    async fn collect_system_metrics(&self, probe: &mut Option<SystemProbe>) {
        let Some(mut taken) = probe.take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || {
            let stats = taken.sample();
            (taken, stats)
        })
        .await
        {
            Ok((returned, stats)) => {
                *probe = Some(returned);
                self.apply_system_stats(stats);
            }
            Err(e) => {
                // 采集线程 panic 时重建采集器
                error!(error = %e, "Failed to collect system metrics");
                *probe = Some(SystemProbe::new());
            }
        }
    }

    fn intervals(&self) -> (Duration, Duration) {
        let config = self.config.get_config();
        (
            Duration::from_millis(config.monitoring.system_metrics_interval_ms),
            Duration::from_millis(config.monitoring.health_check_interval_ms),
        )
    }

    /// 主循环：指标采集、健康检查、事件监听，直到 shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut stream_events = self.supervisor.subscribe();
        let mut config_events = self.config.subscribe();

        let (mut metrics_every, mut health_every) = self.intervals();
        let mut metrics_tick = tokio::time::interval(metrics_every);
        let mut health_tick = tokio::time::interval(health_every);
        metrics_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut probe = Some(SystemProbe::new());
        info!(
            metrics_ms = metrics_every.as_millis() as u64,
            health_ms = health_every.as_millis() as u64,
            "Health monitor started"
        );

        loop {
            tokio::select! {
                _ = metrics_tick.tick() => self.collect_system_metrics(&mut probe).await,
                _ = health_tick.tick() => {
                    self.check_health();
                }
                event = stream_events.recv() => match event {
                    Ok(event) => self.handle_stream_event(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Health monitor lagged behind stream events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = config_events.recv() => match event {
                    Ok(ConfigEvent::Reloaded { .. } | ConfigEvent::Synced { .. } | ConfigEvent::Updated { .. }) => {
                        let (m, h) = self.intervals();
                        if m != metrics_every {
                            metrics_every = m;
                            metrics_tick = tokio::time::interval(m);
                        }
                        if h != health_every {
                            health_every = h;
                            health_tick = tokio::time::interval(h);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }

        info!("Health monitor stopped");
    }
}
