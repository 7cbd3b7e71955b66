//! 健康模块 - 主机指标采集与健康状态汇总

pub mod monitor;
pub mod probe;

pub use monitor::{
    evaluate_thresholds, format_system_stats, format_uptime, overall_status, ComponentStatus,
    ComponentStatuses, HealthEvent, HealthIssue, HealthMonitor, HealthReport, HealthStats,
    OverallStatus, SelfHealingReport, Severity, ThresholdBreach, ISSUE_TTL, SELF_HEAL_SETTLE,
    SNAPSHOT_STALE_AFTER,
};
pub use probe::{CpuStats, NetworkStats, SystemProbe, SystemStats, UsageStats};
