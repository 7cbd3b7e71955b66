//! Pi Node Agent - 摄像头边缘代理
//!
//! 监督外部采集进程，缓存 JPEG 快照，监控设备健康，分层管理配置。

pub mod alert;
pub mod cache;
pub mod capture;
pub mod config;
pub mod facade;
pub mod health;
pub mod metrics;
pub mod runtime;

pub use alert::WebhookAlerter;
pub use cache::{CacheInfo, CacheStats, Snapshot, SnapshotCache, SnapshotMeta, SnapshotSummary, StreamStatus};
pub use capture::{
    CaptureLauncher, CaptureState, CaptureStatus, CaptureSupervisor, FfmpegLauncher,
    JpegFrameExtractor, RetryPolicy, ShellLauncher, StreamEvent, SupervisorOptions,
};
pub use config::{AgentConfig, ConfigError, ConfigEvent, ConfigPaths, ConfigStore};
pub use facade::{AgentFacade, Body, FacadeResponse};
pub use health::{HealthEvent, HealthMonitor, HealthReport, OverallStatus, SystemProbe, SystemStats};
pub use metrics::{AgentMetrics, MetricsSnapshot};
pub use runtime::{AgentOptions, EdgeAgent};
