//! 配置模块 - 强类型配置、分层合并、热重载与云端同步

pub mod merge;
pub mod schema;
pub mod store;

pub use merge::{get_path, mask_url_credentials, merge_config, merge_into, sanitize_config, set_path};
pub use schema::{
    AgentConfig, AuthConfig, CaptureConfig, CloudConfig, ConfigError, FieldViolation,
    MonitoringConfig, SnapshotConfig, ThresholdLevel, ThresholdsConfig, Transport,
};
pub use store::{
    env_layer, ConfigEvent, ConfigPaths, ConfigStatus, ConfigStore, SYNC_BACKOFF_AFTER,
    SYNC_BACKOFF_FACTOR,
};
