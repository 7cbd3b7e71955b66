//! 管理接口 - 把核心组件的读取与管理命令映射为 HTTP 风格的响应
//!
//! 不包含 HTTP 服务器；任何传输层只需把 [`FacadeResponse`] 原样写出。
//!
//! | 操作 | 成功 | 失败 |
//! |------|------|------|
//! | 最新快照 | 200 image/jpeg | 404 无快照 / 503 缓冲区为空 |
//! | 健康检查 | 200 healthy/warning/unknown | 503 unhealthy/critical |
//! | 配置更新 | 200 | 400 校验失败 / 500 落盘失败 |

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{Snapshot, SnapshotCache};
use crate::capture::CaptureSupervisor;
use crate::config::{
    merge_into, sanitize_config, AgentConfig, ConfigError, ConfigStore, FieldViolation,
};
use crate::health::{HealthMonitor, OverallStatus};

/// 管理接口触发重启时的等待
pub const ADMIN_RESTART_SETTLE: Duration = Duration::from_secs(2);
/// 超过该时长的快照仍会返回，但记录告警
const STALE_SNAPSHOT_AGE_MS: i64 = 60_000;
const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

/// 响应体
#[derive(Debug, Clone)]
pub enum Body {
    Json(Value),
    Image(Arc<Snapshot>),
}

/// 传输无关的响应描述
#[derive(Debug, Clone)]
pub struct FacadeResponse {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: Body,
}

impl FacadeResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type", "application/json".to_string())],
            body: Body::Json(body),
        }
    }

    fn ok<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(body) => Self::json(200, body),
            Err(e) => Self::error(500, "Serialization failed", &e.to_string()),
        }
    }

    fn error(status: u16, error: &str, message: &str) -> Self {
        Self::json(
            status,
            json!({
                "error": error,
                "message": message,
                "timestamp": now_iso(),
            }),
        )
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            Body::Json(v) => Some(v),
            Body::Image(_) => None,
        }
    }

    pub fn image_bytes(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Image(s) => Some(&s.buffer),
            Body::Json(_) => None,
        }
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn violation_details(violations: &[FieldViolation]) -> Value {
    Value::Array(
        violations
            .iter()
            .map(|v| json!({ "field": v.field, "message": v.reason }))
            .collect(),
    )
}

fn config_error_response(error: &str, err: &ConfigError) -> FacadeResponse {
    match err {
        ConfigError::Invalid(violations) => FacadeResponse::json(
            400,
            json!({
                "error": "Validation Error",
                "message": "Configuration validation failed",
                "details": violation_details(violations),
                "timestamp": now_iso(),
            }),
        ),
        other => FacadeResponse::error(500, error, &other.to_string()),
    }
}

/// 管理补丁中的密钥不回显
fn sanitize_patch(patch: &Value) -> Value {
    let mut patch = patch.clone();
    if let Some(key) = patch.pointer_mut("/auth/apiKey") {
        *key = Value::String("***".to_string());
    }
    for pointer in ["/capture/sourceUrl", "/cloud/webhookUrl"] {
        if let Some(url) = patch.pointer_mut(pointer) {
            if let Some(s) = url.as_str() {
                *url = Value::String(crate::config::mask_url_credentials(s));
            }
        }
    }
    patch
}

/// 管理接口
pub struct AgentFacade {
    config: Arc<ConfigStore>,
    cache: Arc<SnapshotCache>,
    supervisor: CaptureSupervisor,
    health: Arc<HealthMonitor>,
    restart_settle: Duration,
}

impl AgentFacade {
    pub fn new(
        config: Arc<ConfigStore>,
        cache: Arc<SnapshotCache>,
        supervisor: CaptureSupervisor,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            config,
            cache,
            supervisor,
            health,
            restart_settle: ADMIN_RESTART_SETTLE,
        }
    }

    pub fn with_restart_settle(mut self, settle: Duration) -> Self {
        self.restart_settle = settle;
        self
    }

    /// API key 校验：缺失 401，不匹配 403
    pub fn authorize(&self, provided: Option<&str>) -> Result<(), FacadeResponse> {
        let provided = provided
            .map(|k| k.strip_prefix("Bearer ").unwrap_or(k).trim())
            .filter(|k| !k.is_empty());
        let Some(key) = provided else {
            warn!("API request without API key");
            return Err(FacadeResponse::error(
                401,
                "API key required",
                "Please provide a valid API key in X-API-Key header or Authorization header",
            ));
        };
        if key != self.config.get_config().auth.api_key {
            let prefix: String = key.chars().take(4).collect();
            warn!(provided = %format!("{}...", prefix), "Invalid API key attempt");
            return Err(FacadeResponse::error(
                403,
                "Invalid API key",
                "The provided API key is not valid",
            ));
        }
        Ok(())
    }

    // ---- snapshot ----

    /// 最新快照
    pub fn latest_snapshot(&self) -> FacadeResponse {
        let Some(snapshot) = self.cache.get_latest() else {
            debug!("No snapshot available for request");
            return FacadeResponse::error(404, "No snapshot available", "No recent snapshots found in cache");
        };
        if snapshot.buffer.is_empty() {
            warn!(id = %snapshot.id, "Empty snapshot buffer found");
            return FacadeResponse::error(503, "Invalid snapshot", "Snapshot data is corrupted or empty");
        }

        let age_ms = (Utc::now() - snapshot.timestamp).num_milliseconds().max(0);
        if age_ms > STALE_SNAPSHOT_AGE_MS {
            warn!(age_ms, "Serving stale snapshot");
        }

        FacadeResponse {
            status: 200,
            headers: vec![
                ("Content-Type", "image/jpeg".to_string()),
                ("Content-Length", snapshot.buffer.len().to_string()),
                (
                    "X-Timestamp",
                    snapshot.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                ),
                ("X-Stream-Status", snapshot.stream_status.as_str().to_string()),
                ("X-Snapshot-Age", age_ms.to_string()),
                ("X-Snapshot-ID", snapshot.id.clone()),
                ("Cache-Control", NO_CACHE.to_string()),
                ("Pragma", "no-cache".to_string()),
                ("Expires", "0".to_string()),
            ],
            body: Body::Image(snapshot),
        }
    }

    /// 按 id 取历史快照，可被客户端缓存
    pub fn snapshot_by_id(&self, id: &str) -> FacadeResponse {
        if id.trim().is_empty() {
            return FacadeResponse::error(400, "Missing snapshot ID", "Snapshot ID is required");
        }
        let Some(snapshot) = self.cache.get_by_id(id) else {
            return FacadeResponse::error(
                404,
                "Snapshot not found",
                &format!("No snapshot found with ID: {}", id),
            );
        };
        if snapshot.buffer.is_empty() {
            return FacadeResponse::error(503, "Invalid snapshot", "Snapshot data is corrupted or empty");
        }

        FacadeResponse {
            status: 200,
            headers: vec![
                ("Content-Type", "image/jpeg".to_string()),
                ("Content-Length", snapshot.buffer.len().to_string()),
                (
                    "X-Timestamp",
                    snapshot.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                ),
                ("X-Snapshot-ID", snapshot.id.clone()),
                ("Cache-Control", "public, max-age=3600".to_string()),
            ],
            body: Body::Image(snapshot),
        }
    }

    pub fn snapshot_info(&self) -> FacadeResponse {
        let info = self.cache.get_info();
        let stream = self.supervisor.get_status();
        FacadeResponse::json(
            200,
            json!({
                "snapshot": info,
                "stream": {
                    "isRunning": stream.is_running,
                    "processId": stream.process_id,
                    "retryCount": stream.retry_count,
                    "frameCount": stream.frame_count,
                    "uptime": stream.uptime_ms,
                    "healthy": self.supervisor.is_healthy(),
                },
                "timestamp": now_iso(),
            }),
        )
    }

    pub fn snapshot_list(&self) -> FacadeResponse {
        let now = Utc::now();
        let snapshots: Vec<Value> = self
            .cache
            .list()
            .into_iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "timestamp": s.timestamp,
                    "size": s.size,
                    "streamStatus": s.stream_status,
                    "age": (now - s.timestamp).num_milliseconds().max(0),
                })
            })
            .collect();
        FacadeResponse::json(
            200,
            json!({
                "count": snapshots.len(),
                "snapshots": snapshots,
                "timestamp": now_iso(),
            }),
        )
    }

    pub fn snapshot_stats(&self) -> FacadeResponse {
        FacadeResponse::json(
            200,
            json!({
                "cache": self.cache.get_stats(),
                "stream": self.supervisor.get_status(),
                "timestamp": now_iso(),
            }),
        )
    }

    pub fn clear_cache(&self) -> FacadeResponse {
        self.cache.clear();
        info!("Snapshot cache cleared via admin request");
        FacadeResponse::json(
            200,
            json!({
                "success": true,
                "message": "Snapshot cache cleared successfully",
                "timestamp": now_iso(),
            }),
        )
    }

    // ---- health ----

    pub fn health(&self) -> FacadeResponse {
        let report = self.health.get_health();
        let status = match report.status {
            OverallStatus::Unhealthy | OverallStatus::Critical => 503,
            OverallStatus::Healthy | OverallStatus::Warning | OverallStatus::Unknown => 200,
        };
        match serde_json::to_value(&report) {
            Ok(body) => FacadeResponse::json(status, body),
            Err(e) => FacadeResponse::error(500, "Health check failed", &e.to_string()),
        }
    }

    pub fn health_stats(&self) -> FacadeResponse {
        FacadeResponse::ok(&self.health.get_stats())
    }

    /// 能响应即存活
    pub fn liveness(&self) -> FacadeResponse {
        FacadeResponse::json(200, json!({ "status": "alive", "timestamp": now_iso() }))
    }

    /// 总体非 critical 且采集未 failed 时就绪
    pub fn readiness(&self) -> FacadeResponse {
        let report = self.health.get_health();
        let ready = report.status != OverallStatus::Critical
            && report.components.stream != crate::health::ComponentStatus::Failed;
        if ready {
            FacadeResponse::json(
                200,
                json!({ "status": "ready", "health": report.status, "timestamp": now_iso() }),
            )
        } else {
            FacadeResponse::json(
                503,
                json!({
                    "status": "not ready",
                    "health": report.status,
                    "issues": report.issues,
                    "timestamp": now_iso(),
                }),
            )
        }
    }

    pub async fn self_heal(&self) -> FacadeResponse {
        info!("Self-healing triggered via admin request");
        let report = self.health.perform_self_healing().await;
        FacadeResponse::json(
            200,
            json!({
                "success": true,
                "message": "Self-healing process completed",
                "actions": report,
                "timestamp": now_iso(),
            }),
        )
    }

    /// 立即返回，重启在后台完成
    pub fn restart_stream(&self) -> FacadeResponse {
        info!("Stream restart triggered via admin request");
        let supervisor = self.supervisor.clone();
        let settle = self.restart_settle;
        tokio::spawn(async move { supervisor.restart(settle).await });
        FacadeResponse::json(
            200,
            json!({
                "success": true,
                "message": "Stream restart initiated",
                "timestamp": now_iso(),
            }),
        )
    }

    // ---- config ----

    pub fn get_config(&self) -> FacadeResponse {
        FacadeResponse::json(
            200,
            json!({
                "configuration": sanitize_config(&self.config.get_config()),
                "status": self.config.status(),
                "timestamp": now_iso(),
            }),
        )
    }

    pub fn config_status(&self) -> FacadeResponse {
        FacadeResponse::json(
            200,
            json!({ "status": self.config.status(), "timestamp": now_iso() }),
        )
    }

    /// 合并补丁；采集参数变化时由运行时负责重启
    pub fn update_config(&self, patch: &Value) -> FacadeResponse {
        let old = self.config.get_config();
        match self.config.update_config(patch) {
            Ok(new) => {
                let stream_restart = old.capture_changed(&new);
                info!(stream_restart, "Configuration updated via admin request");
                FacadeResponse::json(
                    200,
                    json!({
                        "success": true,
                        "message": "Configuration updated successfully",
                        "applied": sanitize_patch(patch),
                        "streamRestart": stream_restart,
                        "timestamp": now_iso(),
                    }),
                )
            }
            Err(e) => config_error_response("Configuration update failed", &e),
        }
    }

    /// 只校验不应用
    pub fn validate_config(&self, patch: &Value) -> FacadeResponse {
        let mut doc = serde_json::to_value(&*self.config.get_config())
            .unwrap_or_else(|_| AgentConfig::defaults_value());
        merge_into(&mut doc, patch);
        match AgentConfig::from_value(doc) {
            Ok(_) => FacadeResponse::json(
                200,
                json!({ "valid": true, "message": "Configuration is valid", "timestamp": now_iso() }),
            ),
            Err(e) => FacadeResponse::json(
                400,
                json!({
                    "valid": false,
                    "errors": violation_details(e.violations()),
                    "timestamp": now_iso(),
                }),
            ),
        }
    }

    pub fn reload_config(&self) -> FacadeResponse {
        info!("Configuration reload triggered via admin request");
        match self.config.reload() {
            Ok(_) => FacadeResponse::json(
                200,
                json!({
                    "success": true,
                    "message": "Configuration reloaded successfully",
                    "timestamp": now_iso(),
                }),
            ),
            Err(e) => config_error_response("Configuration reload failed", &e),
        }
    }

    pub async fn sync_config(&self) -> FacadeResponse {
        info!("Configuration sync triggered via admin request");
        match self.config.sync_with_cloud().await {
            Ok(_) => FacadeResponse::json(
                200,
                json!({
                    "success": true,
                    "message": "Configuration sync completed",
                    "timestamp": now_iso(),
                }),
            ),
            Err(e) => config_error_response("Configuration sync failed", &e),
        }
    }
}
