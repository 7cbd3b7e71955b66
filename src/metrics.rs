//! 运行指标 - 供外部 exporter 读取的仪表与计数器
//!
//! 启动时创建一份，通过 `Arc` 注入各组件，不使用全局单例。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// 指标集合
#[derive(Debug, Default)]
pub struct AgentMetrics {
    stream_up: AtomicBool,
    process_up: AtomicBool,
    stream_restarts: AtomicU64,
    /// 每分钟快照数（f64 位模式）
    snapshot_rate: AtomicU64,
    cache_size_bytes: AtomicU64,
    /// 最近一次成功快照的 Unix 时间（秒，f64 位模式）
    last_successful_snapshot: AtomicU64,
    /// 摄氏度（f64 位模式）
    system_temperature: AtomicU64,
    config_reloads: AtomicU64,
    config_sync_errors: AtomicU64,
}

/// 某一时刻的指标值
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub stream_up: bool,
    pub process_up: bool,
    pub stream_restarts: u64,
    pub snapshot_rate_per_minute: f64,
    pub cache_size_bytes: u64,
    pub last_successful_snapshot: f64,
    pub system_temperature: f64,
    pub config_reloads: u64,
    pub config_sync_errors: u64,
}

fn store_f64(slot: &AtomicU64, value: f64) {
    slot.store(value.to_bits(), Ordering::Relaxed);
}

fn load_f64(slot: &AtomicU64) -> f64 {
    f64::from_bits(slot.load(Ordering::Relaxed))
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stream_up(&self, up: bool) {
        self.stream_up.store(up, Ordering::Relaxed);
    }

    pub fn set_process_up(&self, up: bool) {
        self.process_up.store(up, Ordering::Relaxed);
    }

    pub fn inc_stream_restarts(&self) {
        self.stream_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_snapshot_rate(&self, per_minute: f64) {
        store_f64(&self.snapshot_rate, per_minute);
    }

    pub fn set_cache_size_bytes(&self, bytes: u64) {
        self.cache_size_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn mark_snapshot(&self, at: DateTime<Utc>) {
        store_f64(
            &self.last_successful_snapshot,
            at.timestamp_millis() as f64 / 1000.0,
        );
    }

    pub fn set_system_temperature(&self, celsius: f64) {
        store_f64(&self.system_temperature, celsius);
    }

    pub fn inc_config_reloads(&self) {
        self.config_reloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_config_sync_errors(&self) {
        self.config_sync_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            stream_up: self.stream_up.load(Ordering::Relaxed),
            process_up: self.process_up.load(Ordering::Relaxed),
            stream_restarts: self.stream_restarts.load(Ordering::Relaxed),
            snapshot_rate_per_minute: load_f64(&self.snapshot_rate),
            cache_size_bytes: self.cache_size_bytes.load(Ordering::Relaxed),
            last_successful_snapshot: load_f64(&self.last_successful_snapshot),
            system_temperature: load_f64(&self.system_temperature),
            config_reloads: self.config_reloads.load(Ordering::Relaxed),
            config_sync_errors: self.config_sync_errors.load(Ordering::Relaxed),
        }
    }
}
