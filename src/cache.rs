//! 快照缓存 - 最新快照 + 有上限的历史记录，带 TTL 与命中统计
//!
//! `latest` 与 `history` 由同一把锁保护，读者不会看到只更新了一半的状态。
//! TTL 在读取时惰性判断，不额外起清理定时器。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::metrics::AgentMetrics;

/// 快照来源状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Active,
    Error,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Active => "active",
            StreamStatus::Error => "error",
        }
    }
}

/// 一张快照；写入缓存后不再修改
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub buffer: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: usize,
    pub stream_status: StreamStatus,
    pub error: Option<String>,
    /// 入库时刻（单调时钟，用于 TTL）
    pub received_at: Instant,
}

impl Snapshot {
    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }
}

/// 写入时附带的元数据
#[derive(Debug, Clone)]
pub struct SnapshotMeta {
    pub timestamp: DateTime<Utc>,
    pub stream_status: StreamStatus,
    pub error: Option<String>,
}

impl SnapshotMeta {
    pub fn active() -> Self {
        Self {
            timestamp: Utc::now(),
            stream_status: StreamStatus::Active,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream_status: StreamStatus::Error,
            error: Some(message.into()),
        }
    }
}

/// 列表用的快照摘要
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub size: usize,
    pub stream_status: StreamStatus,
}

/// 累计统计；`clear()` 不会重置
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheCounters {
    pub stores: u64,
    pub hits: u64,
    pub misses: u64,
    pub bytes_stored: u64,
}

impl CacheCounters {
    /// 命中率（百分比）
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }

    pub fn average_snapshot_size(&self) -> u64 {
        if self.stores == 0 {
            0
        } else {
            (self.bytes_stored as f64 / self.stores as f64).round() as u64
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsView {
    #[serde(flatten)]
    pub counters: CacheCounters,
    pub hit_rate: f64,
    pub average_snapshot_size: u64,
}

impl From<CacheCounters> for CacheStatsView {
    fn from(counters: CacheCounters) -> Self {
        Self {
            counters,
            hit_rate: counters.hit_rate(),
            average_snapshot_size: counters.average_snapshot_size(),
        }
    }
}

/// 缓存概况，供健康检查与诊断接口使用
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    pub has_snapshot: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub last_update_age_ms: Option<u64>,
    pub size: usize,
    pub stream_status: Option<StreamStatus>,
    pub error: Option<String>,
    pub history_count: usize,
    pub stats: CacheStatsView,
}

/// 缓存详细统计
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    #[serde(flatten)]
    pub stats: CacheStatsView,
    pub current_items: usize,
    pub current_bytes: u64,
    pub max_history: usize,
    pub ttl_sec: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    latest: Option<Arc<Snapshot>>,
    /// 按写入序号排序，最小的最旧
    history: BTreeMap<u64, Arc<Snapshot>>,
    ids: HashMap<String, u64>,
    next_seq: u64,
    counters: CacheCounters,
}

impl CacheState {
    fn remove_seq(&mut self, seq: u64) {
        if let Some(snapshot) = self.history.remove(&seq) {
            self.ids.remove(&snapshot.id);
        }
    }

    fn current_bytes(&self) -> u64 {
        let history: u64 = self.history.values().map(|s| s.buffer.len() as u64).sum();
        let latest_only = self
            .latest
            .as_ref()
            .filter(|l| !self.ids.contains_key(&l.id))
            .map(|l| l.buffer.len() as u64)
            .unwrap_or(0);
        history + latest_only
    }
}

/// 快照缓存
pub struct SnapshotCache {
    state: Mutex<CacheState>,
    ttl: Duration,
    max_history: usize,
    metrics: Arc<AgentMetrics>,
}

impl SnapshotCache {
    pub fn new(max_history: usize, ttl: Duration, metrics: Arc<AgentMetrics>) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            ttl,
            max_history: max_history.max(1),
            metrics,
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn generate_id() -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}_{}", Utc::now().timestamp_millis(), &suffix[..8])
    }

    /// 写入快照，返回新 id
    ///
    /// `active` 快照的空缓冲区会被拒绝（返回 None，不做任何修改）；
    /// `error` 快照允许空缓冲区，用于标记采集已失效。
    pub fn store(&self, buffer: Vec<u8>, meta: SnapshotMeta) -> Option<String> {
        if buffer.is_empty() && meta.stream_status == StreamStatus::Active {
            debug!("Rejected empty snapshot buffer");
            return None;
        }

        let snapshot = Arc::new(Snapshot {
            id: Self::generate_id(),
            size_bytes: buffer.len(),
            buffer,
            timestamp: meta.timestamp,
            stream_status: meta.stream_status,
            error: meta.error,
            received_at: Instant::now(),
        });
        let id = snapshot.id.clone();

        let bytes = {
            let mut state = self.state();
            let seq = state.next_seq;
            state.next_seq += 1;

            state.latest = Some(snapshot.clone());
            state.ids.insert(id.clone(), seq);
            state.history.insert(seq, snapshot.clone());

            state.counters.stores += 1;
            state.counters.bytes_stored += snapshot.size_bytes as u64;

            self.evict_expired(&mut state);
            while state.history.len() > self.max_history {
                let Some((seq, oldest)) = state.history.pop_first() else {
                    break;
                };
                state.ids.remove(&oldest.id);
                debug!(seq, id = %oldest.id, "Evicted oldest snapshot from history");
            }
            state.current_bytes()
        };

        self.metrics.set_cache_size_bytes(bytes);
        debug!(id = %id, size = snapshot.size_bytes, "Stored snapshot");
        Some(id)
    }

    fn is_expired(&self, snapshot: &Snapshot) -> bool {
        snapshot.age() > self.ttl
    }

    fn evict_expired(&self, state: &mut CacheState) {
        let expired: Vec<u64> = state
            .history
            .iter()
            .filter(|(_, s)| self.is_expired(s))
            .map(|(&seq, _)| seq)
            .collect();
        for seq in expired {
            state.remove_seq(seq);
        }
    }

    /// 最新快照；超过 TTL 视为不存在
    pub fn get_latest(&self) -> Option<Arc<Snapshot>> {
        let mut state = self.state();
        let expired = state.latest.as_ref().map(|s| self.is_expired(s)).unwrap_or(false);
        if expired {
            debug!("Latest snapshot expired");
            state.latest = None;
        }

        match state.latest.clone() {
            Some(snapshot) => {
                state.counters.hits += 1;
                Some(snapshot)
            }
            None => {
                state.counters.misses += 1;
                None
            }
        }
    }

    /// 按 id 查找历史快照（不查 latest）
    pub fn get_by_id(&self, id: &str) -> Option<Arc<Snapshot>> {
        let mut state = self.state();
        let found = state
            .ids
            .get(id)
            .copied()
            .and_then(|seq| state.history.get(&seq).map(|s| (seq, s.clone())));

        match found {
            Some((seq, snapshot)) if self.is_expired(&snapshot) => {
                state.remove_seq(seq);
                state.counters.misses += 1;
                None
            }
            Some((_, snapshot)) => {
                state.counters.hits += 1;
                Some(snapshot)
            }
            None => {
                state.counters.misses += 1;
                None
            }
        }
    }

    /// 历史快照摘要，最新在前
    pub fn list(&self) -> Vec<SnapshotSummary> {
        let mut state = self.state();
        self.evict_expired(&mut state);
        state
            .history
            .values()
            .rev()
            .map(|s| SnapshotSummary {
                id: s.id.clone(),
                timestamp: s.timestamp,
                size: s.size_bytes,
                stream_status: s.stream_status,
            })
            .collect()
    }

    /// 只读概况
    pub fn get_info(&self) -> CacheInfo {
        let state = self.state();
        let latest = state.latest.as_ref().filter(|s| !self.is_expired(s));
        CacheInfo {
            has_snapshot: latest.is_some(),
            last_update: latest.map(|s| s.timestamp),
            last_update_age_ms: latest.map(|s| s.age().as_millis() as u64),
            size: latest.map(|s| s.size_bytes).unwrap_or(0),
            stream_status: latest.map(|s| s.stream_status),
            error: latest.and_then(|s| s.error.clone()),
            history_count: state.history.values().filter(|s| !self.is_expired(s)).count(),
            stats: state.counters.into(),
        }
    }

    /// 只读统计
    pub fn get_stats(&self) -> CacheStats {
        let state = self.state();
        CacheStats {
            stats: state.counters.into(),
            current_items: state.history.len(),
            current_bytes: state.current_bytes(),
            max_history: self.max_history,
            ttl_sec: self.ttl.as_secs(),
        }
    }

    /// 清空内容；累计计数保留
    pub fn clear(&self) {
        {
            let mut state = self.state();
            state.latest = None;
            state.history.clear();
            state.ids.clear();
        }
        self.metrics.set_cache_size_bytes(0);
        info!("Snapshot cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_history: usize) -> SnapshotCache {
        SnapshotCache::new(max_history, Duration::from_secs(300), Arc::new(AgentMetrics::new()))
    }

    fn jpeg(tag: u8) -> Vec<u8> {
        vec![0xFF, 0xD8, tag, tag, 0xFF, 0xD9]
    }

    #[test]
    fn test_store_then_get_latest_round_trip() {
        let cache = cache(10);
        let meta = SnapshotMeta::active();
        let timestamp = meta.timestamp;

        let id = cache.store(jpeg(1), meta).unwrap();
        let latest = cache.get_latest().unwrap();

        assert_eq!(latest.id, id);
        assert_eq!(latest.buffer, jpeg(1));
        assert_eq!(latest.timestamp, timestamp);
        assert_eq!(latest.size_bytes, latest.buffer.len());
    }

    #[test]
    fn test_empty_buffer_is_noop() {
        let cache = cache(10);
        let id = cache.store(jpeg(1), SnapshotMeta::active()).unwrap();

        assert!(cache.store(Vec::new(), SnapshotMeta::active()).is_none());

        assert_eq!(cache.get_latest().unwrap().id, id);
        assert_eq!(cache.get_stats().stats.counters.stores, 1);
    }

    #[test]
    fn test_error_snapshot_allows_empty_buffer() {
        let cache = cache(10);
        cache
            .store(Vec::new(), SnapshotMeta::error("Process exited with code 1"))
            .unwrap();

        let latest = cache.get_latest().unwrap();
        assert_eq!(latest.stream_status, StreamStatus::Error);
        assert!(latest.buffer.is_empty());
        assert_eq!(latest.error.as_deref(), Some("Process exited with code 1"));
    }

    #[test]
    fn test_history_bounded_to_most_recent() {
        // Given: 上限 3，写入 5 张
        let cache = cache(3);
        let ids: Vec<String> = (0..5)
            .map(|i| cache.store(jpeg(i), SnapshotMeta::active()).unwrap())
            .collect();

        // Then: 只保留最近 3 张
        let listed: Vec<String> = cache.list().into_iter().map(|s| s.id).collect();
        assert_eq!(listed.len(), 3);
        let mut expected: Vec<String> = ids[2..].to_vec();
        expected.reverse();
        assert_eq!(listed, expected);

        assert!(cache.get_by_id(&ids[0]).is_none());
        assert!(cache.get_by_id(&ids[4]).is_some());
    }

    #[test]
    fn test_hit_miss_accounting() {
        let cache = cache(10);
        assert!(cache.get_latest().is_none());
        cache.store(jpeg(1), SnapshotMeta::active());
        cache.get_latest();
        cache.get_latest();
        cache.get_by_id("missing");

        let info = cache.get_info();
        assert_eq!(info.stats.counters.hits, 2);
        assert_eq!(info.stats.counters.misses, 2);
        assert_eq!(info.stats.hit_rate, 50.0);
        assert_eq!(info.stats.average_snapshot_size, 6);
    }

    #[test]
    fn test_info_does_not_mutate() {
        let cache = cache(10);
        cache.store(jpeg(1), SnapshotMeta::active());
        let before = cache.get_stats().stats.counters;
        cache.get_info();
        cache.get_stats();
        assert_eq!(cache.get_stats().stats.counters, before);
    }

    #[test]
    fn test_clear_keeps_cumulative_counters() {
        let cache = cache(10);
        cache.store(jpeg(1), SnapshotMeta::active());
        cache.get_latest();
        cache.clear();

        let info = cache.get_info();
        assert!(!info.has_snapshot);
        assert_eq!(info.history_count, 0);
        assert_eq!(info.stats.counters.stores, 1);
        assert_eq!(info.stats.counters.hits, 1);
        assert_eq!(cache.get_stats().current_bytes, 0);
        assert!(cache.get_latest().is_none());
    }

    #[test]
    fn test_ttl_expiry_produces_miss() {
        let cache = SnapshotCache::new(10, Duration::from_millis(50), Arc::new(AgentMetrics::new()));
        let id = cache.store(jpeg(1), SnapshotMeta::active()).unwrap();
        assert!(cache.get_latest().is_some());

        std::thread::sleep(Duration::from_millis(100));

        assert!(!cache.get_info().has_snapshot);
        assert!(cache.get_latest().is_none());
        assert!(cache.get_by_id(&id).is_none());
        let counters = cache.get_stats().stats.counters;
        assert_eq!(counters.hits, 1);
        assert_eq!(counters.misses, 2);
    }

    #[test]
    fn test_ids_are_unique_and_ordered() {
        let cache = cache(100);
        let ids: Vec<String> = (0..50)
            .map(|i| cache.store(jpeg(i), SnapshotMeta::active()).unwrap())
            .collect();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());

        let listed: Vec<String> = cache.list().into_iter().rev().map(|s| s.id).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn test_cache_size_metric_tracks_contents() {
        let metrics = Arc::new(AgentMetrics::new());
        let cache = SnapshotCache::new(2, Duration::from_secs(300), metrics.clone());
        cache.store(jpeg(1), SnapshotMeta::active());
        cache.store(jpeg(2), SnapshotMeta::active());
        cache.store(jpeg(3), SnapshotMeta::active());
        assert_eq!(metrics.snapshot().cache_size_bytes, 12);

        cache.clear();
        assert_eq!(metrics.snapshot().cache_size_bytes, 0);
    }
}
