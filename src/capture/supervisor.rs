//! 采集进程监督 - 启动、读帧、失败重试与优雅停止
//!
//! ## 状态机
//! ```text
//! Stopped --start--> Starting --spawn--> Running --exit!=0--> Retrying --delay--> Starting
//!                                           |                    |
//!                                           |            retry > maxRetries
//!                                           v                    v
//!                                     exit 0 / stop           Failed
//! ```
//!
//! 每次 `start` / `stop` 都会推进 epoch，旧 epoch 的延迟重试与退出回调一律作废，
//! 所以任何时刻最多只有一个采集进程在跑。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use super::backoff::{RetryDecision, RetryPolicy};
use super::frame::JpegFrameExtractor;
use super::launcher::CaptureLauncher;
use crate::cache::{SnapshotCache, SnapshotMeta, StreamStatus};
use crate::config::{mask_url_credentials, ConfigStore};
use crate::metrics::AgentMetrics;

/// SIGTERM 之后等待退出的时间，超时则 SIGKILL
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// stderr 日志节流窗口
pub const STDERR_LOG_WINDOW: Duration = Duration::from_secs(5);

/// 进程退出后读完 stdout 剩余数据的上限
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK_SIZE: usize = 64 * 1024;
const EVENT_CAPACITY: usize = 256;
const STDERR_EXCERPT_CHARS: usize = 200;

/// 采集状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    Stopped,
    Starting,
    Running,
    Retrying,
    /// 重试耗尽，需要外部 start 才会恢复
    Failed,
}

/// 采集事件
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Started { pid: Option<u32> },
    FrameReceived { size: usize, at: DateTime<Utc> },
    /// stderr 中出现错误关键字
    StreamError(String),
    Exited { code: Option<i32> },
    RetryScheduled { attempt: u32, delay: Duration },
    /// 重试耗尽，每次失败序列只发送一次
    StreamFailed(String),
}

/// getStatus 返回值
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStatus {
    pub state: CaptureState,
    pub is_running: bool,
    pub process_id: Option<u32>,
    pub retry_count: u32,
    pub restart_count: u64,
    pub frame_count: u64,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub uptime_ms: u64,
    pub snapshot_rate_per_minute: f64,
    pub stream_url: String,
    pub launcher: String,
}

/// 监督器参数
#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    pub retry: RetryPolicy,
    pub stop_grace: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

enum SessionEnd {
    Exited(io::Result<ExitStatus>),
    StopRequested,
}

struct Session {
    id: u64,
    pid: Option<u32>,
    started_at: Instant,
    stop_tx: Option<oneshot::Sender<()>>,
}

struct SupervisorState {
    state: CaptureState,
    /// start 之后、stop 或失败之前为 true
    desired: bool,
    epoch: u64,
    next_session: u64,
    session: Option<Session>,
    retry_count: u32,
    restart_count: u64,
    frame_count: u64,
    frames_since_start: u64,
    last_frame_at: Option<DateTime<Utc>>,
    last_frame_instant: Option<Instant>,
    started_at: Option<Instant>,
}

impl SupervisorState {
    fn new() -> Self {
        Self {
            state: CaptureState::Stopped,
            desired: false,
            epoch: 0,
            next_session: 0,
            session: None,
            retry_count: 0,
            restart_count: 0,
            frame_count: 0,
            frames_since_start: 0,
            last_frame_at: None,
            last_frame_instant: None,
            started_at: None,
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.desired && self.epoch == epoch
    }

    fn snapshot_rate(&self) -> f64 {
        let Some(started) = self.started_at else {
            return 0.0;
        };
        let minutes = started.elapsed().as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        self.frames_since_start as f64 / minutes
    }
}

/// 本会话内帧是否已断流：无帧时以会话启动时间为参照
pub fn frame_stale(
    last_frame: Option<Instant>,
    session_started: Instant,
    window: Duration,
    now: Instant,
) -> bool {
    let reference = match last_frame {
        Some(last) if last > session_started => last,
        _ => session_started,
    };
    now.saturating_duration_since(reference) > window
}

/// stderr 输出是否表示故障
pub fn is_failure_output(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("error") || lower.contains("failed")
}

/// stderr 节流：窗口内只处理第一条
#[derive(Debug)]
struct StderrThrottle {
    window: Duration,
    last: Option<Instant>,
}

impl StderrThrottle {
    fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    fn allow(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.window => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

struct Inner {
    config: Arc<ConfigStore>,
    cache: Arc<SnapshotCache>,
    launcher: Arc<dyn CaptureLauncher>,
    metrics: Arc<AgentMetrics>,
    options: SupervisorOptions,
    state: Mutex<SupervisorState>,
    events: broadcast::Sender<StreamEvent>,
}

/// 采集监督器（可 clone 的句柄）
#[derive(Clone)]
pub struct CaptureSupervisor {
    inner: Arc<Inner>,
}

impl CaptureSupervisor {
    pub fn new(
        config: Arc<ConfigStore>,
        cache: Arc<SnapshotCache>,
        launcher: Arc<dyn CaptureLauncher>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self::with_options(config, cache, launcher, metrics, SupervisorOptions::default())
    }

    pub fn with_options(
        config: Arc<ConfigStore>,
        cache: Arc<SnapshotCache>,
        launcher: Arc<dyn CaptureLauncher>,
        metrics: Arc<AgentMetrics>,
        options: SupervisorOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                cache,
                launcher,
                metrics,
                options,
                state: Mutex::new(SupervisorState::new()),
                events,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SupervisorState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: StreamEvent) {
        // 没有订阅者时 send 返回 Err，忽略即可
        let _ = self.inner.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.inner.events.subscribe()
    }

    /// 启动采集（需在 Tokio runtime 内调用）
    ///
    /// 已在运行时为 no-op；从 Failed 状态启动会清零重试计数。
    pub fn start(&self) {
        self.start_at(None);
    }

    /// `expected_epoch` 为 Some 时，只有 epoch 未被推进过才启动
    fn start_at(&self, expected_epoch: Option<u64>) -> bool {
        let epoch = {
            let mut st = self.state();
            if let Some(expected) = expected_epoch {
                if st.epoch != expected {
                    info!("Capture was stopped or started during restart, skipping start");
                    return false;
                }
            }
            if st.desired {
                warn!(state = ?st.state, "Capture already running, ignoring start");
                return false;
            }
            st.desired = true;
            st.epoch += 1;
            st.state = CaptureState::Starting;
            st.retry_count = 0;
            st.frames_since_start = 0;
            st.started_at = Some(Instant::now());
            st.epoch
        };

        let config = self.inner.config.get_config();
        info!(
            url = %mask_url_credentials(&config.capture.source_url),
            launcher = self.inner.launcher.name(),
            "Starting capture"
        );
        self.launch(epoch);
        true
    }

    fn launch(&self, epoch: u64) {
        let config = self.inner.config.get_config();
        let spawned = self
            .inner
            .launcher
            .command(&config)
            .and_then(|mut command: Command| command.spawn().map_err(anyhow::Error::from));

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "Failed to spawn capture process");
                self.handle_failure(epoch, format!("failed to spawn capture process: {}", e));
                return;
            }
        };

        let pid = child.id();
        let (stop_tx, stop_rx) = oneshot::channel();
        let session_id = {
            let mut st = self.state();
            if !st.is_current(epoch) {
                // 启动期间被 stop，child 随 drop 被 kill
                debug!("Capture stopped while spawning, discarding process");
                return;
            }
            st.next_session += 1;
            let id = st.next_session;
            st.session = Some(Session {
                id,
                pid,
                started_at: Instant::now(),
                stop_tx: Some(stop_tx),
            });
            st.state = CaptureState::Running;
            id
        };

        self.inner.metrics.set_process_up(true);
        self.inner.metrics.set_stream_up(true);
        info!(pid = ?pid, session = session_id, "Capture process started");
        self.emit(StreamEvent::Started { pid });

        let this = self.clone();
        let max_frame_size = config.snapshot.max_size_bytes;
        tokio::spawn(async move {
            this.run_session(child, stop_rx, epoch, session_id, max_frame_size)
                .await;
        });
    }

    async fn run_session(
        self,
        mut child: Child,
        mut stop_rx: oneshot::Receiver<()>,
        epoch: u64,
        session_id: u64,
        max_frame_size: usize,
    ) {
        if let Some(stderr) = child.stderr.take() {
            let this = self.clone();
            tokio::spawn(async move { this.watch_stderr(stderr).await });
        }

        let mut stdout = child.stdout.take();
        let mut extractor = JpegFrameExtractor::new(max_frame_size);
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        let end = loop {
            tokio::select! {
                read = read_chunk(&mut stdout, &mut buf), if stdout.is_some() => {
                    match read {
                        Ok(0) => {
                            debug!(session = session_id, "Capture stdout closed");
                            stdout = None;
                        }
                        Ok(n) => {
                            for frame in extractor.push(&buf[..n]) {
                                self.on_frame(frame);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to read capture stdout");
                            stdout = None;
                        }
                    }
                }
                status = child.wait() => break SessionEnd::Exited(status),
                _ = &mut stop_rx => break SessionEnd::StopRequested,
            }
        };

        let exit = match end {
            SessionEnd::Exited(status) => {
                // 进程已退出但管道里可能还有帧，读到 EOF 再结算
                if let Some(out) = stdout.take() {
                    self.drain_stdout(out, &mut extractor, &mut buf, session_id)
                        .await;
                }
                status
            }
            SessionEnd::StopRequested => self.terminate(&mut child).await,
        };

        self.on_exit(epoch, session_id, exit);
    }

    async fn drain_stdout(
        &self,
        mut stdout: ChildStdout,
        extractor: &mut JpegFrameExtractor,
        buf: &mut [u8],
        session_id: u64,
    ) {
        let drain = async {
            loop {
                match stdout.read(buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for frame in extractor.push(&buf[..n]) {
                            self.on_frame(frame);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read capture stdout");
                        break;
                    }
                }
            }
        };
        // 子进程派生的后台进程可能继续持有管道
        if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!(session = session_id, "Capture stdout still open after exit, giving up on drain");
        }
    }

    /// SIGTERM，宽限期后 SIGKILL
    async fn terminate(&self, child: &mut Child) -> io::Result<ExitStatus> {
        if let Some(pid) = child.id() {
            let _ = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .output()
                .await;
        }

        match tokio::time::timeout(self.inner.options.stop_grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!("Capture process ignored SIGTERM, force killing");
                child.kill().await?;
                child.wait().await
            }
        }
    }

    async fn watch_stderr(self, mut stderr: ChildStderr) {
        let mut throttle = StderrThrottle::new(STDERR_LOG_WINDOW);
        let mut buf = vec![0u8; 4096];
        loop {
            let n = match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if !throttle.allow(Instant::now()) {
                continue;
            }
            let text = String::from_utf8_lossy(&buf[..n]);
            let excerpt: String = text.trim().chars().take(STDERR_EXCERPT_CHARS).collect();
            if is_failure_output(&text) {
                error!(output = %excerpt, "Capture process reported error");
                self.emit(StreamEvent::StreamError(excerpt));
            } else {
                debug!(output = %excerpt, "Capture process output");
            }
        }
    }

    fn on_frame(&self, frame: Vec<u8>) {
        let size = frame.len();
        let at = Utc::now();
        let meta = SnapshotMeta {
            timestamp: at,
            stream_status: StreamStatus::Active,
            error: None,
        };
        if self.inner.cache.store(frame, meta).is_none() {
            return;
        }

        let rate = {
            let mut st = self.state();
            st.frame_count += 1;
            st.frames_since_start += 1;
            st.last_frame_at = Some(at);
            st.last_frame_instant = Some(Instant::now());
            st.retry_count = 0;
            st.snapshot_rate()
        };

        self.inner.metrics.mark_snapshot(at);
        self.inner.metrics.set_snapshot_rate(rate);
        debug!(size, "Snapshot captured");
        self.emit(StreamEvent::FrameReceived { size, at });
    }

    fn on_exit(&self, epoch: u64, session_id: u64, exit: io::Result<ExitStatus>) {
        let code = exit.as_ref().ok().and_then(|status| status.code());
        let failure = {
            let mut st = self.state();
            if st.session.as_ref().map(|s| s.id) == Some(session_id) {
                st.session = None;
            }
            if !st.is_current(epoch) {
                None
            } else {
                match &exit {
                    Ok(status) if status.success() => {
                        st.desired = false;
                        st.state = CaptureState::Stopped;
                        None
                    }
                    Ok(status) => Some(match status.code() {
                        Some(code) => format!("capture process exited with code {}", code),
                        None => "capture process terminated by signal".to_string(),
                    }),
                    Err(e) => Some(format!("failed to wait for capture process: {}", e)),
                }
            }
        };

        self.inner.metrics.set_process_up(false);
        self.inner.metrics.set_stream_up(false);
        info!(code = ?code, session = session_id, "Capture process exited");
        self.emit(StreamEvent::Exited { code });

        if let Some(reason) = failure {
            self.handle_failure(epoch, reason);
        }
    }

    fn handle_failure(&self, epoch: u64, reason: String) {
        let max_retries = self.inner.config.get_config().capture.max_retries;
        let decision = {
            let mut st = self.state();
            if !st.is_current(epoch) {
                return;
            }
            st.retry_count += 1;
            st.restart_count += 1;
            let decision = self.inner.options.retry.decide(st.retry_count, max_retries);
            match decision {
                RetryDecision::Retry { .. } => st.state = CaptureState::Retrying,
                RetryDecision::GiveUp { .. } => {
                    st.state = CaptureState::Failed;
                    st.desired = false;
                }
            }
            decision
        };
        self.inner.metrics.inc_stream_restarts();

        match decision {
            RetryDecision::Retry { attempt, delay } => {
                warn!(
                    attempt,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Scheduling capture restart"
                );
                self.emit(StreamEvent::RetryScheduled { attempt, delay });
                let this = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let relaunch = {
                        let mut st = this.state();
                        let ok = st.is_current(epoch) && st.state == CaptureState::Retrying;
                        if ok {
                            st.state = CaptureState::Starting;
                        }
                        ok
                    };
                    if relaunch {
                        this.launch(epoch);
                    }
                });
            }
            RetryDecision::GiveUp { attempts } => {
                error!(attempts, reason = %reason, "Capture failed, max retries exceeded");
                let message = format!("Stream failed after {} attempts: {}", attempts, reason);
                self.inner
                    .cache
                    .store(Vec::new(), SnapshotMeta::error(message.clone()));
                self.emit(StreamEvent::StreamFailed(message));
            }
        }
    }

    /// 停止采集，可重复调用
    pub fn stop(&self) {
        self.stop_epoch();
    }

    /// 停止采集并返回新的 epoch
    fn stop_epoch(&self) -> u64 {
        let (epoch, stop_tx) = {
            let mut st = self.state();
            st.desired = false;
            st.epoch += 1;
            st.state = CaptureState::Stopped;
            (st.epoch, st.session.as_mut().and_then(|s| s.stop_tx.take()))
        };
        self.inner.metrics.set_stream_up(false);

        match stop_tx {
            Some(tx) => {
                info!("Stopping capture process");
                let _ = tx.send(());
            }
            None => debug!("No capture process to stop"),
        }
        epoch
    }

    /// 停止并等待进程退出
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.stop();
        let deadline = Instant::now() + timeout;
        while self.process_id().is_some() {
            if Instant::now() >= deadline {
                warn!("Timed out waiting for capture process to exit");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// stop + 等待 settle + start
    ///
    /// settle 期间若有其他 stop / start，本次不再启动。返回是否重新启动。
    pub async fn restart(&self, settle: Duration) -> bool {
        info!(settle_ms = settle.as_millis() as u64, "Restarting capture");
        let epoch = self.stop_epoch();
        tokio::time::sleep(settle).await;
        self.start_at(Some(epoch))
    }

    /// 进程存活且帧未断流
    pub fn is_healthy(&self) -> bool {
        let window = self.inner.config.get_config().stale_frame_window();
        let st = self.state();
        if !st.desired || st.state != CaptureState::Running {
            return false;
        }
        let Some(session) = st.session.as_ref().filter(|s| s.pid.is_some()) else {
            return false;
        };
        !frame_stale(st.last_frame_instant, session.started_at, window, Instant::now())
    }

    pub fn capture_state(&self) -> CaptureState {
        self.state().state
    }

    pub fn is_running(&self) -> bool {
        self.state().desired
    }

    pub fn process_id(&self) -> Option<u32> {
        self.state().session.as_ref().and_then(|s| s.pid)
    }

    /// 最近一帧距今
    pub fn last_frame_age(&self) -> Option<Duration> {
        self.state().last_frame_instant.map(|t| t.elapsed())
    }

    pub fn get_status(&self) -> CaptureStatus {
        let config = self.inner.config.get_config();
        let st = self.state();
        CaptureStatus {
            state: st.state,
            is_running: st.desired,
            process_id: st.session.as_ref().and_then(|s| s.pid),
            retry_count: st.retry_count,
            restart_count: st.restart_count,
            frame_count: st.frame_count,
            last_frame_at: st.last_frame_at,
            uptime_ms: st
                .started_at
                .filter(|_| st.desired)
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0),
            snapshot_rate_per_minute: st.snapshot_rate(),
            stream_url: mask_url_credentials(&config.capture.source_url),
            launcher: self.inner.launcher.name().to_string(),
        }
    }
}

async fn read_chunk(stdout: &mut Option<ChildStdout>, buf: &mut [u8]) -> io::Result<usize> {
    match stdout {
        Some(out) => out.read(buf).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_stale_uses_last_frame() {
        let start = Instant::now();
        let window = Duration::from_secs(30);
        let last = start + Duration::from_secs(10);

        assert!(!frame_stale(Some(last), start, window, last + Duration::from_secs(29)));
        assert!(frame_stale(Some(last), start, window, last + Duration::from_secs(31)));
    }

    #[test]
    fn test_frame_stale_without_frames_uses_session_start() {
        let start = Instant::now();
        let window = Duration::from_secs(30);

        assert!(!frame_stale(None, start, window, start + Duration::from_secs(5)));
        assert!(frame_stale(None, start, window, start + Duration::from_secs(31)));
    }

    #[test]
    fn test_frame_from_previous_session_ignored() {
        let old_frame = Instant::now();
        let start = old_frame + Duration::from_secs(100);
        let window = Duration::from_secs(30);

        assert!(!frame_stale(Some(old_frame), start, window, start + Duration::from_secs(1)));
    }

    #[test]
    fn test_failure_keywords_case_insensitive() {
        assert!(is_failure_output("Connection FAILED"));
        assert!(is_failure_output("[rtsp] Error opening input"));
        assert!(!is_failure_output("frame=  10 fps=0.1 q=3.0"));
    }

    #[test]
    fn test_stderr_throttle_window() {
        let mut throttle = StderrThrottle::new(Duration::from_secs(5));
        let t0 = Instant::now();

        assert!(throttle.allow(t0));
        assert!(!throttle.allow(t0 + Duration::from_secs(1)));
        assert!(!throttle.allow(t0 + Duration::from_millis(4999)));
        assert!(throttle.allow(t0 + Duration::from_secs(5)));
    }
}
