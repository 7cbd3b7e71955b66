//! 采集进程启动器 - 根据当前配置构造子进程命令

use anyhow::{Context, Result};
use std::process::Stdio;
use tokio::process::Command;

use crate::config::AgentConfig;

/// 采集进程启动器 trait
///
/// 返回的命令必须把 JPEG 帧流写到 stdout。
pub trait CaptureLauncher: Send + Sync {
    /// 构造启动命令
    fn command(&self, config: &AgentConfig) -> Result<Command>;

    /// 日志用的名称
    fn name(&self) -> &str;
}

fn piped(mut command: Command) -> Command {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

/// ffmpeg：拉取 RTSP 流并按间隔输出 MJPEG
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegLauncher;

impl FfmpegLauncher {
    /// ffmpeg 参数（不含程序名）
    pub fn args(config: &AgentConfig) -> Vec<String> {
        let capture = &config.capture;
        let snapshot = &config.snapshot;
        vec![
            "-rtsp_transport".to_string(),
            capture.transport.as_str().to_string(),
            "-timeout".to_string(),
            capture.timeout_micros.to_string(),
            "-i".to_string(),
            capture.source_url.clone(),
            "-vf".to_string(),
            format!("fps=1/{}", snapshot.interval_sec),
            "-f".to_string(),
            "image2pipe".to_string(),
            "-vcodec".to_string(),
            "mjpeg".to_string(),
            "-q:v".to_string(),
            snapshot.quality.to_string(),
            "-".to_string(),
        ]
    }
}

impl CaptureLauncher for FfmpegLauncher {
    fn command(&self, config: &AgentConfig) -> Result<Command> {
        let program = &config.capture.ffmpeg_path;
        let binary = which::which(program)
            .with_context(|| format!("capture binary not found: {}", program))?;

        let mut command = Command::new(binary);
        command.args(Self::args(config));
        Ok(piped(command))
    }

    fn name(&self) -> &str {
        "ffmpeg"
    }
}

/// 通过 `sh -c` 运行任意采集管道（如 libcamera-vid、gst-launch）
#[derive(Debug, Clone)]
pub struct ShellLauncher {
    script: String,
}

impl ShellLauncher {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }

    pub fn script(&self) -> &str {
        &self.script
    }
}

impl CaptureLauncher for ShellLauncher {
    fn command(&self, _config: &AgentConfig) -> Result<Command> {
        let mut command = Command::new("sh");
        command.args(["-c", &self.script]);
        Ok(piped(command))
    }

    fn name(&self) -> &str {
        "shell"
    }
}
