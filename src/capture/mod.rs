//! 采集模块 - 监督外部采集进程，把输出切成 JPEG 快照写入缓存

pub mod backoff;
pub mod frame;
pub mod launcher;
pub mod supervisor;

pub use backoff::{RetryDecision, RetryPolicy};
pub use frame::{ExtractorStats, JpegFrameExtractor, JPEG_EOI, JPEG_SOI, MAX_PENDING_BYTES};
pub use launcher::{CaptureLauncher, FfmpegLauncher, ShellLauncher};
pub use supervisor::{
    CaptureState, CaptureStatus, CaptureSupervisor, StreamEvent, SupervisorOptions,
    DEFAULT_STOP_GRACE,
};
