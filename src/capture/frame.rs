//! JPEG 分帧 - 从采集进程的字节流中切出完整帧
//!
//! 输出流是首尾相接的 JPEG，没有长度前缀。按 SOI (`FF D8`) 定位帧头，
//! 之后的第一个 EOI (`FF D9`) 为帧尾，首尾之间（含标记）即一帧。
//! 只识别标记字节，不校验图像内容：内嵌缩略图里的 `FF D9` 会导致错误切分。

use tracing::{debug, warn};

pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// 累积缓冲区上限，超过仍未切出帧则整体丢弃
pub const MAX_PENDING_BYTES: usize = 10 * 1024 * 1024;

/// 分帧统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractorStats {
    pub frames: u64,
    pub oversized_dropped: u64,
    pub overflow_resets: u64,
    pub garbage_bytes: u64,
}

enum Scan {
    Frame(Vec<u8>),
    Oversized(usize),
}

/// 增量分帧器
pub struct JpegFrameExtractor {
    buffer: Vec<u8>,
    /// 下一次查找 EOI 的起点，避免重复扫描
    scan_pos: usize,
    max_frame_size: usize,
    max_pending: usize,
    stats: ExtractorStats,
}

fn find_marker(buffer: &[u8], from: usize, marker: [u8; 2]) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}

impl JpegFrameExtractor {
    pub fn new(max_frame_size: usize) -> Self {
        Self::with_limits(max_frame_size, MAX_PENDING_BYTES)
    }

    pub fn with_limits(max_frame_size: usize, max_pending: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scan_pos: JPEG_SOI.len(),
            max_frame_size,
            max_pending,
            stats: ExtractorStats::default(),
        }
    }

    /// 追加一段输出，返回其中已完整的帧（按流顺序）
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(scan) = self.next_frame() {
            match scan {
                Scan::Frame(frame) => {
                    self.stats.frames += 1;
                    frames.push(frame);
                }
                Scan::Oversized(len) => {
                    self.stats.oversized_dropped += 1;
                    warn!(size = len, limit = self.max_frame_size, "Snapshot too large, discarding frame");
                }
            }
        }

        if self.buffer.len() > self.max_pending {
            warn!(size = self.buffer.len(), "Image buffer too large, clearing");
            self.buffer.clear();
            self.scan_pos = JPEG_SOI.len();
            self.stats.overflow_resets += 1;
        }

        frames
    }

    fn next_frame(&mut self) -> Option<Scan> {
        if !self.buffer.starts_with(&JPEG_SOI) {
            self.scan_pos = JPEG_SOI.len();
            match find_marker(&self.buffer, 0, JPEG_SOI) {
                Some(start) => {
                    self.stats.garbage_bytes += start as u64;
                    self.buffer.drain(..start);
                }
                None => {
                    // 末尾的 0xFF 可能是被截断的 SOI
                    let keep = usize::from(self.buffer.last() == Some(&0xFF));
                    let cut = self.buffer.len() - keep;
                    self.stats.garbage_bytes += cut as u64;
                    self.buffer.drain(..cut);
                    return None;
                }
            }
        }

        let from = self.scan_pos.max(JPEG_SOI.len());
        match find_marker(&self.buffer, from, JPEG_EOI) {
            Some(end) => {
                let frame_end = end + JPEG_EOI.len();
                self.scan_pos = JPEG_SOI.len();
                if frame_end > self.max_frame_size {
                    self.buffer.drain(..frame_end);
                    Some(Scan::Oversized(frame_end))
                } else {
                    Some(Scan::Frame(self.buffer.drain(..frame_end).collect()))
                }
            }
            None => {
                self.scan_pos = self.buffer.len().saturating_sub(1).max(JPEG_SOI.len());
                None
            }
        }
    }

    /// 尚未成帧的字节数
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> ExtractorStats {
        self.stats
    }

    pub fn reset(&mut self) {
        if !self.buffer.is_empty() {
            debug!(bytes = self.buffer.len(), "Discarding partial frame");
        }
        self.buffer.clear();
        self.scan_pos = JPEG_SOI.len();
    }
}
