//! Primary-monitor video source backed by xcap.

use std::sync::mpsc::Receiver;
use std::time::Instant;
use tracing::info;
use xcap::{Frame, Monitor, VideoRecorder};

use crate::frame_worker::CaptureFrame;
use crate::video_capture::{VideoCaptureError, VideoSource};

/// Streams RGBA frames from the primary monitor. The recorder is stopped by
/// dropping the source.
pub struct ScreenSource {
    _recorder: VideoRecorder,
    frames: Receiver<Frame>,
}

impl ScreenSource {
    /// Open the primary monitor, falling back to the first one listed.
    pub fn new() -> Result<Self, VideoCaptureError> {
        let monitors =
            Monitor::all().map_err(|e| VideoCaptureError::Device(e.to_string()))?;
        if monitors.is_empty() {
            return Err(VideoCaptureError::Device("no monitors found".to_string()));
        }
        let monitor = monitors
            .iter()
            .find(|m| m.is_primary().unwrap_or(false))
            .unwrap_or(&monitors[0])
            .clone();

        info!(
            "Capturing monitor: {} ({}x{})",
            monitor.name().unwrap_or_else(|_| "unknown".to_string()),
            monitor.width().unwrap_or(0),
            monitor.height().unwrap_or(0)
        );

        let (recorder, frames) = monitor
            .video_recorder()
            .map_err(|e| VideoCaptureError::Device(e.to_string()))?;
        recorder
            .start()
            .map_err(|e| VideoCaptureError::Device(e.to_string()))?;

        Ok(Self {
            _recorder: recorder,
            frames,
        })
    }
}

impl VideoSource for ScreenSource {
    fn next_frame(&mut self) -> Result<CaptureFrame, VideoCaptureError> {
        let frame = self
            .frames
            .recv()
            .map_err(|_| VideoCaptureError::Stream("screen capture stream ended".to_string()))?;
        Ok(CaptureFrame {
            pixels: frame.raw,
            width: frame.width,
            height: frame.height,
            timestamp: Instant::now(),
        })
    }
}
