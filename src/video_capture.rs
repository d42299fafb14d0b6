//! Video capture pipeline
//!
//! Pulls raw frames from a [`VideoSource`], throttles them to the target
//! rate, hands them to the processing worker, and forwards encoded JPEG
//! chunks to the caller. Processing latency feeds back into the adaptive
//! quality controller, so a slow machine degrades quality instead of
//! falling behind.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::frame_worker::{run_worker, CaptureFrame, FrameJob, FrameOutcome};
use crate::live::MediaChunk;
use crate::quality::{AdaptiveQualityController, QualityOptions};

#[derive(Debug, Error)]
pub enum VideoCaptureError {
    #[error("video device error: {0}")]
    Device(String),

    #[error("video stream error: {0}")]
    Stream(String),
}

#[derive(Debug, Clone)]
pub struct VideoCaptureOptions {
    pub target_fps: u32,
    /// Width cap for outgoing frames; zero disables scaling.
    pub max_width: u32,
    /// Fraction of changed pixels below which a frame is considered still.
    pub motion_threshold: f32,
    pub quality: QualityOptions,
}

impl Default for VideoCaptureOptions {
    fn default() -> Self {
        Self {
            target_fps: 30,
            max_width: 640,
            motion_threshold: 0.05,
            quality: QualityOptions::default(),
        }
    }
}

/// A blocking producer of raw frames. [`next_frame`](Self::next_frame)
/// blocks until a frame is available and returns an error once the stream
/// ends.
pub trait VideoSource: Send + 'static {
    fn next_frame(&mut self) -> Result<CaptureFrame, VideoCaptureError>;
}

struct Running {
    stop: Arc<AtomicBool>,
}

pub struct VideoCapturePipeline {
    opts: VideoCaptureOptions,
    running: Option<Running>,
    dropped_frames: Arc<AtomicU64>,
}

impl VideoCapturePipeline {
    pub fn new(opts: VideoCaptureOptions) -> Self {
        Self {
            opts,
            running: None,
            dropped_frames: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start streaming from `source`, delivering each encoded frame to
    /// `on_frame` as a JPEG media chunk. Starting an already running
    /// pipeline does nothing.
    pub fn start<S, F>(&mut self, source: S, on_frame: F)
    where
        S: VideoSource,
        F: FnMut(MediaChunk) + Send + 'static,
    {
        if self.running.is_some() {
            debug!("Video pipeline already running");
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let quality = Arc::new(Mutex::new(AdaptiveQualityController::new(
            self.opts.quality.clone(),
        )));

        let (job_tx, job_rx) = mpsc::channel::<FrameJob>();
        let (outcome_tx, outcome_rx) = mpsc::channel::<FrameOutcome>();

        std::thread::spawn(move || run_worker(job_rx, outcome_tx));

        {
            let quality = quality.clone();
            let stop = stop.clone();
            let dropped = self.dropped_frames.clone();
            let mut on_frame = on_frame;
            std::thread::spawn(move || {
                while let Ok(outcome) = outcome_rx.recv() {
                    match outcome {
                        FrameOutcome::Encoded { jpeg, latency } => {
                            quality.lock().unwrap().record_latency(latency);
                            if stop.load(Ordering::SeqCst) {
                                break;
                            }
                            on_frame(MediaChunk::jpeg(jpeg));
                        }
                        FrameOutcome::NoMotion => {}
                        FrameOutcome::Failed(e) => {
                            warn!("Dropping video frame: {e}");
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            });
        }

        {
            let opts = self.opts.clone();
            let stop = stop.clone();
            std::thread::spawn(move || capture_loop(source, opts, quality, job_tx, stop));
        }

        self.running = Some(Running { stop });
        info!(
            fps = self.opts.target_fps,
            max_width = self.opts.max_width,
            "Video capture started"
        );
    }

    /// Stop streaming. The capture, worker, and delivery threads drain and
    /// exit on their own; a source blocked on its next frame exits when
    /// that frame arrives.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop.store(true, Ordering::SeqCst);
            info!("Video capture stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Frames lost to processing failures since the pipeline was created.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

impl Drop for VideoCapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    mut source: impl VideoSource,
    opts: VideoCaptureOptions,
    quality: Arc<Mutex<AdaptiveQualityController>>,
    jobs: Sender<FrameJob>,
    stop: Arc<AtomicBool>,
) {
    let min_interval = Duration::from_secs_f64(1.0 / opts.target_fps.max(1) as f64);
    let mut last_sent: Option<Instant> = None;
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Video source ended: {e}");
                break;
            }
        };
        if stop.load(Ordering::SeqCst) {
            break;
        }
        // pacing rides on source delivery, not a timer
        if let Some(last) = last_sent {
            if last.elapsed() < min_interval {
                continue;
            }
        }
        let job = FrameJob {
            frame,
            max_width: opts.max_width,
            quality: quality.lock().unwrap().optimal_quality(),
            motion_threshold: opts.motion_threshold,
        };
        if jobs.send(job).is_err() {
            break;
        }
        last_sent = Some(Instant::now());
    }
}
