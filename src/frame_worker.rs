//! Frame processing worker
//!
//! Runs on its own thread and turns raw RGBA captures into JPEG chunks:
//! downscale to the width cap, gate on motion against the previous frame,
//! encode, and report the processing latency so quality can adapt.

use image::imageops::{self, FilterType};
use image::RgbaImage;
use std::sync::mpsc::{Receiver, Sender};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Per-pixel sum of absolute RGB deltas above this counts as changed.
const PIXEL_DIFF_THRESHOLD: i32 = 30;

/// One captured frame of tightly packed RGBA pixels.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
}

/// A frame paired with the processing parameters in force when it was
/// captured.
#[derive(Debug)]
pub struct FrameJob {
    pub frame: CaptureFrame,
    /// Width cap; zero disables scaling.
    pub max_width: u32,
    pub quality: i32,
    pub motion_threshold: f32,
}

#[derive(Debug)]
pub enum FrameOutcome {
    Encoded { jpeg: Vec<u8>, latency: Duration },
    NoMotion,
    Failed(ProcessingError),
}

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("frame buffer of {len} bytes does not match {width}x{height} RGBA")]
    BadFrame { width: u32, height: u32, len: usize },

    #[error("JPEG encode failed: {0}")]
    Encode(String),
}

/// Process jobs until the job channel closes or the outcome receiver goes
/// away. One outcome is reported per job, in order.
pub fn run_worker(jobs: Receiver<FrameJob>, outcomes: Sender<FrameOutcome>) {
    let mut previous: Option<RgbaImage> = None;
    while let Ok(job) = jobs.recv() {
        let outcome = process_job(job, &mut previous);
        if outcomes.send(outcome).is_err() {
            break;
        }
    }
}

fn process_job(job: FrameJob, previous: &mut Option<RgbaImage>) -> FrameOutcome {
    let FrameJob {
        frame,
        max_width,
        quality,
        motion_threshold,
    } = job;
    let started = Instant::now();

    let pixel_len = frame.pixels.len();
    let Some(image) = RgbaImage::from_raw(frame.width, frame.height, frame.pixels) else {
        return FrameOutcome::Failed(ProcessingError::BadFrame {
            width: frame.width,
            height: frame.height,
            len: pixel_len,
        });
    };
    let resized = resize_to_width(image, max_width);

    let motion = match previous.as_ref() {
        None => true,
        Some(prev) if prev.dimensions() != resized.dimensions() => true,
        Some(prev) => changed_fraction(prev, &resized) > motion_threshold,
    };

    let outcome = if motion {
        match encode_jpeg(&resized, quality) {
            Ok(jpeg) => FrameOutcome::Encoded {
                jpeg,
                latency: started.elapsed(),
            },
            Err(e) => FrameOutcome::Failed(e),
        }
    } else {
        FrameOutcome::NoMotion
    };
    *previous = Some(resized);
    outcome
}

fn resize_to_width(image: RgbaImage, max_width: u32) -> RgbaImage {
    if max_width == 0 || image.width() <= max_width {
        return image;
    }
    let scale = max_width as f32 / image.width() as f32;
    let height = ((image.height() as f32 * scale).round() as u32).max(1);
    imageops::resize(&image, max_width, height, FilterType::Triangle)
}

/// Fraction of pixels whose summed RGB delta exceeds the threshold. Alpha
/// is ignored.
pub fn changed_fraction(a: &RgbaImage, b: &RgbaImage) -> f32 {
    let a = a.as_raw();
    let b = b.as_raw();
    let len = a.len().min(b.len());
    let pixels = len / 4;
    if pixels == 0 {
        return 0.0;
    }
    let mut changed = 0usize;
    for i in (0..pixels).map(|p| p * 4) {
        let dr = (a[i] as i32 - b[i] as i32).abs();
        let dg = (a[i + 1] as i32 - b[i + 1] as i32).abs();
        let db = (a[i + 2] as i32 - b[i + 2] as i32).abs();
        if dr + dg + db > PIXEL_DIFF_THRESHOLD {
            changed += 1;
        }
    }
    changed as f32 / pixels as f32
}

fn encode_jpeg(image: &RgbaImage, quality: i32) -> Result<Vec<u8>, ProcessingError> {
    let jpeg = turbojpeg::compress(
        turbojpeg::Image {
            pixels: image.as_raw().as_slice(),
            width: image.width() as usize,
            pitch: image.width() as usize * 4,
            height: image.height() as usize,
            format: turbojpeg::PixelFormat::RGBA,
        },
        quality,
        turbojpeg::Subsamp::Sub2x2,
    )
    .map_err(|e| ProcessingError::Encode(e.to_string()))?;
    Ok(jpeg.to_vec())
}
