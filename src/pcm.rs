//! PCM16 framing and level metering for the capture path
//!
//! Capture delivers float samples; the live API wants fixed-size 16-bit
//! little-endian frames at 16 kHz. The bridge accumulates samples into a
//! power-of-two buffer and only emits whole frames. A smoothed RMS meter
//! rides along for level display.

use smallvec::SmallVec;
use std::time::{Duration, Instant};

/// Sample rate of captured microphone audio sent to the API.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of PCM audio the API streams back.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Samples accumulated before a frame is emitted.
pub const FRAME_SAMPLES: usize = 1024;

const VOLUME_SMOOTHING: f32 = 0.8;
const VOLUME_REPORT_INTERVAL: Duration = Duration::from_millis(100);

/// Quantize one float sample to PCM16: clamp to [-1, 1], scale by 32767,
/// round toward zero.
pub fn quantize(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

/// Encode float samples as little-endian PCM16 bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    out
}

/// Decode little-endian PCM16 bytes to samples normalized to [-1, 1].
/// Returns `None` when the byte count is odd.
pub fn decode_pcm16(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect(),
    )
}

/// Result of feeding one block of samples through the bridge.
#[derive(Debug)]
pub struct BridgeOutput {
    /// Completed PCM16 frames, oldest first.
    pub frames: SmallVec<[Vec<u8>; 1]>,
    /// Throttled level report, when one is due.
    pub level: Option<f32>,
}

/// Accumulates capture samples into fixed-size PCM16 frames.
///
/// A frame is emitted only when the buffer fills; partial buffers are never
/// flushed, so stopping capture discards the remainder.
pub struct PcmFrameBridge {
    buf: Vec<f32>,
    meter: VolumeMeter,
}

impl PcmFrameBridge {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(FRAME_SAMPLES),
            meter: VolumeMeter::new(),
        }
    }

    /// Feed one block of capture samples, collecting any completed frames.
    pub fn push(&mut self, samples: &[f32]) -> BridgeOutput {
        let mut frames = SmallVec::new();
        for &sample in samples {
            self.buf.push(sample);
            if self.buf.len() == FRAME_SAMPLES {
                frames.push(encode_pcm16(&self.buf));
                self.buf.clear();
            }
        }
        BridgeOutput {
            frames,
            level: self.meter.update(samples),
        }
    }

    /// Samples currently buffered short of a full frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for PcmFrameBridge {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponentially smoothed RMS level with throttled reporting.
struct VolumeMeter {
    smoothed: f32,
    last_report: Instant,
}

impl VolumeMeter {
    fn new() -> Self {
        Self {
            smoothed: 0.0,
            last_report: Instant::now(),
        }
    }

    fn update(&mut self, samples: &[f32]) -> Option<f32> {
        if samples.is_empty() {
            return None;
        }
        let sum: f32 = samples.iter().map(|s| s * s).sum();
        let rms = (sum / samples.len() as f32).sqrt();
        self.smoothed = VOLUME_SMOOTHING * self.smoothed + (1.0 - VOLUME_SMOOTHING) * rms;
        if self.last_report.elapsed() > VOLUME_REPORT_INTERVAL {
            self.last_report = Instant::now();
            Some(self.smoothed)
        } else {
            None
        }
    }
}
