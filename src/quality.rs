//! Adaptive JPEG quality control for the video pipeline
//!
//! Encode latency drives an additive loop: when recent frames cost more than
//! the processing budget, quality steps down; when they cost well under half
//! the budget, it creeps back up. Steps are asymmetric so recovery is slower
//! than backoff.

use std::collections::VecDeque;
use std::time::Duration;

const LATENCY_WINDOW: usize = 10;
const MIN_SAMPLES: usize = 5;

/// Tuning for [`AdaptiveQualityController`]. Quality is on the 1..=100
/// integer scale JPEG encoders take.
#[derive(Debug, Clone)]
pub struct QualityOptions {
    /// Mean processing time above which quality is reduced.
    pub budget: Duration,
    pub min_quality: i32,
    pub max_quality: i32,
    pub initial_quality: i32,
    pub step_down: i32,
    pub step_up: i32,
}

impl Default for QualityOptions {
    fn default() -> Self {
        Self {
            budget: Duration::from_millis(100),
            min_quality: 30,
            max_quality: 80,
            initial_quality: 50,
            step_down: 10,
            step_up: 5,
        }
    }
}

/// Tracks recent frame processing latencies and derives the JPEG quality to
/// use for the next frame.
pub struct AdaptiveQualityController {
    opts: QualityOptions,
    latencies: VecDeque<Duration>,
    current: i32,
}

impl AdaptiveQualityController {
    pub fn new(opts: QualityOptions) -> Self {
        let current = opts.initial_quality;
        Self {
            opts,
            latencies: VecDeque::with_capacity(LATENCY_WINDOW + 1),
            current,
        }
    }

    /// Record the processing latency of one encoded frame.
    pub fn record_latency(&mut self, latency: Duration) {
        self.latencies.push_back(latency);
        if self.latencies.len() > LATENCY_WINDOW {
            self.latencies.pop_front();
        }
    }

    /// Quality for the next frame. Re-evaluates the rolling mean on every
    /// call once enough samples exist; below that the current value is
    /// returned unchanged.
    pub fn optimal_quality(&mut self) -> i32 {
        if self.latencies.len() < MIN_SAMPLES {
            return self.current;
        }
        let total: Duration = self.latencies.iter().sum();
        let mean = total / self.latencies.len() as u32;
        if mean > self.opts.budget {
            self.current = (self.current - self.opts.step_down).max(self.opts.min_quality);
        } else if mean < self.opts.budget / 2 {
            self.current = (self.current + self.opts.step_up).min(self.opts.max_quality);
        }
        self.current
    }
}
