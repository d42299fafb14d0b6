//! Microphone capture pipeline
//!
//! Reads float samples from PulseAudio on a dedicated thread, batches them
//! into fixed-size PCM16 frames through [`PcmFrameBridge`], and hands each
//! frame to the caller ready to stream. A smoothed volume level is reported
//! on the side for UI meters.

use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::live::MediaChunk;
use crate::pcm::{PcmFrameBridge, INPUT_SAMPLE_RATE};

const CHANNELS: u8 = 1;
/// Samples per device read, 20ms at the capture rate.
const READ_SAMPLES: usize = 320;

#[derive(Debug, Error)]
pub enum AudioCaptureError {
    #[error("audio device error: {0}")]
    Device(String),
}

#[derive(Debug, Clone, Default)]
pub struct AudioCaptureOptions {
    /// PulseAudio source name; `None` uses the default input.
    pub device: Option<String>,
}

pub struct AudioCapturePipeline {
    opts: AudioCaptureOptions,
    volume_listener: Option<Box<dyn FnMut(f32) + Send>>,
    stop: Option<Arc<AtomicBool>>,
}

impl AudioCapturePipeline {
    pub fn new(opts: AudioCaptureOptions) -> Self {
        Self {
            opts,
            volume_listener: None,
            stop: None,
        }
    }

    /// Register a listener for smoothed volume levels in `[0, 1]`. The
    /// listener moves to the capture thread on start, so set it again
    /// before restarting.
    pub fn set_volume_listener<F>(&mut self, listener: F)
    where
        F: FnMut(f32) + Send + 'static,
    {
        self.volume_listener = Some(Box::new(listener));
    }

    /// Open the device and start streaming PCM16 frames to `on_frame`.
    /// Blocks until the device is acquired so failures surface here, not on
    /// the capture thread. Starting a running pipeline does nothing.
    pub fn start<F>(&mut self, on_frame: F) -> Result<(), AudioCaptureError>
    where
        F: FnMut(MediaChunk) + Send + 'static,
    {
        if self.stop.is_some() {
            debug!("Audio pipeline already running");
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();
        let device = self.opts.device.clone();
        let volume_listener = self.volume_listener.take();
        {
            let stop = stop.clone();
            std::thread::spawn(move || {
                capture_thread(device, stop, ready_tx, Box::new(on_frame), volume_listener)
            });
        }
        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.stop = Some(stop);
                info!(rate = INPUT_SAMPLE_RATE, "Audio capture started");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AudioCaptureError::Device(
                "capture thread exited before opening the device".to_string(),
            )),
        }
    }

    /// Signal the capture thread to exit. It notices on its next device
    /// read; no frames are delivered after this returns.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.store(true, Ordering::SeqCst);
            info!("Audio capture stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop.is_some()
    }
}

impl Drop for AudioCapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_thread(
    device: Option<String>,
    stop: Arc<AtomicBool>,
    ready: mpsc::Sender<Result<(), AudioCaptureError>>,
    mut on_frame: Box<dyn FnMut(MediaChunk) + Send>,
    mut volume_listener: Option<Box<dyn FnMut(f32) + Send>>,
) {
    let spec = Spec {
        format: Format::F32le,
        channels: CHANNELS,
        rate: INPUT_SAMPLE_RATE,
    };
    assert!(spec.is_valid());

    // The handle stays on this thread for its whole life.
    let capture = match Simple::new(
        None, // default server
        "zetalive",
        Direction::Record,
        device.as_deref(),
        "capture",
        &spec,
        None, // default channel map
        None, // default buffering
    ) {
        Ok(capture) => capture,
        Err(e) => {
            let _ = ready.send(Err(AudioCaptureError::Device(format!("{e}"))));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut bridge = PcmFrameBridge::new();
    let mut block = vec![0f32; READ_SAMPLES];
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = capture.read(bytemuck::cast_slice_mut(&mut block)) {
            error!("Audio read failed: {e}");
            break;
        }
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let output = bridge.push(&block);
        for frame in output.frames {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            on_frame(MediaChunk::audio(frame));
        }
        if let (Some(listener), Some(level)) = (volume_listener.as_mut(), output.level) {
            listener(level);
        }
    }
}
