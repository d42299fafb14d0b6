//! Microphone level meter
//!
//! Small diagnostic that prints a smoothed input level bar for ten seconds
//! without touching the network. Useful for checking device selection and
//! gain before running the assistant.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use zetalive::{AudioCaptureOptions, AudioCapturePipeline};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let device = std::env::args().nth(1);
    println!("🎤 Microphone level meter (10 seconds)");
    match &device {
        Some(device) => println!("Input device: {}", device),
        None => println!("Input device: default"),
    }
    println!();

    let bytes_captured = Arc::new(AtomicUsize::new(0));
    let mut pipeline = AudioCapturePipeline::new(AudioCaptureOptions { device });
    pipeline.set_volume_listener(|level| {
        let bar = "#".repeat(((level * 400.0) as usize).min(60));
        println!("{:.4} {}", level, bar);
    });
    {
        let bytes_captured = bytes_captured.clone();
        pipeline.start(move |chunk| {
            bytes_captured.fetch_add(chunk.data.len(), Ordering::Relaxed);
        })?;
    }

    thread::sleep(Duration::from_secs(10));
    pipeline.stop();

    println!(
        "\nCaptured {} bytes of PCM16 in 10 seconds",
        bytes_captured.load(Ordering::Relaxed)
    );
    Ok(())
}
