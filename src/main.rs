//! zetalive assistant
//!
//! Streams microphone audio and the primary screen into a live session and
//! plays the model's audio replies through the default output. Ctrl-C ends
//! the session.

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use zetalive::{
    AudioCaptureOptions, AudioCapturePipeline, AudioPlaybackQueue, LiveClient, LiveClientConfig,
    LiveEvent, MediaChunk, PulseSink, ScreenSource, VideoCaptureOptions, VideoCapturePipeline,
};

/// Commands for the task that owns the client and serializes all sends.
enum ClientCommand {
    Realtime(MediaChunk),
    Disconnect,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting zetalive assistant");

    let api_key = std::env::var("GEMINI_API_KEY").context("GEMINI_API_KEY must be set")?;
    let config = LiveClientConfig::from_api_key(&api_key);

    let mut client = LiveClient::new(config);
    let mut events = client.subscribe();
    client.connect().await?;

    let playback = AudioPlaybackQueue::spawn(PulseSink::new(None));

    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<ClientCommand>();
    let client_task = tokio::spawn(async move {
        while let Some(command) = command_rx.recv().await {
            match command {
                ClientCommand::Realtime(chunk) => {
                    if let Err(e) = client.send_realtime_input(vec![chunk]).await {
                        warn!("Dropping realtime input: {e}");
                    }
                }
                ClientCommand::Disconnect => {
                    client.disconnect().await;
                    break;
                }
            }
        }
    });

    let event_playback = playback.clone();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LiveEvent::Audio(data)) => event_playback.enqueue(data),
                Ok(LiveEvent::Interrupted) => {
                    info!("Generation interrupted");
                    event_playback.flush();
                }
                Ok(LiveEvent::Content { parts }) => {
                    for part in &parts {
                        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                            info!("Model: {text}");
                        }
                    }
                }
                Ok(LiveEvent::SetupComplete) => info!("Session ready"),
                Ok(LiveEvent::TurnComplete) => debug!("Turn complete"),
                Ok(LiveEvent::ToolCall(call)) => warn!("Unhandled tool call: {call}"),
                Ok(LiveEvent::Close { reason }) => {
                    info!(?reason, "Session closed");
                    event_playback.flush();
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Dropped {n} events"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut mic = AudioCapturePipeline::new(AudioCaptureOptions::default());
    mic.set_volume_listener(|level| debug!("Mic level: {level:.3}"));
    {
        let command_tx = command_tx.clone();
        mic.start(move |chunk| {
            let _ = command_tx.send(ClientCommand::Realtime(chunk));
        })?;
    }

    let mut video = VideoCapturePipeline::new(VideoCaptureOptions {
        target_fps: 20,
        ..VideoCaptureOptions::default()
    });
    match ScreenSource::new() {
        Ok(source) => {
            let command_tx = command_tx.clone();
            video.start(source, move |chunk| {
                let _ = command_tx.send(ClientCommand::Realtime(chunk));
            });
        }
        Err(e) => warn!("Screen capture unavailable: {e}"),
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("Shutting down");

    mic.stop();
    video.stop();
    let _ = command_tx.send(ClientCommand::Disconnect);
    let _ = client_task.await;
    let _ = event_task.await;

    info!("zetalive assistant stopped");
    Ok(())
}
