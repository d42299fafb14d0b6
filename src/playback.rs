//! Audio playback queue
//!
//! Plays model audio strictly in arrival order with no overlap. Chunks are
//! queued on an async task and written by a serial sink thread; a flush
//! bumps the shared cancel generation, which stops in-flight writes between
//! slices and invalidates everything still queued.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;

use crate::pcm::{decode_pcm16, OUTPUT_SAMPLE_RATE};

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("audio decode error: {0}")]
    Decode(String),

    #[error("playback device error: {0}")]
    Device(String),

    #[error("playback stream error: {0}")]
    Stream(String),
}

/// Generation counter shared between the queue and its sink. Bumping it
/// invalidates everything queued or in flight.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicU64>);

impl CancelToken {
    pub fn generation(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// A serial audio output. `play` blocks until the samples are written or
/// the generation goes stale; implementations check the token between
/// slices so a flush can take effect mid-chunk.
pub trait AudioSink: Send + 'static {
    fn open(&mut self) -> Result<(), PlaybackError>;
    fn play(&mut self, samples: &[f32], generation: u64) -> Result<(), PlaybackError>;
    fn token(&self) -> CancelToken;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeHint {
    /// Even byte counts are raw PCM16 at the output rate.
    RawPcm,
    /// Anything else is treated as a self-describing container.
    Container,
}

struct PlaybackItem {
    data: Vec<u8>,
    hint: DecodeHint,
}

impl PlaybackItem {
    fn new(data: Vec<u8>) -> Self {
        let hint = if data.len() % 2 == 0 {
            DecodeHint::RawPcm
        } else {
            DecodeHint::Container
        };
        Self { data, hint }
    }
}

enum Command {
    Enqueue { generation: u64, data: Vec<u8> },
    Flush,
}

/// Handle to the playback queue. Cheap to clone; all clones feed the same
/// queue.
#[derive(Clone)]
pub struct AudioPlaybackQueue {
    commands: UnboundedSender<Command>,
    token: CancelToken,
}

impl AudioPlaybackQueue {
    /// Spawn the queue task and the sink thread around `sink`. Must be
    /// called on the runtime.
    pub fn spawn<S: AudioSink>(sink: S) -> Self {
        let token = sink.token();
        let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();
        let (play_tx, play_rx) = mpsc::channel::<(u64, Vec<f32>)>();
        let (done_tx, done_rx) = tokio::sync::mpsc::unbounded_channel();

        std::thread::spawn(move || sink_thread(sink, play_rx, done_tx));
        tokio::spawn(run_queue(cmd_rx, done_rx, play_tx, token.clone()));

        Self {
            commands: cmd_tx,
            token,
        }
    }

    /// Queue one chunk of model audio behind whatever is already waiting.
    pub fn enqueue(&self, data: Vec<u8>) {
        let _ = self.commands.send(Command::Enqueue {
            generation: self.token.generation(),
            data,
        });
    }

    /// Drop everything queued and cancel the chunk being played. Chunks
    /// enqueued after the flush play normally.
    pub fn flush(&self) {
        self.token.bump();
        let _ = self.commands.send(Command::Flush);
    }
}

async fn run_queue(
    mut commands: UnboundedReceiver<Command>,
    mut done: UnboundedReceiver<u64>,
    play: mpsc::Sender<(u64, Vec<f32>)>,
    token: CancelToken,
) {
    let mut queue: VecDeque<PlaybackItem> = VecDeque::new();
    let mut playing = false;
    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::Enqueue { generation, data }) => {
                        if generation != token.generation() {
                            // flushed before the queue saw it
                            continue;
                        }
                        queue.push_back(PlaybackItem::new(data));
                        if !playing {
                            playing = start_next(&mut queue, &play, &token);
                        }
                    }
                    Some(Command::Flush) => {
                        debug!(dropped = queue.len(), "Playback queue flushed");
                        queue.clear();
                        playing = false;
                    }
                    None => break,
                }
            }
            Some(generation) = done.recv() => {
                // completions from before a flush are stale
                if generation == token.generation() {
                    playing = start_next(&mut queue, &play, &token);
                }
            }
        }
    }
}

/// Pop items until one decodes and hand it to the sink. Returns whether
/// something is now playing.
fn start_next(
    queue: &mut VecDeque<PlaybackItem>,
    play: &mpsc::Sender<(u64, Vec<f32>)>,
    token: &CancelToken,
) -> bool {
    while let Some(item) = queue.pop_front() {
        match decode_item(&item) {
            Ok(samples) => {
                if play.send((token.generation(), samples)).is_err() {
                    error!("Playback sink is gone");
                    return false;
                }
                return true;
            }
            Err(e) => warn!("Skipping undecodable audio chunk: {e}"),
        }
    }
    false
}

fn decode_item(item: &PlaybackItem) -> Result<Vec<f32>, PlaybackError> {
    match item.hint {
        DecodeHint::RawPcm => decode_pcm16(&item.data)
            .ok_or_else(|| PlaybackError::Decode("odd byte count for raw PCM".to_string())),
        DecodeHint::Container => decode_container(&item.data),
    }
}

fn decode_container(data: &[u8]) -> Result<Vec<f32>, PlaybackError> {
    let reader = hound::WavReader::new(Cursor::new(data))
        .map_err(|e| PlaybackError::Decode(e.to_string()))?;
    let spec = reader.spec();
    if spec.sample_rate != OUTPUT_SAMPLE_RATE {
        debug!(
            rate = spec.sample_rate,
            "Container sample rate differs from the output rate"
        );
    }
    match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .into_samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<Result<Vec<f32>, _>>()
            .map_err(|e| PlaybackError::Decode(e.to_string())),
        (hound::SampleFormat::Float, 32) => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<f32>, _>>()
            .map_err(|e| PlaybackError::Decode(e.to_string())),
        (format, bits) => Err(PlaybackError::Decode(format!(
            "unsupported sample format {format:?} at {bits} bits"
        ))),
    }
}

fn sink_thread<S: AudioSink>(
    mut sink: S,
    items: mpsc::Receiver<(u64, Vec<f32>)>,
    done: UnboundedSender<u64>,
) {
    let token = sink.token();
    let opened = match sink.open() {
        Ok(()) => true,
        Err(e) => {
            // keep draining so the queue still advances
            error!("Playback device unavailable: {e}");
            false
        }
    };
    while let Ok((generation, samples)) = items.recv() {
        if opened && generation == token.generation() {
            if let Err(e) = sink.play(&samples, generation) {
                warn!("Playback write failed: {e}");
            }
        }
        if done.send(generation).is_err() {
            break;
        }
    }
}

/// Samples per write slice, 20ms at the output rate.
const SLICE_SAMPLES: usize = OUTPUT_SAMPLE_RATE as usize / 50;

/// PulseAudio sink at the model's output rate. The device handle is
/// created in `open`, which runs on the sink thread where it stays.
pub struct PulseSink {
    device: Option<String>,
    stream: Option<Simple>,
    token: CancelToken,
}

impl PulseSink {
    pub fn new(device: Option<String>) -> Self {
        Self {
            device,
            stream: None,
            token: CancelToken::default(),
        }
    }
}

impl AudioSink for PulseSink {
    fn open(&mut self) -> Result<(), PlaybackError> {
        let spec = Spec {
            format: Format::F32le,
            channels: 1,
            rate: OUTPUT_SAMPLE_RATE,
        };
        assert!(spec.is_valid());
        let stream = Simple::new(
            None, // default server
            "zetalive",
            Direction::Playback,
            self.device.as_deref(),
            "playback",
            &spec,
            None, // default channel map
            None, // default buffering
        )
        .map_err(|e| PlaybackError::Device(format!("{e}")))?;
        self.stream = Some(stream);
        info!(rate = OUTPUT_SAMPLE_RATE, "Playback sink open");
        Ok(())
    }

    fn play(&mut self, samples: &[f32], generation: u64) -> Result<(), PlaybackError> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(PlaybackError::Stream("sink not open".to_string()));
        };
        for slice in samples.chunks(SLICE_SAMPLES) {
            if self.token.generation() != generation {
                // flushed mid-chunk; drop what the server buffered
                let _ = stream.flush();
                return Ok(());
            }
            stream
                .write(bytemuck::cast_slice(slice))
                .map_err(|e| PlaybackError::Stream(format!("{e}")))?;
        }
        Ok(())
    }

    fn token(&self) -> CancelToken {
        self.token.clone()
    }
}
