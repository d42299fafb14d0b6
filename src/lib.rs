//! zetalive - realtime multimodal session core
//!
//! Client-side building blocks for bidirectional audio/video/text
//! conversations over one persistent WebSocket: the wire protocol and
//! session client, microphone and screen capture pipelines, and an ordered
//! playback queue for model audio.

#![forbid(unsafe_code)]

pub mod audio_capture;
pub mod frame_worker;
pub mod live;
pub mod live_client;
pub mod pcm;
pub mod playback;
pub mod quality;
pub mod screen;
pub mod video_capture;

pub use audio_capture::{AudioCaptureError, AudioCaptureOptions, AudioCapturePipeline};
pub use live::{LiveClientConfig, LiveConfig, LiveError, LiveEvent, MediaChunk};
pub use live_client::{ConnectionState, LiveClient, TurnPart};
pub use playback::{AudioPlaybackQueue, AudioSink, PlaybackError, PulseSink};
pub use screen::ScreenSource;
pub use video_capture::{VideoCaptureError, VideoCaptureOptions, VideoCapturePipeline, VideoSource};
