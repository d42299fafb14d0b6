//! Wire protocol for the realtime multimodal live API
//!
//! Defines the outbound envelopes, the inbound frame vocabulary and its
//! routing precedence, the session setup configuration, and the typed events
//! the client fans out to subscribers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use smallvec::SmallVec;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::warn;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_envelope_serialization() {
        let config = LiveClientConfig::from_api_key("k");
        let envelope = ClientEnvelope::Setup(config.setup());
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["setup"]["model"], "models/gemini-2.0-flash-exp");
        assert_eq!(
            parsed["setup"]["generationConfig"]["responseModalities"],
            "audio"
        );
        assert_eq!(
            parsed["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Aoede"
        );
        assert!(parsed["setup"].get("systemInstruction").is_none());
        assert!(parsed["setup"].get("tools").is_none());
    }

    #[test]
    fn system_instruction_and_tools_serialize() {
        let mut config = LiveClientConfig::from_api_key("k");
        config.system_instruction = Some("Be brief.".to_string());
        config.tools = vec![
            ToolDecl::google_search(),
            ToolDecl::functions(vec![FunctionDecl {
                name: "get_weather".to_string(),
                description: Some("Look up weather".to_string()),
                parameters: Some(json!({
                    "type": "object",
                    "properties": {"city": {"type": "string"}}
                })),
            }]),
        ];
        let parsed: Value =
            serde_json::from_str(&serde_json::to_string(&config.setup()).unwrap()).unwrap();

        assert_eq!(parsed["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert_eq!(parsed["tools"][0]["googleSearch"], json!({}));
        assert_eq!(
            parsed["tools"][1]["functionDeclarations"][0]["name"],
            "get_weather"
        );
    }

    #[test]
    fn realtime_input_base64_encodes_chunks() {
        let envelope = ClientEnvelope::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk::audio(vec![1, 2, 3])],
        });
        let parsed: Value =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();

        let chunk = &parsed["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], "AQID");
    }

    #[test]
    fn client_content_wraps_a_user_turn() {
        let envelope = ClientEnvelope::ClientContent(ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part::text("hello")],
            }],
            turn_complete: true,
        });
        let parsed: Value =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();

        assert_eq!(parsed["clientContent"]["turnComplete"], true);
        assert_eq!(parsed["clientContent"]["turns"][0]["role"], "user");
        assert_eq!(parsed["clientContent"]["turns"][0]["parts"][0]["text"], "hello");
    }

    #[test]
    fn media_chunk_round_trips_through_serde() {
        let chunk = MediaChunk::jpeg(vec![0xFF, 0xD8, 0xFF]);
        let json = serde_json::to_string(&chunk).unwrap();
        let back: MediaChunk = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chunk);
    }

    fn audio_part(data: &[u8]) -> Value {
        json!({"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": BASE64.encode(data)}})
    }

    #[test]
    fn model_turn_partitions_audio_from_content() {
        let frame = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [audio_part(&[1]), {"text": "hi"}, audio_part(&[2, 3])]
                }
            }
        });
        let events = events_for_frame(&frame.to_string()).unwrap();

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], LiveEvent::Audio(d) if d == &vec![1]));
        assert!(matches!(&events[1], LiveEvent::Audio(d) if d == &vec![2, 3]));
        match &events[2] {
            LiveEvent::Content { parts } => {
                assert_eq!(parts.len(), 1);
                assert_eq!(parts[0]["text"], "hi");
            }
            other => panic!("expected content event, got {other:?}"),
        }
    }

    #[test]
    fn all_audio_turn_emits_no_content_event() {
        let frame = json!({
            "serverContent": {"modelTurn": {"parts": [audio_part(&[9]), audio_part(&[8])]}}
        });
        let events = events_for_frame(&frame.to_string()).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(e, LiveEvent::Audio(_))));
    }

    #[test]
    fn interrupted_preempts_the_rest_of_the_frame() {
        let frame = json!({
            "serverContent": {
                "interrupted": true,
                "turnComplete": true,
                "modelTurn": {"parts": [{"text": "late"}]}
            }
        });
        let events = events_for_frame(&frame.to_string()).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], LiveEvent::Interrupted));
    }

    #[test]
    fn turn_complete_and_model_turn_both_emit() {
        let frame = json!({
            "serverContent": {
                "turnComplete": true,
                "modelTurn": {"parts": [{"text": "done"}]}
            }
        });
        let events = events_for_frame(&frame.to_string()).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], LiveEvent::TurnComplete));
        assert!(matches!(&events[1], LiveEvent::Content { .. }));
    }

    #[test]
    fn tool_call_takes_precedence_over_server_content() {
        let frame = json!({
            "toolCall": {"functionCalls": [{"id": "1", "name": "f"}]},
            "serverContent": {"turnComplete": true}
        });
        let events = events_for_frame(&frame.to_string()).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], LiveEvent::ToolCall(_)));
    }

    #[test]
    fn cancellation_and_setup_complete_route() {
        let events = events_for_frame(r#"{"toolCallCancellation": {"ids": ["1"]}}"#).unwrap();
        assert!(matches!(&events[0], LiveEvent::ToolCallCancellation(v) if v["ids"][0] == "1"));

        let events = events_for_frame(r#"{"setupComplete": {}}"#).unwrap();
        assert!(matches!(events[0], LiveEvent::SetupComplete));
    }

    #[test]
    fn undecodable_audio_part_is_dropped_not_content() {
        let frame = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"inlineData": {"mimeType": "audio/pcm", "data": "!!!bad"}},
                        {"text": "kept"}
                    ]
                }
            }
        });
        let events = events_for_frame(&frame.to_string()).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            LiveEvent::Content { parts } => assert_eq!(parts.len(), 1),
            other => panic!("expected content event, got {other:?}"),
        }
    }

    #[test]
    fn unmatched_frames_are_errors() {
        assert!(events_for_frame("not json").is_err());
        assert!(events_for_frame(r#"{"unknownKey": 1}"#).is_err());
    }

    #[test]
    fn close_reason_extraction() {
        assert_eq!(extract_close_reason(""), None);
        assert_eq!(
            extract_close_reason("normal shutdown"),
            Some("normal shutdown".to_string())
        );
        assert_eq!(
            extract_close_reason("[1011] ERROR] Quota exceeded"),
            Some("Quota exceeded".to_string())
        );
        // prelude at index zero is left alone
        assert_eq!(
            extract_close_reason("ERROR] boom"),
            Some("ERROR] boom".to_string())
        );
    }

    #[test]
    fn batch_classification() {
        let audio = MediaChunk::audio(vec![0]);
        let video = MediaChunk::jpeg(vec![0]);
        let other = MediaChunk {
            mime_type: "application/octet-stream".to_string(),
            data: vec![0],
        };
        assert_eq!(BatchKind::of(&[audio.clone()]), BatchKind::Audio);
        assert_eq!(BatchKind::of(&[video.clone()]), BatchKind::Video);
        assert_eq!(BatchKind::of(&[audio, video]), BatchKind::Mixed);
        assert_eq!(BatchKind::of(&[other]), BatchKind::Unknown);
        assert_eq!(BatchKind::Mixed.as_str(), "audio + video");
    }
}

pub type Result<T> = std::result::Result<T, LiveError>;

/// Errors surfaced by the live session client.
#[derive(Debug, Error)]
pub enum LiveError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("already connected")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";
pub const DEFAULT_VOICE: &str = "Aoede";

const LIVE_WS_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(de)?;
        STANDARD.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// One unit of streamable media: raw bytes plus their MIME type. The wire
/// shape is `{mimeType, data}` with a base64 payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

impl MediaChunk {
    /// A PCM16 microphone frame at the capture rate.
    pub fn audio(data: Vec<u8>) -> Self {
        Self {
            mime_type: format!("audio/pcm;rate={}", crate::pcm::INPUT_SAMPLE_RATE),
            data,
        }
    }

    /// An encoded video frame.
    pub fn jpeg(data: Vec<u8>) -> Self {
        Self {
            mime_type: "image/jpeg".to_string(),
            data,
        }
    }
}

/// Modalities the model may respond with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Audio,
    Text,
}

impl ResponseModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseModality::Audio => "audio",
            ResponseModality::Text => "text",
        }
    }
}

/// A single content part: text or inline media.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<MediaChunk>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }
}

/// A turn of content with an optional role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

/// Generation parameters inside the setup payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_modalities: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<Value>,
}

/// Nested speech config selecting a prebuilt voice.
pub fn speech_config(voice: &str) -> Value {
    json!({"voiceConfig": {"prebuiltVoiceConfig": {"voiceName": voice}}})
}

/// One tool made available to the model: a built-in capability flag or a
/// batch of function declarations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDecl {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub google_search: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_execution: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub function_declarations: Vec<FunctionDecl>,
}

impl ToolDecl {
    pub fn google_search() -> Self {
        Self {
            google_search: Some(json!({})),
            ..Default::default()
        }
    }

    pub fn code_execution() -> Self {
        Self {
            code_execution: Some(json!({})),
            ..Default::default()
        }
    }

    pub fn functions(declarations: Vec<FunctionDecl>) -> Self {
        Self {
            function_declarations: declarations,
            ..Default::default()
        }
    }
}

/// A callable function exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDecl {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON-schema style parameter description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Session setup payload, the first frame sent after the transport opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveConfig {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tools: Vec<ToolDecl>,
}

/// Client configuration: endpoint plus everything negotiated on connect.
#[derive(Debug, Clone)]
pub struct LiveClientConfig {
    pub url: String,
    pub model: String,
    pub response_modality: ResponseModality,
    pub voice: Option<String>,
    pub system_instruction: Option<String>,
    pub tools: Vec<ToolDecl>,
}

impl LiveClientConfig {
    pub fn from_api_key(api_key: &str) -> Self {
        Self {
            url: format!("{LIVE_WS_URL}?key={api_key}"),
            model: DEFAULT_MODEL.to_string(),
            response_modality: ResponseModality::Audio,
            voice: Some(DEFAULT_VOICE.to_string()),
            system_instruction: None,
            tools: Vec::new(),
        }
    }

    /// Build the setup payload for this configuration.
    pub fn setup(&self) -> LiveConfig {
        LiveConfig {
            model: self.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: Some(self.response_modality.as_str().to_string()),
                speech_config: self.voice.as_deref().map(speech_config),
            }),
            system_instruction: self.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![Part::text(text.clone())],
            }),
            tools: self.tools.clone(),
        }
    }
}

/// Outbound envelopes. External tagging with camelCase variant names yields
/// the wire shape directly: `{"setup": …}`, `{"clientContent": …}`, and so
/// on.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientEnvelope {
    Setup(LiveConfig),
    ClientContent(ClientContent),
    RealtimeInput(RealtimeInput),
    ToolResponse(Value),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

/// Inbound frame vocabulary. Untagged variants are tried in declaration
/// order, which fixes the routing precedence: toolCall,
/// toolCallCancellation, setupComplete, serverContent.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    ToolCall {
        #[serde(rename = "toolCall")]
        tool_call: Value,
    },
    ToolCallCancellation {
        #[serde(rename = "toolCallCancellation")]
        tool_call_cancellation: Value,
    },
    SetupComplete {
        #[serde(rename = "setupComplete")]
        setup_complete: Value,
    },
    ServerContent {
        #[serde(rename = "serverContent")]
        server_content: ServerContent,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerContent {
    pub interrupted: bool,
    pub turn_complete: bool,
    pub model_turn: Option<ModelTurn>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelTurn {
    pub parts: Vec<Value>,
}

/// Events fanned out to subscribers. Closed set; one inbound frame expands
/// to zero or more events in a fixed order.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    /// Transport opened; the setup envelope follows immediately.
    Open,
    /// Server acknowledged the setup payload.
    SetupComplete,
    /// One PCM audio part of a model turn, base64-decoded.
    Audio(Vec<u8>),
    /// The non-audio parts of a model turn, relative order preserved.
    Content { parts: Vec<Value> },
    /// Generation was interrupted; queued playback should be flushed.
    Interrupted,
    TurnComplete,
    ToolCall(Value),
    ToolCallCancellation(Value),
    /// Diagnostic marker for an outbound send.
    Log(LogEntry),
    /// Connection closed. Emitted exactly once per open connection.
    Close { reason: Option<String> },
}

/// One entry of the session's bounded send log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub seq: u64,
    pub label: String,
}

/// Expand one inbound frame into subscriber events.
///
/// An interrupted marker preempts the rest of its frame. Audio parts
/// (`inlineData` with an `audio/pcm` MIME prefix) each become one
/// [`LiveEvent::Audio`] in array order; any remaining parts of the same turn
/// become a single [`LiveEvent::Content`].
pub fn events_for_frame(
    raw: &str,
) -> std::result::Result<SmallVec<[LiveEvent; 2]>, serde_json::Error> {
    let frame: ServerFrame = serde_json::from_str(raw)?;
    let mut events = SmallVec::new();
    match frame {
        ServerFrame::ToolCall { tool_call } => events.push(LiveEvent::ToolCall(tool_call)),
        ServerFrame::ToolCallCancellation {
            tool_call_cancellation,
        } => events.push(LiveEvent::ToolCallCancellation(tool_call_cancellation)),
        ServerFrame::SetupComplete { .. } => events.push(LiveEvent::SetupComplete),
        ServerFrame::ServerContent { server_content } => {
            if server_content.interrupted {
                events.push(LiveEvent::Interrupted);
                return Ok(events);
            }
            if server_content.turn_complete {
                events.push(LiveEvent::TurnComplete);
            }
            if let Some(turn) = server_content.model_turn {
                let mut other_parts = Vec::new();
                for part in turn.parts {
                    if is_audio_part(&part) {
                        if let Some(data) = decode_audio_part(&part) {
                            events.push(LiveEvent::Audio(data));
                        }
                    } else {
                        other_parts.push(part);
                    }
                }
                if !other_parts.is_empty() {
                    events.push(LiveEvent::Content { parts: other_parts });
                }
            }
        }
    }
    Ok(events)
}

fn is_audio_part(part: &Value) -> bool {
    part.get("inlineData")
        .and_then(|inline| inline.get("mimeType"))
        .and_then(Value::as_str)
        .is_some_and(|mime| mime.starts_with("audio/pcm"))
}

fn decode_audio_part(part: &Value) -> Option<Vec<u8>> {
    let data = part.get("inlineData")?.get("data")?.as_str()?;
    match BASE64.decode(data) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("Dropping undecodable audio part: {e}");
            None
        }
    }
}

/// Interpret a transport close reason, unwrapping the vendor's `ERROR]`
/// prelude when present.
pub fn extract_close_reason(reason: &str) -> Option<String> {
    if reason.is_empty() {
        return None;
    }
    if reason.to_lowercase().contains("error") {
        const PRELUDE: &str = "ERROR]";
        if let Some(idx) = reason.find(PRELUDE) {
            if idx > 0 {
                if let Some(tail) = reason.get(idx + PRELUDE.len() + 1..) {
                    return Some(tail.to_string());
                }
            }
        }
    }
    Some(reason.to_string())
}

/// Classification of a realtime input batch, for the diagnostic log only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Audio,
    Video,
    Mixed,
    Unknown,
}

impl BatchKind {
    pub fn of(chunks: &[MediaChunk]) -> Self {
        let has_audio = chunks.iter().any(|c| c.mime_type.contains("audio"));
        let has_video = chunks.iter().any(|c| c.mime_type.contains("image"));
        match (has_audio, has_video) {
            (true, true) => BatchKind::Mixed,
            (true, false) => BatchKind::Audio,
            (false, true) => BatchKind::Video,
            (false, false) => BatchKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Audio => "audio",
            BatchKind::Video => "video",
            BatchKind::Mixed => "audio + video",
            BatchKind::Unknown => "unknown",
        }
    }
}
