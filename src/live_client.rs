//! Live session client
//!
//! Owns one persistent WebSocket to the live endpoint, demultiplexes inbound
//! frames into [`LiveEvent`]s on a broadcast channel, and exposes the three
//! outbound operations: structured turns, realtime media input, and tool
//! responses. There is no reconnect logic; when the connection dies the
//! client reports a single close event and the caller decides what next.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::live::{
    events_for_frame, extract_close_reason, BatchKind, ClientContent, ClientEnvelope, Content,
    LiveClientConfig, LiveConfig, LiveError, LiveEvent, LogEntry, MediaChunk, Part, RealtimeInput,
    Result,
};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<tokio::sync::Mutex<SplitSink<WsStream, Message>>>;
type WsSource = SplitStream<WsStream>;

const EVENT_CAPACITY: usize = 256;
const SENT_LOG_LIMIT: usize = 100;

/// Connection lifecycle. `Open` means the transport is up and the setup
/// payload has been written; it does not wait for the server's ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

struct Shared {
    state: Mutex<ConnectionState>,
    /// Guards the once-per-open close event.
    close_emitted: AtomicBool,
    events: broadcast::Sender<LiveEvent>,
}

impl Shared {
    fn emit(&self, event: LiveEvent) {
        let _ = self.events.send(event);
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().unwrap() = next;
    }

    fn emit_close(&self, reason: Option<String>) {
        self.set_state(ConnectionState::Closed);
        if !self.close_emitted.swap(true, Ordering::SeqCst) {
            self.emit(LiveEvent::Close { reason });
        }
    }
}

#[derive(Default)]
struct SentLog {
    next_seq: u64,
    entries: Vec<LogEntry>,
}

/// Per-connection state, created on connect and dropped on close.
struct Session {
    setup: LiveConfig,
    sent: Mutex<SentLog>,
}

pub struct LiveClient {
    config: LiveClientConfig,
    shared: Arc<Shared>,
    writer: Option<WsSink>,
    session: Option<Session>,
    reader: Option<JoinHandle<()>>,
}

impl LiveClient {
    pub fn new(config: LiveClientConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Idle),
                // No open yet, so no close to report.
                close_emitted: AtomicBool::new(true),
                events,
            }),
            writer: None,
            session: None,
            reader: None,
        }
    }

    /// Subscribe to session events. Subscribe before calling
    /// [`connect`](Self::connect) to observe the open event.
    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Open the WebSocket and send the setup payload. Fails if a connection
    /// attempt is already underway or open; a closed client may reconnect.
    pub async fn connect(&mut self) -> Result<()> {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Open => {
                return Err(LiveError::AlreadyConnected);
            }
            ConnectionState::Idle | ConnectionState::Closed => {}
        }
        self.shared.set_state(ConnectionState::Connecting);
        info!("Connecting to live endpoint");

        let (ws, _response) = match connect_async(&self.config.url).await {
            Ok(ok) => ok,
            Err(e) => {
                self.shared.set_state(ConnectionState::Closed);
                return Err(e.into());
            }
        };
        let (sink, stream) = ws.split();
        let writer: WsSink = Arc::new(tokio::sync::Mutex::new(sink));
        self.writer = Some(writer.clone());

        self.shared.close_emitted.store(false, Ordering::SeqCst);
        self.shared.emit(LiveEvent::Open);
        self.reader = Some(tokio::spawn(read_loop(stream, self.shared.clone())));

        let setup = self.config.setup();
        self.session = Some(Session {
            setup: setup.clone(),
            sent: Mutex::new(SentLog::default()),
        });

        if let Err(e) = send_envelope(&writer, &ClientEnvelope::Setup(setup)).await {
            error!("Failed to send setup payload: {e}");
            self.teardown();
            return Err(e);
        }
        self.shared.set_state(ConnectionState::Open);
        self.log_send("client.setup");
        info!(model = %self.config.model, "Live session open");
        Ok(())
    }

    /// Close the connection and report a single close event. Safe to call
    /// repeatedly and on a never-connected client.
    pub async fn disconnect(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        info!("Disconnecting live session");
        {
            let mut sink = writer.lock().await;
            if let Err(e) = sink.send(Message::Close(None)).await {
                debug!("Close frame send failed: {e}");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.session = None;
        self.shared.emit_close(None);
    }

    /// Send structured conversation content as a user turn.
    pub async fn send(&self, parts: Vec<TurnPart>, turn_complete: bool) -> Result<()> {
        let writer = self.ensure_open()?;
        let content = ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: parts.into_iter().map(TurnPart::into_part).collect(),
            }],
            turn_complete,
        };
        send_envelope(writer, &ClientEnvelope::ClientContent(content)).await?;
        self.log_send("client.send");
        Ok(())
    }

    /// Stream a batch of media chunks into the open session.
    pub async fn send_realtime_input(&self, chunks: Vec<MediaChunk>) -> Result<()> {
        let writer = self.ensure_open()?;
        let kind = BatchKind::of(&chunks);
        let input = RealtimeInput {
            media_chunks: chunks,
        };
        send_envelope(writer, &ClientEnvelope::RealtimeInput(input)).await?;
        self.log_send(&format!("client.realtimeInput: {}", kind.as_str()));
        Ok(())
    }

    /// Answer an outstanding tool call.
    pub async fn send_tool_response(&self, response: Value) -> Result<()> {
        let writer = self.ensure_open()?;
        send_envelope(writer, &ClientEnvelope::ToolResponse(response)).await?;
        self.log_send("client.toolResponse");
        Ok(())
    }

    /// Snapshot of the bounded send log for the current session.
    pub fn sent_log(&self) -> Vec<LogEntry> {
        self.session
            .as_ref()
            .map(|s| s.sent.lock().unwrap().entries.clone())
            .unwrap_or_default()
    }

    /// Setup payload negotiated for the current session, if any.
    pub fn session_setup(&self) -> Option<LiveConfig> {
        self.session.as_ref().map(|s| s.setup.clone())
    }

    fn ensure_open(&self) -> Result<&WsSink> {
        if self.state() != ConnectionState::Open {
            return Err(LiveError::NotConnected);
        }
        self.writer.as_ref().ok_or(LiveError::NotConnected)
    }

    fn log_send(&self, label: &str) {
        let Some(session) = &self.session else {
            return;
        };
        let mut sent = session.sent.lock().unwrap();
        let entry = LogEntry {
            seq: sent.next_seq,
            label: label.to_string(),
        };
        sent.next_seq += 1;
        if sent.entries.len() == SENT_LOG_LIMIT {
            sent.entries.remove(0);
        }
        sent.entries.push(entry.clone());
        self.shared.emit(LiveEvent::Log(entry));
    }

    fn teardown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer = None;
        self.session = None;
        self.shared.emit_close(None);
    }
}

impl Drop for LiveClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// One part of an outbound user turn. JSON parts are sent as stringified
/// text, which is how structured payloads ride the content channel.
#[derive(Debug, Clone)]
pub enum TurnPart {
    Text(String),
    Json(Value),
}

impl TurnPart {
    fn into_part(self) -> Part {
        match self {
            TurnPart::Text(text) => Part::text(text),
            TurnPart::Json(value) => Part::text(value.to_string()),
        }
    }
}

async fn send_envelope(writer: &WsSink, envelope: &ClientEnvelope) -> Result<()> {
    let json = serde_json::to_string(envelope)?;
    let mut sink = writer.lock().await;
    sink.send(Message::text(json)).await?;
    Ok(())
}

async fn read_loop(mut stream: WsSource, shared: Arc<Shared>) {
    let mut close_reason = None;
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => dispatch_frame(text.as_str(), &shared),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => dispatch_frame(&text, &shared),
                Err(e) => warn!("Dropping non-UTF-8 binary frame: {e}"),
            },
            Ok(Message::Close(frame)) => {
                close_reason = frame.and_then(|f| extract_close_reason(f.reason.as_str()));
                info!(reason = ?close_reason, "Server closed the connection");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                error!("WebSocket read error: {e}");
                break;
            }
        }
    }
    shared.emit_close(close_reason);
}

fn dispatch_frame(raw: &str, shared: &Shared) {
    match events_for_frame(raw) {
        Ok(events) => {
            for event in events {
                shared.emit(event);
            }
        }
        Err(e) => debug!("Unmatched message ({e}): {raw}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config(addr: &str) -> LiveClientConfig {
        let mut config = LiveClientConfig::from_api_key("test-key");
        config.url = format!("ws://{addr}");
        config
    }

    /// Spawn a one-connection WebSocket server and return its address.
    async fn ws_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            handler(ws).await;
        });
        addr
    }

    /// Next non-log event from the subscription.
    async fn next_event(rx: &mut broadcast::Receiver<LiveEvent>) -> LiveEvent {
        loop {
            let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            if !matches!(event, LiveEvent::Log(_)) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn sends_fail_before_connect() {
        let client = LiveClient::new(test_config("127.0.0.1:1"));
        let sent = client.send(vec![TurnPart::Text("hi".into())], true).await;
        assert!(matches!(sent, Err(LiveError::NotConnected)));
        let sent = client
            .send_realtime_input(vec![MediaChunk::audio(vec![0])])
            .await;
        assert!(matches!(sent, Err(LiveError::NotConnected)));
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn connect_sends_setup_and_completes() {
        let addr = ws_server(|mut ws| async move {
            let msg = ws.next().await.unwrap().unwrap();
            let parsed: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
            assert_eq!(parsed["setup"]["model"], "models/gemini-2.0-flash-exp");
            ws.send(Message::text(r#"{"setupComplete": {}}"#))
                .await
                .unwrap();
            while ws.next().await.is_some() {}
        })
        .await;

        let mut client = LiveClient::new(test_config(&addr));
        let mut rx = client.subscribe();
        client.connect().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Open);

        assert!(matches!(next_event(&mut rx).await, LiveEvent::Open));
        assert!(matches!(next_event(&mut rx).await, LiveEvent::SetupComplete));
        assert_eq!(client.sent_log().len(), 1);
        assert_eq!(client.sent_log()[0].label, "client.setup");
        assert!(client.session_setup().is_some());

        client.disconnect().await;
    }

    #[tokio::test]
    async fn second_connect_rejected_while_open() {
        let addr = ws_server(|mut ws| async move {
            while ws.next().await.is_some() {}
        })
        .await;

        let mut client = LiveClient::new(test_config(&addr));
        client.connect().await.unwrap();
        let second = client.connect().await;
        assert!(matches!(second, Err(LiveError::AlreadyConnected)));
        client.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_emits_close_once_and_sends_fail() {
        let addr = ws_server(|mut ws| async move {
            while ws.next().await.is_some() {}
        })
        .await;

        let mut client = LiveClient::new(test_config(&addr));
        let mut rx = client.subscribe();
        client.connect().await.unwrap();
        client.disconnect().await;
        client.disconnect().await;

        assert!(matches!(next_event(&mut rx).await, LiveEvent::Open));
        assert!(matches!(
            next_event(&mut rx).await,
            LiveEvent::Close { reason: None }
        ));
        assert_eq!(client.state(), ConnectionState::Closed);
        let sent = client.send(vec![TurnPart::Text("hi".into())], true).await;
        assert!(matches!(sent, Err(LiveError::NotConnected)));

        // exactly one close event
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn server_drop_emits_close() {
        let addr = ws_server(|mut ws| async move {
            let _ = ws.next().await;
        })
        .await;

        let mut client = LiveClient::new(test_config(&addr));
        let mut rx = client.subscribe();
        client.connect().await.unwrap();

        assert!(matches!(next_event(&mut rx).await, LiveEvent::Open));
        assert!(matches!(next_event(&mut rx).await, LiveEvent::Close { .. }));
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn server_close_reason_is_extracted() {
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;

        let addr = ws_server(|mut ws| async move {
            let _ = ws.next().await;
            let frame = CloseFrame {
                code: CloseCode::Error,
                reason: "[1011] ERROR] Quota exceeded".into(),
            };
            let _ = ws.send(Message::Close(Some(frame))).await;
        })
        .await;

        let mut client = LiveClient::new(test_config(&addr));
        let mut rx = client.subscribe();
        client.connect().await.unwrap();

        assert!(matches!(next_event(&mut rx).await, LiveEvent::Open));
        match next_event(&mut rx).await {
            LiveEvent::Close { reason } => assert_eq!(reason.as_deref(), Some("Quota exceeded")),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_audio_frames_reach_subscribers() {
        let addr = ws_server(|mut ws| async move {
            let _ = ws.next().await;
            let frame = json!({
                "serverContent": {"modelTurn": {"parts": [
                    {"inlineData": {
                        "mimeType": "audio/pcm;rate=24000",
                        "data": BASE64.encode([1u8, 2])
                    }}
                ]}}
            });
            ws.send(Message::text(frame.to_string())).await.unwrap();
            while ws.next().await.is_some() {}
        })
        .await;

        let mut client = LiveClient::new(test_config(&addr));
        let mut rx = client.subscribe();
        client.connect().await.unwrap();

        assert!(matches!(next_event(&mut rx).await, LiveEvent::Open));
        match next_event(&mut rx).await {
            LiveEvent::Audio(data) => assert_eq!(data, vec![1, 2]),
            other => panic!("expected audio, got {other:?}"),
        }
        client.disconnect().await;
    }

    #[tokio::test]
    async fn realtime_input_reaches_the_server() {
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        let addr = ws_server(|mut ws| async move {
            let _ = ws.next().await;
            let msg = ws.next().await.unwrap().unwrap();
            let parsed: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
            let _ = seen_tx.send(parsed);
            while ws.next().await.is_some() {}
        })
        .await;

        let mut client = LiveClient::new(test_config(&addr));
        client.connect().await.unwrap();
        client
            .send_realtime_input(vec![MediaChunk::audio(vec![1, 2, 3])])
            .await
            .unwrap();

        let parsed = timeout(WAIT, seen_rx).await.unwrap().unwrap();
        assert_eq!(parsed["realtimeInput"]["mediaChunks"][0]["data"], "AQID");
        assert_eq!(
            parsed["realtimeInput"]["mediaChunks"][0]["mimeType"],
            "audio/pcm;rate=16000"
        );
        assert_eq!(
            client.sent_log().last().unwrap().label,
            "client.realtimeInput: audio"
        );
        client.disconnect().await;
    }

    #[tokio::test]
    async fn send_log_is_bounded() {
        let addr = ws_server(|mut ws| async move {
            while ws.next().await.is_some() {}
        })
        .await;

        let mut client = LiveClient::new(test_config(&addr));
        client.connect().await.unwrap();
        for _ in 0..SENT_LOG_LIMIT + 20 {
            client
                .send_realtime_input(vec![MediaChunk::audio(vec![0])])
                .await
                .unwrap();
        }

        let log = client.sent_log();
        assert_eq!(log.len(), SENT_LOG_LIMIT);
        // the setup entry was evicted; sequence numbers keep counting
        assert_eq!(log.last().unwrap().seq, SENT_LOG_LIMIT as u64 + 20);
        client.disconnect().await;
    }
}
