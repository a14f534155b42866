//! # Gemini Live Connector
//!
//! [`ModelConnector`] for the Gemini Live bidirectional streaming API.
//!
//! ## Connection Flow:
//! 1. Open the WebSocket (`?key=` appended to the endpoint)
//! 2. Send `setup` (model, audio modality, voice, system instruction,
//!    input and output transcription)
//! 3. Wait for `setupComplete`, bounded by the relay's connect timeout
//! 4. Split into a writer task (link commands → frames) and a reader task
//!    (frames → [`ModelEvent`]s)
//!
//! ## Server message mapping (in this order):
//! - `inputTranscription.text` → caller transcript
//! - `outputTranscription.text` → assistant transcript
//! - `modelTurn.parts[].text` → assistant transcript
//! - `modelTurn.parts[].inlineData` (`audio/pcm;rate=N`) → audio chunk
//! - `interrupted` → Interrupted
//! - `turnComplete` → TurnComplete
//! - top-level `error` → Error

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::audio::{MODEL_INPUT_RATE, MODEL_OUTPUT_RATE};
use crate::config::{ModelConfig, RelayConfig};
use crate::error::ModelError;
use crate::model::{ModelConnection, ModelConnector, ModelLink};
use crate::relay::{ModelEvent, Speaker};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct GeminiConnector {
    endpoint: String,
    api_key: String,
}

impl GeminiConnector {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(config.endpoint.clone(), config.api_key.clone())
    }

    fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key)
    }

    async fn handshake(
        &self,
        config: &RelayConfig,
    ) -> Result<(SplitSink<WsStream, Message>, SplitStream<WsStream>), ModelError> {
        let (ws_stream, _) = connect_async(self.url()).await?;
        let (mut writer, mut reader) = ws_stream.split();

        writer
            .send(Message::Text(setup_message(config).to_string()))
            .await?;

        loop {
            let frame = match reader.next().await {
                Some(frame) => frame?,
                None => return Err(ModelError::ClosedDuringHandshake),
            };

            match frame_json(frame) {
                Frame::Json(text) => {
                    let parsed = parse_server_message(&text)?;
                    if parsed.setup_complete {
                        return Ok((writer, reader));
                    }
                    if let Some(ModelEvent::Error { detail }) = parsed.events.into_iter().next() {
                        return Err(ModelError::Malformed(detail));
                    }
                }
                Frame::Close => return Err(ModelError::ClosedDuringHandshake),
                Frame::Skip => {}
            }
        }
    }
}

#[async_trait]
impl ModelConnector for GeminiConnector {
    async fn connect(&self, config: &RelayConfig) -> Result<ModelConnection, ModelError> {
        if self.api_key.is_empty() {
            return Err(ModelError::MissingApiKey);
        }

        let (writer, reader) = tokio::time::timeout(config.connect_timeout, self.handshake(config))
            .await
            .map_err(|_| ModelError::HandshakeTimeout(config.connect_timeout))??;

        info!(model = %config.model, voice = %config.voice, "Gemini Live setup complete");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(writer, command_rx));
        tokio::spawn(read_loop(reader, event_tx));

        Ok(ModelConnection {
            link: Box::new(GeminiLink { commands: command_tx }),
            events: event_rx,
        })
    }
}

enum LinkCommand {
    Audio(Vec<u8>),
    AudioStreamEnd,
    Close,
}

struct GeminiLink {
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl ModelLink for GeminiLink {
    fn send_audio(&self, pcm: Vec<u8>) -> Result<(), ModelError> {
        self.commands
            .send(LinkCommand::Audio(pcm))
            .map_err(|_| ModelError::LinkClosed)
    }

    fn end_audio_stream(&self) -> Result<(), ModelError> {
        self.commands
            .send(LinkCommand::AudioStreamEnd)
            .map_err(|_| ModelError::LinkClosed)
    }

    fn close(&self) {
        // Writer already gone means the socket is closed anyway.
        let _ = self.commands.send(LinkCommand::Close);
    }
}

async fn write_loop(
    mut writer: SplitSink<WsStream, Message>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) {
    while let Some(command) = commands.recv().await {
        let message = match command {
            LinkCommand::Audio(pcm) => audio_message(&pcm),
            LinkCommand::AudioStreamEnd => audio_stream_end_message(),
            LinkCommand::Close => break,
        };

        if let Err(e) = writer.send(Message::Text(message.to_string())).await {
            warn!(error = %e, "Failed to write to Gemini socket");
            break;
        }
    }

    if let Err(e) = writer.close().await {
        debug!(error = %e, "Gemini socket close");
    }
}

async fn read_loop(mut reader: SplitStream<WsStream>, events: mpsc::UnboundedSender<ModelEvent>) {
    while let Some(frame) = reader.next().await {
        let text = match frame {
            Ok(frame) => match frame_json(frame) {
                Frame::Json(text) => text,
                Frame::Close => break,
                Frame::Skip => continue,
            },
            Err(e) => {
                warn!(error = %e, "Gemini socket error");
                break;
            }
        };

        let parsed = match parse_server_message(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Skipping unparseable Gemini message");
                continue;
            }
        };

        for event in parsed.events {
            trace!(kind = event.kind(), "Gemini event");
            if events.send(event).is_err() {
                return;
            }
        }
    }

    info!("Gemini event stream ended");
}

enum Frame {
    Json(String),
    Close,
    Skip,
}

/// Gemini sends JSON in both text and binary frames.
fn frame_json(frame: Message) -> Frame {
    match frame {
        Message::Text(text) => Frame::Json(text),
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Frame::Json(text),
            Err(_) => Frame::Skip,
        },
        Message::Close(_) => Frame::Close,
        _ => Frame::Skip,
    }
}

pub fn setup_message(config: &RelayConfig) -> Value {
    json!({
        "setup": {
            "model": config.model,
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": config.voice }
                    }
                }
            },
            "systemInstruction": {
                "parts": [{ "text": config.instructions }]
            },
            "inputAudioTranscription": {},
            "outputAudioTranscription": {}
        }
    })
}

pub fn audio_message(pcm: &[u8]) -> Value {
    json!({
        "realtimeInput": {
            "audio": {
                "data": STANDARD.encode(pcm),
                "mimeType": format!("audio/pcm;rate={}", MODEL_INPUT_RATE)
            }
        }
    })
}

pub fn audio_stream_end_message() -> Value {
    json!({ "realtimeInput": { "audioStreamEnd": true } })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    error: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<Content>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<Blob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    text: Option<String>,
}

/// One server message, reduced to what the relay cares about.
#[derive(Debug, Default, PartialEq)]
pub struct ParsedMessage {
    pub setup_complete: bool,
    pub events: Vec<ModelEvent>,
}

pub fn parse_server_message(text: &str) -> Result<ParsedMessage, ModelError> {
    let message: ServerMessage = serde_json::from_str(text)?;
    let mut parsed = ParsedMessage {
        setup_complete: message.setup_complete.is_some(),
        events: Vec::new(),
    };

    if let Some(content) = message.server_content {
        let transcripts = [
            (content.input_transcription, Speaker::Caller),
            (content.output_transcription, Speaker::Assistant),
        ];
        for (transcription, speaker) in transcripts {
            if let Some(text) = transcription.and_then(|t| t.text).filter(|t| !t.is_empty()) {
                parsed.events.push(ModelEvent::PartialTranscript { text, speaker });
            }
        }

        for part in content.model_turn.map(|turn| turn.parts).unwrap_or_default() {
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                parsed.events.push(ModelEvent::PartialTranscript {
                    text,
                    speaker: Speaker::Assistant,
                });
            }

            if let Some(blob) = part.inline_data {
                let Some(rate) = pcm_rate(&blob.mime_type) else {
                    debug!(mime_type = %blob.mime_type, "Ignoring non-PCM inline data");
                    continue;
                };
                match STANDARD.decode(blob.data.as_bytes()) {
                    Ok(bytes) => parsed.events.push(ModelEvent::AudioChunk { bytes, rate }),
                    Err(e) => warn!(error = %e, "Skipping inline audio with bad base64"),
                }
            }
        }

        if content.interrupted {
            parsed.events.push(ModelEvent::Interrupted);
        }
        if content.turn_complete {
            parsed.events.push(ModelEvent::TurnComplete);
        }
    }

    if let Some(error) = message.error {
        let detail = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        parsed.events.push(ModelEvent::Error { detail });
    }

    Ok(parsed)
}

/// Sample rate from an `audio/pcm[;rate=N]` mime type. `None` for non-PCM.
fn pcm_rate(mime_type: &str) -> Option<u32> {
    let mut params = mime_type.split(';').map(str::trim);
    if params.next()? != "audio/pcm" {
        return None;
    }

    let rate = params
        .filter_map(|param| param.strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
        .unwrap_or(MODEL_OUTPUT_RATE);
    Some(rate)
}
