//! # Media Stream Envelope
//!
//! JSON messages exchanged with the telephone provider over the media-stream
//! WebSocket. Every message carries an `event` tag.
//!
//! ## Provider → Server:
//! - `connected`: socket is up, nothing else yet
//! - `start`: stream metadata, including the custom parameters set in TwiML
//! - `media`: one base64 μ-law frame (typically 20 ms, 160 bytes)
//! - `mark`: a previously sent mark finished playing
//! - `stop`: the caller hung up or the stream ended
//!
//! ## Server → Provider:
//! - `media`: base64 μ-law audio to play to the caller
//! - `clear`: drop audio queued for playback (barge-in)
//! - `mark`: ask to be told when playback reaches this point

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Messages received from the telephone provider.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundMessage {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },

    Start {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        start: StreamStart,
    },

    Media {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        media: MediaPayload,
    },

    Mark {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        mark: MarkPayload,
    },

    Stop {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
    },

    /// DTMF and any event this server does not handle.
    #[serde(other)]
    Other,
}

/// Metadata sent once per stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub stream_sid: String,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

/// Messages sent to the telephone provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundMessage {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: MediaPayload,
    },

    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },

    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkPayload,
    },
}

impl OutboundMessage {
    /// Wrap raw μ-law bytes for playback on `stream_sid`.
    pub fn audio(stream_sid: &str, mulaw: &[u8]) -> Self {
        OutboundMessage::Media {
            stream_sid: stream_sid.to_string(),
            media: MediaPayload {
                payload: STANDARD.encode(mulaw),
                track: None,
            },
        }
    }

    pub fn clear(stream_sid: &str) -> Self {
        OutboundMessage::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }

    pub fn mark(stream_sid: &str, name: impl Into<String>) -> Self {
        OutboundMessage::Mark {
            stream_sid: stream_sid.to_string(),
            mark: MarkPayload { name: name.into() },
        }
    }
}

impl MediaPayload {
    /// Raw μ-law bytes carried by this payload.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(self.payload.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start() {
        let json = r#"{
            "event": "start",
            "sequenceNumber": "1",
            "streamSid": "MZ123",
            "start": {
                "accountSid": "AC1",
                "streamSid": "MZ123",
                "callSid": "CA9",
                "tracks": ["inbound"],
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1},
                "customParameters": {"callId": "42", "businessPhone": "+15550100"}
            }
        }"#;

        match serde_json::from_str::<InboundMessage>(json).unwrap() {
            InboundMessage::Start { start, .. } => {
                assert_eq!(start.stream_sid, "MZ123");
                assert_eq!(start.call_sid.as_deref(), Some("CA9"));
                assert_eq!(start.custom_parameters["callId"], "42");
                assert_eq!(start.media_format.unwrap().sample_rate, 8000);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_media_payload() {
        let json = r#"{"event": "media", "streamSid": "MZ123",
            "media": {"track": "inbound", "chunk": "2", "timestamp": "40", "payload": "//8="}}"#;

        match serde_json::from_str::<InboundMessage>(json).unwrap() {
            InboundMessage::Media { media, .. } => {
                assert_eq!(media.decode().unwrap(), vec![0xFF, 0xFF]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_other_events() {
        let stop: InboundMessage =
            serde_json::from_str(r#"{"event": "stop", "streamSid": "MZ1", "stop": {}}"#).unwrap();
        assert_eq!(
            stop,
            InboundMessage::Stop {
                stream_sid: Some("MZ1".into())
            }
        );

        let dtmf: InboundMessage =
            serde_json::from_str(r#"{"event": "dtmf", "dtmf": {"digit": "1"}}"#).unwrap();
        assert_eq!(dtmf, InboundMessage::Other);

        let connected: InboundMessage =
            serde_json::from_str(r#"{"event": "connected", "protocol": "Call"}"#).unwrap();
        assert!(matches!(connected, InboundMessage::Connected { .. }));
    }

    #[test]
    fn test_outbound_serialization() {
        let media = serde_json::to_value(OutboundMessage::audio("MZ1", &[0xFF, 0xFF])).unwrap();
        assert_eq!(
            media,
            serde_json::json!({"event": "media", "streamSid": "MZ1", "media": {"payload": "//8="}})
        );

        let clear = serde_json::to_value(OutboundMessage::clear("MZ1")).unwrap();
        assert_eq!(clear, serde_json::json!({"event": "clear", "streamSid": "MZ1"}));

        let mark = serde_json::to_value(OutboundMessage::mark("MZ1", "turn-1")).unwrap();
        assert_eq!(mark["mark"]["name"], "turn-1");
    }
}
