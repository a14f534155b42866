//! Model events, turns, and the typed output stream a relay emits.

use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

/// Who said a transcribed piece of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Caller,
    Assistant,
}

impl Speaker {
    pub fn is_assistant(self) -> bool {
        matches!(self, Speaker::Assistant)
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::Caller => write!(f, "caller"),
            Speaker::Assistant => write!(f, "assistant"),
        }
    }
}

/// One event received from the model connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// Transcribed text for either side of the conversation.
    PartialTranscript { text: String, speaker: Speaker },

    /// Little-endian 16-bit PCM produced by the model at `rate` Hz.
    AudioChunk { bytes: Vec<u8>, rate: u32 },

    /// The model finished its turn; closes the current [`Turn`].
    TurnComplete,

    /// The caller talked over the model and generation was cut short.
    Interrupted,

    /// Error payload reported by the model.
    Error { detail: String },
}

impl ModelEvent {
    pub fn is_turn_complete(&self) -> bool {
        matches!(self, ModelEvent::TurnComplete)
    }

    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ModelEvent::PartialTranscript { .. } => "partial_transcript",
            ModelEvent::AudioChunk { .. } => "audio_chunk",
            ModelEvent::TurnComplete => "turn_complete",
            ModelEvent::Interrupted => "interrupted",
            ModelEvent::Error { .. } => "error",
        }
    }
}

/// Events collected between the start of a drain and the `TurnComplete`
/// that ends it, in arrival order.
#[derive(Debug, Default)]
pub struct Turn {
    events: Vec<ModelEvent>,
}

impl Turn {
    pub fn push(&mut self, event: ModelEvent) {
        self.events.push(event);
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// True once the last collected event is a `TurnComplete`.
    pub fn is_complete(&self) -> bool {
        self.events.last().is_some_and(ModelEvent::is_turn_complete)
    }

    pub fn into_events(self) -> Vec<ModelEvent> {
        self.events
    }
}

/// What a relay session hands to its caller when a turn is dispatched.
///
/// Replaces the transcript and outbound-audio callbacks with one ordered
/// stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutput {
    /// Transcript text with the speaker that produced it.
    Transcript { text: String, speaker: Speaker },

    /// μ-law 8 kHz audio ready to play to the caller.
    OutboundAudio(Vec<u8>),

    /// The model was interrupted; audio already queued for the caller is stale.
    Interrupted,

    /// The model reported an error. The session keeps running.
    ModelError(String),

    /// All outputs of the current turn have been delivered.
    TurnComplete,
}

/// Receiving end of a session's output stream.
pub type RelayOutputs = mpsc::UnboundedReceiver<RelayOutput>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_completion() {
        let mut turn = Turn::default();
        assert!(!turn.is_complete());

        turn.push(ModelEvent::PartialTranscript {
            text: "hi".into(),
            speaker: Speaker::Assistant,
        });
        assert!(!turn.is_complete());

        turn.push(ModelEvent::TurnComplete);
        assert!(turn.is_complete());
        assert_eq!(turn.event_count(), 2);
    }

    #[test]
    fn test_speaker_serialization() {
        assert_eq!(serde_json::to_string(&Speaker::Caller).unwrap(), "\"caller\"");
        assert!(Speaker::Assistant.is_assistant());
        assert!(!Speaker::Caller.is_assistant());
    }
}
