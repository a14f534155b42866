//! # Relay Session
//!
//! Per-call orchestrator between the telephone leg and the model leg.
//!
//! ## State machine:
//! ```text
//! Idle ──start──▶ Connecting ──ack──▶ Streaming ──close / transport error──▶ Closing ──▶ Closed
//!                      │                   ▲  │
//!                      └──connect error────┼──┼──────────────────────────────────────────▶ Closed
//!                                          └──┘ inbound frame, model event, end of input
//! ```
//!
//! ## Concurrency:
//! - `feed_inbound` transcodes and hands the frame to the model link; it never
//!   waits for the model
//! - a pump task moves model events into the [`TurnQueue`], which drains them
//!   in the background
//! - `close` is idempotent and stops all three

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::Transcoder;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::model::{ModelConnection, ModelConnector, ModelLink};
use crate::relay::event::{ModelEvent, RelayOutputs};
use crate::relay::turn_queue::TurnQueue;

/// Lifecycle state of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Streaming => "streaming",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of what a session has done so far.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub state: SessionState,
    pub frames_in: u64,
    pub frames_dropped: u64,
    pub bytes_to_model: u64,
    pub turns_dispatched: u64,
    pub audio_chunks_out: u64,
    pub audio_chunks_dropped: u64,
    pub events_discarded: u64,
    pub peak_concurrent_drains: usize,
    pub age_ms: u64,
}

/// Handle to one call's relay. Clones share the same session.
#[derive(Clone)]
pub struct RelaySession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: String,
    config: RelayConfig,
    state: RwLock<SessionState>,
    queue: TurnQueue,
    transcoder: Transcoder,
    link: Mutex<Option<Box<dyn ModelLink>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    created_at: Instant,

    frames_in: AtomicU64,
    frames_dropped: AtomicU64,
    bytes_to_model: AtomicU64,
}

impl fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySession")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RelaySession {
    /// Create an idle session and the stream its outputs arrive on.
    pub fn new(id: impl Into<String>, config: RelayConfig) -> (Self, RelayOutputs) {
        let id = id.into();
        let transcoder = Transcoder::new();
        let (queue, outputs) = TurnQueue::new(id.clone(), transcoder);

        let inner = SessionInner {
            id,
            config,
            state: RwLock::new(SessionState::Idle),
            queue,
            transcoder,
            link: Mutex::new(None),
            pump: Mutex::new(None),
            created_at: Instant::now(),
            frames_in: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            bytes_to_model: AtomicU64::new(0),
        };

        (Self { inner: Arc::new(inner) }, outputs)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.read()
    }

    /// Time since the session was created.
    pub fn age(&self) -> Duration {
        self.inner.created_at.elapsed()
    }

    /// Connect to the model and start relaying.
    ///
    /// ## Transitions:
    /// - `Idle → Connecting` immediately
    /// - `Connecting → Streaming` once the connector acknowledges
    /// - `Connecting → Closed` if the connection fails
    ///
    /// If the session is closed while connecting, the new connection is
    /// released and `RelayError::Closed` is returned.
    pub async fn start(&self, connector: &dyn ModelConnector) -> Result<(), RelayError> {
        {
            let mut state = self.inner.state.write();
            match *state {
                SessionState::Idle => *state = SessionState::Connecting,
                SessionState::Closing | SessionState::Closed => return Err(RelayError::Closed),
                other => return Err(RelayError::NotStreaming(other)),
            }
        }

        info!(
            session_id = %self.inner.id,
            model = %self.inner.config.model,
            voice = %self.inner.config.voice,
            "Connecting relay to model"
        );

        let ModelConnection { link, events } = match connector.connect(&self.inner.config).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(session_id = %self.inner.id, error = %e, "Model connection failed");
                self.inner.queue.abort();
                *self.inner.state.write() = SessionState::Closed;
                return Err(RelayError::Connect(e));
            }
        };

        {
            let mut state = self.inner.state.write();
            if *state != SessionState::Connecting {
                link.close();
                return Err(RelayError::Closed);
            }
            *self.inner.link.lock() = Some(link);
            *state = SessionState::Streaming;
        }

        let pump = tokio::spawn(pump_events(
            Arc::downgrade(&self.inner),
            self.inner.queue.clone(),
            events,
        ));
        *self.inner.pump.lock() = Some(pump);

        // close() may have run before the handle was stored.
        if self.state().is_closed() {
            if let Some(pump) = self.inner.pump.lock().take() {
                pump.abort();
            }
            return Err(RelayError::Closed);
        }

        info!(session_id = %self.inner.id, "Relay streaming");
        Ok(())
    }

    /// Transcode one telephone frame and forward it to the model.
    ///
    /// ## Errors:
    /// - `Closed` / `NotStreaming`: the frame was not accepted
    /// - `Frame`: the frame could not be converted and was dropped
    /// - `Transport`: the model link failed; the session is now closed
    pub fn feed_inbound(&self, frame: &[u8]) -> Result<(), RelayError> {
        match self.state() {
            SessionState::Streaming => {}
            SessionState::Closing | SessionState::Closed => return Err(RelayError::Closed),
            other => {
                self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
                return Err(RelayError::NotStreaming(other));
            }
        }

        self.inner.frames_in.fetch_add(1, Ordering::Relaxed);

        let pcm = match self.inner.transcoder.inbound(frame) {
            Ok(pcm) => pcm,
            Err(e) => {
                self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(session_id = %self.inner.id, bytes = frame.len(), error = %e, "Dropping inbound frame");
                return Err(RelayError::Frame(e));
            }
        };

        let pcm_len = pcm.len() as u64;
        let sent = {
            let link = self.inner.link.lock();
            match link.as_ref() {
                Some(link) => link.send_audio(pcm),
                None => return Err(RelayError::Closed),
            }
        };

        match sent {
            Ok(()) => {
                self.inner.bytes_to_model.fetch_add(pcm_len, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                error!(session_id = %self.inner.id, error = %e, "Model link failed while sending audio");
                self.close();
                Err(RelayError::Transport(e))
            }
        }
    }

    /// Tell the model the caller has stopped sending audio.
    ///
    /// The session stays `Streaming` so the model's final turn still arrives.
    pub fn end_input(&self) -> Result<(), RelayError> {
        match self.state() {
            SessionState::Streaming => {}
            SessionState::Closing | SessionState::Closed => return Err(RelayError::Closed),
            other => return Err(RelayError::NotStreaming(other)),
        }

        let result = {
            let link = self.inner.link.lock();
            match link.as_ref() {
                Some(link) => link.end_audio_stream(),
                None => return Err(RelayError::Closed),
            }
        };

        match result {
            Ok(()) => {
                debug!(session_id = %self.inner.id, "Signalled end of audio stream");
                Ok(())
            }
            Err(e) => {
                error!(session_id = %self.inner.id, error = %e, "Model link failed at end of input");
                self.close();
                Err(RelayError::Transport(e))
            }
        }
    }

    /// Close the session: abort the current turn, release the model
    /// connection, stop the event pump.
    ///
    /// Returns `false` if the session was already closing or closed.
    pub fn close(&self) -> bool {
        {
            let mut state = self.inner.state.write();
            if state.is_closed() {
                return false;
            }
            *state = SessionState::Closing;
        }

        self.inner.queue.abort();

        let link = self.inner.link.lock().take();
        if let Some(link) = link {
            link.close();
        }

        let pump = self.inner.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
        }

        *self.inner.state.write() = SessionState::Closed;

        let stats = self.stats();
        info!(
            session_id = %self.inner.id,
            frames_in = stats.frames_in,
            frames_dropped = stats.frames_dropped,
            turns = stats.turns_dispatched,
            discarded = stats.events_discarded,
            "Relay session closed"
        );
        true
    }

    pub fn stats(&self) -> SessionStats {
        let queue = self.inner.queue.stats();
        SessionStats {
            session_id: self.inner.id.clone(),
            state: self.state(),
            frames_in: self.inner.frames_in.load(Ordering::Relaxed),
            frames_dropped: self.inner.frames_dropped.load(Ordering::Relaxed),
            bytes_to_model: self.inner.bytes_to_model.load(Ordering::Relaxed),
            turns_dispatched: queue.turns_dispatched,
            audio_chunks_out: queue.audio_chunks_out,
            audio_chunks_dropped: queue.audio_chunks_dropped,
            events_discarded: queue.events_discarded,
            peak_concurrent_drains: queue.peak_concurrent_drains,
            age_ms: self.age().as_millis() as u64,
        }
    }
}

/// Moves model events into the turn queue until the model side goes away.
async fn pump_events(
    session: Weak<SessionInner>,
    queue: TurnQueue,
    mut events: mpsc::UnboundedReceiver<ModelEvent>,
) {
    while let Some(event) = events.recv().await {
        if !queue.enqueue(event) {
            return;
        }
    }

    if let Some(inner) = session.upgrade() {
        if !inner.state.read().is_closed() {
            warn!(session_id = %inner.id, "Model event stream ended, closing relay");
            RelaySession { inner }.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::transcoder::samples_to_pcm;
    use crate::config::AppConfig;
    use crate::model::testing::{LinkCall, ScriptedConnector};
    use crate::relay::event::{RelayOutput, Speaker};
    use tokio::time::{sleep, timeout};

    fn relay_config() -> RelayConfig {
        AppConfig::default().relay_config("Be brief.".to_string())
    }

    async fn next(rx: &mut RelayOutputs) -> RelayOutput {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for output")
            .expect("output channel closed")
    }

    async fn wait_for_state(session: &RelaySession, expected: SessionState) {
        for _ in 0..100 {
            if session.state() == expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached {}", expected);
    }

    #[test]
    fn test_debug_shows_id_and_state() {
        let (session, _outputs) = RelaySession::new("call-dbg", relay_config());
        let printed = format!("{:?}", session);
        assert!(printed.starts_with("RelaySession"));
        assert!(printed.contains("\"call-dbg\""));
        assert!(printed.contains("Idle"));
    }

    #[tokio::test]
    async fn test_start_and_feed_inbound() {
        let connector = ScriptedConnector::new();
        let (session, _outputs) = RelaySession::new("call-a", relay_config());
        assert_eq!(session.state(), SessionState::Idle);

        session.start(connector.as_ref()).await.unwrap();
        assert_eq!(session.state(), SessionState::Streaming);

        session.feed_inbound(&[0xFF; 160]).unwrap();

        assert_eq!(connector.calls(), vec![LinkCall::Audio(vec![0u8; 640])]);
        assert_eq!(connector.configs.lock()[0].instructions, "Be brief.");

        let stats = session.stats();
        assert_eq!(stats.frames_in, 1);
        assert_eq!(stats.bytes_to_model, 640);
    }

    #[tokio::test]
    async fn test_model_events_are_relayed_per_turn() {
        let connector = ScriptedConnector::new();
        let (session, mut outputs) = RelaySession::new("call-b", relay_config());
        session.start(connector.as_ref()).await.unwrap();

        connector.emit(ModelEvent::PartialTranscript {
            text: "hello".into(),
            speaker: Speaker::Caller,
        });
        connector.emit(ModelEvent::AudioChunk {
            bytes: samples_to_pcm(&[1000, 0, 0, -1000, 0, 0]),
            rate: 24_000,
        });
        connector.emit(ModelEvent::TurnComplete);

        assert_eq!(
            next(&mut outputs).await,
            RelayOutput::Transcript {
                text: "hello".into(),
                speaker: Speaker::Caller
            }
        );
        assert_eq!(next(&mut outputs).await, RelayOutput::OutboundAudio(vec![0xCE, 0x4E]));
        assert_eq!(next(&mut outputs).await, RelayOutput::TurnComplete);
        assert_eq!(session.stats().turns_dispatched, 1);
    }

    #[tokio::test]
    async fn test_end_input_keeps_streaming() {
        let connector = ScriptedConnector::new();
        let (session, _outputs) = RelaySession::new("call-c", relay_config());
        session.start(connector.as_ref()).await.unwrap();

        session.end_input().unwrap();

        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(connector.calls(), vec![LinkCall::StreamEnd]);
    }

    #[tokio::test]
    async fn test_close_discards_pending_turn() {
        let connector = ScriptedConnector::new();
        let (session, mut outputs) = RelaySession::new("call-d", relay_config());
        session.start(connector.as_ref()).await.unwrap();

        connector.emit(ModelEvent::PartialTranscript {
            text: "half a sentence".into(),
            speaker: Speaker::Assistant,
        });
        sleep(Duration::from_millis(20)).await;

        assert!(session.close());
        assert!(!session.close());
        assert_eq!(session.state(), SessionState::Closed);

        assert!(timeout(Duration::from_secs(1), outputs.recv())
            .await
            .unwrap()
            .is_none());

        assert!(matches!(session.feed_inbound(&[0xFF; 160]), Err(RelayError::Closed)));
        assert!(matches!(session.end_input(), Err(RelayError::Closed)));

        let closes = connector
            .calls()
            .into_iter()
            .filter(|call| *call == LinkCall::Close)
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_closes_session() {
        let connector = ScriptedConnector::failing();
        let (session, _outputs) = RelaySession::new("call-e", relay_config());

        let err = session.start(connector.as_ref()).await.unwrap_err();

        assert!(matches!(err, RelayError::Connect(_)));
        assert!(err.is_fatal());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(session.feed_inbound(&[0xFF]), Err(RelayError::Closed)));
    }

    #[tokio::test]
    async fn test_frames_before_start_are_dropped() {
        let (session, _outputs) = RelaySession::new("call-f", relay_config());

        let err = session.feed_inbound(&[0xFF; 160]).unwrap_err();

        assert!(matches!(err, RelayError::NotStreaming(SessionState::Idle)));
        assert!(!err.is_fatal());
        assert_eq!(session.stats().frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let connector = ScriptedConnector::new();
        let (session, _outputs) = RelaySession::new("call-g", relay_config());
        session.start(connector.as_ref()).await.unwrap();

        assert!(matches!(
            session.start(connector.as_ref()).await,
            Err(RelayError::NotStreaming(SessionState::Streaming))
        ));
    }

    #[tokio::test]
    async fn test_transport_loss_closes_session() {
        let connector = ScriptedConnector::new();
        let (session, mut outputs) = RelaySession::new("call-h", relay_config());
        session.start(connector.as_ref()).await.unwrap();

        connector.hang_up();

        wait_for_state(&session, SessionState::Closed).await;
        assert!(timeout(Duration::from_secs(1), outputs.recv())
            .await
            .unwrap()
            .is_none());
        assert!(connector.calls().contains(&LinkCall::Close));
    }
}
