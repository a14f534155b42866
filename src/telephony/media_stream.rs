//! # Media Stream WebSocket
//!
//! One actor per telephone media stream. It owns the call's [`RelaySession`]
//! and translates between the provider's envelope and the relay.
//!
//! ## Protocol:
//! 1. **start**: look up the business, compose instructions, register and
//!    start a relay (in a spawned task; the actor keeps receiving frames)
//! 2. **media**: decode the base64 frame and feed it to the relay; frames that
//!    arrive before the relay is streaming are counted and dropped
//! 3. **stop**: signal end of input; the model's final turn still plays
//! 4. **socket closed**: close the relay, fold its stats into the app
//!    metrics, and record the call duration
//!
//! Relay outputs are attached to the actor as a stream, so they are handled
//! on the actor in dispatch order.

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::relay::{RelayOutput, RelayOutputs, RelaySession};
use crate::state::AppState;
use crate::store::compose_instructions;
use crate::telephony::envelope::{InboundMessage, MediaPayload, OutboundMessage, StreamStart};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct MediaStreamSocket {
    state: AppState,
    /// Relay session id; set once `start` is received.
    session_id: Option<String>,
    session: Option<RelaySession>,
    stream_sid: Option<String>,
    call_id: Option<String>,
    started_at: Instant,
    last_heartbeat: Instant,
    frames_before_ready: u64,
    turns_played: u64,
}

impl MediaStreamSocket {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            session_id: None,
            session: None,
            stream_sid: None,
            call_id: None,
            started_at: Instant::now(),
            last_heartbeat: Instant::now(),
            frames_before_ready: 0,
            turns_played: 0,
        }
    }

    fn handle_start(&mut self, start: StreamStart, ctx: &mut ws::WebsocketContext<Self>) {
        if self.session_id.is_some() {
            warn!(stream_sid = %start.stream_sid, "Ignoring repeated start event");
            return;
        }

        let session_id = start.stream_sid.clone();
        let business_phone = start.custom_parameters.get("businessPhone").cloned();
        self.call_id = start.custom_parameters.get("callId").cloned();
        self.stream_sid = Some(start.stream_sid);
        self.session_id = Some(session_id.clone());
        self.started_at = Instant::now();

        info!(
            stream_sid = %session_id,
            call_sid = ?start.call_sid,
            call_id = ?self.call_id,
            business_phone = ?business_phone,
            "Media stream started"
        );

        let state = self.state.clone();
        let addr = ctx.address();

        tokio::spawn(async move {
            match open_relay(&state, session_id.clone(), business_phone).await {
                Ok((session, outputs)) => {
                    if addr.connected() {
                        addr.do_send(RelayReady { session, outputs });
                    } else {
                        // Socket closed while the relay was connecting.
                        session.close();
                        state.registry.remove(&session_id);
                    }
                }
                Err(err) => addr.do_send(RelayFailed {
                    reason: err.to_string(),
                }),
            }
        });
    }

    fn handle_media(&mut self, payload: &MediaPayload, ctx: &mut ws::WebsocketContext<Self>) {
        let frame = match payload.decode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(stream_sid = ?self.stream_sid, error = %e, "Dropping media frame with bad base64");
                return;
            }
        };

        let Some(session) = &self.session else {
            self.frames_before_ready += 1;
            return;
        };

        match session.feed_inbound(&frame) {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                error!(stream_sid = ?self.stream_sid, error = %e, "Relay failed, hanging up");
                ctx.stop();
            }
            Err(e) => debug!(stream_sid = ?self.stream_sid, error = %e, "Inbound frame dropped"),
        }
    }

    fn handle_stop(&mut self) {
        info!(stream_sid = ?self.stream_sid, "Media stream stopped, ending model input");
        if let Some(session) = &self.session {
            if let Err(e) = session.end_input() {
                warn!(stream_sid = ?self.stream_sid, error = %e, "Could not end model input");
            }
        }
    }

    fn send(&self, message: &OutboundMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(error = %e, "Failed to serialize outbound message"),
        }
    }
}

/// Compose the per-call configuration, register the relay, and connect it.
async fn open_relay(
    state: &AppState,
    session_id: String,
    business_phone: Option<String>,
) -> Result<(RelaySession, RelayOutputs), RelayError> {
    let config = state.get_config();

    let business = match business_phone {
        Some(phone) => state.store.find_business(&phone).await.unwrap_or_else(|e| {
            warn!(business_phone = %phone, error = %e, "Business lookup failed");
            None
        }),
        None => None,
    };
    let instructions = compose_instructions(&config.relay.instructions, business.as_ref());

    let (session, outputs) = RelaySession::new(session_id.clone(), config.relay_config(instructions));
    state.registry.register(session.clone())?;

    if let Err(e) = session.start(state.connector.as_ref()).await {
        state.registry.remove(&session_id);
        return Err(e);
    }

    Ok((session, outputs))
}

#[derive(Message)]
#[rtype(result = "()")]
struct RelayReady {
    session: RelaySession,
    outputs: RelayOutputs,
}

#[derive(Message)]
#[rtype(result = "()")]
struct RelayFailed {
    reason: String,
}

impl Actor for MediaStreamSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Media stream connection started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(stream_sid = ?act.stream_sid, "Media stream heartbeat timeout, closing");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let duration = self.started_at.elapsed();

        if let Some(session_id) = self.session_id.take() {
            let session = self
                .session
                .take()
                .or_else(|| self.state.registry.get(&session_id));
            self.state.registry.remove(&session_id);

            if let Some(session) = session {
                session.close();
                self.state.record_call_finished(&session.stats());
            }
        }

        if self.frames_before_ready > 0 {
            self.state.record_frames_dropped(self.frames_before_ready);
        }

        if let Some(call_id) = self.call_id.take() {
            let store = self.state.store.clone();
            tokio::spawn(async move {
                if let Err(e) = store.finish_call(&call_id, duration).await {
                    warn!(call_id = %call_id, error = %e, "Failed to finish call record");
                }
            });
        }

        info!(
            stream_sid = ?self.stream_sid,
            duration_ms = duration.as_millis() as u64,
            frames_before_ready = self.frames_before_ready,
            "Media stream connection stopped"
        );
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MediaStreamSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<InboundMessage>(&text) {
                    Ok(InboundMessage::Connected { protocol }) => {
                        debug!(protocol = ?protocol, "Media stream connected");
                    }
                    Ok(InboundMessage::Start { start, .. }) => self.handle_start(start, ctx),
                    Ok(InboundMessage::Media { media, .. }) => self.handle_media(&media, ctx),
                    Ok(InboundMessage::Mark { mark, .. }) => {
                        debug!(stream_sid = ?self.stream_sid, mark = %mark.name, "Playback reached mark");
                    }
                    Ok(InboundMessage::Stop { .. }) => self.handle_stop(),
                    Ok(InboundMessage::Other) => debug!("Ignoring unhandled media stream event"),
                    Err(e) => warn!(error = %e, "Invalid media stream message"),
                }
            }
            Ok(ws::Message::Binary(data)) => {
                warn!(bytes = data.len(), "Unexpected binary frame on media stream");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(reason = ?reason, "Media stream closed by provider");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                error!(error = %e, "Media stream protocol error");
                ctx.stop();
            }
        }
    }
}

/// Relay outputs, in the order the turn queue dispatched them.
impl StreamHandler<RelayOutput> for MediaStreamSocket {
    fn handle(&mut self, output: RelayOutput, ctx: &mut Self::Context) {
        match output {
            RelayOutput::OutboundAudio(mulaw) => match &self.stream_sid {
                Some(stream_sid) => {
                    let message = OutboundMessage::audio(stream_sid, &mulaw);
                    self.send(&message, ctx);
                }
                None => debug!(bytes = mulaw.len(), "No stream sid yet, dropping outbound audio"),
            },
            RelayOutput::Transcript { text, speaker } => {
                debug!(stream_sid = ?self.stream_sid, speaker = %speaker, text = %text, "Transcript");
                if let Some(call_id) = self.call_id.clone() {
                    let store = self.state.store.clone();
                    tokio::spawn(async move {
                        if let Err(e) = store
                            .append_transcript(&call_id, &text, speaker.is_assistant())
                            .await
                        {
                            warn!(call_id = %call_id, error = %e, "Failed to store transcript");
                        }
                    });
                }
            }
            RelayOutput::Interrupted => {
                if let Some(stream_sid) = &self.stream_sid {
                    debug!(stream_sid = %stream_sid, "Model interrupted, clearing playback");
                    let message = OutboundMessage::clear(stream_sid);
                    self.send(&message, ctx);
                }
            }
            RelayOutput::ModelError(detail) => {
                warn!(stream_sid = ?self.stream_sid, detail = %detail, "Model reported an error");
            }
            RelayOutput::TurnComplete => {
                self.turns_played += 1;
                if let Some(stream_sid) = &self.stream_sid {
                    let message = OutboundMessage::mark(stream_sid, format!("turn-{}", self.turns_played));
                    self.send(&message, ctx);
                }
            }
        }
    }

    /// The relay closed its output stream: the session is gone, so is the call.
    fn finished(&mut self, ctx: &mut Self::Context) {
        info!(stream_sid = ?self.stream_sid, "Relay output ended, closing media stream");
        ctx.stop();
    }
}

impl Handler<RelayReady> for MediaStreamSocket {
    type Result = ();

    fn handle(&mut self, msg: RelayReady, ctx: &mut Self::Context) {
        info!(session_id = %msg.session.id(), "Relay ready");
        self.state.record_call_started();
        ctx.add_stream(UnboundedReceiverStream::new(msg.outputs));
        self.session = Some(msg.session);
    }
}

impl Handler<RelayFailed> for MediaStreamSocket {
    type Result = ();

    fn handle(&mut self, msg: RelayFailed, ctx: &mut Self::Context) {
        warn!(stream_sid = ?self.stream_sid, reason = %msg.reason, "Could not start relay");
        self.state.record_call_rejected();
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Error,
            description: Some(msg.reason),
        }));
        ctx.stop();
    }
}

/// WebSocket endpoint the telephone provider streams call audio to.
pub async fn media_stream(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(peer = ?req.connection_info().peer_addr(), "Media stream connection request");
    ws::start(MediaStreamSocket::new(state.get_ref().clone()), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::model::testing::ScriptedConnector;
    use crate::relay::SessionState;
    use crate::store::{BusinessProfile, InMemoryCallStore};
    use std::sync::Arc;

    fn state_with(connector: Arc<ScriptedConnector>, max_calls: usize) -> AppState {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_calls = max_calls;
        let store = Arc::new(InMemoryCallStore::new(vec![BusinessProfile {
            phone_number: "+15550100".to_string(),
            name: "Corner Bakery".to_string(),
            operator_instructions: "Mention the croissants".to_string(),
            schedule: Vec::new(),
        }]));
        AppState::new(config, store, connector)
    }

    #[tokio::test]
    async fn test_open_relay_composes_business_instructions() {
        let connector = ScriptedConnector::new();
        let state = state_with(connector.clone(), 4);

        let (session, _outputs) = open_relay(&state, "MZ1".to_string(), Some("+15550100".to_string()))
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Streaming);
        assert!(state.registry.get("MZ1").is_some());

        let instructions = connector.configs.lock()[0].instructions.clone();
        assert!(instructions.starts_with(&state.get_config().relay.instructions));
        assert!(instructions.contains("Business name is Corner Bakery. "));
        assert!(instructions.contains("Mention the croissants"));
    }

    #[tokio::test]
    async fn test_open_relay_unknown_business_uses_base_instructions() {
        let connector = ScriptedConnector::new();
        let state = state_with(connector.clone(), 4);

        open_relay(&state, "MZ2".to_string(), Some("+19999999".to_string()))
            .await
            .unwrap();

        assert_eq!(
            connector.configs.lock()[0].instructions,
            state.get_config().relay.instructions
        );
    }

    #[tokio::test]
    async fn test_open_relay_connect_failure_unregisters() {
        let state = state_with(ScriptedConnector::failing(), 4);

        let err = open_relay(&state, "MZ3".to_string(), None).await.unwrap_err();

        assert!(matches!(err, RelayError::Connect(_)));
        assert_eq!(state.registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_open_relay_respects_call_limit() {
        let state = state_with(ScriptedConnector::new(), 1);

        open_relay(&state, "MZ4".to_string(), None).await.unwrap();
        let err = open_relay(&state, "MZ5".to_string(), None).await.unwrap_err();

        assert!(matches!(err, RelayError::CapacityReached(1)));
        assert_eq!(state.registry.active_ids(), vec!["MZ4".to_string()]);
    }
}
