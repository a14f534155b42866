//! # Call Setup Handlers
//!
//! The webhook the telephone provider calls when a phone call arrives, and
//! lookups of recorded calls.
//!
//! ## Available Endpoints:
//! - `GET /` - liveness banner
//! - `GET|POST /incoming-call` - answer a call with TwiML that connects it
//!   to the media stream
//! - `GET /api/v1/calls/{call_id}` - a recorded call with its transcript
//! - `GET /api/v1/calls` - relays currently live in this process

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

/// Webhook parameters sent by the provider, as a form body (POST) or query
/// string (GET). Only the fields used here are listed.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct IncomingCall {
    pub from: Option<String>,
    pub caller: Option<String>,
    pub called: Option<String>,
    pub call_sid: Option<String>,
    pub direction: Option<String>,
    pub from_city: Option<String>,
    pub from_state: Option<String>,
    pub from_country: Option<String>,
}

impl IncomingCall {
    /// The caller's number; `From` wins over `Caller`.
    pub fn caller_number(&self) -> Option<&str> {
        self.from.as_deref().or(self.caller.as_deref())
    }
}

pub async fn root() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "message": "Call relay server is running"
    }))
}

pub async fn incoming_call_form(
    req: HttpRequest,
    state: web::Data<AppState>,
    form: web::Form<IncomingCall>,
) -> HttpResponse {
    answer_call(&req, &state, form.into_inner()).await
}

pub async fn incoming_call_query(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<IncomingCall>,
) -> HttpResponse {
    answer_call(&req, &state, query.into_inner()).await
}

/// Open the call record and reply with TwiML that greets the caller and
/// connects the call to `/media-stream` on the host the provider reached.
///
/// Store failures never block the call; the stream is connected without a
/// `callId` and the transcript is simply not recorded.
async fn answer_call(req: &HttpRequest, state: &AppState, call: IncomingCall) -> HttpResponse {
    info!(
        from = ?call.caller_number(),
        to = ?call.called,
        direction = ?call.direction,
        call_sid = ?call.call_sid,
        from_city = ?call.from_city,
        from_state = ?call.from_state,
        from_country = ?call.from_country,
        "Incoming call"
    );

    if let Some(called) = call.called.as_deref() {
        match state.store.find_business(called).await {
            Ok(Some(business)) => info!(business = %business.name, "Call is for a known business"),
            Ok(None) => info!(called = %called, "No business registered for the dialed number"),
            Err(e) => warn!(called = %called, error = %e, "Business lookup failed"),
        }
    }

    let call_id = match state
        .store
        .open_call(call.caller_number().unwrap_or("unknown"))
        .await
    {
        Ok(record) => Some(record.id),
        Err(e) => {
            warn!(error = %e, "Failed to open call record");
            None
        }
    };

    let config = state.get_config();
    let host = req.connection_info().host().to_string();
    let twiml = connect_twiml(
        &config.relay.greeting,
        &config.relay.ready_message,
        &format!("wss://{}/media-stream", host),
        call_id.as_deref(),
        call.called.as_deref(),
    );

    HttpResponse::Ok()
        .content_type("text/xml")
        .body(twiml)
}

/// TwiML: greeting, a one second pause, the ready message, then a
/// bidirectional stream to `stream_url` with the call parameters attached.
pub fn connect_twiml(
    greeting: &str,
    ready_message: &str,
    stream_url: &str,
    call_id: Option<&str>,
    business_phone: Option<&str>,
) -> String {
    let mut parameters = String::new();
    for (name, value) in [("callId", call_id), ("businessPhone", business_phone)] {
        if let Some(value) = value {
            parameters.push_str(&format!(
                "<Parameter name=\"{}\" value=\"{}\"/>",
                name,
                xml_escape(value)
            ));
        }
    }

    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>",
            "<Response>",
            "<Say>{}</Say>",
            "<Pause length=\"1\"/>",
            "<Say>{}</Say>",
            "<Connect><Stream url=\"{}\">{}</Stream></Connect>",
            "</Response>"
        ),
        xml_escape(greeting),
        xml_escape(ready_message),
        xml_escape(stream_url),
        parameters
    )
}

fn xml_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub async fn get_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let call_id = path.into_inner();
    let record = state
        .store
        .get_call(&call_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Call '{}' not found", call_id)))?;

    Ok(HttpResponse::Ok().json(record))
}

pub async fn list_active_calls(state: web::Data<AppState>) -> HttpResponse {
    let calls: Vec<_> = state
        .registry
        .active_ids()
        .into_iter()
        .filter_map(|id| state.registry.get(&id))
        .map(|session| session.stats())
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active_calls": calls.len(),
        "max_calls": state.registry.max_concurrent_calls(),
        "calls": calls
    }))
}
