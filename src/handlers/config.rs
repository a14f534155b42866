use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Configuration as exposed over HTTP. The model API key is never echoed.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "model": {
            "endpoint": config.model.endpoint,
            "model": config.model.model,
            "api_key_set": !config.model.api_key.is_empty(),
            "connect_timeout_secs": config.model.connect_timeout_secs
        },
        "relay": {
            "voice": config.relay.voice,
            "instructions": config.relay.instructions,
            "greeting": config.relay.greeting,
            "ready_message": config.relay.ready_message
        },
        "performance": {
            "max_concurrent_calls": config.performance.max_concurrent_calls,
            "max_call_duration_secs": config.performance.max_call_duration_secs
        },
        "businesses": config
            .businesses
            .iter()
            .map(|business| &business.phone_number)
            .collect::<Vec<_>>()
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

/// Apply a partial update; new relay settings take effect on the next call.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}
