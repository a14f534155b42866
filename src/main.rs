//! # Call Relay Backend - Main Application Entry Point
//!
//! An Actix-web server that answers phone calls and relays their audio to a
//! realtime speech model and back.
//!
//! ## Call Flow:
//! 1. The telephone provider posts to `/incoming-call`; the reply is TwiML
//!    that connects the call's audio to `/media-stream`
//! 2. `/media-stream` upgrades to a WebSocket; each call gets one
//!    media-stream actor and one relay session
//! 3. The relay transcodes caller audio for the model and plays the model's
//!    answers back one completed turn at a time
//!
//! ## Application Architecture:
//! - **config**: configuration (defaults, TOML file, environment)
//! - **state**: shared application state and metrics
//! - **audio**: μ-law and PCM transcoding
//! - **relay**: turn queue, relay sessions, call registry
//! - **model**: realtime model connections
//! - **telephony**: media-stream envelope and WebSocket actor
//! - **store**: business directory and call records
//! - **handlers**, **health**, **middleware**: HTTP surface
//! - **error**: error types and HTTP error responses

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod model;
mod relay;
mod state;
mod store;
mod telephony;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often stale relay sessions are swept from the registry.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing();

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting call-relay-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{} (model {}, max {} calls)",
        config.server.host,
        config.server.port,
        config.model.model,
        config.performance.max_concurrent_calls
    );
    if config.model.api_key.is_empty() {
        warn!("GEMINI_API_KEY is not set; calls will fail to connect to the model");
    }

    let app_state = AppState::from_config(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let cleanup_task = tokio::spawn(cleanup_sessions(app_state.clone()));

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .route("/", web::get().to(handlers::root))
            .route("/incoming-call", web::post().to(handlers::incoming_call_form))
            .route("/incoming-call", web::get().to(handlers::incoming_call_query))
            .route("/media-stream", web::get().to(telephony::media_stream))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/calls", web::get().to(handlers::list_active_calls))
                    .route("/calls/{call_id}", web::get().to(handlers::get_call)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    cleanup_task.abort();
    let closed = app_state.registry.close_all();
    if closed > 0 {
        info!(closed, "Closed remaining relay sessions");
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins; otherwise `call_relay_backend=debug,actix_web=info`.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Close and drop sessions that are closed or have outlived the maximum
/// call duration. The limit is re-read each sweep so runtime config updates
/// apply.
async fn cleanup_sessions(state: AppState) {
    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
        interval.tick().await;

        let max_age = Duration::from_secs(state.get_config().performance.max_call_duration_secs);
        let removed = state.registry.cleanup(max_age);
        if removed > 0 {
            info!(removed, active = state.registry.active_count(), "Swept relay sessions");
        }
    }
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => {}
    }
}
