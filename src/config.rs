//! # Configuration Management
//!
//! Loads the service configuration from several sources and builds the
//! per-call [`RelayConfig`] handed to each relay session.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (`HOST`, `PORT`, `GEMINI_API_KEY`)
//! 2. Environment variables with the `APP_` prefix, nested with `__`
//!    (`APP_SERVER__PORT`, `APP_RELAY__VOICE`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values (the `Default` impl below)
//!
//! ## Sections:
//! - **server**: bind address
//! - **model**: model endpoint, model name, API key, handshake timeout
//! - **relay**: voice, base instructions, and the caller-facing prompts
//! - **performance**: call limits
//! - **businesses**: directory used to answer calls per dialed number

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::store::BusinessProfile;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub relay: RelaySettings,
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub businesses: Vec<BusinessProfile>,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: accept connections from anywhere (production, behind
///   the telephone provider's webhook)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Connection settings for the conversational model.
///
/// ## Fields:
/// - `endpoint`: Live API WebSocket URL (`ws://` or `wss://`)
/// - `model`: model resource name sent in the setup message
/// - `api_key`: appended to the endpoint as `?key=`; usually supplied through
///   `GEMINI_API_KEY`
/// - `connect_timeout_secs`: how long to wait for `setupComplete`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    pub connect_timeout_secs: u64,
}

/// What the assistant sounds like and what callers hear before it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Prebuilt voice name.
    pub voice: String,
    /// Base system instructions; business details are appended per call.
    pub instructions: String,
    /// Spoken by the telephone provider before the stream connects.
    pub greeting: String,
    /// Spoken right before the caller is connected to the assistant.
    pub ready_message: String,
}

/// Call limits.
///
/// ## Fields:
/// - `max_concurrent_calls`: relays allowed at the same time; further calls
///   are rejected when their stream starts
/// - `max_call_duration_secs`: registry entries older than this are closed by
///   the periodic cleanup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_calls: usize,
    pub max_call_duration_secs: u64,
}

/// Explicit per-call configuration for a relay session.
///
/// Built from [`AppConfig`] plus the called business, so nothing in the relay
/// reads global or environment state.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub connect_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            model: ModelConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                model: "models/gemini-2.0-flash-live-001".to_string(),
                api_key: String::new(),
                connect_timeout_secs: 10,
            },
            relay: RelaySettings {
                voice: "Puck".to_string(),
                instructions: "Keep your answers really short, try to answer with one word if possible but remain helpful to the customer. Listen carefully to what the caller is saying. You are a receptionist. ".to_string(),
                greeting: "Please wait while I connect you to our AI assistant".to_string(),
                ready_message: "O.K. you can start talking!".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_calls: 10,
                max_call_duration_secs: 3600,
            },
            businesses: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: override server port
    /// - `APP_RELAY__VOICE=Kore`: override the assistant voice
    /// - `PORT=3000`, `HOST=0.0.0.0`: deployment platform conventions
    /// - `GEMINI_API_KEY=...`: model API key
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(api_key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("model.api_key", api_key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_calls == 0 {
            return Err(anyhow::anyhow!("Max concurrent calls must be greater than 0"));
        }

        if !(self.model.endpoint.starts_with("ws://") || self.model.endpoint.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "Model endpoint must be a ws:// or wss:// URL, got '{}'",
                self.model.endpoint
            ));
        }

        if self.model.connect_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Model connect timeout must be greater than 0"));
        }

        if self.relay.voice.trim().is_empty() {
            return Err(anyhow::anyhow!("Relay voice cannot be empty"));
        }

        Ok(())
    }

    /// Apply a partial runtime update from JSON, then re-validate.
    ///
    /// Only the fields below are updatable; anything else is ignored:
    /// `server.host`, `server.port`, `relay.voice`, `relay.instructions`,
    /// `relay.greeting`, `relay.ready_message`,
    /// `performance.max_concurrent_calls`, `performance.max_call_duration_secs`.
    ///
    /// On error `self` is left untouched.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                updated.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                updated.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port {} is out of range", port))?;
            }
        }

        if let Some(relay) = partial.get("relay") {
            let field = |name: &str| relay.get(name).and_then(|v| v.as_str()).map(str::to_string);
            if let Some(voice) = field("voice") {
                updated.relay.voice = voice;
            }
            if let Some(instructions) = field("instructions") {
                updated.relay.instructions = instructions;
            }
            if let Some(greeting) = field("greeting") {
                updated.relay.greeting = greeting;
            }
            if let Some(ready) = field("ready_message") {
                updated.relay.ready_message = ready;
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(calls) = performance.get("max_concurrent_calls").and_then(|v| v.as_u64()) {
                updated.performance.max_concurrent_calls = calls as usize;
            }
            if let Some(secs) = performance.get("max_call_duration_secs").and_then(|v| v.as_u64()) {
                updated.performance.max_call_duration_secs = secs;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Relay configuration for one call, with the composed instructions.
    pub fn relay_config(&self, instructions: String) -> RelayConfig {
        RelayConfig {
            model: self.model.model.clone(),
            voice: self.relay.voice.clone(),
            instructions,
            connect_timeout: Duration::from_secs(self.model.connect_timeout_secs),
        }
    }
}
