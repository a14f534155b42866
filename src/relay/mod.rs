//! # Turn Relay Module
//!
//! Sequences model events into turns and routes them back to the call.
//!
//! ## Key Components:
//! - **event**: model events, turns, and relay outputs
//! - **turn_queue**: ordered buffer with a single-flight drain
//! - **session**: per-call state machine owning the transcoder and the queue
//! - **registry**: table of live sessions with a concurrency cap

pub mod event;
pub mod registry;
pub mod session;
pub mod turn_queue;

pub use event::{ModelEvent, RelayOutput, RelayOutputs, Speaker};
pub use registry::{CallRegistry, RegistrySummary};
pub use session::{RelaySession, SessionState, SessionStats};
