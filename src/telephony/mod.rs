//! # Telephony
//!
//! The telephone side of a call: the JSON envelope the provider speaks on
//! its media-stream WebSocket, and the per-call actor that bridges that
//! socket to a [`RelaySession`](crate::relay::RelaySession).

pub mod envelope;
pub mod media_stream;

pub use media_stream::media_stream;
