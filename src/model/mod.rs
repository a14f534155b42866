//! # Model Connection
//!
//! The seam between a relay session and the conversational model.
//!
//! ## Key Components:
//! - **ModelConnector**: opens a connection for one call (async, may time out)
//! - **ModelLink**: the sending half, owned by the session; every method
//!   returns immediately
//! - **ModelConnection**: a link plus the stream of [`ModelEvent`]s it produces
//!
//! The events channel closing means the transport is gone; the session treats
//! that as a session-level failure.

pub mod gemini;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::RelayConfig;
use crate::error::ModelError;
use crate::relay::ModelEvent;

pub use gemini::GeminiConnector;

/// Opens model connections.
#[async_trait]
pub trait ModelConnector: Send + Sync {
    /// Connect and complete the setup handshake.
    ///
    /// Returning `Ok` is the connection acknowledgment that moves a session
    /// from `Connecting` to `Streaming`.
    async fn connect(&self, config: &RelayConfig) -> Result<ModelConnection, ModelError>;
}

/// Sending half of a model connection.
pub trait ModelLink: Send + Sync {
    /// Queue 16 kHz linear PCM for the model.
    fn send_audio(&self, pcm: Vec<u8>) -> Result<(), ModelError>;

    /// Tell the model the caller stopped sending audio.
    fn end_audio_stream(&self) -> Result<(), ModelError>;

    /// Release the connection. Safe to call more than once.
    fn close(&self);
}

/// An established model connection.
pub struct ModelConnection {
    pub link: Box<dyn ModelLink>,
    pub events: mpsc::UnboundedReceiver<ModelEvent>,
}

#[cfg(test)]
pub mod testing {
    //! In-process connector driven by the test through channels.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    pub enum LinkCall {
        Audio(Vec<u8>),
        StreamEnd,
        Close,
    }

    #[derive(Default)]
    pub struct ScriptedConnector {
        pub fail: AtomicBool,
        pub calls: Arc<Mutex<Vec<LinkCall>>>,
        pub configs: Mutex<Vec<RelayConfig>>,
        events: Mutex<Option<mpsc::UnboundedSender<ModelEvent>>>,
    }

    impl ScriptedConnector {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn failing() -> Arc<Self> {
            let connector = Self::default();
            connector.fail.store(true, Ordering::SeqCst);
            Arc::new(connector)
        }

        /// Push an event as if the model had sent it.
        pub fn emit(&self, event: ModelEvent) -> bool {
            match self.events.lock().as_ref() {
                Some(tx) => tx.send(event).is_ok(),
                None => false,
            }
        }

        /// Drop the event sender, as a transport failure would.
        pub fn hang_up(&self) {
            self.events.lock().take();
        }

        pub fn calls(&self) -> Vec<LinkCall> {
            self.calls.lock().clone()
        }
    }

    struct ScriptedLink {
        calls: Arc<Mutex<Vec<LinkCall>>>,
        closed: AtomicBool,
    }

    impl ModelLink for ScriptedLink {
        fn send_audio(&self, pcm: Vec<u8>) -> Result<(), ModelError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ModelError::LinkClosed);
            }
            self.calls.lock().push(LinkCall::Audio(pcm));
            Ok(())
        }

        fn end_audio_stream(&self) -> Result<(), ModelError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ModelError::LinkClosed);
            }
            self.calls.lock().push(LinkCall::StreamEnd);
            Ok(())
        }

        fn close(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.calls.lock().push(LinkCall::Close);
            }
        }
    }

    #[async_trait]
    impl ModelConnector for ScriptedConnector {
        async fn connect(&self, config: &RelayConfig) -> Result<ModelConnection, ModelError> {
            self.configs.lock().push(config.clone());
            if self.fail.load(Ordering::SeqCst) {
                return Err(ModelError::ClosedDuringHandshake);
            }

            let (tx, rx) = mpsc::unbounded_channel();
            *self.events.lock() = Some(tx);

            Ok(ModelConnection {
                link: Box::new(ScriptedLink {
                    calls: Arc::clone(&self.calls),
                    closed: AtomicBool::new(false),
                }),
                events: rx,
            })
        }
    }
}
