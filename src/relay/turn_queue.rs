//! # Turn Queue
//!
//! Ordered buffer of model events with turn-boundary detection and a
//! single-flight drain.
//!
//! ## How it works:
//! 1. **Enqueue**: the model pump appends events and returns immediately
//! 2. **Drain**: one background task pulls events in arrival order, waiting on
//!    a [`Notify`] while the buffer is empty
//! 3. **Dispatch**: when a `TurnComplete` is pulled, the collected turn is
//!    turned into [`RelayOutput`]s and sent on the output channel
//! 4. **Repeat**: events buffered during dispatch start the next drain at once
//!
//! ## Guarantees:
//! - At most one drain runs per queue (`in_flight` compare-and-swap)
//! - Outputs follow enqueue order, and turns are strictly sequential
//! - After [`TurnQueue::abort`] nothing else is emitted

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use crate::audio::Transcoder;
use crate::relay::event::{ModelEvent, RelayOutput, RelayOutputs, Turn};

/// Counters describing what a queue has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TurnQueueStats {
    pub turns_dispatched: u64,
    pub audio_chunks_out: u64,
    pub audio_chunks_dropped: u64,
    pub events_discarded: u64,
    pub peak_concurrent_drains: usize,
}

/// Cheap handle to a per-session turn queue.
#[derive(Clone)]
pub struct TurnQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    session_id: String,
    buffer: Mutex<VecDeque<ModelEvent>>,
    wakeup: Notify,
    in_flight: AtomicBool,
    aborted: AtomicBool,
    outputs: Mutex<Option<mpsc::UnboundedSender<RelayOutput>>>,
    transcoder: Transcoder,

    turns_dispatched: AtomicU64,
    audio_chunks_out: AtomicU64,
    audio_chunks_dropped: AtomicU64,
    events_discarded: AtomicU64,
    active_drains: AtomicUsize,
    peak_drains: AtomicUsize,
}

impl TurnQueue {
    /// Create a queue and the receiving end of its output stream.
    pub fn new(session_id: impl Into<String>, transcoder: Transcoder) -> (Self, RelayOutputs) {
        let (tx, rx) = mpsc::unbounded_channel();

        let inner = QueueInner {
            session_id: session_id.into(),
            buffer: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            in_flight: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            outputs: Mutex::new(Some(tx)),
            transcoder,
            turns_dispatched: AtomicU64::new(0),
            audio_chunks_out: AtomicU64::new(0),
            audio_chunks_dropped: AtomicU64::new(0),
            events_discarded: AtomicU64::new(0),
            active_drains: AtomicUsize::new(0),
            peak_drains: AtomicUsize::new(0),
        };

        (Self { inner: Arc::new(inner) }, rx)
    }

    /// Append an event and make sure a drain is running.
    ///
    /// Returns `false` if the queue was aborted and the event was dropped.
    /// Must be called from within a Tokio runtime.
    pub fn enqueue(&self, event: ModelEvent) -> bool {
        {
            let mut buffer = self.inner.buffer.lock();
            if self.inner.aborted.load(Ordering::SeqCst) {
                return false;
            }
            trace!(session_id = %self.inner.session_id, kind = event.kind(), "Event enqueued");
            buffer.push_back(event);
        }

        self.inner.wakeup.notify_one();
        // Every event kind counts as server activity.
        self.begin_draining();
        true
    }

    /// Start a drain unless one is already running.
    pub fn begin_draining(&self) {
        if self.inner.aborted.load(Ordering::SeqCst) {
            return;
        }
        if self
            .inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.drain().await;
        });
    }

    /// Discard everything buffered and stop emitting outputs.
    ///
    /// The output channel is closed, so the receiver yields `None` once it
    /// has consumed what was already dispatched.
    pub fn abort(&self) {
        let discarded = {
            let mut buffer = self.inner.buffer.lock();
            self.inner.aborted.store(true, Ordering::SeqCst);
            let count = buffer.len();
            buffer.clear();
            count
        };

        self.inner.outputs.lock().take();
        self.inner.in_flight.store(false, Ordering::SeqCst);
        self.inner.wakeup.notify_one();

        self.inner
            .events_discarded
            .fetch_add(discarded as u64, Ordering::Relaxed);

        debug!(
            session_id = %self.inner.session_id,
            discarded,
            "Turn queue aborted"
        );
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Number of events buffered and not yet pulled by a drain.
    pub fn pending_len(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    pub fn stats(&self) -> TurnQueueStats {
        TurnQueueStats {
            turns_dispatched: self.inner.turns_dispatched.load(Ordering::Relaxed),
            audio_chunks_out: self.inner.audio_chunks_out.load(Ordering::Relaxed),
            audio_chunks_dropped: self.inner.audio_chunks_dropped.load(Ordering::Relaxed),
            events_discarded: self.inner.events_discarded.load(Ordering::Relaxed),
            peak_concurrent_drains: self.inner.peak_drains.load(Ordering::Relaxed),
        }
    }
}

impl QueueInner {
    /// Drain loop. Entered with `in_flight` already set by the caller.
    async fn drain(self: Arc<Self>) {
        loop {
            let active = self.active_drains.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_drains.fetch_max(active, Ordering::SeqCst);

            if let Some(turn) = self.collect_turn().await {
                self.dispatch(turn);
            }

            self.active_drains.fetch_sub(1, Ordering::SeqCst);
            self.in_flight.store(false, Ordering::SeqCst);

            // Events that arrived while we were dispatching saw `in_flight`
            // set and did not start a drain of their own.
            if self.aborted.load(Ordering::SeqCst) || self.buffer.lock().is_empty() {
                return;
            }
            if self
                .in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
        }
    }

    /// Pull events until a `TurnComplete`. `None` if the queue was aborted
    /// first; the partial turn is discarded.
    async fn collect_turn(&self) -> Option<Turn> {
        let mut turn = Turn::default();

        while !turn.is_complete() {
            match self.next_event().await {
                Some(event) => turn.push(event),
                None => {
                    self.events_discarded
                        .fetch_add(turn.event_count() as u64, Ordering::Relaxed);
                    return None;
                }
            }
        }

        Some(turn)
    }

    async fn next_event(&self) -> Option<ModelEvent> {
        loop {
            {
                let mut buffer = self.buffer.lock();
                if self.aborted.load(Ordering::SeqCst) {
                    return None;
                }
                if let Some(event) = buffer.pop_front() {
                    return Some(event);
                }
            }

            // A notify_one issued between the check above and this await
            // leaves a permit behind, so no wake-up is lost.
            self.wakeup.notified().await;
        }
    }

    fn dispatch(&self, turn: Turn) {
        debug!(
            session_id = %self.session_id,
            events = turn.event_count(),
            "Dispatching turn"
        );

        for event in turn.into_events() {
            let output = match event {
                ModelEvent::PartialTranscript { text, speaker } => {
                    RelayOutput::Transcript { text, speaker }
                }
                ModelEvent::AudioChunk { bytes, rate } => {
                    match self.transcoder.outbound(&bytes, rate) {
                        Ok(mulaw) if mulaw.is_empty() => continue,
                        Ok(mulaw) => {
                            self.audio_chunks_out.fetch_add(1, Ordering::Relaxed);
                            RelayOutput::OutboundAudio(mulaw)
                        }
                        Err(e) => {
                            warn!(
                                session_id = %self.session_id,
                                bytes = bytes.len(),
                                error = %e,
                                "Dropping model audio chunk"
                            );
                            self.audio_chunks_dropped.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    }
                }
                ModelEvent::Interrupted => RelayOutput::Interrupted,
                ModelEvent::Error { detail } => RelayOutput::ModelError(detail),
                ModelEvent::TurnComplete => {
                    self.turns_dispatched.fetch_add(1, Ordering::Relaxed);
                    RelayOutput::TurnComplete
                }
            };

            if !self.emit(output) {
                // Rest of the turn is abandoned; the next turn still drains.
                warn!(session_id = %self.session_id, "Turn dispatch aborted");
                return;
            }
        }
    }

    fn emit(&self, output: RelayOutput) -> bool {
        let outputs = self.outputs.lock();
        match outputs.as_ref() {
            Some(tx) if !self.aborted.load(Ordering::SeqCst) => tx.send(output).is_ok(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::transcoder::samples_to_pcm;
    use crate::relay::event::Speaker;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn transcript(text: &str) -> ModelEvent {
        ModelEvent::PartialTranscript {
            text: text.to_string(),
            speaker: Speaker::Assistant,
        }
    }

    async fn next(rx: &mut RelayOutputs) -> RelayOutput {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for output")
            .expect("output channel closed")
    }

    #[tokio::test]
    async fn test_dispatches_only_on_turn_complete() {
        let (queue, mut rx) = TurnQueue::new("call-1", Transcoder::new());

        assert!(queue.enqueue(transcript("hello")));
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());

        assert!(queue.enqueue(ModelEvent::TurnComplete));

        assert_eq!(
            next(&mut rx).await,
            RelayOutput::Transcript {
                text: "hello".into(),
                speaker: Speaker::Assistant
            }
        );
        assert_eq!(next(&mut rx).await, RelayOutput::TurnComplete);
        assert_eq!(queue.stats().turns_dispatched, 1);
    }

    #[tokio::test]
    async fn test_buffered_turns_dispatch_in_order() {
        let (queue, mut rx) = TurnQueue::new("call-2", Transcoder::new());

        queue.enqueue(transcript("a"));
        queue.enqueue(ModelEvent::Interrupted);
        queue.enqueue(ModelEvent::TurnComplete);
        queue.enqueue(ModelEvent::Error {
            detail: "quota".into(),
        });
        queue.enqueue(transcript("b"));
        queue.enqueue(ModelEvent::TurnComplete);

        let mut outputs = Vec::new();
        for _ in 0..6 {
            outputs.push(next(&mut rx).await);
        }

        assert_eq!(
            outputs,
            vec![
                RelayOutput::Transcript {
                    text: "a".into(),
                    speaker: Speaker::Assistant
                },
                RelayOutput::Interrupted,
                RelayOutput::TurnComplete,
                RelayOutput::ModelError("quota".into()),
                RelayOutput::Transcript {
                    text: "b".into(),
                    speaker: Speaker::Assistant
                },
                RelayOutput::TurnComplete,
            ]
        );
        assert_eq!(queue.stats().turns_dispatched, 2);
        assert_eq!(queue.stats().peak_concurrent_drains, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_keep_order_and_single_flight() {
        const PRODUCERS: usize = 8;
        const EVENTS_PER_PRODUCER: usize = 200;

        let (queue, mut rx) = TurnQueue::new("call-3", Transcoder::new());
        // Enqueue happens under this lock so the log records the true order.
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for producer in 0..PRODUCERS {
            let queue = queue.clone();
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                for i in 0..EVENTS_PER_PRODUCER {
                    let event = if i % 7 == 6 {
                        ModelEvent::TurnComplete
                    } else {
                        transcript(&format!("p{}-{}", producer, i))
                    };
                    {
                        let mut log = log.lock();
                        log.push(event.clone());
                        queue.enqueue(event);
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        {
            let mut log = log.lock();
            log.push(ModelEvent::TurnComplete);
            queue.enqueue(ModelEvent::TurnComplete);
        }

        let expected: Vec<RelayOutput> = log
            .lock()
            .iter()
            .map(|event| match event {
                ModelEvent::PartialTranscript { text, speaker } => RelayOutput::Transcript {
                    text: text.clone(),
                    speaker: *speaker,
                },
                _ => RelayOutput::TurnComplete,
            })
            .collect();

        let mut received = Vec::with_capacity(expected.len());
        while received.len() < expected.len() {
            received.push(next(&mut rx).await);
        }

        assert_eq!(received, expected);
        assert_eq!(queue.stats().peak_concurrent_drains, 1);
    }

    #[tokio::test]
    async fn test_abort_discards_pending_turn() {
        let (queue, mut rx) = TurnQueue::new("call-4", Transcoder::new());

        queue.enqueue(transcript("never delivered"));
        tokio::task::yield_now().await;

        queue.abort();

        assert!(rx.recv().await.is_none());
        assert!(!queue.enqueue(ModelEvent::TurnComplete));
        assert!(!queue.is_in_flight());
        assert_eq!(queue.pending_len(), 0);

        for _ in 0..50 {
            if queue.stats().events_discarded == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.stats().events_discarded, 1);
        assert_eq!(queue.stats().turns_dispatched, 0);
    }

    #[tokio::test]
    async fn test_bad_audio_chunk_is_dropped() {
        let (queue, mut rx) = TurnQueue::new("call-5", Transcoder::new());

        queue.enqueue(ModelEvent::AudioChunk {
            bytes: vec![0; 12],
            rate: 16_000,
        });
        queue.enqueue(ModelEvent::AudioChunk {
            bytes: samples_to_pcm(&[1000, 0, 0]),
            rate: 24_000,
        });
        queue.enqueue(ModelEvent::TurnComplete);

        assert_eq!(next(&mut rx).await, RelayOutput::OutboundAudio(vec![0xCE]));
        assert_eq!(next(&mut rx).await, RelayOutput::TurnComplete);

        let stats = queue.stats();
        assert_eq!(stats.audio_chunks_dropped, 1);
        assert_eq!(stats.audio_chunks_out, 1);
    }

    #[tokio::test]
    async fn test_dropped_receiver_resets_flight() {
        let (queue, rx) = TurnQueue::new("call-6", Transcoder::new());
        drop(rx);

        queue.enqueue(transcript("lost"));
        queue.enqueue(ModelEvent::TurnComplete);

        for _ in 0..50 {
            if !queue.is_in_flight() && queue.pending_len() == 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(!queue.is_in_flight());
        assert_eq!(queue.pending_len(), 0);
    }
}
