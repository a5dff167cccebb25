//! Continuous classification of captured audio.
//!
//! A capture source pushes raw chunks through a [`ChunkSink`] into a
//! [`SegmentAssembler`], which cuts fixed-length [`AudioSegment`]s into a
//! bounded [`SegmentQueue`]. [`LiveSession::run`] drains the queue one whole
//! segment at a time. When the consumer falls behind, the oldest queued
//! segment is dropped; the producer never waits.

#[cfg(feature = "microphone")]
mod microphone;
mod replay;

use crate::config::{ConfigError, LiveConfig, SegmentDuration};
use crate::decode::peak_amplitude;
use crate::inference::{InferenceEngine, Prediction};
use crate::util::RingBuffer;
use futures::future::BoxFuture;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Notify};

#[cfg(feature = "microphone")]
pub use microphone::MicrophoneCapture;
pub use replay::ReplayCapture;

const LOG_TARGET: &str = "live";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("audio input unavailable: {0}")]
    Unavailable(String),

    #[error("audio input stream failed: {0}")]
    Stream(String),
}

#[derive(thiserror::Error, Debug)]
pub enum LiveError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// A complete, fixed-length stretch of captured mono audio.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioSegment {
    pub sequence: u64,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioSegment {
    pub fn peak(&self) -> f32 {
        peak_amplitude(&self.samples)
    }
}

struct QueueState {
    segments: RingBuffer<AudioSegment>,
    closed: bool,
}

/// Bounded single-consumer segment queue with drop-oldest overflow.
pub struct SegmentQueue {
    state: Mutex<QueueState>,
    ready: Notify,
    dropped: AtomicU64,
}

impl SegmentQueue {
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        let capacity = NonZeroUsize::new(capacity).ok_or(ConfigError::ZeroBuffer)?;
        Ok(Self {
            state: Mutex::new(QueueState {
                segments: RingBuffer::new(capacity),
                closed: false,
            }),
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!(target: LOG_TARGET, "segment queue lock was poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Enqueues without blocking. Returns the segment evicted to make room.
    pub fn push(&self, segment: AudioSegment) -> Option<AudioSegment> {
        let evicted = {
            let mut state = self.lock();
            if state.closed {
                return None;
            }
            state.segments.push(segment)
        };
        if let Some(old) = &evicted {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                target: LOG_TARGET,
                sequence = old.sequence,
                dropped_total = total,
                "consumer behind; dropped oldest segment"
            );
        }
        self.ready.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<AudioSegment> {
        self.lock().segments.pop_oldest()
    }

    /// Waits for the next segment; `None` once closed and drained.
    pub async fn pop(&self) -> Option<AudioSegment> {
        loop {
            {
                let mut state = self.lock();
                if let Some(segment) = state.segments.pop_oldest() {
                    return Some(segment);
                }
                if state.closed {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }

    /// Rejects further pushes; queued segments can still be drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Accumulates raw chunks and emits whole segments; a trailing partial
/// segment is never emitted.
pub struct SegmentAssembler {
    frames_per_segment: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    next_sequence: u64,
    queue: Arc<SegmentQueue>,
}

impl SegmentAssembler {
    pub fn new(
        segment: SegmentDuration,
        sample_rate: u32,
        queue: Arc<SegmentQueue>,
    ) -> Result<Self, ConfigError> {
        let frames_per_segment = segment.frames_for_sample_rate(sample_rate);
        if frames_per_segment == 0 {
            return Err(ConfigError::ZeroSegment);
        }
        Ok(Self {
            frames_per_segment,
            sample_rate,
            pending: Vec::with_capacity(frames_per_segment),
            next_sequence: 0,
            queue,
        })
    }

    pub fn frames_per_segment(&self) -> usize {
        self.frames_per_segment
    }

    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    /// Returns the number of segments emitted by this chunk.
    pub fn push(&mut self, chunk: &[f32]) -> usize {
        let mut emitted = 0;
        let mut rest = chunk;
        while !rest.is_empty() {
            let take = (self.frames_per_segment - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.frames_per_segment {
                let samples = std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.frames_per_segment),
                );
                self.queue.push(AudioSegment {
                    sequence: self.next_sequence,
                    samples,
                    sample_rate: self.sample_rate,
                });
                self.next_sequence += 1;
                emitted += 1;
            }
        }
        emitted
    }
}

/// Cloneable handle capture sources write into, usable from audio threads.
#[derive(Clone)]
pub struct ChunkSink {
    assembler: Arc<Mutex<SegmentAssembler>>,
}

impl ChunkSink {
    pub fn new(assembler: SegmentAssembler) -> Self {
        Self {
            assembler: Arc::new(Mutex::new(assembler)),
        }
    }

    pub fn push(&self, chunk: &[f32]) -> usize {
        let mut assembler = match self.assembler.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        assembler.push(chunk)
    }
}

pub trait AudioCapture: Send + Sync {
    /// Native rate of the chunks this source delivers.
    fn sample_rate(&self) -> u32;

    /// Delivers mono chunks into `sink` until the source ends or `shutdown`
    /// turns true.
    fn capture(
        &self,
        sink: ChunkSink,
        shutdown: watch::Receiver<bool>,
    ) -> BoxFuture<'_, Result<(), CaptureError>>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum LiveEvent {
    Prediction {
        sequence: u64,
        prediction: Prediction,
    },
    /// Segment peak below the configured minimum; not classified.
    TooQuiet { sequence: u64, peak: f32 },
    Failed { sequence: u64, error: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LiveSummary {
    pub predicted: u64,
    pub too_quiet: u64,
    pub failed: u64,
    pub dropped: u64,
}

pub struct LiveSession {
    engine: Arc<InferenceEngine>,
    config: LiveConfig,
}

impl LiveSession {
    pub fn new(engine: Arc<InferenceEngine>, config: LiveConfig) -> Self {
        Self { engine, config }
    }

    /// Captures and classifies until the source ends or `shutdown` fires,
    /// then drains what is already queued.
    pub async fn run<C, F>(
        &self,
        capture: &C,
        shutdown: watch::Receiver<bool>,
        mut on_event: F,
    ) -> Result<LiveSummary, LiveError>
    where
        C: AudioCapture + ?Sized,
        F: FnMut(LiveEvent),
    {
        let queue = Arc::new(SegmentQueue::new(self.config.buffer_segments)?);
        let assembler =
            SegmentAssembler::new(self.config.segment, capture.sample_rate(), queue.clone())?;
        tracing::info!(
            target: LOG_TARGET,
            sample_rate = capture.sample_rate(),
            frames_per_segment = assembler.frames_per_segment(),
            buffer_segments = self.config.buffer_segments,
            "live session started"
        );
        let sink = ChunkSink::new(assembler);

        let producer = async {
            let result = capture.capture(sink, shutdown).await;
            queue.close();
            result
        };

        let consumer = async {
            let mut summary = LiveSummary::default();
            while let Some(segment) = queue.pop().await {
                let event = self.classify(segment).await;
                match &event {
                    LiveEvent::Prediction { .. } => summary.predicted += 1,
                    LiveEvent::TooQuiet { .. } => summary.too_quiet += 1,
                    LiveEvent::Failed { .. } => summary.failed += 1,
                }
                on_event(event);
            }
            summary
        };

        let (captured, mut summary) = tokio::join!(producer, consumer);
        summary.dropped = queue.dropped();
        tracing::info!(
            target: LOG_TARGET,
            predicted = summary.predicted,
            too_quiet = summary.too_quiet,
            failed = summary.failed,
            dropped = summary.dropped,
            "live session ended"
        );
        captured?;
        Ok(summary)
    }

    async fn classify(&self, segment: AudioSegment) -> LiveEvent {
        let sequence = segment.sequence;
        let peak = segment.peak();
        if peak < self.config.min_peak {
            tracing::debug!(target: LOG_TARGET, sequence, peak, "segment too quiet");
            return LiveEvent::TooQuiet { sequence, peak };
        }

        let engine = self.engine.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            engine.predict_waveform(&segment.samples, segment.sample_rate)
        })
        .await;
        match outcome {
            Ok(Ok(prediction)) => LiveEvent::Prediction {
                sequence,
                prediction,
            },
            Ok(Err(e)) => {
                tracing::warn!(target: LOG_TARGET, sequence, error = %e, "segment classification failed");
                LiveEvent::Failed {
                    sequence,
                    error: e.to_string(),
                }
            }
            Err(e) => LiveEvent::Failed {
                sequence,
                error: e.to_string(),
            },
        }
    }
}
