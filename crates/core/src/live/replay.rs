use super::{AudioCapture, CaptureError, ChunkSink, LOG_TARGET};
use crate::decode::Waveform;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Duration;
use tokio::sync::watch;

/// Feeds a recorded waveform through the live path in fixed-size chunks,
/// optionally paced at real time.
#[derive(Clone, Debug)]
pub struct ReplayCapture {
    waveform: Waveform,
    chunk_frames: usize,
    realtime: bool,
}

impl ReplayCapture {
    pub fn new(waveform: Waveform, chunk_frames: usize) -> Self {
        Self {
            waveform,
            chunk_frames: chunk_frames.max(1),
            realtime: false,
        }
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

impl AudioCapture for ReplayCapture {
    fn sample_rate(&self) -> u32 {
        self.waveform.sample_rate
    }

    fn capture(
        &self,
        sink: ChunkSink,
        shutdown: watch::Receiver<bool>,
    ) -> BoxFuture<'_, Result<(), CaptureError>> {
        async move {
            if self.waveform.sample_rate == 0 {
                return Err(CaptureError::Unavailable("replay source has no sample rate".into()));
            }
            let pace = Duration::from_secs_f64(
                self.chunk_frames as f64 / f64::from(self.waveform.sample_rate),
            );
            let mut emitted = 0;
            for chunk in self.waveform.samples.chunks(self.chunk_frames) {
                if *shutdown.borrow() {
                    tracing::info!(target: LOG_TARGET, "replay stopped");
                    break;
                }
                emitted += sink.push(chunk);
                if self.realtime {
                    tokio::time::sleep(pace).await;
                } else {
                    tokio::task::yield_now().await;
                }
            }
            tracing::debug!(target: LOG_TARGET, segments = emitted, "replay finished");
            Ok(())
        }
        .boxed()
    }
}
