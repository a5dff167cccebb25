use super::{AudioCapture, CaptureError, ChunkSink, LOG_TARGET};
use crate::decode::{downmix_to_mono, i16_to_f32_pcm};
use futures::future::BoxFuture;
use futures::FutureExt;
use rodio::cpal;
use rodio::cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::{mpsc, oneshot, watch};

/// Default (or named) system input device.
///
/// cpal streams are not `Send`, so the stream lives on its own thread for
/// the duration of [`AudioCapture::capture`].
#[derive(Clone, Debug)]
pub struct MicrophoneCapture {
    device_name: Option<String>,
    sample_rate: u32,
    channels: usize,
}

impl MicrophoneCapture {
    pub fn open(device_name: Option<String>) -> Result<Self, CaptureError> {
        let device = find_device(device_name.as_deref())?;
        let config = device
            .default_input_config()
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?;
        tracing::info!(
            target: LOG_TARGET,
            device = %device.name().unwrap_or_else(|_| "<unnamed>".into()),
            sample_rate = config.sample_rate().0,
            channels = config.channels(),
            "microphone opened"
        );
        Ok(Self {
            device_name,
            sample_rate: config.sample_rate().0,
            channels: usize::from(config.channels()),
        })
    }
}

fn find_device(name: Option<&str>) -> Result<cpal::Device, CaptureError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_input_device()
            .ok_or_else(|| CaptureError::Unavailable("no default input device".into())),
        Some(wanted) => host
            .input_devices()
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| CaptureError::Unavailable(format!("input device `{wanted}` not found"))),
    }
}

fn build_stream(
    device_name: Option<&str>,
    channels: usize,
    sink: ChunkSink,
    errors: mpsc::UnboundedSender<String>,
) -> Result<cpal::Stream, CaptureError> {
    let device = find_device(device_name)?;
    let supported = device
        .default_input_config()
        .map_err(|e| CaptureError::Unavailable(e.to_string()))?;
    let config: cpal::StreamConfig = supported.config();
    let on_error = move |e: cpal::StreamError| {
        let _ = errors.send(e.to_string());
    };

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                sink.push(&downmix_to_mono(data, channels));
            },
            on_error,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                sink.push(&downmix_to_mono(&i16_to_f32_pcm(data), channels));
            },
            on_error,
            None,
        ),
        other => {
            return Err(CaptureError::Unavailable(format!(
                "unsupported input sample format {other:?}"
            )))
        }
    };
    stream.map_err(|e| CaptureError::Stream(e.to_string()))
}

impl AudioCapture for MicrophoneCapture {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn capture(
        &self,
        sink: ChunkSink,
        mut shutdown: watch::Receiver<bool>,
    ) -> BoxFuture<'_, Result<(), CaptureError>> {
        let device_name = self.device_name.clone();
        let channels = self.channels;
        async move {
            let (err_tx, mut err_rx) = mpsc::unbounded_channel();
            let (ready_tx, ready_rx) = oneshot::channel();
            let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

            let worker = std::thread::spawn(move || {
                let stream = match build_stream(device_name.as_deref(), channels, sink, err_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(CaptureError::Stream(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Blocks until told to stop or the async side goes away.
                let _ = stop_rx.recv();
                drop(stream);
            });

            ready_rx
                .await
                .map_err(|_| CaptureError::Stream("capture thread exited early".into()))??;
            tracing::info!(target: LOG_TARGET, "microphone capture running");

            let result = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop).map(|_| ()) => Ok(()),
                Some(e) = err_rx.recv() => Err(CaptureError::Stream(e)),
                else => Ok(()),
            };

            let _ = stop_tx.send(());
            let _ = tokio::task::spawn_blocking(move || worker.join()).await;
            result
        }
        .boxed()
    }
}
