//! Native microphone backend using CPAL
//!
//! The CPAL stream is not `Send`, so each acquisition runs it on a dedicated
//! audio thread. Samples are converted to i16 in the input callback and
//! forwarded as chunks over a channel; releasing the track tells the thread
//! to drop the stream and reaps it off the async workers.

use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use tokio::sync::{mpsc, oneshot};

use crate::capture::{AudioChunk, AudioFormat, AudioTrack, DeviceTrack, Microphone};
use crate::error::{DeviceError, DeviceKind};

/// Microphone backed by the host's default input device.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    pub fn new() -> Self {
        Self
    }

    /// Name of the default input device, if one is present.
    pub fn default_device_name() -> Option<String> {
        cpal::default_host()
            .default_input_device()
            .and_then(|d| d.name().ok())
    }
}

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn acquire(&self) -> Result<Box<dyn AudioTrack>, DeviceError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();

        let thread = thread::Builder::new()
            .name("microphone-capture".to_string())
            .spawn(move || run_capture_thread(chunk_tx, stop_rx, ready_tx))
            .map_err(|e| DeviceError::unavailable(DeviceKind::Microphone, e.to_string()))?;

        let format = match ready_rx.await {
            Ok(Ok(format)) => format,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(DeviceError::unavailable(
                    DeviceKind::Microphone,
                    "audio thread exited before the stream started",
                ));
            }
        };

        Ok(Box::new(CpalTrack {
            format,
            chunks: Some(chunk_rx),
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }))
    }
}

/// Handle to a running input stream on the audio thread.
struct CpalTrack {
    format: AudioFormat,
    chunks: Option<mpsc::UnboundedReceiver<AudioChunk>>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceTrack for CpalTrack {
    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            reap_capture_thread(thread);
        }
    }
}

/// Join the capture thread once it has dropped its stream.
///
/// Inside a runtime the join goes to the blocking pool, so a slow driver
/// teardown never stalls the worker that released the track.
fn reap_capture_thread(thread: JoinHandle<()>) {
    fn join(thread: JoinHandle<()>) {
        if thread.join().is_err() {
            log::error!("Microphone capture thread panicked");
        }
    }

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || join(thread));
        }
        Err(_) => join(thread),
    }
}

impl AudioTrack for CpalTrack {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn take_chunks(&mut self) -> Option<mpsc::UnboundedReceiver<AudioChunk>> {
        self.chunks.take()
    }
}

impl Drop for CpalTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture_thread(
    chunk_tx: mpsc::UnboundedSender<AudioChunk>,
    stop_rx: std_mpsc::Receiver<()>,
    ready_tx: oneshot::Sender<Result<AudioFormat, DeviceError>>,
) {
    let (stream, format) = match open_default_input(chunk_tx) {
        Ok(opened) => opened,
        Err(e) => {
            log::warn!("Microphone acquisition failed: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if ready_tx.send(Ok(format)).is_err() {
        // Acquirer went away while the device was opening
        return;
    }

    log::info!(
        "Microphone streaming: {} Hz, {} channel(s)",
        format.sample_rate,
        format.channels
    );

    // Blocks until stop is requested or the track is dropped
    let _ = stop_rx.recv();
    drop(stream);
    log::info!("Microphone stream closed");
}

fn open_default_input(
    chunk_tx: mpsc::UnboundedSender<AudioChunk>,
) -> Result<(Stream, AudioFormat), DeviceError> {
    let host = cpal::default_host();

    let device = host.default_input_device().ok_or_else(|| {
        DeviceError::unavailable(DeviceKind::Microphone, "No audio input device found")
    })?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported_config = device.default_input_config().map_err(|e| {
        DeviceError::unavailable(
            DeviceKind::Microphone,
            format!("No supported audio configuration: {}", e),
        )
    })?;

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let format = AudioFormat {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    };

    let stream = match sample_format {
        SampleFormat::I16 => build_stream::<i16>(&device, &config, chunk_tx),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, chunk_tx),
        SampleFormat::F32 => build_stream::<f32>(&device, &config, chunk_tx),
        other => Err(DeviceError::unavailable(
            DeviceKind::Microphone,
            format!("Unsupported sample format {:?}", other),
        )),
    }?;

    stream.play().map_err(|e| classify_stream_error(e.to_string()))?;

    Ok((stream, format))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    chunk_tx: mpsc::UnboundedSender<AudioChunk>,
) -> Result<Stream, DeviceError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let err_fn = |err| log::error!("Audio stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let chunk: AudioChunk = data.iter().map(|&s| sample_to_i16(s)).collect();
                // Receiver gone means the recording was finalized
                let _ = chunk_tx.send(chunk);
            },
            err_fn,
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                DeviceError::unavailable(DeviceKind::Microphone, "Input device disappeared")
            }
            other => classify_stream_error(other.to_string()),
        })
}

/// Backends report OS-level permission refusals as free-form text.
fn classify_stream_error(message: String) -> DeviceError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        DeviceError::denied(DeviceKind::Microphone, message)
    } else {
        DeviceError::unavailable(DeviceKind::Microphone, message)
    }
}

/// Convert any sample type to i16.
fn sample_to_i16<T>(sample: T) -> i16
where
    f32: FromSample<T>,
{
    let f32_sample = f32::from_sample_(sample);
    // Clamp and convert to i16
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn slow_thread() -> JoinHandle<()> {
        thread::spawn(|| thread::sleep(Duration::from_millis(300)))
    }

    #[tokio::test]
    async fn release_inside_runtime_does_not_block_on_the_thread() {
        let started = Instant::now();
        reap_capture_thread(slow_thread());
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn release_outside_runtime_joins_inline() {
        let started = Instant::now();
        reap_capture_thread(slow_thread());
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn test_sample_to_i16() {
        // Test f32 conversion
        assert_eq!(sample_to_i16(0.0f32), 0);
        assert_eq!(sample_to_i16(1.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-1.0f32), -i16::MAX);

        // Test clamping
        assert_eq!(sample_to_i16(2.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-2.0f32), -i16::MAX);
    }

    #[test]
    fn permission_text_is_classified_as_denial() {
        let err = classify_stream_error("Access denied by the system".to_string());
        assert!(matches!(err, DeviceError::PermissionDenied { .. }));

        let err = classify_stream_error("device busy".to_string());
        assert!(matches!(err, DeviceError::Unavailable { .. }));
    }
}
