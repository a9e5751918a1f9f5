//! Microphone capture controller
//!
//! ```text
//! Idle → RequestingPermission → Recording → Stopped(asset)
//!               ↓                   ↓
//!             Error               Error
//! ```
//!
//! The device is held if and only if the controller is `Recording`.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{AudioChunk, AudioFormat, AudioTrack, DeviceLease, DeviceTrack, Microphone};
use crate::audio::{encode_wav, WAV_MIME_TYPE};
use crate::error::{DeviceError, DeviceKind, ErrorKind};
use crate::media::{MediaAsset, MediaKind, Provenance};

#[derive(Debug, Clone)]
pub enum MicrophoneState {
    Idle,
    RequestingPermission,
    Recording { started_at: Instant },
    Stopped(MediaAsset),
    Error { kind: ErrorKind, message: String },
}

impl MicrophoneState {
    pub fn is_recording(&self) -> bool {
        matches!(self, MicrophoneState::Recording { .. })
    }
}

/// One live recording: the device lease plus the task buffering its chunks.
struct RecordingSession {
    lease: DeviceLease<Box<dyn AudioTrack>>,
    format: AudioFormat,
    collector: JoinHandle<Vec<i16>>,
    finish_tx: oneshot::Sender<()>,
}

pub struct MicrophoneController {
    device: Arc<dyn Microphone>,
    context: CancellationToken,
    session: Option<RecordingSession>,
    state_tx: watch::Sender<MicrophoneState>,
}

impl MicrophoneController {
    /// `context` is the hosting page's lifetime; cancelling it aborts a
    /// pending permission request.
    pub fn new(device: Arc<dyn Microphone>, context: CancellationToken) -> Self {
        let (state_tx, _) = watch::channel(MicrophoneState::Idle);
        Self {
            device,
            context,
            session: None,
            state_tx,
        }
    }

    pub fn state(&self) -> MicrophoneState {
        self.state_tx.borrow().clone()
    }

    /// Observe state changes. A `Stopped` state carries the finished asset.
    pub fn subscribe(&self) -> watch::Receiver<MicrophoneState> {
        self.state_tx.subscribe()
    }

    pub fn is_holding_device(&self) -> bool {
        self.session.is_some()
    }

    /// Request the microphone and start buffering audio.
    ///
    /// A recording already in progress is torn down first and its audio is
    /// discarded.
    pub async fn start(&mut self) -> Result<(), DeviceError> {
        if self.session.is_some() {
            log::info!("Microphone restart requested, discarding current recording");
            self.teardown_session();
        }

        self.set_state(MicrophoneState::RequestingPermission);

        let acquired = tokio::select! {
            biased;
            _ = self.context.cancelled() => Err(DeviceError::Closed { device: DeviceKind::Microphone }),
            result = self.device.acquire() => result,
        };

        let mut track = match acquired {
            Ok(track) => track,
            Err(e) if e.is_closed() => {
                self.set_state(MicrophoneState::Idle);
                return Err(e);
            }
            Err(e) => {
                log::warn!("Microphone start failed: {}", e);
                self.set_state(MicrophoneState::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let format = track.format();
        let Some(chunks) = track.take_chunks() else {
            track.stop();
            let err = DeviceError::unavailable(
                DeviceKind::Microphone,
                "audio track delivered no chunk stream",
            );
            self.set_state(MicrophoneState::Error {
                kind: err.kind(),
                message: err.to_string(),
            });
            return Err(err);
        };

        let lease = DeviceLease::new(DeviceKind::Microphone, track);
        let (finish_tx, finish_rx) = oneshot::channel();
        let collector = tokio::spawn(collect_chunks(chunks, finish_rx));

        self.session = Some(RecordingSession {
            lease,
            format,
            collector,
            finish_tx,
        });
        self.set_state(MicrophoneState::Recording {
            started_at: Instant::now(),
        });
        log::info!(
            "Recording started ({} Hz, {} channel(s))",
            format.sample_rate,
            format.channels
        );
        Ok(())
    }

    /// Finalize the recording into an audio asset and release the device.
    ///
    /// Returns `Ok(None)` when not recording.
    pub async fn stop(&mut self) -> Result<Option<MediaAsset>, DeviceError> {
        let Some(session) = self.session.take() else {
            log::debug!("Microphone stop ignored: not recording");
            return Ok(None);
        };

        let RecordingSession {
            lease,
            format,
            collector,
            finish_tx,
        } = session;

        lease.release();
        let _ = finish_tx.send(());

        let encoded = match collector.await {
            Ok(samples) => encode_wav(&samples, format)
                .map_err(|e| DeviceError::encoding(DeviceKind::Microphone, e.to_string())),
            Err(e) => Err(DeviceError::encoding(
                DeviceKind::Microphone,
                format!("chunk buffer task failed: {}", e),
            )),
        };

        match encoded {
            Ok(bytes) => {
                let asset = MediaAsset::new(
                    MediaKind::Audio,
                    bytes,
                    WAV_MIME_TYPE,
                    None,
                    Provenance::Recorded,
                );
                log::info!("Recording stopped: {} bytes of WAV", asset.len());
                self.set_state(MicrophoneState::Stopped(asset.clone()));
                Ok(Some(asset))
            }
            Err(e) => {
                log::error!("Failed to finalize recording: {}", e);
                self.set_state(MicrophoneState::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Discard any recording or held asset and return to `Idle`.
    pub fn reset(&mut self) {
        self.teardown_session();
        self.set_state(MicrophoneState::Idle);
    }

    fn teardown_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.lease.release();
            session.collector.abort();
        }
    }

    fn set_state(&self, state: MicrophoneState) {
        self.state_tx.send_replace(state);
    }
}

impl Drop for MicrophoneController {
    fn drop(&mut self) {
        self.teardown_session();
    }
}

/// Buffer chunks until the finish signal, then drain whatever is queued.
async fn collect_chunks(
    mut chunks: tokio::sync::mpsc::UnboundedReceiver<AudioChunk>,
    mut finish_rx: oneshot::Receiver<()>,
) -> Vec<i16> {
    let mut samples = Vec::new();
    loop {
        tokio::select! {
            biased;
            chunk = chunks.recv() => match chunk {
                Some(chunk) => samples.extend_from_slice(&chunk),
                None => break,
            },
            _ = &mut finish_rx => {
                while let Ok(chunk) = chunks.try_recv() {
                    samples.extend_from_slice(&chunk);
                }
                break;
            }
        }
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Clone, Copy)]
    enum Behaviour {
        Grant,
        Deny,
        Missing,
    }

    struct FakeMicrophone {
        behaviour: Behaviour,
        held: Arc<AtomicUsize>,
        chunks: Vec<AudioChunk>,
    }

    impl FakeMicrophone {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                held: Arc::new(AtomicUsize::new(0)),
                chunks: vec![vec![1, 2, 3, 4], vec![5, 6]],
            }
        }
    }

    struct FakeTrack {
        held: Arc<AtomicUsize>,
        chunks: Option<mpsc::UnboundedReceiver<AudioChunk>>,
        // Kept alive so the stream only ends when the controller says so
        _tx: mpsc::UnboundedSender<AudioChunk>,
        stopped: bool,
    }

    impl DeviceTrack for FakeTrack {
        fn stop(&mut self) {
            if !self.stopped {
                self.stopped = true;
                self.held.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    impl AudioTrack for FakeTrack {
        fn format(&self) -> AudioFormat {
            AudioFormat {
                sample_rate: 8_000,
                channels: 1,
            }
        }

        fn take_chunks(&mut self) -> Option<mpsc::UnboundedReceiver<AudioChunk>> {
            self.chunks.take()
        }
    }

    #[async_trait]
    impl Microphone for FakeMicrophone {
        async fn acquire(&self) -> Result<Box<dyn AudioTrack>, DeviceError> {
            match self.behaviour {
                Behaviour::Deny => Err(DeviceError::denied(DeviceKind::Microphone, "user said no")),
                Behaviour::Missing => Err(DeviceError::unavailable(
                    DeviceKind::Microphone,
                    "no input device",
                )),
                Behaviour::Grant => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    for chunk in &self.chunks {
                        tx.send(chunk.clone()).unwrap();
                    }
                    self.held.fetch_add(1, Ordering::SeqCst);
                    Ok(Box::new(FakeTrack {
                        held: self.held.clone(),
                        chunks: Some(rx),
                        _tx: tx,
                        stopped: false,
                    }))
                }
            }
        }
    }

    fn controller(behaviour: Behaviour) -> (MicrophoneController, Arc<AtomicUsize>) {
        let mic = FakeMicrophone::new(behaviour);
        let held = mic.held.clone();
        (
            MicrophoneController::new(Arc::new(mic), CancellationToken::new()),
            held,
        )
    }

    #[tokio::test]
    async fn start_stop_produces_one_wav_asset_and_releases_device() {
        let (mut mic, held) = controller(Behaviour::Grant);
        let mut states = mic.subscribe();

        mic.start().await.unwrap();
        assert!(mic.state().is_recording());
        assert!(mic.is_holding_device());
        assert_eq!(held.load(Ordering::SeqCst), 1);

        let asset = mic.stop().await.unwrap().expect("asset");
        assert_eq!(held.load(Ordering::SeqCst), 0);
        assert!(!mic.is_holding_device());
        assert_eq!(asset.kind(), MediaKind::Audio);
        assert_eq!(asset.mime_type(), "audio/wav");
        assert_eq!(asset.provenance(), Provenance::Recorded);

        let reader = hound::WavReader::new(Cursor::new(asset.bytes().to_vec())).unwrap();
        let samples: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, 2, 3, 4, 5, 6]);

        // Observers see the finished asset
        states.changed().await.unwrap();
        assert!(matches!(&*states.borrow(), MicrophoneState::Stopped(a) if a.id() == asset.id()));
    }

    #[tokio::test]
    async fn stop_when_not_recording_is_a_noop() {
        let (mut mic, _) = controller(Behaviour::Grant);
        assert!(mic.stop().await.unwrap().is_none());
        assert!(matches!(mic.state(), MicrophoneState::Idle));
    }

    #[tokio::test]
    async fn denial_and_missing_device_end_in_error_state() {
        let (mut mic, held) = controller(Behaviour::Deny);
        let err = mic.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(matches!(
            mic.state(),
            MicrophoneState::Error {
                kind: ErrorKind::PermissionDenied,
                ..
            }
        ));
        assert_eq!(held.load(Ordering::SeqCst), 0);

        let (mut mic, _) = controller(Behaviour::Missing);
        let err = mic.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
    }

    #[tokio::test]
    async fn restart_tears_down_previous_session() {
        let (mut mic, held) = controller(Behaviour::Grant);
        mic.start().await.unwrap();
        mic.start().await.unwrap();
        assert_eq!(held.load(Ordering::SeqCst), 1);
        mic.reset();
        assert_eq!(held.load(Ordering::SeqCst), 0);
        assert!(matches!(mic.state(), MicrophoneState::Idle));
    }

    #[tokio::test]
    async fn closed_context_aborts_start_without_holding_device() {
        let mic = FakeMicrophone::new(Behaviour::Grant);
        let held = mic.held.clone();
        let context = CancellationToken::new();
        let mut controller = MicrophoneController::new(Arc::new(mic), context.clone());

        context.cancel();
        let err = controller.start().await.unwrap_err();
        assert!(err.is_closed());
        assert!(matches!(controller.state(), MicrophoneState::Idle));
        assert_eq!(held.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropping_controller_releases_device() {
        let (mut mic, held) = controller(Behaviour::Grant);
        mic.start().await.unwrap();
        drop(mic);
        assert_eq!(held.load(Ordering::SeqCst), 0);
    }
}
