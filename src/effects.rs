//! Effect runner for the capture studio
//!
//! This module executes the effects produced by the state machine. Each
//! device is owned by one worker task that consumes an ordered command
//! queue, so transitions on one device never overlap while the two devices
//! stay independent of each other. Submissions run as plain tasks; the
//! pipeline enforces single-flight.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capture::{Camera, CameraController, CameraState, Microphone, MicrophoneController};
use crate::error::{DeviceError, ErrorKind};
use crate::media::{MediaAsset, PreviewFile};
use crate::metrics::MetricsCollector;
use crate::state_machine::{Effect, Event};
use crate::submission::SubmissionPipeline;

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

enum MicCommand {
    Start { session_id: Uuid },
    Stop { session_id: Uuid },
    Reset,
}

enum CameraCommand {
    Start {
        session_id: Uuid,
        facing: crate::capture::FacingMode,
    },
    Capture {
        session_id: Uuid,
    },
    Close {
        session_id: Uuid,
    },
}

enum PreviewCommand {
    Publish(MediaAsset),
    Revoke(Uuid),
}

type Queue<T> = mpsc::UnboundedSender<(T, mpsc::Sender<Event>)>;

/// Settings the runner needs when building its workers.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub jpeg_quality: u8,
    /// Where preview files go; `None` disables previews.
    pub preview_dir: Option<PathBuf>,
}

/// Effect runner backed by real device controllers and the submission
/// pipeline.
pub struct StudioEffectRunner {
    mic_queue: Queue<MicCommand>,
    camera_queue: Option<Queue<CameraCommand>>,
    preview_queue: Option<mpsc::UnboundedSender<PreviewCommand>>,
    /// Session the microphone is currently recording, for the tick task
    recording: watch::Receiver<Option<Uuid>>,
    pipeline: Arc<SubmissionPipeline>,
    metrics: Arc<Mutex<MetricsCollector>>,
    context: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StudioEffectRunner {
    /// Spawn the device workers. Must be called from within a tokio runtime.
    pub fn new(
        microphone: Arc<dyn Microphone>,
        camera: Option<Arc<dyn Camera>>,
        pipeline: Arc<SubmissionPipeline>,
        metrics: Arc<Mutex<MetricsCollector>>,
        context: CancellationToken,
        options: RunnerOptions,
    ) -> Arc<Self> {
        let mut workers = Vec::new();

        let (recording_tx, recording) = watch::channel(None);
        let (mic_queue, mic_rx) = mpsc::unbounded_channel();
        let controller = MicrophoneController::new(microphone, context.clone());
        workers.push(tokio::spawn(run_microphone_worker(
            controller,
            mic_rx,
            recording_tx,
            metrics.clone(),
            context.clone(),
        )));

        let camera_queue = camera.map(|camera| {
            let (queue, rx) = mpsc::unbounded_channel();
            let controller = CameraController::new(camera, context.clone())
                .with_jpeg_quality(options.jpeg_quality);
            workers.push(tokio::spawn(run_camera_worker(
                controller,
                rx,
                metrics.clone(),
                context.clone(),
            )));
            queue
        });

        let preview_queue = options.preview_dir.map(|dir| {
            let (queue, rx) = mpsc::unbounded_channel();
            workers.push(tokio::spawn(run_preview_worker(dir, rx, context.clone())));
            queue
        });

        Arc::new(Self {
            mic_queue,
            camera_queue,
            preview_queue,
            recording,
            pipeline,
            metrics,
            context,
            workers: Mutex::new(workers),
        })
    }

    pub fn metrics(&self) -> Arc<Mutex<MetricsCollector>> {
        self.metrics.clone()
    }

    /// Cancel the context and wait for every worker to release its device.
    pub async fn shutdown(&self) {
        self.context.cancel();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                log::error!("Worker task failed during shutdown: {}", e);
            }
        }
        log::info!("Effect runner shut down");
    }

    fn mic(&self, command: MicCommand, tx: mpsc::Sender<Event>) {
        if self.mic_queue.send((command, tx)).is_err() {
            log::warn!("Microphone worker is gone, command dropped");
        }
    }

    fn camera(&self, command: CameraCommand, tx: mpsc::Sender<Event>) {
        match &self.camera_queue {
            Some(queue) => {
                if queue.send((command, tx)).is_err() {
                    log::warn!("Camera worker is gone, command dropped");
                }
            }
            None => no_camera(command, tx),
        }
    }

    fn preview(&self, command: PreviewCommand) {
        if let Some(queue) = &self.preview_queue {
            let _ = queue.send(command);
        }
    }
}

impl EffectRunner for StudioEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::StartMicrophone { session_id } => self.mic(MicCommand::Start { session_id }, tx),
            Effect::StopMicrophone { session_id } => self.mic(MicCommand::Stop { session_id }, tx),
            Effect::ResetMicrophone => self.mic(MicCommand::Reset, tx),

            Effect::StartCamera { session_id, facing } => {
                self.camera(CameraCommand::Start { session_id, facing }, tx)
            }
            Effect::CaptureFrame { session_id } => {
                self.camera(CameraCommand::Capture { session_id }, tx)
            }
            Effect::CloseCamera { session_id } => {
                self.camera(CameraCommand::Close { session_id }, tx)
            }

            Effect::StartRecordingTick { session_id } => {
                let recording = self.recording.clone();
                let context = self.context.clone();
                tokio::spawn(async move {
                    // Send tick events every second while this session records
                    let mut interval = tokio::time::interval(Duration::from_secs(1));
                    interval.tick().await;
                    loop {
                        tokio::select! {
                            _ = context.cancelled() => break,
                            _ = interval.tick() => {}
                        }
                        if *recording.borrow() != Some(session_id) {
                            log::debug!("Recording tick stopping - {} no longer recording", session_id);
                            break;
                        }
                        if tx.send(Event::RecordingTick { session_id }).await.is_err() {
                            log::debug!("Recording tick stopping - channel closed");
                            break;
                        }
                    }
                });
            }

            Effect::Submit {
                submission_id,
                request,
                auth,
            } => {
                // Registered before spawning so a following abort finds it
                let token = self.pipeline.begin(submission_id);
                let pipeline = self.pipeline.clone();
                let metrics = self.metrics.clone();
                let context = self.context.clone();
                tokio::spawn(async move {
                    {
                        let mut m = metrics.lock().await;
                        m.start_cycle(
                            submission_id,
                            request.image().len() as u64,
                            request.audio().len() as u64,
                            request.platform().as_str(),
                        );
                    }

                    let result = pipeline.run(submission_id, token, request, &auth).await;

                    {
                        let mut m = metrics.lock().await;
                        match &result {
                            Ok(_) => m.cycle_completed(submission_id),
                            Err(e) if e.is_aborted() => m.cycle_cancelled(submission_id),
                            Err(e) => m.cycle_failed(submission_id, e.kind(), e.message().to_string()),
                        }
                    }

                    // Partial results of a torn-down context are never surfaced
                    if context.is_cancelled() {
                        log::debug!("Dropping result of {} after teardown", submission_id);
                        return;
                    }
                    let _ = tx
                        .send(Event::SubmissionFinished {
                            submission_id,
                            result,
                        })
                        .await;
                });
            }

            Effect::AbortSubmission { submission_id } => {
                if self.pipeline.abort(submission_id) {
                    log::info!("Submission {} aborted", submission_id);
                }
            }

            Effect::PublishPreview { asset } => self.preview(PreviewCommand::Publish(asset)),
            Effect::RevokePreview { asset_id } => self.preview(PreviewCommand::Revoke(asset_id)),

            Effect::EmitUi => {
                log::warn!("EmitUi reached the effect runner; it is handled by the state loop");
            }
        }
    }
}

async fn run_microphone_worker(
    mut controller: MicrophoneController,
    mut rx: mpsc::UnboundedReceiver<(MicCommand, mpsc::Sender<Event>)>,
    recording: watch::Sender<Option<Uuid>>,
    metrics: Arc<Mutex<MetricsCollector>>,
    context: CancellationToken,
) {
    log::debug!("Microphone worker started");
    loop {
        let (command, tx) = tokio::select! {
            biased;
            _ = context.cancelled() => break,
            next = rx.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };

        let event = match command {
            MicCommand::Start { session_id } => match controller.start().await {
                Ok(()) => {
                    recording.send_replace(Some(session_id));
                    Some(Event::MicrophoneStarted { session_id })
                }
                Err(e) if e.is_closed() => None,
                Err(e) => {
                    record_device_error(&metrics, &e).await;
                    Some(Event::MicrophoneFailed {
                        session_id,
                        kind: e.kind(),
                        message: e.to_string(),
                    })
                }
            },
            MicCommand::Stop { session_id } => {
                recording.send_replace(None);
                match controller.stop().await {
                    Ok(Some(asset)) => Some(Event::RecordingFinished { session_id, asset }),
                    Ok(None) => Some(Event::RecordingFailed {
                        session_id,
                        kind: ErrorKind::DeviceUnavailable,
                        message: "No active recording".to_string(),
                    }),
                    Err(e) => {
                        record_device_error(&metrics, &e).await;
                        Some(Event::RecordingFailed {
                            session_id,
                            kind: e.kind(),
                            message: e.to_string(),
                        })
                    }
                }
            }
            MicCommand::Reset => {
                recording.send_replace(None);
                controller.reset();
                None
            }
        };

        if let Some(event) = event {
            let _ = tx.send(event).await;
        }
    }

    recording.send_replace(None);
    controller.reset();
    log::debug!("Microphone worker exited");
}

async fn run_camera_worker(
    mut controller: CameraController,
    mut rx: mpsc::UnboundedReceiver<(CameraCommand, mpsc::Sender<Event>)>,
    metrics: Arc<Mutex<MetricsCollector>>,
    context: CancellationToken,
) {
    log::debug!("Camera worker started");
    loop {
        let (command, tx) = tokio::select! {
            biased;
            _ = context.cancelled() => break,
            next = rx.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };

        let event = match command {
            CameraCommand::Start { session_id, facing } => match controller.start(facing).await {
                Ok(()) => match controller.state() {
                    CameraState::Streaming { facing, label } => Some(Event::CameraStarted {
                        session_id,
                        facing,
                        label,
                    }),
                    other => {
                        log::warn!("Camera started but reports {:?}", other);
                        None
                    }
                },
                Err(e) if e.is_closed() => None,
                Err(e) => {
                    record_device_error(&metrics, &e).await;
                    Some(Event::CameraFailed {
                        session_id,
                        kind: e.kind(),
                        message: e.to_string(),
                    })
                }
            },
            CameraCommand::Capture { session_id } => match controller.capture() {
                Ok(Some(asset)) => Some(Event::FrameCaptured { session_id, asset }),
                Ok(None) => Some(Event::CameraFailed {
                    session_id,
                    kind: ErrorKind::DeviceUnavailable,
                    message: "Camera is not streaming".to_string(),
                }),
                Err(e) => {
                    record_device_error(&metrics, &e).await;
                    Some(Event::CameraFailed {
                        session_id,
                        kind: e.kind(),
                        message: e.to_string(),
                    })
                }
            },
            CameraCommand::Close { session_id } => {
                controller.close();
                Some(Event::CameraClosed { session_id })
            }
        };

        if let Some(event) = event {
            let _ = tx.send(event).await;
        }
    }

    controller.close();
    log::debug!("Camera worker exited");
}

/// Answer camera commands when the host has no camera at all.
fn no_camera(command: CameraCommand, tx: mpsc::Sender<Event>) {
    let event = match command {
        CameraCommand::Start { session_id, .. } | CameraCommand::Capture { session_id } => {
            Event::CameraFailed {
                session_id,
                kind: ErrorKind::DeviceUnavailable,
                message: "No camera available".to_string(),
            }
        }
        CameraCommand::Close { session_id } => Event::CameraClosed { session_id },
    };
    tokio::spawn(async move {
        let _ = tx.send(event).await;
    });
}

/// Owns the preview files; dropping a `PreviewFile` deletes it.
async fn run_preview_worker(
    dir: PathBuf,
    mut rx: mpsc::UnboundedReceiver<PreviewCommand>,
    context: CancellationToken,
) {
    let mut previews: HashMap<Uuid, PreviewFile> = HashMap::new();
    loop {
        let command = tokio::select! {
            biased;
            _ = context.cancelled() => break,
            next = rx.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };

        match command {
            PreviewCommand::Publish(asset) => match PreviewFile::create(&dir, &asset) {
                Ok(file) => {
                    previews.insert(asset.id(), file);
                }
                Err(e) => log::warn!("Failed to write preview for {}: {}", asset.id(), e),
            },
            PreviewCommand::Revoke(asset_id) => {
                previews.remove(&asset_id);
            }
        }
    }
    log::debug!("Revoking {} preview(s) on exit", previews.len());
}

async fn record_device_error(metrics: &Arc<Mutex<MetricsCollector>>, error: &DeviceError) {
    let mut m = metrics.lock().await;
    m.record_error(error.device().to_string(), error.to_string(), None);
}
