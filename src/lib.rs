pub mod audio;
pub mod auth;
pub mod capture;
pub mod effects;
pub mod error;
pub mod media;
pub mod metrics;
pub mod settings;
pub mod state_machine;
pub mod submission;

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use capture::{Camera, Microphone};
use effects::{EffectRunner, RunnerOptions, StudioEffectRunner};
use error::ErrorKind;
use media::{MediaAsset, MediaError, MediaKind, Provenance};
use metrics::{MetricsCollector, MetricsSummary};
use settings::{AppSettings, Capabilities};
use state_machine::{reduce, DeviceStatus, Effect, Event, StudioConfig, StudioState, SubmissionStatus};
use submission::{GenerationBackend, MarketingKit, Platform, SubmissionPipeline};

/// Capacity of the event queue feeding the state loop
const EVENT_QUEUE_CAPACITY: usize = 64;

/// Per-device status as published to the front end.
/// Uses tagged union format: { "status": "idle" } or { "status": "active", "elapsedSecs": 5 }
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum DeviceUi {
    Idle,
    Requesting,
    Active {
        #[serde(rename = "elapsedSecs")]
        elapsed_secs: u64,
        label: Option<String>,
    },
    Finalizing,
    Releasing,
    Error {
        kind: ErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetUi {
    pub id: Uuid,
    pub kind: MediaKind,
    pub mime_type: String,
    pub provenance: Provenance,
    pub size_bytes: usize,
    pub filename: Option<String>,
    /// `file://` URL of the preview copy, when previews are enabled
    pub preview_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SubmissionUi {
    Idle,
    InFlight {
        #[serde(rename = "elapsedSecs")]
        elapsed_secs: u64,
    },
    Success {
        kit: MarketingKit,
    },
    Failure {
        kind: ErrorKind,
        message: String,
    },
}

/// UI state published to subscribers after every visible change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    pub microphone: DeviceUi,
    pub camera: DeviceUi,
    pub image: Option<AssetUi>,
    pub audio: Option<AssetUi>,
    pub platform: Platform,
    pub capabilities: Capabilities,
    pub can_submit: bool,
    pub submission: SubmissionUi,
}

fn device_to_ui(status: &DeviceStatus) -> DeviceUi {
    match status {
        DeviceStatus::Idle => DeviceUi::Idle,
        DeviceStatus::Requesting { .. } => DeviceUi::Requesting,
        DeviceStatus::Active {
            started_at, label, ..
        } => DeviceUi::Active {
            elapsed_secs: started_at.elapsed().as_secs(),
            label: label.clone(),
        },
        DeviceStatus::Finalizing { .. } => DeviceUi::Finalizing,
        DeviceStatus::Releasing { .. } => DeviceUi::Releasing,
        DeviceStatus::Error { kind, message } => DeviceUi::Error {
            kind: *kind,
            message: message.clone(),
        },
    }
}

fn asset_to_ui(asset: &MediaAsset, preview_dir: Option<&Path>) -> AssetUi {
    AssetUi {
        id: asset.id(),
        kind: asset.kind(),
        mime_type: asset.mime_type().to_string(),
        provenance: asset.provenance(),
        size_bytes: asset.len(),
        filename: asset.origin_filename().map(|n| n.to_string()),
        preview_url: preview_dir.map(|dir| media::preview_url(&media::preview_path(dir, asset))),
    }
}

/// Convert internal state to UiState for subscribers
pub fn state_to_ui(state: &StudioState, preview_dir: Option<&Path>) -> UiState {
    let submission = match &state.submission {
        SubmissionStatus::Idle => SubmissionUi::Idle,
        SubmissionStatus::InFlight { started_at, .. } => SubmissionUi::InFlight {
            elapsed_secs: started_at.elapsed().as_secs(),
        },
        SubmissionStatus::Finished { outcome: Ok(kit) } => SubmissionUi::Success { kit: kit.clone() },
        SubmissionStatus::Finished { outcome: Err(e) } => SubmissionUi::Failure {
            kind: e.kind(),
            message: e.message().to_string(),
        },
    };

    UiState {
        microphone: device_to_ui(&state.microphone),
        camera: device_to_ui(&state.camera),
        image: state.image.as_ref().map(|a| asset_to_ui(a, preview_dir)),
        audio: state.audio.as_ref().map(|a| asset_to_ui(a, preview_dir)),
        platform: state.platform,
        capabilities: state.config.capabilities,
        can_submit: state.can_submit(),
        submission,
    }
}

fn emit_ui_state(ui_tx: &watch::Sender<UiState>, state: &StudioState, preview_dir: Option<&Path>) {
    let ui_state = state_to_ui(state, preview_dir);
    log::debug!("Emitting UI state: {:?}", serde_json::to_string(&ui_state));
    ui_tx.send_replace(ui_state);
}

/// Run the main state loop until teardown or context cancellation.
pub async fn run_studio_loop(
    mut state: StudioState,
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    ui_tx: watch::Sender<UiState>,
    preview_dir: Option<PathBuf>,
    context: CancellationToken,
) {
    emit_ui_state(&ui_tx, &state, preview_dir.as_deref());
    log::info!("State loop started");

    loop {
        let event = tokio::select! {
            biased;
            _ = context.cancelled() => {
                log::info!("Context cancelled, stopping state loop");
                break;
            }
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        log::debug!("Received event: {:?}", event);

        let (next, effects) = reduce(&state, event);

        if std::mem::discriminant(&state.microphone) != std::mem::discriminant(&next.microphone) {
            log::info!("Microphone: {:?} -> {:?}", state.microphone, next.microphone);
        }
        if std::mem::discriminant(&state.camera) != std::mem::discriminant(&next.camera) {
            log::info!("Camera: {:?} -> {:?}", state.camera, next.camera);
        }

        state = next;

        for eff in effects {
            match eff {
                Effect::EmitUi => emit_ui_state(&ui_tx, &state, preview_dir.as_deref()),
                other => effect_runner.spawn(other, tx.clone()),
            }
        }

        if state.closed {
            break;
        }
    }

    log::info!("State loop ended");
}

/// The capture devices available to a studio.
pub struct Devices {
    pub microphone: Arc<dyn Microphone>,
    /// `None` on hosts without a camera; camera capture is then disabled.
    pub camera: Option<Arc<dyn Camera>>,
}

#[derive(Debug, Clone)]
pub struct StudioOptions {
    pub settings: AppSettings,
    /// Where previews are written; `None` disables them.
    pub preview_dir: Option<PathBuf>,
}

impl StudioOptions {
    pub fn from_settings(settings: AppSettings) -> Self {
        let preview_dir = settings.previews.then(media::default_preview_dir);
        Self {
            settings,
            preview_dir,
        }
    }
}

/// Handle to one running orchestration context.
///
/// Dropping the handle cancels the context; `shutdown()` additionally waits
/// until both devices are released.
pub struct Studio {
    tx: mpsc::Sender<Event>,
    ui_rx: watch::Receiver<UiState>,
    runner: Arc<StudioEffectRunner>,
    metrics: Arc<Mutex<MetricsCollector>>,
    context: CancellationToken,
    state_loop: Option<JoinHandle<()>>,
}

impl Studio {
    /// Start the state loop and device workers. Must be called from within a
    /// tokio runtime.
    pub fn launch(
        options: StudioOptions,
        devices: Devices,
        backend: Arc<dyn GenerationBackend>,
    ) -> Self {
        let mut config = StudioConfig::from(&options.settings);
        if devices.camera.is_none() && config.capabilities.camera {
            log::info!("No camera device supplied, camera capture disabled");
            config.capabilities.camera = false;
        }

        if let Some(dir) = &options.preview_dir {
            match media::cleanup_stale_previews(dir, media::STALE_PREVIEW_AGE) {
                Ok(count) if count > 0 => log::info!("Cleaned up {} stale preview(s)", count),
                Ok(_) => {}
                Err(e) => log::warn!("Failed to clean up stale previews: {}", e),
            }
        }

        let context = CancellationToken::new();
        let metrics = Arc::new(Mutex::new(MetricsCollector::new()));
        let pipeline = Arc::new(SubmissionPipeline::new(backend, context.child_token()));

        let runner = StudioEffectRunner::new(
            devices.microphone,
            devices.camera,
            pipeline,
            metrics.clone(),
            context.clone(),
            RunnerOptions {
                jpeg_quality: options.settings.jpeg_quality,
                preview_dir: options.preview_dir.clone(),
            },
        );

        let state = StudioState::new(config);
        let (ui_tx, ui_rx) =
            watch::channel(state_to_ui(&state, options.preview_dir.as_deref()));
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let state_loop = tokio::spawn(run_studio_loop(
            state,
            rx,
            tx.clone(),
            runner.clone(),
            ui_tx,
            options.preview_dir,
            context.clone(),
        ));

        Self {
            tx,
            ui_rx,
            runner,
            metrics,
            context,
            state_loop: Some(state_loop),
        }
    }

    /// Send an event to the state machine
    pub async fn send(&self, event: Event) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(event).await
    }

    pub fn subscribe(&self) -> watch::Receiver<UiState> {
        self.ui_rx.clone()
    }

    pub fn ui(&self) -> UiState {
        self.ui_rx.borrow().clone()
    }

    /// Load a picked image file and hand it to the state machine.
    pub async fn select_image_file(&self, path: &Path) -> Result<(), MediaError> {
        let asset = MediaAsset::from_path(path, MediaKind::Image).await?;
        self.dispatch(Event::ImageFileSelected { asset }).await;
        Ok(())
    }

    /// Load a picked audio file and hand it to the state machine.
    pub async fn select_audio_file(&self, path: &Path) -> Result<(), MediaError> {
        let asset = MediaAsset::from_path(path, MediaKind::Audio).await?;
        self.dispatch(Event::AudioFileSelected { asset }).await;
        Ok(())
    }

    pub async fn metrics_summary(&self) -> MetricsSummary {
        self.metrics.lock().await.get_summary()
    }

    /// Tear the context down: abort the in-flight submission, release both
    /// devices, revoke previews. Returns once every worker has exited.
    pub async fn shutdown(mut self) {
        self.dispatch(Event::Teardown).await;
        if let Some(state_loop) = self.state_loop.take() {
            if let Err(e) = state_loop.await {
                log::error!("State loop task failed: {}", e);
            }
        }
        self.runner.shutdown().await;
    }

    async fn dispatch(&self, event: Event) {
        if let Err(e) = self.tx.send(event).await {
            log::warn!("State loop is gone, dropping {:?}", e.0);
        }
    }
}

impl Drop for Studio {
    fn drop(&mut self) {
        self.context.cancel();
    }
}
