//! State machine for the capture studio
//!
//! This module implements the page-level orchestration using a single-writer
//! pattern. All state transitions go through the `reduce()` function, which
//! returns a new state and a list of effects to execute.
//!
//! Each device carries its own session id and each submission its own
//! submission id. Completion events that do not match the current id are
//! stale and dropped silently.

use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::auth::Authorization;
use crate::capture::FacingMode;
use crate::error::{ErrorKind, SubmissionError};
use crate::media::MediaAsset;
use crate::settings::{AppSettings, Capabilities};
use crate::submission::{self, Platform, SubmissionRequest, SubmissionResult};

/// The parts of the settings the reducer needs.
#[derive(Debug, Clone)]
pub struct StudioConfig {
    pub capabilities: Capabilities,
    pub preferred_facing: FacingMode,
    pub default_platform: Platform,
    pub max_recording: Duration,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self::from(&AppSettings::default())
    }
}

impl From<&AppSettings> for StudioConfig {
    fn from(settings: &AppSettings) -> Self {
        Self {
            capabilities: settings.capabilities,
            preferred_facing: settings.preferred_facing,
            default_platform: settings.default_platform,
            max_recording: Duration::from_secs(settings.max_recording_secs),
        }
    }
}

/// Lifecycle of one device's capture session.
#[derive(Debug, Clone)]
pub enum DeviceStatus {
    Idle,
    /// Waiting on the permission prompt.
    Requesting { session_id: Uuid },
    /// Recording (microphone) or streaming (camera).
    Active {
        session_id: Uuid,
        started_at: Instant,
        label: Option<String>,
    },
    /// Stop or capture requested; waiting for the asset.
    Finalizing { session_id: Uuid },
    /// Camera closing so a picked file can take its place.
    Releasing { session_id: Uuid },
    Error { kind: ErrorKind, message: String },
}

impl DeviceStatus {
    /// Session that currently owns (or is about to own) the device.
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            DeviceStatus::Requesting { session_id }
            | DeviceStatus::Active { session_id, .. }
            | DeviceStatus::Finalizing { session_id }
            | DeviceStatus::Releasing { session_id } => Some(*session_id),
            DeviceStatus::Idle | DeviceStatus::Error { .. } => None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.session_id().is_some()
    }

    fn failed(kind: ErrorKind, message: String) -> Self {
        DeviceStatus::Error { kind, message }
    }
}

#[derive(Debug, Clone)]
pub enum SubmissionStatus {
    Idle,
    InFlight {
        submission_id: Uuid,
        started_at: Instant,
    },
    Finished {
        outcome: SubmissionResult,
    },
}

impl SubmissionStatus {
    fn in_flight_id(&self) -> Option<Uuid> {
        match self {
            SubmissionStatus::InFlight { submission_id, .. } => Some(*submission_id),
            _ => None,
        }
    }
}

/// Internal state of the studio.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone)]
pub struct StudioState {
    pub config: StudioConfig,
    pub microphone: DeviceStatus,
    pub camera: DeviceStatus,
    pub image: Option<MediaAsset>,
    pub audio: Option<MediaAsset>,
    /// Picked image waiting for the camera to release.
    pub pending_image: Option<MediaAsset>,
    pub platform: Platform,
    pub submission: SubmissionStatus,
    /// Set once the context is torn down; every later event is ignored.
    pub closed: bool,
}

impl StudioState {
    pub fn new(config: StudioConfig) -> Self {
        let platform = config.default_platform;
        Self {
            config,
            microphone: DeviceStatus::Idle,
            camera: DeviceStatus::Idle,
            image: None,
            audio: None,
            pending_image: None,
            platform,
            submission: SubmissionStatus::Idle,
            closed: false,
        }
    }

    pub fn can_submit(&self) -> bool {
        self.image.is_some()
            && self.audio.is_some()
            && !matches!(self.submission, SubmissionStatus::InFlight { .. })
    }
}

impl Default for StudioState {
    fn default() -> Self {
        Self::new(StudioConfig::default())
    }
}

/// Events that can trigger state transitions.
/// User intents come from the front end; completions from the effect runner.
#[derive(Debug, Clone)]
pub enum Event {
    // User intents
    StartRecording,
    StopRecording,
    DiscardRecording,
    OpenCamera,
    CaptureFrame,
    CloseCamera,
    ImageFileSelected { asset: MediaAsset },
    AudioFileSelected { asset: MediaAsset },
    RemoveImage,
    RemoveAudio,
    PlatformSelected { platform: Platform },
    Submit { auth: Option<Authorization> },
    CancelSubmission,
    StartOver,
    /// The hosting context is going away.
    Teardown,

    // Microphone completions
    MicrophoneStarted {
        session_id: Uuid,
    },
    MicrophoneFailed {
        session_id: Uuid,
        kind: ErrorKind,
        message: String,
    },
    RecordingFinished {
        session_id: Uuid,
        asset: MediaAsset,
    },
    RecordingFailed {
        session_id: Uuid,
        kind: ErrorKind,
        message: String,
    },
    /// Once a second while recording (includes id to drop stale ticks)
    RecordingTick {
        session_id: Uuid,
    },

    // Camera completions
    CameraStarted {
        session_id: Uuid,
        facing: FacingMode,
        label: String,
    },
    CameraFailed {
        session_id: Uuid,
        kind: ErrorKind,
        message: String,
    },
    FrameCaptured {
        session_id: Uuid,
        asset: MediaAsset,
    },
    CameraClosed {
        session_id: Uuid,
    },

    SubmissionFinished {
        submission_id: Uuid,
        result: SubmissionResult,
    },
}

/// Effects to be executed after a state transition.
/// The effect runner handles these asynchronously.
#[derive(Debug, Clone)]
pub enum Effect {
    StartMicrophone {
        session_id: Uuid,
    },
    StopMicrophone {
        session_id: Uuid,
    },
    /// Drop whatever the microphone holds without producing an asset.
    ResetMicrophone,
    StartCamera {
        session_id: Uuid,
        facing: FacingMode,
    },
    CaptureFrame {
        session_id: Uuid,
    },
    /// Release the camera; answered with `CameraClosed`.
    CloseCamera {
        session_id: Uuid,
    },
    StartRecordingTick {
        session_id: Uuid,
    },
    Submit {
        submission_id: Uuid,
        request: SubmissionRequest,
        auth: Authorization,
    },
    AbortSubmission {
        submission_id: Uuid,
    },
    PublishPreview {
        asset: MediaAsset,
    },
    RevokePreview {
        asset_id: Uuid,
    },
    /// Signal to publish UI state to subscribers
    EmitUi,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate the input state
/// - Ignore completions with stale session or submission ids
/// - Emit EmitUi after every visible change
pub fn reduce(state: &StudioState, event: Event) -> (StudioState, Vec<Effect>) {
    if state.closed {
        return (state.clone(), vec![]);
    }

    let mut next = state.clone();
    let mut effects = Vec::new();

    match event {
        // -----------------
        // Microphone
        // -----------------
        Event::StartRecording => {
            if let DeviceStatus::Finalizing { session_id } = &state.microphone {
                log::debug!("Recording {} is still finalizing, ignoring start", session_id);
                return (state.clone(), vec![]);
            }
            // The worker tears down any live session before starting again
            let session_id = Uuid::new_v4();
            next.microphone = DeviceStatus::Requesting { session_id };
            effects.push(Effect::StartMicrophone { session_id });
        }
        Event::MicrophoneStarted { session_id } => {
            if !matches!(state.microphone, DeviceStatus::Requesting { session_id: s } if s == session_id)
            {
                return stale(state);
            }
            next.microphone = DeviceStatus::Active {
                session_id,
                started_at: Instant::now(),
                label: None,
            };
            effects.push(Effect::StartRecordingTick { session_id });
        }
        Event::MicrophoneFailed {
            session_id,
            kind,
            message,
        } => {
            if !matches!(state.microphone, DeviceStatus::Requesting { session_id: s } if s == session_id)
            {
                return stale(state);
            }
            next.microphone = DeviceStatus::failed(kind, message);
        }
        Event::StopRecording => match &state.microphone {
            DeviceStatus::Active { session_id, .. } => {
                next.microphone = DeviceStatus::Finalizing {
                    session_id: *session_id,
                };
                effects.push(Effect::StopMicrophone {
                    session_id: *session_id,
                });
            }
            // Not recording: no-op
            _ => return (state.clone(), vec![]),
        },
        Event::RecordingTick { session_id } => match &state.microphone {
            DeviceStatus::Active {
                session_id: current,
                started_at,
                ..
            } if *current == session_id => {
                let elapsed = started_at.elapsed();
                if elapsed >= state.config.max_recording {
                    log::warn!(
                        "Recording {} auto-stopped after {:?} (max duration reached)",
                        session_id,
                        elapsed
                    );
                    next.microphone = DeviceStatus::Finalizing { session_id };
                    effects.push(Effect::StopMicrophone { session_id });
                }
            }
            _ => return stale(state),
        },
        Event::RecordingFinished { session_id, asset } => {
            if !matches!(state.microphone, DeviceStatus::Finalizing { session_id: s } if s == session_id)
            {
                return stale(state);
            }
            next.microphone = DeviceStatus::Idle;
            replace_asset(&mut next.audio, Some(asset), &mut effects);
        }
        Event::RecordingFailed {
            session_id,
            kind,
            message,
        } => {
            if state.microphone.session_id() != Some(session_id) {
                return stale(state);
            }
            next.microphone = DeviceStatus::failed(kind, message);
        }
        Event::DiscardRecording => {
            next.microphone = DeviceStatus::Idle;
            effects.push(Effect::ResetMicrophone);
            replace_asset(&mut next.audio, None, &mut effects);
        }
        Event::AudioFileSelected { asset } => {
            if state.microphone.is_busy() {
                log::info!("Audio file picked while recording, discarding recording");
                next.microphone = DeviceStatus::Idle;
                effects.push(Effect::ResetMicrophone);
            }
            replace_asset(&mut next.audio, Some(asset), &mut effects);
        }
        Event::RemoveAudio => {
            if state.audio.is_none() {
                return (state.clone(), vec![]);
            }
            replace_asset(&mut next.audio, None, &mut effects);
        }

        // -----------------
        // Camera
        // -----------------
        Event::OpenCamera => {
            if !state.config.capabilities.camera {
                log::debug!("Camera capability disabled, ignoring OpenCamera");
                return (state.clone(), vec![]);
            }
            if matches!(state.camera, DeviceStatus::Releasing { .. }) {
                return (state.clone(), vec![]);
            }
            let session_id = Uuid::new_v4();
            next.camera = DeviceStatus::Requesting { session_id };
            effects.push(Effect::StartCamera {
                session_id,
                facing: state.config.preferred_facing,
            });
        }
        Event::CameraStarted {
            session_id,
            facing,
            label,
        } => {
            if !matches!(state.camera, DeviceStatus::Requesting { session_id: s } if s == session_id)
            {
                return stale(state);
            }
            log::info!("Camera {} streaming ({})", session_id, facing.as_str());
            next.camera = DeviceStatus::Active {
                session_id,
                started_at: Instant::now(),
                label: Some(label),
            };
        }
        Event::CameraFailed {
            session_id,
            kind,
            message,
        } => match &state.camera {
            DeviceStatus::Requesting { session_id: s } | DeviceStatus::Finalizing { session_id: s }
                if *s == session_id =>
            {
                next.camera = DeviceStatus::failed(kind, message);
            }
            _ => return stale(state),
        },
        Event::CaptureFrame => match &state.camera {
            DeviceStatus::Active { session_id, .. } => {
                next.camera = DeviceStatus::Finalizing {
                    session_id: *session_id,
                };
                effects.push(Effect::CaptureFrame {
                    session_id: *session_id,
                });
            }
            _ => return (state.clone(), vec![]),
        },
        Event::FrameCaptured { session_id, asset } => {
            if !matches!(state.camera, DeviceStatus::Finalizing { session_id: s } if s == session_id)
            {
                return stale(state);
            }
            next.camera = DeviceStatus::Idle;
            replace_asset(&mut next.image, Some(asset), &mut effects);
        }
        Event::CloseCamera => match &state.camera {
            DeviceStatus::Releasing { .. } => return (state.clone(), vec![]),
            status => {
                if let Some(session_id) = status.session_id() {
                    effects.push(Effect::CloseCamera { session_id });
                }
                next.camera = DeviceStatus::Idle;
            }
        },
        Event::ImageFileSelected { asset } => match &state.camera {
            DeviceStatus::Releasing { .. } => {
                // Latest pick wins; the camera is already closing
                next.pending_image = Some(asset);
                return (next, vec![]);
            }
            status => match status.session_id() {
                Some(session_id) => {
                    log::info!(
                        "Image picked while camera {} is live, closing camera first",
                        session_id
                    );
                    next.camera = DeviceStatus::Releasing { session_id };
                    next.pending_image = Some(asset);
                    effects.push(Effect::CloseCamera { session_id });
                }
                None => replace_asset(&mut next.image, Some(asset), &mut effects),
            },
        },
        Event::CameraClosed { session_id } => {
            if !matches!(state.camera, DeviceStatus::Releasing { session_id: s } if s == session_id)
            {
                return stale(state);
            }
            next.camera = DeviceStatus::Idle;
            let pending = next.pending_image.take();
            replace_asset(&mut next.image, pending, &mut effects);
        }
        Event::RemoveImage => {
            if state.image.is_none() {
                return (state.clone(), vec![]);
            }
            replace_asset(&mut next.image, None, &mut effects);
        }

        // -----------------
        // Platform + submission
        // -----------------
        Event::PlatformSelected { platform } => {
            if !state.config.capabilities.platform_selector {
                log::debug!("Platform selector disabled, keeping {}", state.platform);
                return (state.clone(), vec![]);
            }
            next.platform = platform;
        }
        Event::Submit { auth } => {
            let checked = submission::validate(
                state.image.as_ref(),
                state.audio.as_ref(),
                Some(state.platform),
            )
            .and_then(|request| {
                submission::authorize(auth.as_ref()).map(|auth| (request, auth.clone()))
            });

            match checked {
                Ok((request, auth)) => {
                    if let Some(prior) = state.submission.in_flight_id() {
                        log::info!("Superseding in-flight submission {}", prior);
                        effects.push(Effect::AbortSubmission {
                            submission_id: prior,
                        });
                    }
                    let submission_id = Uuid::new_v4();
                    next.submission = SubmissionStatus::InFlight {
                        submission_id,
                        started_at: Instant::now(),
                    };
                    effects.push(Effect::Submit {
                        submission_id,
                        request,
                        auth,
                    });
                }
                Err(e) => {
                    log::warn!("Submission rejected before sending: {}", e);
                    if let Some(prior) = state.submission.in_flight_id() {
                        effects.push(Effect::AbortSubmission {
                            submission_id: prior,
                        });
                    }
                    next.submission = SubmissionStatus::Finished { outcome: Err(e) };
                }
            }
        }
        Event::CancelSubmission => match state.submission.in_flight_id() {
            Some(submission_id) => {
                next.submission = SubmissionStatus::Idle;
                effects.push(Effect::AbortSubmission { submission_id });
            }
            None => return (state.clone(), vec![]),
        },
        Event::SubmissionFinished {
            submission_id,
            result,
        } => {
            if state.submission.in_flight_id() != Some(submission_id) {
                return stale(state);
            }
            next.submission = match result {
                Err(SubmissionError::Aborted(_)) => SubmissionStatus::Idle,
                outcome => SubmissionStatus::Finished { outcome },
            };
        }

        // -----------------
        // Whole-page resets
        // -----------------
        Event::StartOver => {
            release_everything(state, &mut next, &mut effects);
            next.platform = state.config.default_platform;
        }
        Event::Teardown => {
            log::info!("Studio teardown");
            release_everything(state, &mut next, &mut effects);
            next.closed = true;
        }
    }

    effects.push(Effect::EmitUi);
    (next, effects)
}

fn stale(state: &StudioState) -> (StudioState, Vec<Effect>) {
    (state.clone(), vec![])
}

/// Swap the held asset, revoking the old preview and publishing the new one.
fn replace_asset(slot: &mut Option<MediaAsset>, asset: Option<MediaAsset>, effects: &mut Vec<Effect>) {
    if let Some(old) = slot.take() {
        effects.push(Effect::RevokePreview { asset_id: old.id() });
    }
    if let Some(asset) = asset {
        effects.push(Effect::PublishPreview {
            asset: asset.clone(),
        });
        *slot = Some(asset);
    }
}

fn release_everything(state: &StudioState, next: &mut StudioState, effects: &mut Vec<Effect>) {
    if let Some(submission_id) = state.submission.in_flight_id() {
        effects.push(Effect::AbortSubmission { submission_id });
    }
    if state.microphone.is_busy() {
        effects.push(Effect::ResetMicrophone);
    }
    if let Some(session_id) = state.camera.session_id() {
        effects.push(Effect::CloseCamera { session_id });
    }

    next.microphone = DeviceStatus::Idle;
    next.camera = DeviceStatus::Idle;
    next.pending_image = None;
    next.submission = SubmissionStatus::Idle;
    replace_asset(&mut next.image, None, effects);
    replace_asset(&mut next.audio, None, effects);
}
