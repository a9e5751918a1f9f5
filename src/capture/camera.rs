//! Camera capture controller
//!
//! ```text
//! Idle → RequestingPermission → Streaming → (capture) → Idle + image asset
//!               ↓                    ↓
//!             Error     ←──── frame/encode failure
//! ```
//!
//! The preferred facing mode is tried first; if that fails the controller
//! retries exactly once without a facing constraint before reporting an
//! error. `close()` is valid from any state and always releases the device.

use std::io::Cursor;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{Camera, DeviceLease, FacingMode, Frame, VideoTrack};
use crate::error::{DeviceError, DeviceKind, ErrorKind};
use crate::media::{MediaAsset, MediaKind, Provenance};

pub const JPEG_MIME_TYPE: &str = "image/jpeg";
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraState {
    Idle,
    RequestingPermission,
    Streaming { facing: FacingMode, label: String },
    Error { kind: ErrorKind, message: String },
}

impl CameraState {
    pub fn is_streaming(&self) -> bool {
        matches!(self, CameraState::Streaming { .. })
    }
}

pub struct CameraController {
    device: Arc<dyn Camera>,
    context: CancellationToken,
    lease: Option<DeviceLease<Box<dyn VideoTrack>>>,
    state_tx: watch::Sender<CameraState>,
    jpeg_quality: u8,
}

impl CameraController {
    pub fn new(device: Arc<dyn Camera>, context: CancellationToken) -> Self {
        let (state_tx, _) = watch::channel(CameraState::Idle);
        Self {
            device,
            context,
            lease: None,
            state_tx,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn state(&self) -> CameraState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CameraState> {
        self.state_tx.subscribe()
    }

    pub fn is_holding_device(&self) -> bool {
        self.lease.is_some()
    }

    /// Open the camera, falling back to an unconstrained request once if the
    /// preferred facing mode cannot be satisfied.
    pub async fn start(&mut self, preferred: FacingMode) -> Result<(), DeviceError> {
        if self.lease.is_some() {
            log::info!("Camera restart requested, closing current stream");
            self.close();
        }

        self.set_state(CameraState::RequestingPermission);

        let mut result = acquire(&self.device, &self.context, preferred).await;
        if let Err(e) = &result {
            if !e.is_closed() && preferred != FacingMode::Unconstrained {
                log::warn!(
                    "Camera ({}) unavailable: {}. Retrying without facing constraint",
                    preferred.as_str(),
                    e
                );
                result = acquire(&self.device, &self.context, FacingMode::Unconstrained)
                    .await
                    .map_err(fallback_failure);
            }
        }

        match result {
            Ok(track) => {
                let facing = track.facing();
                let label = track.label();
                self.lease = Some(DeviceLease::new(DeviceKind::Camera, track));
                log::info!("Camera streaming: {} ({})", label, facing.as_str());
                self.set_state(CameraState::Streaming { facing, label });
                Ok(())
            }
            Err(e) if e.is_closed() => {
                self.set_state(CameraState::Idle);
                Err(e)
            }
            Err(e) => {
                log::warn!("Camera start failed: {}", e);
                self.set_state(CameraState::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Sample the live stream without ending it.
    pub fn preview_frame(&mut self) -> Result<Option<Frame>, DeviceError> {
        match self.lease.as_mut().and_then(|l| l.track_mut()) {
            Some(track) => track.grab_frame().map(Some),
            None => Ok(None),
        }
    }

    /// Take a still, encode it as JPEG and close the camera.
    ///
    /// Returns `Ok(None)` when the camera is not streaming.
    pub fn capture(&mut self) -> Result<Option<MediaAsset>, DeviceError> {
        let Some(track) = self.lease.as_mut().and_then(|l| l.track_mut()) else {
            log::debug!("Camera capture ignored: not streaming");
            return Ok(None);
        };

        let encoded = track
            .grab_frame()
            .and_then(|frame| encode_jpeg(&frame, self.jpeg_quality));

        match encoded {
            Ok(bytes) => {
                let asset = MediaAsset::new(
                    MediaKind::Image,
                    bytes,
                    JPEG_MIME_TYPE,
                    None,
                    Provenance::Captured,
                );
                log::info!("Frame captured: {} bytes of JPEG", asset.len());
                self.close();
                Ok(Some(asset))
            }
            Err(e) => {
                log::error!("Frame capture failed: {}", e);
                self.release();
                self.set_state(CameraState::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Release the camera and return to `Idle`.
    pub fn close(&mut self) {
        self.release();
        self.set_state(CameraState::Idle);
    }

    fn release(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release();
            log::info!("Camera closed");
        }
    }

    fn set_state(&self, state: CameraState) {
        self.state_tx.send_replace(state);
    }
}

impl Drop for CameraController {
    fn drop(&mut self) {
        self.release();
    }
}

// Borrows only the fields it needs; the controller itself is not `Sync`.
async fn acquire(
    device: &Arc<dyn Camera>,
    context: &CancellationToken,
    facing: FacingMode,
) -> Result<Box<dyn VideoTrack>, DeviceError> {
    tokio::select! {
        biased;
        _ = context.cancelled() => Err(DeviceError::Closed { device: DeviceKind::Camera }),
        result = device.acquire(facing) => result,
    }
}

/// A failed unconstrained retry means no usable camera, whatever the cause.
fn fallback_failure(err: DeviceError) -> DeviceError {
    match err {
        DeviceError::Closed { .. } | DeviceError::Unavailable { .. } => err,
        DeviceError::PermissionDenied { message, .. } | DeviceError::Encoding { message, .. } => {
            DeviceError::unavailable(DeviceKind::Camera, message)
        }
    }
}

/// Encode an RGB8 frame as baseline JPEG.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, DeviceError> {
    if !frame.is_well_formed() {
        return Err(DeviceError::encoding(
            DeviceKind::Camera,
            format!(
                "frame {}x{} carries {} bytes",
                frame.width,
                frame.height,
                frame.rgb.len()
            ),
        ));
    }

    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(&frame.rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
        .map_err(|e| DeviceError::encoding(DeviceKind::Camera, e.to_string()))?;
    Ok(out.into_inner())
}
