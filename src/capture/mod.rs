//! Capture devices and the controllers that own them.
//!
//! Device access is modelled as scoped acquisition: a backend's `acquire()`
//! hands out a track, the controller wraps it in a [`DeviceLease`], and the
//! lease releases the track on every exit path (explicit stop, error,
//! cancellation, or simply being dropped).

pub mod camera;
pub mod microphone;

pub use camera::{CameraController, CameraState};
pub use microphone::{MicrophoneController, MicrophoneState};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{DeviceError, DeviceKind};

/// Preferred camera orientation for a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FacingMode {
    /// Rear camera.
    #[default]
    Environment,
    /// Front camera.
    User,
    /// Whatever the platform hands out.
    Unconstrained,
}

impl FacingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FacingMode::Environment => "environment",
            FacingMode::User => "user",
            FacingMode::Unconstrained => "unconstrained",
        }
    }
}

/// PCM layout of the chunks an audio track delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Interleaved 16-bit samples, in delivery order.
pub type AudioChunk = Vec<i16>;

/// A raw RGB8 frame sampled from a video track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl Frame {
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.rgb.len() == self.width as usize * self.height as usize * 3
    }
}

/// Something that holds a device resource until `stop()` is called.
pub trait DeviceTrack: Send {
    /// Release the underlying device. Must be idempotent.
    fn stop(&mut self);
}

impl<T: DeviceTrack + ?Sized> DeviceTrack for Box<T> {
    fn stop(&mut self) {
        (**self).stop()
    }
}

pub trait AudioTrack: DeviceTrack {
    fn format(&self) -> AudioFormat;

    /// Hand over the chunk stream. Returns `None` after the first call.
    fn take_chunks(&mut self) -> Option<mpsc::UnboundedReceiver<AudioChunk>>;
}

pub trait VideoTrack: DeviceTrack {
    fn facing(&self) -> FacingMode;

    /// Human-readable device name for the UI.
    fn label(&self) -> String;

    fn grab_frame(&mut self) -> Result<Frame, DeviceError>;
}

/// Microphone backend. `acquire` suspends on the permission prompt.
#[async_trait]
pub trait Microphone: Send + Sync + 'static {
    async fn acquire(&self) -> Result<Box<dyn AudioTrack>, DeviceError>;
}

/// Camera backend. `acquire` suspends on the permission prompt.
#[async_trait]
pub trait Camera: Send + Sync + 'static {
    async fn acquire(&self, facing: FacingMode) -> Result<Box<dyn VideoTrack>, DeviceError>;
}

/// Exclusive ownership of one device resource.
///
/// The track is stopped exactly once: by [`DeviceLease::release`] or, failing
/// that, when the lease is dropped.
pub struct DeviceLease<T: DeviceTrack> {
    device: DeviceKind,
    track: Option<T>,
}

impl<T: DeviceTrack> DeviceLease<T> {
    pub fn new(device: DeviceKind, track: T) -> Self {
        log::debug!("{} acquired", device);
        Self {
            device,
            track: Some(track),
        }
    }

    pub fn track(&self) -> Option<&T> {
        self.track.as_ref()
    }

    pub fn track_mut(&mut self) -> Option<&mut T> {
        self.track.as_mut()
    }

    pub fn release(mut self) {
        self.stop_track();
    }

    fn stop_track(&mut self) {
        if let Some(mut track) = self.track.take() {
            track.stop();
            log::debug!("{} released", self.device);
        }
    }
}

impl<T: DeviceTrack> Drop for DeviceLease<T> {
    fn drop(&mut self) {
        self.stop_track();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTrack {
        stops: Arc<AtomicUsize>,
    }

    impl DeviceTrack for CountingTrack {
        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn lease_releases_once_on_explicit_release() {
        let stops = Arc::new(AtomicUsize::new(0));
        let lease = DeviceLease::new(
            DeviceKind::Camera,
            CountingTrack {
                stops: stops.clone(),
            },
        );
        lease.release();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lease_releases_on_drop() {
        let stops = Arc::new(AtomicUsize::new(0));
        {
            let _lease = DeviceLease::new(
                DeviceKind::Microphone,
                Box::new(CountingTrack {
                    stops: stops.clone(),
                }) as Box<dyn DeviceTrack>,
            );
        }
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn frame_shape_is_checked() {
        let good = Frame {
            width: 2,
            height: 1,
            rgb: vec![0; 6],
        };
        assert!(good.is_well_formed());
        let bad = Frame {
            width: 2,
            height: 2,
            rgb: vec![0; 6],
        };
        assert!(!bad.is_well_formed());
    }
}
