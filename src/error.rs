//! Error taxonomy shared by the capture controllers and the submission pipeline.

use serde::Serialize;
use thiserror::Error;

/// Coarse classification every failure in the crate maps onto.
/// This is what the UI sees; the concrete error types carry the detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    PermissionDenied,
    DeviceUnavailable,
    ValidationError,
    Unauthorized,
    NetworkError,
    ServerError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::DeviceUnavailable => "device_unavailable",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::ServerError => "server_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two exclusive device resources a page context can own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceKind {
    Microphone,
    Camera,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Microphone => f.write_str("microphone"),
            DeviceKind::Camera => f.write_str("camera"),
        }
    }
}

/// Failures raised while acquiring or using a capture device.
///
/// These stay local to the owning controller: they end up as its `Error`
/// state and never reach the submission pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("{device} access denied: {message}")]
    PermissionDenied { device: DeviceKind, message: String },

    #[error("{device} unavailable: {message}")]
    Unavailable { device: DeviceKind, message: String },

    #[error("{device} capture could not be encoded: {message}")]
    Encoding { device: DeviceKind, message: String },

    /// The hosting context was torn down while the device was being acquired.
    #[error("{device} capture context closed")]
    Closed { device: DeviceKind },
}

impl DeviceError {
    pub fn denied(device: DeviceKind, message: impl Into<String>) -> Self {
        DeviceError::PermissionDenied {
            device,
            message: message.into(),
        }
    }

    pub fn unavailable(device: DeviceKind, message: impl Into<String>) -> Self {
        DeviceError::Unavailable {
            device,
            message: message.into(),
        }
    }

    pub fn encoding(device: DeviceKind, message: impl Into<String>) -> Self {
        DeviceError::Encoding {
            device,
            message: message.into(),
        }
    }

    pub fn device(&self) -> DeviceKind {
        match self {
            DeviceError::PermissionDenied { device, .. }
            | DeviceError::Unavailable { device, .. }
            | DeviceError::Encoding { device, .. }
            | DeviceError::Closed { device } => *device,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            DeviceError::Unavailable { .. }
            | DeviceError::Encoding { .. }
            | DeviceError::Closed { .. } => ErrorKind::DeviceUnavailable,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, DeviceError::Closed { .. })
    }
}

/// Failures of one submission attempt. `Validation` and `Unauthorized` are
/// raised before any I/O happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Submission aborted: {0}")]
    Aborted(String),

    #[error("Server error ({}): {message}", describe_status(.status))]
    Server { status: Option<u16>, message: String },
}

fn describe_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "invalid response".to_string(),
    }
}

impl SubmissionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubmissionError::Validation(_) => ErrorKind::ValidationError,
            SubmissionError::Unauthorized(_) => ErrorKind::Unauthorized,
            SubmissionError::Network(_) | SubmissionError::Aborted(_) => ErrorKind::NetworkError,
            SubmissionError::Server { .. } => ErrorKind::ServerError,
        }
    }

    /// The diagnostic without the category prefix, suitable for display
    /// next to the error kind.
    pub fn message(&self) -> &str {
        match self {
            SubmissionError::Validation(m)
            | SubmissionError::Unauthorized(m)
            | SubmissionError::Network(m)
            | SubmissionError::Aborted(m) => m,
            SubmissionError::Server { message, .. } => message,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, SubmissionError::Aborted(_))
    }
}
