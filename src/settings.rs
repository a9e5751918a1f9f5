use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::capture::FacingMode;
use crate::submission::http::DEFAULT_TIMEOUT;
use crate::submission::Platform;

const APP_DIR_NAME: &str = "kalakriti-kit";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Failed to create config directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Write settings {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Which optional parts of the studio are switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Capabilities {
    /// Offer live camera capture next to the file picker.
    pub camera: bool,
    /// Let the user pick the target platform. When off, the default
    /// platform is always used.
    pub platform_selector: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            camera: true,
            platform_selector: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Base URL of the generation service; `/api/generate-kit` is appended.
    pub backend_url: String,

    /// Whole-request timeout for a submission. Generation is slow, so this
    /// is generous.
    pub request_timeout_secs: u64,

    pub default_platform: Platform,

    /// Camera facing mode tried first; the unconstrained fallback follows
    /// automatically.
    pub preferred_facing: FacingMode,

    /// JPEG quality (1-100) for captured frames.
    pub jpeg_quality: u8,

    /// Recordings are stopped automatically after this long.
    pub max_recording_secs: u64,

    pub capabilities: Capabilities,

    /// Write selected assets to temp files so the UI can show them.
    pub previews: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:5000".to_string(),
            request_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            default_platform: Platform::Instagram,
            preferred_facing: FacingMode::Environment,
            jpeg_quality: 90,
            max_recording_secs: 300,
            capabilities: Capabilities::default(),
            previews: true,
        }
    }
}

impl AppSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

pub fn settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SettingsError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    // Write to a sibling temp file and rename so a crash never leaves a
    // truncated settings.json behind.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(|source| SettingsError::Write {
        path: tmp_path.clone(),
        source,
    })?;

    // rename() does not replace an existing file on Windows
    if cfg!(windows) {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(SettingsError::Write {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|source| SettingsError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
