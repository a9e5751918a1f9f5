//! Media assets: the immutable image/audio artifacts handed to the pipeline.
//!
//! An asset is created once (by a capture controller or by picking a file)
//! and never mutated afterwards. Replacing a selection means building a new
//! asset and dropping the old one.

mod preview;

pub use preview::{
    cleanup_stale_previews, default_preview_dir, preview_path, preview_url, PreviewFile,
    STALE_PREVIEW_AGE,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MediaKind {
    Image,
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Image => f.write_str("image"),
            MediaKind::Audio => f.write_str("audio"),
        }
    }
}

/// How an asset was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Provenance {
    /// Picked from an existing file.
    Uploaded,
    /// Still frame taken from a live camera.
    Captured,
    /// Live microphone recording.
    Recorded,
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path:?} is not a supported {kind} file")]
    UnsupportedType { path: PathBuf, kind: MediaKind },
    #[error("{path:?} is empty")]
    Empty { path: PathBuf },
}

/// Binary content plus the metadata needed to upload it.
#[derive(Clone)]
pub struct MediaAsset {
    id: Uuid,
    kind: MediaKind,
    bytes: Bytes,
    mime_type: String,
    origin_filename: Option<String>,
    provenance: Provenance,
    created_at: DateTime<Utc>,
}

impl MediaAsset {
    pub fn new(
        kind: MediaKind,
        bytes: impl Into<Bytes>,
        mime_type: impl Into<String>,
        origin_filename: Option<String>,
        provenance: Provenance,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            bytes: bytes.into(),
            mime_type: mime_type.into(),
            origin_filename,
            provenance,
            created_at: Utc::now(),
        }
    }

    /// Load a user-picked file. The mime type is derived from the extension
    /// and must match `kind`.
    pub async fn from_path(path: &Path, kind: MediaKind) -> Result<Self, MediaError> {
        let mime_type = mime_for_path(path, kind).ok_or_else(|| MediaError::UnsupportedType {
            path: path.to_path_buf(),
            kind,
        })?;

        let bytes = tokio::fs::read(path).await.map_err(|source| MediaError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if bytes.is_empty() {
            return Err(MediaError::Empty {
                path: path.to_path_buf(),
            });
        }

        let origin_filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_string());

        log::info!(
            "Selected {} file {:?} ({} bytes, {})",
            kind,
            path,
            bytes.len(),
            mime_type
        );

        Ok(Self::new(
            kind,
            bytes,
            mime_type,
            origin_filename,
            Provenance::Uploaded,
        ))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Cheap clone of the underlying buffer.
    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn origin_filename(&self) -> Option<&str> {
        self.origin_filename.as_deref()
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// File extension matching the mime type, used for upload filenames
    /// and preview files.
    pub fn extension(&self) -> &'static str {
        extension_for_mime(&self.mime_type)
    }
}

// Byte contents are summarised; events carrying assets are debug-logged.
impl std::fmt::Debug for MediaAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaAsset")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("len", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .field("origin_filename", &self.origin_filename)
            .field("provenance", &self.provenance)
            .finish()
    }
}

/// Known upload types, by extension.
const IMAGE_TYPES: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("webp", "image/webp"),
    ("gif", "image/gif"),
    ("heic", "image/heic"),
];

const AUDIO_TYPES: &[(&str, &str)] = &[
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("webm", "audio/webm"),
    ("ogg", "audio/ogg"),
    ("m4a", "audio/mp4"),
    ("aac", "audio/aac"),
    ("flac", "audio/flac"),
];

/// Guess the mime type of a file of the given kind from its extension.
pub fn mime_for_path(path: &Path, kind: MediaKind) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let table = match kind {
        MediaKind::Image => IMAGE_TYPES,
        MediaKind::Audio => AUDIO_TYPES,
    };
    table
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, mime)| *mime)
}

pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => "jpg",
        "audio/mpeg" => "mp3",
        "audio/mp4" => "m4a",
        other => IMAGE_TYPES
            .iter()
            .chain(AUDIO_TYPES.iter())
            .find(|(_, mime)| *mime == other)
            .map(|(ext, _)| *ext)
            .unwrap_or("bin"),
    }
}
