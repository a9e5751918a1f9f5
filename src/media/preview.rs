//! Temporary preview files for selected assets
//!
//! A preview is the playable/viewable copy of an asset on disk, stored in:
//! ~/.local/share/kalakriti-kit/temp/preview/<asset_id>.<ext>
//!
//! Dropping a `PreviewFile` deletes it, so a preview lives exactly as long as
//! the selection it belongs to.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use uuid::Uuid;

use super::MediaAsset;

/// Previews older than this are leftovers; younger ones may belong to a
/// studio that is still running against the same directory.
pub const STALE_PREVIEW_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Get the default preview directory path.
/// Returns: ~/.local/share/kalakriti-kit/temp/preview/
pub fn default_preview_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kalakriti-kit")
        .join("temp")
        .join("preview")
}

/// Deterministic preview location for an asset.
pub fn preview_path(dir: &Path, asset: &MediaAsset) -> PathBuf {
    dir.join(format!("{}.{}", asset.id(), asset.extension()))
}

pub fn preview_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// An on-disk copy of an asset, removed when dropped.
#[derive(Debug)]
pub struct PreviewFile {
    path: PathBuf,
}

impl PreviewFile {
    /// Write the asset into `dir`, creating the directory if needed.
    pub fn create(dir: &Path, asset: &MediaAsset) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = preview_path(dir, asset);
        fs::write(&path, asset.bytes())?;
        log::debug!("Preview published: {:?}", path);
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn url(&self) -> String {
        preview_url(&self.path)
    }
}

impl Drop for PreviewFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => log::debug!("Preview revoked: {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove preview {:?}: {}", self.path, e),
        }
    }
}

/// Remove previews left behind by a session that did not shut down cleanly.
///
/// Only files named like a preview (`<asset uuid>.<ext>`) and last modified
/// more than `max_age` ago are deleted.
pub fn cleanup_stale_previews(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut deleted = 0;
    for entry in fs::read_dir(dir)?.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_file() || !is_preview_name(&path) {
            continue;
        }

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => continue,
        };
        if modified >= cutoff {
            continue;
        }

        if fs::remove_file(&path).is_ok() {
            log::debug!("Cleaned up stale preview: {:?}", path);
            deleted += 1;
        }
    }

    Ok(deleted)
}

fn is_preview_name(path: &Path) -> bool {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| Uuid::parse_str(stem).is_ok())
}
