//! HTTP transport for the generate-kit endpoint
//!
//! Sends the image, the narration and the platform id as one multipart
//! request. Status classification happens in the pipeline; this layer only
//! reports transport failures.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;

use super::types::SubmissionRequest;
use crate::auth::Authorization;
use crate::error::SubmissionError;
use crate::media::MediaAsset;

pub const GENERATE_KIT_PATH: &str = "/api/generate-kit";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Raw status and body as received from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendReply {
    pub status: u16,
    pub body: String,
}

/// The remote generation service, as seen by the pipeline.
#[async_trait]
pub trait GenerationBackend: Send + Sync + 'static {
    async fn generate(
        &self,
        request: &SubmissionRequest,
        auth: &Authorization,
    ) -> Result<BackendReply, SubmissionError>;
}

pub struct HttpBackend {
    client: Client,
    endpoint: String,
}

impl HttpBackend {
    /// Build a backend for `base_url` (e.g. `http://127.0.0.1:5000`).
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SubmissionError> {
        // Reused across requests to avoid repeated TLS handshakes
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SubmissionError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), GENERATE_KIT_PATH),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl GenerationBackend for HttpBackend {
    async fn generate(
        &self,
        request: &SubmissionRequest,
        auth: &Authorization,
    ) -> Result<BackendReply, SubmissionError> {
        let image = request.image();
        let audio = request.audio();

        log::info!(
            "Submitting to {}: image {} bytes ({}), audio {} bytes ({}), platform {}",
            self.endpoint,
            image.len(),
            image.mime_type(),
            audio.len(),
            audio.mime_type(),
            request.platform()
        );

        let form = Form::new()
            .part("image", file_part(image, image_filename(image))?)
            .part("audio", file_part(audio, audio_filename(audio))?)
            .text("platform", request.platform().as_str());

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", auth.header_value())
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport_error)?;

        log::debug!("Backend replied {} ({} bytes)", status, body.len());

        Ok(BackendReply { status, body })
    }
}

fn file_part(asset: &MediaAsset, filename: String) -> Result<Part, SubmissionError> {
    Part::bytes(asset.bytes().to_vec())
        .file_name(filename)
        .mime_str(asset.mime_type())
        .map_err(|e| SubmissionError::Validation(format!("Invalid mime type: {}", e)))
}

/// Picked files keep their own name; captured frames get a generic one.
pub fn image_filename(asset: &MediaAsset) -> String {
    asset
        .origin_filename()
        .map(|n| n.to_string())
        .unwrap_or_else(|| format!("image.{}", asset.extension()))
}

/// The backend expects the narration as `story.<ext>`.
pub fn audio_filename(asset: &MediaAsset) -> String {
    format!("story.{}", asset.extension())
}

fn transport_error(e: reqwest::Error) -> SubmissionError {
    if e.is_timeout() {
        SubmissionError::Network("Request timed out".to_string())
    } else if e.is_connect() {
        SubmissionError::Network(format!("Could not reach the server: {}", e))
    } else {
        SubmissionError::Network(e.to_string())
    }
}
