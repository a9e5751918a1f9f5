//! Request and result types for the generate-kit endpoint.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::SubmissionError;
use crate::media::MediaAsset;

/// Target social platform for the generated post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[default]
    Instagram,
    Facebook,
    TwitterX,
    Linkedin,
}

impl Platform {
    pub fn all() -> [Platform; 4] {
        [
            Platform::Instagram,
            Platform::Facebook,
            Platform::TwitterX,
            Platform::Linkedin,
        ]
    }

    /// Wire id sent in the `platform` form field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
            Platform::Facebook => "facebook",
            Platform::TwitterX => "twitter_x",
            Platform::Linkedin => "linkedin",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = SubmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::all()
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| SubmissionError::Validation(format!("Unknown platform: {}", s)))
    }
}

/// A validated request: one image, one audio narration, one platform.
/// Only [`super::validate`] builds these.
#[derive(Debug, Clone)]
pub struct SubmissionRequest {
    pub(crate) image: MediaAsset,
    pub(crate) audio: MediaAsset,
    pub(crate) platform: Platform,
}

impl SubmissionRequest {
    pub fn image(&self) -> &MediaAsset {
        &self.image
    }

    pub fn audio(&self) -> &MediaAsset {
        &self.audio
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }
}

/// Image returned alongside the copy, already base64-decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub mime_type: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

/// The marketing copy produced for one submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketingKit {
    pub title: String,
    pub description: String,
    pub highlights: String,
    pub post: String,
    pub hashtags: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_image: Option<GeneratedImage>,
}

/// Terminal outcome of one submission: the kit, or a classified failure.
pub type SubmissionResult = Result<MarketingKit, SubmissionError>;

/// Success body of `POST /api/generate-kit`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KitResponse {
    product_title: String,
    product_description: String,
    product_highlights: String,
    post: String,
    hashtags: String,
    #[serde(default)]
    generated_image: Option<GeneratedImagePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeneratedImagePayload {
    mime_type: String,
    data: String,
}

/// Failure body: `{"error": "..."}`.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorResponse {
    pub(crate) error: String,
}

impl KitResponse {
    pub(crate) fn into_kit(self) -> Result<MarketingKit, SubmissionError> {
        let generated_image = match self.generated_image {
            Some(payload) => {
                let bytes = STANDARD.decode(payload.data.trim()).map_err(|e| {
                    SubmissionError::Server {
                        status: None,
                        message: format!("Generated image is not valid base64: {}", e),
                    }
                })?;
                Some(GeneratedImage {
                    mime_type: payload.mime_type,
                    bytes,
                })
            }
            None => None,
        };

        Ok(MarketingKit {
            title: self.product_title,
            description: self.product_description,
            highlights: self.product_highlights,
            post: self.post,
            hashtags: self.hashtags,
            generated_image,
        })
    }
}
