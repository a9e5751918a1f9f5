//! Submission of the image + narration pair to the generation service.

pub mod http;
mod pipeline;
mod types;

pub use http::{BackendReply, GenerationBackend, HttpBackend};
pub use pipeline::{authorize, classify_reply, validate, SubmissionPipeline};
pub use types::{GeneratedImage, MarketingKit, Platform, SubmissionRequest, SubmissionResult};
