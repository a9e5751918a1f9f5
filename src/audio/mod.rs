//! Audio capture module
//!
//! Native microphone access (CPAL) and WAV container wrapping (hound).

pub mod recorder;
mod wav;

pub use recorder::CpalMicrophone;
pub use wav::{encode_wav, WAV_MIME_TYPE};
