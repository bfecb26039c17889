use crate::clip::ClipSpec;
use crate::error::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod elevenlabs;
pub mod http_backend;

pub use elevenlabs::ElevenLabsSynthesizer;
pub use http_backend::HttpClipBackend;

/// One submission of a clip to a generation backend.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub spec: ClipSpec,
    /// Duration the output must match; exact narration length for narrated clips.
    pub target_duration_s: Option<f64>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Where the backend should leave the media file.
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    pub local_path: PathBuf,
    pub duration_s: f64,
    pub has_audio: bool,
}

/// Image/video/lip-sync service. Slow (tens of seconds) and billed per call,
/// so only the orchestrator's bounded pool calls it.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn submit(&self, job: &GenerationJob) -> Result<GeneratedArtifact, BackendError>;
}

/// Text-to-speech used for narrated clips.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Write synthesized speech for `text` to `out_path`.
    async fn synthesize(&self, text: &str, out_path: &Path) -> Result<(), BackendError>;
}
