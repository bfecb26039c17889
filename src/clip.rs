use crate::error::{BackendError, TrimError};
use crate::timeline::AssemblyMode;
use crate::vad::TrimReason;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipKind {
    /// Text-to-video segment.
    Video,
    /// Video driven by a reference image.
    ImageDriven,
    /// Avatar lip-synced to a narration track.
    NarratedAvatar,
}

impl ClipKind {
    pub fn is_narrated(self) -> bool {
        matches!(self, ClipKind::NarratedAvatar)
    }
}

/// Trimmed narration audio a narrated clip is lip-synced to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrationTrack {
    pub audio_path: PathBuf,
    /// Exact duration after voice-activity trimming.
    pub duration_s: f64,
    pub trim_reason: TrimReason,
    /// Blob-store URL the backend fetches the audio from.
    #[serde(default)]
    pub audio_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipSpec {
    pub index: usize,
    pub kind: ClipKind,
    pub prompt: String,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub duration_hint_s: Option<f64>,
    #[serde(default)]
    pub narration_text: Option<String>,
    #[serde(default)]
    pub narration: Option<NarrationTrack>,
}

impl ClipSpec {
    pub fn new(index: usize, kind: ClipKind, prompt: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            prompt: prompt.into(),
            reference: None,
            duration_hint_s: None,
            narration_text: None,
            narration: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_duration_hint(mut self, seconds: f64) -> Self {
        self.duration_hint_s = Some(seconds);
        self
    }

    pub fn with_narration_text(mut self, text: impl Into<String>) -> Self {
        self.narration_text = Some(text.into());
        self
    }

    pub fn with_narration(mut self, track: NarrationTrack) -> Self {
        self.narration = Some(track);
        self
    }

    /// Duration the backend must match. Narrated clips follow their trimmed
    /// audio exactly and ignore any hint.
    pub fn target_duration_s(&self) -> Option<f64> {
        if self.kind.is_narrated() {
            return self.narration.as_ref().map(|n| n.duration_s);
        }
        self.duration_hint_s
    }

    /// Checks that the clip can be submitted as-is.
    pub fn check_submittable(&self) -> Result<(), BackendError> {
        if self.prompt.trim().is_empty() {
            return Err(BackendError::permanent(format!(
                "clip {} has an empty prompt",
                self.index
            )));
        }
        if self.kind == ClipKind::ImageDriven && self.reference.is_none() {
            return Err(BackendError::permanent(format!(
                "image-driven clip {} has no reference image",
                self.index
            )));
        }
        if self.kind.is_narrated() && self.narration.is_none() {
            return Err(BackendError::permanent(format!(
                "narrated clip {} has no prepared narration",
                self.index
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipErrorKind {
    Transient,
    Permanent,
    NoVoiceDetected,
    Cancelled,
}

impl From<&BackendError> for ClipErrorKind {
    fn from(err: &BackendError) -> Self {
        match err {
            BackendError::Transient(_) => ClipErrorKind::Transient,
            BackendError::Permanent(_) => ClipErrorKind::Permanent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipArtifact {
    pub local_path: PathBuf,
    #[serde(default)]
    pub blob_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClipOutcome {
    Success {
        artifact: ClipArtifact,
        duration_s: f64,
        has_audio: bool,
    },
    Failed {
        kind: ClipErrorKind,
        message: String,
    },
}

/// One per spec index; a retry produces a new result instead of mutating this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipResult {
    pub index: usize,
    pub attempts: u32,
    pub outcome: ClipOutcome,
}

impl ClipResult {
    pub fn success(
        index: usize,
        attempts: u32,
        artifact: ClipArtifact,
        duration_s: f64,
        has_audio: bool,
    ) -> Self {
        Self {
            index,
            attempts,
            outcome: ClipOutcome::Success {
                artifact,
                duration_s,
                has_audio,
            },
        }
    }

    pub fn failed(index: usize, attempts: u32, kind: ClipErrorKind, message: impl Into<String>) -> Self {
        Self {
            index,
            attempts,
            outcome: ClipOutcome::Failed {
                kind,
                message: message.into(),
            },
        }
    }

    pub fn from_backend_error(index: usize, attempts: u32, err: &BackendError) -> Self {
        Self::failed(index, attempts, err.into(), err.to_string())
    }

    pub fn from_trim_error(index: usize, err: &TrimError) -> Self {
        let kind = match err {
            TrimError::NoVoiceDetected { .. } => ClipErrorKind::NoVoiceDetected,
            TrimError::InvalidInput(_) => ClipErrorKind::Permanent,
        };
        Self::failed(index, 0, kind, err.to_string())
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ClipOutcome::Success { .. })
    }

    pub fn duration_s(&self) -> Option<f64> {
        match &self.outcome {
            ClipOutcome::Success { duration_s, .. } => Some(*duration_s),
            ClipOutcome::Failed { .. } => None,
        }
    }

    pub fn has_audio(&self) -> bool {
        matches!(self.outcome, ClipOutcome::Success { has_audio: true, .. })
    }

    pub fn artifact(&self) -> Option<&ClipArtifact> {
        match &self.outcome {
            ClipOutcome::Success { artifact, .. } => Some(artifact),
            ClipOutcome::Failed { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<ClipErrorKind> {
        match &self.outcome {
            ClipOutcome::Failed { kind, .. } => Some(*kind),
            ClipOutcome::Success { .. } => None,
        }
    }
}

/// One entry of a caller-provided clip plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipPlan {
    pub kind: ClipKind,
    pub prompt: String,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub narration: Option<String>,
    #[serde(default)]
    pub duration_s: Option<f64>,
}

/// Everything a session needs to start: the ordered clip plan plus optional
/// assembly overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default)]
    pub title: String,
    pub clips: Vec<ClipPlan>,
    #[serde(default)]
    pub mode: Option<AssemblyMode>,
    #[serde(default)]
    pub transition_s: Option<f64>,
    #[serde(default)]
    pub end_fade_s: Option<f64>,
}

impl GenerationRequest {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).with_context(|| "Failed to parse generation request JSON")
    }

    /// Reject requests that cannot possibly produce a timeline.
    pub fn validate(&self) -> Result<(), String> {
        if self.clips.is_empty() {
            return Err("request contains no clips".to_string());
        }
        for (idx, clip) in self.clips.iter().enumerate() {
            if clip.prompt.trim().is_empty() {
                return Err(format!("clip {idx} has an empty prompt"));
            }
            if clip.kind.is_narrated()
                && clip.narration.as_deref().is_none_or(|t| t.trim().is_empty())
            {
                return Err(format!("narrated clip {idx} has no narration text"));
            }
            if clip.kind == ClipKind::ImageDriven && clip.reference.is_none() {
                return Err(format!("image-driven clip {idx} has no reference image"));
            }
            if let Some(d) = clip.duration_s {
                if !(d.is_finite() && d > 0.0) {
                    return Err(format!("clip {idx} has a non-positive duration hint"));
                }
            }
        }
        for (name, value) in [("transition_s", self.transition_s), ("end_fade_s", self.end_fade_s)] {
            if value.is_some_and(|v| !(v.is_finite() && v >= 0.0)) {
                return Err(format!("{name} must be a non-negative number"));
            }
        }
        Ok(())
    }

    pub fn to_specs(&self) -> Vec<ClipSpec> {
        self.clips
            .iter()
            .enumerate()
            .map(|(index, plan)| {
                let mut spec = ClipSpec::new(index, plan.kind, plan.prompt.clone());
                spec.reference = plan.reference.clone();
                spec.duration_hint_s = plan.duration_s;
                spec.narration_text = plan.narration.clone();
                spec
            })
            .collect()
    }
}
