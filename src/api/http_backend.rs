//! Generic submit-and-poll HTTP job backend.
//!
//! `POST {base}/v1/jobs` with the clip request returns `{"id": ...}`;
//! `GET {base}/v1/jobs/{id}` reports `queued | running | succeeded | failed`.
//! A succeeded job carries an `output_url` that is downloaded to the job's
//! output path and probed for duration.

use super::{GeneratedArtifact, GenerationBackend, GenerationJob};
use crate::config::Config;
use crate::error::BackendError;
use crate::ffmpeg::MediaToolkit;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Serialize)]
struct SubmitBody<'a> {
    kind: crate::clip::ClipKind,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_s: Option<f64>,
    /// Lip-sync targets must match the narration length exactly.
    match_audio_duration: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_url: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Deserialize)]
struct JobStatusResponse {
    status: JobState,
    #[serde(default)]
    output_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
    /// Backend's own verdict on whether a failed job is worth resubmitting.
    #[serde(default)]
    retryable: bool,
}

pub struct HttpClipBackend {
    client: Client,
    base_url: String,
    api_key: String,
    media: Arc<dyn MediaToolkit>,
    poll_interval: Duration,
}

impl HttpClipBackend {
    pub fn new(client: Client, cfg: &Config, media: Arc<dyn MediaToolkit>) -> Self {
        Self {
            client,
            base_url: cfg.backend_url.trim_end_matches('/').to_string(),
            api_key: cfg.backend_key.clone(),
            media,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn create_job(&self, job: &GenerationJob) -> Result<String, BackendError> {
        let narration = job.spec.narration.as_ref();
        let body = SubmitBody {
            kind: job.spec.kind,
            prompt: &job.spec.prompt,
            reference: job.spec.reference.as_deref(),
            duration_s: job.target_duration_s,
            match_audio_duration: job.spec.kind.is_narrated(),
            audio_url: narration.and_then(|n| n.audio_url.as_deref()),
        };

        let resp = self
            .client
            .post(format!("{}/v1/jobs", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(BackendError::from_status(status.as_u16(), &raw));
        }
        let parsed: SubmitResponse = serde_json::from_str(&raw)
            .map_err(|e| BackendError::transient(format!("malformed submit response: {e}")))?;
        Ok(parsed.id)
    }

    async fn poll_job(&self, id: &str) -> Result<String, BackendError> {
        loop {
            let resp = self
                .client
                .get(format!("{}/v1/jobs/{id}", self.base_url))
                .bearer_auth(&self.api_key)
                .send()
                .await?;
            let status = resp.status();
            let raw = resp.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(BackendError::from_status(status.as_u16(), &raw));
            }
            let parsed: JobStatusResponse = serde_json::from_str(&raw)
                .map_err(|e| BackendError::transient(format!("malformed status response: {e}")))?;

            match parsed.status {
                JobState::Queued | JobState::Running => {
                    debug!(job_id = id, status = ?parsed.status, "backend job pending");
                    tokio::time::sleep(self.poll_interval).await;
                }
                JobState::Succeeded => {
                    return parsed.output_url.ok_or_else(|| {
                        BackendError::transient(format!("job {id} succeeded without output_url"))
                    });
                }
                JobState::Failed => {
                    let reason = parsed.error.unwrap_or_else(|| "unknown failure".to_string());
                    return Err(if parsed.retryable {
                        BackendError::Transient(reason)
                    } else {
                        BackendError::Permanent(reason)
                    });
                }
            }
        }
    }

    async fn download(&self, url: &str, job: &GenerationJob) -> Result<(), BackendError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::from_status(status.as_u16(), ""));
        }
        let bytes = resp.bytes().await?;
        if let Some(parent) = job.output_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| BackendError::permanent(format!("create {}: {e}", parent.display())))?;
        }
        fs::write(&job.output_path, &bytes)
            .await
            .map_err(|e| BackendError::permanent(format!("write {}: {e}", job.output_path.display())))
    }
}

#[async_trait]
impl GenerationBackend for HttpClipBackend {
    async fn submit(&self, job: &GenerationJob) -> Result<GeneratedArtifact, BackendError> {
        if self.base_url.is_empty() {
            return Err(BackendError::permanent("backend_url missing"));
        }
        job.spec.check_submittable()?;

        let id = self.create_job(job).await?;
        info!(job_id = %id, clip_index = job.spec.index, attempt = job.attempt, "backend job created");
        let output_url = self.poll_job(&id).await?;
        self.download(&output_url, job).await?;

        // A corrupt download is worth regenerating.
        let info = self
            .media
            .probe(&job.output_path)
            .await
            .map_err(|e| BackendError::transient(format!("unreadable artifact: {e}")))?;

        Ok(GeneratedArtifact {
            local_path: job.output_path.clone(),
            duration_s: info.duration_s,
            has_audio: info.has_audio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_status_parses_retryable_flag() {
        let parsed: JobStatusResponse =
            serde_json::from_str(r#"{"status":"failed","error":"rate limited","retryable":true}"#).unwrap();
        assert_eq!(parsed.status, JobState::Failed);
        assert!(parsed.retryable);

        let parsed: JobStatusResponse = serde_json::from_str(r#"{"status":"running"}"#).unwrap();
        assert_eq!(parsed.status, JobState::Running);
        assert!(!parsed.retryable);
    }

    #[test]
    fn narrated_submit_body_requests_audio_match() {
        let body = SubmitBody {
            kind: crate::clip::ClipKind::NarratedAvatar,
            prompt: "host",
            reference: None,
            duration_s: Some(3.7),
            match_audio_duration: true,
            audio_url: Some("file:///n.wav"),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["kind"], "narrated_avatar");
        assert_eq!(json["duration_s"], 3.7);
        assert_eq!(json["match_audio_duration"], true);
        assert!(json.get("reference").is_none());
    }
}
