use super::SpeechSynthesizer;
use crate::config::Config;
use crate::error::BackendError;
use async_trait::async_trait;
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};

const ELEVENLABS_BASE: &str = "https://api.elevenlabs.io";

pub struct ElevenLabsSynthesizer {
    client: Client,
    base_url: String,
    api_key: String,
    voice_id: String,
    model_id: String,
}

impl ElevenLabsSynthesizer {
    pub fn new(client: Client, cfg: &Config) -> Self {
        Self {
            client,
            base_url: ELEVENLABS_BASE.to_string(),
            api_key: cfg.elevenlabs_key.clone(),
            voice_id: cfg.eleven_voice_id.clone(),
            model_id: cfg.eleven_model_id.clone(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/text-to-speech/{}?output_format=mp3_44100_128",
            self.base_url.trim_end_matches('/'),
            self.voice_id
        )
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str, out_path: &Path) -> Result<(), BackendError> {
        if self.api_key.is_empty() {
            return Err(BackendError::permanent("elevenlabs_api_key missing"));
        }

        let body = serde_json::json!({
            "text": text,
            "model_id": self.model_id,
        });

        let resp = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .header("xi-api-key", &self.api_key)
            .json(&body)
            .timeout(Duration::from_secs(300))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let raw = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "ElevenLabs TTS failed");
            return Err(BackendError::from_status(status.as_u16(), &raw));
        }

        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(BackendError::transient("ElevenLabs returned an empty body"));
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| BackendError::permanent(format!("create {}: {e}", parent.display())))?;
        }
        fs::write(out_path, &bytes)
            .await
            .map_err(|e| BackendError::permanent(format!("write {}: {e}", out_path.display())))?;

        debug!(path = %out_path.display(), bytes = bytes.len(), "narration synthesized");
        Ok(())
    }
}
