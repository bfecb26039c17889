use crate::retry::{Backoff, RetryPolicy};
use crate::timeline::AssemblyMode;
use crate::vad::TrimConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub const MAX_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "elevenlabs_api_key", default)]
    pub elevenlabs_key: String,
    #[serde(default = "default_voice_id")]
    pub eleven_voice_id: String,
    #[serde(default = "default_model_id")]
    pub eleven_model_id: String,
    #[serde(default)]
    pub backend_url: String,
    #[serde(rename = "backend_api_key", default)]
    pub backend_key: String,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub trimmer: TrimConfig,
    #[serde(default)]
    pub assembler: AssemblerSettings,
    #[serde(default)]
    pub session: SessionSettings,
}

fn default_voice_id() -> String {
    "JBFqnCBsd6RMkjVDRZzb".to_string()
}

fn default_model_id() -> String {
    "eleven_multilingual_v2".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work")
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("storage")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            elevenlabs_key: String::new(),
            eleven_voice_id: default_voice_id(),
            eleven_model_id: default_model_id(),
            backend_url: String::new(),
            backend_key: String::new(),
            work_dir: default_work_dir(),
            storage_root: default_storage_root(),
            orchestrator: OrchestratorSettings::default(),
            trimmer: TrimConfig::default(),
            assembler: AssemblerSettings::default(),
            session: SessionSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub concurrency: usize,
    /// Ceiling on backend calls in flight across every session in the process.
    pub max_inflight: usize,
    pub job_timeout_s: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff: Backoff,
    pub max_retry_delay_ms: u64,
    pub retry_jitter_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_inflight: MAX_CONCURRENCY,
            job_timeout_s: 300,
            max_retries: 2,
            retry_delay_ms: 2_000,
            backoff: Backoff::Fixed,
            max_retry_delay_ms: 10_000,
            retry_jitter_ms: 0,
        }
    }
}

impl OrchestratorSettings {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_s)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new("clip_generation")
            .with_max_retries(self.max_retries)
            .with_delay(Duration::from_millis(self.retry_delay_ms))
            .with_backoff(self.backoff)
            .with_max_delay(Duration::from_millis(self.max_retry_delay_ms))
            .with_jitter(Duration::from_millis(self.retry_jitter_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerSettings {
    pub mode: AssemblyMode,
    pub transition_s: f64,
    pub end_fade_s: f64,
}

impl Default for AssemblerSettings {
    fn default() -> Self {
        Self {
            mode: AssemblyMode::Crossfade,
            transition_s: 1.0,
            end_fade_s: 1.0,
        }
    }
}

/// Percentages reported at each stage; clip completion is scaled into
/// `generating_start..=generating_end`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressRanges {
    pub analyzing: u8,
    pub generating_start: u8,
    pub generating_end: u8,
    pub optimizing: u8,
}

impl Default for ProgressRanges {
    fn default() -> Self {
        Self {
            analyzing: 5,
            generating_start: 10,
            generating_end: 80,
            optimizing: 85,
        }
    }
}

impl ProgressRanges {
    pub fn generating(&self, completed: usize, total: usize) -> u8 {
        if total == 0 {
            return self.generating_end;
        }
        let span = f64::from(self.generating_end.saturating_sub(self.generating_start));
        let frac = (completed.min(total) as f64) / (total as f64);
        self.generating_start + (span * frac).floor() as u8
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub progress: ProgressRanges,
    pub deadline_s: u64,
    pub max_age_s: u64,
    pub capacity: usize,
    pub presign_ttl_s: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            progress: ProgressRanges::default(),
            deadline_s: 1_800,
            max_age_s: 3_600,
            capacity: 32,
            presign_ttl_s: 3_600,
        }
    }
}

impl SessionSettings {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_s)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_s)
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config: {}", path.as_ref().display()))?;
        let mut config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.as_ref().display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&mut self) -> Result<()> {
        let orch = &mut self.orchestrator;
        orch.concurrency = orch.concurrency.clamp(1, MAX_CONCURRENCY);
        if orch.max_inflight == 0 {
            anyhow::bail!("config.json: orchestrator.max_inflight must be at least 1");
        }
        if orch.job_timeout_s == 0 {
            anyhow::bail!("config.json: orchestrator.job_timeout_s must be positive");
        }

        let t = &self.trimmer;
        if !(0.0..1.0).contains(&t.energy_threshold) {
            anyhow::bail!("config.json: trimmer.energy_threshold must be in [0, 1)");
        }
        if t.hop_length == 0 || t.frame_length < t.hop_length {
            anyhow::bail!("config.json: trimmer.frame_length must be >= hop_length > 0");
        }

        let a = &self.assembler;
        if a.transition_s < 0.0 || a.end_fade_s < 0.0 {
            anyhow::bail!("config.json: assembler durations must be non-negative");
        }

        let p = &self.session.progress;
        if !(p.analyzing <= p.generating_start
            && p.generating_start <= p.generating_end
            && p.generating_end <= p.optimizing
            && p.optimizing <= 100)
        {
            anyhow::bail!("config.json: session.progress ranges must be ascending and <= 100");
        }
        if self.session.capacity == 0 {
            anyhow::bail!("config.json: session.capacity must be at least 1");
        }

        Ok(())
    }
}
