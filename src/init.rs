use crate::config::Config;
use anyhow::{Context, Result};
use tokio::fs;
use tracing::info;

pub async fn ensure_directories(cfg: &Config) -> Result<()> {
    for dir in [&cfg.work_dir, &cfg.storage_root] {
        if !fs::try_exists(dir).await.unwrap_or(false) {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            info!(dir = %dir.display(), "created directory");
        }
    }
    Ok(())
}

async fn tool_available(tool: &str) -> bool {
    match tokio::process::Command::new(tool).arg("-version").output().await {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

/// Rendering and narration decoding need both ffmpeg and ffprobe on PATH.
pub async fn check_ffmpeg() -> bool {
    tool_available("ffmpeg").await && tool_available("ffprobe").await
}
