use ai_shorts_studio::clip::GenerationRequest;
use ai_shorts_studio::config::Config;
use ai_shorts_studio::session::SessionStatus;
use ai_shorts_studio::{Studio, init};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

async fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(p) => Config::load(p).await,
        None if fs::try_exists("config.json").await.unwrap_or(false) => Config::load("config.json").await,
        None => {
            let mut cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(plan_path) = args.first() else {
        anyhow::bail!("usage: ai-shorts-studio <plan.json> [config.json]");
    };

    let cfg = load_config(args.get(1).map(String::as_str)).await?;
    init::ensure_directories(&cfg).await?;
    if !init::check_ffmpeg().await {
        warn!("ffmpeg/ffprobe not found in PATH; rendering will fail");
    }

    let plan = fs::read_to_string(plan_path)
        .await
        .with_context(|| format!("Failed to read plan: {plan_path}"))?;
    let request = GenerationRequest::from_json(&plan)?;

    let studio = Arc::new(Studio::from_config(cfg)?);
    let session_id = studio.start(request)?;
    info!(%session_id, "generation started");

    let mut last_progress = None;
    let snapshot = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!(%session_id, "interrupt received, stopping session");
                studio.stop(&session_id)?;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let snap = studio.snapshot(&session_id)?;
        if last_progress != Some((snap.status, snap.progress)) {
            info!(
                status = %snap.status,
                progress = snap.progress,
                step = %snap.current_step,
                clips = %format!("{}/{}", snap.clips_completed, snap.clips_total),
                "session progress"
            );
            last_progress = Some((snap.status, snap.progress));
        }
        if snap.status.is_terminal() {
            break snap;
        }
    };

    for warning in &snapshot.warnings {
        warn!(%warning, "session warning");
    }
    match snapshot.status {
        SessionStatus::Completed => {
            if let Some(output) = &snapshot.result {
                info!(
                    duration_s = output.timeline.duration_s,
                    url = %output.download_url,
                    "final video ready"
                );
            }
            Ok(())
        }
        status => {
            error!(%status, error = snapshot.error.as_deref().unwrap_or("none"), "generation did not complete");
            std::process::exit(1);
        }
    }
}
