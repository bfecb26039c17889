use crate::api::{ElevenLabsSynthesizer, GenerationBackend, HttpClipBackend, SpeechSynthesizer};
use crate::clip::{ClipErrorKind, ClipResult, ClipSpec, GenerationRequest, NarrationTrack};
use crate::config::Config;
use crate::error::{MediaError, SessionError, StudioError, StudioResult};
use crate::ffmpeg::{FfmpegToolkit, MediaToolkit, RenderSettings};
use crate::orchestrator::{ClipOrchestrator, GenerationContext, JobSettings};
use crate::retry::retry_async;
use crate::session::{
    ProgressUpdate, Session, SessionOutput, SessionSnapshot, SessionStatus, SessionStore,
};
use crate::storage::{BlobStore, LocalBlobStore, final_key, narration_key};
use crate::timeline::{self, AssemblyMode};
use crate::vad;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Runs generation sessions end to end: narration prep, clip fan-out,
/// assembly, render, upload.
pub struct Studio {
    config: Config,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    media: Arc<dyn MediaToolkit>,
    store: Arc<dyn BlobStore>,
    orchestrator: ClipOrchestrator,
    sessions: SessionStore,
}

impl Studio {
    pub fn new(
        config: Config,
        backend: Arc<dyn GenerationBackend>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        media: Arc<dyn MediaToolkit>,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        let orchestrator =
            ClipOrchestrator::new(backend, Arc::clone(&store), config.orchestrator.max_inflight);
        let sessions = SessionStore::new(config.session.capacity, config.session.max_age());
        Self {
            config,
            synthesizer,
            media,
            store,
            orchestrator,
            sessions,
        }
    }

    /// Production wiring: HTTP clip backend, ElevenLabs narration, ffmpeg,
    /// and a filesystem blob store under `storage_root`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        let media: Arc<dyn MediaToolkit> = Arc::new(FfmpegToolkit::new(RenderSettings::default()));
        let backend = Arc::new(HttpClipBackend::new(client.clone(), &config, Arc::clone(&media)));
        let synthesizer = Arc::new(ElevenLabsSynthesizer::new(client, &config));
        let store = Arc::new(LocalBlobStore::new(&config.storage_root));
        Ok(Self::new(config, backend, synthesizer, media, store))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id)
    }

    /// Validate the request, register a session, and run it in the
    /// background. Returns the session id immediately.
    pub fn start(self: &Arc<Self>, request: GenerationRequest) -> StudioResult<String> {
        request.validate().map_err(StudioError::InvalidRequest)?;

        let dropped = self.sessions.evict_expired();
        if !dropped.is_empty() {
            let studio = Arc::clone(self);
            tokio::spawn(async move { studio.clear_session_dirs(&dropped).await });
        }

        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(id.clone(), self.config.session.progress));
        self.sessions.insert(Arc::clone(&session))?;
        info!(session_id = %id, clips = request.clips.len(), title = %request.title, "session started");

        let studio = Arc::clone(self);
        tokio::spawn(async move {
            let deadline = studio.config.session.deadline();
            let outcome = tokio::time::timeout(deadline, studio.run_session(&session, &request)).await;
            let failure = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(err)) => err.to_string(),
                Err(_) => {
                    session.cancel_token().cancel();
                    SessionError::TimeoutExceeded(deadline).to_string()
                }
            };
            if session.fail(failure.as_str()).is_err() {
                debug!(session_id = %session.id(), reason = %failure, "session already terminal");
            } else {
                error!(session_id = %session.id(), reason = %failure, "session failed");
            }
        });

        Ok(id)
    }

    pub fn snapshot(&self, id: &str) -> Result<SessionSnapshot, SessionError> {
        self.sessions.snapshot(id)
    }

    pub fn stop(&self, id: &str) -> Result<bool, SessionError> {
        self.sessions.stop(id)
    }

    /// Drop expired sessions and their scratch directories. `start` runs the
    /// same sweep, so calling this is only needed between starts.
    pub async fn evict_expired(&self) -> Vec<String> {
        let dropped = self.sessions.evict_expired();
        self.clear_session_dirs(&dropped).await;
        dropped
    }

    async fn clear_session_dirs(&self, ids: &[String]) {
        for id in ids {
            let dir = self.session_dir(id);
            if let Err(e) = clear_dir(&dir).await {
                warn!(session_id = %id, dir = %dir.display(), error = %e, "failed to clear work dir");
            }
        }
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.config.work_dir.join(id)
    }

    async fn run_session(&self, session: &Arc<Session>, request: &GenerationRequest) -> StudioResult<()> {
        let id = session.id().to_string();
        let work_dir = self.session_dir(&id);
        fs::create_dir_all(&work_dir).await.map_err(MediaError::Io)?;

        session.apply(ProgressUpdate::Stage {
            status: SessionStatus::Analyzing,
            step: "Preparing clip plan".to_string(),
        })?;
        let specs = request.to_specs();
        session.apply(ProgressUpdate::ClipsPlanned { total: specs.len() })?;

        let (ready, mut results) = self.prepare_specs(session, specs, &work_dir).await?;

        session.apply(ProgressUpdate::Stage {
            status: SessionStatus::Generating,
            step: format!("Generating {} clips", ready.len()),
        })?;
        let hook_session = Arc::clone(session);
        let ctx = GenerationContext::new(id.as_str(), work_dir.join("clips"))
            .with_cancel(session.cancel_token())
            .with_hook(Arc::new(move |result: &ClipResult| record_clip(&hook_session, result)));
        let settings = JobSettings::from_settings(&self.config.orchestrator);
        results.extend(self.orchestrator.generate(ready, &settings, ctx).await);
        results.sort_by_key(|r| r.index);

        if session.status().is_terminal() {
            debug!(session_id = %id, "session ended during generation");
            return Ok(());
        }

        session.apply(ProgressUpdate::Stage {
            status: SessionStatus::Optimizing,
            step: "Assembling timeline".to_string(),
        })?;
        let mut usable = Vec::with_capacity(results.len());
        for result in results {
            match result.error_kind() {
                None => usable.push(result),
                Some(kind) => session.apply(ProgressUpdate::Warning(format!(
                    "clip {} dropped ({})",
                    result.index,
                    kind_label(kind)
                )))?,
            }
        }
        let failed = request.clips.len() - usable.len();
        if usable.is_empty() {
            return Err(StudioError::NoUsableClips { failed });
        }

        let requested = request.mode.unwrap_or(self.config.assembler.mode);
        let (mode, downgrade) = resolve_mode(requested, usable.len());
        if let Some(msg) = downgrade {
            session.apply(ProgressUpdate::Warning(msg))?;
        }
        let transition_s = request.transition_s.unwrap_or(self.config.assembler.transition_s);
        let end_fade_s = request.end_fade_s.unwrap_or(self.config.assembler.end_fade_s);
        let timeline = timeline::assemble(&usable, transition_s, end_fade_s, mode)?;
        info!(
            session_id = %id,
            clips = usable.len(),
            duration_s = timeline.duration_s,
            transition_s = timeline.transition_s,
            "timeline assembled"
        );

        session.apply(ProgressUpdate::Step("Rendering final video".to_string()))?;
        let final_path = work_dir.join("final.mp4");
        self.media.render(&timeline, &final_path).await?;

        session.apply(ProgressUpdate::Step("Uploading final video".to_string()))?;
        let bytes = fs::read(&final_path).await.map_err(MediaError::Io)?;
        let key = final_key(&id);
        let artifact_url = self.store.put(bytes, &key).await?;
        let download_url = self
            .store
            .get_presigned(&key, std::time::Duration::from_secs(self.config.session.presign_ttl_s))
            .await?;

        session.complete(SessionOutput {
            timeline,
            artifact_url,
            download_url,
        })?;
        Ok(())
    }

    /// Attach trimmed narration to narrated specs. Specs whose narration
    /// cannot be prepared fail here and never reach the backend.
    async fn prepare_specs(
        &self,
        session: &Session,
        specs: Vec<ClipSpec>,
        work_dir: &Path,
    ) -> StudioResult<(Vec<ClipSpec>, Vec<ClipResult>)> {
        let narrated = specs.iter().filter(|s| s.kind.is_narrated()).count();
        let mut ready = Vec::with_capacity(specs.len());
        let mut failed = Vec::new();
        let mut done = 0;

        for mut spec in specs {
            if !spec.kind.is_narrated() {
                ready.push(spec);
                continue;
            }
            done += 1;
            session.apply(ProgressUpdate::Step(format!("Preparing narration {done}/{narrated}")))?;

            match self.prepare_narration(session.id(), &spec, work_dir).await {
                Ok(track) => {
                    debug!(
                        clip_index = spec.index,
                        duration_s = track.duration_s,
                        reason = %track.trim_reason,
                        "narration trimmed"
                    );
                    spec.narration = Some(track);
                    ready.push(spec);
                }
                Err(err) => {
                    let result = match &err {
                        StudioError::Trim(e) => ClipResult::from_trim_error(spec.index, e),
                        StudioError::Backend(e) => ClipResult::from_backend_error(spec.index, 0, e),
                        other => ClipResult::failed(
                            spec.index,
                            0,
                            ClipErrorKind::Permanent,
                            other.to_string(),
                        ),
                    };
                    warn!(session_id = %session.id(), clip_index = spec.index, error = %err, "narration failed");
                    session.apply(ProgressUpdate::Warning(format!(
                        "narration for clip {} failed: {err}",
                        spec.index
                    )))?;
                    session.apply(ProgressUpdate::ClipFinished(result.clone()))?;
                    failed.push(result);
                }
            }
        }

        Ok((ready, failed))
    }

    async fn prepare_narration(
        &self,
        session_id: &str,
        spec: &ClipSpec,
        work_dir: &Path,
    ) -> StudioResult<NarrationTrack> {
        let text = spec.narration_text.as_deref().unwrap_or_default();
        let raw = work_dir.join(format!("narration_{:03}_raw.mp3", spec.index));

        let policy = self.config.orchestrator.retry_policy().with_operation_name("narration_tts");
        let synthesizer = self.synthesizer.as_ref();
        let raw_path = raw.as_path();
        retry_async(&policy, move |_| synthesizer.synthesize(text, raw_path))
            .await
            .into_result()?;

        let trim_cfg = &self.config.trimmer;
        let samples = self.media.decode_mono(&raw, trim_cfg.sample_rate).await?;
        let decision = vad::trim(&samples, trim_cfg.sample_rate, trim_cfg)?;
        // The cut and the duration handed to the backend must agree exactly.
        let duration_s = round_ms(decision.cut_point_s);

        let trimmed = work_dir.join(format!("narration_{:03}.wav", spec.index));
        self.media.cut_audio(&raw, duration_s, &trimmed).await?;
        let bytes = fs::read(&trimmed).await.map_err(MediaError::Io)?;
        let audio_url = self.store.put(bytes, &narration_key(session_id, spec.index)).await?;

        Ok(NarrationTrack {
            audio_path: trimmed,
            duration_s,
            trim_reason: decision.reason,
            audio_url: Some(audio_url),
        })
    }
}

/// Fold a finished clip into session progress. Results arriving after the
/// session ended are expected during stop or deadline teardown.
fn record_clip(session: &Session, result: &ClipResult) {
    match session.apply(ProgressUpdate::ClipFinished(result.clone())) {
        Ok(()) => {}
        Err(SessionError::Terminal(status)) => {
            debug!(
                session_id = %session.id(),
                clip_index = result.index,
                %status,
                "clip result after session ended"
            );
        }
        Err(e) => {
            warn!(
                session_id = %session.id(),
                clip_index = result.index,
                error = %e,
                "clip result not recorded"
            );
        }
    }
}

fn round_ms(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

fn kind_label(kind: ClipErrorKind) -> &'static str {
    match kind {
        ClipErrorKind::Transient => "transient failure",
        ClipErrorKind::Permanent => "permanent failure",
        ClipErrorKind::NoVoiceDetected => "no voice detected",
        ClipErrorKind::Cancelled => "cancelled",
    }
}

/// Crossfading needs two clips; with fewer usable clips fall back to a plain
/// concat instead of failing the session.
fn resolve_mode(requested: AssemblyMode, usable: usize) -> (AssemblyMode, Option<String>) {
    if usable < requested.min_clips() {
        let msg = format!(
            "only {usable} usable clip(s); using simple assembly instead of {requested:?}"
        );
        return (AssemblyMode::Simple, Some(msg));
    }
    (requested, None)
}

async fn clear_dir(dir: &Path) -> std::io::Result<()> {
    if !fs::try_exists(dir).await? {
        return Ok(());
    }
    for entry in WalkDir::new(dir).contents_first(true) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            fs::remove_dir(entry.path()).await?;
        } else {
            fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}
