use ai_shorts_studio::api::{GeneratedArtifact, GenerationBackend, GenerationJob, SpeechSynthesizer};
use ai_shorts_studio::clip::{ClipKind, GenerationRequest};
use ai_shorts_studio::config::Config;
use ai_shorts_studio::error::{BackendError, MediaError, SessionError, StudioError};
use ai_shorts_studio::ffmpeg::{MediaInfo, MediaToolkit};
use ai_shorts_studio::session::{SessionSnapshot, SessionStatus};
use ai_shorts_studio::storage::LocalBlobStore;
use ai_shorts_studio::timeline::{AssemblyMode, Timeline};
use ai_shorts_studio::Studio;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::fs;

const SR: u32 = 16_000;

/// Returns clips matching the requested duration; prompts containing
/// "reject" fail permanently.
struct FakeBackend {
    delay: Duration,
    jobs: Mutex<Vec<(usize, Option<f64>)>>,
}

impl FakeBackend {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            jobs: Mutex::new(Vec::new()),
        })
    }

    fn target_for(&self, index: usize) -> Option<f64> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|(i, _)| *i == index)
            .and_then(|(_, t)| *t)
    }
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    async fn submit(&self, job: &GenerationJob) -> Result<GeneratedArtifact, BackendError> {
        self.jobs
            .lock()
            .unwrap()
            .push((job.spec.index, job.target_duration_s));
        tokio::time::sleep(self.delay).await;
        if job.spec.prompt.contains("reject") {
            return Err(BackendError::permanent("content rejected"));
        }
        fs::create_dir_all(job.output_path.parent().unwrap()).await.unwrap();
        fs::write(&job.output_path, b"clip").await.unwrap();
        Ok(GeneratedArtifact {
            local_path: job.output_path.clone(),
            duration_s: job.target_duration_s.unwrap_or(4.0),
            has_audio: job.spec.kind == ClipKind::NarratedAvatar,
        })
    }
}

struct FakeSynthesizer;

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str, out_path: &Path) -> Result<(), BackendError> {
        fs::create_dir_all(out_path.parent().unwrap()).await.unwrap();
        fs::write(out_path, text.as_bytes()).await.unwrap();
        Ok(())
    }
}

/// "Audio" files hold the narration text; "silence" decodes to silence,
/// anything else to a tone from 0.5s to 3.0s in a 4s buffer.
#[derive(Default)]
struct FakeMedia {
    rendered: Mutex<Vec<Timeline>>,
}

#[async_trait]
impl MediaToolkit for FakeMedia {
    async fn probe(&self, _path: &Path) -> Result<MediaInfo, MediaError> {
        Ok(MediaInfo {
            duration_s: 4.0,
            has_audio: true,
        })
    }

    async fn decode_mono(&self, path: &Path, sample_rate: u32) -> Result<Vec<f32>, MediaError> {
        let text = fs::read_to_string(path).await?;
        let total = 4 * sample_rate as usize;
        if text.contains("silence") {
            return Ok(vec![0.0; total]);
        }
        let (start, end) = (sample_rate as usize / 2, 3 * sample_rate as usize);
        Ok((0..total)
            .map(|i| {
                if (start..end).contains(&i) {
                    0.5 * (i as f32 * 0.2).sin()
                } else {
                    0.0
                }
            })
            .collect())
    }

    async fn cut_audio(&self, input: &Path, _duration_s: f64, output: &Path) -> Result<(), MediaError> {
        fs::copy(input, output).await?;
        Ok(())
    }

    async fn render(&self, timeline: &Timeline, output: &Path) -> Result<(), MediaError> {
        self.rendered.lock().unwrap().push(timeline.clone());
        fs::write(output, b"final video").await?;
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    work_dir: PathBuf,
    storage_root: PathBuf,
    backend: Arc<FakeBackend>,
    media: Arc<FakeMedia>,
    studio: Arc<Studio>,
}

fn harness_with(delay: Duration, tweak: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = Config {
        work_dir: dir.path().join("work"),
        storage_root: dir.path().join("storage"),
        ..Config::default()
    };
    cfg.orchestrator.retry_delay_ms = 1;
    cfg.orchestrator.job_timeout_s = 5;
    tweak(&mut cfg);
    cfg.validate().unwrap();

    let backend = FakeBackend::new(delay);
    let media = Arc::new(FakeMedia::default());
    let store = Arc::new(LocalBlobStore::new(&cfg.storage_root));
    Harness {
        work_dir: cfg.work_dir.clone(),
        storage_root: cfg.storage_root.clone(),
        studio: Arc::new(Studio::new(
            cfg,
            backend.clone(),
            Arc::new(FakeSynthesizer),
            media.clone(),
            store,
        )),
        backend,
        media,
        _dir: dir,
    }
}

fn harness() -> Harness {
    harness_with(Duration::from_millis(5), |_| {})
}

fn request(json: &str) -> GenerationRequest {
    GenerationRequest::from_json(json).unwrap()
}

async fn finish(h: &Harness, id: &str) -> SessionSnapshot {
    let session = h.studio.session(id).expect("session registered");
    tokio::time::timeout(Duration::from_secs(10), session.wait_terminal())
        .await
        .expect("session reached a terminal state");
    h.studio.snapshot(id).unwrap()
}

#[tokio::test]
async fn crossfade_session_completes_with_exact_narration_duration() {
    let h = harness();
    let id = h
        .studio
        .start(request(
            r#"{
                "title": "demo",
                "clips": [
                    {"kind": "video", "prompt": "city at dawn", "duration_s": 8.0},
                    {"kind": "narrated_avatar", "prompt": "host", "narration": "Welcome back."},
                    {"kind": "video", "prompt": "skyline", "duration_s": 9.0}
                ],
                "transition_s": 1.0
            }"#,
        ))
        .unwrap();

    let snap = finish(&h, &id).await;
    assert_eq!(snap.status, SessionStatus::Completed, "error: {:?}", snap.error);
    assert_eq!(snap.progress, 100);
    assert!(snap.warnings.is_empty(), "{:?}", snap.warnings);
    assert_eq!(snap.clips_completed, 3);

    let narration_s = h.backend.target_for(1).expect("narrated clip has a target");
    assert!((3.0..3.2).contains(&narration_s), "narration {narration_s}");
    assert_eq!((narration_s * 1000.0).round() / 1000.0, narration_s);

    let output = snap.result.expect("completed session has a result");
    assert_eq!(output.timeline.mode, AssemblyMode::Crossfade);
    let expected = 8.0 + narration_s + 9.0 - 2.0;
    assert!((output.timeline.duration_s - expected).abs() < 1e-9);
    assert!(output.download_url.contains("?expires="));

    let session_root = h.storage_root.join("sessions").join(&id);
    assert!(session_root.join("final.mp4").is_file());
    assert!(session_root.join("clips/clip_002.mp4").is_file());
    assert!(session_root.join("narration/narration_001.wav").is_file());
    assert_eq!(h.media.rendered.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn rejected_clip_is_dropped_with_warning() {
    let h = harness();
    let id = h
        .studio
        .start(request(
            r#"{"clips": [
                {"kind": "video", "prompt": "a", "duration_s": 5.0},
                {"kind": "video", "prompt": "reject me", "duration_s": 5.0},
                {"kind": "video", "prompt": "c", "duration_s": 5.0}
            ]}"#,
        ))
        .unwrap();

    let snap = finish(&h, &id).await;
    assert_eq!(snap.status, SessionStatus::Completed);
    assert!(snap.warnings.iter().any(|w| w.contains("clip 1 dropped")));
    let timeline = snap.result.unwrap().timeline;
    assert_eq!(timeline.clips.len(), 2);
    assert_eq!(timeline.clips.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 2]);
}

#[tokio::test]
async fn silent_narration_fails_only_its_clip() {
    let h = harness();
    let id = h
        .studio
        .start(request(
            r#"{"clips": [
                {"kind": "narrated_avatar", "prompt": "host", "narration": "silence"},
                {"kind": "video", "prompt": "b", "duration_s": 6.0}
            ]}"#,
        ))
        .unwrap();

    let snap = finish(&h, &id).await;
    assert_eq!(snap.status, SessionStatus::Completed);
    assert!(snap.warnings.iter().any(|w| w.contains("no voice")));
    assert!(snap.warnings.iter().any(|w| w.contains("simple assembly")));
    assert!(h.backend.target_for(0).is_none());

    let timeline = snap.result.unwrap().timeline;
    assert_eq!(timeline.mode, AssemblyMode::Simple);
    assert!((timeline.duration_s - 6.0).abs() < 1e-9);
}

#[tokio::test]
async fn all_clips_rejected_ends_in_error() {
    let h = harness();
    let id = h
        .studio
        .start(request(
            r#"{"clips": [
                {"kind": "video", "prompt": "reject 1"},
                {"kind": "video", "prompt": "reject 2"}
            ]}"#,
        ))
        .unwrap();

    let snap = finish(&h, &id).await;
    assert_eq!(snap.status, SessionStatus::Error);
    assert!(snap.error.unwrap().contains("no usable clips"));
    assert!(snap.result.is_none());
}

#[tokio::test]
async fn stop_during_generation_is_final() {
    let h = harness_with(Duration::from_secs(30), |_| {});
    let id = h
        .studio
        .start(request(
            r#"{"clips": [
                {"kind": "video", "prompt": "a"},
                {"kind": "video", "prompt": "b"},
                {"kind": "video", "prompt": "c"},
                {"kind": "video", "prompt": "d"},
                {"kind": "video", "prompt": "e"}
            ]}"#,
        ))
        .unwrap();

    let session = h.studio.session(&id).unwrap();
    for _ in 0..200 {
        if session.status() == SessionStatus::Generating {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(session.status(), SessionStatus::Generating);

    assert_eq!(h.studio.stop(&id), Ok(true));
    let stopped = h.studio.snapshot(&id).unwrap();
    assert_eq!(stopped.status, SessionStatus::Stopped);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let later = h.studio.snapshot(&id).unwrap();
    assert_eq!(later.status, SessionStatus::Stopped);
    assert_eq!(later.progress, stopped.progress);
    assert!(later.error.is_none());
    assert!(later.result.is_none());
}

#[tokio::test]
async fn deadline_forces_error() {
    let h = harness_with(Duration::from_secs(30), |cfg| cfg.session.deadline_s = 1);
    let id = h
        .studio
        .start(request(r#"{"clips": [{"kind": "video", "prompt": "slow"}]}"#))
        .unwrap();

    let snap = finish(&h, &id).await;
    assert_eq!(snap.status, SessionStatus::Error);
    assert!(snap.error.unwrap().contains("deadline"));
}

#[tokio::test]
async fn invalid_request_is_rejected_up_front() {
    let h = harness();
    let err = h
        .studio
        .start(request(r#"{"clips": []}"#))
        .unwrap_err();
    assert!(matches!(err, StudioError::InvalidRequest(_)));
    assert_eq!(
        h.studio.snapshot("nope"),
        Err(SessionError::NotFound("nope".to_string()))
    );
}

#[tokio::test]
async fn eviction_clears_session_work_dir() {
    let h = harness_with(Duration::from_millis(1), |cfg| cfg.session.max_age_s = 0);
    let id = h
        .studio
        .start(request(
            r#"{"clips": [
                {"kind": "video", "prompt": "a", "duration_s": 3.0},
                {"kind": "video", "prompt": "b", "duration_s": 3.0}
            ]}"#,
        ))
        .unwrap();
    let snap = finish(&h, &id).await;
    assert_eq!(snap.status, SessionStatus::Completed);
    assert!(h.work_dir.join(&id).is_dir());

    let dropped = h.studio.evict_expired().await;
    assert_eq!(dropped, vec![id.clone()]);
    assert!(!h.work_dir.join(&id).exists());
    assert!(h.studio.snapshot(&id).is_err());
    assert!(h.storage_root.join("sessions").join(&id).join("final.mp4").is_file());
}

#[tokio::test]
async fn starting_a_session_sweeps_stale_ones() {
    let h = harness_with(Duration::from_millis(1), |cfg| cfg.session.max_age_s = 0);
    let body = r#"{"clips": [
        {"kind": "video", "prompt": "a", "duration_s": 3.0},
        {"kind": "video", "prompt": "b", "duration_s": 3.0}
    ]}"#;
    let wait = |id: &str| {
        let session = h.studio.session(id).expect("session registered");
        async move {
            tokio::time::timeout(Duration::from_secs(10), session.wait_terminal())
                .await
                .expect("session should finish")
        }
    };

    // Never polled, so only a sweep can retire it.
    let first = h.studio.start(request(body)).unwrap();
    assert_eq!(wait(&first).await.status, SessionStatus::Completed);

    let second = h.studio.start(request(body)).unwrap();
    assert!(h.studio.session(&first).is_none());
    assert_eq!(h.studio.snapshot(&first).unwrap().status, SessionStatus::Completed);
    wait(&second).await;

    let third = h.studio.start(request(body)).unwrap();
    assert!(matches!(h.studio.snapshot(&first), Err(SessionError::NotFound(_))));
    let first_dir = h.work_dir.join(&first);
    tokio::time::timeout(Duration::from_secs(5), async {
        while first_dir.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stale work dir should be cleared");

    assert_eq!(wait(&third).await.status, SessionStatus::Completed);
}
