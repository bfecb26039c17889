//! Bounded-concurrency clip generation.
//!
//! A session hands over its ordered clip specs; `P` workers drain a shared
//! queue, each job goes through the retry policy, and every attempt holds a
//! permit from the process-wide in-flight semaphore while the backend works.
//! Results come back one per spec, in spec order, whatever order the
//! backend finished them in.

use crate::api::{GeneratedArtifact, GenerationBackend, GenerationJob};
use crate::clip::{ClipArtifact, ClipErrorKind, ClipResult, ClipSpec};
use crate::config::{MAX_CONCURRENCY, OrchestratorSettings};
use crate::error::BackendError;
use crate::retry::{RetryOutcome, RetryPolicy, retry_async};
use crate::storage::{BlobStore, clip_key};
use crossbeam::queue::SegQueue;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const CANCELLED_MSG: &str = "generation cancelled";

/// Called once for every clip result that was not discarded by cancellation.
pub type ClipHook = Arc<dyn Fn(&ClipResult) + Send + Sync>;

/// Cooperative cancellation shared between a session and its workers.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called; immediately if it already was.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|flag| *flag).await;
    }
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Worker count for one session.
    pub concurrency: usize,
    /// Budget for a single backend attempt.
    pub job_timeout: Duration,
    pub retry: RetryPolicy,
}

impl JobSettings {
    pub fn from_settings(settings: &OrchestratorSettings) -> Self {
        Self {
            concurrency: settings.concurrency.clamp(1, MAX_CONCURRENCY),
            job_timeout: settings.job_timeout(),
            retry: settings.retry_policy(),
        }
    }
}

/// Per-session inputs to one `generate` call.
#[derive(Clone)]
pub struct GenerationContext {
    pub session_id: String,
    /// Backend outputs land here before upload.
    pub work_dir: PathBuf,
    pub cancel: CancelToken,
    pub on_result: Option<ClipHook>,
}

impl GenerationContext {
    pub fn new(session_id: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            work_dir: work_dir.into(),
            cancel: CancelToken::new(),
            on_result: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_hook(mut self, hook: ClipHook) -> Self {
        self.on_result = Some(hook);
        self
    }
}

pub struct ClipOrchestrator {
    backend: Arc<dyn GenerationBackend>,
    store: Arc<dyn BlobStore>,
    inflight: Arc<Semaphore>,
}

struct Shared {
    backend: Arc<dyn GenerationBackend>,
    store: Arc<dyn BlobStore>,
    inflight: Arc<Semaphore>,
    settings: JobSettings,
    ctx: GenerationContext,
    queue: SegQueue<(usize, ClipSpec)>,
}

impl ClipOrchestrator {
    /// `max_inflight` caps backend calls across every session sharing this
    /// orchestrator.
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        store: Arc<dyn BlobStore>,
        max_inflight: usize,
    ) -> Self {
        Self {
            backend,
            store,
            inflight: Arc::new(Semaphore::new(max_inflight.max(1))),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.inflight.available_permits()
    }

    /// Generate every spec and return exactly one result per spec, ordered as
    /// `specs` was. Individual failures are recorded, never propagated.
    pub async fn generate(
        &self,
        specs: Vec<ClipSpec>,
        settings: &JobSettings,
        ctx: GenerationContext,
    ) -> Vec<ClipResult> {
        let total = specs.len();
        if total == 0 {
            return Vec::new();
        }
        let indices: Vec<usize> = specs.iter().map(|s| s.index).collect();

        let queue = SegQueue::new();
        for (pos, spec) in specs.into_iter().enumerate() {
            queue.push((pos, spec));
        }
        let shared = Arc::new(Shared {
            backend: Arc::clone(&self.backend),
            store: Arc::clone(&self.store),
            inflight: Arc::clone(&self.inflight),
            settings: settings.clone(),
            ctx,
            queue,
        });

        let workers = settings.concurrency.clamp(1, MAX_CONCURRENCY).min(total);
        info!(
            session_id = %shared.ctx.session_id,
            clips = total,
            workers,
            "starting clip generation"
        );

        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            let shared = Arc::clone(&shared);
            set.spawn(async move { shared.drain(worker_id).await });
        }

        let mut slots: Vec<Option<ClipResult>> = vec![None; total];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(results) => {
                    for (pos, result) in results {
                        slots[pos] = Some(result);
                    }
                }
                Err(e) => warn!(error = %e, "clip worker aborted"),
            }
        }

        slots
            .into_iter()
            .zip(indices)
            .map(|(slot, index)| {
                slot.unwrap_or_else(|| {
                    ClipResult::failed(index, 0, ClipErrorKind::Permanent, "clip worker aborted")
                })
            })
            .collect()
    }
}

impl Shared {
    async fn drain(self: Arc<Self>, worker_id: usize) -> Vec<(usize, ClipResult)> {
        let mut done = Vec::new();
        while let Some((pos, spec)) = self.queue.pop() {
            debug!(worker_id, clip_index = spec.index, "worker picked clip");
            let result = self.run_clip(spec).await;
            if result.error_kind() != Some(ClipErrorKind::Cancelled) {
                if let Some(hook) = &self.ctx.on_result {
                    hook(&result);
                }
            }
            done.push((pos, result));
        }
        done
    }

    async fn run_clip(self: &Arc<Self>, spec: ClipSpec) -> ClipResult {
        let index = spec.index;
        if self.ctx.cancel.is_cancelled() {
            return ClipResult::failed(index, 0, ClipErrorKind::Cancelled, CANCELLED_MSG);
        }
        if let Err(err) = spec.check_submittable() {
            warn!(clip_index = index, %err, "clip rejected before submission");
            return ClipResult::from_backend_error(index, 0, &err);
        }

        let outcome = retry_async(&self.settings.retry, |attempt| {
            Arc::clone(self).attempt(spec.clone(), attempt)
        })
        .await;

        let attempts = outcome.attempts();
        if self.ctx.cancel.is_cancelled() {
            debug!(clip_index = index, "discarding result after cancellation");
            return ClipResult::failed(index, attempts, ClipErrorKind::Cancelled, CANCELLED_MSG);
        }

        match outcome {
            RetryOutcome::Success {
                value: (generated, blob_url),
                attempts,
            } => {
                info!(
                    session_id = %self.ctx.session_id,
                    clip_index = index,
                    attempts,
                    duration_s = generated.duration_s,
                    "clip generated"
                );
                ClipResult::success(
                    index,
                    attempts,
                    ClipArtifact {
                        local_path: generated.local_path,
                        blob_url: Some(blob_url),
                    },
                    generated.duration_s,
                    generated.has_audio,
                )
            }
            RetryOutcome::Failed { error, attempts } => {
                warn!(
                    session_id = %self.ctx.session_id,
                    clip_index = index,
                    attempts,
                    %error,
                    "clip failed"
                );
                ClipResult::from_backend_error(index, attempts, &error)
            }
        }
    }

    async fn attempt(
        self: Arc<Self>,
        spec: ClipSpec,
        attempt: u32,
    ) -> Result<(GeneratedArtifact, String), BackendError> {
        let index = spec.index;
        let job = GenerationJob {
            target_duration_s: spec.target_duration_s(),
            output_path: self
                .ctx
                .work_dir
                .join(format!("clip_{index:03}_attempt{attempt}.mp4")),
            spec,
            attempt,
        };

        let generated = tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => return Err(BackendError::permanent(CANCELLED_MSG)),
            res = self.call_backend(&job) => res?,
        };

        if !(generated.duration_s.is_finite() && generated.duration_s > 0.0) {
            return Err(BackendError::transient(format!(
                "clip {index} artifact has unusable duration {}",
                generated.duration_s
            )));
        }
        if self.ctx.cancel.is_cancelled() {
            return Err(BackendError::permanent(CANCELLED_MSG));
        }

        let bytes = fs::read(&generated.local_path).await.map_err(|e| {
            BackendError::transient(format!("read {}: {e}", generated.local_path.display()))
        })?;
        let key = clip_key(&self.ctx.session_id, index);
        let url = self
            .store
            .put(bytes, &key)
            .await
            .map_err(|e| BackendError::transient(format!("upload {key}: {e}")))?;
        Ok((generated, url))
    }

    async fn call_backend(&self, job: &GenerationJob) -> Result<GeneratedArtifact, BackendError> {
        let _permit = self
            .inflight
            .acquire()
            .await
            .map_err(|_| BackendError::permanent("generation pool closed"))?;
        match tokio::time::timeout(self.settings.job_timeout, self.backend.submit(job)).await {
            Ok(res) => res,
            Err(_) => Err(BackendError::transient(format!(
                "clip {} attempt {} timed out after {:?}",
                job.spec.index, job.attempt, self.settings.job_timeout
            ))),
        }
    }
}
