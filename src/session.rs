//! Generation session state machine and the store that owns live sessions.
//!
//! Each session has exactly one writer at a time: every mutation goes through
//! `watch::Sender::send_if_modified`, and pollers read a cloned snapshot, so a
//! poll never sees half of an update.

use crate::clip::ClipResult;
use crate::config::ProgressRanges;
use crate::error::SessionError;
use crate::orchestrator::CancelToken;
use crate::timeline::Timeline;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Analyzing,
    Generating,
    Optimizing,
    Completed,
    Error,
    Stopped,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Analyzing => "analyzing",
            Self::Generating => "generating",
            Self::Optimizing => "optimizing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::Analyzing => 1,
            Self::Generating => 2,
            Self::Optimizing => 3,
            Self::Completed | Self::Error | Self::Stopped => 4,
        }
    }

    /// Stages advance one step at a time; error and stop are reachable from
    /// any live stage; nothing leaves a terminal state.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Error | Self::Stopped => true,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a finished session hands back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOutput {
    pub timeline: Timeline,
    /// Canonical blob-store URL of the rendered video.
    pub artifact_url: String,
    /// Time-limited download link.
    pub download_url: String,
}

/// Read-only view returned to pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    pub progress: u8,
    pub current_step: String,
    pub warnings: Vec<String>,
    pub result: Option<SessionOutput>,
    pub error: Option<String>,
    pub clips_completed: usize,
    pub clips_total: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Non-terminal updates a running pipeline reports to its session.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// Move to the next live stage.
    Stage {
        status: SessionStatus,
        step: String,
    },
    /// New step text within the current stage.
    Step(String),
    ClipsPlanned { total: usize },
    ClipFinished(ClipResult),
    Warning(String),
}

#[derive(Debug, Clone)]
struct SessionState {
    status: SessionStatus,
    progress: u8,
    current_step: String,
    warnings: Vec<String>,
    clips_total: usize,
    results: BTreeMap<usize, ClipResult>,
    output: Option<SessionOutput>,
    error: Option<String>,
    updated_at: DateTime<Utc>,
}

pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    created: Instant,
    ranges: ProgressRanges,
    state: watch::Sender<SessionState>,
    cancel: CancelToken,
}

impl Session {
    pub fn new(id: impl Into<String>, ranges: ProgressRanges) -> Self {
        let now = Utc::now();
        let (state, _rx) = watch::channel(SessionState {
            status: SessionStatus::Initializing,
            progress: 0,
            current_step: "Initializing".to_string(),
            warnings: Vec::new(),
            clips_total: 0,
            results: BTreeMap::new(),
            output: None,
            error: None,
            updated_at: now,
        });
        Self {
            id: id.into(),
            created_at: now,
            created: Instant::now(),
            ranges,
            state,
            cancel: CancelToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.state.borrow().status
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Token the session's workers watch; tripped by `stop`.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Clip results recorded so far, in index order.
    pub fn clip_results(&self) -> Vec<ClipResult> {
        self.state.borrow().results.values().cloned().collect()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.borrow();
        SessionSnapshot {
            session_id: self.id.clone(),
            status: state.status,
            progress: state.progress,
            current_step: state.current_step.clone(),
            warnings: state.warnings.clone(),
            result: state.output.clone(),
            error: state.error.clone(),
            clips_completed: state.results.len(),
            clips_total: state.clips_total,
            created_at: self.created_at,
            updated_at: state.updated_at,
        }
    }

    /// Resolves with the first snapshot taken in a terminal state.
    pub async fn wait_terminal(&self) -> SessionSnapshot {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.status.is_terminal()).await;
        self.snapshot()
    }

    pub fn apply(&self, update: ProgressUpdate) -> Result<(), SessionError> {
        let ranges = self.ranges;
        let mut outcome = Ok(());
        self.state.send_if_modified(|s| {
            if s.status.is_terminal() {
                outcome = Err(SessionError::Terminal(s.status.to_string()));
                return false;
            }
            match update {
                ProgressUpdate::Stage { status, step } => {
                    if status.is_terminal() || !s.status.can_transition_to(status) {
                        outcome = Err(SessionError::InvalidTransition {
                            from: s.status.to_string(),
                            to: status.to_string(),
                        });
                        return false;
                    }
                    let floor = match status {
                        SessionStatus::Analyzing => ranges.analyzing,
                        SessionStatus::Generating => ranges.generating_start,
                        SessionStatus::Optimizing => ranges.optimizing,
                        _ => s.progress,
                    };
                    s.status = status;
                    s.progress = s.progress.max(floor);
                    s.current_step = step;
                }
                ProgressUpdate::Step(step) => s.current_step = step,
                ProgressUpdate::ClipsPlanned { total } => s.clips_total = total,
                ProgressUpdate::ClipFinished(result) => {
                    s.results.insert(result.index, result);
                    let total = s.clips_total.max(s.results.len());
                    let scaled = ranges.generating(s.results.len(), total);
                    s.progress = s.progress.max(scaled);
                    s.current_step = format!("Generated {}/{} clips", s.results.len(), total);
                }
                ProgressUpdate::Warning(msg) => {
                    warn!(session_id = %self.id, warning = %msg, "session warning");
                    s.warnings.push(msg);
                }
            }
            s.updated_at = Utc::now();
            true
        });
        outcome
    }

    pub fn complete(&self, output: SessionOutput) -> Result<(), SessionError> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|s| {
            if s.status.is_terminal() {
                outcome = Err(SessionError::Terminal(s.status.to_string()));
                return false;
            }
            if s.status != SessionStatus::Optimizing {
                outcome = Err(SessionError::InvalidTransition {
                    from: s.status.to_string(),
                    to: SessionStatus::Completed.to_string(),
                });
                return false;
            }
            s.status = SessionStatus::Completed;
            s.progress = 100;
            s.current_step = "Completed".to_string();
            s.output = Some(output);
            s.updated_at = Utc::now();
            true
        });
        if outcome.is_ok() {
            info!(session_id = %self.id, "session completed");
        }
        outcome
    }

    /// Record an unrecoverable failure. Progress stays where it was.
    pub fn fail(&self, reason: impl Into<String>) -> Result<(), SessionError> {
        let reason = reason.into();
        let mut outcome = Ok(());
        self.state.send_if_modified(|s| {
            if s.status.is_terminal() {
                outcome = Err(SessionError::Terminal(s.status.to_string()));
                return false;
            }
            s.status = SessionStatus::Error;
            s.current_step = "Failed".to_string();
            s.error = Some(reason.clone());
            s.updated_at = Utc::now();
            true
        });
        if outcome.is_ok() {
            warn!(session_id = %self.id, error = %reason, "session failed");
        }
        outcome
    }

    /// Caller-requested termination. Returns false if the session had
    /// already finished.
    pub fn stop(&self) -> bool {
        let stopped = self.state.send_if_modified(|s| {
            if s.status.is_terminal() {
                return false;
            }
            s.status = SessionStatus::Stopped;
            s.current_step = "Stopped".to_string();
            s.updated_at = Utc::now();
            true
        });
        if stopped {
            self.cancel.cancel();
            info!(session_id = %self.id, "session stopped");
        }
        stopped
    }
}

struct Archived {
    snapshot: SessionSnapshot,
    since: Instant,
}

#[derive(Default)]
struct StoreInner {
    active: HashMap<String, Arc<Session>>,
    archived: HashMap<String, Archived>,
}

/// In-memory registry of sessions. Durability belongs to the blob store;
/// this only has to outlive the pollers.
pub struct SessionStore {
    capacity: usize,
    max_age: Duration,
    inner: Mutex<StoreInner>,
}

impl SessionStore {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            max_age,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new session. Only live sessions count against capacity.
    pub fn insert(&self, session: Arc<Session>) -> Result<(), SessionError> {
        let mut inner = self.lock();
        let live = inner
            .active
            .values()
            .filter(|s| !s.status().is_terminal())
            .count();
        if live >= self.capacity {
            return Err(SessionError::CapacityExceeded(self.capacity));
        }
        debug!(session_id = %session.id(), live, "session registered");
        inner.active.insert(session.id().to_string(), session);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().active.get(id).cloned()
    }

    /// Poll a session. A terminal snapshot, once handed out, moves the
    /// session to the archive, where later polls still find it.
    pub fn snapshot(&self, id: &str) -> Result<SessionSnapshot, SessionError> {
        let mut inner = self.lock();
        if let Some(session) = inner.active.get(id) {
            let snapshot = session.snapshot();
            if snapshot.status.is_terminal() {
                inner.active.remove(id);
                inner.archived.insert(
                    id.to_string(),
                    Archived {
                        snapshot: snapshot.clone(),
                        since: Instant::now(),
                    },
                );
                debug!(session_id = id, status = %snapshot.status, "session archived");
            }
            return Ok(snapshot);
        }
        inner
            .archived
            .get(id)
            .map(|a| a.snapshot.clone())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Returns whether this call stopped the session.
    pub fn stop(&self, id: &str) -> Result<bool, SessionError> {
        let inner = self.lock();
        if let Some(session) = inner.active.get(id) {
            return Ok(session.stop());
        }
        if inner.archived.contains_key(id) {
            return Ok(false);
        }
        Err(SessionError::NotFound(id.to_string()))
    }

    /// Stop live sessions older than `max_age` and move them, with any
    /// finished session past that age, into the archive so a final poll
    /// still resolves. Archive entries are dropped one `max_age` after
    /// archiving. Returns the ids that were dropped.
    pub fn evict_expired(&self) -> Vec<String> {
        let mut inner = self.lock();
        let max_age = self.max_age;
        let mut dropped = Vec::new();

        inner.archived.retain(|id, archived| {
            let expired = archived.since.elapsed() >= max_age;
            if expired {
                dropped.push(id.clone());
            }
            !expired
        });

        let mut stale = Vec::new();
        for (id, session) in &inner.active {
            if session.age() < max_age {
                continue;
            }
            if session.stop() {
                warn!(session_id = %id, "session exceeded max age, stopped");
            }
            if session.status().is_terminal() {
                stale.push(id.clone());
            }
        }
        for id in stale {
            if let Some(session) = inner.active.remove(&id) {
                let snapshot = session.snapshot();
                debug!(session_id = %id, status = %snapshot.status, "session archived by sweep");
                inner.archived.insert(
                    id,
                    Archived {
                        snapshot,
                        since: Instant::now(),
                    },
                );
            }
        }

        if !dropped.is_empty() {
            info!(count = dropped.len(), "evicted expired sessions");
        }
        dropped
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn archived_count(&self) -> usize {
        self.lock().archived.len()
    }
}
