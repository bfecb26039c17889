use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Failure reported by an external generation backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Rate limiting, timeouts, connection resets. Worth another attempt.
    #[error("transient backend error: {0}")]
    Transient(String),
    /// Rejected prompt or content, malformed spec. Fails identically on retry.
    #[error("permanent backend error: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify an HTTP status the way rate-limited vendor APIs report them.
    /// The message carries only the status line; the response body goes to
    /// the debug log.
    pub fn from_status(status: u16, body: &str) -> Self {
        if !body.is_empty() {
            let snippet: String = body.chars().take(200).collect();
            debug!(status, body = %snippet, "backend error response");
        }
        let reason = reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("unknown status");
        let msg = format!("HTTP {status} ({reason})");
        match status {
            408 | 425 | 429 | 500..=599 => Self::Transient(msg),
            _ => Self::Permanent(msg),
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            return Self::Transient(err.to_string());
        }
        match err.status() {
            Some(status) => Self::from_status(status.as_u16(), ""),
            None => Self::Transient(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrimError {
    /// Zero voiced frames. Fatal for the clip; regenerating is the caller's call.
    #[error("no voice detected in {duration_s:.2}s of audio")]
    NoVoiceDetected { duration_s: f64 },
    #[error("invalid trim input: {0}")]
    InvalidInput(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AssemblyError {
    #[error("assembly contract violation: {0}")]
    ContractViolation(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid blob key: {0}")]
    InvalidKey(String),
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{tool} failed: {detail}")]
    CommandFailed { tool: &'static str, detail: String },
    #[error("invalid media: {0}")]
    InvalidMedia(String),
    #[error("media io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("session already terminal ({0})")]
    Terminal(String),
    #[error("session store at capacity ({0} active sessions)")]
    CapacityExceeded(usize),
    #[error("session deadline of {0:?} exceeded with pending work")]
    TimeoutExceeded(Duration),
}

/// Umbrella error for the end-to-end generation flow.
#[derive(Debug, Error)]
pub enum StudioError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Trim(#[from] TrimError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("no usable clips were generated ({failed} failed)")]
    NoUsableClips { failed: usize },
}

pub type StudioResult<T> = Result<T, StudioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(BackendError::from_status(429, "slow down").is_transient());
        assert!(BackendError::from_status(503, "").is_transient());
        assert!(!BackendError::from_status(400, "bad prompt").is_transient());
        assert!(!BackendError::from_status(422, "content rejected").is_transient());
    }

    #[test]
    fn status_message_leaves_out_response_body() {
        let body = r#"{"error": "quota exceeded for account acct_9f2"}"#;
        let BackendError::Transient(msg) = BackendError::from_status(429, body) else {
            panic!("expected transient");
        };
        assert_eq!(msg, "HTTP 429 (Too Many Requests)");
        assert!(!msg.contains("acct_9f2"));

        let BackendError::Permanent(msg) = BackendError::from_status(422, "prompt flagged") else {
            panic!("expected permanent");
        };
        assert_eq!(msg, "HTTP 422 (Unprocessable Entity)");
    }
}
