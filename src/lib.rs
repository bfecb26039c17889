pub mod api;
pub mod clip;
pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod generator;
pub mod init;
pub mod orchestrator;
pub mod retry;
pub mod session;
pub mod storage;
pub mod timeline;
pub mod vad;

pub use clip::{ClipKind, ClipResult, ClipSpec, GenerationRequest};
pub use config::Config;
pub use error::{StudioError, StudioResult};
pub use generator::Studio;
pub use session::{SessionSnapshot, SessionStatus};
