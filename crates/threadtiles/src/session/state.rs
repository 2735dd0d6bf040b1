//! Capture session lifecycle.
//!
//! ```text
//! Created ──upload──▶ Collecting ──complete──▶ Completing ──▶ Ready
//!    │                    │                        │
//!    ├──────────┬─────────┘                        └────────▶ Failed
//!    │          └──────────── count mismatch ───────────────▶ Failed
//!    └─ idle ──▶ Expired
//! ```
//!
//! Every transition goes through a method on [`CaptureSession`] that either
//! applies it or returns an error without touching the session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::SessionError;
use crate::pyramid::Manifest;
use crate::types::{Platform, SessionId};

/// Most missing frame indices listed in a [`SessionFailure::FrameCountMismatch`].
pub const MAX_LISTED_MISSING: usize = 100;

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionFailure {
    #[error("declared {declared} frames but {stored} stored ({missing_count} missing)")]
    FrameCountMismatch {
        declared: u32,
        stored: u32,
        /// How many of `1..=declared` were never uploaded.
        missing_count: u32,
        /// The lowest missing indices, capped at [`MAX_LISTED_MISSING`].
        missing: Vec<u32>,
    },

    #[error("stitching failed: {reason}")]
    Stitch { reason: String },

    #[error("pyramid build failed: {reason}")]
    Pyramid { reason: String },

    #[error("tile storage failed: {reason}")]
    Storage { reason: String },

    #[error("processing exceeded {limit_secs}s")]
    Timeout { limit_secs: u64 },

    #[error("processing aborted: {reason}")]
    Aborted { reason: String },
}

/// Session lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Collecting,
    Completing,
    Ready { manifest: Manifest },
    Failed { cause: SessionFailure },
    Expired { idle_secs: u64 },
}

/// State discriminant, for logging, stats and watch notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Created,
    Collecting,
    Completing,
    Ready,
    Failed,
    Expired,
}

impl StateKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Collecting => "collecting",
            Self::Completing => "completing",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SessionState {
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Created => StateKind::Created,
            Self::Collecting => StateKind::Collecting,
            Self::Completing => StateKind::Completing,
            Self::Ready { .. } => StateKind::Ready,
            Self::Failed { .. } => StateKind::Failed,
            Self::Expired { .. } => StateKind::Expired,
        }
    }
}

/// Internal transitions, named in `InvalidTransition` errors. Client
/// operations on a closed session get the more specific errors instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Finish,
    Fail,
    Expire,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Finish => "finish",
            Self::Fail => "fail",
            Self::Expire => "expire",
        };
        f.write_str(name)
    }
}

/// Details supplied when the client completes a capture.
#[derive(Debug, Clone, Default)]
pub struct CompletionDetails {
    pub total_frames: u32,
    pub platform: Platform,
    pub source_url: Option<String>,
    pub analyze: bool,
}

#[derive(Debug, Clone)]
pub struct CaptureSession {
    id: SessionId,
    state: SessionState,
    total_frames: Option<u32>,
    platform: Platform,
    source_url: Option<String>,
    analyze: bool,
    frames_stored: usize,
    created_at: DateTime<Utc>,
    last_activity: Instant,
    finished_at: Option<Instant>,
}

impl CaptureSession {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            state: SessionState::Created,
            total_frames: None,
            platform: Platform::Unknown,
            source_url: None,
            analyze: false,
            frames_stored: 0,
            created_at: Utc::now(),
            last_activity: Instant::now(),
            finished_at: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn kind(&self) -> StateKind {
        self.state.kind()
    }

    pub fn total_frames(&self) -> Option<u32> {
        self.total_frames
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn source_url(&self) -> Option<&str> {
        self.source_url.as_deref()
    }

    pub fn analyze(&self) -> bool {
        self.analyze
    }

    /// Distinct frame indices accepted so far.
    pub fn frames_stored(&self) -> usize {
        self.frames_stored
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Time spent in a terminal state, if the session has reached one.
    pub fn since_finished(&self) -> Option<Duration> {
        self.finished_at.map(|at| at.elapsed())
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Reject operations that only collecting sessions accept.
    pub fn ensure_collecting(&self) -> Result<(), SessionError> {
        match self.kind() {
            StateKind::Created | StateKind::Collecting => Ok(()),
            StateKind::Expired => Err(SessionError::Expired(self.id)),
            state => Err(SessionError::AlreadyCompleted { id: self.id, state }),
        }
    }

    /// `Created | Collecting → Collecting`, after a frame was accepted.
    pub fn record_upload(&mut self, frames_stored: usize) -> Result<(), SessionError> {
        self.ensure_collecting()?;
        self.state = SessionState::Collecting;
        self.frames_stored = frames_stored;
        self.touch();
        Ok(())
    }

    /// `Created | Collecting → Completing`.
    pub fn begin_completing(&mut self, details: CompletionDetails) -> Result<(), SessionError> {
        self.ensure_collecting()?;
        self.apply_details(details);
        self.state = SessionState::Completing;
        self.touch();
        Ok(())
    }

    /// Record the completion request without starting a job, for sessions
    /// that fail validation.
    pub fn apply_details(&mut self, details: CompletionDetails) {
        self.total_frames = Some(details.total_frames);
        self.platform = details.platform;
        self.source_url = details.source_url;
        self.analyze = details.analyze;
    }

    /// `Completing → Ready`.
    pub fn finish(&mut self, manifest: Manifest) -> Result<(), SessionError> {
        match self.kind() {
            StateKind::Completing => {
                self.state = SessionState::Ready { manifest };
                self.finished_at = Some(Instant::now());
                Ok(())
            }
            from => Err(self.invalid(from, Operation::Finish)),
        }
    }

    /// `Created | Collecting | Completing → Failed`.
    pub fn fail(&mut self, cause: SessionFailure) -> Result<(), SessionError> {
        match self.kind() {
            StateKind::Created | StateKind::Collecting | StateKind::Completing => {
                self.state = SessionState::Failed { cause };
                self.finished_at = Some(Instant::now());
                Ok(())
            }
            from => Err(self.invalid(from, Operation::Fail)),
        }
    }

    /// `Created | Collecting → Expired`.
    pub fn expire(&mut self, idle_limit: Duration) -> Result<(), SessionError> {
        match self.kind() {
            StateKind::Created | StateKind::Collecting => {
                self.state = SessionState::Expired {
                    idle_secs: idle_limit.as_secs(),
                };
                self.finished_at = Some(Instant::now());
                Ok(())
            }
            from => Err(self.invalid(from, Operation::Expire)),
        }
    }

    fn invalid(&self, from: StateKind, operation: Operation) -> SessionError {
        SessionError::InvalidTransition {
            id: self.id,
            from,
            operation,
        }
    }

    pub fn status(&self) -> SessionStatus {
        let (manifest, failure) = match &self.state {
            SessionState::Ready { manifest } => (Some(manifest.clone()), None),
            SessionState::Failed { cause } => (None, Some(cause.clone())),
            _ => (None, None),
        };
        SessionStatus {
            session_id: self.id,
            state: self.kind(),
            frames_stored: self.frames_stored,
            total_frames: self.total_frames,
            platform: self.platform,
            created_at: self.created_at,
            manifest,
            failure,
        }
    }
}

/// Client-facing snapshot of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub state: StateKind,
    pub frames_stored: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_frames: Option<u32>,
    pub platform: Platform,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Manifest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<SessionFailure>,
}
