//! Capture sessions: lifecycle, frame collection and the stitch job.

mod hook;
mod manager;
mod state;

pub use hook::{AnalysisHook, AnalysisRequest, LoggingAnalysisHook};
pub use manager::{
    spawn_cleanup_task, CleanupReport, FrameUpload, ManagerConfig, SessionManager, SessionStats,
    UploadReceipt,
};
pub use state::{
    CaptureSession, CompletionDetails, Operation, SessionFailure, SessionState, SessionStatus,
    StateKind,
};

use thiserror::Error;

use crate::frames::FrameError;
use crate::types::SessionId;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {id} is already {state}")]
    AlreadyCompleted { id: SessionId, state: StateKind },

    #[error("session {0} has expired")]
    Expired(SessionId),

    #[error("cannot {operation} session {id} while it is {from}")]
    InvalidTransition {
        id: SessionId,
        from: StateKind,
        operation: Operation,
    },

    #[error(transparent)]
    Frame(#[from] FrameError),
}
