//! Post-processing notification for sessions completed with `analyze`.
//!
//! Conversation analysis is a separate service; threadtiles only tells it a
//! pyramid exists. Notification runs on its own task after the session is
//! already `Ready` and its outcome never changes session state.

use async_trait::async_trait;
use serde::Serialize;

use crate::pyramid::Manifest;
use crate::types::{Platform, SessionId};

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest {
    pub session: SessionId,
    pub platform: Platform,
    pub source_url: Option<String>,
    pub manifest: Manifest,
}

#[async_trait]
pub trait AnalysisHook: Send + Sync {
    async fn notify(&self, request: AnalysisRequest) -> anyhow::Result<()>;
}

/// Records the request in the logs and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAnalysisHook;

#[async_trait]
impl AnalysisHook for LoggingAnalysisHook {
    async fn notify(&self, request: AnalysisRequest) -> anyhow::Result<()> {
        tracing::info!(
            session.id = %request.session,
            platform = %request.platform,
            source_url = request.source_url.as_deref().unwrap_or(""),
            width = request.manifest.width,
            height = request.manifest.height,
            "Analysis requested"
        );
        Ok(())
    }
}
