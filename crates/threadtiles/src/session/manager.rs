//! Session manager
//!
//! Owns every live [`CaptureSession`]. Sessions sit in a sharded `DashMap`,
//! each behind its own mutex, so uploads to one session never wait on
//! another. Completion hands the session's frames to a job on the blocking
//! pool; the job's outcome is published on a per-session `watch` channel.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use threadconf::{PyramidConfig, StitchConfig, ThreadConfig};
use tilestore::TileStore;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::hook::{AnalysisHook, AnalysisRequest};
use super::state::{
    CaptureSession, CompletionDetails, SessionFailure, SessionStatus, StateKind, MAX_LISTED_MISSING,
};
use super::{SessionError, SessionState};
use crate::frames::{FrameLimits, FrameRecord, FrameStore, FrameStoreStats, PutOutcome};
use crate::jobs::{JobId, JobTracker};
use crate::pyramid::{Manifest, PyramidBuilder, PyramidError};
use crate::stitch::{self, Alignment, StitchError};
use crate::types::SessionId;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub limits: FrameLimits,
    pub idle_timeout: Duration,
    pub retention: Duration,
    pub job_timeout: Duration,
    pub stitch: StitchConfig,
    pub pyramid: PyramidConfig,
}

impl ManagerConfig {
    pub fn from_config(config: &ThreadConfig) -> Self {
        Self {
            limits: FrameLimits {
                max_frames: config.sessions.max_frames,
                max_frame_bytes: config.sessions.max_frame_bytes,
            },
            idle_timeout: config.sessions.idle_timeout(),
            retention: config.sessions.retention(),
            job_timeout: config.jobs.timeout(),
            stitch: config.stitch.clone(),
            pyramid: config.pyramid.clone(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_config(&ThreadConfig::default())
    }
}

/// One frame as received from the client, before it becomes a record.
#[derive(Debug, Clone)]
pub struct FrameUpload {
    pub index: u32,
    pub bytes: Vec<u8>,
    pub viewport_height: u32,
    pub scroll_position: u32,
    pub captured_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub session_id: SessionId,
    pub frame_number: u32,
    pub replaced: bool,
    pub frames_stored: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub created: usize,
    pub collecting: usize,
    pub completing: usize,
    pub ready: usize,
    pub failed: usize,
    pub expired: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired: usize,
    pub pruned: usize,
    pub jobs_pruned: usize,
}

struct SessionSlot {
    session: Mutex<CaptureSession>,
    state: watch::Sender<StateKind>,
}

impl SessionSlot {
    fn new(session: CaptureSession) -> Self {
        let (state, _) = watch::channel(session.kind());
        Self {
            session: Mutex::new(session),
            state,
        }
    }

    /// A panicked job can poison the lock; the session itself is still
    /// consistent because transitions are single assignments.
    fn lock(&self) -> MutexGuard<'_, CaptureSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, kind: StateKind) {
        self.state.send_replace(kind);
    }
}

struct Inner {
    sessions: DashMap<SessionId, Arc<SessionSlot>>,
    frames: Arc<dyn FrameStore>,
    tiles: Arc<dyn TileStore>,
    jobs: JobTracker,
    hook: Arc<dyn AnalysisHook>,
    builder: PyramidBuilder,
    config: ManagerConfig,
}

/// Handle to the session registry. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        config: ManagerConfig,
        frames: Arc<dyn FrameStore>,
        tiles: Arc<dyn TileStore>,
        hook: Arc<dyn AnalysisHook>,
    ) -> Result<Self, PyramidError> {
        let builder = PyramidBuilder::new(config.pyramid.clone())?;
        Ok(Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                frames,
                tiles,
                jobs: JobTracker::new(),
                hook,
                builder,
                config,
            }),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn jobs(&self) -> &JobTracker {
        &self.inner.jobs
    }

    pub fn tile_store(&self) -> Arc<dyn TileStore> {
        Arc::clone(&self.inner.tiles)
    }

    pub fn frame_stats(&self) -> FrameStoreStats {
        self.inner.frames.stats()
    }

    fn slot(&self, id: SessionId) -> Result<Arc<SessionSlot>, SessionError> {
        // Clone out of the map so no shard lock is held while the session is
        // locked.
        self.inner
            .sessions
            .get(&id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub fn create(&self) -> SessionStatus {
        let id = SessionId::new();
        let session = CaptureSession::new(id);
        let status = session.status();
        self.inner
            .sessions
            .insert(id, Arc::new(SessionSlot::new(session)));
        tracing::info!(session.id = %id, "Session created");
        status
    }

    pub fn upload_frame(
        &self,
        id: SessionId,
        upload: FrameUpload,
    ) -> Result<UploadReceipt, SessionError> {
        let slot = self.slot(id)?;
        let mut session = slot.lock();
        session.ensure_collecting()?;
        self.inner
            .config
            .limits
            .check(upload.index, upload.bytes.len())?;

        let index = upload.index;
        let outcome = self.inner.frames.put(
            id,
            FrameRecord {
                index,
                bytes: upload.bytes,
                viewport_height: upload.viewport_height,
                scroll_position: upload.scroll_position,
                captured_at: upload.captured_at,
                received_at: Utc::now(),
            },
        );
        let frames_stored = self.inner.frames.count(id);

        let was = session.kind();
        session.record_upload(frames_stored)?;
        if was != StateKind::Collecting {
            slot.publish(StateKind::Collecting);
        }

        tracing::debug!(
            session.id = %id,
            frame.index = index,
            frames_stored,
            replaced = outcome == PutOutcome::Replaced,
            "Frame stored"
        );

        Ok(UploadReceipt {
            session_id: id,
            frame_number: index,
            replaced: outcome == PutOutcome::Replaced,
            frames_stored,
        })
    }

    /// Close the session to uploads and start stitching.
    ///
    /// Stored indices must be exactly `1..=total_frames`; otherwise the
    /// session fails immediately and its frames are dropped. With `wait` the
    /// call returns once the job has settled, else as soon as it is queued.
    pub async fn complete(
        &self,
        id: SessionId,
        details: CompletionDetails,
        wait: bool,
    ) -> Result<SessionStatus, SessionError> {
        let slot = self.slot(id)?;
        let mut settled = slot.state.subscribe();

        let (frames, job) = {
            let mut session = slot.lock();
            session.ensure_collecting()?;

            let declared = details.total_frames;
            let indices = self.inner.frames.indices(id);
            if !indices.iter().copied().eq(1..=declared) {
                // Each stored index can skip at most one candidate, so this
                // stops within `stored + MAX_LISTED_MISSING` steps.
                let missing: Vec<u32> = (1..=declared)
                    .filter(|i| indices.binary_search(i).is_err())
                    .take(MAX_LISTED_MISSING)
                    .collect();
                let present = indices
                    .iter()
                    .filter(|i| (1..=declared).contains(*i))
                    .count() as u32;
                let cause = SessionFailure::FrameCountMismatch {
                    declared,
                    stored: indices.len() as u32,
                    missing_count: declared - present,
                    missing,
                };
                tracing::warn!(session.id = %id, error = %cause, "Completion rejected");

                session.apply_details(details);
                session.fail(cause)?;
                self.inner.frames.discard(id);
                slot.publish(StateKind::Failed);
                return Ok(session.status());
            }

            session.begin_completing(details)?;
            slot.publish(StateKind::Completing);
            let frames = self.inner.frames.take(id);
            let job = self.inner.jobs.create_job(id, frames.len());
            tracing::info!(
                session.id = %id,
                job.id = %job,
                platform = %session.platform(),
                frames = frames.len(),
                "Session completing"
            );
            (frames, job)
        };

        tokio::spawn(run_job(
            Arc::clone(&self.inner),
            Arc::clone(&slot),
            id,
            job,
            frames,
        ));

        if wait {
            // The slot (and its sender) is held here, so this only returns
            // once the state is terminal.
            let _ = settled.wait_for(StateKind::is_terminal).await;
        }

        let status = slot.lock().status();
        Ok(status)
    }

    /// Wait until a session reaches a terminal state.
    pub async fn wait_settled(&self, id: SessionId) -> Result<SessionStatus, SessionError> {
        let slot = self.slot(id)?;
        let mut settled = slot.state.subscribe();
        let _ = settled.wait_for(StateKind::is_terminal).await;
        let status = slot.lock().status();
        Ok(status)
    }

    pub fn status(&self, id: SessionId) -> Result<SessionStatus, SessionError> {
        let slot = self.slot(id)?;
        let status = slot.lock().status();
        Ok(status)
    }

    /// Current state, or `None` if the session is unknown or pruned.
    pub fn state(&self, id: SessionId) -> Option<SessionState> {
        let slot = self.slot(id).ok()?;
        let state = slot.lock().state().clone();
        Some(state)
    }

    /// Expire idle sessions and drop terminal ones past retention.
    pub fn cleanup(&self) -> CleanupReport {
        let idle_timeout = self.inner.config.idle_timeout;
        let retention = self.inner.config.retention;
        let mut report = CleanupReport::default();

        let slots: Vec<(SessionId, Arc<SessionSlot>)> = self
            .inner
            .sessions
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        for (id, slot) in slots {
            let mut session = slot.lock();
            match session.kind() {
                StateKind::Created | StateKind::Collecting if session.idle() >= idle_timeout => {
                    if session.expire(idle_timeout).is_ok() {
                        let dropped = self.inner.frames.discard(id);
                        slot.publish(StateKind::Expired);
                        report.expired += 1;
                        tracing::info!(
                            session.id = %id,
                            frames = dropped,
                            idle_secs = session.idle().as_secs(),
                            "Session expired"
                        );
                    }
                }
                kind if kind.is_terminal()
                    && session.since_finished().is_some_and(|d| d >= retention) =>
                {
                    drop(session);
                    if self.inner.sessions.remove(&id).is_some() {
                        report.pruned += 1;
                        tracing::debug!(session.id = %id, state = %kind, "Session pruned");
                    }
                }
                _ => {}
            }
        }

        report.jobs_pruned = self.inner.jobs.prune(retention);

        if report.expired > 0 || report.pruned > 0 {
            tracing::info!(
                expired = report.expired,
                pruned = report.pruned,
                remaining = self.inner.sessions.len(),
                "Session cleanup completed"
            );
        }

        report
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = SessionStats::default();
        for entry in self.inner.sessions.iter() {
            stats.total += 1;
            match entry.value().lock().kind() {
                StateKind::Created => stats.created += 1,
                StateKind::Collecting => stats.collecting += 1,
                StateKind::Completing => stats.completing += 1,
                StateKind::Ready => stats.ready += 1,
                StateKind::Failed => stats.failed += 1,
                StateKind::Expired => stats.expired += 1,
            }
        }
        stats
    }
}

/// Drive one stitch job: run it on the blocking pool under the job timeout,
/// then settle the session.
async fn run_job(
    inner: Arc<Inner>,
    slot: Arc<SessionSlot>,
    id: SessionId,
    job: JobId,
    frames: Vec<FrameRecord>,
) {
    inner.jobs.mark_running(job);
    let limit = inner.config.job_timeout;
    let cancel = CancellationToken::new();

    let mut work = {
        let inner = Arc::clone(&inner);
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || render(&inner, id, frames, &cancel))
    };

    let waited = tokio::time::timeout(limit, &mut work).await;
    let outcome = match waited {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => {
            let tiles = Arc::clone(&inner.tiles);
            let _ = tokio::task::spawn_blocking(move || discard_tiles(tiles.as_ref(), id)).await;
            Err(SessionFailure::Aborted {
                reason: join_error.to_string(),
            })
        }
        Err(_) => {
            // The blocking task cannot be aborted; ask it to stop and sweep
            // whatever it wrote once it has.
            cancel.cancel();
            let tiles = Arc::clone(&inner.tiles);
            tokio::spawn(async move {
                let _ = work.await;
                let _ = tokio::task::spawn_blocking(move || discard_tiles(tiles.as_ref(), id)).await;
            });
            Err(SessionFailure::Timeout {
                limit_secs: limit.as_secs(),
            })
        }
    };

    settle(&inner, &slot, id, job, outcome);
}

fn settle(
    inner: &Inner,
    slot: &SessionSlot,
    id: SessionId,
    job: JobId,
    outcome: Result<Manifest, SessionFailure>,
) {
    let mut session = slot.lock();
    match outcome {
        Ok(manifest) => {
            if let Err(e) = session.finish(manifest.clone()) {
                tracing::warn!(session.id = %id, error = %e, "Discarding job result");
                return;
            }
            inner.jobs.mark_complete(job);
            slot.publish(StateKind::Ready);
            tracing::info!(
                session.id = %id,
                width = manifest.width,
                height = manifest.height,
                levels = manifest.level_count,
                tiles = manifest.tile_count(),
                "Session ready"
            );

            if session.analyze() {
                let request = AnalysisRequest {
                    session: id,
                    platform: session.platform(),
                    source_url: session.source_url().map(str::to_string),
                    manifest,
                };
                let hook = Arc::clone(&inner.hook);
                tokio::spawn(async move {
                    if let Err(e) = hook.notify(request).await {
                        tracing::warn!(session.id = %id, error = %e, "Analysis hook failed");
                    }
                });
            }
        }
        Err(cause) => {
            match &cause {
                SessionFailure::Timeout { .. } => {
                    inner.jobs.mark_timed_out(job, inner.config.job_timeout)
                }
                other => inner.jobs.mark_failed(job, other.to_string()),
            }
            if let Err(e) = session.fail(cause) {
                tracing::warn!(session.id = %id, error = %e, "Could not record job failure");
                return;
            }
            slot.publish(StateKind::Failed);
        }
    }
}

/// Stitch, tile and persist. Runs on the blocking pool. On failure the
/// session's partial tiles are removed before returning.
fn render(
    inner: &Inner,
    id: SessionId,
    frames: Vec<FrameRecord>,
    cancel: &CancellationToken,
) -> Result<Manifest, SessionFailure> {
    let result = render_inner(inner, id, frames, cancel);
    if result.is_err() {
        discard_tiles(inner.tiles.as_ref(), id);
    }
    result
}

fn render_inner(
    inner: &Inner,
    id: SessionId,
    frames: Vec<FrameRecord>,
    cancel: &CancellationToken,
) -> Result<Manifest, SessionFailure> {
    let started = Instant::now();
    let output = stitch::stitch(&frames, &inner.config.stitch, cancel).map_err(|e| match e {
        StitchError::Cancelled => SessionFailure::Aborted {
            reason: e.to_string(),
        },
        other => SessionFailure::Stitch {
            reason: other.to_string(),
        },
    })?;
    drop(frames);

    let coarse = output
        .placements
        .iter()
        .filter(|p| p.alignment == Alignment::Coarse)
        .count();
    tracing::info!(
        session.id = %id,
        width = output.composite.width(),
        height = output.composite.height(),
        frames = output.placements.len(),
        coarse_fallbacks = coarse,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Composite stitched"
    );

    let key = id.key();
    let tiles = inner.tiles.as_ref();

    // Re-stitching replaces, never patches
    tiles.remove_session(&key).map_err(storage_failure)?;

    let mime_type = inner.builder.config().format.mime_type();
    let manifest = inner
        .builder
        .build_with(output.composite, cancel, |tile| {
            tiles
                .put_tile(&key, tile.address, &tile.bytes, mime_type)
                .map(|_| ())
        })
        .map_err(|e| match e {
            PyramidError::Sink { .. } => SessionFailure::Storage {
                reason: e.to_string(),
            },
            PyramidError::Cancelled => SessionFailure::Aborted {
                reason: e.to_string(),
            },
            other => SessionFailure::Pyramid {
                reason: other.to_string(),
            },
        })?;

    if cancel.is_cancelled() {
        return Err(SessionFailure::Aborted {
            reason: "cancelled before manifest commit".to_string(),
        });
    }

    let manifest_json = serde_json::to_vec(&manifest).map_err(|e| SessionFailure::Storage {
        reason: e.to_string(),
    })?;
    tiles
        .put_manifest(&key, &manifest_json)
        .map_err(storage_failure)?;

    tracing::info!(
        session.id = %id,
        levels = manifest.level_count,
        tiles = manifest.tile_count(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Pyramid stored"
    );

    Ok(manifest)
}

fn storage_failure(e: anyhow::Error) -> SessionFailure {
    SessionFailure::Storage {
        reason: format!("{e:#}"),
    }
}

fn discard_tiles(tiles: &dyn TileStore, id: SessionId) {
    if let Err(e) = tiles.remove_session(&id.key()) {
        tracing::warn!(session.id = %id, error = %e, "Failed to remove partial tiles");
    }
}

/// Spawn a background task that periodically expires and prunes sessions.
pub fn spawn_cleanup_task(
    manager: SessionManager,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Session cleanup task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    manager.cleanup();
                }
            }
        }
    })
}
