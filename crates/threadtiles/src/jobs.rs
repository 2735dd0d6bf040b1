//! Job Tracker
//!
//! Records every stitch-and-tile job so `/health` and the logs can tell what
//! the blocking pool is doing. Execution itself lives in the session manager;
//! this is bookkeeping only.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::types::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::TimedOut)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub session: SessionId,
    pub frames: usize,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    finished: Option<Instant>,
}

impl JobInfo {
    fn new(session: SessionId, frames: usize) -> Self {
        Self {
            id: JobId::new(),
            session,
            frames,
            status: JobStatus::Pending,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            finished: None,
        }
    }

    /// Wall time from start to finish (or to now, while running).
    pub fn duration_secs(&self) -> Option<f64> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some((end - started).num_milliseconds() as f64 / 1000.0)
    }

    fn finish(&mut self, status: JobStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
        self.finished = Some(Instant::now());
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

/// Registry of stitch jobs.
#[derive(Debug, Default)]
pub struct JobTracker {
    jobs: DashMap<JobId, JobInfo>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_job(&self, session: SessionId, frames: usize) -> JobId {
        let info = JobInfo::new(session, frames);
        let id = info.id;
        self.jobs.insert(id, info);

        tracing::info!(
            job.id = %id,
            session.id = %session,
            job.frames = frames,
            "Job created"
        );

        id
    }

    pub fn mark_running(&self, id: JobId) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            tracing::info!(job.id = %id, session.id = %job.session, "Job started");
        }
    }

    pub fn mark_complete(&self, id: JobId) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            job.finish(JobStatus::Complete, None);
            tracing::info!(
                job.id = %id,
                session.id = %job.session,
                job.duration_secs = ?job.duration_secs(),
                "Job completed successfully"
            );
        }
    }

    pub fn mark_failed(&self, id: JobId, error: String) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            tracing::error!(
                job.id = %id,
                session.id = %job.session,
                job.duration_secs = ?job.duration_secs(),
                job.error = %error,
                "Job failed"
            );
            job.finish(JobStatus::Failed, Some(error));
        }
    }

    pub fn mark_timed_out(&self, id: JobId, limit: Duration) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            tracing::warn!(
                job.id = %id,
                session.id = %job.session,
                job.timeout_secs = limit.as_secs(),
                "Job timed out"
            );
            job.finish(
                JobStatus::TimedOut,
                Some(format!("exceeded {}s", limit.as_secs())),
            );
        }
    }

    pub fn get(&self, id: JobId) -> Option<JobInfo> {
        self.jobs.get(&id).map(|j| j.clone())
    }

    /// Forget finished jobs older than `retention`.
    pub fn prune(&self, retention: Duration) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| match job.finished {
            Some(at) => at.elapsed() < retention,
            None => true,
        });
        before - self.jobs.len()
    }

    pub fn stats(&self) -> JobStats {
        let mut stats = JobStats::default();
        for job in self.jobs.iter() {
            stats.total += 1;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Complete => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::TimedOut => stats.timed_out += 1,
            }
        }
        stats
    }
}
