//! Frame Store
//!
//! Buffers raw uploaded frames for sessions that are still collecting. Frames
//! are kept ordered by index, not arrival, and handed off as one batch when
//! the session completes.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::types::SessionId;

/// One uploaded viewport capture.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    /// 1-based position in the capture sequence.
    pub index: u32,

    /// Encoded image as uploaded (PNG, JPEG or WebP).
    pub bytes: Vec<u8>,

    /// Viewport height in CSS pixels at capture time.
    pub viewport_height: u32,

    /// Scroll offset from the top of the page in CSS pixels.
    pub scroll_position: u32,

    /// Client capture timestamp, if sent.
    pub captured_at: Option<DateTime<Utc>>,

    pub received_at: DateTime<Utc>,
}

/// Whether a put stored a new frame or replaced an earlier upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    Replaced,
}

/// Client input errors for a single frame. The session stays collecting.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame index must be between 1 and {max}, got {index}")]
    InvalidIndex { index: u32, max: u32 },

    #[error("frame {index} is {size} bytes, the limit is {max}")]
    TooLarge { index: u32, size: usize, max: usize },

    #[error("frame {index} has no image data")]
    Empty { index: u32 },
}

/// Per-frame acceptance limits.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_frames: u32,
    pub max_frame_bytes: usize,
}

impl FrameLimits {
    pub fn check(&self, index: u32, size: usize) -> Result<(), FrameError> {
        if index == 0 || index > self.max_frames {
            return Err(FrameError::InvalidIndex {
                index,
                max: self.max_frames,
            });
        }
        if size == 0 {
            return Err(FrameError::Empty { index });
        }
        if size > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                index,
                size,
                max: self.max_frame_bytes,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameStoreStats {
    pub sessions: usize,
    pub frames: usize,
    pub bytes: usize,
}

/// Storage for in-flight frames.
///
/// Callers serialize access per session; implementations only need to be
/// safe across sessions.
pub trait FrameStore: Send + Sync {
    /// Store a frame. A second upload of the same index replaces the first.
    fn put(&self, session: SessionId, frame: FrameRecord) -> PutOutcome;

    /// Stored indices in ascending order.
    fn indices(&self, session: SessionId) -> Vec<u32>;

    fn count(&self, session: SessionId) -> usize;

    /// Remove and return every frame of a session, ordered by index.
    fn take(&self, session: SessionId) -> Vec<FrameRecord>;

    /// Drop a session's frames. Returns how many were dropped.
    fn discard(&self, session: SessionId) -> usize;

    fn stats(&self) -> FrameStoreStats;
}

/// In-memory frame store using DashMap.
#[derive(Debug, Default)]
pub struct MemoryFrameStore {
    frames: DashMap<SessionId, BTreeMap<u32, FrameRecord>>,
}

impl MemoryFrameStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameStore for MemoryFrameStore {
    fn put(&self, session: SessionId, frame: FrameRecord) -> PutOutcome {
        let index = frame.index;
        let mut entry = self.frames.entry(session).or_default();
        match entry.insert(index, frame) {
            Some(_) => {
                tracing::debug!(session.id = %session, frame.index = index, "Frame replaced");
                PutOutcome::Replaced
            }
            None => PutOutcome::Stored,
        }
    }

    fn indices(&self, session: SessionId) -> Vec<u32> {
        self.frames
            .get(&session)
            .map(|frames| frames.keys().copied().collect())
            .unwrap_or_default()
    }

    fn count(&self, session: SessionId) -> usize {
        self.frames.get(&session).map(|f| f.len()).unwrap_or(0)
    }

    fn take(&self, session: SessionId) -> Vec<FrameRecord> {
        self.frames
            .remove(&session)
            .map(|(_, frames)| frames.into_values().collect())
            .unwrap_or_default()
    }

    fn discard(&self, session: SessionId) -> usize {
        let dropped = self
            .frames
            .remove(&session)
            .map(|(_, frames)| frames.len())
            .unwrap_or(0);
        if dropped > 0 {
            tracing::debug!(session.id = %session, frames = dropped, "Frames discarded");
        }
        dropped
    }

    fn stats(&self) -> FrameStoreStats {
        let mut stats = FrameStoreStats::default();
        for entry in self.frames.iter() {
            stats.sessions += 1;
            stats.frames += entry.value().len();
            stats.bytes += entry.value().values().map(|f| f.bytes.len()).sum::<usize>();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(index: u32, byte: u8) -> FrameRecord {
        FrameRecord {
            index,
            bytes: vec![byte; 4],
            viewport_height: 600,
            scroll_position: (index - 1) * 500,
            captured_at: None,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_frames_are_ordered_by_index_not_arrival() {
        let store = MemoryFrameStore::new();
        let session = SessionId::new();

        store.put(session, frame(3, 3));
        store.put(session, frame(1, 1));
        store.put(session, frame(2, 2));

        assert_eq!(store.indices(session), vec![1, 2, 3]);
        let taken: Vec<u32> = store.take(session).iter().map(|f| f.index).collect();
        assert_eq!(taken, vec![1, 2, 3]);
        assert_eq!(store.count(session), 0);
    }

    #[test]
    fn test_duplicate_index_overwrites() {
        let store = MemoryFrameStore::new();
        let session = SessionId::new();

        assert_eq!(store.put(session, frame(1, 0xaa)), PutOutcome::Stored);
        assert_eq!(store.put(session, frame(1, 0xbb)), PutOutcome::Replaced);

        let frames = store.take(session);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes, vec![0xbb; 4]);
    }

    #[test]
    fn test_sessions_are_isolated() {
        let store = MemoryFrameStore::new();
        let a = SessionId::new();
        let b = SessionId::new();

        store.put(a, frame(1, 1));
        store.put(b, frame(1, 2));
        store.put(b, frame(2, 2));

        assert_eq!(store.discard(a), 1);
        assert_eq!(store.count(a), 0);
        assert_eq!(store.count(b), 2);

        let stats = store.stats();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.bytes, 8);
    }

    #[test]
    fn test_frame_limits() {
        let limits = FrameLimits {
            max_frames: 10,
            max_frame_bytes: 100,
        };
        assert!(limits.check(1, 50).is_ok());
        assert_eq!(
            limits.check(0, 50),
            Err(FrameError::InvalidIndex { index: 0, max: 10 })
        );
        assert_eq!(
            limits.check(11, 50),
            Err(FrameError::InvalidIndex { index: 11, max: 10 })
        );
        assert_eq!(limits.check(2, 0), Err(FrameError::Empty { index: 2 }));
        assert_eq!(
            limits.check(2, 101),
            Err(FrameError::TooLarge {
                index: 2,
                size: 101,
                max: 100
            })
        );
    }
}
