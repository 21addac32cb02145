use crate::cv_utils::CvImage;
use bytes::Bytes;
use opencv::core::Mat;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    path::PathBuf,
    time::{Duration, Instant},
};
use thiserror::Error;

const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_STATUS_RETENTION: usize = 100;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No files uploaded")]
    NoFiles,
    #[error("Invalid width or height")]
    InvalidDimensions,
    #[error("Invalid total frame count")]
    InvalidTotal,
    #[error("Batch size must be positive")]
    InvalidBatchSize,
    #[error("Batch size {got} does not match session batch size {expected}")]
    BatchSizeMismatch { expected: usize, got: usize },
    #[error("Session {active} is still collecting frames, cannot accept session {requested}")]
    SessionInProgress { active: String, requested: String },
    #[error("Session {0} is already closed")]
    SessionClosed(String),
    #[error("Session {0} is still being reconstructed")]
    ReconstructionInProgress(String),
    #[error("Session {session} expects {expected}, batch declares {got}")]
    SessionMismatch {
        session: String,
        expected: String,
        got: String,
    },
    #[error("Batch {batch_index} of size {batch_size} addresses frames past the index range")]
    IndexOverflow {
        batch_index: usize,
        batch_size: usize,
    },
}

/// One upload batch as received from the client.
#[derive(Debug, Default)]
pub struct FrameBatch {
    pub session_id: Option<String>,
    pub batch_index: usize,
    pub batch_size: Option<usize>,
    pub width: i32,
    pub height: i32,
    pub total_frames: usize,
    pub files: Vec<Bytes>,
}

/// Frames collected for one upload sequence.
///
/// A `None` slot is an upload that failed to decode; it counts towards
/// completion but is skipped when the video is written.
#[derive(Debug)]
pub struct UploadSession {
    id: String,
    expected_total: usize,
    batch_size: usize,
    width: i32,
    height: i32,
    frames: BTreeMap<usize, Option<Mat>>,
    last_activity: Instant,
}

impl UploadSession {
    fn open(id: String, batch: &FrameBatch, batch_size: usize) -> Self {
        Self {
            id,
            expected_total: batch.total_frames,
            batch_size,
            width: batch.width,
            height: batch.height,
            frames: BTreeMap::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn expected_total(&self) -> usize {
        self.expected_total
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn frames(&self) -> &BTreeMap<usize, Option<Mat>> {
        &self.frames
    }

    pub fn received(&self) -> usize {
        self.frames.len()
    }

    /// Every index in `0..expected_total` has arrived.
    ///
    /// Indices at or past the total are never stored, so the key count is enough.
    pub fn is_complete(&self) -> bool {
        self.frames.len() == self.expected_total
    }

    /// Stores `decoded` at `base..base + decoded.len()`.
    fn insert_frames(&mut self, base: usize, decoded: Vec<Option<Mat>>) {
        self.last_activity = Instant::now();
        for (offset, frame) in decoded.into_iter().enumerate() {
            let index = base + offset;
            if index >= self.expected_total {
                tracing::warn!(
                    "Dropping frame {} beyond expected total {}",
                    index,
                    self.expected_total
                );
                continue;
            }
            if frame.is_none() {
                tracing::warn!("Frame {} could not be decoded", index);
            }
            if self.frames.insert(index, frame).is_some() {
                tracing::debug!("Frame {} received twice, keeping the latest", index);
            }
        }
    }

    fn mismatch(&self, batch: &FrameBatch) -> Option<SessionError> {
        if (self.expected_total, self.width, self.height)
            == (batch.total_frames, batch.width, batch.height)
        {
            return None;
        }
        Some(SessionError::SessionMismatch {
            session: self.id.clone(),
            expected: format!(
                "{} frames of {}x{}",
                self.expected_total, self.width, self.height
            ),
            got: format!(
                "{} frames of {}x{}",
                batch.total_frames, batch.width, batch.height
            ),
        })
    }
}

/// First frame index of a batch, checked so that every frame in it is addressable.
fn placement_base(
    batch_index: usize,
    batch_size: usize,
    count: usize,
) -> Result<usize, SessionError> {
    batch_index
        .checked_mul(batch_size)
        .filter(|base| base.checked_add(count).is_some())
        .ok_or(SessionError::IndexOverflow {
            batch_index,
            batch_size,
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Collecting,
    Running,
    Succeeded,
    Failed,
}

/// What a client can learn about an upload session after the fact.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: SessionState,
    pub frames_received: usize,
    pub expected_total: usize,
    pub output_path: Option<PathBuf>,
    pub frames_written: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub enum BatchOutcome {
    Accepted {
        session_id: String,
        received: usize,
        expected: usize,
    },
    /// The session is complete and has been removed from the store.
    Complete(UploadSession),
}

#[derive(Default)]
struct StoreInner {
    active: Option<UploadSession>,
    statuses: HashMap<String, SessionStatus>,
    /// Ids of sessions that reached a final state, oldest first.
    finished: VecDeque<String>,
}

impl StoreInner {
    fn running_session(&self) -> Option<&str> {
        self.statuses
            .values()
            .find(|s| s.state == SessionState::Running)
            .map(|s| s.session_id.as_str())
    }
}

/// Holds at most one collecting session plus the status of recent sessions.
///
/// A collecting session that sees no batch for `session_timeout` is
/// discarded; only the newest `status_retention` finished statuses are kept.
pub struct FrameStore {
    inner: Mutex<StoreInner>,
    default_batch_size: usize,
    session_timeout: Duration,
    status_retention: usize,
}

impl FrameStore {
    pub fn new(default_batch_size: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            default_batch_size,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            status_retention: DEFAULT_STATUS_RETENTION,
        }
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_status_retention(mut self, retention: usize) -> Self {
        self.status_retention = retention;
        self
    }

    /// Decodes and stores one batch, handing the session back once complete.
    ///
    /// Blocking: decoding runs on the calling thread.
    pub fn ingest(&self, batch: FrameBatch) -> Result<BatchOutcome, SessionError> {
        if batch.files.is_empty() {
            return Err(SessionError::NoFiles);
        }
        if batch.width <= 0 || batch.height <= 0 {
            return Err(SessionError::InvalidDimensions);
        }
        if batch.total_frames == 0 {
            return Err(SessionError::InvalidTotal);
        }
        if batch.batch_size == Some(0) {
            return Err(SessionError::InvalidBatchSize);
        }

        let decoded: Vec<Option<Mat>> = batch
            .files
            .iter()
            .map(|bytes| match CvImage::from_bytes(bytes) {
                Ok(image) => image.map(|image| image.mat),
                Err(e) => {
                    tracing::warn!("Failed to decode uploaded frame: {}", e);
                    None
                }
            })
            .collect();

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        self.admit(inner, &batch)?;

        let batch_size = match &inner.active {
            Some(active) => active.batch_size,
            None => batch.batch_size.unwrap_or(self.default_batch_size),
        };
        let base = placement_base(batch.batch_index, batch_size, decoded.len())?;

        let session = inner.active.get_or_insert_with(|| {
            let id = batch.session_id.clone().unwrap_or_else(new_session_id);
            tracing::info!(
                "Opening upload session {} for {} frames of {}x{}, batch size {}",
                id,
                batch.total_frames,
                batch.width,
                batch.height,
                batch_size
            );
            UploadSession::open(id, &batch, batch_size)
        });

        session.insert_frames(base, decoded);
        let session_id = session.id.clone();
        let received = session.received();
        let expected = session.expected_total;
        let complete = session.is_complete();

        tracing::info!(
            "Received {} frames out of {} expected for session {}",
            received,
            expected,
            session_id
        );

        inner.statuses.insert(
            session_id.clone(),
            SessionStatus {
                session_id: session_id.clone(),
                state: if complete {
                    SessionState::Running
                } else {
                    SessionState::Collecting
                },
                frames_received: received,
                expected_total: expected,
                output_path: None,
                frames_written: None,
                error: None,
            },
        );

        if complete {
            if let Some(session) = inner.active.take() {
                return Ok(BatchOutcome::Complete(session));
            }
        }

        Ok(BatchOutcome::Accepted {
            session_id,
            received,
            expected,
        })
    }

    /// Decides whether `batch` may join the collecting session or open a new one.
    ///
    /// An idle session is discarded first. A first batch without a session id
    /// whose total or size disagrees with the collecting session replaces it,
    /// since the client that owned it has started over.
    fn admit(&self, inner: &mut StoreInner, batch: &FrameBatch) -> Result<(), SessionError> {
        let expired = inner
            .active
            .as_ref()
            .is_some_and(|active| active.last_activity.elapsed() >= self.session_timeout);
        if expired {
            self.retire_active(inner, "expired waiting for further batches");
        }

        if let (Some(active), Some(requested)) = (&inner.active, &batch.session_id) {
            if requested != &active.id {
                return Err(SessionError::SessionInProgress {
                    active: active.id.clone(),
                    requested: requested.clone(),
                });
            }
        }

        if let Some(mismatch) = inner.active.as_ref().and_then(|a| a.mismatch(batch)) {
            if batch.session_id.is_some() || batch.batch_index != 0 {
                return Err(mismatch);
            }
            self.retire_active(inner, "superseded by a new upload");
        }

        if let Some(active) = &inner.active {
            if let Some(got) = batch.batch_size {
                if got != active.batch_size {
                    return Err(SessionError::BatchSizeMismatch {
                        expected: active.batch_size,
                        got,
                    });
                }
            }
            return Ok(());
        }

        if let Some(requested) = &batch.session_id {
            if inner.statuses.contains_key(requested) {
                return Err(SessionError::SessionClosed(requested.clone()));
            }
        }
        if let Some(running) = inner.running_session() {
            return Err(SessionError::ReconstructionInProgress(running.to_string()));
        }
        Ok(())
    }

    fn retire_active(&self, inner: &mut StoreInner, reason: &str) {
        let Some(stale) = inner.active.take() else {
            return;
        };
        tracing::warn!(
            "Discarding upload session {} with {} of {} frames: {}",
            stale.id,
            stale.received(),
            stale.expected_total,
            reason
        );
        if let Some(status) = inner.statuses.get_mut(&stale.id) {
            status.state = SessionState::Failed;
            status.error = Some(format!("Upload {}", reason));
        }
        self.retain_status(inner, stale.id);
    }

    fn retain_status(&self, inner: &mut StoreInner, session_id: String) {
        inner.finished.push_back(session_id);
        while inner.finished.len() > self.status_retention {
            if let Some(oldest) = inner.finished.pop_front() {
                inner.statuses.remove(&oldest);
            }
        }
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.inner.lock().statuses.get(session_id).cloned()
    }

    /// Records the outcome of a session's reconstruction.
    pub fn finish(&self, session_id: &str, outcome: Result<(PathBuf, usize), String>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(status) = inner.statuses.get_mut(session_id) else {
            tracing::warn!("Finishing unknown session {}", session_id);
            return;
        };
        match outcome {
            Ok((path, written)) => {
                status.state = SessionState::Succeeded;
                status.output_path = Some(path);
                status.frames_written = Some(written);
            }
            Err(error) => {
                status.state = SessionState::Failed;
                status.error = Some(error);
            }
        }
        self.retain_status(inner, session_id.to_string());
    }

    /// Frames currently buffered for the collecting session.
    pub fn buffered_frames(&self) -> usize {
        self.inner
            .lock()
            .active
            .as_ref()
            .map_or(0, UploadSession::received)
    }
}

fn new_session_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}
