//! Job and frame data model.

use crate::alert::AlertOutcome;
use crate::object_store::ObjectLocator;
use crate::resource_guard::ResourceError;
use crate::sampler::DecodeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// One end-to-end run of the pipeline over a single video.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: Uuid,
    pub source: ObjectLocator,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(source: ObjectLocator) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            source,
            created_at: Utc::now(),
        }
    }
}

/// Why a frame ended in [`FrameState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The frame could not be persisted
    Upload,
    /// The frame's classification chunk failed
    Classification,
    /// The frame was rejected but its object survived the delete retry
    Delete,
}

/// Frame lifecycle: `Pending -> Uploaded -> Classified -> {Retained | Deleted | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Pending,
    Uploaded,
    Classified,
    Retained,
    Deleted,
    Failed(FailureReason),
}

impl FrameState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Retained | Self::Deleted | Self::Failed(_))
    }

    fn can_become(&self, next: FrameState) -> bool {
        use FrameState::*;
        matches!(
            (self, next),
            (Pending, Uploaded)
                | (Pending, Failed(FailureReason::Upload))
                | (Uploaded, Classified)
                | (Uploaded, Failed(FailureReason::Classification))
                | (Classified, Retained)
                | (Classified, Deleted)
                | (Classified, Failed(FailureReason::Delete))
        )
    }
}

/// A labelled score from the classifier's full ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    pub label: String,
    pub confidence: f32,
}

/// Bounding box `[x, y, width, height]`, normalized 0-1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub label: Option<String>,
    pub confidence: Option<f32>,
    pub bbox: [f32; 4],
}

/// Classifier verdict for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub frame_index: u64,
    /// Top-ranked label
    pub label: String,
    /// Confidence of the top-ranked label, within [0, 1]
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<LabelScore>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boxes: Vec<BoundingBox>,
}

/// One sampled still image and where it lives in the object store.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Dense zero-based output index
    pub index: u64,
    /// Decode-sequence position in the source video
    pub source_offset: u64,
    pub storage_key: String,
    state: FrameState,
    detection: Option<Detection>,
}

impl Frame {
    pub fn new(index: u64, source_offset: u64, storage_key: String) -> Self {
        Self {
            index,
            source_offset,
            storage_key,
            state: FrameState::Pending,
            detection: None,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn detection(&self) -> Option<&Detection> {
        self.detection.as_ref()
    }

    pub fn mark_uploaded(&mut self) {
        self.advance(FrameState::Uploaded);
    }

    pub fn mark_classified(&mut self, detection: Detection) {
        debug_assert_eq!(detection.frame_index, self.index);
        self.advance(FrameState::Classified);
        self.detection = Some(detection);
    }

    pub fn mark_retained(&mut self) {
        self.advance(FrameState::Retained);
    }

    pub fn mark_deleted(&mut self) {
        self.advance(FrameState::Deleted);
    }

    pub fn mark_failed(&mut self, reason: FailureReason) {
        self.advance(FrameState::Failed(reason));
    }

    fn advance(&mut self, next: FrameState) {
        debug_assert!(
            self.state.can_become(next),
            "illegal frame transition {:?} -> {:?} for frame {}",
            self.state,
            next,
            self.index
        );
        if self.state.can_become(next) {
            self.state = next;
        } else {
            tracing::warn!(
                frame_index = self.index,
                from = ?self.state,
                to = ?next,
                "Ignoring illegal frame state transition"
            );
        }
    }
}

/// Overall job disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Every stage completed cleanly
    Succeeded,
    /// Completed, but some frames, deletes or the alert failed
    Degraded,
    /// A fatal error stopped the pipeline
    Failed,
}

/// Fatal error kinds, as reported in the job result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    SourceUnavailable,
    ResourceExceeded,
    DecodeError,
    Workspace,
    TimedOut,
    Cancelled,
}

/// Errors that abort a job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Source video {object} unavailable: {reason}")]
    SourceUnavailable {
        object: ObjectLocator,
        reason: String,
    },

    #[error("Resource ceiling exceeded: {0}")]
    ResourceExceeded(ResourceError),

    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Local workspace error: {0}")]
    Workspace(String),

    #[error("Job timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Job cancelled")]
    Cancelled,
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            Self::ResourceExceeded(_) => ErrorKind::ResourceExceeded,
            Self::Decode(_) => ErrorKind::DecodeError,
            Self::Workspace(_) => ErrorKind::Workspace,
            Self::TimedOut(_) => ErrorKind::TimedOut,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<ResourceError> for JobError {
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::Io(e) => Self::Workspace(e.to_string()),
            other => Self::ResourceExceeded(other),
        }
    }
}

/// Counters and non-fatal outcomes of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub frames_sampled: u64,
    pub frames_retained: u64,
    pub frames_deleted: u64,
    pub frames_unclassified: u64,
    pub frames_upload_failed: u64,
    pub status: JobStatus,
    pub residual_delete_failures: Vec<String>,
    pub alert: AlertOutcome,
}

impl JobSummary {
    /// Summary of a job whose video decoded to zero frames.
    pub fn empty() -> Self {
        Self::from_frames(&[], Vec::new(), AlertOutcome::Skipped)
    }

    pub fn from_frames(
        frames: &[Frame],
        residual_delete_failures: Vec<String>,
        alert: AlertOutcome,
    ) -> Self {
        let count = |wanted: FrameState| frames.iter().filter(|f| f.state() == wanted).count() as u64;

        let frames_unclassified = count(FrameState::Failed(FailureReason::Classification));
        let frames_upload_failed = count(FrameState::Failed(FailureReason::Upload));

        let degraded = frames_unclassified > 0
            || frames_upload_failed > 0
            || !residual_delete_failures.is_empty()
            || matches!(alert, AlertOutcome::Failed { .. });

        Self {
            frames_sampled: frames.len() as u64,
            frames_retained: count(FrameState::Retained),
            frames_deleted: count(FrameState::Deleted),
            frames_unclassified,
            frames_upload_failed,
            status: if degraded {
                JobStatus::Degraded
            } else {
                JobStatus::Succeeded
            },
            residual_delete_failures,
            alert,
        }
    }
}

/// Fatal error as reported in the job result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Document returned to the caller for every job, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub video: String,
    pub frames_sampled: u64,
    pub frames_retained: u64,
    pub frames_deleted: u64,
    pub frames_unclassified: u64,
    pub frames_upload_failed: u64,
    pub status: JobStatus,
    pub residual_delete_failures: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<AlertOutcome>,
    pub error: Option<JobFailure>,
}

impl JobResult {
    pub fn completed(job: &Job, summary: JobSummary) -> Self {
        Self {
            job_id: job.job_id,
            video: job.source.key.clone(),
            frames_sampled: summary.frames_sampled,
            frames_retained: summary.frames_retained,
            frames_deleted: summary.frames_deleted,
            frames_unclassified: summary.frames_unclassified,
            frames_upload_failed: summary.frames_upload_failed,
            status: summary.status,
            residual_delete_failures: summary.residual_delete_failures,
            alert: Some(summary.alert),
            error: None,
        }
    }

    pub fn failed(job: &Job, error: &JobError) -> Self {
        Self {
            job_id: job.job_id,
            video: job.source.key.clone(),
            frames_sampled: 0,
            frames_retained: 0,
            frames_deleted: 0,
            frames_unclassified: 0,
            frames_upload_failed: 0,
            status: JobStatus::Failed,
            residual_delete_failures: Vec::new(),
            alert: None,
            error: Some(JobFailure {
                kind: error.kind(),
                message: error.to_string(),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status != JobStatus::Failed
    }
}
