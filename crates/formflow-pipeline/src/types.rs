//! Job and chunk result types

use crate::error::PipelineError;
use crate::metrics::JobMetrics;
use formflow_domain::{ArtifactRef, PageRange, RecordId, RecordStatus};
use std::fmt;

/// Result of a retried external call plus how much retrying it took
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    /// Final result
    pub result: Result<T, PipelineError>,

    /// Attempts made, the first one included
    pub attempts: u32,

    /// Attempts answered with a rate-limit signal
    pub rate_limited: u32,
}

impl<T> Attempted<T> {
    /// Retries made on top of the first attempt
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Lifecycle of one orchestration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Accepted, nothing done yet
    Pending,
    /// Cutting the document into chunks
    Splitting,
    /// Storing, analyzing and persisting chunks under the concurrency bound
    Dispatching,
    /// Dispatch has drained; gathering the persisted outcomes
    Persisting,
    /// Every chunk analyzed and persisted
    Completed,
    /// Some chunks made it end to end, some did not
    PartialFailure,
    /// Splitting failed, or no chunk made it end to end
    Failed,
}

impl JobState {
    /// True for the three outcome states
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::PartialFailure | JobState::Failed
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Splitting => "splitting",
            JobState::Dispatching => "dispatching",
            JobState::Persisting => "persisting",
            JobState::Completed => "completed",
            JobState::PartialFailure => "partial",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Terminal status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Every chunk analyzed and persisted
    Completed,
    /// At least one chunk succeeded end to end and at least one did not
    PartialFailure,
    /// Splitting failed, or every chunk failed
    Failed,
}

impl JobStatus {
    /// Aggregate chunk outcomes into a job status
    ///
    /// ```
    /// use formflow_pipeline::{ChunkOutcome, JobStatus};
    ///
    /// let outcomes = [ChunkOutcome::Completed, ChunkOutcome::Abandoned];
    /// assert_eq!(JobStatus::from_outcomes(outcomes.iter()), JobStatus::PartialFailure);
    /// assert_eq!(JobStatus::from_outcomes([].iter()), JobStatus::Failed);
    /// ```
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a ChunkOutcome>) -> Self {
        let (mut succeeded, mut other) = (0usize, 0usize);
        for outcome in outcomes {
            if outcome.is_success() {
                succeeded += 1;
            } else {
                other += 1;
            }
        }
        match (succeeded, other) {
            (0, _) => JobStatus::Failed,
            (_, 0) => JobStatus::Completed,
            _ => JobStatus::PartialFailure,
        }
    }
}

impl From<JobStatus> for JobState {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Completed => JobState::Completed,
            JobStatus::PartialFailure => JobState::PartialFailure,
            JobStatus::Failed => JobState::Failed,
        }
    }
}

/// What happened to one chunk
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// Analyzed and persisted as `completed`
    Completed,

    /// Analysis (or artifact storage) failed; persisted as `failed`
    AnalysisFailed {
        /// Why the chunk could not be analyzed
        error: PipelineError,
    },

    /// The record could not be written
    ///
    /// `analysis` says what the lost record would have recorded, so an
    /// analysis that succeeded is never reported as a plain success here.
    PersistenceFailed {
        /// Status of the record that was not written
        analysis: RecordStatus,
        /// Why the write failed
        error: PipelineError,
    },

    /// Never admitted because the job was cancelled
    Abandoned,
}

impl ChunkOutcome {
    /// True when the chunk made it end to end
    pub fn is_success(&self) -> bool {
        matches!(self, ChunkOutcome::Completed)
    }

    /// Short label for logs and summaries
    pub fn label(&self) -> &'static str {
        match self {
            ChunkOutcome::Completed => "completed",
            ChunkOutcome::AnalysisFailed { .. } => "analysis_failed",
            ChunkOutcome::PersistenceFailed { .. } => "persistence_failed",
            ChunkOutcome::Abandoned => "abandoned",
        }
    }
}

/// Outcome of one chunk, tagged with the chunk it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkReport {
    /// Form number (1-indexed)
    pub form_number: u32,

    /// Pages of the source this chunk covers
    pub page_range: PageRange,

    /// Id of the record for this chunk
    pub record_id: RecordId,

    /// Stored chunk artifact, when storing it succeeded
    pub artifact: Option<ArtifactRef>,

    /// Time-limited locator for the artifact, when one could be issued
    pub artifact_locator: Option<String>,

    /// Analysis attempts made for this chunk
    pub attempts: u32,

    /// What happened
    pub outcome: ChunkOutcome,
}

/// Final result of one orchestration run
#[derive(Debug, Clone)]
pub struct JobResult {
    /// Source document identifier
    pub source_id: String,

    /// Terminal status
    pub status: JobStatus,

    /// Forms the document was split into (0 when splitting failed)
    pub total_forms: u32,

    /// One report per processed chunk, ordered by form number
    pub chunks: Vec<ChunkReport>,

    /// Document-level failure, when the job never reached dispatch
    pub error: Option<PipelineError>,

    /// States the job passed through, ending in a terminal one
    pub states: Vec<JobState>,

    /// Counters for this run
    pub metrics: JobMetrics,
}

impl JobResult {
    /// Result for a job that failed before any chunk was dispatched
    pub(crate) fn document_failure(
        source_id: impl Into<String>,
        error: PipelineError,
        states: Vec<JobState>,
        metrics: JobMetrics,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            status: JobStatus::Failed,
            total_forms: 0,
            chunks: Vec::new(),
            error: Some(error),
            states,
            metrics,
        }
    }

    /// Report for one form, if it was part of this run
    pub fn chunk(&self, form_number: u32) -> Option<&ChunkReport> {
        self.chunks.iter().find(|c| c.form_number == form_number)
    }

    /// Terminal state of the job
    pub fn state(&self) -> JobState {
        self.status.into()
    }
}
