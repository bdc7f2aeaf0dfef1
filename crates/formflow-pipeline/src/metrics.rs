//! Metrics collection for orchestration runs

use crate::types::ChunkOutcome;

/// Counters collected during one job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobMetrics {
    /// Chunks the job covered
    pub chunks_total: usize,

    /// Chunks analyzed and persisted
    pub completed: usize,

    /// Chunks whose analysis or artifact storage failed
    pub analysis_failed: usize,

    /// Chunks whose record could not be written
    pub persistence_failed: usize,

    /// Chunks never admitted because of cancellation
    pub abandoned: usize,

    /// Analysis attempts across all chunks
    pub analysis_attempts: u64,

    /// Analysis attempts answered with a rate-limit signal
    pub rate_limit_hits: u64,

    /// Record and artifact store retries across all chunks
    pub persistence_retries: u64,

    /// Wall time of the job in milliseconds
    pub elapsed_ms: u64,
}

impl JobMetrics {
    /// Create new empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the final outcome of a chunk
    pub fn record_outcome(&mut self, outcome: &ChunkOutcome) {
        self.chunks_total += 1;
        match outcome {
            ChunkOutcome::Completed => self.completed += 1,
            ChunkOutcome::AnalysisFailed { .. } => self.analysis_failed += 1,
            ChunkOutcome::PersistenceFailed { .. } => self.persistence_failed += 1,
            ChunkOutcome::Abandoned => self.abandoned += 1,
        }
    }

    /// Record the attempts one chunk's analysis took
    pub fn record_analysis(&mut self, attempts: u32, rate_limited: u32) {
        self.analysis_attempts += u64::from(attempts);
        self.rate_limit_hits += u64::from(rate_limited);
    }

    /// Record store retries
    pub fn record_persistence_retries(&mut self, retries: u32) {
        self.persistence_retries += u64::from(retries);
    }

    /// Chunks that did not make it end to end
    pub fn total_unsuccessful(&self) -> usize {
        self.analysis_failed + self.persistence_failed + self.abandoned
    }

    /// Generate a summary report of metrics
    pub fn summary(&self) -> String {
        let mut lines = vec![
            "Job Metrics Summary".to_string(),
            "===================".to_string(),
            format!("Chunks: {}", self.chunks_total),
            format!("  Completed: {}", self.completed),
        ];

        if self.total_unsuccessful() > 0 {
            lines.push(format!("  Analysis failed: {}", self.analysis_failed));
            lines.push(format!("  Persistence failed: {}", self.persistence_failed));
            lines.push(format!("  Abandoned: {}", self.abandoned));
        }

        lines.push(format!("Analysis attempts: {}", self.analysis_attempts));
        lines.push(format!("Rate limit hits: {}", self.rate_limit_hits));
        lines.push(format!("Persistence retries: {}", self.persistence_retries));
        lines.push(format!("Elapsed: {}ms", self.elapsed_ms));

        lines.join("\n")
    }
}
