//! Job orchestration: split, dispatch, persist, aggregate

use crate::chunking::Chunker;
use crate::config::PipelineConfig;
use crate::dispatcher::{Dispatched, Dispatcher};
use crate::error::PipelineError;
use crate::gateway::{AnalysisGateway, RateLimitPacer};
use crate::metrics::JobMetrics;
use crate::persister::{retry_store_call, RecordPersister};
use crate::types::{ChunkOutcome, ChunkReport, JobResult, JobState, JobStatus};
use chrono::{SecondsFormat, Utc};
use formflow_domain::{
    deterministic_id, ArtifactRef, ArtifactStore, Chunk, DocumentAnalyzer, ExtractedFields,
    ExtractionRecord, RecordStore, SourceDocument,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// A chunk whose analysis has settled, waiting for its record to be written
struct AnalyzedChunk {
    /// The chunk, with its bytes released
    chunk: Chunk,
    artifact: Option<ArtifactRef>,
    locator: Option<String>,
    analysis: Result<ExtractedFields, PipelineError>,
    attempts: u32,
    rate_limited: u32,
    store_retries: u32,
}

/// A chunk that went through analysis and persistence
struct SettledChunk {
    report: ChunkReport,
    rate_limited: u32,
    store_retries: u32,
}

/// Tracks the job's state and logs each transition
struct StateLog {
    states: Vec<JobState>,
}

impl StateLog {
    fn new() -> Self {
        Self {
            states: vec![JobState::Pending],
        }
    }

    fn advance(&mut self, next: JobState) {
        let from = self.states.last().copied().unwrap_or(JobState::Pending);
        info!(from = %from, to = %next, "Job state changed");
        self.states.push(next);
    }
}

/// Runs extraction jobs, one source document at a time per call
///
/// A job moves through `Pending → Splitting → Dispatching → Persisting` and
/// ends in `Completed`, `PartialFailure` or `Failed`. The document is split
/// into chunks. Under the concurrency bound, each chunk's artifact is
/// stored, the chunk is analyzed, and its record is written as soon as the
/// analysis settles, so the record always reflects that chunk's own outcome
/// and a job that is dropped part way keeps what it already wrote.
///
/// Per-chunk failures never stop sibling chunks. Re-running a job is safe:
/// record ids are derived from the source id and form number, so a re-run
/// replaces records instead of adding new ones.
///
/// # Examples
///
/// ```no_run
/// use formflow_analysis::HttpAnalyzer;
/// use formflow_domain::SourceDocument;
/// use formflow_pipeline::{JobOrchestrator, PipelineConfig};
/// use formflow_store::{LocalArtifactStore, SqliteRecordStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let orchestrator = JobOrchestrator::new(
///     HttpAnalyzer::new("http://localhost:8080")?,
///     LocalArtifactStore::new("/var/lib/formflow/chunks")?,
///     SqliteRecordStore::new("formflow.db")?,
///     PipelineConfig::from_file("formflow.toml")?,
/// )?;
///
/// let document = SourceDocument::new("inbox/claims.pdf", std::fs::read("claims.pdf")?);
/// let result = orchestrator.process(&document).await;
/// println!("{:?}: {}", result.status, result.metrics.summary());
/// # Ok(())
/// # }
/// ```
pub struct JobOrchestrator<A, F, R> {
    chunker: Chunker,
    dispatcher: Dispatcher,
    gateway: AnalysisGateway<A>,
    artifacts: Arc<F>,
    persister: RecordPersister<R>,
    config: PipelineConfig,
}

impl<A, F, R> JobOrchestrator<A, F, R>
where
    A: DocumentAnalyzer,
    F: ArtifactStore,
    R: RecordStore,
{
    /// Create an orchestrator over the given collaborators
    ///
    /// Fails if `config` does not validate.
    pub fn new(
        analyzer: A,
        artifacts: F,
        records: R,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            chunker: Chunker::new(config.chunk_span)?,
            dispatcher: Dispatcher::new(config.concurrency_limit),
            gateway: AnalysisGateway::new(Arc::new(analyzer), config.analysis.clone()),
            artifacts: Arc::new(artifacts),
            persister: RecordPersister::new(Arc::new(records), config.persistence.clone()),
            config,
        })
    }

    /// Share rate-limit pacing with other orchestrators using the same service
    pub fn with_pacer(mut self, pacer: Arc<RateLimitPacer>) -> Self {
        self.gateway = self.gateway.with_pacer(pacer);
        self
    }

    /// The configuration this orchestrator runs with
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The analysis capability
    pub fn analyzer(&self) -> &Arc<A> {
        self.gateway.analyzer()
    }

    /// The artifact store
    pub fn artifact_store(&self) -> &Arc<F> {
        &self.artifacts
    }

    /// The record store
    pub fn record_store(&self) -> &Arc<R> {
        self.persister.store()
    }

    /// Process every form of a document
    pub async fn process(&self, document: &SourceDocument) -> JobResult {
        self.process_with_cancel(document, &CancellationToken::new())
            .await
    }

    /// Process every form of a document, stopping dispatch when `cancel` fires
    ///
    /// Chunks already admitted finish and are persisted; the rest are
    /// reported as abandoned and get no record.
    pub async fn process_with_cancel(
        &self,
        document: &SourceDocument,
        cancel: &CancellationToken,
    ) -> JobResult {
        self.run(document, None, cancel)
            .instrument(info_span!("job", source_id = %document.source_id))
            .await
    }

    /// Re-process only the named forms of a document
    ///
    /// Records of other forms are left untouched. Form numbers outside the
    /// document are rejected before any work starts.
    pub async fn retry_forms(
        &self,
        document: &SourceDocument,
        form_numbers: &[u32],
    ) -> Result<JobResult, PipelineError> {
        if form_numbers.is_empty() {
            return Err(PipelineError::InvalidRequest(
                "no form numbers given".to_string(),
            ));
        }

        let span = info_span!("job", source_id = %document.source_id, retry = true);
        let page_count = match self.chunker.page_count(document) {
            Ok(page_count) => page_count,
            Err(e) => {
                let _entered = span.enter();
                warn!("Cannot retry forms: {}", e);
                let states = vec![JobState::Pending, JobState::Splitting, JobState::Failed];
                return Ok(JobResult::document_failure(
                    document.source_id.clone(),
                    e,
                    states,
                    JobMetrics::new(),
                ));
            }
        };

        let total_forms = page_count.div_ceil(self.chunker.chunk_span());
        let selection: BTreeSet<u32> = form_numbers.iter().copied().collect();
        let unknown: Vec<u32> = selection
            .iter()
            .copied()
            .filter(|n| *n == 0 || *n > total_forms)
            .collect();
        if !unknown.is_empty() {
            return Err(PipelineError::InvalidRequest(format!(
                "{}: form(s) {:?} not in 1..={}",
                document.source_id, unknown, total_forms
            )));
        }

        Ok(self
            .run(document, Some(selection), &CancellationToken::new())
            .instrument(span)
            .await)
    }

    async fn run(
        &self,
        document: &SourceDocument,
        selection: Option<BTreeSet<u32>>,
        cancel: &CancellationToken,
    ) -> JobResult {
        let started = Instant::now();
        let mut metrics = JobMetrics::new();
        let mut state = StateLog::new();

        state.advance(JobState::Splitting);
        let chunks = match self.chunker.split(document) {
            Ok(chunks) => chunks,
            Err(e) => {
                error!("Document could not be split: {}", e);
                state.advance(JobState::Failed);
                metrics.elapsed_ms = started.elapsed().as_millis() as u64;
                return JobResult::document_failure(
                    document.source_id.clone(),
                    e,
                    state.states,
                    metrics,
                );
            }
        };

        let total_forms = chunks.first().map(|c| c.total_forms).unwrap_or(0);
        let chunks: Vec<Chunk> = match &selection {
            Some(forms) => chunks
                .into_iter()
                .filter(|c| forms.contains(&c.form_number))
                .collect(),
            None => chunks,
        };

        info!(
            total_forms,
            dispatched = chunks.len(),
            model_id = %self.config.model_id,
            concurrency_limit = self.dispatcher.limit(),
            "Document split"
        );

        // Each admitted chunk is persisted as soon as its analysis settles,
        // so a job dropped part way keeps every record already written.
        state.advance(JobState::Dispatching);
        let dispatched = self
            .dispatcher
            .run(chunks, cancel, |chunk| self.settle_chunk(chunk))
            .await;

        state.advance(JobState::Persisting);
        let mut reports = Vec::with_capacity(dispatched.len());
        let mut abandoned = 0usize;
        for (_, outcome) in dispatched {
            match outcome {
                Dispatched::Finished(settled) => {
                    metrics.record_analysis(settled.report.attempts, settled.rate_limited);
                    metrics.record_persistence_retries(settled.store_retries);
                    reports.push(settled.report);
                }
                Dispatched::Abandoned(chunk) => {
                    abandoned += 1;
                    reports.push(ChunkReport {
                        form_number: chunk.form_number,
                        page_range: chunk.page_range,
                        record_id: deterministic_id(&chunk.source_id, chunk.form_number),
                        artifact: None,
                        artifact_locator: None,
                        attempts: 0,
                        outcome: ChunkOutcome::Abandoned,
                    });
                }
            }
        }

        if abandoned > 0 {
            warn!(abandoned, "Job cancelled before every form was dispatched");
        }

        reports.sort_by_key(|r| r.form_number);
        for report in &reports {
            metrics.record_outcome(&report.outcome);
        }

        let status = JobStatus::from_outcomes(reports.iter().map(|r| &r.outcome));
        state.advance(status.into());
        metrics.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            status = ?status,
            completed = metrics.completed,
            unsuccessful = metrics.total_unsuccessful(),
            "Job finished\n{}",
            metrics.summary()
        );

        JobResult {
            source_id: document.source_id.clone(),
            status,
            total_forms,
            chunks: reports,
            error: None,
            states: state.states,
            metrics,
        }
    }

    /// Analyze one chunk and persist its record
    async fn settle_chunk(&self, chunk: Chunk) -> SettledChunk {
        let analyzed = self.analyze_chunk(chunk).await;
        self.persist_chunk(analyzed).await
    }

    /// Store the chunk artifact, then analyze the chunk
    async fn analyze_chunk(&self, chunk: Chunk) -> AnalyzedChunk {
        let name = chunk.suggested_name();
        let bytes = chunk.bytes.as_slice();
        let suggested = name.as_str();
        let artifacts = &self.artifacts;

        let (stored, store_attempts) =
            retry_store_call(&self.config.persistence, "artifact store", move || {
                artifacts.store(bytes, suggested)
            })
            .await;

        let (artifact, locator, analysis, attempts, rate_limited) = match stored {
            Ok(artifact) => {
                let locator = self.readable_locator(&artifact).await;
                let outcome = self.gateway.analyze(bytes, &self.config.model_id).await;
                (
                    Some(artifact),
                    locator,
                    outcome.result,
                    outcome.attempts,
                    outcome.rate_limited,
                )
            }
            Err(cause) => {
                warn!(
                    form_number = chunk.form_number,
                    "Artifact not stored, skipping analysis: {}",
                    cause
                );
                let error = PipelineError::Artifact {
                    attempts: store_attempts,
                    cause,
                };
                (None, None, Err(error), 0, 0)
            }
        };

        if let Err(e) = &analysis {
            warn!(form_number = chunk.form_number, "Form analysis failed: {}", e);
        }

        AnalyzedChunk {
            chunk: Chunk {
                bytes: Vec::new(),
                ..chunk
            },
            artifact,
            locator,
            analysis,
            attempts,
            rate_limited,
            store_retries: store_attempts.saturating_sub(1),
        }
    }

    async fn readable_locator(&self, artifact: &ArtifactRef) -> Option<String> {
        let call = self
            .artifacts
            .readable_ref(artifact, self.config.artifact_ttl());
        match timeout(self.config.persistence.call_timeout(), call).await {
            Ok(Ok(readable)) => Some(readable.locator),
            Ok(Err(e)) => {
                warn!(artifact = %artifact, "No readable locator for artifact: {}", e);
                None
            }
            Err(_) => {
                warn!(artifact = %artifact, "Timed out requesting artifact locator");
                None
            }
        }
    }

    /// Write the record reflecting one chunk's analysis outcome
    async fn persist_chunk(&self, analyzed: AnalyzedChunk) -> SettledChunk {
        let AnalyzedChunk {
            chunk,
            artifact,
            locator,
            analysis,
            attempts,
            rate_limited,
            store_retries,
        } = analyzed;

        // A chunk whose artifact never got stored still names where it
        // would have gone, so the failed record stays traceable.
        let artifact_ref = artifact
            .clone()
            .unwrap_or_else(|| ArtifactRef::new(chunk.suggested_name()));
        let processed_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let model_id = self.config.model_id.as_str();

        let (record, analysis_error) = match analysis {
            Ok(fields) => (
                ExtractionRecord::completed(&chunk, artifact_ref, model_id, fields, processed_at),
                None,
            ),
            Err(e) => (
                ExtractionRecord::failed(&chunk, artifact_ref, model_id, e.to_string(), processed_at),
                Some(e),
            ),
        };

        let written = self.persister.upsert(&record).await;
        let outcome = match (written.result, analysis_error) {
            (Err(error), _) => {
                error!(
                    form_number = chunk.form_number,
                    analysis = record.status.as_str(),
                    "Record for form could not be persisted: {}",
                    error
                );
                ChunkOutcome::PersistenceFailed {
                    analysis: record.status,
                    error,
                }
            }
            (Ok(()), Some(error)) => ChunkOutcome::AnalysisFailed { error },
            (Ok(()), None) => ChunkOutcome::Completed,
        };

        debug!(
            form_number = chunk.form_number,
            outcome = outcome.label(),
            "Form settled"
        );

        SettledChunk {
            report: ChunkReport {
                form_number: chunk.form_number,
                page_range: chunk.page_range,
                record_id: record.id,
                artifact,
                artifact_locator: locator,
                attempts,
                outcome,
            },
            rate_limited,
            store_retries: store_retries + written.attempts.saturating_sub(1),
        }
    }
}
