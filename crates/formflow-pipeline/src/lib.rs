//! Formflow Pipeline
//!
//! Splits multi-form PDF batches into one chunk per form, analyzes every
//! chunk concurrently, and persists one extraction record per form.
//!
//! # Overview
//!
//! A scanned batch usually holds several identical forms back to back. The
//! pipeline cuts the batch into fixed-size page groups, stores each group
//! as its own artifact, sends it to an analysis service, and writes the
//! extracted fields (or the failure) under a record id derived from the
//! source and the form number. Re-running a batch replaces its records.
//!
//! # Architecture
//!
//! ```text
//! SourceDocument → Chunker → Dispatcher ─┬→ ArtifactStore
//!                                        ├→ AnalysisGateway → DocumentAnalyzer
//!                                        └→ RecordPersister → RecordStore
//!                                                    ↓
//!                                                JobResult
//! ```
//!
//! # Key Features
//!
//! - **Deterministic Chunking**: Same document and span, same chunks
//! - **Bounded Concurrency**: At most `concurrency_limit` chunks in flight
//! - **Rate-Limit Aware Retry**: Exponential backoff with jitter, shared pacing
//!   and a ceiling on total waiting
//! - **Failure Isolation**: One failing form never stops its siblings
//! - **Idempotent Persistence**: One record per form, however often a job runs
//! - **Cancellation**: Undispatched forms are abandoned, in-flight ones finish
//!
//! # Example Usage
//!
//! ```no_run
//! use formflow_analysis::MockAnalyzer;
//! use formflow_domain::{ExtractedFields, SourceDocument};
//! use formflow_pipeline::{JobOrchestrator, JobStatus, PipelineConfig};
//! use formflow_store::{LocalArtifactStore, SqliteRecordStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let analyzer = MockAnalyzer::new(ExtractedFields::new().with_field("name", "Ada", 0.95));
//! let artifacts = LocalArtifactStore::new("/tmp/formflow/chunks")?;
//! let records = SqliteRecordStore::new(":memory:")?;
//!
//! let orchestrator = JobOrchestrator::new(analyzer, artifacts, records, PipelineConfig::default())?;
//!
//! let document = SourceDocument::new("intake.pdf", std::fs::read("intake.pdf")?);
//! let result = orchestrator.process(&document).await;
//!
//! if result.status != JobStatus::Completed {
//!     for chunk in result.chunks.iter().filter(|c| !c.outcome.is_success()) {
//!         println!("form {}: {}", chunk.form_number, chunk.outcome.label());
//!     }
//! }
//! println!("{}", result.metrics.summary());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod chunking;
mod config;
mod dispatcher;
mod error;
mod gateway;
mod metrics;
mod orchestrator;
mod persister;
mod retry;
mod types;

#[cfg(test)]
mod testing;


pub use chunking::Chunker;
pub use config::{ConfigError, PipelineConfig, RetryPolicy};
pub use dispatcher::{Dispatched, Dispatcher, FormTagged};
pub use error::PipelineError;
pub use gateway::{AnalysisGateway, RateLimitPacer};
pub use metrics::JobMetrics;
pub use orchestrator::JobOrchestrator;
pub use persister::RecordPersister;
pub use types::{
    Attempted, ChunkOutcome, ChunkReport, JobResult, JobState, JobStatus,
};
