//! Formflow Analysis Layer
//!
//! Pluggable document-analysis implementations of the `DocumentAnalyzer`
//! trait from `formflow-domain`.
//!
//! # Providers
//!
//! - `MockAnalyzer`: Deterministic, scriptable analyzer for testing
//! - `HttpAnalyzer`: JSON-over-HTTP analysis service integration
//!
//! Neither provider retries. Retry and backoff live in the pipeline's
//! analysis gateway so that every provider gets the same policy.
//!
//! # Examples
//!
//! ```
//! use formflow_analysis::MockAnalyzer;
//! use formflow_domain::{DocumentAnalyzer, ExtractedFields};
//!
//! # tokio_test::block_on(async {
//! let analyzer = MockAnalyzer::new(ExtractedFields::new().with_field("name", "Ada", 0.9));
//! let fields = analyzer.analyze(b"%PDF-1.4", "prebuilt-layout").await.unwrap();
//! assert_eq!(fields.fields["name"], "Ada");
//! # });
//! ```

#![warn(missing_docs)]

pub mod http;

use async_trait::async_trait;
use formflow_domain::{Classify, DocumentAnalyzer, ExtractedFields, FailureClass};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

pub use http::HttpAnalyzer;

/// Errors that can occur during analysis calls
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    /// The service asked the caller to slow down
    #[error("Rate limit exceeded")]
    RateLimited {
        /// Delay requested by the service, if it sent one
        retry_after: Option<Duration>,
    },

    /// Network or API communication error
    #[error("Communication error: {0}")]
    Communication(String),

    /// The call did not finish in time
    #[error("Analysis timed out: {0}")]
    Timeout(String),

    /// The service is temporarily unavailable (5xx)
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Response could not be interpreted
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Model not available
    #[error("Model not available: {0}")]
    ModelNotAvailable(String),

    /// The service rejected the document
    #[error("Document rejected: {0}")]
    Rejected(String),
}

impl Classify for AnalysisError {
    fn class(&self) -> FailureClass {
        match self {
            AnalysisError::RateLimited { .. } => FailureClass::RateLimited,
            AnalysisError::Communication(_)
            | AnalysisError::Timeout(_)
            | AnalysisError::Unavailable(_) => FailureClass::Transient,
            AnalysisError::InvalidResponse(_)
            | AnalysisError::ModelNotAvailable(_)
            | AnalysisError::Rejected(_) => FailureClass::Permanent,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            AnalysisError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

type MockResult = Result<ExtractedFields, AnalysisError>;

/// Mock analyzer for deterministic testing
///
/// Returns a default outcome for every document unless a script was
/// registered for that exact document. Scripted outcomes are consumed in
/// order; the last one repeats once the script runs out.
///
/// The mock also tracks how many calls are in flight at once, which lets
/// tests assert concurrency bounds.
///
/// # Examples
///
/// ```
/// use formflow_analysis::{AnalysisError, MockAnalyzer};
/// use formflow_domain::{DocumentAnalyzer, ExtractedFields};
///
/// # tokio_test::block_on(async {
/// let analyzer = MockAnalyzer::new(ExtractedFields::new());
/// analyzer.script(
///     b"doc-2".to_vec(),
///     vec![
///         Err(AnalysisError::RateLimited { retry_after: None }),
///         Ok(ExtractedFields::new().with_field("id", "2", 1.0)),
///     ],
/// );
///
/// assert!(analyzer.analyze(b"doc-2", "m").await.is_err());
/// assert!(analyzer.analyze(b"doc-2", "m").await.is_ok());
/// assert_eq!(analyzer.calls_for(b"doc-2"), 2);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct MockAnalyzer {
    default_outcome: MockResult,
    scripts: Arc<Mutex<HashMap<Vec<u8>, VecDeque<MockResult>>>>,
    calls: Arc<Mutex<HashMap<Vec<u8>, usize>>>,
    call_count: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    latency: Duration,
}

impl MockAnalyzer {
    /// Create a mock that returns `fields` for every document
    pub fn new(fields: ExtractedFields) -> Self {
        Self::with_default(Ok(fields))
    }

    /// Create a mock that fails every unscripted call with `error`
    pub fn failing(error: AnalysisError) -> Self {
        Self::with_default(Err(error))
    }

    fn with_default(default_outcome: MockResult) -> Self {
        Self {
            default_outcome,
            scripts: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(HashMap::new())),
            call_count: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            latency: Duration::ZERO,
        }
    }

    /// Simulate service latency on every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Register the outcomes for one document
    pub fn script(&self, document: impl Into<Vec<u8>>, outcomes: Vec<MockResult>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(document.into(), outcomes.into_iter().collect());
    }

    /// Total number of analyze calls
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Number of analyze calls for one document
    pub fn calls_for(&self, document: &[u8]) -> usize {
        self.calls.lock().unwrap().get(document).copied().unwrap_or(0)
    }

    /// Highest number of calls observed in flight at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, document: &[u8]) -> MockResult {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(document.to_vec())
            .or_insert(0) += 1;

        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(document) {
            Some(queue) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| self.default_outcome.clone()),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| self.default_outcome.clone()),
            None => self.default_outcome.clone(),
        }
    }
}

impl Default for MockAnalyzer {
    fn default() -> Self {
        Self::new(ExtractedFields::new())
    }
}

/// Decrements the in-flight counter even if the call is dropped mid-way
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentAnalyzer for MockAnalyzer {
    type Error = AnalysisError;

    async fn analyze(&self, document: &[u8], _model_id: &str) -> Result<ExtractedFields, Self::Error> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.next_outcome(document)
    }
}
