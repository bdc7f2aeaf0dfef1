//! Trait definitions for external interactions
//!
//! These traits define the boundaries between the pipeline and its
//! collaborators. Infrastructure implementations live in other crates.

use crate::record::{ExtractedFields, ExtractionRecord, RecordId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

/// How a collaborator failure should be handled by retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// The callee asked us to slow down
    RateLimited,
    /// Timeout, network fault or similar; worth a short retry
    Transient,
    /// Retrying cannot help (malformed input, unsupported model, bad data)
    Permanent,
}

/// Classification of collaborator errors
///
/// Retry decisions are made from this, never from error message text.
pub trait Classify {
    /// Failure class of this error
    fn class(&self) -> FailureClass;

    /// Delay the callee asked for before the next attempt, if any
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Reference to a stored chunk artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    /// Wrap a store-specific reference
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Borrow the reference string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Time-limited locator for reading an artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadableRef {
    /// Locator (URL or path with access token)
    pub locator: String,
    /// When the locator stops working
    pub expires_at: SystemTime,
}

impl ReadableRef {
    /// True once the locator has expired
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }
}

/// Trait for the document-analysis capability
///
/// Implemented by the infrastructure layer (formflow-analysis). A call
/// suspends until the analysis has finished or failed; any submit/poll
/// protocol of the underlying service stays inside the implementation.
#[async_trait]
pub trait DocumentAnalyzer: Send + Sync {
    /// Error type for analysis calls
    type Error: Classify + fmt::Display + Send + Sync + 'static;

    /// Extract fields from a chunk document using the given model
    async fn analyze(&self, document: &[u8], model_id: &str)
        -> Result<ExtractedFields, Self::Error>;
}

/// Trait for persisting chunk artifacts
///
/// Implemented by the infrastructure layer (formflow-store)
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Error type for artifact operations
    type Error: Classify + fmt::Display + Send + Sync + 'static;

    /// Store chunk bytes, returning a reference to them
    ///
    /// Storing the same name twice overwrites the previous artifact.
    async fn store(&self, bytes: &[u8], suggested_name: &str) -> Result<ArtifactRef, Self::Error>;

    /// Obtain a time-limited readable locator for an artifact
    async fn readable_ref(
        &self,
        artifact: &ArtifactRef,
        ttl: Duration,
    ) -> Result<ReadableRef, Self::Error>;
}

/// Trait for the durable record store
///
/// Implemented by the infrastructure layer (formflow-store). Records are
/// partitioned by `source_file`; every read names the partition.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Error type for store operations
    type Error: Classify + fmt::Display + Send + Sync + 'static;

    /// Insert or replace the record with `record.id`
    ///
    /// Must be atomic: the record is either fully written or untouched.
    async fn upsert(&self, record: &ExtractionRecord) -> Result<(), Self::Error>;

    /// Get a record by id within a partition
    async fn get(
        &self,
        source_file: &str,
        id: &RecordId,
    ) -> Result<Option<ExtractionRecord>, Self::Error>;

    /// All records of a partition, ordered by form number
    async fn list_for_source(&self, source_file: &str)
        -> Result<Vec<ExtractionRecord>, Self::Error>;
}
