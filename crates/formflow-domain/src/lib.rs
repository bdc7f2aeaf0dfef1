//! Formflow Domain Layer
//!
//! This crate contains the data model and collaborator interfaces for the
//! form extraction pipeline. It keeps external dependencies to a minimum and
//! defines the value objects and trait boundaries that the infrastructure and
//! application crates build on.
//!
//! ## Key Concepts
//!
//! - **SourceDocument**: A multi-page scanned document delivered by a trigger
//! - **Chunk**: One form, a fixed page span cut out of a source document
//! - **ExtractionRecord**: The persisted result for one chunk, keyed deterministically
//! - **FailureClass**: How a collaborator failure should be treated by retry policy
//!
//! ## Architecture
//!
//! - Pure data and planning logic only
//! - Infrastructure implementations live in other crates
//! - Trait definitions for every external interaction (analysis, artifacts, records)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod confidence;
pub mod document;
pub mod record;
pub mod traits;

// Re-exports for convenience
pub use confidence::Confidence;
pub use document::{plan_page_ranges, Chunk, PageRange, SourceDocument};
pub use record::{
    deterministic_id, source_tag, ExtractedFields, ExtractionRecord, RecordId, RecordStatus,
};
pub use traits::{
    ArtifactRef, ArtifactStore, Classify, DocumentAnalyzer, FailureClass, ReadableRef, RecordStore,
};
