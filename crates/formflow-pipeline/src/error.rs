//! Error types for the pipeline

use crate::config::ConfigError;
use formflow_domain::FailureClass;
use thiserror::Error;

/// Errors that can occur while processing a document
///
/// Only `InvalidDocument`, `InvalidRequest` and `Config` concern a whole job.
/// The remaining variants describe one chunk and end up in its outcome.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// The source document cannot be split into pages
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// The caller asked for something the document cannot satisfy
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Analysis failed for good, either permanently or after retries ran out
    #[error("Analysis failed after {attempts} attempt(s): {cause}")]
    AnalysisService {
        /// Attempts made, the first one included
        attempts: u32,
        /// Class of the last failure
        class: FailureClass,
        /// Last failure reported by the analysis capability
        cause: String,
    },

    /// The record could not be written
    #[error("Persistence failed after {attempts} attempt(s): {cause}")]
    Persistence {
        /// Attempts made, the first one included
        attempts: u32,
        /// Last failure reported by the record store
        cause: String,
    },

    /// The chunk artifact could not be stored
    #[error("Artifact storage failed after {attempts} attempt(s): {cause}")]
    Artifact {
        /// Attempts made, the first one included
        attempts: u32,
        /// Last failure reported by the artifact store
        cause: String,
    },
}

impl PipelineError {
    /// True for errors that end a job before any chunk is dispatched
    pub fn is_document_level(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidDocument(_)
                | PipelineError::InvalidRequest(_)
                | PipelineError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_cause() {
        let err = PipelineError::AnalysisService {
            attempts: 5,
            class: FailureClass::RateLimited,
            cause: "Rate limit exceeded".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Analysis failed after 5 attempt(s): Rate limit exceeded"
        );
        assert!(!err.is_document_level());
    }

    #[test]
    fn test_config_error_converts() {
        let err: PipelineError = ConfigError::Invalid("chunk_span must be greater than 0".into()).into();
        assert!(err.is_document_level());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: chunk_span must be greater than 0"
        );
    }
}
