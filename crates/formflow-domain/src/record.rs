//! Extraction records - the persisted result for one form

use crate::confidence::Confidence;
use crate::document::{Chunk, PageRange};
use crate::traits::ArtifactRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Namespace for record identifiers
///
/// Changing this value changes every record id and breaks idempotency
/// against previously written records.
const RECORD_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2d4e_8a3b_4c5d_9e7f_0a1b_2c3d_4e5f);

/// Stable identifier of an extraction record
///
/// Derived from the source id and form number only, so every retry of the
/// same form lands on the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Parse a RecordId from its string form
    ///
    /// # Examples
    ///
    /// ```
    /// use formflow_domain::{deterministic_id, RecordId};
    ///
    /// let id = deterministic_id("batch.pdf", 1);
    /// let parsed = RecordId::from_string(&id.to_string()).unwrap();
    /// assert_eq!(id, parsed);
    /// ```
    pub fn from_string(s: &str) -> Result<Self, String> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| format!("Invalid record id: {}", e))
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derive the record id for a form of a source document
///
/// Pure function of its inputs: no counters, no clock, no randomness.
///
/// # Examples
///
/// ```
/// use formflow_domain::deterministic_id;
///
/// assert_eq!(deterministic_id("a.pdf", 2), deterministic_id("a.pdf", 2));
/// assert_ne!(deterministic_id("a.pdf", 2), deterministic_id("a.pdf", 3));
/// ```
pub fn deterministic_id(source_id: &str, form_number: u32) -> RecordId {
    let name = format!("{}#form-{}", source_id, form_number);
    RecordId(Uuid::new_v5(&RECORD_NAMESPACE, name.as_bytes()))
}

/// Short, stable tag distinguishing sources that share a file name
///
/// ```
/// use formflow_domain::source_tag;
///
/// assert_eq!(source_tag("a/claims.pdf"), source_tag("a/claims.pdf"));
/// assert_ne!(source_tag("a/claims.pdf"), source_tag("b/claims.pdf"));
/// assert_eq!(source_tag("a/claims.pdf").len(), 12);
/// ```
pub fn source_tag(source_id: &str) -> String {
    let digest = Uuid::new_v5(&RECORD_NAMESPACE, source_id.as_bytes());
    let mut tag = digest.simple().to_string();
    tag.truncate(12);
    tag
}

/// Terminal status of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Fields were extracted
    Completed,
    /// Analysis failed; `error` holds the cause
    Failed,
}

impl RecordStatus {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Completed => "completed",
            RecordStatus::Failed => "failed",
        }
    }

    /// Parse the storage representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(RecordStatus::Completed),
            "failed" => Some(RecordStatus::Failed),
            _ => None,
        }
    }
}

/// Fields extracted from one chunk by the analysis capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFields {
    /// Field name to extracted value
    pub fields: BTreeMap<String, String>,

    /// Field name to confidence score
    pub confidence: BTreeMap<String, Confidence>,
}

impl ExtractedFields {
    /// Create an empty set of fields
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field with its confidence (clamped into [0, 1])
    pub fn with_field(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        confidence: f64,
    ) -> Self {
        self.insert(name, value, confidence);
        self
    }

    /// Insert or replace a field
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>, confidence: f64) {
        let name = name.into();
        self.confidence
            .insert(name.clone(), Confidence::clamped(confidence));
        self.fields.insert(name, value.into());
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when no fields were extracted
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One persisted result per chunk
///
/// Construct through [`ExtractionRecord::completed`] or
/// [`ExtractionRecord::failed`] so that `status` and `error` stay consistent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionRecord {
    /// Deterministic id (source id + form number)
    pub id: RecordId,

    /// Partition key: the source document id
    pub source_file: String,

    /// Reference to the stored chunk artifact
    pub processed_artifact_ref: ArtifactRef,

    /// Form number within the source (1-indexed)
    pub form_number: u32,

    /// Total forms in the source
    pub total_forms: u32,

    /// Pages of the source this form covers
    pub page_range: PageRange,

    /// Extracted field values
    pub fields: BTreeMap<String, String>,

    /// Per-field confidence
    pub confidence: BTreeMap<String, Confidence>,

    /// Completed or failed
    pub status: RecordStatus,

    /// Failure cause, present iff `status` is failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Analysis model used for this attempt
    pub model_id: String,

    /// RFC 3339 timestamp of the attempt
    pub processed_at: String,
}

impl ExtractionRecord {
    /// Record for a chunk whose analysis succeeded
    pub fn completed(
        chunk: &Chunk,
        artifact: ArtifactRef,
        model_id: impl Into<String>,
        extracted: ExtractedFields,
        processed_at: impl Into<String>,
    ) -> Self {
        Self {
            id: deterministic_id(&chunk.source_id, chunk.form_number),
            source_file: chunk.source_id.clone(),
            processed_artifact_ref: artifact,
            form_number: chunk.form_number,
            total_forms: chunk.total_forms,
            page_range: chunk.page_range,
            fields: extracted.fields,
            confidence: extracted.confidence,
            status: RecordStatus::Completed,
            error: None,
            model_id: model_id.into(),
            processed_at: processed_at.into(),
        }
    }

    /// Record for a chunk whose analysis failed
    pub fn failed(
        chunk: &Chunk,
        artifact: ArtifactRef,
        model_id: impl Into<String>,
        error: impl Into<String>,
        processed_at: impl Into<String>,
    ) -> Self {
        Self {
            id: deterministic_id(&chunk.source_id, chunk.form_number),
            source_file: chunk.source_id.clone(),
            processed_artifact_ref: artifact,
            form_number: chunk.form_number,
            total_forms: chunk.total_forms,
            page_range: chunk.page_range,
            fields: BTreeMap::new(),
            confidence: BTreeMap::new(),
            status: RecordStatus::Failed,
            error: Some(error.into()),
            model_id: model_id.into(),
            processed_at: processed_at.into(),
        }
    }

    /// Check the record's internal invariants before it is written
    pub fn validate(&self) -> Result<(), String> {
        if self.id != deterministic_id(&self.source_file, self.form_number) {
            return Err(format!(
                "record id {} does not match {}#form-{}",
                self.id, self.source_file, self.form_number
            ));
        }
        if self.form_number == 0 || self.form_number > self.total_forms {
            return Err(format!(
                "form_number {} out of range 1..={}",
                self.form_number, self.total_forms
            ));
        }
        match (self.status, &self.error) {
            (RecordStatus::Completed, Some(_)) => {
                return Err("completed record carries an error".to_string());
            }
            (RecordStatus::Failed, None) => {
                return Err("failed record is missing its error".to_string());
            }
            _ => {}
        }
        if self.fields.keys().ne(self.confidence.keys()) {
            return Err("fields and confidence keys differ".to_string());
        }
        Ok(())
    }
}
