//! Formflow Storage Layer
//!
//! Implements the `RecordStore` and `ArtifactStore` traits from
//! `formflow-domain`.
//!
//! # Architecture
//!
//! - SQLite for extraction records, one row per form, upserted by id
//! - Local filesystem for chunk artifacts, with expiring read locators
//!
//! # Examples
//!
//! ```no_run
//! use formflow_store::{LocalArtifactStore, SqliteRecordStore};
//!
//! let records = SqliteRecordStore::new("formflow.db").unwrap();
//! let artifacts = LocalArtifactStore::new("/var/lib/formflow/chunks").unwrap();
//! ```

#![warn(missing_docs)]

mod artifact;

use async_trait::async_trait;
use formflow_domain::{
    ArtifactRef, Classify, ExtractionRecord, FailureClass, PageRange, RecordId, RecordStatus,
    RecordStore,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub use artifact::LocalArtifactStore;

/// How long SQLite waits on a locked database before reporting busy
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str = "id, source_file, processed_artifact_ref, form_number, total_forms,
     page_start, page_end, fields, confidence, status, error, model_id, processed_at";

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Field map (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record failed its invariant checks and was not written
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Invalid data format
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Artifact does not exist
    #[error("Artifact not found: {0}")]
    NotFound(String),

    /// Connection lock was poisoned by a panicking writer
    #[error("Store lock poisoned: {0}")]
    Poisoned(String),

    /// Background task failed
    #[error("Task error: {0}")]
    Task(String),
}

impl Classify for StoreError {
    fn class(&self) -> FailureClass {
        match self {
            StoreError::Database(e) => match e.sqlite_error_code() {
                Some(rusqlite::ErrorCode::DatabaseBusy)
                | Some(rusqlite::ErrorCode::DatabaseLocked) => FailureClass::Transient,
                _ => FailureClass::Permanent,
            },
            StoreError::Io(_) | StoreError::Task(_) => FailureClass::Transient,
            StoreError::Serialization(_)
            | StoreError::InvalidRecord(_)
            | StoreError::InvalidData(_)
            | StoreError::NotFound(_)
            | StoreError::Poisoned(_) => FailureClass::Permanent,
        }
    }
}

/// SQLite-based implementation of RecordStore
///
/// The connection sits behind a mutex and every call runs on tokio's
/// blocking pool, so one store can be shared by all workers of a job.
///
/// # Examples
///
/// ```no_run
/// use formflow_store::SqliteRecordStore;
///
/// let store = SqliteRecordStore::new(":memory:").unwrap();
/// ```
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Create a new SqliteRecordStore with the given database path
    ///
    /// Use `:memory:` for an in-memory database (useful for testing).
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    fn write_record(conn: &Connection, record: &ExtractionRecord) -> Result<(), StoreError> {
        let fields = serde_json::to_string(&record.fields)?;
        let confidence = serde_json::to_string(&record.confidence)?;

        // Single statement: the row is replaced as a whole or not at all.
        conn.execute(
            "INSERT INTO extraction_records (id, source_file, processed_artifact_ref, form_number,
                 total_forms, page_start, page_end, fields, confidence, status, error, model_id,
                 processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                 source_file = excluded.source_file,
                 processed_artifact_ref = excluded.processed_artifact_ref,
                 form_number = excluded.form_number,
                 total_forms = excluded.total_forms,
                 page_start = excluded.page_start,
                 page_end = excluded.page_end,
                 fields = excluded.fields,
                 confidence = excluded.confidence,
                 status = excluded.status,
                 error = excluded.error,
                 model_id = excluded.model_id,
                 processed_at = excluded.processed_at",
            params![
                record.id.to_string(),
                &record.source_file,
                record.processed_artifact_ref.as_str(),
                record.form_number,
                record.total_forms,
                record.page_range.start,
                record.page_range.end,
                fields,
                confidence,
                record.status.as_str(),
                &record.error,
                &record.model_id,
                &record.processed_at,
            ],
        )?;
        Ok(())
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExtractionRecord> {
        fn conversion<E>(idx: usize, ty: rusqlite::types::Type, e: E) -> rusqlite::Error
        where
            E: std::error::Error + Send + Sync + 'static,
        {
            rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(e))
        }

        let id_str: String = row.get(0)?;
        let id = RecordId::from_string(&id_str).map_err(|e| {
            conversion(0, rusqlite::types::Type::Text, StoreError::InvalidData(e))
        })?;

        let fields_json: String = row.get(7)?;
        let fields = serde_json::from_str(&fields_json)
            .map_err(|e| conversion(7, rusqlite::types::Type::Text, e))?;

        let confidence_json: String = row.get(8)?;
        let confidence = serde_json::from_str(&confidence_json)
            .map_err(|e| conversion(8, rusqlite::types::Type::Text, e))?;

        let status_str: String = row.get(9)?;
        let status = RecordStatus::parse(&status_str).ok_or_else(|| {
            conversion(
                9,
                rusqlite::types::Type::Text,
                StoreError::InvalidData(format!("Unknown status: {}", status_str)),
            )
        })?;

        let artifact: String = row.get(2)?;

        Ok(ExtractionRecord {
            id,
            source_file: row.get(1)?,
            processed_artifact_ref: ArtifactRef::new(artifact),
            form_number: row.get(3)?,
            total_forms: row.get(4)?,
            page_range: PageRange {
                start: row.get(5)?,
                end: row.get(6)?,
            },
            fields,
            confidence,
            status,
            error: row.get(10)?,
            model_id: row.get(11)?,
            processed_at: row.get(12)?,
        })
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    type Error = StoreError;

    async fn upsert(&self, record: &ExtractionRecord) -> Result<(), Self::Error> {
        record.validate().map_err(StoreError::InvalidRecord)?;

        debug!(
            id = %record.id,
            source_file = %record.source_file,
            form_number = record.form_number,
            status = record.status.as_str(),
            "Upserting extraction record"
        );

        let record = record.clone();
        self.with_conn(move |conn| Self::write_record(conn, &record))
            .await
    }

    async fn get(
        &self,
        source_file: &str,
        id: &RecordId,
    ) -> Result<Option<ExtractionRecord>, Self::Error> {
        let source_file = source_file.to_string();
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM extraction_records WHERE source_file = ?1 AND id = ?2",
                SELECT_COLUMNS
            );
            let record = conn
                .query_row(&sql, params![source_file, id], Self::row_to_record)
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn list_for_source(
        &self,
        source_file: &str,
    ) -> Result<Vec<ExtractionRecord>, Self::Error> {
        let source_file = source_file.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM extraction_records WHERE source_file = ?1 ORDER BY form_number",
                SELECT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(params![source_file], Self::row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }
}
