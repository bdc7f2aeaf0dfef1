//! In-memory collaborators with failure injection for unit tests

use async_trait::async_trait;
use formflow_domain::{
    deterministic_id, ArtifactRef, ArtifactStore, Chunk, Classify, ExtractedFields,
    ExtractionRecord, FailureClass, PageRange, ReadableRef, RecordId, RecordStatus, RecordStore,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TestStoreError {
    Busy,
    Rejected,
}

impl fmt::Display for TestStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStoreError::Busy => f.write_str("database is locked"),
            TestStoreError::Rejected => f.write_str("constraint violated"),
        }
    }
}

impl Classify for TestStoreError {
    fn class(&self) -> FailureClass {
        match self {
            TestStoreError::Busy => FailureClass::Transient,
            TestStoreError::Rejected => FailureClass::Permanent,
        }
    }
}

/// Record store that can be told to fail its next N writes
#[derive(Default)]
pub(crate) struct FlakyRecordStore {
    records: Mutex<HashMap<(String, RecordId), ExtractionRecord>>,
    failures: Mutex<Vec<TestStoreError>>,
    failing_forms: Mutex<HashMap<u32, TestStoreError>>,
    upserts: AtomicUsize,
    latency: Duration,
}

impl FlakyRecordStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `n` upserts with `error`
    pub(crate) fn fail_next(&self, n: usize, error: TestStoreError) {
        self.failures.lock().unwrap().extend(std::iter::repeat(error).take(n));
    }

    /// Fail every upsert of one form number
    pub(crate) fn fail_form(&self, form_number: u32, error: TestStoreError) {
        self.failing_forms.lock().unwrap().insert(form_number, error);
    }

    pub(crate) fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub(crate) fn records_for(&self, source_file: &str) -> Vec<ExtractionRecord> {
        let mut records: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.source_file == source_file)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.form_number);
        records
    }
}

#[async_trait]
impl RecordStore for FlakyRecordStore {
    type Error = TestStoreError;

    async fn upsert(&self, record: &ExtractionRecord) -> Result<(), Self::Error> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(error) = self.failing_forms.lock().unwrap().get(&record.form_number) {
            return Err(*error);
        }
        if let Some(error) = self.failures.lock().unwrap().pop() {
            return Err(error);
        }
        self.records
            .lock()
            .unwrap()
            .insert((record.source_file.clone(), record.id), record.clone());
        Ok(())
    }

    async fn get(
        &self,
        source_file: &str,
        id: &RecordId,
    ) -> Result<Option<ExtractionRecord>, Self::Error> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&(source_file.to_string(), *id))
            .cloned())
    }

    async fn list_for_source(
        &self,
        source_file: &str,
    ) -> Result<Vec<ExtractionRecord>, Self::Error> {
        Ok(self.records_for(source_file))
    }
}

/// Artifact store keeping bytes in memory
#[derive(Default)]
pub(crate) struct MemoryArtifactStore {
    artifacts: Mutex<BTreeMap<String, Vec<u8>>>,
    failures: Mutex<Vec<TestStoreError>>,
}

impl MemoryArtifactStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` stores with `error`
    pub(crate) fn fail_next(&self, n: usize, error: TestStoreError) {
        self.failures.lock().unwrap().extend(std::iter::repeat(error).take(n));
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.artifacts.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    type Error = TestStoreError;

    async fn store(&self, bytes: &[u8], suggested_name: &str) -> Result<ArtifactRef, Self::Error> {
        if let Some(error) = self.failures.lock().unwrap().pop() {
            return Err(error);
        }
        self.artifacts
            .lock()
            .unwrap()
            .insert(suggested_name.to_string(), bytes.to_vec());
        Ok(ArtifactRef::new(format!("mem/{}", suggested_name)))
    }

    async fn readable_ref(
        &self,
        artifact: &ArtifactRef,
        ttl: Duration,
    ) -> Result<ReadableRef, Self::Error> {
        Ok(ReadableRef {
            locator: format!("memory://{}", artifact),
            expires_at: SystemTime::now() + ttl,
        })
    }
}

/// A valid record for `form_number` of a three-form source
pub(crate) fn record_for(source_id: &str, form_number: u32, status: RecordStatus) -> ExtractionRecord {
    let chunk = Chunk {
        source_id: source_id.to_string(),
        form_number,
        total_forms: 3,
        page_range: PageRange::new(form_number * 2 - 1, form_number * 2),
        bytes: vec![],
    };
    let artifact = ArtifactRef::new(chunk.suggested_name());
    let record = match status {
        RecordStatus::Completed => ExtractionRecord::completed(
            &chunk,
            artifact,
            "prebuilt-layout",
            ExtractedFields::new().with_field("name", "Ada", 0.9),
            "2024-05-01T00:00:00Z",
        ),
        RecordStatus::Failed => {
            ExtractionRecord::failed(&chunk, artifact, "prebuilt-layout", "boom", "2024-05-01T00:00:00Z")
        }
    };
    debug_assert_eq!(record.id, deterministic_id(source_id, form_number));
    record
}
