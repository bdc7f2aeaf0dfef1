//! Idempotent record persistence with bounded retry

use crate::config::RetryPolicy;
use crate::error::PipelineError;
use crate::retry::{jitter, WaitBudget};
use crate::types::Attempted;
use formflow_domain::{Classify, ExtractionRecord, FailureClass, RecordStore};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Run a store call, retrying transient failures per `policy`
///
/// Returns the final result (errors rendered to text) and the number of
/// attempts made.
pub(crate) async fn retry_store_call<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
) -> (Result<T, String>, u32)
where
    E: Classify + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut budget = WaitBudget::new(policy.max_total_wait());
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        let (class, cause) = match timeout(policy.call_timeout(), call()).await {
            Ok(Ok(value)) => return (Ok(value), attempts),
            Ok(Err(e)) => (e.class(), e.to_string()),
            Err(_) => (
                FailureClass::Transient,
                format!("{} timed out after {}s", operation, policy.call_timeout_secs),
            ),
        };

        let delay = match class {
            FailureClass::Permanent => None,
            _ if attempts >= policy.max_retries => None,
            _ => budget.take(jitter(policy.backoff(attempts))),
        };

        match delay {
            Some(delay) => {
                warn!(
                    operation,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Store call failed, retrying: {}",
                    cause
                );
                sleep(delay).await;
            }
            None => return (Err(cause), attempts),
        }
    }
}

/// Writes one record per chunk, keyed by the record's deterministic id
///
/// Writing the same record twice leaves exactly one record behind. The
/// store is expected to write each record atomically; the persister only
/// adds retry and the per-call timeout.
pub struct RecordPersister<R> {
    store: Arc<R>,
    policy: RetryPolicy,
}

impl<R> Clone for RecordPersister<R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: self.policy.clone(),
        }
    }
}

impl<R: RecordStore> RecordPersister<R> {
    /// Create a persister over `store`
    pub fn new(store: Arc<R>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// The underlying record store
    pub fn store(&self) -> &Arc<R> {
        &self.store
    }

    /// Insert or replace `record`
    pub async fn upsert(&self, record: &ExtractionRecord) -> Attempted<()> {
        let (result, attempts) = retry_store_call(&self.policy, "record upsert", move || {
            self.store.upsert(record)
        })
        .await;

        match &result {
            Ok(()) => debug!(
                id = %record.id,
                form_number = record.form_number,
                attempts,
                "Record persisted"
            ),
            Err(cause) => warn!(
                id = %record.id,
                form_number = record.form_number,
                attempts,
                "Record not persisted: {}",
                cause
            ),
        }

        Attempted {
            result: result.map_err(|cause| PipelineError::Persistence { attempts, cause }),
            attempts,
            rate_limited: 0,
        }
    }
}
