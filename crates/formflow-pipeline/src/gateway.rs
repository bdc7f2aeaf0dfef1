//! Analysis gateway: retry, backoff and rate-limit pacing around the
//! analysis capability

use crate::config::RetryPolicy;
use crate::error::PipelineError;
use crate::retry::{jitter, WaitBudget};
use crate::types::Attempted;
use formflow_domain::{Classify, DocumentAnalyzer, ExtractedFields, FailureClass};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Highest pressure the pacer will report
const MAX_PRESSURE: u32 = 8;

/// Shared signal of recent rate limiting
///
/// Every rate-limited attempt raises the pressure and every success lowers
/// it. Concurrent calls read it to stretch their backoff, which spreads
/// retries out while the service is pushing back. It only informs pacing;
/// nothing waits on it.
#[derive(Debug, Default)]
pub struct RateLimitPacer {
    pressure: AtomicU32,
}

impl RateLimitPacer {
    /// Create a pacer with no pressure
    pub fn new() -> Self {
        Self::default()
    }

    /// Note a rate-limit signal
    pub fn signal(&self) {
        let _ = self
            .pressure
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                Some((p + 1).min(MAX_PRESSURE))
            });
    }

    /// Note a successful call
    pub fn relieve(&self) {
        let _ = self
            .pressure
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                Some(p.saturating_sub(1))
            });
    }

    /// Current pressure, `0..=8`
    pub fn pressure(&self) -> u32 {
        self.pressure.load(Ordering::Relaxed)
    }

    /// Lengthen a delay by a quarter per unit of pressure
    pub fn stretch(&self, delay: Duration) -> Duration {
        delay + delay * self.pressure() / 4
    }
}

/// Wraps a `DocumentAnalyzer` with the retry policy
///
/// - Rate limited: exponential backoff with jitter, stretched by the pacer
///   and never shorter than the service's `retry_after` hint
/// - Other transient failures and timeouts: at most `transient_retries`
///   retries
/// - Permanent failures: returned at once
///
/// All attempts together never exceed `max_retries`, and the summed delays
/// never exceed `max_total_wait`.
pub struct AnalysisGateway<A> {
    analyzer: Arc<A>,
    policy: RetryPolicy,
    pacer: Arc<RateLimitPacer>,
}

impl<A> Clone for AnalysisGateway<A> {
    fn clone(&self) -> Self {
        Self {
            analyzer: Arc::clone(&self.analyzer),
            policy: self.policy.clone(),
            pacer: Arc::clone(&self.pacer),
        }
    }
}

impl<A: DocumentAnalyzer> AnalysisGateway<A> {
    /// Create a gateway with its own pacer
    pub fn new(analyzer: Arc<A>, policy: RetryPolicy) -> Self {
        Self {
            analyzer,
            policy,
            pacer: Arc::new(RateLimitPacer::new()),
        }
    }

    /// Share a pacer with other gateways talking to the same service
    pub fn with_pacer(mut self, pacer: Arc<RateLimitPacer>) -> Self {
        self.pacer = pacer;
        self
    }

    /// The wrapped analyzer
    pub fn analyzer(&self) -> &Arc<A> {
        &self.analyzer
    }

    /// The pacer this gateway reports to
    pub fn pacer(&self) -> &Arc<RateLimitPacer> {
        &self.pacer
    }

    /// Analyze one chunk, retrying per the policy
    pub async fn analyze(&self, document: &[u8], model_id: &str) -> Attempted<ExtractedFields> {
        let mut budget = WaitBudget::new(self.policy.max_total_wait());
        let mut attempts = 0u32;
        let mut rate_limited = 0u32;
        let mut transient_failures = 0u32;

        loop {
            attempts += 1;

            let call = self.analyzer.analyze(document, model_id);
            let (class, hint, cause) = match timeout(self.policy.call_timeout(), call).await {
                Ok(Ok(fields)) => {
                    self.pacer.relieve();
                    debug!(attempts, fields = fields.len(), "Analysis succeeded");
                    return Attempted {
                        result: Ok(fields),
                        attempts,
                        rate_limited,
                    };
                }
                Ok(Err(e)) => (e.class(), e.retry_after(), e.to_string()),
                Err(_) => (
                    FailureClass::Transient,
                    None,
                    format!(
                        "analysis call timed out after {}s",
                        self.policy.call_timeout_secs
                    ),
                ),
            };

            let may_retry = match class {
                FailureClass::RateLimited => {
                    rate_limited += 1;
                    self.pacer.signal();
                    attempts < self.policy.max_retries
                }
                FailureClass::Transient => {
                    transient_failures += 1;
                    transient_failures <= self.policy.transient_retries
                        && attempts < self.policy.max_retries
                }
                FailureClass::Permanent => false,
            };

            let delay = if may_retry {
                self.next_delay(class, attempts, hint, &mut budget)
            } else {
                None
            };

            match delay {
                Some(delay) => {
                    warn!(
                        attempt = attempts,
                        class = ?class,
                        delay_ms = delay.as_millis() as u64,
                        pressure = self.pacer.pressure(),
                        "Analysis attempt failed, retrying: {}",
                        cause
                    );
                    sleep(delay).await;
                }
                None => {
                    warn!(
                        attempts,
                        class = ?class,
                        waited_ms = budget.spent().as_millis() as u64,
                        "Analysis gave up: {}",
                        cause
                    );
                    return Attempted {
                        result: Err(PipelineError::AnalysisService {
                            attempts,
                            class,
                            cause,
                        }),
                        attempts,
                        rate_limited,
                    };
                }
            }
        }
    }

    fn next_delay(
        &self,
        class: FailureClass,
        retry: u32,
        hint: Option<Duration>,
        budget: &mut WaitBudget,
    ) -> Option<Duration> {
        let mut delay = jitter(self.policy.backoff(retry));
        if class == FailureClass::RateLimited {
            delay = self.pacer.stretch(delay);
            if let Some(hint) = hint {
                delay = delay.max(hint);
            }
        }
        budget.take(delay.min(self.policy.max_backoff()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formflow_analysis::{AnalysisError, MockAnalyzer};
    use tokio::time::Instant;

    const DOC: &[u8] = b"chunk-bytes";

    fn fields() -> ExtractedFields {
        ExtractedFields::new().with_field("name", "Ada", 0.9)
    }

    fn rate_limited() -> AnalysisError {
        AnalysisError::RateLimited { retry_after: None }
    }

    fn gateway(analyzer: &MockAnalyzer, policy: RetryPolicy) -> AnalysisGateway<MockAnalyzer> {
        AnalysisGateway::new(Arc::new(analyzer.clone()), policy)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let analyzer = MockAnalyzer::new(fields());
        let outcome = gateway(&analyzer, RetryPolicy::analysis())
            .analyze(DOC, "m")
            .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.retries(), 0);
        assert_eq!(outcome.result, Ok(fields()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_twice_then_success() {
        let analyzer = MockAnalyzer::new(ExtractedFields::new());
        analyzer.script(DOC, vec![Err(rate_limited()), Err(rate_limited()), Ok(fields())]);

        let outcome = gateway(&analyzer, RetryPolicy::analysis())
            .analyze(DOC, "m")
            .await;

        assert_eq!(outcome.result, Ok(fields()));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.rate_limited, 2);
        assert_eq!(analyzer.calls_for(DOC), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_exhaustion_stops_at_max_retries() {
        let analyzer = MockAnalyzer::failing(rate_limited());
        let outcome = gateway(&analyzer, RetryPolicy::analysis())
            .analyze(DOC, "m")
            .await;

        assert_eq!(outcome.attempts, 5);
        assert_eq!(analyzer.call_count(), 5);
        match outcome.result {
            Err(PipelineError::AnalysisService {
                attempts,
                class,
                cause,
            }) => {
                assert_eq!(attempts, 5);
                assert_eq!(class, FailureClass::RateLimited);
                assert_eq!(cause, "Rate limit exceeded");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_wait_ceiling_bounds_retrying() {
        let analyzer = MockAnalyzer::failing(rate_limited());
        let policy = RetryPolicy {
            max_retries: 50,
            transient_retries: 2,
            base_backoff_ms: 500,
            max_backoff_ms: 10_000,
            max_total_wait_ms: 3_000,
            call_timeout_secs: 5,
        };

        let started = Instant::now();
        let outcome = gateway(&analyzer, policy).analyze(DOC, "m").await;

        assert!(outcome.result.is_err());
        // allow for millisecond timer rounding per sleep
        assert!(started.elapsed() <= Duration::from_millis(3_050));
        assert!(outcome.attempts < 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_not_retried() {
        let analyzer = MockAnalyzer::failing(AnalysisError::ModelNotAvailable("x".into()));
        let outcome = gateway(&analyzer, RetryPolicy::analysis())
            .analyze(DOC, "m")
            .await;

        assert_eq!(outcome.attempts, 1);
        assert!(matches!(
            outcome.result,
            Err(PipelineError::AnalysisService {
                class: FailureClass::Permanent,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_get_shorter_retry() {
        let analyzer = MockAnalyzer::failing(AnalysisError::Unavailable("503".into()));
        let outcome = gateway(&analyzer, RetryPolicy::analysis())
            .analyze(DOC, "m")
            .await;

        // first attempt + transient_retries
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.rate_limited, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_is_transient() {
        let analyzer = MockAnalyzer::new(fields()).with_latency(Duration::from_secs(10));
        let policy = RetryPolicy {
            transient_retries: 1,
            call_timeout_secs: 1,
            ..RetryPolicy::analysis()
        };

        let outcome = gateway(&analyzer, policy).analyze(DOC, "m").await;

        assert_eq!(outcome.attempts, 2);
        match outcome.result {
            Err(PipelineError::AnalysisService { class, cause, .. }) => {
                assert_eq!(class, FailureClass::Transient);
                assert!(cause.contains("timed out"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_honoured() {
        let analyzer = MockAnalyzer::new(ExtractedFields::new());
        analyzer.script(
            DOC,
            vec![
                Err(AnalysisError::RateLimited {
                    retry_after: Some(Duration::from_secs(7)),
                }),
                Ok(fields()),
            ],
        );

        let started = Instant::now();
        let outcome = gateway(&analyzer, RetryPolicy::analysis())
            .analyze(DOC, "m")
            .await;

        assert!(outcome.result.is_ok());
        assert!(started.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_pacer_sees_rate_limiting() {
        let analyzer = MockAnalyzer::failing(rate_limited());
        let pacer = Arc::new(RateLimitPacer::new());
        let policy = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::analysis()
        };

        let gw = gateway(&analyzer, policy).with_pacer(Arc::clone(&pacer));
        gw.analyze(DOC, "m").await;

        assert_eq!(pacer.pressure(), 2);
        assert!(Arc::ptr_eq(gw.pacer(), &pacer));
    }

    #[test]
    fn test_pacer_stretch_and_saturation() {
        let pacer = RateLimitPacer::new();
        let delay = Duration::from_millis(400);
        assert_eq!(pacer.stretch(delay), delay);

        pacer.signal();
        pacer.signal();
        assert_eq!(pacer.stretch(delay), Duration::from_millis(600));

        for _ in 0..20 {
            pacer.signal();
        }
        assert_eq!(pacer.pressure(), MAX_PRESSURE);

        pacer.relieve();
        assert_eq!(pacer.pressure(), MAX_PRESSURE - 1);
        for _ in 0..20 {
            pacer.relieve();
        }
        assert_eq!(pacer.pressure(), 0);
    }
}
