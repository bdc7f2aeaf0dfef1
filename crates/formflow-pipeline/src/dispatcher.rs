//! Bounded-parallelism dispatch of per-chunk work

use formflow_domain::Chunk;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Work items that belong to one form of a document
pub trait FormTagged {
    /// Form number the item belongs to
    fn form_number(&self) -> u32;
}

impl FormTagged for Chunk {
    fn form_number(&self) -> u32 {
        self.form_number
    }
}

/// What became of one dispatched item
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched<T, I> {
    /// The work ran to completion and produced this output
    Finished(T),
    /// The run was cancelled before the item was admitted; the item is
    /// handed back untouched
    Abandoned(I),
}

/// Runs per-item work with at most `limit` items in flight
///
/// Every item is attempted: a failing item never stops the others, so a
/// run always drains. Results come back in completion order, each tagged
/// with its form number.
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher {
    limit: usize,
}

impl Dispatcher {
    /// Create a dispatcher admitting `limit` items at a time (at least 1)
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    /// Maximum items in flight
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run `work` over every item
    ///
    /// Items not yet admitted when `cancel` fires come back as
    /// [`Dispatched::Abandoned`]; admitted items run to completion.
    pub async fn run<I, T, F, Fut>(
        &self,
        items: Vec<I>,
        cancel: &CancellationToken,
        work: F,
    ) -> Vec<(u32, Dispatched<T, I>)>
    where
        I: FormTagged,
        F: Fn(I) -> Fut,
        Fut: Future<Output = T>,
    {
        let gate = Semaphore::new(self.limit);
        let gate = &gate;
        let work = &work;

        let mut pending: FuturesUnordered<_> = items
            .into_iter()
            .map(move |item| async move {
                let form_number = item.form_number();
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = gate.acquire() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    debug!(form_number, "Form abandoned before dispatch");
                    return (form_number, Dispatched::Abandoned(item));
                };

                debug!(form_number, "Form admitted");
                (form_number, Dispatched::Finished(work(item).await))
            })
            .collect();

        let mut results = Vec::with_capacity(pending.len());
        while let Some(result) = pending.next().await {
            results.push(result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    struct Item(u32);

    impl FormTagged for Item {
        fn form_number(&self) -> u32 {
            self.0
        }
    }

    fn items(n: u32) -> Vec<Item> {
        (1..=n).map(Item).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound_respected() {
        let in_flight = &AtomicUsize::new(0);
        let peak = &AtomicUsize::new(0);

        let results = Dispatcher::new(3)
            .run(items(10), &CancellationToken::new(), move |item| async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10 * u64::from(item.0))).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                item.0 * 10
            })
            .await;

        assert_eq!(results.len(), 10);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        for (form, outcome) in results {
            assert_eq!(outcome, Dispatched::Finished(form * 10));
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_siblings() {
        let results = Dispatcher::new(2)
            .run(items(5), &CancellationToken::new(), |item| async move {
                if item.0 % 2 == 1 {
                    Err(format!("form {} failed", item.0))
                } else {
                    Ok(item.0)
                }
            })
            .await;

        let mut forms: Vec<u32> = results.iter().map(|(f, _)| *f).collect();
        forms.sort_unstable();
        assert_eq!(forms, vec![1, 2, 3, 4, 5]);

        let failed = results
            .iter()
            .filter(|(_, r)| matches!(r, Dispatched::Finished(Err(_))))
            .count();
        assert_eq!(failed, 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_abandons_everything() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = &AtomicUsize::new(0);

        let results = Dispatcher::new(3)
            .run(items(4), &cancel, move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert_eq!(results.len(), 4);
        assert!(results
            .iter()
            .all(|(form, r)| *r == Dispatched::Abandoned(Item(*form))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_run_lets_admitted_work_finish() {
        let cancel = &CancellationToken::new();

        let results = Dispatcher::new(1)
            .run(items(4), cancel, move |item| async move {
                cancel.cancel();
                tokio::time::sleep(Duration::from_millis(100)).await;
                item.0
            })
            .await;

        let finished = results
            .iter()
            .filter(|(_, r)| matches!(r, Dispatched::Finished(_)))
            .count();
        let abandoned = results
            .iter()
            .filter(|(_, r)| matches!(r, Dispatched::Abandoned(_)))
            .count();
        assert_eq!(finished, 1);
        assert_eq!(abandoned, 3);
    }

    #[test]
    fn test_zero_limit_is_raised_to_one() {
        assert_eq!(Dispatcher::new(0).limit(), 1);
    }
}
