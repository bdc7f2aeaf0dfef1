//! Backoff bookkeeping shared by the analysis gateway and the persisters

use rand::Rng;
use std::time::Duration;

/// Running total of time spent sleeping between attempts of one call
#[derive(Debug)]
pub(crate) struct WaitBudget {
    ceiling: Duration,
    spent: Duration,
}

impl WaitBudget {
    pub(crate) fn new(ceiling: Duration) -> Self {
        Self {
            ceiling,
            spent: Duration::ZERO,
        }
    }

    /// Reserve up to `delay` from the budget
    ///
    /// Returns the delay to sleep for, shortened to what is left, or `None`
    /// once the budget is used up.
    pub(crate) fn take(&mut self, delay: Duration) -> Option<Duration> {
        let remaining = self.ceiling.saturating_sub(self.spent);
        if remaining.is_zero() {
            return None;
        }
        let granted = delay.min(remaining);
        self.spent += granted;
        Some(granted)
    }

    pub(crate) fn spent(&self) -> Duration {
        self.spent
    }
}

/// Equal jitter: a random delay in `[delay / 2, delay]`
pub(crate) fn jitter(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    if millis < 2 {
        return delay;
    }
    let half = millis.div_ceil(2);
    let extra = rand::thread_rng().gen_range(0..=millis - half);
    Duration::from_millis(half + extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_budget_shortens_last_delay() {
        let mut budget = WaitBudget::new(Duration::from_millis(1_000));
        assert_eq!(budget.take(Duration::from_millis(600)), Some(Duration::from_millis(600)));
        assert_eq!(budget.take(Duration::from_millis(600)), Some(Duration::from_millis(400)));
        assert_eq!(budget.take(Duration::from_millis(1)), None);
        assert_eq!(budget.spent(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_zero_budget_never_waits() {
        let mut budget = WaitBudget::new(Duration::ZERO);
        assert_eq!(budget.take(Duration::from_millis(10)), None);
    }

    proptest! {
        #[test]
        fn prop_jitter_stays_within_half_and_full(millis in 0u64..100_000) {
            let delay = Duration::from_millis(millis);
            let jittered = jitter(delay);
            prop_assert!(jittered <= delay);
            prop_assert!(jittered >= delay / 2);
        }

        #[test]
        fn prop_budget_never_exceeded(
            ceiling in 0u64..10_000,
            delays in proptest::collection::vec(0u64..5_000, 0..20),
        ) {
            let mut budget = WaitBudget::new(Duration::from_millis(ceiling));
            for d in delays {
                budget.take(Duration::from_millis(d));
            }
            prop_assert!(budget.spent() <= Duration::from_millis(ceiling));
        }
    }
}
